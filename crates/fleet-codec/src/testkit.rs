//! Frame builders for tests and device emulation.
//!
//! Everything here produces bytes exactly as a real device would put them
//! on the wire. Compiled only under the `test-support` feature.

use crate::data::{encode_data_payload, RawRecord};
use crate::frame::wrap_frame;
use crate::CODEC_DATA;

pub use crate::command::encode_response;

/// Handshake frame: 2-byte big-endian length prefix + identity bytes.
pub fn handshake(identity: &str) -> Vec<u8> {
    let mut out = (identity.len() as u16).to_be_bytes().to_vec();
    out.extend_from_slice(identity.as_bytes());
    out
}

/// A complete framed data packet carrying the given records.
pub fn data_frame(records: &[RawRecord]) -> Vec<u8> {
    let mut body = vec![CODEC_DATA];
    body.extend_from_slice(&encode_data_payload(records));
    wrap_frame(&body)
}

/// A keep-alive frame: preamble + zero length, nothing else.
pub fn keep_alive() -> Vec<u8> {
    vec![0, 0, 0, 0, 0, 0, 0, 0]
}

/// A minimal record builder for tests that only care about a few fields.
pub fn record(timestamp_ms: u64, latitude: f64, longitude: f64, speed: u16) -> RawRecord {
    RawRecord {
        timestamp_ms,
        priority: 0,
        longitude,
        latitude,
        altitude: 0,
        heading: 0,
        satellites: 8,
        speed,
        event_channel: 0,
        io: crate::data::RawIoMap::new(),
        fingerprint: String::new(),
    }
}
