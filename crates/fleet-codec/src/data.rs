//! Data codec (`0x08`): telemetry record payloads.
//!
//! Payload layout after the codec id byte:
//!
//! ```text
//! record count (u8)
//! records x count:
//!   timestamp ms since epoch, device-local (u64)
//!   priority (u8)                 0 = periodic, 1 = event, 2 = alarm
//!   longitude (i32, degrees x 1e7)
//!   latitude  (i32, degrees x 1e7)
//!   altitude  (i16, metres)
//!   heading   (u16, degrees)
//!   satellites (u8)
//!   speed     (u16, km/h)
//!   event channel (u8)            I/O channel that triggered the record
//!   I/O element groups, one per width (1, 2, 4, 8 bytes):
//!     count (u8), then count x { channel (u8), value (uN) }
//! record count trailer (u8)       must match the leading count
//! ```
//!
//! Each record carries a fingerprint: the CRC-16 of its raw byte span in
//! hex. Downstream deduplication keys on identity + timestamp + fingerprint.

use crate::crc16;
use std::collections::BTreeMap;
use thiserror::Error;

/// Sparse I/O map: channel id to raw integer value.
pub type RawIoMap = BTreeMap<u8, u64>;

/// I/O channel carrying the ignition state (non-zero = on).
pub const CHANNEL_IGNITION: u8 = 239;
/// I/O channel carrying the odometer value in metres.
pub const CHANNEL_ODOMETER: u8 = 16;
/// I/O channel carrying the cellular network technology.
pub const CHANNEL_NETWORK: u8 = 237;

#[derive(Debug, Error)]
pub enum DataCodecError {
    #[error("payload truncated at offset {0}")]
    Truncated(usize),
    #[error("record count mismatch: header {header}, trailer {trailer}")]
    CountMismatch { header: u8, trailer: u8 },
    #[error("trailing {0} bytes after final record")]
    TrailingBytes(usize),
}

/// One record parsed from a data frame, before timestamp normalisation
/// and fix filtering (both applied by the consumer of this type).
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub timestamp_ms: u64,
    pub priority: u8,
    /// Degrees; converted from the fixed-point wire value.
    pub longitude: f64,
    pub latitude: f64,
    pub altitude: i16,
    pub heading: u16,
    pub satellites: u8,
    pub speed: u16,
    pub event_channel: u8,
    pub io: RawIoMap,
    /// Hex CRC-16 of this record's raw byte span.
    pub fingerprint: String,
}

impl RawRecord {
    pub fn ignition(&self) -> bool {
        self.io.get(&CHANNEL_IGNITION).copied().unwrap_or(0) != 0
    }

    pub fn odometer_m(&self) -> Option<u64> {
        self.io.get(&CHANNEL_ODOMETER).copied()
    }

    pub fn network_code(&self) -> Option<u64> {
        self.io.get(&CHANNEL_NETWORK).copied()
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Cursor { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DataCodecError> {
        if self.pos + n > self.bytes.len() {
            return Err(DataCodecError::Truncated(self.pos));
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DataCodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DataCodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn i16(&mut self) -> Result<i16, DataCodecError> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DataCodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, DataCodecError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, DataCodecError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

/// Parse a data codec payload (the bytes after the codec id) into records.
pub fn parse_data_payload(payload: &[u8]) -> Result<Vec<RawRecord>, DataCodecError> {
    let mut cur = Cursor::new(payload);
    let count = cur.u8()?;
    let mut records = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let start = cur.pos;
        let timestamp_ms = cur.u64()?;
        let priority = cur.u8()?;
        let longitude = f64::from(cur.i32()?) / 1e7;
        let latitude = f64::from(cur.i32()?) / 1e7;
        let altitude = cur.i16()?;
        let heading = cur.u16()?;
        let satellites = cur.u8()?;
        let speed = cur.u16()?;
        let event_channel = cur.u8()?;

        let mut io = RawIoMap::new();
        for width in [1usize, 2, 4, 8] {
            let n = cur.u8()?;
            for _ in 0..n {
                let channel = cur.u8()?;
                let value = match width {
                    1 => u64::from(cur.u8()?),
                    2 => u64::from(cur.u16()?),
                    4 => u64::from(cur.u32()?),
                    _ => cur.u64()?,
                };
                io.insert(channel, value);
            }
        }

        let span = &payload[start..cur.pos];
        records.push(RawRecord {
            timestamp_ms,
            priority,
            longitude,
            latitude,
            altitude,
            heading,
            satellites,
            speed,
            event_channel,
            io,
            fingerprint: format!("{:04x}", crc16::checksum(span)),
        });
    }

    let trailer = cur.u8()?;
    if trailer != count {
        return Err(DataCodecError::CountMismatch {
            header: count,
            trailer,
        });
    }
    if cur.pos != payload.len() {
        return Err(DataCodecError::TrailingBytes(payload.len() - cur.pos));
    }
    Ok(records)
}

/// Encode records back into a data codec payload. Inverse of
/// [`parse_data_payload`]; production code never builds data frames, so this
/// lives here only for the test kit and round-trip tests.
#[cfg(any(test, feature = "test-support"))]
pub fn encode_data_payload(records: &[RawRecord]) -> Vec<u8> {
    let mut out = vec![records.len() as u8];
    for r in records {
        out.extend_from_slice(&r.timestamp_ms.to_be_bytes());
        out.push(r.priority);
        out.extend_from_slice(&(((r.longitude * 1e7).round()) as i32).to_be_bytes());
        out.extend_from_slice(&(((r.latitude * 1e7).round()) as i32).to_be_bytes());
        out.extend_from_slice(&r.altitude.to_be_bytes());
        out.extend_from_slice(&r.heading.to_be_bytes());
        out.push(r.satellites);
        out.extend_from_slice(&r.speed.to_be_bytes());
        out.push(r.event_channel);

        for width in [1usize, 2, 4, 8] {
            let group: Vec<(&u8, &u64)> = r
                .io
                .iter()
                .filter(|(_, v)| io_width(**v) == width)
                .collect();
            out.push(group.len() as u8);
            for (channel, value) in group {
                out.push(*channel);
                match width {
                    1 => out.push(*value as u8),
                    2 => out.extend_from_slice(&(*value as u16).to_be_bytes()),
                    4 => out.extend_from_slice(&(*value as u32).to_be_bytes()),
                    _ => out.extend_from_slice(&value.to_be_bytes()),
                }
            }
        }
    }
    out.push(records.len() as u8);
    out
}

#[cfg(any(test, feature = "test-support"))]
fn io_width(value: u64) -> usize {
    if value <= u64::from(u8::MAX) {
        1
    } else if value <= u64::from(u16::MAX) {
        2
    } else if value <= u64::from(u32::MAX) {
        4
    } else {
        8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> RawRecord {
        let mut io = RawIoMap::new();
        io.insert(CHANNEL_IGNITION, 1);
        io.insert(CHANNEL_NETWORK, 3);
        io.insert(CHANNEL_ODOMETER, 1_250_000);
        RawRecord {
            timestamp_ms: 1_704_067_200_000, // 2024-01-01T00:00:00Z
            priority: 0,
            longitude: 77.5946,
            latitude: 12.9716,
            altitude: 920,
            heading: 270,
            satellites: 11,
            speed: 60,
            event_channel: 0,
            io,
            fingerprint: String::new(),
        }
    }

    #[test]
    fn roundtrip_single_record() {
        let record = sample_record();
        let payload = encode_data_payload(std::slice::from_ref(&record));
        let parsed = parse_data_payload(&payload).unwrap();
        assert_eq!(parsed.len(), 1);
        let got = &parsed[0];
        assert_eq!(got.timestamp_ms, record.timestamp_ms);
        assert!((got.latitude - record.latitude).abs() < 1e-6);
        assert!((got.longitude - record.longitude).abs() < 1e-6);
        assert_eq!(got.speed, 60);
        assert!(got.ignition());
        assert_eq!(got.odometer_m(), Some(1_250_000));
        assert_eq!(got.network_code(), Some(3));
        assert_eq!(got.fingerprint.len(), 4);
    }

    #[test]
    fn count_mismatch_rejected() {
        let record = sample_record();
        let mut payload = encode_data_payload(std::slice::from_ref(&record));
        let last = payload.len() - 1;
        payload[last] = 7;
        assert!(matches!(
            parse_data_payload(&payload),
            Err(DataCodecError::CountMismatch { .. })
        ));
    }

    #[test]
    fn truncated_payload_rejected() {
        let record = sample_record();
        let payload = encode_data_payload(std::slice::from_ref(&record));
        assert!(matches!(
            parse_data_payload(&payload[..payload.len() / 2]),
            Err(DataCodecError::Truncated(_))
        ));
    }

    #[test]
    fn identical_records_share_fingerprint() {
        let record = sample_record();
        let payload = encode_data_payload(&[record.clone(), record]);
        let parsed = parse_data_payload(&payload).unwrap();
        assert_eq!(parsed[0].fingerprint, parsed[1].fingerprint);
    }
}
