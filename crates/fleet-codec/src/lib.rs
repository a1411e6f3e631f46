//! Wire protocol for GPS tracker devices.
//!
//! The protocol is frame-per-message over a long-lived TCP connection:
//! a handshake frame carrying the device identity, then framed payloads
//! discriminated by a codec id byte. Two codecs are supported: the data
//! codec (`0x08`, telemetry records) and the command codec (`0x0C`,
//! downlink commands and their text responses).
//!
//! Frame layout (everything big-endian):
//!
//! ```text
//! +----------+-----------+----------+---------------+---------+
//! | preamble | data size | codec id |    payload    |  CRC-16 |
//! | 4 x 0x00 |  4 bytes  |  1 byte  | size-1 bytes  | 4 bytes |
//! +----------+-----------+----------+---------------+---------+
//! ```
//!
//! The CRC is CRC-16/IBM over the codec-id-to-payload-end region, carried
//! in the low 16 bits of the 4-byte trailer. A declared data size of zero
//! is a keep-alive: no codec id, no CRC, no record emitted.

pub mod command;
pub mod crc16;
pub mod data;
pub mod frame;

#[cfg(feature = "test-support")]
pub mod testkit;

pub use command::{decode_command_payload, encode_command, CommandCodecError, CommandResponse};
pub use data::{parse_data_payload, DataCodecError, RawIoMap, RawRecord};
pub use frame::{Frame, FrameError, FrameReader, MAX_FRAME_LEN};

/// Codec id for telemetry data frames.
pub const CODEC_DATA: u8 = 0x08;
/// Codec id for command frames (both directions).
pub const CODEC_COMMAND: u8 = 0x0C;
