//! Command codec (`0x0C`): downlink commands and device responses.
//!
//! Payload layout after the codec id byte, both directions:
//!
//! ```text
//! command quantity (u8, always 0x01)
//! type (u8)            0x05 = command to device, 0x06 = response from device
//! size (u32)           length of the text that follows
//! text (ASCII bytes)
//! command quantity (u8, always 0x01)
//! ```
//!
//! The encoder wraps this in the standard outer framing; the CRC trailer is
//! the 16-bit checksum zero-padded to 4 bytes.

use crate::frame::wrap_frame;
use crate::CODEC_COMMAND;
use thiserror::Error;

const TYPE_COMMAND: u8 = 0x05;
const TYPE_RESPONSE: u8 = 0x06;
const COMMAND_QUANTITY: u8 = 0x01;

#[derive(Debug, Error)]
pub enum CommandCodecError {
    #[error("command payload truncated")]
    Truncated,
    #[error("unknown command type {0:#04x}")]
    UnknownType(u8),
    #[error("quantity byte {0:#04x}, expected 0x01")]
    BadQuantity(u8),
    #[error("declared text size {declared} but {available} bytes available")]
    SizeMismatch { declared: usize, available: usize },
    #[error("command text is not valid UTF-8")]
    Encoding,
}

/// A decoded command-codec payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    /// True for type `0x06` (device response); false for an echoed command.
    pub is_response: bool,
    pub text: String,
}

/// Encode a command as a complete framed packet ready for the socket.
pub fn encode_command(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut body = Vec::with_capacity(bytes.len() + 8);
    body.push(CODEC_COMMAND);
    body.push(COMMAND_QUANTITY);
    body.push(TYPE_COMMAND);
    body.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    body.extend_from_slice(bytes);
    body.push(COMMAND_QUANTITY);
    wrap_frame(&body)
}

/// Decode a command-codec payload (the bytes after the codec id).
pub fn decode_command_payload(payload: &[u8]) -> Result<CommandResponse, CommandCodecError> {
    if payload.len() < 7 {
        return Err(CommandCodecError::Truncated);
    }
    if payload[0] != COMMAND_QUANTITY {
        return Err(CommandCodecError::BadQuantity(payload[0]));
    }
    let kind = payload[1];
    let is_response = match kind {
        TYPE_RESPONSE => true,
        TYPE_COMMAND => false,
        other => return Err(CommandCodecError::UnknownType(other)),
    };
    let declared = u32::from_be_bytes([payload[2], payload[3], payload[4], payload[5]]) as usize;
    let available = payload.len().saturating_sub(7);
    if declared != available {
        return Err(CommandCodecError::SizeMismatch {
            declared,
            available,
        });
    }
    if payload[payload.len() - 1] != COMMAND_QUANTITY {
        return Err(CommandCodecError::BadQuantity(payload[payload.len() - 1]));
    }
    let text = std::str::from_utf8(&payload[6..6 + declared])
        .map_err(|_| CommandCodecError::Encoding)?
        .to_owned();
    Ok(CommandResponse { is_response, text })
}

/// Build a framed response packet (type `0x06`). Devices originate these;
/// only tests and the emulator need to construct them.
#[cfg(any(test, feature = "test-support"))]
pub fn encode_response(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut body = Vec::with_capacity(bytes.len() + 8);
    body.push(CODEC_COMMAND);
    body.push(COMMAND_QUANTITY);
    body.push(TYPE_RESPONSE);
    body.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    body.extend_from_slice(bytes);
    body.push(COMMAND_QUANTITY);
    wrap_frame(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, FrameReader};

    #[tokio::test]
    async fn command_roundtrip() {
        // Encode, run through the frame reader, decode: text must survive.
        let packet = encode_command("getinfo");
        let mut reader = FrameReader::new(&packet[..]);
        let frame = reader.read_frame().await.unwrap();
        let Frame::Data {
            codec_id, payload, ..
        } = frame
        else {
            panic!("expected data frame");
        };
        assert_eq!(codec_id, CODEC_COMMAND);
        let decoded = decode_command_payload(&payload).unwrap();
        assert!(!decoded.is_response);
        assert_eq!(decoded.text, "getinfo");
    }

    #[tokio::test]
    async fn response_roundtrip() {
        let packet = encode_response("OK");
        let mut reader = FrameReader::new(&packet[..]);
        let Frame::Data { payload, .. } = reader.read_frame().await.unwrap() else {
            panic!("expected data frame");
        };
        let decoded = decode_command_payload(&payload).unwrap();
        assert!(decoded.is_response);
        assert_eq!(decoded.text, "OK");
    }

    #[test]
    fn known_packet_layout() {
        // "getinfo" is 7 bytes; body is codec id + 2 quantity bytes + type
        // + 4 size bytes + text = 15 bytes; packet adds 8 header + 4 CRC.
        let packet = encode_command("getinfo");
        assert_eq!(packet.len(), 15 + 12);
        assert_eq!(&packet[..4], &[0, 0, 0, 0]);
        assert_eq!(&packet[4..8], &15u32.to_be_bytes());
        assert_eq!(packet[8], CODEC_COMMAND);
        assert_eq!(packet[10], TYPE_COMMAND);
        // CRC trailer is zero-padded to 4 bytes.
        assert_eq!(&packet[packet.len() - 4..packet.len() - 2], &[0, 0]);
    }

    #[test]
    fn size_mismatch_rejected() {
        let packet = encode_response("OK");
        // payload starts after 8-byte header + codec id, ends before 4-byte CRC
        let mut payload = packet[9..packet.len() - 4].to_vec();
        payload[5] = 99; // corrupt declared size
        assert!(matches!(
            decode_command_payload(&payload),
            Err(CommandCodecError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn empty_payload_rejected() {
        assert!(matches!(
            decode_command_payload(&[]),
            Err(CommandCodecError::Truncated)
        ));
    }
}
