//! Incremental frame assembly over a byte stream.
//!
//! The reader never assumes message boundaries line up with kernel reads:
//! every field is pulled with `read_exact`, which loops internally until
//! the requested bytes have arrived. One call to [`FrameReader::read_frame`]
//! yields exactly one frame.

use crate::crc16;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on the declared payload size of a single frame.
///
/// A data frame carries at most 255 records; even generously sized records
/// fit well under this. Anything larger is a corrupt length field.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Maximum length of the identity carried in a handshake frame.
const MAX_HANDSHAKE_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad preamble: {0:02x?}")]
    BadPreamble([u8; 4]),
    #[error("declared frame length {0} exceeds maximum {MAX_FRAME_LEN}")]
    Oversized(usize),
    #[error("crc mismatch: computed {computed:#06x}, frame carried {carried:#06x}")]
    CrcMismatch { computed: u16, carried: u16 },
    #[error("handshake length {0} out of range")]
    HandshakeLength(usize),
    #[error("handshake identity is not valid UTF-8")]
    HandshakeEncoding,
}

/// One decoded frame off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Declared length of zero; emit no record, just note liveness.
    KeepAlive,
    /// A codec-discriminated payload that passed CRC verification.
    Data {
        codec_id: u8,
        payload: Vec<u8>,
        /// CRC carried by the frame, kept for record fingerprinting.
        crc: u16,
    },
}

/// Reads frames off any async byte stream.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        FrameReader { inner }
    }

    /// Consume and return the inner stream.
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read the handshake frame: a 2-byte big-endian length prefix followed
    /// by the identity bytes. Format validation of the identity itself
    /// (15 digits) is the caller's concern.
    pub async fn read_handshake(&mut self) -> Result<String, FrameError> {
        let mut len_buf = [0u8; 2];
        self.inner.read_exact(&mut len_buf).await?;
        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_HANDSHAKE_LEN {
            return Err(FrameError::HandshakeLength(len));
        }
        let mut identity = vec![0u8; len];
        self.inner.read_exact(&mut identity).await?;
        String::from_utf8(identity).map_err(|_| FrameError::HandshakeEncoding)
    }

    /// Read exactly one frame.
    ///
    /// Returns `CrcMismatch` without consuming further input; the caller is
    /// expected to treat that as connection-fatal per the protocol contract.
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        let mut preamble = [0u8; 4];
        self.inner.read_exact(&mut preamble).await?;
        if preamble != [0, 0, 0, 0] {
            return Err(FrameError::BadPreamble(preamble));
        }

        let mut len_buf = [0u8; 4];
        self.inner.read_exact(&mut len_buf).await?;
        let data_size = u32::from_be_bytes(len_buf) as usize;

        if data_size == 0 {
            return Ok(Frame::KeepAlive);
        }
        if data_size > MAX_FRAME_LEN {
            return Err(FrameError::Oversized(data_size));
        }

        // codec id + payload, then the 4-byte CRC trailer
        let mut body = vec![0u8; data_size];
        self.inner.read_exact(&mut body).await?;
        let mut crc_buf = [0u8; 4];
        self.inner.read_exact(&mut crc_buf).await?;
        let carried = u32::from_be_bytes(crc_buf) as u16;

        let computed = crc16::checksum(&body);
        if computed != carried {
            return Err(FrameError::CrcMismatch { computed, carried });
        }

        let codec_id = body[0];
        let payload = body.split_off(1);
        Ok(Frame::Data {
            codec_id,
            payload,
            crc: carried,
        })
    }
}

/// Assemble the outer framing around an already-encoded codec body
/// (codec id + payload). Used by the command encoder and the test kit.
pub fn wrap_frame(body: &[u8]) -> Vec<u8> {
    let crc = crc16::checksum(body);
    let mut out = Vec::with_capacity(body.len() + 12);
    out.extend_from_slice(&[0, 0, 0, 0]);
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out.extend_from_slice(&u32::from(crc).to_be_bytes());
    out
}
