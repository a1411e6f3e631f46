//! CRC-16/IBM (aka CRC-16/ARC) as used by the tracker wire protocol.

use crc::{Crc, CRC_16_ARC};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

/// Checksum over the codec-id-to-payload-end region of a frame.
pub fn checksum(bytes: &[u8]) -> u16 {
    CRC16.checksum(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // Standard CRC-16/ARC check value.
        assert_eq!(checksum(b"123456789"), 0xBB3D);
    }

    #[test]
    fn empty_input() {
        assert_eq!(checksum(&[]), 0);
    }
}
