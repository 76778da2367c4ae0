//! CRC-16 checksum used by every receiver message
//!
//! The receiver uses CRC-16/XMODEM (polynomial 0x1021, initial value 0,
//! no reflection). The checksum covers every byte but the last two, which
//! hold the CRC in little-endian order.

/// Length of the trailing checksum field
pub const CRC_LENGTH: usize = 2;

/// Compute CRC-16/XMODEM over `data`
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;

    for &byte in data {
        crc ^= (byte as u16) << 8;

        for _ in 0..8 {
            if (crc & 0x8000) != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }

    crc
}

/// Checksum stored in the last two bytes of `buffer`, if it has room for one
pub fn stored_crc(buffer: &[u8]) -> Option<u16> {
    if buffer.len() < CRC_LENGTH {
        return None;
    }
    let n = buffer.len();
    Some(u16::from_le_bytes([buffer[n - 2], buffer[n - 1]]))
}

/// Stored and computed checksums of `buffer`
pub fn checksums(buffer: &[u8]) -> Option<(u16, u16)> {
    let stored = stored_crc(buffer)?;
    let computed = crc16(&buffer[..buffer.len() - CRC_LENGTH]);
    Some((stored, computed))
}

/// Validate the trailing checksum of `buffer`
pub fn crc_valid(buffer: &[u8]) -> bool {
    matches!(checksums(buffer), Some((stored, computed)) if stored == computed)
}

/// Append the checksum of `data` in the receiver's byte order
pub fn append_crc(data: &mut Vec<u8>) {
    let crc = crc16(data);
    data.extend_from_slice(&crc.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_check_value() {
        // Standard CRC-16/XMODEM check value
        assert_eq!(crc16(b"123456789"), 0x31C3);
        assert_eq!(crc16(&[]), 0);
    }

    #[test]
    fn test_crc_valid() {
        let mut data = vec![0x01, 0x0A, 0x00, 0x01, 0x02, 0xCF, 0x36, 0x0E];
        append_crc(&mut data);
        assert_eq!(data.len(), 10);
        assert!(crc_valid(&data));

        let last = data.len() - 1;
        data[last] ^= 0x01;
        assert!(!crc_valid(&data));
    }

    #[test]
    fn test_too_short_is_invalid() {
        assert!(!crc_valid(&[]));
        assert!(!crc_valid(&[0x00]));
        // Two zero bytes carry a zero checksum over nothing
        assert!(crc_valid(&[0x00, 0x00]));
    }

    #[test]
    fn test_single_bit_flip_detected() {
        let mut data: Vec<u8> = (0u8..40).collect();
        append_crc(&mut data);
        assert!(crc_valid(&data));

        let payload_len = data.len() - CRC_LENGTH;
        for byte in 0..payload_len {
            for bit in 0..8 {
                let mut corrupted = data.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(
                    !crc_valid(&corrupted),
                    "flip of byte {} bit {} went undetected",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_checksums() {
        let mut data = vec![0xAA, 0xBB];
        append_crc(&mut data);
        let (stored, computed) = checksums(&data).unwrap();
        assert_eq!(stored, computed);
        assert_eq!(checksums(&[0x01]), None);
    }
}
