//! # CRC-16 Checksum
//!
//! Table-driven CRC-16 with the reflected polynomial `0xA001` and initial register `0xFFFF`
//! (the Modbus variant). The checksum covers the serialized payload only and travels on the
//! wire low byte first.

/// Size of the checksum trailer in bytes
pub const CHECKSUM_SIZE: usize = 2;

const POLYNOMIAL: u16 = 0xA001;
const INITIAL: u16 = 0xFFFF;

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ POLYNOMIAL;
            } else {
                crc >>= 1;
            }
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC_TABLE: [u16; 256] = build_table();

/// Compute the CRC-16 of `data`.
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(INITIAL, |crc, &byte| {
        (crc >> 8) ^ CRC_TABLE[((crc ^ u16::from(byte)) & 0x00FF) as usize]
    })
}

/// Wire representation of a checksum (low byte first).
#[inline]
pub fn to_wire(crc: u16) -> [u8; CHECKSUM_SIZE] {
    crc.to_le_bytes()
}

/// Parse a checksum trailer.
#[inline]
pub fn from_wire(bytes: [u8; CHECKSUM_SIZE]) -> u16 {
    u16::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitwise_crc16(data: &[u8]) -> u16 {
        let mut crc = INITIAL;
        for &byte in data {
            crc ^= u16::from(byte);
            for _ in 0..8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ POLYNOMIAL;
                } else {
                    crc >>= 1;
                }
            }
        }
        crc
    }

    #[test]
    fn test_known_vector() {
        assert_eq!(crc16(b"123456789"), 0x4B37);
    }

    #[test]
    fn test_empty_input_is_initial_register() {
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_table_matches_bitwise() {
        let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        assert_eq!(crc16(&data), bitwise_crc16(&data));
    }

    #[test]
    fn test_wire_order_low_byte_first() {
        assert_eq!(to_wire(0x4B37), [0x37, 0x4B]);
        assert_eq!(from_wire([0x37, 0x4B]), 0x4B37);
    }
}
