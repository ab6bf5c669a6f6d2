//! LRC and CRC16 checksums for the serial framings.
//!
//! Both checks cover the same span: unit id, function code and payload.
//! CRC16 travels low byte first; LRC is a single trailing byte.

use crc::{Crc, CRC_16_MODBUS};

use crate::error::{ModbusError, ModbusResult};

/// CRC calculator for RTU (init 0xFFFF, reflected polynomial 0xA001)
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Longitudinal redundancy check: two's complement of the byte sum
pub fn lrc(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    sum.wrapping_neg()
}

/// Validate a decoded ASCII frame whose last byte is the LRC
///
/// The LRC is recomputed over every byte except the trailing one.
pub fn check_lrc(frame: &[u8]) -> ModbusResult<()> {
    let (body, received) = match frame.split_last() {
        Some((last, body)) => (body, *last),
        None => return Err(ModbusError::frame("Empty frame has no LRC")),
    };
    let expected = lrc(body);
    if expected != received {
        return Err(ModbusError::lrc_mismatch(expected, received));
    }
    Ok(())
}

/// CRC16 value of `data`
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// CRC16 as it appears on the wire: `[lo, hi]`
pub fn crc16_bytes(data: &[u8]) -> [u8; 2] {
    crc16(data).to_le_bytes()
}

/// Validate a complete RTU frame ending in `[crc_lo, crc_hi]`
pub fn check_crc16(frame: &[u8]) -> ModbusResult<()> {
    if frame.len() < 2 {
        return Err(ModbusError::frame("RTU frame too short for CRC"));
    }
    let split = frame.len() - 2;
    let expected = crc16(&frame[..split]);
    let received = u16::from_le_bytes([frame[split], frame[split + 1]]);
    if expected != received {
        return Err(ModbusError::crc_mismatch(expected, received));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_known_vector() {
        // 01 03 00 00 00 02 -> C4 0B
        let data = [0x01, 0x03, 0x00, 0x00, 0x00, 0x02];
        assert_eq!(crc16_bytes(&data), [0xC4, 0x0B]);
        assert_eq!(crc16(&data), crc16(&data));
    }

    #[test]
    fn test_crc_append_then_validate() {
        for len in 0..40u8 {
            let mut frame: Vec<u8> = (0..len).map(|i| i.wrapping_mul(37).wrapping_add(11)).collect();
            let crc = crc16_bytes(&frame);
            frame.extend_from_slice(&crc);
            assert!(check_crc16(&frame).is_ok(), "len {}", len);
        }
    }

    #[test]
    fn test_crc_detects_every_single_bit_flip() {
        let mut frame = vec![0x11, 0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02];
        let crc = crc16_bytes(&frame);
        frame.extend_from_slice(&crc);

        for byte in 0..frame.len() {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(
                    check_crc16(&corrupted).is_err(),
                    "flip of bit {} in byte {} went undetected",
                    bit,
                    byte
                );
            }
        }
    }

    #[test]
    fn test_lrc_sum_property() {
        let payloads: [&[u8]; 5] = [
            &[],
            &[0x01, 0x03, 0x00, 0x00, 0x00, 0x02],
            &[0xFF, 0xFF, 0xFF],
            &[0x80],
            &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99],
        ];
        for payload in payloads {
            let sum = payload.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
            assert_eq!(sum.wrapping_add(lrc(payload)), 0);
        }
        assert_eq!(lrc(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]), 0xFA);
    }

    #[test]
    fn test_check_lrc() {
        assert!(check_lrc(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xFA]).is_ok());
        let err = check_lrc(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xFF]).unwrap_err();
        assert!(matches!(err, ModbusError::LrcMismatch { expected: 0xFA, actual: 0xFF }));
        assert!(check_lrc(&[]).is_err());
    }
}
