//! Modbus RTU framing
//!
//! ```text
//! unit | function | data | crc_lo | crc_hi
//! ```
//!
//! RTU carries no delimiters. The number of data bytes is taken from the
//! function-code length tables in [`crate::protocol`]; frames addressed to
//! other units are skipped by watching for the 3.5 character inter-frame
//! silence.

use log::{debug, warn};

use crate::checksum::{crc16, crc16_bytes};
use crate::error::{ModbusError, ModbusResult};
use crate::image::RequestListener;
use crate::protocol::{layout_for, DataLayout, Direction, Frame, MEI_READ_DEVICE_ID};
use crate::timing::SerialTiming;
use crate::transport::Transport;

/// Encode a frame as RTU wire bytes
///
/// Unit id and function code are prepended to the payload exactly once.
pub fn encode(frame: &Frame) -> Vec<u8> {
    let mut wire = frame.pdu_bytes();
    let crc = crc16_bytes(&wire);
    wire.extend_from_slice(&crc);
    wire
}

/// Read the data bytes that follow unit id and function code
async fn read_data(transport: &mut Transport, layout: DataLayout) -> ModbusResult<Vec<u8>> {
    let wait = Some(transport.timeout());
    let data = match layout {
        DataLayout::Fixed(len) => transport.read_exact(len, wait).await?,
        DataLayout::Counted { prefix } => {
            let mut data = transport.read_exact(prefix + 1, wait).await?;
            let count = usize::from(data[prefix]);
            data.extend(transport.read_exact(count, wait).await?);
            data
        }
        DataLayout::WordCounted => {
            let mut data = transport.read_exact(2, wait).await?;
            let count = usize::from(u16::from_be_bytes([data[0], data[1]]));
            data.extend(transport.read_exact(count, wait).await?);
            data
        }
        DataLayout::DeviceIdentification => {
            let mei_type = transport.read_byte(wait).await?;
            if mei_type != MEI_READ_DEVICE_ID {
                return Err(ModbusError::frame(format!(
                    "Unsupported MEI type 0x{:02X}",
                    mei_type
                )));
            }
            let mut data = vec![mei_type];
            let header = transport.read_exact(5, wait).await?;
            let fields = header[4];
            data.extend(header);
            for _ in 0..fields {
                let field = transport.read_exact(2, wait).await?;
                let len = usize::from(field[1]);
                data.extend(field);
                data.extend(transport.read_exact(len, wait).await?);
            }
            if fields == 0 {
                data.push(transport.read_byte(wait).await?);
            }
            data
        }
    };
    Ok(data)
}

/// Read data and CRC for a frame whose unit and function are already consumed
///
/// On a CRC mismatch buffered input is discarded before the error is
/// returned, so the next read starts clean.
async fn read_body(
    transport: &mut Transport,
    unit_id: u8,
    function_code: u8,
    direction: Direction,
) -> ModbusResult<Frame> {
    let layout = layout_for(function_code, direction)?;
    let payload = read_data(transport, layout).await?;
    let wait = Some(transport.timeout());
    let crc = transport.read_exact(2, wait).await?;
    let received = u16::from_le_bytes([crc[0], crc[1]]);

    let mut frame = Frame::new(unit_id, function_code, payload);
    let expected = crc16(&frame.pdu_bytes());
    if expected != received {
        transport.clear_input();
        return Err(match (direction, transport.last_request()) {
            (Direction::Response, Some(request)) => {
                ModbusError::crc_mismatch_for_request(expected, received, request)
            }
            _ => ModbusError::crc_mismatch(expected, received),
        });
    }
    frame.checksum = Some(received);
    Ok(frame)
}

/// Single-shot response read
pub(crate) async fn read_response(transport: &mut Transport) -> ModbusResult<Frame> {
    let wait = Some(transport.timeout());
    let unit_id = transport.read_byte(wait).await?;
    let function_code = transport.read_byte(wait).await?;
    read_body(transport, unit_id, function_code, Direction::Response).await
}

/// Request read loop
///
/// Waits without a deadline for the first byte of a frame. Frames for units
/// that have no process image are skipped by [`skip_foreign_frame`].
pub(crate) async fn read_request(
    transport: &mut Transport,
    timing: SerialTiming,
    listener: &dyn RequestListener,
) -> ModbusResult<Frame> {
    loop {
        let unit_id = transport.read_byte(None).await?;
        if listener.process_image(unit_id).is_none() {
            skip_foreign_frame(transport, timing, unit_id).await?;
            continue;
        }

        let wait = Some(transport.timeout());
        let function_code = transport.read_byte(wait).await?;
        return read_body(transport, unit_id, function_code, Direction::Request).await;
    }
}

/// Discard a frame that is not addressed to this slave
///
/// Input is drained while bytes keep arriving within 1.5t. After a 1.5t
/// silence a further 2t of silence (3.5t overall) is required; a byte in that
/// window means the stream was mid-frame, so draining starts over.
async fn skip_foreign_frame(
    transport: &mut Transport,
    timing: SerialTiming,
    unit_id: u8,
) -> ModbusResult<()> {
    debug!("Skipping RTU frame for unit {}", unit_id);
    loop {
        loop {
            transport.clear_input();
            if !transport.wait_for_data(timing.inter_char()).await? {
                break;
            }
        }
        if !transport.wait_for_data(timing.frame_gap_remainder()).await? {
            return Ok(());
        }
        warn!(
            "Data inside the inter-frame gap after unit {} frame, discarding",
            unit_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameCodec;
    use crate::image::UnitMap;
    use crate::register_bank::RegisterBank;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn wire(bytes: &[u8]) -> Vec<u8> {
        let mut frame = bytes.to_vec();
        frame.extend_from_slice(&crc16_bytes(bytes));
        frame
    }

    fn rtu_transport(channel: impl crate::transport::ByteChannel + 'static) -> Transport {
        Transport::new(channel, FrameCodec::Rtu(SerialTiming::from_baud(9600)))
            .with_timeout(Duration::from_millis(100))
    }

    fn listener_for(unit: u8) -> UnitMap {
        let units = UnitMap::new();
        units.insert(unit, Arc::new(RegisterBank::new()));
        units
    }

    /// One synthetic request per supported function, data bytes only
    fn request_samples() -> Vec<(u8, Vec<u8>)> {
        vec![
            (0x01, vec![0x00, 0x13, 0x00, 0x25]),
            (0x02, vec![0x00, 0xC4, 0x00, 0x16]),
            (0x03, vec![0x00, 0x6B, 0x00, 0x03]),
            (0x04, vec![0x00, 0x08, 0x00, 0x01]),
            (0x05, vec![0x00, 0xAC, 0xFF, 0x00]),
            (0x06, vec![0x00, 0x01, 0x00, 0x03]),
            (0x07, vec![]),
            (0x0B, vec![]),
            (0x0C, vec![]),
            (0x0F, vec![0x00, 0x13, 0x00, 0x0A, 0x02, 0xCD, 0x01]),
            (0x10, vec![0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]),
            (0x11, vec![]),
            (0x14, vec![0x07, 0x06, 0x00, 0x04, 0x00, 0x01, 0x00, 0x02]),
            (0x15, vec![0x09, 0x06, 0x00, 0x04, 0x00, 0x07, 0x00, 0x01, 0x06, 0xAF]),
            (0x16, vec![0x00, 0x04, 0x00, 0xF2, 0x00, 0x25]),
            (0x17, vec![0x00, 0x03, 0x00, 0x06, 0x00, 0x0E, 0x00, 0x03, 0x06, 0x00, 0xFF, 0x00, 0xFF, 0x00, 0xFF]),
            (0x18, vec![0x04, 0xDE]),
            (0x2B, vec![0x0E, 0x01, 0x00]),
        ]
    }

    /// One synthetic response per supported function, data bytes only
    fn response_samples() -> Vec<(u8, Vec<u8>)> {
        vec![
            (0x01, vec![0x03, 0xCD, 0x6B, 0x05]),
            (0x03, vec![0x06, 0x02, 0x2B, 0x00, 0x00, 0x00, 0x64]),
            (0x05, vec![0x00, 0xAC, 0xFF, 0x00]),
            (0x07, vec![0x6D]),
            (0x08, vec![0x00, 0x00, 0xA5, 0x37]),
            (0x0B, vec![0xFF, 0xFF, 0x01, 0x08]),
            (0x0C, vec![0x08, 0x00, 0x00, 0x01, 0x08, 0x01, 0x21, 0x20, 0x00]),
            (0x10, vec![0x00, 0x01, 0x00, 0x02]),
            (0x11, vec![0x03, 0x11, 0xFF, 0x42]),
            (0x16, vec![0x00, 0x04, 0x00, 0xF2, 0x00, 0x25]),
            (0x17, vec![0x04, 0x00, 0xFE, 0x0A, 0xCD]),
            (0x18, vec![0x00, 0x06, 0x00, 0x02, 0x01, 0xB8, 0x12, 0x84]),
            (0x2B, vec![0x0E, 0x01, 0x01, 0x00, 0x00, 0x02, 0x00, 0x03, b'A', b'C', b'M', 0x01, 0x02, b'X', b'1']),
            (0x2B, vec![0x0E, 0x01, 0x01, 0x00, 0x00, 0x00, 0x04]),
            (0x83, vec![0x02]),
        ]
    }

    #[test]
    fn test_encode_appends_crc_once() {
        let frame = Frame::new(0x01, 0x03, vec![0x00, 0x00, 0x00, 0x02]);
        assert_eq!(encode(&frame), vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]);
    }

    #[tokio::test]
    async fn test_request_table_coverage() {
        let units = listener_for(0x11);
        for (function_code, data) in request_samples() {
            let mut pdu = vec![0x11, function_code];
            pdu.extend_from_slice(&data);

            let (local, mut remote) = tokio::io::duplex(512);
            let mut transport = rtu_transport(local);
            remote.write_all(&wire(&pdu)).await.unwrap();
            let frame = read_request(&mut transport, SerialTiming::from_baud(9600), &units)
                .await
                .unwrap_or_else(|e| panic!("fc 0x{:02X}: {}", function_code, e));
            assert_eq!(frame.payload, data, "fc 0x{:02X}", function_code);
        }
    }

    #[tokio::test]
    async fn test_response_table_coverage() {
        for (function_code, data) in response_samples() {
            let mut pdu = vec![0x01, function_code];
            pdu.extend_from_slice(&data);

            let (local, mut remote) = tokio::io::duplex(512);
            let mut transport = rtu_transport(local);
            remote.write_all(&wire(&pdu)).await.unwrap();
            let frame = read_response(&mut transport)
                .await
                .unwrap_or_else(|e| panic!("fc 0x{:02X}: {}", function_code, e));
            assert_eq!(frame.pdu_bytes(), pdu, "fc 0x{:02X}", function_code);
        }
    }

    #[tokio::test]
    async fn test_truncated_frames_never_accepted() {
        for (function_code, data) in response_samples() {
            let mut pdu = vec![0x01, function_code];
            pdu.extend_from_slice(&data);
            let mut bytes = wire(&pdu);
            bytes.pop();

            let (local, mut remote) = tokio::io::duplex(512);
            let mut transport = rtu_transport(local);
            remote.write_all(&bytes).await.unwrap();
            let result = read_response(&mut transport).await;
            assert!(result.is_err(), "fc 0x{:02X} accepted a truncated frame", function_code);
        }
    }

    #[tokio::test]
    async fn test_truncated_requests_never_accepted() {
        let units = listener_for(0x11);
        for (function_code, data) in request_samples() {
            let mut pdu = vec![0x11, function_code];
            pdu.extend_from_slice(&data);
            let mut bytes = wire(&pdu);
            bytes.pop();

            let (local, mut remote) = tokio::io::duplex(512);
            let mut transport = rtu_transport(local);
            remote.write_all(&bytes).await.unwrap();
            let result = read_request(&mut transport, SerialTiming::from_baud(9600), &units).await;
            assert!(result.is_err(), "fc 0x{:02X} accepted a truncated request", function_code);
        }
    }

    #[tokio::test]
    async fn test_unknown_request_function_is_framing_error() {
        let units = listener_for(0x01);
        let (local, mut remote) = tokio::io::duplex(64);
        let mut transport = rtu_transport(local);
        remote.write_all(&wire(&[0x01, 0x42, 0x00])).await.unwrap();
        let err = read_request(&mut transport, SerialTiming::from_baud(9600), &units)
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::InvalidFunction { code: 0x42 }));
    }

    #[tokio::test]
    async fn test_unsupported_mei_type() {
        let (local, mut remote) = tokio::io::duplex(64);
        let mut transport = rtu_transport(local);
        remote.write_all(&wire(&[0x01, 0x2B, 0x0D, 0x00])).await.unwrap();
        let err = read_response(&mut transport).await.unwrap_err();
        assert!(matches!(err, ModbusError::Frame { .. }));
    }

    #[tokio::test]
    async fn test_crc_mismatch_names_last_request() {
        let (local, mut remote) = tokio::io::duplex(64);
        let mut transport = rtu_transport(local);
        let request = Frame::new(0x01, 0x03, vec![0x00, 0x00, 0x00, 0x01]);
        transport.write_request(&request).await.unwrap();

        let mut response = wire(&[0x01, 0x03, 0x02, 0x00, 0x2A]);
        let last = response.len() - 1;
        response[last] ^= 0xFF;
        remote.write_all(&response).await.unwrap();

        let err = transport.read_response().await.unwrap_err();
        match err {
            ModbusError::CrcMismatch { context, .. } => {
                assert!(context.contains("01 03 00 00 00 01"), "{}", context);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(transport.is_open());
    }

    #[tokio::test]
    async fn test_skips_frame_for_other_unit() {
        let units = listener_for(0x02);
        let foreign = wire(&[0x07, 0x03, 0x00, 0x00, 0x00, 0x01]);
        let mine = wire(&[0x02, 0x03, 0x00, 0x10, 0x00, 0x02]);

        let mock = tokio_test::io::Builder::new()
            .read(&foreign)
            .wait(Duration::from_millis(50))
            .read(&mine)
            .build();
        let mut transport = rtu_transport(mock);

        let frame = read_request(&mut transport, SerialTiming::from_baud(9600), &units)
            .await
            .unwrap();
        assert_eq!(frame.unit_id, 0x02);
        assert_eq!(frame.payload, vec![0x00, 0x10, 0x00, 0x02]);
    }

    #[tokio::test]
    async fn test_byte_inside_frame_gap_restarts_skip() {
        // 300 baud: 1.5t = 55 ms, 3.5t = 128 ms
        let timing = SerialTiming::from_baud(300);
        let units = listener_for(0x02);
        let foreign = wire(&[0x07, 0x03, 0x00, 0x00, 0x00, 0x01]);
        let mine = wire(&[0x02, 0x06, 0x00, 0x05, 0x12, 0x34]);

        // the stray bytes look like the start of a frame for unit 2
        let mock = tokio_test::io::Builder::new()
            .read(&foreign)
            .wait(Duration::from_millis(80))
            .read(&[0x02, 0x03, 0x00])
            .wait(Duration::from_millis(250))
            .read(&mine)
            .build();
        let mut transport = rtu_transport(mock);

        let frame = read_request(&mut transport, timing, &units).await.unwrap();
        assert_eq!(frame.unit_id, 0x02);
        assert_eq!(frame.function_code, 0x06);
        assert_eq!(frame.payload, vec![0x00, 0x05, 0x12, 0x34]);
    }

    #[tokio::test]
    async fn test_addressed_crc_mismatch_fails_read() {
        let units = listener_for(0x01);
        let mut bytes = wire(&[0x01, 0x06, 0x00, 0x01, 0x00, 0x03]);
        bytes[3] ^= 0x01;

        let (local, mut remote) = tokio::io::duplex(64);
        let mut transport = rtu_transport(local);
        remote.write_all(&bytes).await.unwrap();
        let err = read_request(&mut transport, SerialTiming::from_baud(9600), &units)
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::CrcMismatch { .. }));
    }
}
