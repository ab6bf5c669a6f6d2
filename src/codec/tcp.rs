//! Modbus TCP framing (MBAP)
//!
//! ```text
//! transaction id (2) | protocol id (2) = 0 | length (2) | unit | function | data
//! ```
//!
//! `length` counts unit, function and data, so it is at least 2 and at most
//! 254 (one unit byte plus a 253 byte PDU).

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::Frame;
use crate::transport::Transport;

/// MBAP header including the unit id
pub const MBAP_HEADER_LEN: usize = 7;

/// Largest legal MBAP length field
pub const MAX_MBAP_LENGTH: usize = 254;

/// Encode a frame with the given transaction id
pub fn encode(frame: &Frame, transaction_id: u16) -> Vec<u8> {
    let length = (frame.payload.len() + 2) as u16;
    let mut wire = Vec::with_capacity(MBAP_HEADER_LEN + 1 + frame.payload.len());
    wire.extend_from_slice(&transaction_id.to_be_bytes());
    wire.extend_from_slice(&0u16.to_be_bytes());
    wire.extend_from_slice(&length.to_be_bytes());
    wire.push(frame.unit_id);
    wire.push(frame.function_code);
    wire.extend_from_slice(&frame.payload);
    wire
}

/// Validate an MBAP header, returning (transaction id, length field)
fn parse_header(header: &[u8]) -> ModbusResult<(u16, usize)> {
    let transaction_id = u16::from_be_bytes([header[0], header[1]]);
    let protocol_id = u16::from_be_bytes([header[2], header[3]]);
    if protocol_id != 0 {
        return Err(ModbusError::frame(format!(
            "Invalid protocol ID: {}",
            protocol_id
        )));
    }
    let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
    if !(2..=MAX_MBAP_LENGTH).contains(&length) {
        return Err(ModbusError::frame(format!("Invalid MBAP length: {}", length)));
    }
    Ok((transaction_id, length))
}

/// Decode one complete MBAP datagram
pub fn decode(bytes: &[u8]) -> ModbusResult<Frame> {
    if bytes.len() < MBAP_HEADER_LEN + 1 {
        return Err(ModbusError::frame(format!(
            "MBAP frame too short: {} bytes",
            bytes.len()
        )));
    }
    let (transaction_id, length) = parse_header(&bytes[..MBAP_HEADER_LEN])?;
    if bytes.len() != MBAP_HEADER_LEN - 1 + length {
        return Err(ModbusError::frame(format!(
            "MBAP length {} does not match {} received bytes",
            length,
            bytes.len()
        )));
    }
    let mut frame = Frame::new(
        bytes[MBAP_HEADER_LEN - 1],
        bytes[MBAP_HEADER_LEN],
        bytes[MBAP_HEADER_LEN + 1..].to_vec(),
    );
    frame.transaction_id = Some(transaction_id);
    Ok(frame)
}

/// Read one MBAP frame from the transport
///
/// A slave waits for the first header byte without a deadline; everything
/// after it must arrive within the transport timeout.
pub(crate) async fn read_frame(transport: &mut Transport, is_request: bool) -> ModbusResult<Frame> {
    let wait = Some(transport.timeout());
    let first = transport.read_byte(if is_request { None } else { wait }).await?;

    let mut header = vec![first];
    header.extend(transport.read_exact(MBAP_HEADER_LEN - 1, wait).await?);
    let (transaction_id, length) = parse_header(&header)?;

    let body = transport.read_exact(length - 1, wait).await?;
    let mut frame = Frame::new(header[MBAP_HEADER_LEN - 1], body[0], body[1..].to_vec());
    frame.transaction_id = Some(transaction_id);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let frame = Frame::new(0x01, 0x03, vec![0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(
            encode(&frame, 0x1234),
            vec![0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]
        );
    }

    #[test]
    fn test_decode() {
        let bytes = [0x00, 0x07, 0x00, 0x00, 0x00, 0x05, 0x11, 0x03, 0x02, 0x12, 0x34];
        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.transaction_id, Some(7));
        assert_eq!(frame.unit_id, 0x11);
        assert_eq!(frame.function_code, 0x03);
        assert_eq!(frame.payload, vec![0x02, 0x12, 0x34]);
    }

    #[test]
    fn test_decode_rejects_bad_headers() {
        // protocol id 1
        assert!(decode(&[0, 1, 0, 1, 0, 2, 1, 3]).is_err());
        // length 1 leaves no room for a function code
        assert!(decode(&[0, 1, 0, 0, 0, 1, 1, 3]).is_err());
        // length disagrees with datagram size
        assert!(decode(&[0, 1, 0, 0, 0, 6, 1, 3, 0]).is_err());
        assert!(decode(&[0, 1, 0, 0]).is_err());
    }

    #[tokio::test]
    async fn test_read_frame_from_stream() {
        use crate::codec::FrameCodec;
        use std::time::Duration;
        use tokio::io::AsyncWriteExt;

        let (local, mut remote) = tokio::io::duplex(64);
        let mut transport = Transport::new(local, FrameCodec::Tcp).with_timeout(Duration::from_millis(100));
        let request = Frame::new(0x01, 0x06, vec![0x00, 0x01, 0x00, 0x03]);
        remote.write_all(&encode(&request, 42)).await.unwrap();

        let frame = read_frame(&mut transport, true).await.unwrap();
        assert_eq!(frame.transaction_id, Some(42));
        assert_eq!(frame.pdu_bytes(), request.pdu_bytes());

        remote.write_all(&[0, 1, 0, 0, 0x01, 0x00, 1, 3]).await.unwrap();
        assert!(matches!(
            read_frame(&mut transport, true).await,
            Err(ModbusError::Frame { .. })
        ));
    }
}
