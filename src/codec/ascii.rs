//! Modbus ASCII framing
//!
//! ```text
//! : | hex(unit) hex(function) hex(data)... | hex(LRC) | CR LF
//! ```
//!
//! Upper-case hex is written; either case is accepted on input.

use log::{debug, warn};

use crate::checksum::{check_lrc, lrc};
use crate::error::{ModbusError, ModbusResult};
use crate::image::RequestListener;
use crate::protocol::Frame;
use crate::transport::Transport;

/// Frame start marker
pub const START: u8 = b':';
/// First end marker byte
pub const CR: u8 = 0x0D;
/// Second end marker byte
pub const LF: u8 = 0x0A;

/// Largest decoded frame: unit + function + 252 data bytes + LRC
const MAX_DECODED_LEN: usize = crate::MAX_RTU_FRAME_SIZE;

/// Encode a frame as ASCII wire bytes
pub fn encode(frame: &Frame) -> Vec<u8> {
    let mut raw = frame.pdu_bytes();
    raw.push(lrc(&raw));

    let mut wire = Vec::with_capacity(raw.len() * 2 + 3);
    wire.push(START);
    wire.extend_from_slice(hex::encode_upper(&raw).as_bytes());
    wire.push(CR);
    wire.push(LF);
    wire
}

/// Convert single ASCII character to hex value
fn ascii_char_to_hex(c: u8) -> ModbusResult<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        _ => Err(ModbusError::frame(format!(
            "Invalid ASCII hex character: 0x{:02X}",
            c
        ))),
    }
}

/// Read one delimited frame and decode its hex pairs
///
/// Bytes before `:` are discarded. `first_wait` bounds the wait for the start
/// marker (`None` waits until data or close); once inside a frame every byte
/// must arrive within the transport timeout.
async fn read_raw(transport: &mut Transport, first_wait: Option<std::time::Duration>) -> ModbusResult<Vec<u8>> {
    while transport.read_byte(first_wait).await? != START {}

    let wait = Some(transport.timeout());
    let mut decoded = Vec::new();
    loop {
        let high = transport.read_byte(wait).await?;
        if high == CR {
            let end = transport.read_byte(wait).await?;
            if end != LF {
                return Err(ModbusError::frame(format!(
                    "Expected LF after CR, got 0x{:02X}",
                    end
                )));
            }
            return Ok(decoded);
        }
        let low = transport.read_byte(wait).await?;
        decoded.push((ascii_char_to_hex(high)? << 4) | ascii_char_to_hex(low)?);
        if decoded.len() > MAX_DECODED_LEN {
            return Err(ModbusError::frame("ASCII frame too large"));
        }
    }
}

/// Split validated bytes `unit | function | data | LRC` into a frame
fn into_frame(decoded: Vec<u8>) -> ModbusResult<Frame> {
    if decoded.len() < 3 {
        return Err(ModbusError::frame(format!(
            "ASCII frame too short: {} bytes",
            decoded.len()
        )));
    }
    let checksum = decoded[decoded.len() - 1];
    let mut frame = Frame::new(decoded[0], decoded[1], decoded[2..decoded.len() - 1].to_vec());
    frame.checksum = Some(u16::from(checksum));
    Ok(frame)
}

/// Single-shot response read; a bad LRC fails upward
pub(crate) async fn read_response(transport: &mut Transport) -> ModbusResult<Frame> {
    let first_wait = Some(transport.timeout());
    let decoded = read_raw(transport, first_wait).await?;
    check_lrc(&decoded)?;
    into_frame(decoded)
}

/// Request read loop
///
/// Malformed frames, LRC failures and frames for units without a process
/// image are dropped and the reader goes back to hunting for `:`. Timeouts
/// inside a frame and channel errors end the read.
pub(crate) async fn read_request(
    transport: &mut Transport,
    listener: &dyn RequestListener,
) -> ModbusResult<Frame> {
    loop {
        let decoded = match read_raw(transport, None).await {
            Ok(decoded) => decoded,
            Err(e) if e.is_framing_error() => {
                debug!("Discarding malformed ASCII frame: {}", e);
                continue;
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = check_lrc(&decoded) {
            warn!("Discarding ASCII frame: {}", e);
            continue;
        }

        let frame = match into_frame(decoded) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Discarding ASCII frame: {}", e);
                continue;
            }
        };

        if listener.process_image(frame.unit_id).is_none() {
            debug!("Skipping ASCII frame for unit {}", frame.unit_id);
            continue;
        }
        return Ok(frame);
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

    fn transport_pair() -> (Transport, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(1024);
        let transport = Transport::new(local, FrameCodec::Ascii).with_timeout(Duration::from_millis(200));
        (transport, remote)
    }

    #[test]
    fn test_encode_layout() {
        let frame = Frame::new(0x01, 0x03, vec![0x00, 0x00, 0x00, 0x02]);
        assert_eq!(encode(&frame), b":010300000002FA\r\n".to_vec());
    }

    #[test]
    fn test_ascii_char_to_hex() {
        assert_eq!(ascii_char_to_hex(b'0').unwrap(), 0);
        assert_eq!(ascii_char_to_hex(b'F').unwrap(), 15);
        assert_eq!(ascii_char_to_hex(b'a').unwrap(), 10);
        assert!(ascii_char_to_hex(b'G').is_err());
        assert!(ascii_char_to_hex(b':').is_err());
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (mut transport, mut remote) = transport_pair();
        let frames = [
            Frame::new(0x11, 0x10, vec![0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]),
            Frame::new(0xF7, 0x07, vec![]),
            Frame::new(0x01, 0x83, vec![0x02]),
        ];
        for frame in frames {
            remote.write_all(&encode(&frame)).await.unwrap();
            let decoded = read_response(&mut transport).await.unwrap();
            assert_eq!(decoded.pdu_bytes(), frame.pdu_bytes());
            assert!(decoded.checksum.is_some());
        }
    }

    #[tokio::test]
    async fn test_corrupted_lrc_rejected() {
        let (mut transport, mut remote) = transport_pair();
        remote.write_all(b":010300000002FF\r\n").await.unwrap();
        let err = read_response(&mut transport).await.unwrap_err();
        assert!(matches!(err, ModbusError::LrcMismatch { expected: 0xFA, actual: 0xFF }));
    }

    #[tokio::test]
    async fn test_timeout_inside_frame_is_fatal() {
        let (mut transport, mut remote) = transport_pair();
        remote.write_all(b":0103").await.unwrap();
        let err = read_response(&mut transport).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_request_loop_skips_noise_and_foreign_units() {
        let (mut transport, mut remote) = transport_pair();
        let units = UnitMap::new();
        units.insert(1, Arc::new(RegisterBank::new()));

        let mine = Frame::new(0x01, 0x06, vec![0x00, 0x10, 0x12, 0x34]);
        let foreign = Frame::new(0x09, 0x06, vec![0x00, 0x10, 0x12, 0x34]);

        let mut stream = b"garbage".to_vec();
        stream.extend_from_slice(b":010300000002FF\r\n");
        stream.extend_from_slice(b":01ZZ\r\n");
        stream.extend_from_slice(&encode(&foreign));
        stream.extend_from_slice(&encode(&mine));
        remote.write_all(&stream).await.unwrap();

        let frame = read_request(&mut transport, &units).await.unwrap();
        assert_eq!(frame.pdu_bytes(), mine.pdu_bytes());
    }
}
