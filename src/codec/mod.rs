//! # Frame codecs
//!
//! One tagged enum selects how frames are delimited on a byte channel:
//!
//! | Variant | Delimiting | Check |
//! |---------|------------|-------|
//! | `Ascii` | `:` ... CR LF, hex pairs | LRC |
//! | `Rtu(timing)` | silence windows + function-code length tables | CRC16 |
//! | `Tcp` | MBAP length field | none |
//!
//! The codecs never own the channel. They are driven by a [`Transport`],
//! which supplies buffered reads with deadlines and the write path.
//!
//! [`Transport`]: crate::transport::Transport

pub mod ascii;
pub mod rtu;
pub mod tcp;

use crate::error::ModbusResult;
use crate::image::RequestListener;
use crate::protocol::Frame;
use crate::timing::SerialTiming;
use crate::transport::Transport;

/// Framing used by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCodec {
    /// Modbus ASCII (serial)
    Ascii,
    /// Modbus RTU, with the silence windows of the carrying line
    Rtu(SerialTiming),
    /// Modbus TCP (MBAP header)
    Tcp,
}

impl FrameCodec {
    /// RTU framing over a socket
    pub fn rtu_over_tcp() -> Self {
        FrameCodec::Rtu(SerialTiming::network())
    }

    /// Label used in packet logs
    pub fn name(&self) -> &'static str {
        match self {
            FrameCodec::Ascii => "ASCII",
            FrameCodec::Rtu(_) => "RTU",
            FrameCodec::Tcp => "TCP",
        }
    }

    /// Serial framings have no per-frame addressing feedback; broadcasts get no reply
    pub fn is_serial(&self) -> bool {
        !matches!(self, FrameCodec::Tcp)
    }

    /// Wire bytes for a frame
    ///
    /// `transaction_id` is only used by the MBAP encoding.
    pub fn encode(&self, frame: &Frame, transaction_id: u16) -> Vec<u8> {
        match self {
            FrameCodec::Ascii => ascii::encode(frame),
            FrameCodec::Rtu(_) => rtu::encode(frame),
            FrameCodec::Tcp => tcp::encode(frame, transaction_id),
        }
    }

    /// Read the next request addressed to `listener`
    pub(crate) async fn read_request(
        self,
        transport: &mut Transport,
        listener: &dyn RequestListener,
    ) -> ModbusResult<Frame> {
        match self {
            FrameCodec::Ascii => ascii::read_request(transport, listener).await,
            FrameCodec::Rtu(timing) => rtu::read_request(transport, timing, listener).await,
            FrameCodec::Tcp => tcp::read_frame(transport, true).await,
        }
    }

    /// Read one response; a single shot with no resynchronisation
    pub(crate) async fn read_response(self, transport: &mut Transport) -> ModbusResult<Frame> {
        match self {
            FrameCodec::Ascii => ascii::read_response(transport).await,
            FrameCodec::Rtu(_) => rtu::read_response(transport).await,
            FrameCodec::Tcp => tcp::read_frame(transport, false).await,
        }
    }
}
