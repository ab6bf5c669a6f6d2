//! Serial character timing and RS-485 direction control settings.
//!
//! RTU frames carry no delimiters; a frame ends when the line stays silent.
//! One character is 11 bits (start, 8 data, parity, stop). Silence of 1.5
//! character times ends a character stream, 3.5 character times separates
//! two frames. Above 19200 baud the serial-line recommendation fixes the
//! windows at 750 µs and 1750 µs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bits on the wire per serial character
pub const BITS_PER_CHAR: u64 = 11;

/// Highest baud rate for which windows scale with the character time
pub const FIXED_TIMING_BAUD: u32 = 19_200;

const FIXED_INTER_CHAR: Duration = Duration::from_micros(750);
const FIXED_INTER_FRAME: Duration = Duration::from_micros(1750);

/// Silence windows derived from the line speed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialTiming {
    char_time: Duration,
    inter_char: Duration,
    inter_frame: Duration,
}

impl SerialTiming {
    /// Timing for a serial line running at `baud_rate`
    ///
    /// A zero baud rate is treated as 1 baud rather than dividing by zero.
    pub fn from_baud(baud_rate: u32) -> Self {
        let baud = u64::from(baud_rate.max(1));
        let char_time = Duration::from_nanos(BITS_PER_CHAR * 1_000_000_000 / baud);

        if baud_rate > FIXED_TIMING_BAUD {
            Self {
                char_time,
                inter_char: FIXED_INTER_CHAR,
                inter_frame: FIXED_INTER_FRAME,
            }
        } else {
            Self {
                char_time,
                inter_char: char_time * 3 / 2,
                inter_frame: char_time * 7 / 2,
            }
        }
    }

    /// Timing used for RTU framing carried over TCP
    ///
    /// There is no line speed on a socket; the fixed high-speed windows apply.
    pub fn network() -> Self {
        Self {
            char_time: Duration::from_micros(500),
            inter_char: FIXED_INTER_CHAR,
            inter_frame: FIXED_INTER_FRAME,
        }
    }

    /// Duration of one character
    pub fn char_time(&self) -> Duration {
        self.char_time
    }

    /// 1.5t: silence that ends a character stream
    pub fn inter_char(&self) -> Duration {
        self.inter_char
    }

    /// 3.5t: silence that separates frames
    pub fn inter_frame(&self) -> Duration {
        self.inter_frame
    }

    /// Silence still required after a 1.5t gap to reach 3.5t
    pub fn frame_gap_remainder(&self) -> Duration {
        self.inter_frame.saturating_sub(self.inter_char)
    }

    /// Time needed to shift `bytes` characters onto the line
    pub fn transmit_time(&self, bytes: usize) -> Duration {
        self.char_time * bytes as u32
    }
}

/// RS-485 half-duplex direction control
///
/// Before transmitting, the direction lines (RTS and DTR) are driven to the
/// transmit level and the transport waits `delay_before_tx_us`. After the
/// frame is flushed it waits `delay_after_tx_us` and releases the lines to the
/// receive level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rs485Settings {
    pub enabled: bool,
    /// Line level that selects transmit
    pub tx_active_high: bool,
    pub delay_before_tx_us: u64,
    pub delay_after_tx_us: u64,
}

impl Default for Rs485Settings {
    fn default() -> Self {
        Self {
            enabled: false,
            tx_active_high: true,
            delay_before_tx_us: 0,
            delay_after_tx_us: 0,
        }
    }
}

impl Rs485Settings {
    /// Line level while transmitting
    pub fn transmit_level(&self) -> bool {
        self.tx_active_high
    }

    /// Line level while receiving
    pub fn receive_level(&self) -> bool {
        !self.tx_active_high
    }

    pub fn delay_before_tx(&self) -> Duration {
        Duration::from_micros(self.delay_before_tx_us)
    }

    pub fn delay_after_tx(&self) -> Duration {
        Duration::from_micros(self.delay_after_tx_us)
    }
}
