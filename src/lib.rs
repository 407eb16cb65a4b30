//! # domlink
//! A reliable point-to-point datagram link for the twisted pair between a
//! DOM mainboard and its surface companion, layered over the fixed-size
//! packet primitive of the FPGA dual-ported memory interface.
//!
//! The link delivers variable-length messages in order, retransmits lost
//! frames, coalesces acknowledgments through a bounded credit queue, and
//! re-synchronizes both stations with a three-packet IC/CI handshake. The
//! hardware contributes a CRC per frame; everything above that is here.

//! ## Example
//! A [`Link`] talks to the registers through the [`CommBus`] trait. The bus
//! below loops its own transmit ring back into its receive ring, which is
//! enough to carry a whole conversation with ourselves:
//! ```
//! use std::cell::{Cell, RefCell};
//! use domlink::{CommBus, Link, Tick, DP_WORDS, STATUS_AVAIL, STATUS_RX_PKT_RCVD};
//!
//! struct Loopback {
//!     ring: RefCell<Vec<u32>>,
//!     wadr: Cell<u16>,
//!     radr: Cell<u16>,
//!     ctrl: Cell<u32>,
//! }
//!
//! impl CommBus for Loopback {
//!     fn status(&self) -> u32 {
//!         let mut status = STATUS_AVAIL;
//!         if self.wadr.get() != self.radr.get() {
//!             status |= STATUS_RX_PKT_RCVD;
//!         }
//!         status
//!     }
//!     fn ctrl(&self) -> u32 { self.ctrl.get() }
//!     fn set_ctrl(&self, value: u32) { self.ctrl.set(value); }
//!     fn tx_wadr(&self) -> u16 { self.wadr.get() }
//!     fn set_tx_wadr(&self, wadr: u16) { self.wadr.set(wadr); }
//!     fn tx_radr(&self) -> u16 { self.radr.get() }
//!     fn rx_radr(&self) -> u16 { self.radr.get() }
//!     fn set_rx_radr(&self, radr: u16) { self.radr.set(radr); }
//!     fn tx_write(&self, index: u16, word: u32) {
//!         self.ring.borrow_mut()[index as usize] = word;
//!     }
//!     fn rx_read(&self, index: u16) -> u32 {
//!         self.ring.borrow()[index as usize]
//!     }
//!     fn ticks(&self) -> Tick { Tick(0) }
//!     fn usleep(&self, _micros: u32) {}
//! }
//!
//! let bus = Loopback {
//!     ring: RefCell::new(vec![0; DP_WORDS as usize]),
//!     wadr: Cell::new(0),
//!     radr: Cell::new(0),
//!     ctrl: Cell::new(0),
//! };
//! let mut link = Link::new(String::from("loop"), bus);
//!
//! link.send(2, b"hello, surface").unwrap();
//! while !link.msg_ready() {}
//! let msg = link.receive();
//! assert_eq!(msg.data, b"hello, surface");
//! ```

use thiserror::Error;

mod bus;
mod frame;
mod link;
mod queues;
mod retx;
mod stats;

pub use crate::bus::{
    CommBus, Tick, CTRL_REBOOT_REQUEST, CTRL_RX_DONE, DP_WORDS, STATUS_AVAIL,
    STATUS_COMM_RESET_RCVD, STATUS_REBOOT_GRANTED, STATUS_RX_DP_ALMOST_FULL, STATUS_RX_PKT_RCVD,
    STATUS_TX_ALMOST_EMPTY, STATUS_TX_PKT_SENT, TICK_MS,
};
pub use crate::frame::{
    build_frame, payload_bytes, FrameType, Header, HW_MAX_FRAME_BYTES, HW_MAX_FRAME_WORDS,
    HW_MAX_PAYLOAD_BYTES, MAX_MSG_SIZE,
};
pub use crate::link::{Link, Msg, IC_RETRY_MS, RETRANSMIT_TIMEOUT_MS, UNSTICK_THRESHOLD_MS};
pub use crate::stats::{LinkStats, STATS_WIRE_SIZE};

/// Errors surfaced by the public API.
///
/// Link-level trouble never appears here; lost, duplicated and reordered
/// frames are absorbed by retransmission and the handshake.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Message exceeds [`MAX_MSG_SIZE`]; the value is the overrun in bytes.
    #[error("message too large by {0} bytes")]
    Oversize(usize),
    /// No complete message has been reassembled yet.
    #[error("no message ready")]
    NoMsg,
}
