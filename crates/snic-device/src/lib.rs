//! The simple-NIC emulation core.
//!
//! A host driver programs the device purely through Memory Writes into its
//! BAR4 window: ring rebases, then doorbells. The dispatcher classifies
//! each write; TX doorbells are serviced inline (descriptor chase, payload
//! DMA, tap write, interrupt), RX doorbells only fetch the descriptor and
//! arm the single RX slot, which the tap-reader thread completes when a
//! frame arrives.
//!
//! The core owns no transport and no tap: DMA goes through
//! [`snic_tlp::DmaPort`] on the tag each event arrived on, frames through
//! [`snic_tap::L2Port`]. Tests drive both seams with in-memory fakes.

mod device;
mod rx;
mod tx;

pub use device::{RxSlotState, SnicConfig, SnicDevice};
pub use rx::run_tap_reader;

/// Largest frame a TX descriptor may name.
pub const MAX_TX_FRAME: usize = 4096;

/// RX frame buffer size; longer tap frames are truncated by the read.
pub const MAX_RX_FRAME: usize = 2048;

/// Tap poll interval; the shutdown flag is observed at least this often.
pub const TAP_POLL_MS: i32 = 500;
