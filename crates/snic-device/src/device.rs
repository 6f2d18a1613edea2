use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use tracing::{debug, info, warn};

use snic_proto::bar4::Bar4Write;
use snic_proto::msix::MsixEntry;
use snic_proto::ring::Descriptor;
use snic_tap::L2Port;
use snic_tlp::{DmaPort, MwrEvent, MwrHandler, Tag};

use crate::{rx, tx};

/// Everything the device must learn out-of-band before it can serve.
#[derive(Debug, Clone, Copy)]
pub struct SnicConfig {
    /// Host-physical base of the BAR4 window; nonzero once bound.
    pub bar4_base: u64,
    /// MSI-X vector for TX completions.
    pub tx_irq: MsixEntry,
    /// MSI-X vector for RX completions.
    pub rx_irq: MsixEntry,
}

/// State of the single RX slot ("simple NIC": one RX in flight).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxSlotState {
    /// No buffer has ever been posted.
    Init,
    /// A buffer is posted and waiting for a frame.
    Ready,
    /// The tap reader claimed the buffer and is delivering into it.
    Busy,
    /// Delivery finished; the next doorbell replaces the slot.
    Done,
}

pub(crate) struct RxSlot {
    pub state: RxSlotState,
    /// Ring address of the descriptor being serviced.
    pub desc_addr: u64,
    pub desc: Descriptor,
    /// Tag the doorbell arrived on; the completion DMA must use it.
    pub tag: Tag,
}

/// One emulated NIC.
///
/// Shared between the transport callback thread (dispatcher, TX engine,
/// RX doorbell half) and the tap reader. The ring bases are published with
/// release/acquire so a doorbell always observes a preceding rebase; the
/// RX slot is guarded by a mutex and a condvar ordering its lifecycle.
pub struct SnicDevice {
    bar4_base: u64,
    pub(crate) tx_irq: MsixEntry,
    pub(crate) rx_irq: MsixEntry,
    pub(crate) tx_ring: AtomicU64,
    pub(crate) rx_ring: AtomicU64,
    pub(crate) rx_slot: Mutex<RxSlot>,
    pub(crate) rx_done: Condvar,
    pub(crate) port: Arc<dyn L2Port>,
}

impl SnicDevice {
    pub fn new(cfg: SnicConfig, port: Arc<dyn L2Port>) -> SnicDevice {
        SnicDevice {
            bar4_base: cfg.bar4_base,
            tx_irq: cfg.tx_irq,
            rx_irq: cfg.rx_irq,
            tx_ring: AtomicU64::new(0),
            rx_ring: AtomicU64::new(0),
            rx_slot: Mutex::new(RxSlot {
                state: RxSlotState::Init,
                desc_addr: 0,
                desc: Descriptor::default(),
                tag: Tag::ZERO,
            }),
            rx_done: Condvar::new(),
            port,
        }
    }

    pub fn bar4_base(&self) -> u64 {
        self.bar4_base
    }

    /// Current RX slot state, for observability and tests.
    pub fn rx_slot_state(&self) -> RxSlotState {
        self.rx_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// DMA-writes the 4-byte vector word; an interrupt that fails to send
    /// is logged and dropped, never retried.
    pub(crate) fn raise_irq(
        &self,
        dma: &dyn DmaPort,
        tag: Tag,
        entry: MsixEntry,
        which: &'static str,
    ) {
        if let Err(e) = dma.dma_write(tag, entry.addr, &entry.data.to_le_bytes()) {
            warn!(%tag, which, error = %e, "failed to signal interrupt");
        }
    }
}

impl MwrHandler for SnicDevice {
    fn on_mwr(&self, dma: &dyn DmaPort, ev: &MwrEvent<'_>) {
        let Some(offset) = ev.addr.checked_sub(self.bar4_base) else {
            debug!(addr = format_args!("{:#x}", ev.addr), "MWr below BAR4, ignoring");
            return;
        };
        match Bar4Write::decode(offset, ev.payload) {
            Some(Bar4Write::TxRingBase(base)) => {
                info!(base = format_args!("{base:#x}"), "TX ring rebased");
                self.tx_ring.store(base, Ordering::Release);
            }
            Some(Bar4Write::RxRingBase(base)) => {
                info!(base = format_args!("{base:#x}"), "RX ring rebased");
                self.rx_ring.store(base, Ordering::Release);
            }
            Some(Bar4Write::TxDoorbell(idx)) => tx::transmit(self, dma, ev.tag, idx),
            Some(Bar4Write::RxDoorbell(idx)) => rx::post(self, dma, ev.tag, idx),
            Some(Bar4Write::Enable(word)) => {
                // The driver flips this at open/stop; there is nothing to
                // tear down on this side.
                info!(word, "device enable word written");
            }
            None => {
                debug!(offset, len = ev.payload.len(), "ignoring write outside the register map");
            }
        }
    }
}
