//! RX: doorbell arms the slot, the tap reader completes it.
//!
//! The doorbell half runs under the dispatcher and only fetches the
//! descriptor; all data movement happens on the tap-reader thread. The
//! slot lifecycle Init/Done -> Ready -> Busy -> Done is what keeps exactly
//! one RX in flight: a doorbell finding the slot Ready or Busy waits on
//! the condvar until the reader has finished the previous one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::PoisonError;

use tracing::{info, trace, warn};

use snic_proto::ring::{self, Descriptor, DESC_SIZE};
use snic_tlp::{DmaPort, Tag};

use crate::device::{RxSlotState, SnicDevice};
use crate::{MAX_RX_FRAME, TAP_POLL_MS};

/// Inline half: waits the slot free, fetches the descriptor, arms Ready.
pub(crate) fn post(dev: &SnicDevice, dma: &dyn DmaPort, tag: Tag, idx: u32) {
    let base = dev.rx_ring.load(Ordering::Acquire);
    if base == 0 {
        warn!(%tag, idx, "RX doorbell before ring rebase, ignoring");
        return;
    }

    let mut slot = dev.rx_slot.lock().unwrap_or_else(PoisonError::into_inner);
    while matches!(slot.state, RxSlotState::Ready | RxSlotState::Busy) {
        slot = dev
            .rx_done
            .wait(slot)
            .unwrap_or_else(PoisonError::into_inner);
    }

    let desc_addr = ring::slot_addr(base, idx);
    let mut raw = [0u8; DESC_SIZE];
    match dma.dma_read(tag, desc_addr, &mut raw) {
        Ok(n) if n == DESC_SIZE => {}
        Ok(n) => {
            warn!(%tag, desc_addr = format_args!("{desc_addr:#x}"), n, "short RX descriptor read");
            return;
        }
        Err(e) => {
            warn!(%tag, desc_addr = format_args!("{desc_addr:#x}"), error = %e, "RX descriptor read failed");
            return;
        }
    }
    let Some(desc) = Descriptor::decode(&raw) else {
        return;
    };

    slot.desc_addr = desc_addr;
    slot.desc = desc;
    slot.tag = tag;
    slot.state = RxSlotState::Ready;
    trace!(
        %tag,
        idx,
        buf = format_args!("{:#x}", desc.addr),
        "RX buffer posted"
    );
}

/// The tap-reader loop. Exactly one instance runs for the process
/// lifetime; it exits when `stop` is set, within one poll interval.
///
/// Frames arriving while no buffer is Ready are dropped -- the simple NIC
/// has no queue.
pub fn run_tap_reader(dev: &SnicDevice, dma: &dyn DmaPort, stop: &AtomicBool) {
    let mut buf = [0u8; MAX_RX_FRAME];
    info!("tap reader running");
    while !stop.load(Ordering::SeqCst) {
        let len = match dev.port.poll_recv(TAP_POLL_MS, &mut buf) {
            Ok(0) => continue,
            Ok(len) => len,
            Err(e) => {
                warn!(error = %e, "tap read failed");
                continue;
            }
        };

        // Claim the slot if a buffer is waiting; otherwise the frame is
        // dropped on the floor.
        let (desc, desc_addr, tag) = {
            let mut slot = dev.rx_slot.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.state != RxSlotState::Ready {
                trace!(len, state = ?slot.state, "no RX buffer posted, dropping frame");
                continue;
            }
            slot.state = RxSlotState::Busy;
            (slot.desc, slot.desc_addr, slot.tag)
        };

        deliver(dev, dma, tag, desc, desc_addr, &buf[..len]);

        // The slot reaches Done even when delivery failed; a wedged Busy
        // slot would block every later doorbell.
        let mut slot = dev.rx_slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.state = RxSlotState::Done;
        dev.rx_done.notify_all();
    }
    info!("tap reader stopped");
}

/// Payload DMA, descriptor writeback with the observed length, interrupt.
fn deliver(
    dev: &SnicDevice,
    dma: &dyn DmaPort,
    tag: Tag,
    desc: Descriptor,
    desc_addr: u64,
    frame: &[u8],
) {
    match dma.dma_write(tag, desc.addr, frame) {
        Ok(n) if n == frame.len() => {}
        Ok(n) => {
            warn!(%tag, n, len = frame.len(), "short RX payload write");
            return;
        }
        Err(e) => {
            warn!(%tag, addr = format_args!("{:#x}", desc.addr), error = %e, "RX payload write failed");
            return;
        }
    }

    // Tell the host how long the frame actually was.
    let done = Descriptor {
        addr: desc.addr,
        length: frame.len() as u64,
    };
    match dma.dma_write(tag, desc_addr, &done.encode()) {
        Ok(n) if n == DESC_SIZE => {}
        Ok(n) => {
            warn!(%tag, n, "short RX descriptor writeback");
            return;
        }
        Err(e) => {
            warn!(%tag, desc_addr = format_args!("{desc_addr:#x}"), error = %e, "RX descriptor writeback failed");
            return;
        }
    }

    dev.raise_irq(dma, tag, dev.rx_irq, "rx");
    trace!(%tag, len = frame.len(), buf = format_args!("{:#x}", desc.addr), "RX frame delivered");
}
