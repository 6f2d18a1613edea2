//! TX: doorbell to tap, serviced inline under the dispatcher.
//!
//! The contract with the driver is that every doorbell yields exactly one
//! completion interrupt, whatever went wrong in between; the driver's TX
//! state machine would stall otherwise.

use std::sync::atomic::Ordering;

use tracing::{trace, warn};

use snic_proto::ring::{self, Descriptor, DESC_SIZE};
use snic_tlp::{DmaPort, Tag};

use crate::device::SnicDevice;
use crate::MAX_TX_FRAME;

pub(crate) fn transmit(dev: &SnicDevice, dma: &dyn DmaPort, tag: Tag, idx: u32) {
    send_frame(dev, dma, tag, idx);
    dev.raise_irq(dma, tag, dev.tx_irq, "tx");
}

/// Descriptor chase and tap write. Any failure returns early; the caller
/// raises the interrupt regardless.
fn send_frame(dev: &SnicDevice, dma: &dyn DmaPort, tag: Tag, idx: u32) {
    let base = dev.tx_ring.load(Ordering::Acquire);
    if base == 0 {
        warn!(%tag, idx, "TX doorbell before ring rebase, completing empty");
        return;
    }

    let desc_addr = ring::slot_addr(base, idx);
    let mut raw = [0u8; DESC_SIZE];
    match dma.dma_read(tag, desc_addr, &mut raw) {
        Ok(n) if n == DESC_SIZE => {}
        Ok(n) => {
            warn!(%tag, desc_addr = format_args!("{desc_addr:#x}"), n, "short TX descriptor read");
            return;
        }
        Err(e) => {
            warn!(%tag, desc_addr = format_args!("{desc_addr:#x}"), error = %e, "TX descriptor read failed");
            return;
        }
    }
    let Some(desc) = Descriptor::decode(&raw) else {
        return;
    };

    if desc.length > MAX_TX_FRAME as u64 {
        warn!(
            %tag,
            length = desc.length,
            "TX descriptor length exceeds {MAX_TX_FRAME}, dropping"
        );
        return;
    }
    let len = desc.length as usize;

    let mut frame = [0u8; MAX_TX_FRAME];
    match dma.dma_read(tag, desc.addr, &mut frame[..len]) {
        Ok(n) if n == len => {}
        Ok(n) => {
            warn!(%tag, addr = format_args!("{:#x}", desc.addr), n, len, "short TX payload read");
            return;
        }
        Err(e) => {
            warn!(%tag, addr = format_args!("{:#x}", desc.addr), error = %e, "TX payload read failed");
            return;
        }
    }

    match dev.port.send_frame(&frame[..len]) {
        Ok(_) => trace!(%tag, idx, len, "TX frame out"),
        // The frame is lost but the doorbell still completes.
        Err(e) => warn!(%tag, len, error = %e, "tap write failed"),
    }
}
