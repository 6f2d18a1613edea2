//! In-memory stand-ins for the two seams of the core: a fake host memory
//! behind `DmaPort` that records every DMA in order, and a channel-backed
//! `L2Port`.

#![allow(dead_code)]

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use snic_device::{SnicConfig, SnicDevice};
use snic_proto::msix::MsixEntry;
use snic_proto::ring::Descriptor;
use snic_tap::{L2Port, TapError};
use snic_tlp::{DmaPort, MwrEvent, MwrHandler, Tag, TlpError};

pub const BAR4: u64 = 0x4000_0000;
pub const TX_IRQ: MsixEntry = MsixEntry { addr: 0xfee0_1000, data: 0x41 };
pub const RX_IRQ: MsixEntry = MsixEntry { addr: 0xfee0_2000, data: 0x42 };

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DmaOp {
    Read { tag: u8, addr: u64, len: usize },
    Write { tag: u8, addr: u64, bytes: Vec<u8> },
}

/// Host memory plus an ordered DMA log. Writes outside the backing vector
/// (interrupt doorbells at APIC-like addresses) are logged but not
/// applied.
pub struct FakeHost {
    mem: Mutex<Vec<u8>>,
    ops: Mutex<Vec<DmaOp>>,
    pub fail_reads: AtomicBool,
}

impl FakeHost {
    pub fn new(size: usize) -> Arc<FakeHost> {
        Arc::new(FakeHost {
            mem: Mutex::new(vec![0u8; size]),
            ops: Mutex::new(Vec::new()),
            fail_reads: AtomicBool::new(false),
        })
    }

    pub fn write_mem(&self, addr: u64, bytes: &[u8]) {
        let addr = addr as usize;
        self.mem.lock().unwrap()[addr..addr + bytes.len()].copy_from_slice(bytes);
    }

    pub fn read_mem(&self, addr: u64, len: usize) -> Vec<u8> {
        let addr = addr as usize;
        self.mem.lock().unwrap()[addr..addr + len].to_vec()
    }

    pub fn ops(&self) -> Vec<DmaOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<DmaOp> {
        self.ops()
            .into_iter()
            .filter(|op| matches!(op, DmaOp::Write { .. }))
            .collect()
    }
}

impl DmaPort for FakeHost {
    fn dma_read(&self, tag: Tag, addr: u64, buf: &mut [u8]) -> Result<usize, TlpError> {
        self.ops.lock().unwrap().push(DmaOp::Read {
            tag: tag.raw(),
            addr,
            len: buf.len(),
        });
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(TlpError::Timeout);
        }
        let mem = self.mem.lock().unwrap();
        let a = addr as usize;
        buf.copy_from_slice(&mem[a..a + buf.len()]);
        Ok(buf.len())
    }

    fn dma_write(&self, tag: Tag, addr: u64, buf: &[u8]) -> Result<usize, TlpError> {
        self.ops.lock().unwrap().push(DmaOp::Write {
            tag: tag.raw(),
            addr,
            bytes: buf.to_vec(),
        });
        let mut mem = self.mem.lock().unwrap();
        let a = addr as usize;
        if a + buf.len() <= mem.len() {
            mem[a..a + buf.len()].copy_from_slice(buf);
        }
        Ok(buf.len())
    }
}

/// Channel-fed frame port: injected frames surface in `poll_recv`, frames
/// the device sends are recorded.
pub struct FakePort {
    sent: Mutex<Vec<Vec<u8>>>,
    rx: Mutex<Receiver<Vec<u8>>>,
    pub fail_sends: AtomicBool,
}

impl FakePort {
    pub fn new() -> (Arc<FakePort>, Sender<Vec<u8>>) {
        let (inject, rx) = channel();
        (
            Arc::new(FakePort {
                sent: Mutex::new(Vec::new()),
                rx: Mutex::new(rx),
                fail_sends: AtomicBool::new(false),
            }),
            inject,
        )
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }
}

impl L2Port for FakePort {
    fn send_frame(&self, frame: &[u8]) -> Result<usize, TapError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TapError::ShortWrite {
                written: frame.len() / 2,
                len: frame.len(),
            });
        }
        self.sent.lock().unwrap().push(frame.to_vec());
        Ok(frame.len())
    }

    fn poll_recv(&self, timeout_ms: i32, buf: &mut [u8]) -> Result<usize, TapError> {
        let rx = self.rx.lock().unwrap();
        match rx.recv_timeout(Duration::from_millis(timeout_ms.max(0) as u64)) {
            Ok(frame) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            Err(_) => Ok(0),
        }
    }
}

pub fn device(port: Arc<dyn L2Port>) -> Arc<SnicDevice> {
    device_at(BAR4, port)
}

pub fn device_at(bar4_base: u64, port: Arc<dyn L2Port>) -> Arc<SnicDevice> {
    Arc::new(SnicDevice::new(
        SnicConfig {
            bar4_base,
            tx_irq: TX_IRQ,
            rx_irq: RX_IRQ,
        },
        port,
    ))
}

/// Synthesizes one host MWr event on `tag`.
pub fn mwr(dev: &SnicDevice, dma: &dyn DmaPort, tag: u8, addr: u64, payload: &[u8]) {
    let ev = MwrEvent {
        addr,
        payload,
        tag: Tag::new(tag).expect("tag"),
    };
    dev.on_mwr(dma, &ev);
}

pub fn desc_bytes(addr: u64, length: u64) -> [u8; 16] {
    Descriptor { addr, length }.encode()
}

pub fn wait_until(mut ready: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !ready() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}
