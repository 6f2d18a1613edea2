//! UDP-encapsulated TLP transport.
//!
//! The emulated device talks PCIe with its host over UDP: the adapter on
//! the host side forwards Memory Write TLPs addressed at the device and
//! accepts Memory Read / Memory Write TLPs aimed back at host memory. Each
//! 4-bit PCIe tag gets its own UDP flow at `port_base + tag`, so up to 16
//! transactions can be outstanding at once and completions always arrive on
//! the flow of the request they answer.
//!
//! The device core does not use this implementation directly; it is written
//! against the [`DmaPort`] and [`MwrHandler`] seams so tests can substitute
//! an in-memory host.

pub mod packet;

mod net;

pub use net::{completions_for, NetTlp, NetTlpConfig, PORT_BASE};

/// Number of PCIe tags (and UDP flows) the transport services.
pub const TAG_COUNT: usize = 16;

/// Largest DMA transfer a single request may carry, in bytes.
///
/// 1024 dwords, the maximum a TLP length field can express.
pub const MAX_DMA_LEN: usize = 4096;

/// A 4-bit PCIe transaction tag.
///
/// Every MWr event carries the tag of the flow it arrived on; DMA issued
/// while servicing that event must go out on the same tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(u8);

impl Tag {
    pub const ZERO: Tag = Tag(0);

    pub fn new(n: u8) -> Option<Tag> {
        ((n as usize) < TAG_COUNT).then_some(Tag(n))
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn raw(self) -> u8 {
        self.0
    }

    pub fn all() -> impl Iterator<Item = Tag> {
        (0..TAG_COUNT as u8).map(Tag)
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// One host Memory Write delivered by the callback loop.
#[derive(Debug)]
pub struct MwrEvent<'a> {
    /// Byte-precise target address (dword address plus first-byte-enable
    /// offset).
    pub addr: u64,
    /// The written bytes.
    pub payload: &'a [u8],
    /// Tag of the flow the write arrived on.
    pub tag: Tag,
}

/// DMA primitives into host memory.
///
/// Implementations are shared between the callback thread and the tap
/// reader, so everything takes `&self`.
pub trait DmaPort: Send + Sync {
    /// Reads `buf.len()` bytes of host memory at `addr`.
    ///
    /// Returns the number of bytes actually gathered; callers treat a short
    /// count the same as an error.
    fn dma_read(&self, tag: Tag, addr: u64, buf: &mut [u8]) -> Result<usize, TlpError>;

    /// Posts `buf` to host memory at `addr`. Posted writes have no
    /// completion; success means the write left the device.
    fn dma_write(&self, tag: Tag, addr: u64, buf: &[u8]) -> Result<usize, TlpError>;
}

/// Receiver of host Memory Writes.
pub trait MwrHandler: Send + Sync {
    /// Called by the transport loop for every MWr. `dma` issues requests on
    /// the event's tag; the callback may block on them.
    fn on_mwr(&self, dma: &dyn DmaPort, ev: &MwrEvent<'_>);
}

#[derive(Debug, thiserror::Error)]
pub enum TlpError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out waiting for completion")]
    Timeout,
    #[error("completion returned status {status:#x}")]
    Completion { status: u8 },
    #[error("malformed TLP: {0}")]
    Malformed(&'static str),
    #[error("dma length {len} exceeds the {max}-byte transfer limit")]
    TooLong { len: usize, max: usize },
    #[error("zero-length dma")]
    Empty,
}
