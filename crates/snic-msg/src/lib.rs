//! Out-of-band bootstrap client.
//!
//! The device learns three host-side facts before it can service anything:
//! the physical base of BAR4, its own PCI device id, and the MSI-X vector
//! table. Each is a single UDP request/reply exchange against the host's
//! message responder (port 12287): the request is one 32-bit selector, the
//! reply the raw payload. There are no retries; a failed query is fatal to
//! startup and the caller exits.

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use tracing::debug;

use snic_proto::msix::{self, MsixEntry, TABLE_LEN};
use snic_proto::oob;

pub use snic_proto::oob::MSG_PORT;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Reply buffer; the largest reply is the 192-byte vector table.
const REPLY_BUF: usize = 512;

/// Which selector numbering the responder speaks.
///
/// Current numbering: 1 = BAR4 base, 2 = device id, 3 = MSI-X table.
/// Legacy responders have no device-id query and put the MSI-X table at 2;
/// with those, the device id must come from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorScheme {
    Current,
    Legacy,
}

#[derive(Debug, thiserror::Error)]
pub enum MsgError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("no reply from the message responder")]
    Timeout,
    #[error("short {query} reply: {len} bytes")]
    ShortReply { query: &'static str, len: usize },
    #[error("MSI-X table reply holds fewer than {TABLE_LEN} entries ({len} bytes)")]
    ShortMsixTable { len: usize },
    #[error("the legacy responder has no {query} query")]
    Unsupported { query: &'static str },
}

pub struct MsgClient {
    sock: UdpSocket,
    scheme: SelectorScheme,
}

impl MsgClient {
    /// Connects to the responder at `server` (normally `host:12287`).
    pub fn connect(server: SocketAddr, scheme: SelectorScheme) -> Result<MsgClient, MsgError> {
        let sock = UdpSocket::bind(("0.0.0.0", 0))?;
        sock.connect(server)?;
        sock.set_read_timeout(Some(DEFAULT_TIMEOUT))?;
        Ok(MsgClient { sock, scheme })
    }

    pub fn set_timeout(&self, timeout: Duration) -> Result<(), MsgError> {
        self.sock.set_read_timeout(Some(timeout))?;
        Ok(())
    }

    fn exchange(&self, sel: i32, reply: &mut [u8]) -> Result<usize, MsgError> {
        self.sock.send(&oob::encode_selector(sel))?;
        match self.sock.recv(reply) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                Err(MsgError::Timeout)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Queries the physical base address of BAR4.
    pub fn bar4_base(&self) -> Result<u64, MsgError> {
        let mut reply = [0u8; REPLY_BUF];
        let n = self.exchange(oob::SEL_BAR4_BASE, &mut reply)?;
        let base = oob::decode_bar4_base(&reply[..n])
            .ok_or(MsgError::ShortReply { query: "BAR4 base", len: n })?;
        debug!(base = format_args!("{base:#x}"), "BAR4 base");
        Ok(base)
    }

    /// Queries the PCI device id (`bus << 8 | devfn`).
    pub fn device_id(&self) -> Result<u16, MsgError> {
        if self.scheme == SelectorScheme::Legacy {
            return Err(MsgError::Unsupported { query: "device id" });
        }
        let mut reply = [0u8; REPLY_BUF];
        let n = self.exchange(oob::SEL_DEVICE_ID, &mut reply)?;
        let id = oob::decode_device_id(&reply[..n])
            .ok_or(MsgError::ShortReply { query: "device id", len: n })?;
        debug!(id = format_args!("{id:04x}"), "device id");
        Ok(id)
    }

    /// Queries the full 16-entry MSI-X vector table.
    ///
    /// A reply holding fewer entries is an error even when it covers the
    /// two vectors the device uses.
    pub fn msix_table(&self) -> Result<[MsixEntry; TABLE_LEN], MsgError> {
        let sel = match self.scheme {
            SelectorScheme::Current => oob::SEL_MSIX_TABLE,
            SelectorScheme::Legacy => oob::SEL_LEGACY_MSIX_TABLE,
        };
        let mut reply = [0u8; REPLY_BUF];
        let n = self.exchange(sel, &mut reply)?;
        let table = msix::decode_table(&reply[..n]).ok_or(MsgError::ShortMsixTable { len: n })?;
        debug!(
            tx_addr = format_args!("{:#x}", table[0].addr),
            rx_addr = format_args!("{:#x}", table[1].addr),
            "MSI-X table"
        );
        Ok(table)
    }
}
