//! The UDP transport proper: one connected socket per tag, a blocking
//! callback loop for host Memory Writes, and the DMA primitives built on
//! MRd/MWr + completions.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::packet::{self, Completion, MemRequest, Tlp, CPL_STATUS_SC};
use crate::{DmaPort, MwrEvent, MwrHandler, Tag, TlpError, MAX_DMA_LEN, TAG_COUNT};

/// Default UDP port of tag 0; tag `n` lives at `PORT_BASE + n`.
pub const PORT_BASE: u16 = 0x3000;

/// Callback-loop poll interval. The stop flag is observed at least this
/// often.
const POLL_INTERVAL_MS: i32 = 250;

/// Large enough for an encapsulated 4-dword header plus a full 4 KiB
/// payload.
const RECV_BUF: usize = 8192;

#[derive(Debug, Clone)]
pub struct NetTlpConfig {
    /// Device-side address of the TLP link.
    pub local: Ipv4Addr,
    /// Adapter-side address of the TLP link.
    pub remote: Ipv4Addr,
    /// PCIe requester id the device stamps on outgoing requests.
    pub requester: u16,
    /// UDP port of tag 0.
    pub port_base: u16,
    /// How long `dma_read` waits for (further) completions.
    pub read_timeout: Duration,
}

impl NetTlpConfig {
    pub fn new(local: Ipv4Addr, remote: Ipv4Addr, requester: u16) -> NetTlpConfig {
        NetTlpConfig {
            local,
            remote,
            requester,
            port_base: PORT_BASE,
            read_timeout: Duration::from_millis(500),
        }
    }
}

struct TagChannel {
    sock: UdpSocket,
    fd: RawFd,
    seq: AtomicU16,
    /// Serializes the send/recv sequence of an in-flight read on this tag.
    read_lock: Mutex<()>,
}

impl TagChannel {
    fn next_seq(&self) -> u16 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

/// The UDP TLP endpoint. All 16 tag channels are bound at construction so
/// a request on any tag is accepted from the first event on.
pub struct NetTlp {
    requester: u16,
    read_timeout: Duration,
    chans: Vec<TagChannel>,
}

impl NetTlp {
    pub fn new(cfg: &NetTlpConfig) -> Result<NetTlp, TlpError> {
        let mut chans = Vec::with_capacity(TAG_COUNT);
        for tag in Tag::all() {
            let port = cfg.port_base + tag.raw() as u16;
            let sock = UdpSocket::bind(SocketAddr::from((cfg.local, port)))?;
            sock.connect(SocketAddr::from((cfg.remote, port)))?;
            let fd = sock.as_raw_fd();
            chans.push(TagChannel {
                sock,
                fd,
                seq: AtomicU16::new(0),
                read_lock: Mutex::new(()),
            });
        }
        debug!(
            local = %cfg.local,
            remote = %cfg.remote,
            port_base = cfg.port_base,
            "bound {TAG_COUNT} tag channels"
        );
        Ok(NetTlp { requester: cfg.requester, read_timeout: cfg.read_timeout, chans })
    }

    fn chan(&self, tag: Tag) -> &TagChannel {
        &self.chans[tag.index()]
    }

    /// Runs the blocking MWr callback loop until `stop` is set.
    ///
    /// Every parseable Memory Write on any tag channel is handed to
    /// `handler` together with this endpoint as its DMA port. Anything else
    /// arriving on the flows is logged and dropped.
    pub fn run(&self, handler: &dyn MwrHandler, stop: &AtomicBool) -> Result<(), TlpError> {
        let mut fds: Vec<libc::pollfd> = self
            .chans
            .iter()
            .map(|c| libc::pollfd { fd: c.fd, events: libc::POLLIN, revents: 0 })
            .collect();
        let mut buf = [0u8; RECV_BUF];

        info!("entering MWr callback loop");
        while !stop.load(Ordering::SeqCst) {
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, POLL_INTERVAL_MS) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            if rc == 0 {
                continue;
            }
            for n in 0..self.chans.len() {
                if fds[n].revents & libc::POLLIN == 0 {
                    continue;
                }
                fds[n].revents = 0;
                let Some(tag) = Tag::new(n as u8) else { continue };
                let len = match self.chans[n].sock.recv(&mut buf) {
                    Ok(len) => len,
                    Err(e) => {
                        warn!(%tag, error = %e, "recv failed on tag channel");
                        continue;
                    }
                };
                let tlp = match packet::parse(&buf[..len]) {
                    Ok((_, tlp)) => tlp,
                    Err(e) => {
                        debug!(%tag, error = %e, "dropping unparseable datagram");
                        continue;
                    }
                };
                match tlp {
                    Tlp::MemWrite { req, payload } => {
                        trace!(%tag, addr = format_args!("{:#x}", req.addr), len = payload.len(), "MWr");
                        handler.on_mwr(self, &MwrEvent { addr: req.addr, payload, tag });
                    }
                    _ => trace!(%tag, "ignoring non-MWr TLP on callback path"),
                }
            }
        }
        info!("MWr callback loop stopped");
        Ok(())
    }
}

impl DmaPort for NetTlp {
    fn dma_read(&self, tag: Tag, addr: u64, buf: &mut [u8]) -> Result<usize, TlpError> {
        let len = buf.len();
        if len == 0 {
            return Err(TlpError::Empty);
        }
        if len > MAX_DMA_LEN {
            return Err(TlpError::TooLong { len, max: MAX_DMA_LEN });
        }
        let ch = self.chan(tag);
        let _read = ch.read_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let req = MemRequest { requester: self.requester, tag: tag.raw(), addr, len };
        ch.sock.send(&packet::build_mrd(ch.next_seq(), &req))?;

        // Completions may be split; gather until we have the request or the
        // timeout lapses. A short count is the caller's problem to judge.
        let mut pkt = [0u8; RECV_BUF];
        let mut got = 0usize;
        let deadline = Instant::now() + self.read_timeout;
        while got < len {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            let n = match recv_timeout(&ch.sock, ch.fd, left, &mut pkt)? {
                Some(n) => n,
                None => break,
            };
            let payload = match packet::parse(&pkt[..n]) {
                Ok((_, Tlp::Completion { cpl, payload })) => {
                    if cpl.tag != tag.raw() {
                        debug!(%tag, cpl_tag = cpl.tag, "completion for a different tag, dropping");
                        continue;
                    }
                    if cpl.status != CPL_STATUS_SC {
                        return Err(TlpError::Completion { status: cpl.status });
                    }
                    payload
                }
                Ok(_) => {
                    trace!(%tag, "non-completion while waiting for read data, dropping");
                    continue;
                }
                Err(e) => {
                    debug!(%tag, error = %e, "dropping unparseable datagram");
                    continue;
                }
            };
            let take = payload.len().min(len - got);
            buf[got..got + take].copy_from_slice(&payload[..take]);
            got += take;
        }
        if got == 0 {
            return Err(TlpError::Timeout);
        }
        Ok(got)
    }

    fn dma_write(&self, tag: Tag, addr: u64, buf: &[u8]) -> Result<usize, TlpError> {
        if buf.is_empty() {
            return Err(TlpError::Empty);
        }
        if buf.len() > MAX_DMA_LEN {
            return Err(TlpError::TooLong { len: buf.len(), max: MAX_DMA_LEN });
        }
        let ch = self.chan(tag);
        let req = MemRequest { requester: self.requester, tag: tag.raw(), addr, len: buf.len() };
        ch.sock.send(&packet::build_mwr(ch.next_seq(), &req, buf))?;
        Ok(buf.len())
    }
}

/// Waits up to `timeout` for a datagram. `Ok(None)` means the timeout
/// lapsed.
fn recv_timeout(
    sock: &UdpSocket,
    fd: RawFd,
    timeout: Duration,
    buf: &mut [u8],
) -> Result<Option<usize>, TlpError> {
    let mut pfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
    let mut left = timeout;
    loop {
        let ms = left.as_millis().min(i32::MAX as u128) as i32;
        let start = Instant::now();
        let rc = unsafe { libc::poll(&mut pfd, 1, ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                left = left.saturating_sub(start.elapsed());
                if left.is_zero() {
                    return Ok(None);
                }
                continue;
            }
            return Err(err.into());
        }
        if rc == 0 || pfd.revents & libc::POLLIN == 0 {
            return Ok(None);
        }
        return Ok(Some(sock.recv(buf)?));
    }
}

/// Completion helpers for test hosts and diagnostics: answer `req` with
/// `data`, splitting at `max_payload` bytes per completion.
pub fn completions_for(req: &MemRequest, completer: u16, data: &[u8], max_payload: usize) -> Vec<Vec<u8>> {
    debug_assert!(max_payload % 4 == 0 && max_payload > 0);
    let mut out = Vec::new();
    let mut sent = 0usize;
    let mut seq = 0u16;
    while sent < data.len() {
        let addr = req.addr + sent as u64;
        // The first completion may start mid-dword; later ones are aligned.
        let head = (addr & 3) as usize;
        let take = (max_payload - head).min(data.len() - sent);
        let cpl = Completion {
            completer,
            requester: req.requester,
            tag: req.tag,
            status: CPL_STATUS_SC,
            byte_count: ((data.len() - sent) & 0xfff) as u16,
            lower_addr: (addr & 0x7f) as u8,
        };
        out.push(packet::build_cpld(seq, &cpl, &data[sent..sent + take]));
        seq = seq.wrapping_add(1);
        sent += take;
    }
    out
}
