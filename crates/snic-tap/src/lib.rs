//! Layer-2 tap adapter.
//!
//! The emulated NIC's traffic surfaces on a local tap interface: TX frames
//! from the host are written to it, frames read from it become RX traffic
//! back into host memory. The device side only ever needs three
//! operations, captured by [`L2Port`] so the engines can be driven by an
//! in-memory port in tests.
//!
//! Creating a tap requires `/dev/net/tun` and `CAP_NET_ADMIN`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;

use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum TapError {
    #[error("open /dev/net/tun: {0}")]
    Open(#[source] std::io::Error),
    #[error("ioctl {op}: {source}")]
    Ioctl {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("interface name {0:?} does not fit IFNAMSIZ")]
    NameTooLong(String),
    #[error("short frame write: {written} of {len} bytes")]
    ShortWrite { written: usize, len: usize },
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// The frame-level surface the TX and RX engines program against.
pub trait L2Port: Send + Sync {
    /// Injects one ethernet frame. Short writes are errors.
    fn send_frame(&self, frame: &[u8]) -> Result<usize, TapError>;

    /// Waits up to `timeout_ms` for a frame and reads it into `buf`.
    /// Returns the frame length, or 0 when the timeout lapsed with no
    /// data.
    fn poll_recv(&self, timeout_ms: i32, buf: &mut [u8]) -> Result<usize, TapError>;
}

/// A tap interface, created with no packet-info prefix and brought
/// administratively up.
#[derive(Debug)]
pub struct Tap {
    file: File,
    name: String,
}

impl Tap {
    pub fn open(name: &str) -> Result<Tap, TapError> {
        // One byte must remain for the terminator.
        if name.len() >= libc::IFNAMSIZ {
            return Err(TapError::NameTooLong(name.to_string()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")
            .map_err(TapError::Open)?;

        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        for (dst, src) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
            *dst = *src as libc::c_char;
        }
        ifr.ifr_ifru.ifru_flags = (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short;
        // The kernel writes the assigned name back through the ifreq.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), libc::TUNSETIFF, &mut ifr) };
        if rc < 0 {
            return Err(TapError::Ioctl {
                op: "TUNSETIFF",
                source: std::io::Error::last_os_error(),
            });
        }

        link_up(&ifr)?;
        debug!(name, "tap ready");
        Ok(Tap { file, name: name.to_string() })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Marks the interface administratively up, via a throwaway AF_INET
/// datagram socket as the flags ioctl requires.
fn link_up(tap_ifr: &libc::ifreq) -> Result<(), TapError> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(TapError::Ioctl {
            op: "socket",
            source: std::io::Error::last_os_error(),
        });
    }

    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    ifr.ifr_name = tap_ifr.ifr_name;
    ifr.ifr_ifru.ifru_flags = libc::IFF_UP as libc::c_short;
    let rc = unsafe { libc::ioctl(fd, libc::SIOCSIFFLAGS, &ifr) };
    let err = std::io::Error::last_os_error();
    unsafe { libc::close(fd) };
    if rc < 0 {
        return Err(TapError::Ioctl { op: "SIOCSIFFLAGS", source: err });
    }
    Ok(())
}

impl L2Port for Tap {
    fn send_frame(&self, frame: &[u8]) -> Result<usize, TapError> {
        let written = (&self.file).write(frame)?;
        if written != frame.len() {
            return Err(TapError::ShortWrite { written, len: frame.len() });
        }
        Ok(written)
    }

    fn poll_recv(&self, timeout_ms: i32, buf: &mut [u8]) -> Result<usize, TapError> {
        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            // A signal lands here first on shutdown; the caller rechecks
            // its stop flag on the empty return.
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err.into());
        }
        if rc == 0 || pfd.revents & libc::POLLIN == 0 {
            return Ok(0);
        }
        Ok((&self.file).read(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlong_names_are_rejected_before_touching_the_kernel() {
        let err = Tap::open("a-name-well-past-ifnamsiz").expect_err("must fail");
        assert!(matches!(err, TapError::NameTooLong(_)));
    }
}
