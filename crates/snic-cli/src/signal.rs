//! SIGINT handling.
//!
//! The handler does the one async-signal-safe thing: it flips the
//! process-wide `caught_signal` flag. The transport loop and the tap
//! reader observe the flag between poll intervals, and the interrupted
//! poll returns immediately with EINTR, so shutdown does not wait out a
//! timeout.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

/// The only process-wide mutable state in the program.
static CAUGHT_SIGNAL: AtomicBool = AtomicBool::new(false);

pub fn caught() -> &'static AtomicBool {
    &CAUGHT_SIGNAL
}

extern "C" fn on_signal(_sig: libc::c_int) {
    CAUGHT_SIGNAL.store(true, Ordering::SeqCst);
}

pub fn install() -> io::Result<()> {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        let handler: extern "C" fn(libc::c_int) = on_signal;
        sa.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        // Deliberately no SA_RESTART: poll must come back with EINTR.
        sa.sa_flags = 0;
        if libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
