//! SIGINT capture for orderly teardown.
//!
//! The handler only flips a flag; the engine loops observe it at the next
//! natural exit of their blocking call and unwind normally, releasing
//! sockets and buffers on the way out.

use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Install the SIGINT handler. Call once at startup.
pub fn install() -> anyhow::Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_sigint as usize;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut()) != 0 {
            anyhow::bail!("capture of SIGINT failed: {}", std::io::Error::last_os_error());
        }
    }
    Ok(())
}

pub fn requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

#[cfg(test)]
pub fn reset() {
    SHUTDOWN.store(false, Ordering::SeqCst);
}

#[cfg(test)]
pub fn trigger() {
    SHUTDOWN.store(true, Ordering::SeqCst);
}
