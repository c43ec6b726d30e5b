//! Signal handling: signals are blocked in every thread and collected by a
//! dedicated thread with `sigwait`, which turns them into messages on a
//! channel the main loop can select over.

use flume::Receiver;

use crate::error::{BridgeError, Result};

/// Block SIGTERM/SIGINT/SIGHUP process-wide and spawn the collector
/// thread. Must be called before any other thread starts so they all
/// inherit the mask.
pub fn spawn_signal_listener() -> Result<Receiver<i32>> {
    let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGTERM);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGHUP);
        if libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) != 0 {
            return Err(BridgeError::config("cannot set signal mask"));
        }
    }

    let (tx, rx) = flume::bounded(4);
    std::thread::Builder::new()
        .name("signals".into())
        .spawn(move || loop {
            let mut signal: libc::c_int = 0;
            let rc = unsafe { libc::sigwait(&set, &mut signal) };
            if rc != 0 {
                log::error!("sigwait failed with {rc}");
                break;
            }
            if tx.send(signal).is_err() {
                break;
            }
        })
        .map_err(|e| BridgeError::config(format!("cannot spawn signal thread: {e}")))?;

    Ok(rx)
}
