//! Background cleanup for a [`Pool`](super::Pool).
//!
//! The reaper wakes every `cleanup_interval`, closes idle sockets that
//! outlived `idle_timeout` and forgets busy entries whose socket was
//! disposed while on loan. It only holds a weak reference, so a pool
//! that is no longer referenced anywhere is torn down normally.

use super::Shared;
use std::io;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace};

/// Handle to the running reaper. Dropping it stops the thread.
#[derive(Debug)]
pub(crate) struct Reaper {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    pub(crate) fn start(shared: Weak<Shared>) -> io::Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel();

        let handle = thread::Builder::new()
            .name("textwire-reaper".to_string())
            .spawn(move || loop {
                let interval = match shared.upgrade() {
                    Some(shared) => shared.cleanup_interval(),
                    None => return,
                };

                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        debug!("Pool reaper stopping");
                        return;
                    }
                }

                let Some(shared) = shared.upgrade() else {
                    return;
                };
                let closed = shared.reap();
                if closed > 0 {
                    debug!(endpoint = shared.endpoint(), closed, "Reaped idle sockets");
                } else {
                    trace!(endpoint = shared.endpoint(), "Reaper pass found nothing");
                }
            })?;

        Ok(Self {
            stop_tx,
            handle: Some(handle),
        })
    }

    pub(crate) fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            // The last strong reference may be released on the reaper thread itself.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.halt();
    }
}
