//! Main-thread dispatch queue.
//!
//! The only safe hand-off from background threads into the host. Producers hold a
//! cloneable [`DispatchQueue`]; the host owns the single [`MainThreadDrain`] and calls
//! [`MainThreadDrain::drain_once`] from its per-tick hook.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use tokio::sync::mpsc::{self, error::TryRecvError};

/// A deferred zero-argument callback.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Producer side: thread-safe, unbounded, never drops entries.
#[derive(Clone)]
pub struct DispatchQueue {
    tx: mpsc::UnboundedSender<Callback>,
}

/// Consumer side, owned by the host thread.
pub struct MainThreadDrain {
    rx: mpsc::UnboundedReceiver<Callback>,
}

impl DispatchQueue {
    /// Create a queue and the drain the host thread will own.
    pub fn new() -> (Self, MainThreadDrain) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, MainThreadDrain { rx })
    }

    /// Append a callback to run on the host thread.
    ///
    /// Returns false only when the drain has been dropped (the host has shut down).
    pub fn enqueue(&self, callback: impl FnOnce() + Send + 'static) -> bool {
        if self.tx.send(Box::new(callback)).is_err() {
            tracing::debug!("Dispatch drain dropped, discarding callback");
            return false;
        }
        true
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}

impl MainThreadDrain {
    /// Run queued callbacks in FIFO order until the queue is empty.
    ///
    /// Callbacks enqueued while draining also run in this call. A panicking callback is
    /// logged and skipped. Returns the number of callbacks invoked.
    pub fn drain_once(&mut self) -> usize {
        let mut invoked = 0;
        loop {
            let callback = match self.rx.try_recv() {
                Ok(callback) => callback,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            };
            invoked += 1;
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
                tracing::error!(
                    "Dispatch callback panicked: {}",
                    panic_message(payload.as_ref())
                );
            }
        }
        invoked
    }

    /// Whether anything is waiting to run.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
