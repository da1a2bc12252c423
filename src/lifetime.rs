//! Cancellation source for background workers.

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Inner {
    /// Dropped on cancel, which disconnects every `done` receiver.
    cancel: Mutex<Option<Sender<()>>>,
    done: Receiver<()>,
    cancelled: AtomicBool,
}

/// A clonable, cancel-once lifetime.
///
/// Workers select on [`Lifetime::done`]; the channel never carries a value
/// and becomes disconnected (ready) once [`Lifetime::cancel`] is called.
#[derive(Clone)]
pub struct Lifetime {
    inner: Arc<Inner>,
}

impl Lifetime {
    pub fn new() -> Self {
        let (sender, receiver) = bounded(0);
        Self {
            inner: Arc::new(Inner {
                cancel: Mutex::new(Some(sender)),
                done: receiver,
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    /// Cancel the lifetime. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.cancel.lock().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Receiver that becomes ready (disconnected) on cancel.
    pub fn done(&self) -> Receiver<()> {
        self.inner.done.clone()
    }
}

impl Default for Lifetime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Lifetime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifetime")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
