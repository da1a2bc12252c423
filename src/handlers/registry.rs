//! Handler registry with one worker thread per live handler.

use super::types::HandlerId;
use crate::error::{ChangeError, Result};
use crate::lifetime::Lifetime;
use crate::types::Change;
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

/// Default number of queued changes per live handler.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Internal handler state.
struct LiveHandler {
    queue: Sender<Change>,
    /// Dropping this stops the worker.
    stop: Sender<()>,
    worker: JoinHandle<()>,
}

impl LiveHandler {
    /// Stop the worker and wait for it to exit.
    ///
    /// Queued changes that were not yet handled are discarded.
    fn stop(self, id: HandlerId) {
        let LiveHandler {
            queue,
            stop,
            worker,
        } = self;
        drop(stop);
        drop(queue);

        // A callback deleting its own handler must not join itself
        if worker.thread().id() == thread::current().id() {
            return;
        }
        if worker.join().is_err() {
            tracing::error!("Live handler {} worker panicked", id);
        }
    }
}

/// Owns the live handlers of one orchestrator.
pub struct HandlerRegistry {
    /// Active handlers by ID.
    handlers: RwLock<HashMap<HandlerId, LiveHandler>>,
    /// Counter for generating handler IDs.
    next_id: AtomicU64,
    /// Queue capacity for new handlers.
    capacity: usize,
    /// Cancels every worker at once.
    lifetime: Lifetime,
}

impl HandlerRegistry {
    /// Create a registry whose workers stop when `lifetime` is cancelled.
    pub fn new(capacity: usize, lifetime: Lifetime) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            lifetime,
        }
    }

    /// Register a live handler and start its worker.
    ///
    /// `handle` is called on the worker thread once per queued change, in
    /// queue order.
    pub fn create<F>(&self, handle: F) -> Result<HandlerId>
    where
        F: FnMut(Change) + Send + 'static,
    {
        if self.lifetime.is_cancelled() {
            return Err(ChangeError::ShutDown);
        }

        let id = HandlerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (queue, receiver) = bounded(self.capacity);
        let (stop, stopped) = bounded(0);
        let done = self.lifetime.done();

        let worker = thread::Builder::new()
            .name(format!("changefeed-{}", id))
            .spawn(move || run_worker(id, receiver, stopped, done, handle))?;

        let handler = LiveHandler {
            queue,
            stop,
            worker,
        };

        {
            let mut handlers = self.handlers.write();
            // Shutdown may have drained the map since the check above
            if !self.lifetime.is_cancelled() {
                handlers.insert(id, handler);
                tracing::debug!("Created live handler {}", id);
                return Ok(id);
            }
        }

        handler.stop(id);
        Err(ChangeError::ShutDown)
    }

    /// Stop a handler's worker, discard its queue and forget it.
    ///
    /// Blocks until the worker has exited, unless called from that worker.
    pub fn delete(&self, id: HandlerId) -> Result<()> {
        let handler = self
            .handlers
            .write()
            .remove(&id)
            .ok_or(ChangeError::HandlerNotFound(id))?;

        handler.stop(id);
        tracing::debug!("Deleted live handler {}", id);
        Ok(())
    }

    /// Stop and remove every handler.
    pub fn delete_all(&self) {
        let drained: Vec<(HandlerId, LiveHandler)> = self.handlers.write().drain().collect();
        for (id, handler) in drained {
            handler.stop(id);
        }
    }

    /// Get handler count.
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Offer a change to every live handler without blocking.
    ///
    /// A handler whose queue is full misses this change.
    pub fn broadcast(&self, change: &Change) {
        let handlers = self.handlers.read();
        for (id, handler) in handlers.iter() {
            match handler.queue.try_send(change.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::trace!("Live handler {} queue full, dropped change {}", id, change.id);
                }
                Err(TrySendError::Disconnected(_)) => {
                    tracing::trace!("Live handler {} stopped, dropped change {}", id, change.id);
                }
            }
        }
    }
}

fn run_worker<F>(
    id: HandlerId,
    queue: Receiver<Change>,
    stop: Receiver<()>,
    done: Receiver<()>,
    mut handle: F,
) where
    F: FnMut(Change),
{
    loop {
        select! {
            recv(stop) -> _ => break,
            recv(done) -> _ => break,
            recv(queue) -> msg => match msg {
                Ok(change) => {
                    tracing::trace!("Live handler {} handling change {}", id, change.id);
                    handle(change);
                }
                Err(_) => break,
            },
        }
    }
    tracing::trace!("Live handler {} worker exited", id);
}

impl Drop for HandlerRegistry {
    fn drop(&mut self) {
        self.delete_all();
    }
}
