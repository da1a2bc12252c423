//! Orchestrator tying storage and live handlers together.

use crate::config::ChangefeedConfig;
use crate::error::Result;
use crate::handlers::{HandlerId, HandlerRegistry, DEFAULT_QUEUE_CAPACITY};
use crate::lifetime::Lifetime;
use crate::meta::{open_meta, Meta};
use crate::types::{Change, ChangeInput, ChangeSearch};
use std::sync::Arc;

/// The change feed.
///
/// Provides a unified interface for:
/// - Writing changes and fanning them out to registrations
/// - Reading and acknowledging a registration's pending changes
/// - Live, best-effort broadcast to in-process handlers
///
/// Two sequences span more than one storage call and are not compensated:
/// a change whose fan-out fails stays stored, and acknowledged changes whose
/// delete fails stay stored unreferenced. Both failures are logged and
/// returned to the caller. Acknowledging again does not retry the prune: the
/// second call removes no association, so it reports nothing to delete. Only
/// [`Logic::changes_delete`] removes such a change.
pub struct Logic {
    /// Persistent state.
    meta: Arc<dyn Meta>,

    /// Ephemeral consumers.
    handlers: HandlerRegistry,

    /// Cancelled by [`Logic::shutdown`].
    lifetime: Lifetime,
}

impl Logic {
    /// Create an orchestrator over a storage backend.
    pub fn new(meta: Arc<dyn Meta>) -> Self {
        Self::with_lifetime(meta, DEFAULT_QUEUE_CAPACITY, Lifetime::new())
    }

    /// Create an orchestrator whose workers stop when `lifetime` is cancelled.
    pub fn with_lifetime(meta: Arc<dyn Meta>, queue_capacity: usize, lifetime: Lifetime) -> Self {
        Self {
            meta,
            handlers: HandlerRegistry::new(queue_capacity, lifetime.clone()),
            lifetime,
        }
    }

    /// Open the configured backend and build an orchestrator on it.
    pub fn open(config: &ChangefeedConfig) -> Result<Self> {
        config.validate()?;
        let meta = open_meta(&config.meta)?;
        Ok(Self::with_lifetime(
            meta,
            config.handler_queue_capacity,
            Lifetime::new(),
        ))
    }

    /// The underlying storage backend.
    pub fn meta(&self) -> &Arc<dyn Meta> {
        &self.meta
    }

    /// The orchestrator's lifetime.
    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }

    // --- Change Operations ---

    /// Store a change, fan it out to every registration, then broadcast it.
    pub fn change_upsert(&self, input: ChangeInput) -> Result<Change> {
        let change = self.meta.change_create(input)?;

        if let Err(e) = self.meta.registration_change_upsert(&change.id) {
            tracing::error!("Change {} stored but fan-out failed: {}", change.id, e);
            return Err(e);
        }

        tracing::debug!(
            "Upserted change {} ({} {} {} v{})",
            change.id,
            change.data_service_name,
            change.data_id,
            change.data_action,
            change.data_version
        );

        self.handlers.broadcast(&change);
        Ok(change)
    }

    /// Get a change by ID.
    pub fn change_read(&self, id: &str) -> Result<Change> {
        self.meta.change_read(id)
    }

    /// Read changes matching a search.
    ///
    /// An unconstrained search returns every stored change.
    pub fn changes_read(&self, search: &ChangeSearch) -> Result<Vec<Change>> {
        self.meta.changes_read(search)
    }

    /// Delete unreferenced changes.
    pub fn changes_delete(&self, ids: &[String]) -> Result<()> {
        self.meta.changes_delete(ids)
    }

    // --- Registration Operations ---

    pub fn registration_upsert(&self, id: &str) -> Result<()> {
        self.meta.registration_upsert(id)?;
        tracing::debug!("Upserted registration {}", id);
        Ok(())
    }

    pub fn registration_delete(&self, id: &str) -> Result<()> {
        self.meta.registration_delete(id)?;
        tracing::debug!("Deleted registration {}", id);
        Ok(())
    }

    /// Changes still pending for a registration.
    pub fn registration_changes_read(&self, registration_id: &str) -> Result<Vec<Change>> {
        let ids = self.meta.registration_changes_read(registration_id)?;
        // An empty id search would match every change
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.meta.changes_read(&ChangeSearch::ids(ids))
    }

    /// Acknowledge changes for a registration and prune those nobody else
    /// is waiting for.
    pub fn registration_change_acknowledge(
        &self,
        registration_id: &str,
        change_ids: &[String],
    ) -> Result<()> {
        let prunable = self
            .meta
            .registration_change_acknowledge(registration_id, change_ids)?;
        if prunable.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.meta.changes_delete(&prunable) {
            tracing::error!(
                "Registration {} acknowledged {} changes but pruning failed: {}",
                registration_id,
                prunable.len(),
                e
            );
            return Err(e);
        }

        tracing::debug!(
            "Registration {} acknowledged changes, pruned {}",
            registration_id,
            prunable.len()
        );
        Ok(())
    }

    // --- Live Handlers ---

    /// Register a live handler; `handle` runs on its own worker thread.
    pub fn handler_create<F>(&self, handle: F) -> Result<HandlerId>
    where
        F: FnMut(Change) + Send + 'static,
    {
        self.handlers.create(handle)
    }

    /// Stop and remove a live handler.
    pub fn handler_delete(&self, id: HandlerId) -> Result<()> {
        self.handlers.delete(id)
    }

    /// Get live handler count.
    pub fn handler_count(&self) -> usize {
        self.handlers.handler_count()
    }

    /// Cancel the lifetime and stop every live handler.
    ///
    /// Blocks until all workers have exited. Storage operations keep working.
    pub fn shutdown(&self) {
        if !self.lifetime.is_cancelled() {
            tracing::info!("Shutting down change feed ({} live handlers)", self.handler_count());
        }
        self.lifetime.cancel();
        self.handlers.delete_all();
    }
}

impl Drop for Logic {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChangeError;
    use crate::meta::MemoryMeta;
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    fn test_logic() -> Logic {
        Logic::new(Arc::new(MemoryMeta::new()))
    }

    #[test]
    fn test_upsert_fans_out() {
        let logic = test_logic();
        logic.registration_upsert("r1").unwrap();

        let change = logic.change_upsert(ChangeInput::new("d1")).unwrap();
        assert_eq!(logic.registration_changes_read("r1").unwrap(), vec![change]);
    }

    #[test]
    fn test_empty_pending_returns_nothing() {
        let logic = test_logic();
        // Stored changes must not leak through an empty pending set
        logic.change_upsert(ChangeInput::new("d1")).unwrap();
        logic.registration_upsert("r1").unwrap();

        assert!(logic.registration_changes_read("r1").unwrap().is_empty());
    }

    #[test]
    fn test_acknowledge_prunes() {
        let logic = test_logic();
        logic.registration_upsert("r1").unwrap();
        let change = logic.change_upsert(ChangeInput::new("d1")).unwrap();

        logic
            .registration_change_acknowledge("r1", &[change.id.clone()])
            .unwrap();
        assert!(matches!(
            logic.change_read(&change.id),
            Err(ChangeError::ChangeNotFound(_))
        ));
    }

    #[test]
    fn test_upsert_broadcasts_to_handlers() {
        let logic = test_logic();
        let (tx, rx) = unbounded();
        logic
            .handler_create(move |change| {
                let _ = tx.send(change);
            })
            .unwrap();

        let change = logic.change_upsert(ChangeInput::new("d1")).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), change);
    }

    #[test]
    fn test_conflict_is_not_broadcast() {
        let logic = test_logic();
        let (tx, rx) = unbounded();
        logic
            .handler_create(move |change| {
                let _ = tx.send(change);
            })
            .unwrap();

        logic.change_upsert(ChangeInput::new("d1")).unwrap();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();

        let err = logic.change_upsert(ChangeInput::new("d1")).unwrap_err();
        assert!(err.is_conflict());
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_shutdown_stops_handlers() {
        let logic = test_logic();
        logic.handler_create(|_| {}).unwrap();
        logic.handler_create(|_| {}).unwrap();

        logic.shutdown();
        assert_eq!(logic.handler_count(), 0);
        assert!(matches!(logic.handler_create(|_| {}), Err(ChangeError::ShutDown)));

        // Storage outlives the live path
        logic.change_upsert(ChangeInput::new("d1")).unwrap();
    }
}
