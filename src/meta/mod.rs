//! Storage contract for changes and registrations.
//!
//! Three interchangeable backends implement [`Meta`] with identical
//! observable semantics:
//! - [`MemoryMeta`]: maps guarded by two locks (changes, then registrations)
//! - [`FileMeta`]: `MemoryMeta` plus a full snapshot rewrite after each mutation
//! - [`SqlMeta`]: SQLite tables, conflict tuple enforced by a unique index
//!
//! A change is fanned out at write time to every registration that exists
//! at that instant, and stays until each of those registrations has
//! acknowledged it.
//!
//! # Example
//!
//! ```ignore
//! let meta = open_meta(&MetaConfig::Memory)?;
//!
//! meta.registration_upsert("billing")?;
//! let change = meta.change_create(ChangeInput::new("timer-1").with_action("start"))?;
//! meta.registration_change_upsert(&change.id)?;
//!
//! let pending = meta.registration_changes_read("billing")?;
//! let prunable = meta.registration_change_acknowledge("billing", &pending)?;
//! meta.changes_delete(&prunable)?;
//! ```

mod file;
mod memory;
#[cfg(feature = "sqlite")]
mod sql;

pub use file::FileMeta;
pub use memory::MemoryMeta;
#[cfg(feature = "sqlite")]
pub use sql::SqlMeta;

use crate::config::MetaConfig;
use crate::error::{ChangeError, Result};
use crate::types::{Change, ChangeInput, ChangeSearch};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Persistence contract shared by all backends.
pub trait Meta: Send + Sync {
    /// Create a change, assigning it a new id.
    ///
    /// Fails with `NotWritten` when `data_id` is empty and with `Conflict`
    /// when another change already carries the same conflict tuple.
    fn change_create(&self, input: ChangeInput) -> Result<Change>;

    /// Read a single change.
    fn change_read(&self, id: &str) -> Result<Change>;

    /// Read all changes matching the search, ordered by `(when_changed, id)`.
    ///
    /// NOTE: an unconstrained search (see [`ChangeSearch::is_unconstrained`])
    /// matches EVERY stored change. In particular an empty id list is not
    /// "no ids"; callers resolving a possibly-empty id set must short-circuit.
    fn changes_read(&self, search: &ChangeSearch) -> Result<Vec<Change>>;

    /// Delete changes. The whole batch fails with `ChangeReferenced` if any id
    /// is still pending for some registration. Absent ids are ignored.
    fn changes_delete(&self, ids: &[String]) -> Result<()>;

    /// Create a registration if it does not exist yet.
    fn registration_upsert(&self, id: &str) -> Result<()>;

    /// Delete a registration and its pending set.
    fn registration_delete(&self, id: &str) -> Result<()>;

    /// All registration ids, sorted.
    fn registrations_read(&self) -> Result<Vec<String>>;

    /// Add a change to the pending set of every registration that exists now.
    ///
    /// A no-op when there are no registrations.
    fn registration_change_upsert(&self, change_id: &str) -> Result<()>;

    /// Pending change ids for a registration, sorted.
    fn registration_changes_read(&self, registration_id: &str) -> Result<Vec<String>>;

    /// Remove change ids from a registration's pending set.
    ///
    /// Returns the ids whose association was removed by this call and which
    /// are no longer pending for any registration. Ids that were not pending
    /// are skipped silently.
    fn registration_change_acknowledge(
        &self,
        registration_id: &str,
        change_ids: &[String],
    ) -> Result<Vec<String>>;
}

/// Whole-store image used by the snapshot backend.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaSnapshot {
    /// Changes by id.
    pub changes: HashMap<String, Change>,

    /// Registration ids.
    pub registrations: HashSet<String>,

    /// Registration id to pending change ids.
    pub registration_changes: HashMap<String, HashSet<String>>,
}

/// Open the backend selected by the configuration.
pub fn open_meta(config: &MetaConfig) -> Result<Arc<dyn Meta>> {
    match config {
        MetaConfig::Memory => Ok(Arc::new(MemoryMeta::new())),
        MetaConfig::File {
            path,
            create_if_missing,
        } => Ok(Arc::new(FileMeta::open(path, *create_if_missing)?)),
        #[cfg(feature = "sqlite")]
        MetaConfig::Sql { path: Some(path) } => Ok(Arc::new(SqlMeta::open(path)?)),
        #[cfg(feature = "sqlite")]
        MetaConfig::Sql { path: None } => Ok(Arc::new(SqlMeta::in_memory()?)),
        #[cfg(not(feature = "sqlite"))]
        MetaConfig::Sql { .. } => Err(ChangeError::InvalidConfig(
            "sql backend requires the `sqlite` feature".into(),
        )),
    }
}

/// Reject inputs that cannot be stored.
pub(crate) fn validate_input(input: &ChangeInput) -> Result<()> {
    if input.data_id.is_empty() {
        return Err(ChangeError::NotWritten("data_id is required".into()));
    }
    Ok(())
}

/// Drop repeated ids while keeping the caller's order.
pub(crate) fn dedup_ids(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

/// Generate a new opaque change id.
pub(crate) fn new_change_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
