//! In-memory backend.

use super::{dedup_ids, new_change_id, validate_input, Meta, MetaSnapshot};
use crate::error::{ChangeError, Result};
use crate::types::{sort_changes, Change, ChangeInput, ChangeSearch, ConflictKey};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// Stored changes plus the conflict tuples they occupy, guarded together.
#[derive(Default)]
struct ChangeState {
    by_id: HashMap<String, Change>,
    keys: HashSet<ConflictKey>,
}

impl ChangeState {
    fn from_changes(by_id: HashMap<String, Change>) -> Self {
        let keys = by_id.values().map(Change::conflict_key).collect();
        Self { by_id, keys }
    }

    fn remove(&mut self, id: &str) {
        if let Some(change) = self.by_id.remove(id) {
            self.keys.remove(&change.conflict_key());
        }
    }
}

/// Registrations and their pending sets, guarded together.
#[derive(Default)]
struct RegistrationState {
    registrations: HashSet<String>,
    /// Registration id to change ids it has not acknowledged yet.
    pending: HashMap<String, HashSet<String>>,
}

impl RegistrationState {
    fn is_referenced(&self, change_id: &str) -> bool {
        self.pending.values().any(|set| set.contains(change_id))
    }
}

/// Map-backed implementation of [`Meta`].
///
/// Lock order is `changes` then `registrations`. Every operation that needs
/// both takes them in that order.
pub struct MemoryMeta {
    changes: RwLock<ChangeState>,
    registrations: RwLock<RegistrationState>,
}

impl MemoryMeta {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            changes: RwLock::new(ChangeState::default()),
            registrations: RwLock::new(RegistrationState::default()),
        }
    }

    /// Rebuild a store from a snapshot.
    pub fn from_snapshot(snapshot: MetaSnapshot) -> Self {
        let MetaSnapshot {
            changes,
            registrations,
            mut registration_changes,
        } = snapshot;

        for id in &registrations {
            registration_changes.entry(id.clone()).or_default();
        }
        registration_changes.retain(|id, _| registrations.contains(id));

        Self {
            changes: RwLock::new(ChangeState::from_changes(changes)),
            registrations: RwLock::new(RegistrationState {
                registrations,
                pending: registration_changes,
            }),
        }
    }

    /// Replace the whole store with a snapshot.
    pub fn restore(&self, snapshot: MetaSnapshot) {
        let restored = Self::from_snapshot(snapshot);

        let mut changes = self.changes.write();
        let mut state = self.registrations.write();
        *changes = restored.changes.into_inner();
        *state = restored.registrations.into_inner();
    }

    /// Copy out the whole store.
    pub fn snapshot(&self) -> MetaSnapshot {
        let changes = self.changes.read();
        let state = self.registrations.read();

        MetaSnapshot {
            changes: changes.by_id.clone(),
            registrations: state.registrations.clone(),
            registration_changes: state.pending.clone(),
        }
    }

    /// Number of stored changes.
    pub fn change_count(&self) -> usize {
        self.changes.read().by_id.len()
    }
}

impl Default for MemoryMeta {
    fn default() -> Self {
        Self::new()
    }
}

impl Meta for MemoryMeta {
    fn change_create(&self, input: ChangeInput) -> Result<Change> {
        validate_input(&input)?;

        let mut changes = self.changes.write();
        let change = input.into_change(new_change_id());

        let key = change.conflict_key();
        if changes.keys.contains(&key) {
            return Err(ChangeError::Conflict(key));
        }

        changes.keys.insert(key);
        changes.by_id.insert(change.id.clone(), change.clone());
        Ok(change)
    }

    fn change_read(&self, id: &str) -> Result<Change> {
        self.changes
            .read()
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| ChangeError::ChangeNotFound(id.to_string()))
    }

    fn changes_read(&self, search: &ChangeSearch) -> Result<Vec<Change>> {
        let changes = self.changes.read();

        let mut found: Vec<Change> = if search.ids.is_empty() {
            changes
                .by_id
                .values()
                .filter(|c| search.matches(c))
                .cloned()
                .collect()
        } else {
            // Index lookup first, then the remaining predicates
            dedup_ids(&search.ids)
                .iter()
                .filter_map(|id| changes.by_id.get(id))
                .filter(|c| search.matches(c))
                .cloned()
                .collect()
        };

        sort_changes(&mut found);
        Ok(found)
    }

    fn changes_delete(&self, ids: &[String]) -> Result<()> {
        let mut changes = self.changes.write();
        let state = self.registrations.read();

        if let Some(id) = ids.iter().find(|id| state.is_referenced(id)) {
            return Err(ChangeError::ChangeReferenced(id.clone()));
        }

        for id in ids {
            changes.remove(id);
        }
        Ok(())
    }

    fn registration_upsert(&self, id: &str) -> Result<()> {
        let mut state = self.registrations.write();
        state.registrations.insert(id.to_string());
        state.pending.entry(id.to_string()).or_default();
        Ok(())
    }

    fn registration_delete(&self, id: &str) -> Result<()> {
        let mut state = self.registrations.write();
        if !state.registrations.remove(id) {
            return Err(ChangeError::RegistrationNotFound(id.to_string()));
        }
        state.pending.remove(id);
        Ok(())
    }

    fn registrations_read(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.registrations.read().registrations.iter().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn registration_change_upsert(&self, change_id: &str) -> Result<()> {
        let changes = self.changes.read();
        if !changes.by_id.contains_key(change_id) {
            return Err(ChangeError::ChangeNotFound(change_id.to_string()));
        }

        let mut state = self.registrations.write();
        for pending in state.pending.values_mut() {
            pending.insert(change_id.to_string());
        }
        Ok(())
    }

    fn registration_changes_read(&self, registration_id: &str) -> Result<Vec<String>> {
        let state = self.registrations.read();
        let pending = state
            .pending
            .get(registration_id)
            .ok_or_else(|| ChangeError::RegistrationNotFound(registration_id.to_string()))?;

        let mut ids: Vec<String> = pending.iter().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn registration_change_acknowledge(
        &self,
        registration_id: &str,
        change_ids: &[String],
    ) -> Result<Vec<String>> {
        let mut state = self.registrations.write();

        let pending = state
            .pending
            .get_mut(registration_id)
            .ok_or_else(|| ChangeError::RegistrationNotFound(registration_id.to_string()))?;

        let removed: Vec<String> = dedup_ids(change_ids)
            .into_iter()
            .filter(|id| pending.remove(id))
            .collect();

        Ok(removed
            .into_iter()
            .filter(|id| !state.is_referenced(id))
            .collect())
    }
}
