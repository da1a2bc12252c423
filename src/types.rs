//! Core types for the change feed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A single state transition of some external data item.
///
/// Changes are never mutated once created. They leave the store only
/// through acknowledgment-driven pruning or an explicit delete of an
/// unreferenced change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// Opaque identifier (assigned by the backend).
    pub id: String,

    /// When the transition happened (supplied by the caller).
    pub when_changed: Timestamp,

    /// Who caused the transition.
    pub changed_by: String,

    /// Identifier of the data item that changed.
    pub data_id: String,

    /// Service owning the data item (e.g. "timers", "employees").
    pub data_service_name: String,

    /// Type of the data item.
    pub data_type: String,

    /// What happened to the data item (e.g. "create", "start").
    pub data_action: String,

    /// Version of the data item after the transition.
    pub data_version: i64,
}

impl Change {
    /// The tuple used to detect duplicate state transitions.
    pub fn conflict_key(&self) -> ConflictKey {
        ConflictKey {
            data_id: self.data_id.clone(),
            data_service_name: self.data_service_name.clone(),
            data_type: self.data_type.clone(),
            data_action: self.data_action.clone(),
            data_version: self.data_version,
        }
    }
}

/// Input for creating a new change (before the id is assigned).
#[derive(Clone, Debug, Default)]
pub struct ChangeInput {
    /// Defaults to the current time when absent.
    pub when_changed: Option<Timestamp>,
    pub changed_by: String,
    pub data_id: String,
    pub data_service_name: String,
    pub data_type: String,
    pub data_action: String,
    pub data_version: i64,
}

impl ChangeInput {
    /// Create an input for the given data item.
    pub fn new(data_id: impl Into<String>) -> Self {
        Self {
            data_id: data_id.into(),
            ..Default::default()
        }
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.data_service_name = name.into();
        self
    }

    pub fn with_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = data_type.into();
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.data_action = action.into();
        self
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.data_version = version;
        self
    }

    pub fn with_changed_by(mut self, who: impl Into<String>) -> Self {
        self.changed_by = who.into();
        self
    }

    pub fn with_when_changed(mut self, when: Timestamp) -> Self {
        self.when_changed = Some(when);
        self
    }

    /// Build the stored change under the given id.
    pub fn into_change(self, id: String) -> Change {
        Change {
            id,
            when_changed: self.when_changed.unwrap_or_else(Timestamp::now),
            changed_by: self.changed_by,
            data_id: self.data_id,
            data_service_name: self.data_service_name,
            data_type: self.data_type,
            data_action: self.data_action,
            data_version: self.data_version,
        }
    }
}

/// The (data id, service, type, action, version) tuple of a change.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConflictKey {
    pub data_id: String,
    pub data_service_name: String,
    pub data_type: String,
    pub data_action: String,
    pub data_version: i64,
}

impl fmt::Display for ConflictKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}@{}",
            self.data_service_name, self.data_type, self.data_id, self.data_action, self.data_version
        )
    }
}

/// Inclusive filter for reading changes.
///
/// Each populated predicate narrows the result (AND); within a predicate,
/// matching any one value is enough (OR). An unconstrained search matches
/// every stored change.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeSearch {
    pub ids: Vec<String>,
    pub data_ids: Vec<String>,
    pub types: Vec<String>,
    pub actions: Vec<String>,
    pub service_names: Vec<String>,
    /// Only changes with `when_changed >= since`.
    pub since: Option<Timestamp>,
}

impl ChangeSearch {
    /// Search for specific change ids.
    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_data_ids(mut self, data_ids: Vec<String>) -> Self {
        self.data_ids = data_ids;
        self
    }

    pub fn with_types(mut self, types: Vec<String>) -> Self {
        self.types = types;
        self
    }

    pub fn with_actions(mut self, actions: Vec<String>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_service_names(mut self, service_names: Vec<String>) -> Self {
        self.service_names = service_names;
        self
    }

    pub fn since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }

    /// True when no predicate is set, i.e. the search matches everything.
    pub fn is_unconstrained(&self) -> bool {
        self.ids.is_empty()
            && self.data_ids.is_empty()
            && self.types.is_empty()
            && self.actions.is_empty()
            && self.service_names.is_empty()
            && self.since.is_none()
    }

    /// Check if a change satisfies every populated predicate.
    pub fn matches(&self, change: &Change) -> bool {
        fn any_of(values: &[String], value: &str) -> bool {
            values.is_empty() || values.iter().any(|v| v == value)
        }

        any_of(&self.ids, &change.id)
            && any_of(&self.data_ids, &change.data_id)
            && any_of(&self.types, &change.data_type)
            && any_of(&self.actions, &change.data_action)
            && any_of(&self.service_names, &change.data_service_name)
            && self.since.map_or(true, |since| change.when_changed >= since)
    }
}

/// Order changes the way every backend returns them.
pub(crate) fn sort_changes(changes: &mut [Change]) {
    changes.sort_by(|a, b| {
        a.when_changed
            .cmp(&b.when_changed)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(id: &str, data_id: &str, when: i64) -> Change {
        ChangeInput::new(data_id)
            .with_service_name("timers")
            .with_type("timer")
            .with_action("start")
            .with_when_changed(Timestamp(when))
            .into_change(id.to_string())
    }

    #[test]
    fn test_empty_search_matches_everything() {
        let search = ChangeSearch::default();
        assert!(search.is_unconstrained());
        assert!(search.matches(&change("a", "d1", 1)));
    }

    #[test]
    fn test_search_and_across_or_within() {
        let search = ChangeSearch::default()
            .with_data_ids(vec!["d1".into(), "d2".into()])
            .with_actions(vec!["start".into()]);

        assert!(!search.is_unconstrained());
        assert!(search.matches(&change("a", "d1", 1)));
        assert!(search.matches(&change("b", "d2", 1)));
        assert!(!search.matches(&change("c", "d3", 1)));

        let stop = ChangeSearch::default().with_actions(vec!["stop".into()]);
        assert!(!stop.matches(&change("a", "d1", 1)));
    }

    #[test]
    fn test_since_is_inclusive() {
        let search = ChangeSearch::default().since(Timestamp(10));
        assert!(search.matches(&change("a", "d1", 10)));
        assert!(search.matches(&change("b", "d1", 11)));
        assert!(!search.matches(&change("c", "d1", 9)));
    }

    #[test]
    fn test_input_defaults_when_changed() {
        let before = Timestamp::now();
        let c = ChangeInput::new("d1").into_change("x".into());
        assert!(c.when_changed >= before);
        assert_eq!(c.conflict_key().data_id, "d1");
    }

    #[test]
    fn test_sort_changes() {
        let mut changes = vec![change("b", "d", 2), change("z", "d", 1), change("a", "d", 2)];
        sort_changes(&mut changes);
        let ids: Vec<_> = changes.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["z", "a", "b"]);
    }
}
