//! Change tracking for dirty detection.
//!
//! Holds the column values each persistent entity had after it was last
//! loaded or flushed. Comparing the live values against that snapshot tells
//! the flush which columns an UPDATE must set.

use crate::entity::EntityId;
use relmap_core::Value;
use std::collections::BTreeMap;
use std::time::Instant;

/// Column values captured at load or flush time.
#[derive(Debug, Clone)]
pub struct ObjectSnapshot {
    values: BTreeMap<&'static str, Value>,
    taken_at: Instant,
}

impl ObjectSnapshot {
    pub fn new(values: BTreeMap<&'static str, Value>) -> Self {
        Self {
            values,
            taken_at: Instant::now(),
        }
    }

    pub fn values(&self) -> &BTreeMap<&'static str, Value> {
        &self.values
    }

    pub fn get(&self, column: &str) -> &Value {
        self.values.get(column).unwrap_or(&Value::Null)
    }

    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }
}

/// Snapshots for every persistent entity of a session.
#[derive(Debug, Clone, Default)]
pub struct ChangeTracker {
    snapshots: im::OrdMap<EntityId, ObjectSnapshot>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the values an entity holds now.
    pub fn snapshot(&mut self, id: EntityId, values: &BTreeMap<&'static str, Value>) {
        self.snapshots.insert(id, ObjectSnapshot::new(values.clone()));
    }

    /// Same as [`snapshot`](Self::snapshot), after a successful flush.
    pub fn refresh(&mut self, id: EntityId, values: &BTreeMap<&'static str, Value>) {
        self.snapshot(id, values);
    }

    /// Columns whose value differs from the snapshot.
    ///
    /// Without a snapshot every non-null column counts as changed.
    pub fn changed_fields(
        &self,
        id: EntityId,
        current: &BTreeMap<&'static str, Value>,
    ) -> Vec<&'static str> {
        match self.snapshots.get(&id) {
            Some(snapshot) => current
                .iter()
                .filter(|(column, value)| snapshot.get(column) != *value)
                .map(|(column, _)| *column)
                .collect(),
            None => current
                .iter()
                .filter(|(_, value)| !value.is_null())
                .map(|(column, _)| *column)
                .collect(),
        }
    }

    pub fn is_dirty(&self, id: EntityId, current: &BTreeMap<&'static str, Value>) -> bool {
        !self.changed_fields(id, current).is_empty()
    }

    pub fn get_snapshot(&self, id: EntityId) -> Option<&ObjectSnapshot> {
        self.snapshots.get(&id)
    }

    pub fn has_snapshot(&self, id: EntityId) -> bool {
        self.snapshots.contains_key(&id)
    }

    pub fn forget(&mut self, id: EntityId) {
        self.snapshots.remove(&id);
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(name: &str, age: i64) -> BTreeMap<&'static str, Value> {
        BTreeMap::from([
            ("id", Value::Int(1)),
            ("name", Value::from(name)),
            ("age", Value::Int(age)),
        ])
    }

    #[test]
    fn unchanged_values_are_clean() {
        let mut tracker = ChangeTracker::new();
        let id = EntityId(1);
        tracker.snapshot(id, &values("ann", 30));
        assert!(!tracker.is_dirty(id, &values("ann", 30)));
        assert!(tracker.changed_fields(id, &values("ann", 30)).is_empty());
    }

    #[test]
    fn changed_fields_lists_modified_columns() {
        let mut tracker = ChangeTracker::new();
        let id = EntityId(1);
        tracker.snapshot(id, &values("ann", 30));
        assert_eq!(tracker.changed_fields(id, &values("bob", 31)), vec!["age", "name"]);
        assert_eq!(tracker.changed_fields(id, &values("ann", 31)), vec!["age"]);
    }

    #[test]
    fn refresh_moves_the_baseline() {
        let mut tracker = ChangeTracker::new();
        let id = EntityId(1);
        tracker.snapshot(id, &values("ann", 30));
        tracker.refresh(id, &values("ann", 31));
        assert!(!tracker.is_dirty(id, &values("ann", 31)));
        assert!(tracker.get_snapshot(id).is_some());
    }

    #[test]
    fn missing_snapshot_counts_non_null_columns() {
        let tracker = ChangeTracker::new();
        let mut current = values("ann", 30);
        current.insert("email", Value::Null);
        assert_eq!(tracker.changed_fields(EntityId(9), &current), vec!["age", "id", "name"]);
    }

    #[test]
    fn forget_and_clear() {
        let mut tracker = ChangeTracker::new();
        tracker.snapshot(EntityId(1), &values("ann", 30));
        tracker.snapshot(EntityId(2), &values("bob", 40));
        tracker.forget(EntityId(1));
        assert!(!tracker.has_snapshot(EntityId(1)));
        assert_eq!(tracker.len(), 1);
        tracker.clear();
        assert!(tracker.is_empty());
    }
}
