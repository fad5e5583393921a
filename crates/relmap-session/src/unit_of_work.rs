//! Unit of Work: the pending change set of a session.
//!
//! Three disjoint sets decide what the next flush writes:
//!
//! - **new**: pending entities to INSERT
//! - **dirty**: persistent entities whose columns may have changed
//! - **removed**: persistent entities to DELETE
//!
//! Removing a pending entity never reaches the store; it is moved to a
//! discarded set instead, from which [`UnitOfWork::restore`] can bring it back
//! (for example when an orphaned child is re-linked before the flush).

use crate::entity::EntityId;
use relmap_core::{Error, SessionError, SessionErrorKind};
use std::collections::BTreeSet;

/// Pending changes, by entity handle.
#[derive(Debug, Clone, Default)]
pub struct UnitOfWork {
    new: BTreeSet<EntityId>,
    dirty: BTreeSet<EntityId>,
    removed: BTreeSet<EntityId>,
    discarded: BTreeSet<EntityId>,
}

/// Error type for Unit of Work operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UowError {
    /// Pending rows reference each other in a cycle.
    CycleDetected {
        /// Tables of the rows involved in the cycle.
        tables: Vec<&'static str>,
    },
    /// A generated key or FK target was needed before it was available.
    UnresolvedReference {
        /// The entity whose row could not be written.
        entity: EntityId,
        /// The column that could not be filled.
        column: &'static str,
    },
}

impl std::fmt::Display for UowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UowError::CycleDetected { tables } => {
                write!(f, "Dependency cycle detected: {}", tables.join(" -> "))
            }
            UowError::UnresolvedReference { entity, column } => {
                write!(f, "Entity {entity} has no value for '{column}' at flush time")
            }
        }
    }
}

impl std::error::Error for UowError {}

impl From<UowError> for Error {
    fn from(e: UowError) -> Self {
        let kind = match e {
            UowError::CycleDetected { .. } => SessionErrorKind::DependencyCycle,
            UowError::UnresolvedReference { .. } => SessionErrorKind::InvalidState,
        };
        Error::Session(SessionError::new(kind, e.to_string()))
    }
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_new(&mut self, id: EntityId) {
        self.discarded.remove(&id);
        self.new.insert(id);
    }

    /// Record that a persistent entity may have changed. Ignored once the
    /// entity is marked for removal.
    pub fn mark_dirty(&mut self, id: EntityId) {
        if !self.removed.contains(&id) && !self.new.contains(&id) {
            self.dirty.insert(id);
        }
    }

    /// Schedule a delete. A pending entity is discarded instead.
    pub fn mark_removed(&mut self, id: EntityId) {
        if self.new.remove(&id) {
            self.discarded.insert(id);
            return;
        }
        self.dirty.remove(&id);
        self.removed.insert(id);
    }

    /// Undo [`mark_removed`](Self::mark_removed).
    pub fn restore(&mut self, id: EntityId) {
        if self.discarded.remove(&id) {
            self.new.insert(id);
        } else if self.removed.remove(&id) {
            self.dirty.insert(id);
        }
    }

    /// Stop tracking an entity entirely.
    pub fn forget(&mut self, id: EntityId) {
        self.new.remove(&id);
        self.dirty.remove(&id);
        self.removed.remove(&id);
        self.discarded.remove(&id);
    }

    pub fn is_new(&self, id: EntityId) -> bool {
        self.new.contains(&id)
    }

    pub fn is_removed(&self, id: EntityId) -> bool {
        self.removed.contains(&id)
    }

    pub fn is_discarded(&self, id: EntityId) -> bool {
        self.discarded.contains(&id)
    }

    /// Removed or discarded.
    pub fn is_going_away(&self, id: EntityId) -> bool {
        self.is_removed(id) || self.is_discarded(id)
    }

    pub fn new_entities(&self) -> &BTreeSet<EntityId> {
        &self.new
    }

    pub fn dirty_entities(&self) -> &BTreeSet<EntityId> {
        &self.dirty
    }

    pub fn removed_entities(&self) -> &BTreeSet<EntityId> {
        &self.removed
    }

    pub fn discarded_entities(&self) -> &BTreeSet<EntityId> {
        &self.discarded
    }

    pub fn has_changes(&self) -> bool {
        !self.new.is_empty()
            || !self.dirty.is_empty()
            || !self.removed.is_empty()
            || !self.discarded.is_empty()
    }

    pub fn pending_count(&self) -> PendingCounts {
        PendingCounts {
            new: self.new.len(),
            dirty: self.dirty.len(),
            deleted: self.removed.len(),
        }
    }

    pub fn clear(&mut self) {
        self.new.clear();
        self.dirty.clear();
        self.removed.clear();
        self.discarded.clear();
    }
}

/// Count of pending operations by type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    /// Entities pending INSERT.
    pub new: usize,
    /// Entities that may need an UPDATE.
    pub dirty: usize,
    /// Entities pending DELETE.
    pub deleted: usize,
}

impl PendingCounts {
    #[must_use]
    pub fn total(&self) -> usize {
        self.new + self.dirty + self.deleted
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removing_new_entity_discards_it() {
        let mut uow = UnitOfWork::new();
        uow.mark_new(EntityId(1));
        uow.mark_removed(EntityId(1));
        assert!(!uow.is_new(EntityId(1)));
        assert!(!uow.is_removed(EntityId(1)));
        assert!(uow.is_discarded(EntityId(1)));
        assert_eq!(uow.pending_count(), PendingCounts::default());
    }

    #[test]
    fn removed_takes_precedence_over_dirty() {
        let mut uow = UnitOfWork::new();
        uow.mark_dirty(EntityId(1));
        uow.mark_removed(EntityId(1));
        uow.mark_dirty(EntityId(1));
        assert!(uow.dirty_entities().is_empty());
        assert_eq!(
            uow.pending_count(),
            PendingCounts {
                new: 0,
                dirty: 0,
                deleted: 1
            }
        );
    }

    #[test]
    fn restore_undoes_removal() {
        let mut uow = UnitOfWork::new();
        uow.mark_new(EntityId(1));
        uow.mark_removed(EntityId(1));
        uow.mark_removed(EntityId(2));
        uow.restore(EntityId(1));
        uow.restore(EntityId(2));
        assert!(uow.is_new(EntityId(1)));
        assert!(!uow.is_going_away(EntityId(2)));
        assert!(uow.dirty_entities().contains(&EntityId(2)));
    }

    #[test]
    fn new_entities_are_not_dirty() {
        let mut uow = UnitOfWork::new();
        uow.mark_new(EntityId(1));
        uow.mark_dirty(EntityId(1));
        assert!(uow.dirty_entities().is_empty());
        assert_eq!(uow.pending_count().total(), 1);
    }

    #[test]
    fn cycle_error_converts_to_session_error() {
        let err: Error = UowError::CycleDetected {
            tables: vec!["a", "b", "a"],
        }
        .into();
        assert_eq!(err.session_kind(), Some(SessionErrorKind::DependencyCycle));
        assert!(err.to_string().contains("a -> b -> a"));
    }
}
