//! Entities as the session holds them: column maps plus relationship slots.

use relmap_core::{PkKey, TableMeta, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Handle to an entity inside one session.
///
/// Handles are never reused within a session, so a stale handle can only
/// ever refer to the entity it was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub(crate) u64);

impl EntityId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Added to the session, not yet inserted.
    Pending,
    /// Backed by a row in the store.
    Persistent,
    /// Its DELETE has been flushed; becomes detached on commit.
    Deleted,
    /// No longer tracked (expunged, rolled back, or the session closed).
    Detached,
}

/// Contents of a loaded relationship slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Related {
    One(Option<EntityId>),
    Many(Vec<EntityId>),
}

impl Related {
    pub fn ids(&self) -> Vec<EntityId> {
        match self {
            Related::One(one) => one.iter().copied().collect(),
            Related::Many(many) => many.clone(),
        }
    }

    pub fn contains(&self, id: EntityId) -> bool {
        match self {
            Related::One(one) => *one == Some(id),
            Related::Many(many) => many.contains(&id),
        }
    }

    /// Drop `id` from the slot. Returns whether it was present.
    pub(crate) fn remove(&mut self, id: EntityId) -> bool {
        match self {
            Related::One(one) if *one == Some(id) => {
                *one = None;
                true
            }
            Related::One(_) => false,
            Related::Many(many) => {
                let before = many.len();
                many.retain(|other| *other != id);
                many.len() != before
            }
        }
    }
}

/// One tracked row.
#[derive(Debug, Clone)]
pub struct Entity {
    pub(crate) table: &'static str,
    pub(crate) values: BTreeMap<&'static str, Value>,
    /// Loaded relationship slots. A missing entry means "not loaded yet".
    pub(crate) related: BTreeMap<&'static str, Related>,
    pub(crate) state: ObjectState,
    /// Came from a store read rather than from `add`.
    pub(crate) loaded: bool,
    /// Column values must be re-read before use.
    pub(crate) expired: bool,
    /// Columns a flush filled in: generated keys and resolved foreign keys.
    pub(crate) flush_assigned: Vec<&'static str>,
}

impl Entity {
    pub(crate) fn new(table: &'static str, values: BTreeMap<&'static str, Value>) -> Self {
        Self {
            table,
            values,
            related: BTreeMap::new(),
            state: ObjectState::Pending,
            loaded: false,
            expired: false,
            flush_assigned: Vec::new(),
        }
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn state(&self) -> ObjectState {
        self.state
    }

    /// Column value, NULL when the column was never set.
    pub fn get(&self, column: &str) -> &Value {
        self.values.get(column).unwrap_or(&Value::Null)
    }

    pub fn values(&self) -> &BTreeMap<&'static str, Value> {
        &self.values
    }

    pub fn is_expired(&self) -> bool {
        self.expired
    }

    pub fn is_loaded(&self, relationship: &str) -> bool {
        self.related.contains_key(relationship)
    }

    /// Primary key, once every key column holds a value.
    pub fn key(&self, meta: &TableMeta) -> Option<PkKey> {
        PkKey::from_values(meta.primary_key.iter().map(|c| self.get(c))).ok()
    }

    pub(crate) fn is_live(&self) -> bool {
        matches!(self.state, ObjectState::Pending | ObjectState::Persistent)
    }
}
