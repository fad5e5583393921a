//! Identity Map: at most one entity per (table, primary key) in a session.
//!
//! Every row the session sees is routed through here, so loading the same
//! row twice yields the same [`EntityId`] and never overwrites in-memory
//! changes.

use crate::entity::EntityId;
use relmap_core::{Error, PkKey, SessionError, SessionErrorKind};

/// Maps (table, primary key) to the entity tracking that row.
///
/// Backed by a persistent map so session checkpoints are cheap to take.
#[derive(Debug, Clone, Default)]
pub struct IdentityMap {
    tables: im::HashMap<&'static str, im::HashMap<PkKey, EntityId>>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, table: &str, key: &PkKey) -> Option<EntityId> {
        self.tables.get(table)?.get(key).copied()
    }

    /// Register `id` under `key`.
    ///
    /// Registering the same id again is a no-op. A different id already
    /// holding the key is an identity conflict.
    pub fn register(
        &mut self,
        table: &'static str,
        key: PkKey,
        id: EntityId,
    ) -> Result<(), Error> {
        let entries = self.tables.entry(table).or_insert_with(im::HashMap::new);
        match entries.get(&key) {
            Some(existing) if *existing == id => Ok(()),
            Some(existing) => Err(Error::Session(SessionError::new(
                SessionErrorKind::IdentityConflict,
                format!(
                    "{table} {key} is already tracked by entity {existing}; cannot register {id}"
                ),
            ))),
            None => {
                tracing::trace!(table, key = %key, id = %id, "Registered identity");
                entries.insert(key, id);
                Ok(())
            }
        }
    }

    /// Remove the entry for `key`, returning the id it held.
    pub fn forget(&mut self, table: &str, key: &PkKey) -> Option<EntityId> {
        self.tables.get_mut(table)?.remove(key)
    }

    pub fn len(&self) -> usize {
        self.tables.values().map(im::HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.tables.clear();
    }
}
