//! Relationship Graph: bidirectional association bookkeeping.
//!
//! Linking two entities updates, in one call:
//!
//! - the relationship slot on the entity the relationship is declared on
//! - the foreign key column on whichever row owns it, or a queued assignment
//!   when the referenced key has not been generated yet
//! - the association row set, for many-to-many relationships
//! - the mirrored slot named by `back_populates`
//!
//! The mirrored update re-enters [`Linker::link`] from the other side. A
//! guard keyed on (operation, entity, relationship, other entity) stops the
//! second hop from bouncing back.
//!
//! Only loaded slots are edited. An unloaded slot is derivable from foreign
//! keys and pending operations, and is built from them when it is loaded.

use crate::SessionData;
use crate::entity::{EntityId, Related};
use relmap_core::{
    Error, ForeignKeySide, LinkTableInfo, Relation, Result, SchemaErrorKind, SchemaRegistry,
    SessionError, SessionErrorKind, Value,
};
use std::collections::{BTreeMap, BTreeSet};

/// One row of an association table, as entity handles in table column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LinkRow {
    pub table: &'static str,
    /// Entity referenced by the table's first column.
    pub left: EntityId,
    /// Entity referenced by the table's second column.
    pub right: EntityId,
}

impl LinkRow {
    pub fn involves(&self, id: EntityId) -> bool {
        self.left == id || self.right == id
    }
}

/// Delete every association row whose `column` references `entity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LinkPurge {
    pub table: &'static str,
    pub column: &'static str,
    pub entity: EntityId,
}

/// Relationship work waiting for the next flush.
#[derive(Debug, Clone, Default)]
pub struct RelationshipGraph {
    /// (holder, FK column) -> entity whose key the column must receive.
    pending_fk: BTreeMap<(EntityId, &'static str), EntityId>,
    link_inserts: BTreeSet<LinkRow>,
    link_deletes: BTreeSet<LinkRow>,
    link_purges: BTreeSet<LinkPurge>,
    /// Children removed because they lost their parent under delete-orphan.
    orphans: BTreeSet<EntityId>,
}

impl RelationshipGraph {
    pub fn pending_fk(&self) -> &BTreeMap<(EntityId, &'static str), EntityId> {
        &self.pending_fk
    }

    /// The entity whose key `holder.column` is waiting for.
    pub fn pending_target(&self, holder: EntityId, column: &str) -> Option<EntityId> {
        self.pending_fk
            .iter()
            .find(|((h, c), _)| *h == holder && *c == column)
            .map(|(_, target)| *target)
    }

    /// Take every queued assignment that waits on `target`.
    pub(crate) fn take_waiting_on(&mut self, target: EntityId) -> Vec<(EntityId, &'static str)> {
        let waiting: Vec<(EntityId, &'static str)> = self
            .pending_fk
            .iter()
            .filter(|(_, t)| **t == target)
            .map(|(key, _)| *key)
            .collect();
        for key in &waiting {
            self.pending_fk.remove(key);
        }
        waiting
    }

    /// Drop a queued assignment without resolving it.
    pub(crate) fn drop_pending(&mut self, holder: EntityId, column: &'static str) {
        self.pending_fk.remove(&(holder, column));
    }

    pub fn link_inserts(&self) -> &BTreeSet<LinkRow> {
        &self.link_inserts
    }

    pub fn link_deletes(&self) -> &BTreeSet<LinkRow> {
        &self.link_deletes
    }

    pub fn link_purges(&self) -> &BTreeSet<LinkPurge> {
        &self.link_purges
    }

    pub fn is_orphan(&self, id: EntityId) -> bool {
        self.orphans.contains(&id)
    }

    pub(crate) fn purge(&mut self, purge: LinkPurge) {
        let entity = purge.entity;
        self.link_inserts
            .retain(|row| !(row.table == purge.table && row.involves(entity)));
        self.link_deletes
            .retain(|row| !(row.table == purge.table && row.involves(entity)));
        self.link_purges.insert(purge);
    }

    pub fn has_changes(&self) -> bool {
        !self.link_inserts.is_empty()
            || !self.link_deletes.is_empty()
            || !self.link_purges.is_empty()
    }

    /// Drop all queued work that mentions `id`.
    pub(crate) fn forget(&mut self, id: EntityId) {
        self.pending_fk
            .retain(|(holder, _), target| *holder != id && *target != id);
        self.link_inserts.retain(|row| !row.involves(id));
        self.link_deletes.retain(|row| !row.involves(id));
        self.link_purges.retain(|p| p.entity != id);
        self.orphans.remove(&id);
    }

    /// Clear the operations a successful flush has written.
    pub(crate) fn clear_written(&mut self) {
        self.link_inserts.clear();
        self.link_deletes.clear();
        self.link_purges.clear();
        self.orphans.clear();
    }
}

fn invalid_state(message: String) -> Error {
    Error::Session(SessionError::new(SessionErrorKind::InvalidState, message))
}

/// Column of `target_table` that `holder_table.column` stores.
pub(crate) fn referenced_column(
    registry: &SchemaRegistry,
    holder_table: &str,
    column: &str,
    target_table: &str,
) -> Result<&'static str> {
    let field = registry.table(holder_table)?.field(column)?;
    if let Some((_, referenced)) = field.foreign_key_target() {
        return Ok(referenced);
    }
    registry.table(target_table)?.single_pk().ok_or_else(|| {
        Error::Schema(relmap_core::SchemaError {
            kind: SchemaErrorKind::Invalid,
            message: format!("'{target_table}' has no single-column primary key"),
        })
    })
}

/// Applies link and unlink operations to a session's state.
pub(crate) struct Linker<'a> {
    data: &'a mut SessionData,
    registry: &'a SchemaRegistry,
    guard: BTreeSet<(bool, EntityId, &'static str, EntityId)>,
    rows_handled: BTreeSet<LinkRow>,
}

impl<'a> Linker<'a> {
    pub(crate) fn new(data: &'a mut SessionData, registry: &'a SchemaRegistry) -> Self {
        Self {
            data,
            registry,
            guard: BTreeSet::new(),
            rows_handled: BTreeSet::new(),
        }
    }

    fn relation(&self, id: EntityId, name: &str) -> Result<&'a Relation> {
        let registry = self.registry;
        let table = self.data.entity(id)?.table;
        registry.table(table)?.relation(name)
    }

    fn check_pair(&self, relation: &Relation, a: EntityId, b: EntityId) -> Result<()> {
        for id in [a, b] {
            let entity = self.data.entity(id)?;
            if !entity.is_live() {
                return Err(invalid_state(format!(
                    "entity {id} is {:?} and cannot be linked",
                    entity.state
                )));
            }
        }
        let other = self.data.entity(b)?.table;
        if other != relation.related_table() {
            return Err(invalid_state(format!(
                "relationship '{}' expects a '{}' entity, got '{other}'",
                relation.name(),
                relation.related_table()
            )));
        }
        Ok(())
    }

    /// Associate `b` with `a` through `a`'s relationship `name`.
    pub(crate) fn link(&mut self, a: EntityId, name: &str, b: EntityId) -> Result<()> {
        let relation = self.relation(a, name)?;
        let rel = relation.name();
        if !self.guard.insert((true, a, rel, b)) {
            return Ok(());
        }
        self.check_pair(relation, a, b)?;
        tracing::trace!(parent = %a, relationship = rel, child = %b, "Linking");

        self.attach(a, relation, b)?;
        self.assign_key(relation, a, b)?;
        self.restore_orphan(relation, a, b);
        if let Some(inverse) = relation.inverse {
            self.link(b, inverse, a)?;
        }
        self.guard.remove(&(true, a, rel, b));
        Ok(())
    }

    /// Dissolve the association between `a` and `b` through `a`'s relationship `name`.
    pub(crate) fn unlink(&mut self, a: EntityId, name: &str, b: EntityId) -> Result<()> {
        let relation = self.relation(a, name)?;
        let rel = relation.name();
        if !self.guard.insert((false, a, rel, b)) {
            return Ok(());
        }
        let in_slot = self
            .data
            .entity_mut(a)?
            .related
            .get_mut(rel)
            .is_some_and(|slot| slot.remove(b));
        tracing::trace!(parent = %a, relationship = rel, child = %b, in_slot, "Unlinking");

        match relation.side {
            ForeignKeySide::Local(column) => {
                let cleared = self.clear_foreign_key(a, column, b)?;
                if (in_slot || cleared)
                    && !self.has_parent(a, column)?
                    && self.orphaned_by_parent(a, column, b)?
                {
                    self.orphan(a);
                }
            }
            ForeignKeySide::Remote(column) => {
                let cleared = self.clear_foreign_key(b, column, a)?;
                if (in_slot || cleared)
                    && !self.has_parent(b, column)?
                    && relation.cascade.delete_orphan
                {
                    self.orphan(b);
                }
            }
            ForeignKeySide::Link(link) => {
                let row = self.link_row(&link, a, b)?;
                if self.rows_handled.insert(row) {
                    let graph = &mut self.data.graph;
                    if !graph.link_inserts.remove(&row) && in_slot {
                        graph.link_deletes.insert(row);
                    }
                }
            }
        }
        if let Some(inverse) = relation.inverse {
            self.unlink(b, inverse, a)?;
        }
        self.guard.remove(&(false, a, rel, b));
        Ok(())
    }

    /// Put `b` into `a`'s slot, moving it away from any previous partner.
    fn attach(&mut self, a: EntityId, relation: &Relation, b: EntityId) -> Result<()> {
        let rel = relation.name();
        let table = self.data.entity(a)?.table;
        if relation.owns_children() {
            // A child row has one parent per foreign key.
            let owners: Vec<EntityId> = self
                .data
                .entities
                .iter()
                .filter(|(id, e)| {
                    **id != a
                        && e.table == table
                        && e.related.get(rel).is_some_and(|slot| slot.contains(b))
                })
                .map(|(id, _)| *id)
                .collect();
            for owner in owners {
                self.unlink(owner, rel, b)?;
            }
        }

        let current = self.data.entity(a)?.related.get(rel).cloned();
        match current {
            Some(Related::Many(ids)) if ids.contains(&b) => {}
            Some(Related::Many(_)) => {
                if let Some(Related::Many(ids)) = self.data.entity_mut(a)?.related.get_mut(rel) {
                    ids.push(b);
                }
            }
            Some(Related::One(Some(previous))) if previous == b => {}
            Some(Related::One(Some(previous))) => {
                self.unlink(a, rel, previous)?;
                self.data
                    .entity_mut(a)?
                    .related
                    .insert(rel, Related::One(Some(b)));
            }
            Some(Related::One(None)) => {
                self.data
                    .entity_mut(a)?
                    .related
                    .insert(rel, Related::One(Some(b)));
            }
            None if !relation.is_collection() => {
                self.data
                    .entity_mut(a)?
                    .related
                    .insert(rel, Related::One(Some(b)));
            }
            None => {}
        }
        Ok(())
    }

    fn assign_key(&mut self, relation: &Relation, a: EntityId, b: EntityId) -> Result<()> {
        match relation.side {
            ForeignKeySide::Local(column) => self.set_foreign_key(a, column, b),
            ForeignKeySide::Remote(column) => self.set_foreign_key(b, column, a),
            ForeignKeySide::Link(link) => {
                let row = self.link_row(&link, a, b)?;
                if self.rows_handled.insert(row) {
                    let graph = &mut self.data.graph;
                    if !graph.link_deletes.remove(&row) {
                        graph.link_inserts.insert(row);
                    }
                }
                Ok(())
            }
        }
    }

    /// Point `holder.column` at `target`, or queue it until `target` has a key.
    fn set_foreign_key(
        &mut self,
        holder: EntityId,
        column: &'static str,
        target: EntityId,
    ) -> Result<()> {
        let holder_table = self.data.entity(holder)?.table;
        let target_table = self.data.entity(target)?.table;
        let referenced = referenced_column(self.registry, holder_table, column, target_table)?;
        let value = self.data.entity(target)?.get(referenced).clone();
        if value.is_null() {
            tracing::trace!(holder = %holder, column, target = %target, "Queued foreign key");
            self.data.graph.pending_fk.insert((holder, column), target);
            self.data.assign(holder, column, Value::Null)?;
        } else {
            self.data.graph.pending_fk.remove(&(holder, column));
            self.data.assign(holder, column, value)?;
        }
        Ok(())
    }

    /// Null `holder.column` if it refers to `target`. Returns whether it did.
    fn clear_foreign_key(
        &mut self,
        holder: EntityId,
        column: &'static str,
        target: EntityId,
    ) -> Result<bool> {
        if self.data.graph.pending_fk.get(&(holder, column)) == Some(&target) {
            self.data.graph.pending_fk.remove(&(holder, column));
            return Ok(true);
        }
        let holder_table = self.data.entity(holder)?.table;
        let target_table = self.data.entity(target)?.table;
        let referenced = referenced_column(self.registry, holder_table, column, target_table)?;
        let key = self.data.entity(target)?.get(referenced).clone();
        if !key.is_null() && self.data.entity(holder)?.get(column).sql_eq(&key) {
            self.data.assign(holder, column, Value::Null)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Whether `holder.column` still refers to some row, directly or queued.
    fn has_parent(&self, holder: EntityId, column: &'static str) -> Result<bool> {
        Ok(!self.data.entity(holder)?.get(column).is_null()
            || self.data.graph.pending_fk.contains_key(&(holder, column)))
    }

    /// Whether losing `parent` through `child.column` orphans `child`.
    fn orphaned_by_parent(
        &self,
        child: EntityId,
        column: &'static str,
        parent: EntityId,
    ) -> Result<bool> {
        let child_table = self.data.entity(child)?.table;
        let parent_table = self.data.entity(parent)?.table;
        Ok(self
            .registry
            .table(parent_table)?
            .relations
            .iter()
            .any(|r| {
                r.side == ForeignKeySide::Remote(column)
                    && r.related_table() == child_table
                    && r.cascade.delete_orphan
            }))
    }

    fn orphan(&mut self, child: EntityId) {
        let live = self.data.entity(child).is_ok_and(|e| e.is_live());
        if live && !self.data.uow.is_going_away(child) {
            tracing::debug!(child = %child, "Orphaned entity scheduled for removal");
            self.data.uow.mark_removed(child);
            self.data.graph.orphans.insert(child);
        }
    }

    fn restore_orphan(&mut self, relation: &Relation, a: EntityId, b: EntityId) {
        let child = match relation.side {
            ForeignKeySide::Local(_) => a,
            ForeignKeySide::Remote(_) => b,
            ForeignKeySide::Link(_) => return,
        };
        if self.data.graph.orphans.remove(&child) {
            tracing::debug!(child = %child, "Re-linked orphan restored");
            self.data.uow.restore(child);
        }
    }

    /// Canonical association row for `a` (declaring side) and `b`.
    fn link_row(&self, link: &LinkTableInfo, a: EntityId, b: EntityId) -> Result<LinkRow> {
        let assoc = self
            .registry
            .associations()
            .iter()
            .find(|t| t.name == link.table_name)
            .ok_or_else(|| {
                invalid_state(format!("link table '{}' is not registered", link.table_name))
            })?;
        let (left, right) = if assoc.columns[0].name == link.local_column {
            (a, b)
        } else {
            (b, a)
        };
        Ok(LinkRow {
            table: assoc.name,
            left,
            right,
        })
    }

    /// Rewire slots after `id.column` was assigned directly.
    ///
    /// Relationships backed by the column are re-pointed at whichever tracked
    /// entity the new value identifies. No orphan rules apply: the row still
    /// holds an explicit reference.
    pub(crate) fn foreign_key_set(
        &mut self,
        id: EntityId,
        column: &'static str,
        value: Value,
    ) -> Result<()> {
        let registry = self.registry;
        let table = self.data.entity(id)?.table;
        self.data.graph.pending_fk.remove(&(id, column));
        self.data.assign(id, column, value.clone())?;

        for relation in &registry.table(table)?.relations {
            if relation.side != ForeignKeySide::Local(column) {
                continue;
            }
            let target = self.tracked_target(table, column, relation.related_table(), &value)?;
            let entity = self.data.entity_mut(id)?;
            match target {
                Some(t) => {
                    entity.related.insert(relation.name(), Related::One(Some(t)));
                }
                None if value.is_null() => {
                    entity.related.insert(relation.name(), Related::One(None));
                }
                None => {
                    entity.related.remove(relation.name());
                }
            }
        }

        for parent_meta in registry.tables() {
            for relation in &parent_meta.relations {
                if relation.side != ForeignKeySide::Remote(column)
                    || relation.related_table() != table
                {
                    continue;
                }
                let rel = relation.name();
                let parent_table = parent_meta.name();
                let holders: Vec<EntityId> = self
                    .data
                    .entities
                    .iter()
                    .filter(|(_, e)| {
                        e.table == parent_table
                            && e.related.get(rel).is_some_and(|slot| slot.contains(id))
                    })
                    .map(|(pid, _)| *pid)
                    .collect();
                for parent in holders {
                    if let Some(slot) = self.data.entity_mut(parent)?.related.get_mut(rel) {
                        slot.remove(id);
                    }
                }
                if let Some(parent) = self.tracked_target(table, column, parent_table, &value)? {
                    match self.data.entity_mut(parent)?.related.get_mut(rel) {
                        Some(Related::Many(ids)) => {
                            if !ids.contains(&id) {
                                ids.push(id);
                            }
                        }
                        Some(slot) => *slot = Related::One(Some(id)),
                        None => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// Tracked entity of `target_table` whose referenced column equals `value`.
    fn tracked_target(
        &self,
        holder_table: &str,
        column: &str,
        target_table: &str,
        value: &Value,
    ) -> Result<Option<EntityId>> {
        if value.is_null() {
            return Ok(None);
        }
        let referenced = referenced_column(self.registry, holder_table, column, target_table)?;
        Ok(self
            .data
            .entities
            .iter()
            .find(|(_, e)| {
                e.table == target_table && e.is_live() && e.get(referenced).sql_eq(value)
            })
            .map(|(id, _)| *id))
    }
}
