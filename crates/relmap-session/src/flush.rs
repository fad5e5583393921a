//! Flush: writing pending changes to the store in dependency order.
//!
//! A flush runs, inside the session's transaction:
//!
//! 1. delete cascades, before anything is written
//! 2. INSERTs, parents first, filling generated keys into waiting children
//! 3. association row inserts
//! 4. UPDATEs of changed columns only
//! 5. association row deletes
//! 6. DELETEs, children first
//!
//! Ordering is decided per entity, not per table: two rows of the same
//! table may depend on each other (self-referential keys), and rows that
//! depend on each other in a cycle are rejected before any write.

use crate::entity::{EntityId, ObjectState};
use crate::graph::{LinkPurge, LinkRow, referenced_column};
use crate::unit_of_work::UowError;
use crate::{Session, key_filter, session_error};
use relmap_core::{
    AssociationTable, Condition, Delete, ForeignKeySide, Insert, Result, SchemaRegistry, Select,
    SessionErrorKind, Statement, Store, TableMeta, Update, Value,
};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

/// Orders entities so that each comes after the entities it depends on.
///
/// Entities with no ordering constraint between them keep the order they
/// were given in.
#[derive(Debug, Default)]
pub struct FlushOrderer {
    nodes: Vec<EntityId>,
    /// Entity -> entities that must come before it.
    after: BTreeMap<EntityId, BTreeSet<EntityId>>,
}

impl FlushOrderer {
    pub fn new(nodes: Vec<EntityId>) -> Self {
        Self {
            nodes,
            after: BTreeMap::new(),
        }
    }

    /// Require `node` to come after `on`. Ignored unless both are nodes.
    pub fn add_dependency(&mut self, node: EntityId, on: EntityId) {
        if node != on && self.nodes.contains(&node) && self.nodes.contains(&on) {
            self.after.entry(node).or_default().insert(on);
        }
    }

    /// Topological order, or the tables of the rows caught in a cycle.
    pub fn order(
        &self,
        table_of: impl Fn(EntityId) -> &'static str,
    ) -> std::result::Result<Vec<EntityId>, UowError> {
        let position: BTreeMap<EntityId, usize> =
            self.nodes.iter().enumerate().map(|(i, n)| (*n, i)).collect();
        let mut remaining: BTreeMap<EntityId, usize> = self
            .nodes
            .iter()
            .map(|n| (*n, self.after.get(n).map_or(0, BTreeSet::len)))
            .collect();
        let mut dependents: BTreeMap<EntityId, Vec<EntityId>> = BTreeMap::new();
        for (node, ons) in &self.after {
            for on in ons {
                dependents.entry(*on).or_default().push(*node);
            }
        }

        let mut ready: BTreeSet<(usize, EntityId)> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(n, _)| (position.get(n).copied().unwrap_or(usize::MAX), *n))
            .collect();
        let mut out = Vec::with_capacity(self.nodes.len());
        while let Some((_, node)) = ready.pop_first() {
            out.push(node);
            for dependent in dependents.get(&node).into_iter().flatten() {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        let pos = position.get(dependent).copied().unwrap_or(usize::MAX);
                        ready.insert((pos, *dependent));
                    }
                }
            }
        }

        if out.len() < self.nodes.len() {
            let placed: BTreeSet<EntityId> = out.into_iter().collect();
            let mut tables: Vec<&'static str> = self
                .nodes
                .iter()
                .filter(|n| !placed.contains(n))
                .map(|n| table_of(*n))
                .collect();
            tables.dedup();
            return Err(UowError::CycleDetected { tables });
        }
        Ok(out)
    }
}

/// Result of a flush operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of rows updated.
    pub updated: usize,
    /// Number of rows deleted.
    pub deleted: usize,
    /// Association rows inserted.
    pub links_inserted: usize,
    /// Association row deletes issued, including purges.
    pub links_deleted: usize,
}

impl FlushResult {
    /// Total number of statements that wrote something.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.links_inserted + self.links_deleted
    }
}

/// `(column, referenced table, referenced column)` for every reference
/// `meta`'s rows hold, declared as a foreign key or through a relationship.
fn references(
    registry: &SchemaRegistry,
    meta: &TableMeta,
) -> Result<Vec<(&'static str, &'static str, &'static str)>> {
    let mut refs: Vec<_> = meta.foreign_keys().collect();
    for relation in &meta.relations {
        if let ForeignKeySide::Local(column) = relation.side {
            let target = relation.related_table();
            let referenced = referenced_column(registry, meta.name(), column, target)?;
            if !refs.contains(&(column, target, referenced)) {
                refs.push((column, target, referenced));
            }
        }
    }
    Ok(refs)
}

fn association<'r>(registry: &'r SchemaRegistry, table: &str) -> Result<&'r AssociationTable> {
    registry
        .associations()
        .iter()
        .find(|a| a.name == table)
        .ok_or_else(|| {
            session_error(
                SessionErrorKind::InvalidState,
                format!("link table '{table}' is not registered"),
            )
        })
}

impl<S: Store> Session<S> {
    /// Run every flush step. `wrote` turns true before the first statement
    /// that changes the store.
    pub(crate) fn execute_flush(&mut self, wrote: &mut bool) -> Result<FlushResult> {
        let started = Instant::now();
        self.ensure_transaction()?;

        let removal_order = self.cascade_removals()?;
        let inserts = self.insert_order()?;
        let deletes = self.delete_order(&removal_order)?;
        tracing::debug!(
            inserts = inserts.len(),
            deletes = deletes.len(),
            dirty = self.data.uow.dirty_entities().len(),
            "Executing flush plan"
        );

        let mut result = FlushResult::default();
        for id in &inserts {
            *wrote = true;
            self.insert_entity(*id)?;
            result.inserted += 1;
        }

        let link_inserts: Vec<LinkRow> = self.data.graph.link_inserts().iter().copied().collect();
        for row in link_inserts {
            if self.data.uow.is_going_away(row.left) || self.data.uow.is_going_away(row.right) {
                continue;
            }
            *wrote = true;
            self.write_link(row, true)?;
            result.links_inserted += 1;
        }

        let updates: Vec<EntityId> = self
            .data
            .uow
            .dirty_entities()
            .iter()
            .copied()
            .filter(|id| {
                self.data
                    .entities
                    .get(id)
                    .is_some_and(|e| e.state == ObjectState::Persistent)
            })
            .collect();
        if self.config().lock_on_flush {
            let targets: Vec<EntityId> = updates.iter().chain(&deletes).copied().collect();
            self.lock_rows(&targets)?;
        }
        for id in updates {
            if self.update_entity(id, wrote)? {
                result.updated += 1;
            }
        }

        let link_deletes: Vec<LinkRow> = self.data.graph.link_deletes().iter().copied().collect();
        for row in link_deletes {
            *wrote = true;
            self.write_link(row, false)?;
            result.links_deleted += 1;
        }
        let purges: Vec<LinkPurge> = self.data.graph.link_purges().iter().copied().collect();
        for purge in purges {
            if self.purge_links(purge, wrote)? {
                result.links_deleted += 1;
            }
        }

        for id in &deletes {
            *wrote = true;
            self.delete_entity(*id)?;
            result.deleted += 1;
        }

        self.finish_flush(&deletes)?;
        tracing::debug!(
            total = result.total(),
            elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
            "Flush plan executed"
        );
        Ok(result)
    }

    fn table_of(&self, id: EntityId) -> &'static str {
        self.data.entities.get(&id).map_or("?", |e| e.table)
    }

    /// New entities, each after the entities its foreign keys point at.
    fn insert_order(&self) -> Result<Vec<EntityId>> {
        let registry = self.registry_arc();
        let new: Vec<EntityId> = self.data.uow.new_entities().iter().copied().collect();
        let mut orderer = FlushOrderer::new(new.clone());

        for &child in &new {
            for ((holder, _), target) in self.data.graph.pending_fk() {
                if *holder == child {
                    orderer.add_dependency(child, *target);
                }
            }
            let entity = self.data.entity(child)?;
            for (column, ref_table, ref_column) in references(&registry, registry.table(entity.table)?)? {
                let value = entity.get(column);
                if value.is_null() {
                    continue;
                }
                for &parent in &new {
                    let candidate = self.data.entity(parent)?;
                    if candidate.table == ref_table && candidate.get(ref_column).sql_eq(value) {
                        orderer.add_dependency(child, parent);
                    }
                }
            }
        }
        Ok(orderer.order(|id| self.table_of(id))?)
    }

    /// Removed entities, each before the entities its stored row points at.
    fn delete_order(&self, removal_order: &[EntityId]) -> Result<Vec<EntityId>> {
        let registry = self.registry_arc();
        let uow = &self.data.uow;
        let mut removed: Vec<EntityId> = removal_order
            .iter()
            .copied()
            .filter(|id| uow.is_removed(*id))
            .collect();
        for id in uow.removed_entities() {
            if !removed.contains(id) {
                removed.push(*id);
            }
        }
        let mut orderer = FlushOrderer::new(removed.clone());

        for &child in &removed {
            let entity = self.data.entity(child)?;
            let snapshot = self.data.tracker.get_snapshot(child);
            for (column, ref_table, ref_column) in references(&registry, registry.table(entity.table)?)? {
                let value = snapshot.map_or_else(|| entity.get(column), |s| s.get(column));
                if value.is_null() {
                    continue;
                }
                for &parent in &removed {
                    let candidate = self.data.entity(parent)?;
                    if candidate.table == ref_table && candidate.get(ref_column).sql_eq(value) {
                        orderer.add_dependency(parent, child);
                    }
                }
            }
        }
        Ok(orderer.order(|id| self.table_of(id))?)
    }

    fn insert_entity(&mut self, id: EntityId) -> Result<()> {
        let registry = self.registry_arc();
        let queued: Vec<(&'static str, EntityId)> = self
            .data
            .graph
            .pending_fk()
            .iter()
            .filter(|((holder, _), _)| *holder == id)
            .map(|((_, column), target)| (*column, *target))
            .collect();
        for (column, target) in queued {
            if self.data.uow.is_going_away(target) {
                // The referenced row is never written; the key stays NULL.
                self.data.graph.drop_pending(id, column);
            } else {
                return Err(UowError::UnresolvedReference { entity: id, column }.into());
            }
        }

        let entity = self.data.entity(id)?;
        let meta = registry.table(entity.table)?;
        let mut columns = Vec::new();
        let mut values = Vec::new();
        let mut generated = None;
        for field in &meta.schema.fields {
            let value = entity.get(field.name);
            if field.auto_increment && value.is_null() {
                generated = Some(field);
                continue;
            }
            columns.push(field.name.to_string());
            values.push(value.clone());
        }
        let statement = Statement::Insert(Insert {
            table: meta.name().to_string(),
            columns,
            values,
            returning: generated.map(|f| f.name.to_string()),
        });
        let outcome = self.store_mut().execute(&statement)?;

        if let Some(field) = generated {
            let key = outcome.generated_key.ok_or(UowError::UnresolvedReference {
                entity: id,
                column: field.name,
            })?;
            let entity = self.data.entity_mut(id)?;
            entity.values.insert(field.name, field.sql_type.normalize(key));
            entity.flush_assigned.push(field.name);
        }

        let entity = self.data.entity_mut(id)?;
        entity.state = ObjectState::Persistent;
        let values = entity.values.clone();
        let key = entity.key(meta).ok_or(UowError::UnresolvedReference {
            entity: id,
            column: meta.primary_key.first().copied().unwrap_or_default(),
        })?;
        self.data.identity.register(meta.name(), key, id)?;
        self.data.tracker.snapshot(id, &values);

        for (holder, column) in self.data.graph.take_waiting_on(id) {
            let holder_table = self.data.entity(holder)?.table;
            let referenced = referenced_column(&registry, holder_table, column, meta.name())?;
            let value = values.get(referenced).cloned().unwrap_or(Value::Null);
            self.data.assign(holder, column, value)?;
            self.data.entity_mut(holder)?.flush_assigned.push(column);
        }
        tracing::trace!(id = %id, table = meta.name(), "Inserted entity");
        Ok(())
    }

    fn lock_rows(&mut self, ids: &[EntityId]) -> Result<()> {
        let registry = self.registry_arc();
        let mode = self.config().lock_wait;
        for id in ids {
            let entity = self.data.entity(*id)?;
            let meta = registry.table(entity.table)?;
            let Some(key) = entity.key(meta) else {
                continue;
            };
            let select = Select::from(meta.name())
                .filters(key_filter(meta, &key))
                .for_update(mode);
            if self.store_mut().query(&select)?.is_empty() {
                return Err(session_error(
                    SessionErrorKind::InvalidState,
                    format!("the row behind entity {id} ({} {key}) no longer exists", meta.name()),
                ));
            }
        }
        Ok(())
    }

    /// UPDATE the changed columns. Returns false when nothing changed.
    fn update_entity(&mut self, id: EntityId, wrote: &mut bool) -> Result<bool> {
        let registry = self.registry_arc();
        let entity = self.data.entity(id)?;
        let changed = self.data.tracker.changed_fields(id, &entity.values);
        if changed.is_empty() {
            return Ok(false);
        }
        let meta = registry.table(entity.table)?;
        let key = entity.key(meta).ok_or(UowError::UnresolvedReference {
            entity: id,
            column: meta.primary_key.first().copied().unwrap_or_default(),
        })?;
        let set = changed
            .iter()
            .map(|column| ((*column).to_string(), entity.get(column).clone()))
            .collect();
        let values = entity.values.clone();
        let statement = Statement::Update(Update {
            table: meta.name().to_string(),
            set,
            filter: key_filter(meta, &key),
        });

        *wrote = true;
        let outcome = self.store_mut().execute(&statement)?;
        if outcome.rows_affected == 0 {
            return Err(session_error(
                SessionErrorKind::InvalidState,
                format!(
                    "UPDATE of {} {key} matched no row; it was deleted or changed concurrently",
                    meta.name()
                ),
            ));
        }
        self.data.tracker.refresh(id, &values);
        tracing::trace!(id = %id, columns = ?changed, "Updated entity");
        Ok(true)
    }

    fn delete_entity(&mut self, id: EntityId) -> Result<()> {
        let registry = self.registry_arc();
        let entity = self.data.entity(id)?;
        let meta = registry.table(entity.table)?;
        let Some(key) = entity.key(meta) else {
            return Ok(());
        };
        let statement = Statement::Delete(Delete {
            table: meta.name().to_string(),
            filter: key_filter(meta, &key),
        });
        let outcome = self.store_mut().execute(&statement)?;
        if outcome.rows_affected == 0 {
            tracing::warn!(table = meta.name(), key = %key, "DELETE matched no row");
        }
        tracing::trace!(id = %id, table = meta.name(), "Deleted entity");
        Ok(())
    }

    fn write_link(&mut self, row: LinkRow, insert: bool) -> Result<()> {
        let registry = self.registry_arc();
        let assoc = association(&registry, row.table)?;
        let mut values = Vec::with_capacity(2);
        for (entity, column) in [row.left, row.right].into_iter().zip(&assoc.columns) {
            let value = self.data.entity(entity)?.get(column.references_column).clone();
            if value.is_null() {
                return Err(UowError::UnresolvedReference {
                    entity,
                    column: column.name,
                }
                .into());
            }
            values.push(value);
        }

        let statement = if insert {
            Statement::Insert(Insert {
                table: assoc.name.to_string(),
                columns: assoc.columns.iter().map(|c| c.name.to_string()).collect(),
                values,
                returning: None,
            })
        } else {
            Statement::Delete(Delete {
                table: assoc.name.to_string(),
                filter: assoc
                    .columns
                    .iter()
                    .zip(values)
                    .map(|(c, v)| Condition::eq(c.name, v))
                    .collect(),
            })
        };
        self.store_mut().execute(&statement)?;
        tracing::trace!(table = assoc.name, left = %row.left, right = %row.right, insert, "Wrote link row");
        Ok(())
    }

    /// Delete every association row naming an entity that has a stored row.
    fn purge_links(&mut self, purge: LinkPurge, wrote: &mut bool) -> Result<bool> {
        let entity = self.data.entity(purge.entity)?;
        if entity.state != ObjectState::Persistent || self.data.uow.is_new(purge.entity) {
            return Ok(false);
        }
        let registry = self.registry_arc();
        let assoc = association(&registry, purge.table)?;
        let Some(column) = assoc.columns.iter().find(|c| c.name == purge.column) else {
            return Ok(false);
        };
        let value = entity.get(column.references_column).clone();
        let statement = Statement::Delete(Delete {
            table: assoc.name.to_string(),
            filter: vec![Condition::eq(column.name, value)],
        });
        *wrote = true;
        self.store_mut().execute(&statement)?;
        Ok(true)
    }

    /// Settle session state after every statement succeeded.
    fn finish_flush(&mut self, deleted: &[EntityId]) -> Result<()> {
        let registry = self.registry_arc();
        let discarded: Vec<EntityId> = self.data.uow.discarded_entities().iter().copied().collect();
        for (ids, state) in [(deleted, ObjectState::Deleted), (&discarded[..], ObjectState::Detached)] {
            for &id in ids {
                let entity = self.data.entity(id)?;
                let meta = registry.table(entity.table)?;
                if let Some(key) = entity.key(meta) {
                    if self.data.identity.get(meta.name(), &key) == Some(id) {
                        self.data.identity.forget(meta.name(), &key);
                    }
                }
                self.data.tracker.forget(id);
                self.data.graph.forget(id);
                let entity = self.data.entity_mut(id)?;
                entity.state = state;
                entity.related.clear();
            }
        }
        let gone: Vec<EntityId> = deleted.iter().chain(&discarded).copied().collect();
        self.data.remove_from_slots(&gone);
        self.data.graph.clear_written();
        self.data.uow.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u64]) -> Vec<EntityId> {
        raw.iter().map(|n| EntityId(*n)).collect()
    }

    #[test]
    fn orderer_keeps_input_order_without_dependencies() {
        let orderer = FlushOrderer::new(ids(&[3, 1, 2]));
        assert_eq!(orderer.order(|_| "t").unwrap(), ids(&[3, 1, 2]));
    }

    #[test]
    fn orderer_puts_dependencies_first() {
        // 1 -> 2 -> 3 (each depends on the next)
        let mut orderer = FlushOrderer::new(ids(&[1, 2, 3]));
        orderer.add_dependency(EntityId(1), EntityId(2));
        orderer.add_dependency(EntityId(2), EntityId(3));
        assert_eq!(orderer.order(|_| "t").unwrap(), ids(&[3, 2, 1]));
    }

    #[test]
    fn orderer_ignores_unknown_and_self_dependencies() {
        let mut orderer = FlushOrderer::new(ids(&[1, 2]));
        orderer.add_dependency(EntityId(1), EntityId(1));
        orderer.add_dependency(EntityId(1), EntityId(9));
        assert_eq!(orderer.order(|_| "t").unwrap(), ids(&[1, 2]));
    }

    #[test]
    fn orderer_reports_cycles() {
        let mut orderer = FlushOrderer::new(ids(&[1, 2, 3]));
        orderer.add_dependency(EntityId(1), EntityId(2));
        orderer.add_dependency(EntityId(2), EntityId(1));
        let err = orderer
            .order(|id| if id == EntityId(1) { "users" } else { "teams" })
            .unwrap_err();
        assert_eq!(
            err,
            UowError::CycleDetected {
                tables: vec!["users", "teams"]
            }
        );
    }

    #[test]
    fn flush_result_total() {
        let result = FlushResult {
            inserted: 2,
            updated: 1,
            deleted: 1,
            links_inserted: 3,
            links_deleted: 0,
        };
        assert_eq!(result.total(), 7);
        assert_eq!(FlushResult::default().total(), 0);
    }
}
