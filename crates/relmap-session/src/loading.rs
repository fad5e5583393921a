//! Row loading and relationship loading.
//!
//! Every row read from the store passes through [`Session::load_row`], so a
//! row the session already tracks resolves to the existing entity instead of
//! overwriting it.
//!
//! Relationship slots are filled lazily on first access, or for many parents
//! at once with [`Session::load_relationship_batch`]. Either way the stored
//! rows are merged with the relationship changes still waiting for a flush.

use crate::entity::{EntityId, ObjectState, Related};
use crate::graph::referenced_column;
use crate::{Session, session_error};
use relmap_core::{
    Condition, ForeignKeySide, KeyPart, LinkTableInfo, OrderBy, PkKey, Relation, Result, Row,
    SchemaRegistry, Select, SessionErrorKind, Store, Value,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

impl<S: Store> Session<S> {
    /// Route a fetched row through the identity map.
    ///
    /// An expired entity takes the row's values. With `refresh`, so does a
    /// tracked entity without unflushed changes.
    pub(crate) fn load_row(&mut self, table: &str, row: &Row, refresh: bool) -> Result<EntityId> {
        let registry = self.registry_arc();
        let meta = registry.table(table)?;
        let values: BTreeMap<&'static str, Value> = meta
            .schema
            .fields
            .iter()
            .map(|f| {
                let value = row.get_by_name(f.name).cloned().unwrap_or(Value::Null);
                (f.name, f.sql_type.normalize(value))
            })
            .collect();
        let key = PkKey::from_values(
            meta.primary_key
                .iter()
                .map(|c| values.get(c).unwrap_or(&Value::Null)),
        )?;

        if let Some(id) = self.data.identity.get(meta.name(), &key) {
            let data = &mut self.data;
            let Some(entity) = data.entities.get_mut(&id) else {
                return Ok(id);
            };
            let dirty = data.tracker.is_dirty(id, &entity.values);
            if entity.state == ObjectState::Persistent && (entity.expired || (refresh && !dirty)) {
                if entity.values != values {
                    // Slots backed by local keys may point elsewhere now.
                    for relation in &meta.relations {
                        if matches!(relation.side, ForeignKeySide::Local(_)) {
                            entity.related.remove(relation.name());
                        }
                    }
                }
                entity.values = values;
                entity.expired = false;
                data.tracker.snapshot(id, &entity.values);
                tracing::trace!(id = %id, "Refreshed entity from row");
            }
            return Ok(id);
        }

        let id = self.alloc_id();
        let mut entity = crate::entity::Entity::new(meta.name(), values);
        entity.state = ObjectState::Persistent;
        entity.loaded = true;
        self.data.identity.register(meta.name(), key, id)?;
        self.data.tracker.snapshot(id, &entity.values);
        self.data.entities.insert(id, entity);
        tracing::trace!(id = %id, table = meta.name(), "Loaded entity");
        Ok(id)
    }

    /// Fill a relationship slot if it is not loaded yet.
    pub(crate) fn ensure_loaded(&mut self, id: EntityId, relationship: &str) -> Result<()> {
        let registry = self.registry_arc();
        let entity = self.data.live(id)?;
        let relation = registry.table(entity.table)?.relation(relationship)?;
        if entity.related.contains_key(relation.name()) {
            return Ok(());
        }
        self.load_slots(&[id], relation)
    }

    /// Re-read a relationship from the store, replacing the loaded slot.
    ///
    /// Relationship changes not yet flushed are kept.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn load_relationship(
        &mut self,
        id: EntityId,
        relationship: &str,
    ) -> Result<Vec<EntityId>> {
        self.ensure_open()?;
        let registry = self.registry_arc();
        let entity = self.data.live(id)?;
        let relation = registry.table(entity.table)?.relation(relationship)?;
        if entity.state == ObjectState::Persistent {
            self.data.entity_mut(id)?.related.remove(relation.name());
        }
        self.ensure_loaded(id, relation.name())?;
        self.related(id, relation.name())
    }

    /// Load one relationship for many entities of the same table with a
    /// single query per table involved.
    ///
    /// Returns how many slots were filled.
    #[tracing::instrument(level = "debug", skip(self, ids))]
    pub fn load_relationship_batch(
        &mut self,
        ids: &[EntityId],
        relationship: &str,
    ) -> Result<usize> {
        self.ensure_open()?;
        let Some(first) = ids.first() else {
            return Ok(0);
        };
        let registry = self.registry_arc();
        let table = self.data.entity(*first)?.table;
        let relation = registry.table(table)?.relation(relationship)?;

        let mut targets = Vec::new();
        for id in ids {
            let entity = self.data.live(*id)?;
            if entity.table != table {
                return Err(session_error(
                    SessionErrorKind::InvalidState,
                    format!(
                        "batch loading '{relationship}' expects '{table}' entities, got '{}'",
                        entity.table
                    ),
                ));
            }
            if !entity.related.contains_key(relation.name()) && !targets.contains(id) {
                targets.push(*id);
            }
        }
        self.load_slots(&targets, relation)?;
        tracing::debug!(loaded = targets.len(), relationship, "Batch loaded relationship");
        Ok(targets.len())
    }

    fn load_slots(&mut self, ids: &[EntityId], relation: &Relation) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let registry = self.registry_arc();
        let table = self.data.entity(ids[0])?.table;
        let slots = match relation.side {
            ForeignKeySide::Local(column) => {
                self.fetch_parents(&registry, ids, table, column, relation)?
            }
            ForeignKeySide::Remote(column) => {
                self.fetch_children(&registry, ids, table, column, relation)?
            }
            ForeignKeySide::Link(link) => self.fetch_linked(&registry, ids, &link, relation)?,
        };
        for (id, related) in ids.iter().zip(slots) {
            self.install(*id, relation, related)?;
        }
        Ok(())
    }

    fn install(&mut self, id: EntityId, relation: &Relation, ids: Vec<EntityId>) -> Result<()> {
        let slot = if relation.is_collection() {
            Related::Many(ids.clone())
        } else {
            Related::One(ids.first().copied())
        };
        self.data.entity_mut(id)?.related.insert(relation.name(), slot);

        // Children of a loaded collection know their parent already.
        if let (ForeignKeySide::Remote(_), Some(inverse)) = (relation.side, relation.inverse) {
            for child in ids {
                let entity = self.data.entity_mut(child)?;
                entity
                    .related
                    .entry(inverse)
                    .or_insert(Related::One(Some(id)));
            }
        }
        Ok(())
    }

    /// Tracked, live entity of `table` whose `column` equals `value`.
    fn find_tracked(
        &self,
        registry: &SchemaRegistry,
        table: &str,
        column: &str,
        value: &Value,
    ) -> Result<Option<EntityId>> {
        if value.is_null() {
            return Ok(None);
        }
        let meta = registry.table(table)?;
        if meta.single_pk() == Some(column) {
            let found = PkKey::single(value.clone())
                .ok()
                .and_then(|key| self.data.identity.get(meta.name(), &key))
                .filter(|id| self.data.entity(*id).is_ok_and(|e| e.is_live()));
            return Ok(found);
        }
        Ok(self
            .data
            .entities
            .iter()
            .find(|(_, e)| e.table == table && e.is_live() && e.get(column).sql_eq(value))
            .map(|(id, _)| *id))
    }

    /// Many-to-one: resolve each holder's foreign key.
    fn fetch_parents(
        &mut self,
        registry: &Arc<SchemaRegistry>,
        ids: &[EntityId],
        table: &'static str,
        column: &'static str,
        relation: &Relation,
    ) -> Result<Vec<Vec<EntityId>>> {
        let target = relation.related_table();
        let referenced = referenced_column(registry, table, column, target)?;

        let mut wanted = Vec::new();
        for id in ids {
            if self.data.graph.pending_target(*id, column).is_some() {
                continue;
            }
            let value = self.data.entity(*id)?.get(column).clone();
            if !value.is_null()
                && self.find_tracked(registry, target, referenced, &value)?.is_none()
                && !wanted.iter().any(|w: &Value| w.sql_eq(&value))
            {
                wanted.push(value);
            }
        }
        if !wanted.is_empty() {
            self.ensure_transaction()?;
            let select = Select::from(target).filter(Condition::in_list(referenced, wanted));
            let rows = self.store_mut().query(&select)?;
            for row in &rows {
                self.load_row(target, row, false)?;
            }
        }

        let mut slots = Vec::with_capacity(ids.len());
        for id in ids {
            let parent = match self.data.graph.pending_target(*id, column) {
                Some(pending) => Some(pending),
                None => {
                    let value = self.data.entity(*id)?.get(column).clone();
                    self.find_tracked(registry, target, referenced, &value)?
                }
            };
            slots.push(parent.into_iter().collect());
        }
        Ok(slots)
    }

    /// One-to-many (or one-to-one from the parent side): find rows whose
    /// foreign key refers to each holder.
    fn fetch_children(
        &mut self,
        registry: &Arc<SchemaRegistry>,
        ids: &[EntityId],
        table: &'static str,
        column: &'static str,
        relation: &Relation,
    ) -> Result<Vec<Vec<EntityId>>> {
        let child_table = relation.related_table();
        let referenced = referenced_column(registry, child_table, column, table)?;

        let mut keys = Vec::new();
        for id in ids {
            let entity = self.data.entity(*id)?;
            let key = entity.get(referenced).clone();
            if entity.state == ObjectState::Persistent && !key.is_null() {
                keys.push(key);
            }
        }

        let mut stored: BTreeMap<KeyPart, Vec<EntityId>> = BTreeMap::new();
        if !keys.is_empty() {
            self.ensure_transaction()?;
            let mut select = Select::from(child_table).filter(Condition::in_list(column, keys));
            if let Some(order) = relation.info.order_by {
                match OrderBy::parse(order) {
                    Some(order) => select = select.order_by(order),
                    None => tracing::warn!(order, "Ignoring unparseable relationship order_by"),
                }
            }
            let rows = self.store_mut().query(&select)?;
            for row in &rows {
                let child = self.load_row(child_table, row, false)?;
                let stored_key = row.get_by_name(column).and_then(KeyPart::from_value);
                if let Some(part) = stored_key {
                    stored.entry(part).or_default().push(child);
                }
            }
        }

        let candidates: Vec<EntityId> = self
            .data
            .entities
            .iter()
            .filter(|(_, e)| e.table == child_table && e.is_live())
            .map(|(cid, _)| *cid)
            .collect();

        let mut slots = Vec::with_capacity(ids.len());
        for id in ids {
            let key = self.data.entity(*id)?.get(referenced).clone();
            let points_here = |session: &Self, child: EntityId| -> bool {
                match session.data.graph.pending_target(child, column) {
                    Some(target) => target == *id,
                    None => {
                        !key.is_null()
                            && session
                                .data
                                .entity(child)
                                .is_ok_and(|e| e.get(column).sql_eq(&key))
                    }
                }
            };

            let mut children = Vec::new();
            if let Some(part) = KeyPart::from_value(&key) {
                for child in stored.get(&part).into_iter().flatten() {
                    if points_here(self, *child) && !children.contains(child) {
                        children.push(*child);
                    }
                }
            }
            for child in &candidates {
                if !children.contains(child) && points_here(self, *child) {
                    children.push(*child);
                }
            }
            slots.push(children);
        }
        Ok(slots)
    }

    /// Many-to-many: read the link table, then the related rows it names.
    fn fetch_linked(
        &mut self,
        registry: &Arc<SchemaRegistry>,
        ids: &[EntityId],
        link: &LinkTableInfo,
        relation: &Relation,
    ) -> Result<Vec<Vec<EntityId>>> {
        let target = relation.related_table();
        let assoc = registry
            .associations()
            .iter()
            .find(|a| a.name == link.table_name)
            .ok_or_else(|| {
                session_error(
                    SessionErrorKind::InvalidState,
                    format!("link table '{}' is not registered", link.table_name),
                )
            })?;
        let column_ref = |name: &str| {
            assoc
                .columns
                .iter()
                .find(|c| c.name == name)
                .map(|c| c.references_column)
        };
        let own_ref = column_ref(link.local_column).ok_or_else(|| {
            session_error(
                SessionErrorKind::InvalidState,
                format!("'{}' has no column '{}'", assoc.name, link.local_column),
            )
        })?;
        let other_ref = column_ref(link.remote_column).ok_or_else(|| {
            session_error(
                SessionErrorKind::InvalidState,
                format!("'{}' has no column '{}'", assoc.name, link.remote_column),
            )
        })?;
        let own_is_left = assoc.columns[0].name == link.local_column;

        let mut keys = Vec::new();
        for id in ids {
            let entity = self.data.entity(*id)?;
            let key = entity.get(own_ref).clone();
            if entity.state == ObjectState::Persistent && !key.is_null() {
                keys.push(key);
            }
        }

        let mut pairs: Vec<(KeyPart, Value)> = Vec::new();
        if !keys.is_empty() {
            self.ensure_transaction()?;
            let select = Select::from(link.table_name)
                .filter(Condition::in_list(link.local_column, keys));
            for row in self.store_mut().query(&select)? {
                let own = row.get_by_name(link.local_column).and_then(KeyPart::from_value);
                let other = row.get_by_name(link.remote_column).cloned();
                if let (Some(own), Some(other)) = (own, other) {
                    pairs.push((own, other));
                }
            }
        }

        let mut untracked = Vec::new();
        for (_, other) in &pairs {
            if self.find_tracked(registry, target, other_ref, other)?.is_none()
                && !untracked.iter().any(|u: &Value| u.sql_eq(other))
            {
                untracked.push(other.clone());
            }
        }
        if !untracked.is_empty() {
            let select = Select::from(target).filter(Condition::in_list(other_ref, untracked));
            let rows = self.store_mut().query(&select)?;
            for row in &rows {
                self.load_row(target, row, false)?;
            }
        }

        let mut slots = Vec::with_capacity(ids.len());
        for id in ids {
            let key = KeyPart::from_value(self.data.entity(*id)?.get(own_ref));
            let mut linked = Vec::new();
            for (own, other) in &pairs {
                if Some(own) != key.as_ref() {
                    continue;
                }
                if let Some(other) = self.find_tracked(registry, target, other_ref, other)? {
                    if !linked.contains(&other) {
                        linked.push(other);
                    }
                }
            }

            let graph = &self.data.graph;
            let oriented = |row: &crate::graph::LinkRow| -> Option<EntityId> {
                if row.table != assoc.name {
                    return None;
                }
                match (own_is_left, row.left == *id, row.right == *id) {
                    (true, true, _) => Some(row.right),
                    (false, _, true) => Some(row.left),
                    _ => None,
                }
            };
            let deleted: BTreeSet<EntityId> =
                graph.link_deletes().iter().filter_map(oriented).collect();
            let purged = graph
                .link_purges()
                .iter()
                .any(|p| p.table == assoc.name && p.entity == *id);
            linked.retain(|other| {
                !purged
                    && !deleted.contains(other)
                    && !graph
                        .link_purges()
                        .iter()
                        .any(|p| p.table == assoc.name && p.entity == *other)
            });
            for other in graph.link_inserts().iter().filter_map(oriented) {
                if !linked.contains(&other) {
                    linked.push(other);
                }
            }
            slots.push(linked);
        }
        Ok(slots)
    }
}
