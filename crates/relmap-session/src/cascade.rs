//! Delete cascades.
//!
//! Before a flush writes anything, every entity scheduled for removal is
//! walked along its relationships:
//!
//! - children under a `delete` cascade are removed as well, recursively
//! - other children keep living with their foreign key set to NULL
//! - association rows naming the entity are purged
//! - a parent reached through a many-to-one `delete` cascade goes too
//!
//! The walk records entities children-first, which is the order their rows
//! can be deleted in.

use crate::Session;
use crate::entity::EntityId;
use crate::graph::{LinkPurge, Linker};
use relmap_core::{ForeignKeySide, Result, Store};
use std::collections::BTreeSet;

impl<S: Store> Session<S> {
    /// Expand the removal set along cascades. Returns every removed or
    /// discarded entity, children before parents.
    pub(crate) fn cascade_removals(&mut self) -> Result<Vec<EntityId>> {
        let roots: Vec<EntityId> = self
            .data
            .uow
            .removed_entities()
            .iter()
            .chain(self.data.uow.discarded_entities())
            .copied()
            .collect();
        let mut visited = BTreeSet::new();
        let mut order = Vec::new();
        for root in roots {
            self.cascade_delete(root, &mut visited, &mut order)?;
        }
        tracing::debug!(count = order.len(), "Cascade expanded removals");
        Ok(order)
    }

    fn cascade_delete(
        &mut self,
        id: EntityId,
        visited: &mut BTreeSet<EntityId>,
        order: &mut Vec<EntityId>,
    ) -> Result<()> {
        if !visited.insert(id) {
            return Ok(());
        }
        let registry = self.registry_arc();
        let table = self.data.entity(id)?.table;
        let meta = registry.table(table)?;
        let mut parents = Vec::new();

        for relation in &meta.relations {
            match relation.side {
                ForeignKeySide::Remote(_) => {
                    self.ensure_loaded(id, relation.name())?;
                    let children = self.related_ids(id, relation.name())?;
                    for child in children {
                        if relation.cascade.delete {
                            if !self.data.uow.is_going_away(child) {
                                tracing::trace!(parent = %id, child = %child, "Cascading delete");
                                self.data.uow.mark_removed(child);
                            }
                            self.cascade_delete(child, visited, order)?;
                        } else if !self.data.uow.is_going_away(child) {
                            Linker::new(&mut self.data, &registry).unlink(
                                id,
                                relation.name(),
                                child,
                            )?;
                        }
                    }
                }
                ForeignKeySide::Link(link) => {
                    self.data.graph.purge(LinkPurge {
                        table: link.table_name,
                        column: link.local_column,
                        entity: id,
                    });
                }
                ForeignKeySide::Local(_) if relation.cascade.delete => {
                    self.ensure_loaded(id, relation.name())?;
                    parents.extend(self.related_ids(id, relation.name())?);
                }
                ForeignKeySide::Local(_) => {}
            }
        }

        order.push(id);
        for parent in parents {
            if !self.data.uow.is_going_away(parent) {
                self.data.uow.mark_removed(parent);
            }
            self.cascade_delete(parent, visited, order)?;
        }
        Ok(())
    }

    fn related_ids(&self, id: EntityId, relationship: &str) -> Result<Vec<EntityId>> {
        Ok(self
            .data
            .entity(id)?
            .related
            .get(relationship)
            .map(crate::entity::Related::ids)
            .unwrap_or_default())
    }
}
