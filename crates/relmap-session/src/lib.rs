//! Session and Unit of Work for relmap.
//!
//! `relmap-session` is the **unit-of-work layer**. It coordinates object
//! identity, change tracking, relationship bookkeeping and transactional
//! persistence over any [`Store`].
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one in-memory entity per (table, primary key).
//! - **Change tracking**: inserts, column changes and removals wait for flush.
//! - **Relationship graph**: links keep both sides and the foreign keys in step.
//! - **Cascades**: removing a parent reaches its children before the flush.
//! - **Transactional safety**: a failed flush rolls the store back and returns
//!   the session to its last committed state.
//!
//! # Design
//!
//! - Entities live in a per-session arena addressed by [`EntityId`] handles,
//!   so bidirectional references never form ownership cycles.
//! - Schemas come from an explicit, validated [`SchemaRegistry`].
//! - No autoflush by default.
//!
//! # Example
//!
//! ```ignore
//! let factory = SessionFactory::new(registry);
//! let mut session = factory.session(db.connect());
//!
//! let user = session.add("users", [("name", "ann".into())])?;
//! let post = session.add("posts", [("title", "hello".into())])?;
//! session.link(user, "posts", post)?;
//!
//! session.commit()?;
//! assert_eq!(session.related(post, "author")?, vec![user]);
//! ```

pub mod change_tracker;
mod cascade;
pub mod entity;
pub mod flush;
pub mod graph;
pub mod identity_map;
mod loading;
pub mod unit_of_work;

pub use change_tracker::{ChangeTracker, ObjectSnapshot};
pub use entity::{Entity, EntityId, ObjectState, Related};
pub use flush::{FlushOrderer, FlushResult};
pub use graph::{LinkPurge, LinkRow, RelationshipGraph};
pub use identity_map::IdentityMap;
pub use unit_of_work::{PendingCounts, UnitOfWork, UowError};

use graph::Linker;
use relmap_core::{
    Condition, ConfigError, Error, FieldInfo, ForeignKeySide, LockMode, Model, OrderBy, PkKey,
    Result, Row, SchemaRegistry, Select, SessionError, SessionErrorKind, Store, TableMeta,
    TypeError, Value,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

// ============================================================================
// Session Events
// ============================================================================

/// Type alias for session event callbacks.
///
/// Callbacks receive no arguments and return `Result<(), Error>`.
/// Returning `Err` aborts the operation (e.g., prevents a commit).
type SessionEventFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Holds registered session-level event callbacks.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_flush: Vec<SessionEventFn>,
    after_flush: Vec<SessionEventFn>,
    before_commit: Vec<SessionEventFn>,
    after_commit: Vec<SessionEventFn>,
    after_rollback: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("before_commit", &self.before_commit.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    fn slot(&mut self, event: SessionEvent) -> &mut Vec<SessionEventFn> {
        match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
            SessionEvent::BeforeCommit => &mut self.before_commit,
            SessionEvent::AfterCommit => &mut self.after_commit,
            SessionEvent::AfterRollback => &mut self.after_rollback,
        }
    }

    fn fire(&mut self, event: SessionEvent) -> Result<()> {
        for cb in self.slot(event).iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before flush executes pending changes.
    BeforeFlush,
    /// Fired after flush completes successfully.
    AfterFlush,
    /// Fired before commit (after flush).
    BeforeCommit,
    /// Fired after commit completes successfully.
    AfterCommit,
    /// Fired after rollback completes.
    AfterRollback,
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Flush pending changes before queries.
    pub auto_flush: bool,
    /// Expire persistent entities after commit so the next access re-reads them.
    pub expire_on_commit: bool,
    /// Lock the rows a flush is about to update or delete.
    pub lock_on_flush: bool,
    /// How `lock_on_flush` waits for rows locked by other transactions.
    pub lock_wait: LockMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_flush: false,
            expire_on_commit: true,
            lock_on_flush: false,
            lock_wait: LockMode::Wait,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn auto_flush(mut self, value: bool) -> Self {
        self.auto_flush = value;
        self
    }

    #[must_use]
    pub fn expire_on_commit(mut self, value: bool) -> Self {
        self.expire_on_commit = value;
        self
    }

    #[must_use]
    pub fn lock_on_flush(mut self, mode: LockMode) -> Self {
        self.lock_on_flush = true;
        self.lock_wait = mode;
        self
    }

    /// Parse from JSON. Missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::Config(ConfigError {
                message: format!("invalid session config: {e}"),
                source: Some(Box::new(e)),
            })
        })
    }
}

/// Options for `Session::get_with_options()`.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// If true, use SELECT ... FOR UPDATE to lock the row.
    pub with_for_update: bool,
    /// If true, fail instead of waiting for a row another transaction holds.
    pub nowait: bool,
}

impl GetOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the `with_for_update` option (builder pattern).
    #[must_use]
    pub fn with_for_update(mut self, value: bool) -> Self {
        self.with_for_update = value;
        self
    }

    /// Set the `nowait` option (builder pattern).
    #[must_use]
    pub fn nowait(mut self, value: bool) -> Self {
        self.nowait = value;
        self
    }

    fn lock(&self) -> Option<LockMode> {
        match (self.with_for_update, self.nowait) {
            (false, _) => None,
            (true, false) => Some(LockMode::Wait),
            (true, true) => Some(LockMode::NoWait),
        }
    }
}

/// Options for `Session::query()`.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
    pub lock: Option<LockMode>,
}

impl QueryOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    #[must_use]
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    #[must_use]
    pub fn for_update(mut self, mode: LockMode) -> Self {
        self.lock = Some(mode);
        self
    }
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Flushing,
    Closed,
}

// ============================================================================
// Session State
// ============================================================================

fn session_error(kind: SessionErrorKind, message: impl Into<String>) -> Error {
    Error::Session(SessionError::new(kind, message))
}

/// Everything a session restores on rollback.
///
/// The entity arena and the lookup tables sit in persistent maps, so taking
/// a checkpoint after each commit is a cheap clone.
#[derive(Debug, Clone, Default)]
pub(crate) struct SessionData {
    pub(crate) entities: im::OrdMap<EntityId, Entity>,
    pub(crate) identity: IdentityMap,
    pub(crate) tracker: ChangeTracker,
    pub(crate) uow: UnitOfWork,
    pub(crate) graph: RelationshipGraph,
}

impl SessionData {
    pub(crate) fn entity(&self, id: EntityId) -> Result<&Entity> {
        self.entities.get(&id).ok_or_else(|| unknown_entity(id))
    }

    pub(crate) fn entity_mut(&mut self, id: EntityId) -> Result<&mut Entity> {
        self.entities.get_mut(&id).ok_or_else(|| unknown_entity(id))
    }

    /// Entity that is still pending or persistent.
    pub(crate) fn live(&self, id: EntityId) -> Result<&Entity> {
        let entity = self.entity(id)?;
        if entity.is_live() {
            Ok(entity)
        } else {
            Err(session_error(
                SessionErrorKind::InvalidState,
                format!("entity {id} is {:?}", entity.state),
            ))
        }
    }

    /// Set a column, marking a persistent entity dirty when the value changes.
    pub(crate) fn assign(&mut self, id: EntityId, column: &'static str, value: Value) -> Result<()> {
        let entity = self.entity_mut(id)?;
        let changed = entity.values.get(column) != Some(&value);
        entity.values.insert(column, value);
        if changed && entity.state == ObjectState::Persistent {
            self.uow.mark_dirty(id);
        }
        Ok(())
    }

    /// Drop `gone` from every relationship slot.
    pub(crate) fn remove_from_slots(&mut self, gone: &[EntityId]) {
        if gone.is_empty() {
            return;
        }
        let holders: Vec<EntityId> = self
            .entities
            .iter()
            .filter(|(_, e)| {
                e.related
                    .values()
                    .any(|slot| gone.iter().any(|g| slot.contains(*g)))
            })
            .map(|(id, _)| *id)
            .collect();
        for holder in holders {
            if let Some(entity) = self.entities.get_mut(&holder) {
                for slot in entity.related.values_mut() {
                    for g in gone {
                        slot.remove(*g);
                    }
                }
            }
        }
    }
}

fn unknown_entity(id: EntityId) -> Error {
    session_error(
        SessionErrorKind::UnknownEntity,
        format!("entity {id} is not part of this session"),
    )
}

fn check_value(meta: &TableMeta, field: &FieldInfo, value: Value) -> Result<Value> {
    if field.sql_type.accepts(&value) {
        Ok(field.sql_type.normalize(value))
    } else {
        Err(Error::Type(TypeError {
            expected: field.sql_type.sql_name(),
            actual: value.type_name().to_string(),
            column: Some(format!("{}.{}", meta.name(), field.name)),
        }))
    }
}

/// `pk = value` conditions for a key.
pub(crate) fn key_filter(meta: &TableMeta, key: &PkKey) -> Vec<Condition> {
    meta.primary_key
        .iter()
        .zip(key.to_values())
        .map(|(column, value)| Condition::eq(*column, value))
        .collect()
}

// ============================================================================
// Session Factory
// ============================================================================

/// Creates sessions that share one schema registry and configuration.
#[derive(Debug, Clone)]
pub struct SessionFactory {
    registry: Arc<SchemaRegistry>,
    config: SessionConfig,
}

impl SessionFactory {
    pub fn new(registry: SchemaRegistry) -> Self {
        Self::from_shared(Arc::new(registry))
    }

    pub fn from_shared(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            registry,
            config: SessionConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Open a session over `store`.
    pub fn session<S: Store>(&self, store: S) -> Session<S> {
        Session::with_config(Arc::clone(&self.registry), store, self.config.clone())
    }
}

// ============================================================================
// Session
// ============================================================================

/// A unit of work over one store handle.
///
/// A session is used from one thread at a time (`&mut self` throughout); it
/// is `Send` whenever the store is.
pub struct Session<S: Store> {
    registry: Arc<SchemaRegistry>,
    store: S,
    config: SessionConfig,
    pub(crate) data: SessionData,
    /// State as of the last commit or rollback.
    checkpoint: SessionData,
    next_id: u64,
    lifecycle: SessionState,
    event_callbacks: SessionEventCallbacks,
}

impl<S: Store> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("lifecycle", &self.lifecycle)
            .field("entities", &self.data.entities.len())
            .field("tracked", &self.data.identity.len())
            .field("pending", &self.data.uow.pending_count())
            .field("in_transaction", &self.store.in_transaction())
            .finish_non_exhaustive()
    }
}

impl<S: Store> Session<S> {
    pub fn new(registry: Arc<SchemaRegistry>, store: S) -> Self {
        Self::with_config(registry, store, SessionConfig::default())
    }

    pub fn with_config(registry: Arc<SchemaRegistry>, store: S, config: SessionConfig) -> Self {
        Self {
            registry,
            store,
            config,
            data: SessionData::default(),
            checkpoint: SessionData::default(),
            next_id: 0,
            lifecycle: SessionState::Active,
            event_callbacks: SessionEventCallbacks::default(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn lifecycle(&self) -> SessionState {
        self.lifecycle
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle == SessionState::Closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Session(SessionError::closed()))
        } else {
            Ok(())
        }
    }

    /// Start the store transaction on first use.
    pub(crate) fn ensure_transaction(&mut self) -> Result<()> {
        if !self.store.in_transaction() {
            self.store.begin()?;
            tracing::debug!("Began store transaction");
        }
        Ok(())
    }

    pub(crate) fn alloc_id(&mut self) -> EntityId {
        self.next_id += 1;
        EntityId(self.next_id)
    }

    pub(crate) fn registry_arc(&self) -> Arc<SchemaRegistry> {
        Arc::clone(&self.registry)
    }

    pub(crate) fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    // ========================================================================
    // Adding entities
    // ========================================================================

    /// Add a new entity. It is inserted on the next flush.
    ///
    /// Columns left out get their declared default, or NULL.
    #[tracing::instrument(level = "debug", skip(self, values))]
    pub fn add<'c>(
        &mut self,
        table: &str,
        values: impl IntoIterator<Item = (&'c str, Value)>,
    ) -> Result<EntityId> {
        self.ensure_open()?;
        let registry = self.registry_arc();
        let meta = registry.table(table)?;

        let mut columns = BTreeMap::new();
        for (column, value) in values {
            let field = meta.field(column)?;
            columns.insert(field.name, check_value(meta, field, value)?);
        }
        for field in &meta.schema.fields {
            columns
                .entry(field.name)
                .or_insert_with(|| field.default.clone().unwrap_or(Value::Null));
        }

        let mut entity = Entity::new(meta.name(), columns);
        let mut references = Vec::new();
        for relation in &meta.relations {
            match relation.side {
                ForeignKeySide::Local(column) if !entity.get(column).is_null() => {
                    references.push((column, entity.get(column).clone()));
                }
                _ if relation.is_collection() => {
                    entity.related.insert(relation.name(), Related::Many(Vec::new()));
                }
                _ => {
                    entity.related.insert(relation.name(), Related::One(None));
                }
            }
        }

        let id = self.alloc_id();
        if let Some(key) = entity.key(meta) {
            self.data.identity.register(meta.name(), key, id)?;
        }
        self.data.entities.insert(id, entity);
        self.data.uow.mark_new(id);
        for (column, value) in references {
            Linker::new(&mut self.data, &registry).foreign_key_set(id, column, value)?;
        }
        tracing::debug!(id = %id, table = meta.name(), "Added entity");
        Ok(id)
    }

    /// Add several entities to one table.
    pub fn add_all<'c, R>(
        &mut self,
        table: &str,
        rows: impl IntoIterator<Item = R>,
    ) -> Result<Vec<EntityId>>
    where
        R: IntoIterator<Item = (&'c str, Value)>,
    {
        rows.into_iter().map(|row| self.add(table, row)).collect()
    }

    /// Add a typed model.
    pub fn add_model<M: Model>(&mut self, model: &M) -> Result<EntityId> {
        self.add(M::TABLE_NAME, model.to_values())
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Look up an entity by single-column primary key.
    ///
    /// The identity map is consulted first; the store is only queried for
    /// rows the session does not track yet.
    pub fn get(&mut self, table: &str, pk: impl Into<Value>) -> Result<Option<EntityId>> {
        self.get_with_options(table, pk, &GetOptions::default())
    }

    /// Like [`get`](Self::get), optionally locking the row (`SELECT ... FOR UPDATE`).
    pub fn get_with_options(
        &mut self,
        table: &str,
        pk: impl Into<Value>,
        options: &GetOptions,
    ) -> Result<Option<EntityId>> {
        let key = PkKey::single(pk)?;
        self.get_by_key(table, &key, options)
    }

    /// Look up an entity by a complete (possibly composite) key.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn get_by_key(
        &mut self,
        table: &str,
        key: &PkKey,
        options: &GetOptions,
    ) -> Result<Option<EntityId>> {
        self.ensure_open()?;
        let registry = self.registry_arc();
        let meta = registry.table(table)?;
        let lock = options.lock();

        if let Some(id) = self.data.identity.get(meta.name(), key) {
            let entity = self.data.entity(id)?;
            if entity.state == ObjectState::Pending || (lock.is_none() && !entity.expired) {
                tracing::trace!(id = %id, "Identity map hit");
                return Ok(Some(id));
            }
        }

        if self.config.auto_flush {
            self.flush()?;
        }
        self.ensure_transaction()?;
        let mut select = Select::from(meta.name()).filters(key_filter(meta, key));
        if let Some(mode) = lock {
            select = select.for_update(mode);
        }
        let rows = self.store.query(&select)?;
        match rows.first() {
            Some(row) => Ok(Some(self.load_row(meta.name(), row, lock.is_some())?)),
            None => Ok(None),
        }
    }

    /// Entities of `table` matching all `filters`.
    #[tracing::instrument(level = "debug", skip(self, options))]
    pub fn query(
        &mut self,
        table: &str,
        filters: Vec<Condition>,
        options: &QueryOptions,
    ) -> Result<Vec<EntityId>> {
        let select = self.build_select(table, filters, options)?;
        let rows = self.store.query(&select)?;
        let refresh = select.lock.is_some();
        rows.iter()
            .map(|row| self.load_row(&select.table, row, refresh))
            .collect()
    }

    /// Exactly one matching entity.
    pub fn query_one(
        &mut self,
        table: &str,
        filters: Vec<Condition>,
        options: &QueryOptions,
    ) -> Result<EntityId> {
        let options = QueryOptions {
            limit: Some(2),
            ..options.clone()
        };
        match self.query(table, filters, &options)?.as_slice() {
            [id] => Ok(*id),
            [] => Err(session_error(
                SessionErrorKind::NoResultFound,
                format!("no row in '{table}' matched"),
            )),
            _ => Err(session_error(
                SessionErrorKind::MultipleResultsFound,
                format!("more than one row in '{table}' matched"),
            )),
        }
    }

    /// Number of rows of `table` matching all `filters`.
    pub fn count(&mut self, table: &str, filters: Vec<Condition>) -> Result<usize> {
        let select = self.build_select(table, filters, &QueryOptions::default())?;
        Ok(self.store.query(&select)?.len())
    }

    fn build_select(
        &mut self,
        table: &str,
        filters: Vec<Condition>,
        options: &QueryOptions,
    ) -> Result<Select> {
        self.ensure_open()?;
        let registry = self.registry_arc();
        let meta = registry.table(table)?;
        for cond in &filters {
            meta.field(cond.column())?;
        }
        for order in &options.order_by {
            meta.field(&order.column)?;
        }
        if self.config.auto_flush {
            self.flush()?;
        }
        self.ensure_transaction()?;

        let mut select = Select::from(meta.name()).filters(filters);
        for order in &options.order_by {
            select = select.order_by(order.clone());
        }
        if let Some(n) = options.limit {
            select = select.limit(n);
        }
        if let Some(mode) = options.lock {
            select = select.for_update(mode);
        }
        Ok(select)
    }

    /// Inspect a tracked entity without touching the store.
    pub fn entity(&self, id: EntityId) -> Result<&Entity> {
        self.ensure_open()?;
        self.data.entity(id)
    }

    /// Current value of a column, re-reading expired entities first.
    pub fn value(&mut self, id: EntityId, column: &str) -> Result<Value> {
        self.ensure_open()?;
        let registry = self.registry_arc();
        let table = self.data.entity(id)?.table;
        let field = registry.table(table)?.field(column)?;
        self.unexpire(id)?;
        Ok(self.data.entity(id)?.get(field.name).clone())
    }

    /// Assign a column. Persistent entities become dirty.
    #[tracing::instrument(level = "debug", skip(self, value))]
    pub fn set(&mut self, id: EntityId, column: &str, value: impl Into<Value>) -> Result<()> {
        self.ensure_open()?;
        let registry = self.registry_arc();
        let entity = self.data.live(id)?;
        let meta = registry.table(entity.table)?;
        let field = meta.field(column)?;
        let value = check_value(meta, field, value.into())?;
        self.unexpire(id)?;

        let entity = self.data.entity(id)?;
        if field.primary_key && !entity.get(field.name).sql_eq(&value) {
            if entity.state == ObjectState::Persistent {
                return Err(session_error(
                    SessionErrorKind::InvalidState,
                    format!(
                        "primary key column '{}' of persistent entity {id} cannot change",
                        field.name
                    ),
                ));
            }
            return self.rekey_pending(id, meta, field.name, value);
        }

        if is_relationship_column(&registry, meta.name(), field.name) {
            Linker::new(&mut self.data, &registry).foreign_key_set(id, field.name, value)
        } else {
            self.data.assign(id, field.name, value)
        }
    }

    /// Change a pending entity's key, keeping the identity map in step.
    fn rekey_pending(
        &mut self,
        id: EntityId,
        meta: &TableMeta,
        column: &'static str,
        value: Value,
    ) -> Result<()> {
        let old_key = self.data.entity(id)?.key(meta);
        let mut staged = self.data.clone();
        if let Some(key) = &old_key {
            if staged.identity.get(meta.name(), key) == Some(id) {
                staged.identity.forget(meta.name(), key);
            }
        }
        staged.assign(id, column, value)?;
        if let Some(key) = staged.entity(id)?.key(meta) {
            staged.identity.register(meta.name(), key, id)?;
        }
        self.data = staged;
        Ok(())
    }

    /// Build a typed model from an entity.
    pub fn model<M: Model>(&mut self, id: EntityId) -> Result<M> {
        self.ensure_open()?;
        self.unexpire(id)?;
        let registry = self.registry_arc();
        let entity = self.data.entity(id)?;
        let meta = registry.table(entity.table)?;
        let columns = meta
            .schema
            .fields
            .iter()
            .map(|f| f.name.to_string())
            .collect();
        let values = meta
            .schema
            .fields
            .iter()
            .map(|f| entity.get(f.name).clone())
            .collect();
        M::from_row(&Row::new(columns, values))
    }

    /// Re-read an entity's columns from the store, discarding unflushed changes.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn refresh(&mut self, id: EntityId) -> Result<()> {
        self.ensure_open()?;
        let registry = self.registry_arc();
        let entity = self.data.entity(id)?;
        if entity.state != ObjectState::Persistent {
            return Err(session_error(
                SessionErrorKind::InvalidState,
                format!("entity {id} is {:?} and has no row to refresh", entity.state),
            ));
        }
        let meta = registry.table(entity.table)?;
        let key = entity.key(meta).ok_or_else(|| unknown_entity(id))?;
        self.ensure_transaction()?;
        let select = Select::from(meta.name()).filters(key_filter(meta, &key));
        let rows = self.store.query(&select)?;
        let row = rows.first().ok_or_else(|| {
            session_error(
                SessionErrorKind::NoResultFound,
                format!("the row behind entity {id} ({} {key}) no longer exists", meta.name()),
            )
        })?;
        self.data.entity_mut(id)?.expired = true;
        self.load_row(meta.name(), row, true)?;
        Ok(())
    }

    fn unexpire(&mut self, id: EntityId) -> Result<()> {
        let entity = self.data.entity(id)?;
        if entity.expired && entity.state == ObjectState::Persistent {
            self.refresh(id)?;
        }
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Schedule an entity for deletion on the next flush.
    ///
    /// Deleting a pending entity discards it; nothing reaches the store.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn delete(&mut self, id: EntityId) -> Result<()> {
        self.ensure_open()?;
        self.data.live(id)?;
        self.data.uow.mark_removed(id);
        Ok(())
    }

    /// Stop tracking an entity (and, through `expunge` cascades, its relatives).
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn expunge(&mut self, id: EntityId) -> Result<()> {
        self.ensure_open()?;
        self.data.live(id)?;
        let registry = self.registry_arc();

        let mut gone = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if gone.contains(&next) {
                continue;
            }
            let entity = self.data.entity(next)?;
            if !entity.is_live() {
                continue;
            }
            for relation in &registry.table(entity.table)?.relations {
                if relation.cascade.expunge {
                    if let Some(slot) = entity.related.get(relation.name()) {
                        stack.extend(slot.ids());
                    }
                }
            }
            gone.push(next);
        }

        for &g in &gone {
            let entity = self.data.entity(g)?;
            let meta = registry.table(entity.table)?;
            if let Some(key) = entity.key(meta) {
                if self.data.identity.get(meta.name(), &key) == Some(g) {
                    self.data.identity.forget(meta.name(), &key);
                }
            }
            self.data.tracker.forget(g);
            self.data.uow.forget(g);
            self.data.graph.forget(g);
            let entity = self.data.entity_mut(g)?;
            entity.state = ObjectState::Detached;
            entity.related.clear();
        }
        self.data.remove_from_slots(&gone);
        tracing::debug!(count = gone.len(), "Expunged entities");
        Ok(())
    }

    pub fn state(&self, id: EntityId) -> Result<ObjectState> {
        self.ensure_open()?;
        Ok(self.data.entity(id)?.state)
    }

    /// Whether the entity has column changes the store has not seen.
    /// Pending entities always do.
    pub fn is_dirty(&self, id: EntityId) -> Result<bool> {
        self.ensure_open()?;
        let entity = self.data.entity(id)?;
        Ok(match entity.state {
            ObjectState::Pending => true,
            ObjectState::Persistent => self.data.tracker.is_dirty(id, &entity.values),
            ObjectState::Deleted | ObjectState::Detached => false,
        })
    }

    /// Whether the entity is scheduled for deletion (or discard) at the next flush.
    pub fn is_removed(&self, id: EntityId) -> Result<bool> {
        self.ensure_open()?;
        self.data.entity(id)?;
        Ok(self.data.uow.is_going_away(id))
    }

    pub fn pending_counts(&self) -> PendingCounts {
        let uow = &self.data.uow;
        PendingCounts {
            new: uow.new_entities().len(),
            dirty: uow
                .dirty_entities()
                .iter()
                .filter(|id| {
                    self.data
                        .entities
                        .get(id)
                        .is_some_and(|e| self.data.tracker.is_dirty(**id, &e.values))
                })
                .count(),
            deleted: uow.removed_entities().len(),
        }
    }

    /// Number of entities in the identity map.
    pub fn tracked_count(&self) -> usize {
        self.data.identity.len()
    }

    // ========================================================================
    // Relationships
    // ========================================================================

    /// Associate `child` with `parent` through `parent`'s `relationship`,
    /// updating the mirrored side and the backing foreign key or link row.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn link(&mut self, parent: EntityId, relationship: &str, child: EntityId) -> Result<()> {
        self.ensure_open()?;
        self.prepare_graph_change(parent, relationship, child)?;
        let registry = self.registry_arc();
        let mut staged = self.data.clone();
        Linker::new(&mut staged, &registry).link(parent, relationship, child)?;
        self.data = staged;
        Ok(())
    }

    /// Dissolve an association made with [`link`](Self::link).
    ///
    /// Under `delete-orphan` the child is scheduled for removal; linking it
    /// again before the flush restores it.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn unlink(
        &mut self,
        parent: EntityId,
        relationship: &str,
        child: EntityId,
    ) -> Result<()> {
        self.ensure_open()?;
        self.prepare_graph_change(parent, relationship, child)?;
        let registry = self.registry_arc();
        let mut staged = self.data.clone();
        Linker::new(&mut staged, &registry).unlink(parent, relationship, child)?;
        self.data = staged;
        Ok(())
    }

    /// Load every slot a link or unlink between `a` and `b` will touch.
    fn prepare_graph_change(&mut self, a: EntityId, name: &str, b: EntityId) -> Result<()> {
        let registry = self.registry_arc();
        self.data.live(a)?;
        self.data.live(b)?;
        let relation = registry.table(self.data.entity(a)?.table)?.relation(name)?;
        self.ensure_loaded(a, relation.name())?;
        if let Some(inverse) = relation.inverse {
            if self.data.entity(b)?.table == relation.related_table() {
                self.ensure_loaded(b, inverse)?;
                if let Some(Related::One(Some(previous))) =
                    self.data.entity(a)?.related.get(relation.name()).cloned()
                {
                    if self.data.entity(previous)?.is_live() {
                        self.ensure_loaded(previous, inverse)?;
                    }
                }
                if let Some(Related::One(Some(previous))) =
                    self.data.entity(b)?.related.get(inverse).cloned()
                {
                    if self.data.entity(previous)?.is_live() {
                        self.ensure_loaded(previous, relation.name())?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Entities in a relationship slot, loading it on first access.
    pub fn related(&mut self, id: EntityId, relationship: &str) -> Result<Vec<EntityId>> {
        self.ensure_open()?;
        let registry = self.registry_arc();
        let relation = registry.table(self.data.entity(id)?.table)?.relation(relationship)?;
        self.ensure_loaded(id, relation.name())?;
        Ok(self
            .data
            .entity(id)?
            .related
            .get(relation.name())
            .map(Related::ids)
            .unwrap_or_default())
    }

    // ========================================================================
    // Flush / Commit / Rollback
    // ========================================================================

    fn has_pending_changes(&self) -> bool {
        self.data.uow.has_changes() || self.data.graph.has_changes()
    }

    /// Write pending changes to the store inside the current transaction.
    ///
    /// On failure after the first write the store transaction is rolled back
    /// and the session returns to its last committed state. A failure before
    /// any write leaves the pending changes as they were.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.event_callbacks.fire(SessionEvent::BeforeFlush)?;
        if !self.has_pending_changes() {
            return Ok(());
        }

        self.lifecycle = SessionState::Flushing;
        let before = self.data.clone();
        let mut wrote = false;
        let outcome = self.execute_flush(&mut wrote);
        self.lifecycle = SessionState::Active;

        match outcome {
            Ok(result) => {
                tracing::debug!(
                    inserted = result.inserted,
                    updated = result.updated,
                    deleted = result.deleted,
                    links_inserted = result.links_inserted,
                    links_deleted = result.links_deleted,
                    "Flush complete"
                );
                self.event_callbacks.fire(SessionEvent::AfterFlush)
            }
            Err(e) => {
                tracing::warn!(error = %e, wrote, "Flush failed");
                if wrote {
                    self.abort_transaction();
                } else {
                    self.data = before;
                }
                Err(e)
            }
        }
    }

    /// Flush, then commit the store transaction.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.flush()?;
        self.event_callbacks.fire(SessionEvent::BeforeCommit)?;

        if self.store.in_transaction() {
            if let Err(e) = self.store.commit() {
                tracing::warn!(error = %e, "Store commit failed");
                self.abort_transaction();
                return Err(e);
            }
        }

        let ids: Vec<EntityId> = self.data.entities.keys().copied().collect();
        for id in ids {
            if let Some(entity) = self.data.entities.get_mut(&id) {
                match entity.state {
                    ObjectState::Deleted => entity.state = ObjectState::Detached,
                    ObjectState::Persistent if self.config.expire_on_commit => {
                        entity.expired = true;
                        entity.related.clear();
                    }
                    _ => {}
                }
            }
        }
        self.checkpoint = self.data.clone();
        tracing::info!(tracked = self.data.identity.len(), "Session committed");

        self.event_callbacks.fire(SessionEvent::AfterCommit)
    }

    /// Roll back the store transaction and return to the last committed state.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        let result = self.store.rollback();
        self.restore_checkpoint();
        tracing::info!("Session rolled back");
        result?;
        self.event_callbacks.fire(SessionEvent::AfterRollback)
    }

    fn abort_transaction(&mut self) {
        if let Err(e) = self.store.rollback() {
            tracing::warn!(error = %e, "Store rollback failed");
        }
        self.restore_checkpoint();
    }

    /// Return to the checkpoint.
    ///
    /// Entities created since then are kept as handles: rows read from the
    /// store stay persistent but expired, everything else becomes detached
    /// with the keys a flush gave it cleared again.
    fn restore_checkpoint(&mut self) {
        let current = std::mem::replace(&mut self.data, self.checkpoint.clone());
        for (id, entity) in &current.entities {
            if self.data.entities.contains_key(id) {
                continue;
            }
            let mut entity = entity.clone();
            entity.related.clear();
            let key = self
                .registry
                .table(entity.table)
                .ok()
                .and_then(|meta| entity.key(meta));
            let keep = entity.loaded
                && matches!(entity.state, ObjectState::Persistent | ObjectState::Deleted)
                && key
                    .as_ref()
                    .is_some_and(|k| self.data.identity.get(entity.table, k).is_none());
            match key {
                Some(key) if keep => {
                    entity.state = ObjectState::Persistent;
                    entity.expired = true;
                    // The key was checked free above.
                    let _ = self.data.identity.register(entity.table, key, *id);
                    self.data.tracker.snapshot(*id, &entity.values);
                }
                _ => {
                    entity.state = ObjectState::Detached;
                    entity.expired = false;
                    for column in std::mem::take(&mut entity.flush_assigned) {
                        entity.values.insert(column, Value::Null);
                    }
                }
            }
            self.data.entities.insert(*id, entity);
        }
        self.checkpoint = self.data.clone();
    }

    /// Roll back any open transaction and detach everything. Every later
    /// call fails with a closed-session error.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn close(&mut self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let result = if self.store.in_transaction() {
            self.store.rollback()
        } else {
            Ok(())
        };
        let ids: Vec<EntityId> = self.data.entities.keys().copied().collect();
        for id in ids {
            if let Some(entity) = self.data.entities.get_mut(&id) {
                entity.state = ObjectState::Detached;
                entity.related.clear();
            }
        }
        self.data.identity.clear();
        self.data.tracker.clear();
        self.data.uow.clear();
        self.data.graph = RelationshipGraph::default();
        self.checkpoint = SessionData::default();
        self.lifecycle = SessionState::Closed;
        tracing::info!("Session closed");
        result
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.before_flush.push(Box::new(f));
    }

    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_flush.push(Box::new(f));
    }

    pub fn on_before_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.before_commit.push(Box::new(f));
    }

    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_commit.push(Box::new(f));
    }

    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_rollback.push(Box::new(f));
    }
}

/// Whether some relationship is backed by `table.column`.
fn is_relationship_column(registry: &SchemaRegistry, table: &str, column: &str) -> bool {
    registry.tables().any(|meta| {
        meta.relations.iter().any(|r| match r.side {
            ForeignKeySide::Local(c) => meta.name() == table && c == column,
            ForeignKeySide::Remote(c) => r.related_table() == table && c == column,
            ForeignKeySide::Link(_) => false,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::{
        EntitySchema, LinkTableInfo, QueryError, RelationshipInfo, RelationshipKind, SqlType,
        Statement, StatementResult, StoreCapabilities,
    };
    use relmap_memory::{MemoryDatabase, MemoryStore};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> Arc<SchemaRegistry> {
        let registry = SchemaRegistry::builder()
            .entity(
                EntitySchema::new("users")
                    .field(FieldInfo::id("id"))
                    .field(FieldInfo::new("name", SqlType::Text))
                    .field(FieldInfo::new("active", SqlType::Boolean).default_value(true))
                    .relationship(
                        RelationshipInfo::new("posts", "posts", RelationshipKind::OneToMany)
                            .remote_key("user_id")
                            .back_populates("author")
                            .cascade("all, delete-orphan")
                            .order_by("title"),
                    ),
            )
            .entity(
                EntitySchema::new("posts")
                    .field(FieldInfo::id("id"))
                    .field(FieldInfo::new("title", SqlType::Text))
                    .field(
                        FieldInfo::new("user_id", SqlType::Integer)
                            .nullable(true)
                            .foreign_key("users.id"),
                    )
                    .relationship(
                        RelationshipInfo::new("author", "users", RelationshipKind::ManyToOne)
                            .local_key("user_id")
                            .back_populates("posts"),
                    )
                    .relationship(
                        RelationshipInfo::new("tags", "tags", RelationshipKind::ManyToMany)
                            .link_table(LinkTableInfo::new("post_tags", "post_id", "tag_id"))
                            .back_populates("posts"),
                    ),
            )
            .entity(
                EntitySchema::new("tags")
                    .field(FieldInfo::id("id"))
                    .field(FieldInfo::new("label", SqlType::Text).unique(true))
                    .relationship(
                        RelationshipInfo::new("posts", "posts", RelationshipKind::ManyToMany)
                            .link_table(LinkTableInfo::new("post_tags", "tag_id", "post_id"))
                            .back_populates("tags"),
                    ),
            )
            .build()
            .unwrap();
        Arc::new(registry)
    }

    fn memory_session() -> (MemoryDatabase, Session<MemoryStore>) {
        let registry = registry();
        let db = MemoryDatabase::from_registry(&registry);
        let session = Session::new(registry, db.connect());
        (db, session)
    }

    fn user(session: &mut Session<impl Store>, name: &str) -> EntityId {
        session.add("users", [("name", Value::from(name))]).unwrap()
    }

    fn post(session: &mut Session<impl Store>, title: &str) -> EntityId {
        session.add("posts", [("title", Value::from(title))]).unwrap()
    }

    // ==================== Mock Store ====================

    #[derive(Default)]
    struct MockState {
        executed: Vec<Statement>,
        queries: Vec<Select>,
        rows: BTreeMap<String, Vec<Row>>,
        fail_at: Option<usize>,
        next_key: i64,
        rollbacks: usize,
        commits: usize,
    }

    #[derive(Clone, Default)]
    struct MockStore {
        state: Arc<Mutex<MockState>>,
        in_txn: bool,
    }

    impl MockStore {
        fn failing_at(index: usize) -> Self {
            let store = Self::default();
            store.state.lock().unwrap().fail_at = Some(index);
            store
        }

        fn seed(&self, table: &str, columns: &[&str], values: Vec<Value>) {
            let row = Row::new(columns.iter().map(|c| (*c).to_string()).collect(), values);
            self.state
                .lock()
                .unwrap()
                .rows
                .entry(table.to_string())
                .or_default()
                .push(row);
        }

        fn executed_tables(&self) -> Vec<String> {
            self.state
                .lock()
                .unwrap()
                .executed
                .iter()
                .map(|s| format!("{} {}", s.kind(), s.table()))
                .collect()
        }
    }

    impl Store for MockStore {
        fn execute(&mut self, statement: &Statement) -> Result<StatementResult> {
            let mut state = self.state.lock().unwrap();
            state.executed.push(statement.clone());
            if state.fail_at == Some(state.executed.len() - 1) {
                return Err(QueryError::constraint("23505", "duplicate key").into());
            }
            let generated_key = match statement {
                Statement::Insert(insert) if insert.returning.is_some() => {
                    state.next_key += 1;
                    Some(Value::Int(state.next_key))
                }
                _ => None,
            };
            Ok(StatementResult {
                rows_affected: 1,
                generated_key,
            })
        }

        fn query(&mut self, select: &Select) -> Result<Vec<Row>> {
            let mut state = self.state.lock().unwrap();
            state.queries.push(select.clone());
            Ok(state
                .rows
                .get(&select.table)
                .map(|rows| {
                    rows.iter()
                        .filter(|row| select.filter.iter().all(|c| c.matches(row)))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        }

        fn begin(&mut self) -> Result<()> {
            self.in_txn = true;
            Ok(())
        }

        fn commit(&mut self) -> Result<()> {
            self.in_txn = false;
            self.state.lock().unwrap().commits += 1;
            Ok(())
        }

        fn rollback(&mut self) -> Result<()> {
            self.in_txn = false;
            self.state.lock().unwrap().rollbacks += 1;
            Ok(())
        }

        fn in_transaction(&self) -> bool {
            self.in_txn
        }

        fn capabilities(&self) -> StoreCapabilities {
            StoreCapabilities::default()
        }
    }

    // ==================== Adding and reading ====================

    #[test]
    fn add_applies_defaults_and_validates_columns() {
        let (_db, mut session) = memory_session();
        let id = user(&mut session, "ann");
        let entity = session.entity(id).unwrap();
        assert_eq!(entity.get("active"), &Value::Bool(true));
        assert!(entity.get("id").is_null());
        assert_eq!(session.state(id).unwrap(), ObjectState::Pending);

        let err = session.add("users", [("nope", Value::Int(1))]).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
        let err = session.add("users", [("name", Value::Int(1))]).unwrap_err();
        assert!(matches!(err, Error::Type(_)));
        assert!(session.add("ghosts", [("name", Value::from("x"))]).is_err());
    }

    #[test]
    fn commit_assigns_keys_and_registers_identity() {
        let (db, mut session) = memory_session();
        let id = user(&mut session, "ann");
        session.commit().unwrap();

        assert_eq!(db.row_count("users"), 1);
        assert_eq!(session.state(id).unwrap(), ObjectState::Persistent);
        assert_eq!(session.value(id, "id").unwrap(), Value::Int(1));
        assert_eq!(session.get("users", 1).unwrap(), Some(id));
        assert_eq!(session.tracked_count(), 1);
    }

    #[test]
    fn queries_resolve_to_tracked_entities_without_overwriting() {
        let (_db, mut session) = memory_session();
        let id = user(&mut session, "ann");
        session.commit().unwrap();

        session.set(id, "name", "anna").unwrap();
        let found = session
            .query("users", vec![Condition::eq("id", 1)], &QueryOptions::new())
            .unwrap();
        assert_eq!(found, vec![id]);
        assert_eq!(session.value(id, "name").unwrap(), Value::from("anna"));
        assert!(session.is_dirty(id).unwrap());
    }

    #[test]
    fn explicit_key_conflict_is_rejected() {
        let (_db, mut session) = memory_session();
        session
            .add("tags", [("id", Value::Int(5)), ("label", Value::from("rust"))])
            .unwrap();
        let err = session
            .add("tags", [("id", Value::Int(5)), ("label", Value::from("go"))])
            .unwrap_err();
        assert_eq!(err.session_kind(), Some(SessionErrorKind::IdentityConflict));
        assert_eq!(session.pending_counts().new, 1);
    }

    #[test]
    fn query_one_reports_missing_and_ambiguous_results() {
        let (_db, mut session) = memory_session();
        user(&mut session, "ann");
        user(&mut session, "bob");
        session.commit().unwrap();

        let err = session
            .query_one("users", vec![Condition::eq("name", "cid")], &QueryOptions::new())
            .unwrap_err();
        assert_eq!(err.session_kind(), Some(SessionErrorKind::NoResultFound));
        let err = session
            .query_one("users", vec![], &QueryOptions::new())
            .unwrap_err();
        assert_eq!(err.session_kind(), Some(SessionErrorKind::MultipleResultsFound));
        assert_eq!(session.count("users", vec![]).unwrap(), 2);
    }

    #[test]
    fn auto_flush_makes_pending_rows_queryable() {
        let registry = registry();
        let db = MemoryDatabase::from_registry(&registry);
        let factory =
            SessionFactory::from_shared(registry).with_config(SessionConfig::default().auto_flush(true));
        let mut session = factory.session(db.connect());
        let id = user(&mut session, "ann");
        let found = session.query("users", vec![], &QueryOptions::new()).unwrap();
        assert_eq!(found, vec![id]);
    }

    // ==================== Relationships ====================

    #[test]
    fn link_updates_both_sides_and_resolves_queued_key() {
        let (db, mut session) = memory_session();
        let u = user(&mut session, "ann");
        let p = post(&mut session, "hello");
        session.link(u, "posts", p).unwrap();

        assert_eq!(session.related(p, "author").unwrap(), vec![u]);
        assert!(session.entity(p).unwrap().get("user_id").is_null());
        assert_eq!(session.data.graph.pending_target(p, "user_id"), Some(u));

        session.commit().unwrap();
        assert_eq!(
            session.value(p, "user_id").unwrap(),
            session.value(u, "id").unwrap()
        );
        assert_eq!(db.row_count("posts"), 1);
    }

    #[test]
    fn moving_a_child_removes_it_from_the_old_parent() {
        let (_db, mut session) = memory_session();
        let u1 = user(&mut session, "ann");
        let u2 = user(&mut session, "bob");
        let p = post(&mut session, "hello");
        session.link(u1, "posts", p).unwrap();
        session.link(u2, "posts", p).unwrap();

        assert!(session.related(u1, "posts").unwrap().is_empty());
        assert_eq!(session.related(u2, "posts").unwrap(), vec![p]);
        assert_eq!(session.related(p, "author").unwrap(), vec![u2]);
        assert!(!session.is_removed(p).unwrap());
    }

    #[test]
    fn linking_through_the_many_to_one_side_mirrors_the_collection() {
        let (_db, mut session) = memory_session();
        let u = user(&mut session, "ann");
        let p = post(&mut session, "hello");
        session.link(p, "author", u).unwrap();
        assert_eq!(session.related(u, "posts").unwrap(), vec![p]);

        session.unlink(p, "author", u).unwrap();
        assert!(session.related(u, "posts").unwrap().is_empty());
        assert!(session.is_removed(p).unwrap());
    }

    #[test]
    fn unlink_orphans_and_relink_restores() {
        let (db, mut session) = memory_session();
        let u = user(&mut session, "ann");
        let p1 = post(&mut session, "a");
        let p2 = post(&mut session, "b");
        session.link(u, "posts", p1).unwrap();
        session.link(u, "posts", p2).unwrap();
        session.commit().unwrap();

        session.unlink(u, "posts", p1).unwrap();
        assert!(session.is_removed(p1).unwrap());
        assert_eq!(session.related(u, "posts").unwrap(), vec![p2]);

        session.link(u, "posts", p1).unwrap();
        assert!(!session.is_removed(p1).unwrap());

        session.unlink(u, "posts", p1).unwrap();
        session.commit().unwrap();
        assert_eq!(db.row_count("posts"), 1);
        assert_eq!(session.state(p1).unwrap(), ObjectState::Detached);
        assert_eq!(session.state(p2).unwrap(), ObjectState::Persistent);
    }

    #[test]
    fn many_to_many_maintains_association_rows() {
        let (db, mut session) = memory_session();
        let p = post(&mut session, "hello");
        let t = session.add("tags", [("label", Value::from("rust"))]).unwrap();
        session.link(p, "tags", t).unwrap();
        assert_eq!(session.related(t, "posts").unwrap(), vec![p]);
        session.commit().unwrap();
        assert_eq!(db.row_count("post_tags"), 1);

        session.unlink(t, "posts", p).unwrap();
        assert!(session.related(p, "tags").unwrap().is_empty());
        session.commit().unwrap();
        assert_eq!(db.row_count("post_tags"), 0);
        assert_eq!(db.row_count("tags"), 1);
    }

    #[test]
    fn linking_rejects_wrong_tables_and_unknown_relationships() {
        let (_db, mut session) = memory_session();
        let u = user(&mut session, "ann");
        let other = user(&mut session, "bob");
        let err = session.link(u, "posts", other).unwrap_err();
        assert_eq!(err.session_kind(), Some(SessionErrorKind::InvalidState));
        assert!(session.link(u, "friends", other).is_err());
        assert!(session.related(u, "posts").unwrap().is_empty());
    }

    // ==================== Cascades and flush ordering ====================

    #[test]
    fn inserts_parents_before_children() {
        let store = MockStore::default();
        let mut session = Session::new(registry(), store.clone());
        let p = post(&mut session, "hello");
        let u = user(&mut session, "ann");
        session.link(p, "author", u).unwrap();
        session.flush().unwrap();

        assert_eq!(store.executed_tables(), ["INSERT users", "INSERT posts"]);
        let state = store.state.lock().unwrap();
        let Statement::Insert(insert) = &state.executed[1] else {
            panic!("expected an insert");
        };
        let column = insert.columns.iter().position(|c| c == "user_id").unwrap();
        assert_eq!(insert.values[column], Value::Int(1));
        assert_eq!(insert.returning.as_deref(), Some("id"));
    }

    #[test]
    fn cascade_deletes_children_first() {
        let store = MockStore::default();
        store.seed("users", &["id", "name", "active"], vec![1.into(), "ann".into(), true.into()]);
        for (id, title) in [(1, "a"), (2, "b")] {
            store.seed(
                "posts",
                &["id", "title", "user_id"],
                vec![Value::Int(id), title.into(), Value::Int(1)],
            );
        }
        let mut session = Session::new(registry(), store.clone());
        let u = session.get("users", 1).unwrap().unwrap();
        session.delete(u).unwrap();
        session.flush().unwrap();

        assert_eq!(
            store.executed_tables(),
            [
                "DELETE post_tags",
                "DELETE post_tags",
                "DELETE posts",
                "DELETE posts",
                "DELETE users"
            ]
        );
        assert_eq!(session.state(u).unwrap(), ObjectState::Deleted);
        assert_eq!(session.tracked_count(), 0);
    }

    fn thread_registry() -> Arc<SchemaRegistry> {
        let registry = SchemaRegistry::builder()
            .entity(
                EntitySchema::new("users")
                    .field(FieldInfo::id("id"))
                    .field(FieldInfo::new("name", SqlType::Text))
                    .relationship(
                        RelationshipInfo::new("posts", "posts", RelationshipKind::OneToMany)
                            .remote_key("user_id")
                            .back_populates("author")
                            .cascade("all, delete-orphan"),
                    ),
            )
            .entity(
                EntitySchema::new("posts")
                    .field(FieldInfo::id("id"))
                    .field(FieldInfo::new("title", SqlType::Text))
                    .field(
                        FieldInfo::new("user_id", SqlType::Integer)
                            .nullable(true)
                            .foreign_key("users.id"),
                    )
                    .relationship(
                        RelationshipInfo::new("author", "users", RelationshipKind::ManyToOne)
                            .local_key("user_id")
                            .back_populates("posts"),
                    )
                    .relationship(
                        RelationshipInfo::new("comments", "comments", RelationshipKind::OneToMany)
                            .remote_key("post_id")
                            .back_populates("post")
                            .cascade("all, delete-orphan"),
                    ),
            )
            .entity(
                EntitySchema::new("comments")
                    .field(FieldInfo::id("id"))
                    .field(FieldInfo::new("body", SqlType::Text))
                    .field(
                        FieldInfo::new("post_id", SqlType::Integer)
                            .nullable(true)
                            .foreign_key("posts.id"),
                    )
                    .relationship(
                        RelationshipInfo::new("post", "posts", RelationshipKind::ManyToOne)
                            .local_key("post_id")
                            .back_populates("comments"),
                    ),
            )
            .build()
            .unwrap();
        Arc::new(registry)
    }

    #[test]
    fn cascade_reaches_grandchildren_before_their_parents() {
        let store = MockStore::default();
        store.seed("users", &["id", "name"], vec![1.into(), "ann".into()]);
        for (id, title) in [(1, "a"), (2, "b")] {
            store.seed(
                "posts",
                &["id", "title", "user_id"],
                vec![Value::Int(id), title.into(), Value::Int(1)],
            );
        }
        let comments = [(1, 1), (2, 1), (3, 2)];
        for (id, post_id) in comments {
            store.seed(
                "comments",
                &["id", "body", "post_id"],
                vec![Value::Int(id), "hi".into(), Value::Int(post_id)],
            );
        }
        let mut session = Session::new(thread_registry(), store.clone());
        let u = session.get("users", 1).unwrap().unwrap();
        session.delete(u).unwrap();
        session.flush().unwrap();

        let deleted: Vec<(String, Value)> = store
            .state
            .lock()
            .unwrap()
            .executed
            .iter()
            .map(|statement| match statement {
                Statement::Delete(delete) => match &delete.filter[..] {
                    [Condition::Eq(column, key)] if column == "id" => {
                        (delete.table.clone(), key.clone())
                    }
                    other => panic!("unexpected delete filter {other:?}"),
                },
                other => panic!("unexpected statement {other:?}"),
            })
            .collect();
        let position = |table: &str, id: i64| {
            deleted
                .iter()
                .position(|(t, k)| t == table && *k == Value::Int(id))
                .unwrap_or_else(|| panic!("{table} {id} was not deleted"))
        };

        assert_eq!(deleted.len(), 6);
        assert_eq!(deleted.last(), Some(&("users".to_string(), Value::Int(1))));
        for (comment, post_id) in comments {
            assert!(position("comments", comment) < position("posts", post_id));
        }
        for post_id in [1, 2] {
            assert!(position("posts", post_id) < position("users", 1));
        }
        assert_eq!(session.tracked_count(), 0);
    }

    #[test]
    fn deleting_a_pending_entity_discards_it() {
        let store = MockStore::default();
        let mut session = Session::new(registry(), store.clone());
        let u = user(&mut session, "ann");
        let p = post(&mut session, "hello");
        session.link(u, "posts", p).unwrap();
        session.delete(u).unwrap();
        session.flush().unwrap();

        assert!(store.executed_tables().is_empty());
        assert_eq!(session.state(u).unwrap(), ObjectState::Detached);
        assert_eq!(session.state(p).unwrap(), ObjectState::Detached);
    }

    #[test]
    fn updates_only_changed_columns() {
        let store = MockStore::default();
        store.seed("users", &["id", "name", "active"], vec![1.into(), "ann".into(), true.into()]);
        let mut session = Session::new(registry(), store.clone());
        let u = session.get("users", 1).unwrap().unwrap();
        session.set(u, "name", "anna").unwrap();
        session.flush().unwrap();

        let state = store.state.lock().unwrap();
        let [Statement::Update(update)] = state.executed.as_slice() else {
            panic!("expected a single update");
        };
        assert_eq!(update.set, vec![("name".to_string(), Value::from("anna"))]);
        assert_eq!(update.filter, vec![Condition::eq("id", 1)]);
    }

    #[test]
    fn failed_flush_rolls_back_to_last_commit() {
        let store = MockStore::failing_at(1);
        let mut session = Session::new(registry(), store.clone());
        let u = user(&mut session, "ann");
        let p = post(&mut session, "hello");
        session.link(u, "posts", p).unwrap();

        let err = session.flush().unwrap_err();
        assert!(err.is_constraint_violation());
        assert_eq!(session.state(u).unwrap(), ObjectState::Detached);
        assert_eq!(session.state(p).unwrap(), ObjectState::Detached);
        assert!(session.pending_counts().is_empty());
        assert_eq!(session.tracked_count(), 0);
        assert!(session.entity(u).unwrap().get("id").is_null());
        assert_eq!(store.state.lock().unwrap().rollbacks, 1);
    }

    #[test]
    fn persistent_primary_keys_are_immutable() {
        let (_db, mut session) = memory_session();
        let u = user(&mut session, "ann");
        session.commit().unwrap();
        let err = session.set(u, "id", 7).unwrap_err();
        assert_eq!(err.session_kind(), Some(SessionErrorKind::InvalidState));
    }

    // ==================== Transactions ====================

    #[test]
    fn rollback_restores_committed_values() {
        let (_db, mut session) = memory_session();
        let u = user(&mut session, "ann");
        session.commit().unwrap();

        session.set(u, "name", "bob").unwrap();
        assert!(session.is_dirty(u).unwrap());
        session.rollback().unwrap();
        assert_eq!(session.value(u, "name").unwrap(), Value::from("ann"));
        assert!(!session.is_dirty(u).unwrap());
    }

    #[test]
    fn expire_on_commit_rereads_values() {
        let (db, mut session) = memory_session();
        let u = user(&mut session, "ann");
        session.commit().unwrap();
        assert!(session.entity(u).unwrap().is_expired());

        let mut other = Session::new(registry(), db.connect());
        let same = other.get("users", 1).unwrap().unwrap();
        other.set(same, "name", "anna").unwrap();
        other.commit().unwrap();

        assert_eq!(session.value(u, "name").unwrap(), Value::from("anna"));
        assert!(!session.entity(u).unwrap().is_expired());
    }

    #[test]
    fn nowait_lock_fails_fast_for_a_second_session() {
        let registry = registry();
        let db = MemoryDatabase::from_registry(&registry);
        let factory = SessionFactory::from_shared(registry);
        let mut setup = factory.session(db.connect());
        user(&mut setup, "ann");
        setup.commit().unwrap();

        let mut a = factory.session(db.connect());
        let mut b = factory.session(db.connect());
        let lock = GetOptions::new().with_for_update(true);
        assert!(a.get_with_options("users", 1, &lock).unwrap().is_some());
        let err = b
            .get_with_options("users", 1, &lock.clone().nowait(true))
            .unwrap_err();
        assert!(err.is_lock_contention());
        assert!(err.is_retryable());

        a.commit().unwrap();
        b.rollback().unwrap();
        assert!(b.get_with_options("users", 1, &lock.nowait(true)).unwrap().is_some());
    }

    #[test]
    fn closed_session_rejects_everything() {
        let (_db, mut session) = memory_session();
        let u = user(&mut session, "ann");
        session.close().unwrap();
        assert!(session.is_closed());
        assert!(
            session
                .add("users", [("name", Value::from("x"))])
                .unwrap_err()
                .is_session_closed()
        );
        assert!(session.get("users", 1).unwrap_err().is_session_closed());
        assert!(session.state(u).unwrap_err().is_session_closed());
        assert!(session.commit().unwrap_err().is_session_closed());
        session.close().unwrap();
    }

    #[test]
    fn expunge_detaches_entities() {
        let (_db, mut session) = memory_session();
        let u = user(&mut session, "ann");
        let p = post(&mut session, "hello");
        session.link(u, "posts", p).unwrap();
        session.expunge(u).unwrap();

        assert_eq!(session.state(u).unwrap(), ObjectState::Detached);
        assert_eq!(session.state(p).unwrap(), ObjectState::Detached);
        assert!(session.pending_counts().is_empty());
    }

    // ==================== Events and config ====================

    #[test]
    fn event_callbacks_fire_and_can_veto() {
        let (_db, mut session) = memory_session();
        let commits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&commits);
        session.on_after_commit(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        user(&mut session, "ann");
        session.commit().unwrap();
        assert_eq!(commits.load(Ordering::SeqCst), 1);

        session.on_before_flush(|| Err(Error::Custom("vetoed".into())));
        user(&mut session, "bob");
        assert!(session.commit().is_err());
        assert_eq!(commits.load(Ordering::SeqCst), 1);
        assert_eq!(session.pending_counts().new, 1);
    }

    #[test]
    fn config_loads_from_json() {
        let config =
            SessionConfig::from_json(r#"{"auto_flush": true, "lock_wait": "no_wait"}"#).unwrap();
        assert!(config.auto_flush);
        assert!(config.expire_on_commit);
        assert_eq!(config.lock_wait, LockMode::NoWait);
        assert!(matches!(
            SessionConfig::from_json(r#"{"auto_flush": 3}"#),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn get_options_map_to_lock_modes() {
        assert_eq!(GetOptions::new().lock(), None);
        assert_eq!(GetOptions::new().with_for_update(true).lock(), Some(LockMode::Wait));
        assert_eq!(
            GetOptions::new().with_for_update(true).nowait(true).lock(),
            Some(LockMode::NoWait)
        );
    }
}
