//! In-process transactional store for relmap.
//!
//! `relmap-memory` keeps every table in persistent ordered maps (`im::OrdMap`),
//! so starting a transaction is a constant-time snapshot of the committed
//! state. It enforces primary key, unique, not-null and foreign-key
//! constraints, and it supports real per-row pessimistic locks, which makes it
//! the reference backend for testing unit-of-work behaviour.
//!
//! # Concurrency
//!
//! A [`MemoryDatabase`] is shared between any number of [`MemoryStore`]
//! handles, one per session. Each handle runs at most one transaction:
//!
//! - reads see the snapshot taken at `begin` plus the handle's own writes;
//! - `UPDATE`/`DELETE` and `SELECT ... FOR UPDATE` lock the affected rows
//!   until commit or rollback; a locking read refreshes the row from the
//!   latest committed state;
//! - `LockMode::NoWait` fails immediately with a lock-contention error while
//!   `LockMode::Wait` blocks up to the database's lock timeout;
//! - commit merges the write set into the latest committed state and re-checks
//!   every constraint, so a conflicting concurrent insert is reported at
//!   commit time.
//!
//! # Example
//!
//! ```ignore
//! let db = MemoryDatabase::from_registry(&registry);
//! let mut store = db.connect();
//! store.begin()?;
//! store.execute(&insert)?;
//! store.commit()?;
//! ```

mod table;

use relmap_core::error::SQLSTATE_UNIQUE_VIOLATION;
use relmap_core::{
    Condition, Delete, Error, Insert, LockMode, PkKey, QueryError, QueryErrorKind, Result, Row,
    SchemaRegistry, Select, Statement, StatementResult, Store, StoreCapabilities, Update, Value,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use table::{Catalog, Rows, TableDef, Tables};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

type LockKey = (String, PkKey);

#[derive(Debug, Default)]
struct DbState {
    committed: Tables,
    /// Last generated value per auto-increment table.
    sequences: HashMap<String, i64>,
    /// Row locks and the handle holding each.
    locks: HashMap<LockKey, u64>,
    next_handle: u64,
}

#[derive(Debug)]
struct Shared {
    catalog: Catalog,
    state: Mutex<DbState>,
    lock_released: Condvar,
    lock_timeout: Duration,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, DbState> {
        // Recover from a poisoned lock; the state is only replaced wholesale.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A shared in-memory database. Cheap to clone; clones share data.
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
}

impl MemoryDatabase {
    /// Create empty tables for every entity and association table in the registry.
    pub fn from_registry(registry: &SchemaRegistry) -> Self {
        Self::with_lock_timeout(registry, DEFAULT_LOCK_TIMEOUT)
    }

    /// Like [`from_registry`](Self::from_registry) with a custom bound on lock waits.
    pub fn with_lock_timeout(registry: &SchemaRegistry, lock_timeout: Duration) -> Self {
        let mut catalog = Catalog::default();
        for meta in registry.tables() {
            catalog
                .defs
                .insert(meta.name().to_string(), TableDef::from_meta(meta));
        }
        for assoc in registry.associations() {
            catalog
                .defs
                .insert(assoc.name.to_string(), TableDef::from_association(assoc));
        }
        let mut committed = Tables::new();
        for name in catalog.defs.keys() {
            committed.insert(name.clone(), Rows::new());
        }
        tracing::debug!(tables = catalog.defs.len(), "Created memory database");
        Self {
            shared: Arc::new(Shared {
                catalog,
                state: Mutex::new(DbState {
                    committed,
                    ..DbState::default()
                }),
                lock_released: Condvar::new(),
                lock_timeout,
            }),
        }
    }

    /// Open a new handle with its own transaction scope.
    pub fn connect(&self) -> MemoryStore {
        let handle = {
            let mut state = self.shared.lock_state();
            state.next_handle += 1;
            state.next_handle
        };
        MemoryStore {
            shared: Arc::clone(&self.shared),
            handle,
            txn: None,
        }
    }

    /// Number of committed rows in a table.
    pub fn row_count(&self, table: &str) -> usize {
        self.shared
            .lock_state()
            .committed
            .get(table)
            .map_or(0, Rows::len)
    }

    /// Committed rows of a table in primary-key order.
    pub fn rows(&self, table: &str) -> Result<Vec<Row>> {
        let def = self.shared.catalog.def(table)?;
        let state = self.shared.lock_state();
        Ok(state
            .committed
            .get(table)
            .map(|rows| rows.values().map(|r| def.to_row(r)).collect())
            .unwrap_or_default())
    }
}

#[derive(Debug)]
struct Txn {
    tables: Tables,
    /// Rows written by this transaction; `None` marks a delete.
    writes: BTreeMap<String, BTreeMap<PkKey, Option<Vec<Value>>>>,
}

impl Txn {
    fn put(&mut self, table: &str, key: PkKey, row: Option<Vec<Value>>) {
        let rows = self.tables.entry(table.to_string()).or_insert_with(Rows::new);
        match &row {
            Some(values) => {
                rows.insert(key.clone(), values.clone());
            }
            None => {
                rows.remove(&key);
            }
        }
        self.writes
            .entry(table.to_string())
            .or_default()
            .insert(key, row);
    }

    fn wrote(&self, table: &str, key: &PkKey) -> bool {
        self.writes.get(table).is_some_and(|w| w.contains_key(key))
    }
}

/// One handle onto a [`MemoryDatabase`].
///
/// Dropping a handle rolls back its open transaction and releases its locks.
#[derive(Debug)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    handle: u64,
    txn: Option<Txn>,
}

impl MemoryStore {
    /// Run `f` inside the open transaction, or inside a one-statement
    /// transaction that commits on success.
    fn with_txn<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.txn.is_some() {
            return f(self);
        }
        self.begin()?;
        match f(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(e) => {
                self.rollback()?;
                Err(e)
            }
        }
    }

    fn txn_mut(&mut self) -> Result<&mut Txn> {
        self.txn.as_mut().ok_or_else(|| {
            Error::Custom("memory store used outside of a transaction".to_string())
        })
    }

    fn working_rows(&self, table: &str) -> Rows {
        match &self.txn {
            Some(txn) => txn.tables.get(table).cloned().unwrap_or_default(),
            None => self
                .shared
                .lock_state()
                .committed
                .get(table)
                .cloned()
                .unwrap_or_default(),
        }
    }

    /// Take the lock on one row, waiting according to `mode`.
    fn acquire_lock(&self, table: &str, key: &PkKey, mode: LockMode) -> Result<()> {
        let lock_key = (table.to_string(), key.clone());
        let deadline = Instant::now() + self.shared.lock_timeout;
        let mut state = self.shared.lock_state();
        loop {
            let holder = state.locks.get(&lock_key).copied();
            match holder {
                None => {
                    state.locks.insert(lock_key, self.handle);
                    tracing::trace!(handle = self.handle, table, key = %key, "Row lock acquired");
                    return Ok(());
                }
                Some(holder) if holder == self.handle => return Ok(()),
                Some(holder) => {
                    if mode == LockMode::NoWait {
                        tracing::debug!(handle = self.handle, holder, table, key = %key, "Row lock busy");
                        return Err(QueryError::lock_not_available(format!(
                            "could not obtain lock on row {key} in {table}"
                        ))
                        .into());
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(QueryError::new(
                            QueryErrorKind::Timeout,
                            format!("lock wait timeout on row {key} in {table}"),
                        )
                        .into());
                    }
                    let (guard, _) = self
                        .shared
                        .lock_released
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    state = guard;
                }
            }
        }
    }

    /// Lock a row and replace the transaction's view of it with the latest
    /// committed version, unless this transaction already wrote it.
    fn lock_and_refresh(&mut self, table: &str, key: &PkKey, mode: LockMode) -> Result<()> {
        self.acquire_lock(table, key, mode)?;
        let latest = {
            let state = self.shared.lock_state();
            state.committed.get(table).and_then(|r| r.get(key).cloned())
        };
        let txn = self.txn_mut()?;
        if txn.wrote(table, key) {
            return Ok(());
        }
        let rows = txn.tables.entry(table.to_string()).or_insert_with(Rows::new);
        match latest {
            Some(row) => {
                rows.insert(key.clone(), row);
            }
            None => {
                rows.remove(key);
            }
        }
        Ok(())
    }

    fn release_locks(&self) {
        let mut state = self.shared.lock_state();
        let before = state.locks.len();
        state.locks.retain(|_, holder| *holder != self.handle);
        if state.locks.len() != before {
            self.shared.lock_released.notify_all();
        }
    }

    fn matching_keys(&self, table: &str, filter: &[Condition]) -> Result<Vec<PkKey>> {
        let def = self.shared.catalog.def(table)?;
        for cond in filter {
            def.index_of(cond.column())?;
        }
        let rows = self.working_rows(table);
        Ok(rows
            .iter()
            .filter(|(_, values)| {
                let row = def.to_row(values);
                filter.iter().all(|c| c.matches(&row))
            })
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn next_sequence(&self, table: &str, rows: &Rows, column: usize) -> i64 {
        let max_existing = rows
            .values()
            .filter_map(|r| r[column].as_i64())
            .max()
            .unwrap_or(0);
        let mut state = self.shared.lock_state();
        let seq = state.sequences.entry(table.to_string()).or_insert(0);
        *seq = (*seq).max(max_existing) + 1;
        *seq
    }

    fn run_insert(&mut self, insert: &Insert) -> Result<StatementResult> {
        let shared = Arc::clone(&self.shared);
        let def = shared.catalog.def(&insert.table)?;
        if insert.columns.len() != insert.values.len() {
            return Err(QueryError::new(
                QueryErrorKind::Syntax,
                format!(
                    "{} values for {} columns",
                    insert.values.len(),
                    insert.columns.len()
                ),
            )
            .into());
        }
        let mut row = vec![Value::Null; def.columns.len()];
        for (column, value) in insert.columns.iter().zip(&insert.values) {
            row[def.index_of(column)?] = value.clone();
        }
        let rows = self.working_rows(&insert.table);
        let mut generated_key = None;
        if let Some(auto) = def.auto_increment {
            if row[auto].is_null() {
                let next = self.next_sequence(&insert.table, &rows, auto);
                row[auto] = Value::Int(next);
                generated_key = Some(Value::Int(next));
            }
        }
        if let Some(col) = &insert.returning {
            if generated_key.is_none() {
                generated_key = Some(row[def.index_of(col)?].clone());
            }
        }
        def.check_row(&row)?;
        let key = def.key_of(&row)?;
        if rows.contains_key(&key) {
            return Err(QueryError::constraint(
                SQLSTATE_UNIQUE_VIOLATION,
                format!("UNIQUE constraint failed: {} primary key {key}", def.name),
            )
            .into());
        }
        shared.catalog.check_unique(def, &rows, &row, &key)?;
        let tables = self.txn_mut()?.tables.clone();
        shared.catalog.check_references(&tables, def, &row)?;
        self.txn_mut()?.put(&insert.table, key, Some(row));
        Ok(StatementResult {
            rows_affected: 1,
            generated_key,
        })
    }

    fn run_update(&mut self, update: &Update) -> Result<StatementResult> {
        let shared = Arc::clone(&self.shared);
        let def = shared.catalog.def(&update.table)?;
        let mut assignments = Vec::with_capacity(update.set.len());
        for (column, value) in &update.set {
            let idx = def.index_of(column)?;
            if def.pk.contains(&idx) {
                return Err(QueryError::new(
                    QueryErrorKind::Database,
                    format!("primary key column {}.{column} cannot be updated", def.name),
                )
                .into());
            }
            assignments.push((idx, value.clone()));
        }

        let keys = self.matching_keys(&update.table, &update.filter)?;
        for key in &keys {
            self.lock_and_refresh(&update.table, key, LockMode::Wait)?;
        }

        // Compute and validate every new row before applying any of them.
        let mut staged = self.txn_mut()?.tables.clone();
        let mut changed = Vec::with_capacity(keys.len());
        for key in keys {
            let rows = staged.get(&update.table).cloned().unwrap_or_default();
            let Some(current) = rows.get(&key) else {
                continue;
            };
            let row_view = def.to_row(current);
            if !update.filter.iter().all(|c| c.matches(&row_view)) {
                continue;
            }
            let mut row = current.clone();
            for (idx, value) in &assignments {
                row[*idx] = value.clone();
            }
            def.check_row(&row)?;
            shared.catalog.check_unique(def, &rows, &row, &key)?;
            shared.catalog.check_references(&staged, def, &row)?;
            staged
                .entry(update.table.clone())
                .or_insert_with(Rows::new)
                .insert(key.clone(), row.clone());
            changed.push((key, row));
        }

        let count = changed.len() as u64;
        let txn = self.txn_mut()?;
        for (key, row) in changed {
            txn.put(&update.table, key, Some(row));
        }
        Ok(StatementResult {
            rows_affected: count,
            generated_key: None,
        })
    }

    fn run_delete(&mut self, delete: &Delete) -> Result<StatementResult> {
        let shared = Arc::clone(&self.shared);
        let def = shared.catalog.def(&delete.table)?;
        let keys = self.matching_keys(&delete.table, &delete.filter)?;
        for key in &keys {
            self.lock_and_refresh(&delete.table, key, LockMode::Wait)?;
        }

        let mut staged = self.txn_mut()?.tables.clone();
        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(current) = staged.get(&delete.table).and_then(|r| r.get(&key).cloned()) else {
                continue;
            };
            if !delete.filter.iter().all(|c| c.matches(&def.to_row(&current))) {
                continue;
            }
            if let Some(rows) = staged.get_mut(&delete.table) {
                rows.remove(&key);
            }
            shared.catalog.check_unreferenced(&staged, def, &current)?;
            removed.push(key);
        }

        let count = removed.len() as u64;
        let txn = self.txn_mut()?;
        for key in removed {
            txn.put(&delete.table, key, None);
        }
        Ok(StatementResult {
            rows_affected: count,
            generated_key: None,
        })
    }

    fn run_select(&mut self, select: &Select) -> Result<Vec<Row>> {
        let def = self.shared.catalog.def(&select.table)?;
        let def_columns = Arc::clone(&def.column_info);
        for order in &select.order_by {
            def.index_of(&order.column)?;
        }
        let keys = self.matching_keys(&select.table, &select.filter)?;
        if let (Some(mode), true) = (select.lock, self.txn.is_some()) {
            for key in &keys {
                self.lock_and_refresh(&select.table, key, mode)?;
            }
        }

        let rows = self.working_rows(&select.table);
        let mut out: Vec<Row> = keys
            .iter()
            .filter_map(|key| rows.get(key))
            .map(|values| Row::with_columns(Arc::clone(&def_columns), values.clone()))
            .filter(|row| select.filter.iter().all(|c| c.matches(row)))
            .collect();
        if !select.order_by.is_empty() {
            out.sort_by(|a, b| {
                for order in &select.order_by {
                    let (x, y) = (a.get_by_name(&order.column), b.get_by_name(&order.column));
                    let ord = match (x, y) {
                        (Some(x), Some(y)) => x.sql_cmp(y).unwrap_or(std::cmp::Ordering::Equal),
                        _ => std::cmp::Ordering::Equal,
                    };
                    let ord = if order.descending { ord.reverse() } else { ord };
                    if ord != std::cmp::Ordering::Equal {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });
        }
        if let Some(limit) = select.limit {
            out.truncate(limit);
        }
        Ok(out)
    }
}

impl Store for MemoryStore {
    fn execute(&mut self, statement: &Statement) -> Result<StatementResult> {
        tracing::trace!(
            handle = self.handle,
            kind = statement.kind(),
            table = statement.table(),
            "Executing statement"
        );
        self.with_txn(|store| match statement {
            Statement::Insert(insert) => store.run_insert(insert),
            Statement::Update(update) => store.run_update(update),
            Statement::Delete(delete) => store.run_delete(delete),
        })
    }

    fn query(&mut self, select: &Select) -> Result<Vec<Row>> {
        self.run_select(select)
    }

    fn begin(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Err(Error::Custom(
                "a transaction is already open on this handle".to_string(),
            ));
        }
        let tables = self.shared.lock_state().committed.clone();
        self.txn = Some(Txn {
            tables,
            writes: BTreeMap::new(),
        });
        tracing::trace!(handle = self.handle, "Transaction started");
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let Some(txn) = self.txn.take() else {
            return Ok(());
        };
        let result = {
            let mut state = self.shared.lock_state();
            let mut merged = state.committed.clone();
            for (table, writes) in &txn.writes {
                let rows = merged.entry(table.clone()).or_insert_with(Rows::new);
                for (key, row) in writes {
                    match row {
                        Some(values) => {
                            rows.insert(key.clone(), values.clone());
                        }
                        None => {
                            rows.remove(key);
                        }
                    }
                }
            }
            self.shared.catalog.validate(&merged).map(|()| {
                state.committed = merged;
            })
        };
        self.release_locks();
        match &result {
            Ok(()) => tracing::debug!(
                handle = self.handle,
                tables = txn.writes.len(),
                "Transaction committed"
            ),
            Err(e) => tracing::warn!(handle = self.handle, error = %e, "Commit rejected"),
        }
        result
    }

    fn rollback(&mut self) -> Result<()> {
        if self.txn.take().is_some() {
            tracing::debug!(handle = self.handle, "Transaction rolled back");
        }
        self.release_locks();
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            row_locks: true,
            enforces_foreign_keys: true,
        }
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.txn = None;
        self.release_locks();
    }
}
