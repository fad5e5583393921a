//! [`Store`] implementation over a [`SqliteConnection`].
//!
//! SQLite has no row locks. A locking read is emulated by taking the
//! database write lock: a transaction whose first statement is a locking
//! read starts with `BEGIN IMMEDIATE`, and a transaction that is already
//! running acquires the lock with a no-op write. `LockMode::NoWait` drops
//! the busy timeout to zero for that acquisition, so contention fails
//! immediately with a lock-contention error. Under `LockMode::Wait` a lock
//! still busy after the full busy timeout is reported as a timeout.

use crate::connection::{SqliteConfig, SqliteConnection};
use crate::ddl;
use relmap_core::{
    Error, LockMode, QueryError, QueryErrorKind, Result, Row, SchemaRegistry, Select, Statement, StatementResult, Store,
    StoreCapabilities, Value, quote_ident,
};

#[derive(Debug, Clone, Copy, Default)]
struct TxnState {
    /// `BEGIN` has been sent.
    started: bool,
    /// This connection holds the database write lock.
    write_locked: bool,
}

/// A SQLite-backed store. One store per session.
#[derive(Debug)]
pub struct SqliteStore {
    conn: SqliteConnection,
    busy_timeout_ms: u32,
    txn: Option<TxnState>,
}

impl SqliteStore {
    pub fn open(config: &SqliteConfig) -> Result<Self> {
        Ok(Self {
            conn: SqliteConnection::open(config)?,
            busy_timeout_ms: config.busy_timeout_ms,
            txn: None,
        })
    }

    pub fn open_memory() -> Result<Self> {
        Self::open(&SqliteConfig::memory())
    }

    pub fn connection(&self) -> &SqliteConnection {
        &self.conn
    }

    /// Create every table of the registry that does not exist yet.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn create_all(&mut self, registry: &SchemaRegistry) -> Result<()> {
        for sql in ddl::create_all_sql(registry) {
            tracing::trace!(sql = %sql, "Creating table");
            self.conn.execute_raw(&sql)?;
        }
        Ok(())
    }

    /// Drop every table of the registry, link tables first.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn drop_all(&mut self, registry: &SchemaRegistry) -> Result<()> {
        for sql in ddl::drop_all_sql(registry) {
            tracing::trace!(sql = %sql, "Dropping table");
            self.conn.execute_raw(&sql)?;
        }
        Ok(())
    }

    /// Run `f` with the busy timeout the lock mode asks for.
    fn with_lock_mode<T>(
        &self,
        mode: Option<LockMode>,
        f: impl FnOnce(&SqliteConnection) -> Result<T>,
    ) -> Result<T> {
        if mode != Some(LockMode::NoWait) {
            return f(&self.conn).map_err(waited_out);
        }
        self.conn.set_busy_timeout(0);
        let result = f(&self.conn);
        self.conn.set_busy_timeout(self.busy_timeout_ms);
        result
    }

    /// Send the deferred `BEGIN`, and take the write lock when `lock` asks for it.
    fn prepare_txn(&mut self, lock: Option<LockMode>, table: &str) -> Result<()> {
        let Some(mut state) = self.txn else {
            return Ok(());
        };
        if !state.started {
            let sql = if lock.is_some() {
                "BEGIN IMMEDIATE"
            } else {
                "BEGIN"
            };
            self.with_lock_mode(lock, |conn| conn.execute_raw(sql))?;
            state.started = true;
            state.write_locked = lock.is_some();
        } else if lock.is_some() && !state.write_locked {
            let sql = format!("UPDATE {} SET rowid = rowid WHERE 0", quote_ident(table));
            self.with_lock_mode(lock, |conn| conn.execute(&sql, &[]))?;
            state.write_locked = true;
        }
        self.txn = Some(state);
        Ok(())
    }

    fn run(&self, statement: &Statement) -> Result<StatementResult> {
        let (sql, params) = statement.to_sql();
        let rows_affected = self.conn.execute(&sql, &params).map_err(waited_out)?;
        let generated_key = match statement {
            Statement::Insert(insert) => insert.returning.as_ref().map(|column| {
                let explicit = insert
                    .columns
                    .iter()
                    .position(|c| c == column)
                    .and_then(|i| insert.values.get(i))
                    .filter(|v| !v.is_null());
                explicit
                    .cloned()
                    .unwrap_or_else(|| Value::Int(self.conn.last_insert_rowid()))
            }),
            _ => None,
        };
        Ok(StatementResult {
            rows_affected,
            generated_key,
        })
    }
}

impl Store for SqliteStore {
    fn execute(&mut self, statement: &Statement) -> Result<StatementResult> {
        self.prepare_txn(None, statement.table())?;
        let result = self.run(statement)?;
        if let Some(state) = self.txn.as_mut() {
            state.write_locked = true;
        }
        tracing::trace!(
            kind = statement.kind(),
            table = statement.table(),
            rows = result.rows_affected,
            "Executed statement"
        );
        Ok(result)
    }

    fn query(&mut self, select: &Select) -> Result<Vec<Row>> {
        let lock = select.lock.filter(|_| self.txn.is_some());
        self.prepare_txn(lock, &select.table)?;
        let (sql, params) = select.to_sql(false);
        self.conn.query(&sql, &params).map_err(waited_out)
    }

    fn begin(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Err(Error::Custom(
                "a transaction is already open on this store".to_string(),
            ));
        }
        self.txn = Some(TxnState::default());
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let Some(state) = self.txn.take() else {
            return Ok(());
        };
        if state.started {
            if let Err(e) = self.conn.execute_raw("COMMIT") {
                // A failed COMMIT leaves the transaction open; end it.
                if let Err(rollback) = self.conn.execute_raw("ROLLBACK") {
                    tracing::warn!(error = %rollback, "ROLLBACK after failed COMMIT failed");
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        match self.txn.take() {
            Some(state) if state.started => self.conn.execute_raw("ROLLBACK"),
            _ => Ok(()),
        }
    }

    fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            row_locks: false,
            enforces_foreign_keys: true,
        }
    }
}

/// A busy database after a waited acquisition is a timeout, not fail-fast
/// contention.
fn waited_out(err: Error) -> Error {
    match err {
        Error::Query(query) if query.kind == QueryErrorKind::LockNotAvailable => {
            Error::Query(QueryError {
                kind: QueryErrorKind::Timeout,
                sqlstate: None,
                ..query
            })
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::{Condition, EntitySchema, FieldInfo, Insert, SqlType};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn registry() -> SchemaRegistry {
        SchemaRegistry::builder()
            .entity(
                EntitySchema::new("accounts")
                    .field(FieldInfo::id("id"))
                    .field(FieldInfo::new("number", SqlType::Text).unique(true))
                    .field(FieldInfo::new("balance", SqlType::Real)),
            )
            .build()
            .unwrap()
    }

    fn insert(number: &str, balance: f64) -> Statement {
        Statement::Insert(Insert {
            table: "accounts".into(),
            columns: vec!["number".into(), "balance".into()],
            values: vec![number.into(), balance.into()],
            returning: Some("id".into()),
        })
    }

    fn temp_db_path() -> String {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir()
            .join(format!("relmap-sqlite-{}-{n}.db", std::process::id()))
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn insert_returns_generated_key_and_rolls_back() {
        let mut store = SqliteStore::open_memory().unwrap();
        store.create_all(&registry()).unwrap();

        let result = store.execute(&insert("A-1", 10.0)).unwrap();
        assert_eq!(result.generated_key, Some(Value::Int(1)));

        store.begin().unwrap();
        store.execute(&insert("A-2", 5.0)).unwrap();
        let err = store.execute(&insert("A-1", 1.0)).unwrap_err();
        assert!(err.is_constraint_violation());
        store.rollback().unwrap();

        let rows = store.query(&Select::from("accounts")).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!store.in_transaction());
    }

    #[test]
    fn nowait_lock_conflicts_across_connections() {
        let path = temp_db_path();
        let _ = std::fs::remove_file(&path);
        let config = SqliteConfig::file(&path).busy_timeout(1000);
        let mut first = SqliteStore::open(&config).unwrap();
        first.create_all(&registry()).unwrap();
        first.execute(&insert("A-1", 10.0)).unwrap();
        let mut second = SqliteStore::open(&config).unwrap();

        let locking = Select::from("accounts")
            .filter(Condition::eq("id", 1_i64))
            .for_update(LockMode::NoWait);

        first.begin().unwrap();
        assert_eq!(first.query(&locking).unwrap().len(), 1);

        second.begin().unwrap();
        let err = second.query(&locking).unwrap_err();
        assert!(err.is_lock_contention());
        second.rollback().unwrap();

        first.commit().unwrap();
        second.begin().unwrap();
        assert_eq!(second.query(&locking).unwrap().len(), 1);
        second.commit().unwrap();

        drop(first);
        drop(second);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn waited_lock_reports_timeout() {
        let path = temp_db_path();
        let _ = std::fs::remove_file(&path);
        let config = SqliteConfig::file(&path).busy_timeout(50);
        let mut first = SqliteStore::open(&config).unwrap();
        first.create_all(&registry()).unwrap();
        first.execute(&insert("A-1", 10.0)).unwrap();
        let mut second = SqliteStore::open(&config).unwrap();

        let locking = Select::from("accounts")
            .filter(Condition::eq("id", 1_i64))
            .for_update(LockMode::Wait);
        first.begin().unwrap();
        first.query(&locking).unwrap();

        second.begin().unwrap();
        let err = second.query(&locking).unwrap_err();
        assert!(!err.is_lock_contention(), "{err}");
        assert!(err.is_retryable());
        assert!(matches!(&err, Error::Query(q) if q.kind == QueryErrorKind::Timeout));
        second.rollback().unwrap();
        first.commit().unwrap();

        drop(first);
        drop(second);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn drop_all_then_create_all_starts_empty() {
        let registry = registry();
        let mut store = SqliteStore::open_memory().unwrap();
        store.create_all(&registry).unwrap();
        store.execute(&insert("A-1", 10.0)).unwrap();

        store.drop_all(&registry).unwrap();
        assert!(store.query(&Select::from("accounts")).is_err());
        store.drop_all(&registry).unwrap();

        store.create_all(&registry).unwrap();
        assert!(store.query(&Select::from("accounts")).unwrap().is_empty());
    }

    #[test]
    fn late_lock_upgrades_running_transaction() {
        let mut store = SqliteStore::open_memory().unwrap();
        store.create_all(&registry()).unwrap();
        store.execute(&insert("A-1", 10.0)).unwrap();

        store.begin().unwrap();
        store.query(&Select::from("accounts")).unwrap();
        let rows = store
            .query(&Select::from("accounts").for_update(LockMode::Wait))
            .unwrap();
        assert_eq!(rows.len(), 1);
        store.commit().unwrap();
    }
}
