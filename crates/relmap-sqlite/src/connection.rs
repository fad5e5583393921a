//! Safe wrapper around one libsqlite3 database handle.

// FFI needs exact C integer types
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::borrow_as_ptr)]

use crate::ffi;
use crate::types;
use relmap_core::error::{
    ConnectionError, ConnectionErrorKind, QueryError, QueryErrorKind,
    SQLSTATE_FOREIGN_KEY_VIOLATION, SQLSTATE_NOT_NULL_VIOLATION, SQLSTATE_UNIQUE_VIOLATION,
};
use relmap_core::{ColumnInfo, Error, Result, Row, Value};
use serde::Deserialize;
use std::ffi::{CStr, CString, c_int};
use std::ptr;
use std::sync::Arc;

/// Configuration for opening SQLite connections.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Path to the database file, or `":memory:"`.
    pub path: String,
    /// Open flags (read-only, read-write, create, etc.)
    pub flags: OpenFlags,
    /// How long a statement waits for another connection's lock, in
    /// milliseconds. Locking reads with `LockMode::NoWait` ignore it.
    pub busy_timeout_ms: u32,
}

/// Flags controlling how the database is opened.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct OpenFlags {
    pub read_only: bool,
    pub read_write: bool,
    /// Create the database if it doesn't exist.
    pub create: bool,
    /// Interpret the path as a URI.
    pub uri: bool,
    pub no_mutex: bool,
    pub full_mutex: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Default::default()
        }
    }

    pub fn create_read_write() -> Self {
        Self {
            read_write: true,
            create: true,
            ..Default::default()
        }
    }

    fn to_sqlite_flags(self) -> c_int {
        let mut flags = 0;
        if self.read_only {
            flags |= ffi::SQLITE_OPEN_READONLY;
        }
        if self.read_write {
            flags |= ffi::SQLITE_OPEN_READWRITE;
        }
        if self.create {
            flags |= ffi::SQLITE_OPEN_CREATE;
        }
        if self.uri {
            flags |= ffi::SQLITE_OPEN_URI;
        }
        if self.no_mutex {
            flags |= ffi::SQLITE_OPEN_NOMUTEX;
        }
        if self.full_mutex {
            flags |= ffi::SQLITE_OPEN_FULLMUTEX;
        }
        // Default to read-write if no mode specified
        if flags & (ffi::SQLITE_OPEN_READONLY | ffi::SQLITE_OPEN_READWRITE) == 0 {
            flags |= ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE;
        }
        flags
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
            flags: OpenFlags::create_read_write(),
            busy_timeout_ms: 5000,
        }
    }
}

impl SqliteConfig {
    /// Config for a file-based database.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Config for a private in-memory database.
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    /// Parse from JSON, e.g. `{"path": "app.db", "busy_timeout_ms": 100}`.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// A connection to a SQLite database.
pub struct SqliteConnection {
    db: *mut ffi::sqlite3,
    path: String,
}

// SAFETY: the handle is owned exclusively and every call goes through
// `&mut self` or `&self` on a value that is never shared across threads
// without synchronization (`SqliteConnection` is not `Sync`).
unsafe impl Send for SqliteConnection {}

impl std::fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteConnection {
    /// Open a connection. Foreign-key enforcement is switched on.
    pub fn open(config: &SqliteConfig) -> Result<Self> {
        let c_path = CString::new(config.path.as_str()).map_err(|_| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: "Invalid path: contains null byte".to_string(),
                source: None,
            })
        })?;

        let mut db: *mut ffi::sqlite3 = ptr::null_mut();
        // SAFETY: valid pointers; the return value is checked
        let rc = unsafe {
            ffi::sqlite3_open_v2(
                c_path.as_ptr(),
                &mut db,
                config.flags.to_sqlite_flags(),
                ptr::null(),
            )
        };

        if rc != ffi::SQLITE_OK {
            let msg = if db.is_null() {
                ffi::error_string(rc).to_string()
            } else {
                // SAFETY: db is a valid (failed) handle that must still be closed
                unsafe {
                    let msg = errmsg(db);
                    ffi::sqlite3_close_v2(db);
                    msg
                }
            };
            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: format!("Failed to open database {}: {msg}", config.path),
                source: None,
            }));
        }

        // SAFETY: db is valid
        unsafe {
            ffi::sqlite3_extended_result_codes(db, 1);
        }

        let conn = Self {
            db,
            path: config.path.clone(),
        };
        conn.set_busy_timeout(config.busy_timeout_ms);
        conn.execute_raw("PRAGMA foreign_keys = ON")?;
        tracing::debug!(path = %conn.path, "Opened SQLite connection");
        Ok(conn)
    }

    pub fn open_memory() -> Result<Self> {
        Self::open(&SqliteConfig::memory())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_busy_timeout(&self, ms: u32) {
        // SAFETY: db is valid
        unsafe {
            ffi::sqlite3_busy_timeout(self.db, ms.min(c_int::MAX as u32) as c_int);
        }
    }

    /// Execute one or more statements without parameters (DDL, PRAGMA, BEGIN).
    pub fn execute_raw(&self, sql: &str) -> Result<()> {
        let c_sql = c_string(sql)?;
        let mut err: *mut std::ffi::c_char = ptr::null_mut();
        // SAFETY: all pointers are valid
        let rc =
            unsafe { ffi::sqlite3_exec(self.db, c_sql.as_ptr(), None, ptr::null_mut(), &mut err) };
        if rc != ffi::SQLITE_OK {
            let msg = if err.is_null() {
                ffi::error_string(rc).to_string()
            } else {
                // SAFETY: err was allocated by sqlite3_exec and is freed here
                unsafe {
                    let msg = CStr::from_ptr(err).to_string_lossy().into_owned();
                    ffi::sqlite3_free(err.cast());
                    msg
                }
            };
            // SAFETY: db is valid
            let code = unsafe { ffi::sqlite3_extended_errcode(self.db) };
            return Err(query_error(code, msg, sql));
        }
        Ok(())
    }

    /// Run a query and collect every row.
    pub fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let stmt = self.prepare(sql, params)?;
        // SAFETY: stmt is valid
        let col_count = unsafe { ffi::sqlite3_column_count(stmt.0) };
        let names = (0..col_count)
            .map(|i| {
                // SAFETY: stmt is valid and i is in range
                unsafe { types::column_name(stmt.0, i) }.unwrap_or_else(|| format!("col{i}"))
            })
            .collect();
        let columns = Arc::new(ColumnInfo::new(names));

        let mut rows = Vec::new();
        loop {
            // SAFETY: stmt is valid
            match unsafe { ffi::sqlite3_step(stmt.0) } {
                ffi::SQLITE_ROW => {
                    let values = (0..col_count)
                        // SAFETY: we just got SQLITE_ROW and i is in range
                        .map(|i| unsafe { types::read_column(stmt.0, i) })
                        .collect();
                    rows.push(Row::with_columns(Arc::clone(&columns), values));
                }
                ffi::SQLITE_DONE => break,
                _ => return Err(self.last_error(sql)),
            }
        }
        Ok(rows)
    }

    /// Run a write statement, returning the number of changed rows.
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let stmt = self.prepare(sql, params)?;
        // SAFETY: stmt is valid
        match unsafe { ffi::sqlite3_step(stmt.0) } {
            ffi::SQLITE_DONE | ffi::SQLITE_ROW => {
                // SAFETY: db is valid
                let changes = unsafe { ffi::sqlite3_changes(self.db) };
                Ok(changes as u64)
            }
            _ => Err(self.last_error(sql)),
        }
    }

    pub fn last_insert_rowid(&self) -> i64 {
        // SAFETY: db is valid
        unsafe { ffi::sqlite3_last_insert_rowid(self.db) }
    }

    fn prepare(&self, sql: &str, params: &[Value]) -> Result<Stmt> {
        let c_sql = c_string(sql)?;
        let mut raw: *mut ffi::sqlite3_stmt = ptr::null_mut();
        // SAFETY: all pointers are valid
        let rc = unsafe {
            ffi::sqlite3_prepare_v2(
                self.db,
                c_sql.as_ptr(),
                c_sql.as_bytes().len() as c_int,
                &mut raw,
                ptr::null_mut(),
            )
        };
        if rc != ffi::SQLITE_OK {
            return Err(self.last_error(sql));
        }
        let stmt = Stmt(raw);
        for (i, param) in params.iter().enumerate() {
            // SAFETY: stmt is valid, index is 1-based
            let rc = unsafe { types::bind_value(stmt.0, (i + 1) as c_int, param) };
            if rc != ffi::SQLITE_OK {
                // SAFETY: db is valid
                let msg = unsafe { errmsg(self.db) };
                return Err(QueryError::new(
                    QueryErrorKind::Database,
                    format!("Failed to bind parameter {}: {msg}", i + 1),
                )
                .with_sql(sql)
                .into());
            }
        }
        Ok(stmt)
    }

    fn last_error(&self, sql: &str) -> Error {
        // SAFETY: db is valid
        let (code, msg) = unsafe { (ffi::sqlite3_extended_errcode(self.db), errmsg(self.db)) };
        query_error(code, msg, sql)
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        if !self.db.is_null() {
            // SAFETY: db is valid and statements are finalized by `Stmt`
            unsafe {
                ffi::sqlite3_close_v2(self.db);
            }
        }
    }
}

/// Finalizes the statement when dropped.
struct Stmt(*mut ffi::sqlite3_stmt);

impl Drop for Stmt {
    fn drop(&mut self) {
        // SAFETY: the pointer came from sqlite3_prepare_v2
        unsafe {
            ffi::sqlite3_finalize(self.0);
        }
    }
}

fn c_string(sql: &str) -> Result<CString> {
    CString::new(sql).map_err(|_| {
        QueryError::new(QueryErrorKind::Syntax, "SQL contains null byte")
            .with_sql(sql)
            .into()
    })
}

/// # Safety
/// `db` must be a valid handle.
unsafe fn errmsg(db: *mut ffi::sqlite3) -> String {
    // SAFETY: forwarded from the caller
    unsafe { CStr::from_ptr(ffi::sqlite3_errmsg(db)) }
        .to_string_lossy()
        .into_owned()
}

/// Map an extended result code to a query error.
fn query_error(code: c_int, message: String, sql: &str) -> Error {
    let sqlstate = match code {
        ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
            Some(SQLSTATE_UNIQUE_VIOLATION)
        }
        ffi::SQLITE_CONSTRAINT_FOREIGNKEY => Some(SQLSTATE_FOREIGN_KEY_VIOLATION),
        ffi::SQLITE_CONSTRAINT_NOTNULL => Some(SQLSTATE_NOT_NULL_VIOLATION),
        _ => None,
    };
    let error = match (error_code_to_kind(code), sqlstate) {
        (QueryErrorKind::Constraint, Some(state)) => QueryError::constraint(state, message),
        (QueryErrorKind::LockNotAvailable, _) => QueryError::lock_not_available(message),
        (kind, _) => QueryError::new(kind, message),
    };
    error.with_sql(sql).into()
}

fn error_code_to_kind(code: c_int) -> QueryErrorKind {
    match code & 0xff {
        ffi::SQLITE_CONSTRAINT => QueryErrorKind::Constraint,
        ffi::SQLITE_BUSY | ffi::SQLITE_LOCKED => QueryErrorKind::LockNotAvailable,
        ffi::SQLITE_NOTFOUND => QueryErrorKind::NotFound,
        _ => QueryErrorKind::Database,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_memory() {
        let conn = SqliteConnection::open_memory().unwrap();
        assert_eq!(conn.path(), ":memory:");
    }

    #[test]
    fn test_parameterized_query() {
        let conn = SqliteConnection::open_memory().unwrap();
        conn.execute_raw("CREATE TABLE test (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)")
            .unwrap();
        let changed = conn
            .execute(
                "INSERT INTO test (name, age) VALUES (?, ?)",
                &[Value::Text("Alice".to_string()), Value::Int(30)],
            )
            .unwrap();
        assert_eq!(changed, 1);
        assert_eq!(conn.last_insert_rowid(), 1);

        let rows = conn
            .query("SELECT * FROM test WHERE name = ?", &["Alice".into()])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_named::<i64>("age").unwrap(), 30);
        assert_eq!(rows[0].get_named::<Option<String>>("name").unwrap().as_deref(), Some("Alice"));
    }

    #[test]
    fn test_constraint_errors_carry_sqlstate() {
        let conn = SqliteConnection::open_memory().unwrap();
        conn.execute_raw(
            "CREATE TABLE parent (id INTEGER PRIMARY KEY);
             CREATE TABLE child (id INTEGER PRIMARY KEY,
                                 parent_id INTEGER NOT NULL REFERENCES parent(id),
                                 code TEXT UNIQUE)",
        )
        .unwrap();
        conn.execute("INSERT INTO parent (id) VALUES (1)", &[]).unwrap();
        conn.execute("INSERT INTO child (parent_id, code) VALUES (1, 'a')", &[])
            .unwrap();

        let err = conn
            .execute("INSERT INTO child (parent_id, code) VALUES (1, 'a')", &[])
            .unwrap_err();
        assert_eq!(err.sqlstate(), Some(SQLSTATE_UNIQUE_VIOLATION));

        let err = conn
            .execute("INSERT INTO child (parent_id, code) VALUES (7, 'b')", &[])
            .unwrap_err();
        assert_eq!(err.sqlstate(), Some(SQLSTATE_FOREIGN_KEY_VIOLATION));

        let err = conn
            .execute("INSERT INTO child (parent_id) VALUES (NULL)", &[])
            .unwrap_err();
        assert_eq!(err.sqlstate(), Some(SQLSTATE_NOT_NULL_VIOLATION));
        assert!(err.sql().is_some_and(|s| s.starts_with("INSERT")));
    }

    #[test]
    fn test_config_from_json() {
        let config = SqliteConfig::from_json(r#"{"path": "app.db", "busy_timeout_ms": 0}"#).unwrap();
        assert_eq!(config.path, "app.db");
        assert_eq!(config.busy_timeout_ms, 0);
        assert!(!config.flags.read_only);
        assert!(SqliteConfig::from_json("{\"path\": 3}").is_err());
    }
}
