//! The subset of libsqlite3 the store uses.

#![allow(non_camel_case_types)]

use std::ffi::{CStr, c_int};

pub use libsqlite3_sys::{
    SQLITE_BLOB, SQLITE_BUSY, SQLITE_CONSTRAINT, SQLITE_CONSTRAINT_FOREIGNKEY,
    SQLITE_CONSTRAINT_NOTNULL, SQLITE_CONSTRAINT_PRIMARYKEY, SQLITE_CONSTRAINT_UNIQUE,
    SQLITE_DONE, SQLITE_FLOAT, SQLITE_INTEGER, SQLITE_LOCKED, SQLITE_MISMATCH, SQLITE_NOTFOUND,
    SQLITE_NULL, SQLITE_OK, SQLITE_OPEN_CREATE, SQLITE_OPEN_FULLMUTEX, SQLITE_OPEN_NOMUTEX,
    SQLITE_OPEN_READONLY, SQLITE_OPEN_READWRITE, SQLITE_OPEN_URI, SQLITE_ROW, SQLITE_TEXT,
    SQLITE_TRANSIENT, sqlite3, sqlite3_bind_blob, sqlite3_bind_double, sqlite3_bind_int64,
    sqlite3_bind_null, sqlite3_bind_text, sqlite3_busy_timeout, sqlite3_changes,
    sqlite3_column_blob, sqlite3_column_bytes, sqlite3_column_count,
    sqlite3_column_double, sqlite3_column_int64, sqlite3_column_name, sqlite3_column_text,
    sqlite3_column_type, sqlite3_errmsg, sqlite3_errstr, sqlite3_exec,
    sqlite3_extended_errcode, sqlite3_extended_result_codes, sqlite3_finalize, sqlite3_free,
    sqlite3_last_insert_rowid, sqlite3_libversion, sqlite3_libversion_number,
    sqlite3_open_v2, sqlite3_prepare_v2, sqlite3_step, sqlite3_stmt,
};

// libsqlite3-sys blocklists `sqlite3_close_v2` from its generated bindings,
// but the linked library exports it.
unsafe extern "C" {
    pub fn sqlite3_close_v2(db: *mut sqlite3) -> c_int;
}

/// The SQLite library version, e.g. `"3.46.0"`.
pub fn version() -> &'static str {
    // SAFETY: sqlite3_libversion returns a static string
    unsafe {
        let ptr = sqlite3_libversion();
        CStr::from_ptr(ptr).to_str().unwrap_or("unknown")
    }
}

/// The SQLite library version as `3XXYYZZ`.
pub fn version_number() -> i32 {
    // SAFETY: always safe to call
    unsafe { sqlite3_libversion_number() }
}

/// English description of a result code.
pub fn error_string(code: c_int) -> &'static str {
    // SAFETY: sqlite3_errstr returns a static string
    unsafe {
        let ptr = sqlite3_errstr(code);
        CStr::from_ptr(ptr).to_str().unwrap_or("unknown error")
    }
}
