//! SQLite store for relmap.
//!
// FFI bindings require unsafe code
#![allow(unsafe_code)]
//!
//! [`SqliteStore`] implements [`relmap_core::Store`] over libsqlite3 (bundled
//! through `libsqlite3-sys`). Statements are rendered with `?` placeholders
//! and bound positionally; constraint failures carry the same SQLSTATE codes
//! as the memory store, and foreign keys are always enforced.
//!
//! # Example
//!
//! ```rust,ignore
//! use relmap_sqlite::{SqliteConfig, SqliteStore};
//!
//! let mut store = SqliteStore::open(&SqliteConfig::file("app.db"))?;
//! store.create_all(&registry)?;
//! ```
//!
//! # Type Mapping
//!
//! | Column type | SQLite storage |
//! |-------------|----------------|
//! | `Integer` | INTEGER |
//! | `Real` | REAL |
//! | `Text` | TEXT |
//! | `Boolean` | INTEGER (0/1) |
//! | `Blob` | BLOB |
//! | `Timestamp` | INTEGER (microseconds) |
//!
//! # Locking
//!
//! SQLite locks the whole database, so `for_update` reads take the write
//! lock rather than row locks; see [`store`].

pub mod connection;
pub mod ddl;
pub mod ffi;
pub mod store;
pub mod types;

pub use connection::{OpenFlags, SqliteConfig, SqliteConnection};
pub use store::SqliteStore;

/// The linked SQLite library version.
pub fn sqlite_version() -> &'static str {
    ffi::version()
}
