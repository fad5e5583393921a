//! Core types and traits for relmap.
//!
//! This crate provides the foundations the session and the stores share:
//!
//! - `Value`, `PkKey` and `Row` for data crossing the store boundary
//! - `FieldInfo`, `EntitySchema`, `RelationshipInfo` and `Cascade` for
//!   declaring entity types, validated into a `SchemaRegistry`
//! - `Statement` and `Select`, the structured operations a session issues
//! - the `Store` trait implemented by each backend
//! - `Error`, the single error type used across the workspace

pub mod error;
pub mod field;
pub mod identifiers;
pub mod key;
pub mod model;
pub mod registry;
pub mod relationship;
pub mod row;
pub mod statement;
pub mod store;
pub mod types;
pub mod value;

pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, QueryError, QueryErrorKind, Result,
    SchemaError, SchemaErrorKind, SessionError, SessionErrorKind, TypeError,
};
pub use field::{EntitySchema, FieldInfo};
pub use identifiers::quote_ident;
pub use key::{KeyPart, PkKey};
pub use model::Model;
pub use registry::{
    AssociationColumn, AssociationTable, ForeignKeySide, Relation, SchemaRegistry,
    SchemaRegistryBuilder, TableMeta,
};
pub use relationship::{Cascade, LinkTableInfo, RelationshipInfo, RelationshipKind};
pub use row::{ColumnInfo, Row};
pub use statement::{
    Condition, Delete, Insert, LockMode, OrderBy, Select, Statement, StatementResult, Update,
};
pub use store::{Store, StoreCapabilities};
pub use types::SqlType;
pub use value::Value;
