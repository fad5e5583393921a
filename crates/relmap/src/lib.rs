//! relmap - a small ORM session for Rust.
//!
//! relmap keeps a per-session graph of rows and writes it back in one
//! transaction:
//!
//! - An identity map guarantees one in-memory entity per primary key
//! - A unit of work collects inserts, updates and deletes until flush
//! - Linking two entities updates both sides and the backing foreign key
//!   or association row
//! - Cascades reach children when a parent is deleted, and `delete-orphan`
//!   removes children that lose their parent
//! - A failed flush rolls everything back
//!
//! # Quick Start
//!
//! ```ignore
//! use relmap::prelude::*;
//!
//! let registry = SchemaRegistry::builder()
//!     .entity(
//!         EntitySchema::new("users")
//!             .field(FieldInfo::id("id"))
//!             .field(FieldInfo::new("name", SqlType::Text))
//!             .relationship(
//!                 RelationshipInfo::new("posts", "posts", RelationshipKind::OneToMany)
//!                     .remote_key("user_id")
//!                     .back_populates("author")
//!                     .cascade("all, delete-orphan"),
//!             ),
//!     )
//!     .entity(
//!         EntitySchema::new("posts")
//!             .field(FieldInfo::id("id"))
//!             .field(FieldInfo::new("title", SqlType::Text))
//!             .field(FieldInfo::new("user_id", SqlType::Integer).foreign_key("users.id"))
//!             .relationship(
//!                 RelationshipInfo::new("author", "users", RelationshipKind::ManyToOne)
//!                     .local_key("user_id")
//!                     .back_populates("posts"),
//!             ),
//!     )
//!     .build()?;
//!
//! let db = MemoryDatabase::from_registry(&registry);
//! let factory = SessionFactory::new(registry);
//! let mut session = factory.session(db.connect());
//!
//! let user = session.add("users", [("name", "ann".into())])?;
//! let post = session.add("posts", [("title", "hello".into())])?;
//! session.link(user, "posts", post)?;
//! session.commit()?;
//!
//! session.delete(user)?;
//! session.commit()?; // the post goes too
//! ```
//!
//! # Stores
//!
//! - [`MemoryDatabase`]: in-process, transactional, enforces constraints and
//!   row locks. Good for tests.
//! - `SqliteStore` (feature `sqlite`, on by default): SQLite through
//!   `libsqlite3-sys`.

pub use relmap_core::{
    Cascade, Condition, ConfigError, EntitySchema, Error, FieldInfo, ForeignKeySide, KeyPart,
    LinkTableInfo, LockMode, Model, OrderBy, PkKey, QueryError, QueryErrorKind, Relation,
    RelationshipInfo, RelationshipKind, Result, Row, SchemaError, SchemaErrorKind,
    SchemaRegistry, SchemaRegistryBuilder, Select, SessionError, SessionErrorKind, SqlType,
    Statement, StatementResult, Store, StoreCapabilities, TableMeta, TypeError, Value,
};

pub use relmap_session::{
    Entity, EntityId, FlushResult, GetOptions, ObjectState, PendingCounts, QueryOptions, Related,
    Session, SessionConfig, SessionEvent, SessionFactory, SessionState,
};

pub use relmap_memory::{MemoryDatabase, MemoryStore};

#[cfg(feature = "sqlite")]
pub use relmap_sqlite::{SqliteConfig, SqliteStore};

/// Commonly used types.
///
/// ```ignore
/// use relmap::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Condition, EntityId, EntitySchema, Error, FieldInfo, GetOptions, LinkTableInfo, LockMode,
        MemoryDatabase, Model, ObjectState, OrderBy, QueryOptions, RelationshipInfo,
        RelationshipKind, Result, Row, SchemaRegistry, Session, SessionConfig, SessionFactory,
        SqlType, Store, Value,
    };

    #[cfg(feature = "sqlite")]
    pub use crate::{SqliteConfig, SqliteStore};
}
