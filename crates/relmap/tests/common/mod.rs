//! Schemas and helpers shared by the integration tests.

#![allow(dead_code)]

use relmap::prelude::*;
use relmap::{Select, Statement, StatementResult, StoreCapabilities};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Users own posts (delete-orphan), posts carry tags through `post_tags`.
pub fn blog_registry() -> Arc<SchemaRegistry> {
    let registry = SchemaRegistry::builder()
        .entity(
            EntitySchema::new("users")
                .field(FieldInfo::id("id"))
                .field(FieldInfo::new("name", SqlType::Text))
                .field(FieldInfo::new("is_active", SqlType::Boolean).default_value(true))
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
        .expect("valid blog schema");
    Arc::new(registry)
}

/// Teams keep their heroes with the default cascade, so deleting a team
/// only clears `heroes.team_id`.
pub fn heroes_registry() -> Arc<SchemaRegistry> {
    let registry = SchemaRegistry::builder()
        .entity(
            EntitySchema::new("teams")
                .field(FieldInfo::id("id"))
                .field(FieldInfo::new("name", SqlType::Text).unique(true))
                .relationship(
                    RelationshipInfo::new("heroes", "heroes", RelationshipKind::OneToMany)
                        .remote_key("team_id")
                        .back_populates("team"),
                ),
        )
        .entity(
            EntitySchema::new("heroes")
                .field(FieldInfo::id("id"))
                .field(FieldInfo::new("name", SqlType::Text))
                .field(FieldInfo::new("secret_name", SqlType::Text))
                .field(FieldInfo::new("age", SqlType::Integer).nullable(true))
                .field(
                    FieldInfo::new("team_id", SqlType::Integer)
                        .nullable(true)
                        .foreign_key("teams.id"),
                )
                .relationship(
                    RelationshipInfo::new("team", "teams", RelationshipKind::ManyToOne)
                        .local_key("team_id")
                        .back_populates("heroes"),
                ),
        )
        .build()
        .expect("valid heroes schema");
    Arc::new(registry)
}

/// Accounts with unique numbers.
pub fn bank_registry() -> Arc<SchemaRegistry> {
    let registry = SchemaRegistry::builder()
        .entity(
            EntitySchema::new("accounts")
                .field(FieldInfo::id("id"))
                .field(FieldInfo::new("number", SqlType::Text).unique(true))
                .field(FieldInfo::new("owner", SqlType::Text))
                .field(FieldInfo::new("balance", SqlType::Real).default_value(0.0))
                .field(FieldInfo::new("version", SqlType::Integer).default_value(1)),
        )
        .build()
        .expect("valid bank schema");
    Arc::new(registry)
}

/// A typed view of an `accounts` row.
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub id: Option<i64>,
    pub number: String,
    pub owner: String,
    pub balance: f64,
    pub version: i64,
}

impl Model for Account {
    const TABLE_NAME: &'static str = "accounts";

    fn to_values(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.into()),
            ("number", self.number.clone().into()),
            ("owner", self.owner.clone().into()),
            ("balance", self.balance.into()),
            ("version", self.version.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            number: row.get_named("number")?,
            owner: row.get_named("owner")?,
            balance: row.get_named("balance")?,
            version: row.get_named("version")?,
        })
    }
}

/// Store wrapper that counts reads, to check how many round trips a load takes.
pub struct CountingStore<S> {
    inner: S,
    queries: Arc<AtomicUsize>,
}

impl<S: Store> CountingStore<S> {
    pub fn new(inner: S) -> (Self, Arc<AtomicUsize>) {
        let queries = Arc::new(AtomicUsize::new(0));
        (
            Self {
                inner,
                queries: Arc::clone(&queries),
            },
            queries,
        )
    }
}

impl<S: Store> Store for CountingStore<S> {
    fn execute(&mut self, statement: &Statement) -> Result<StatementResult> {
        self.inner.execute(statement)
    }

    fn query(&mut self, select: &Select) -> Result<Vec<Row>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.inner.query(select)
    }

    fn begin(&mut self) -> Result<()> {
        self.inner.begin()
    }

    fn commit(&mut self) -> Result<()> {
        self.inner.commit()
    }

    fn rollback(&mut self) -> Result<()> {
        self.inner.rollback()
    }

    fn in_transaction(&self) -> bool {
        self.inner.in_transaction()
    }

    fn capabilities(&self) -> StoreCapabilities {
        self.inner.capabilities()
    }
}

/// Add a user with `titles.len()` posts and commit.
pub fn seed_user<S: Store>(session: &mut Session<S>, name: &str, titles: &[&str]) -> EntityId {
    let user = session
        .add("users", [("name", Value::from(name))])
        .expect("add user");
    for title in titles {
        let post = session
            .add("posts", [("title", Value::from(*title))])
            .expect("add post");
        session.link(user, "posts", post).expect("link post");
    }
    session.commit().expect("commit seed");
    user
}

pub fn text(value: &Value) -> &str {
    match value {
        Value::Text(s) => s,
        other => panic!("expected text, got {other:?}"),
    }
}
