//! The storage seam between a session and a relational backend.

use crate::Result;
use crate::row::Row;
use crate::statement::{Select, Statement, StatementResult};

/// What a store can guarantee beyond plain reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreCapabilities {
    /// `Select::lock` takes per-row locks. When false the store may emulate
    /// locking more coarsely (for example with a database-wide write lock).
    pub row_locks: bool,
    /// The store rejects writes that break foreign keys.
    pub enforces_foreign_keys: bool,
}

/// A relational store that runs structured statements inside at most one
/// open transaction.
///
/// A store handle is used by one session at a time. Independent sessions get
/// independent handles; isolation between them is the store's business.
pub trait Store {
    /// Run an INSERT, UPDATE or DELETE.
    ///
    /// Constraint violations come back as `QueryErrorKind::Constraint`, and
    /// lock contention under `LockMode::NoWait` as
    /// `QueryErrorKind::LockNotAvailable`. Outside a transaction the write
    /// commits immediately.
    fn execute(&mut self, statement: &Statement) -> Result<StatementResult>;

    /// Run a SELECT. With `select.lock` set, matching rows stay locked until
    /// the transaction ends.
    fn query(&mut self, select: &Select) -> Result<Vec<Row>>;

    fn begin(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    fn in_transaction(&self) -> bool;

    fn capabilities(&self) -> StoreCapabilities;
}

impl<S: Store + ?Sized> Store for Box<S> {
    fn execute(&mut self, statement: &Statement) -> Result<StatementResult> {
        (**self).execute(statement)
    }

    fn query(&mut self, select: &Select) -> Result<Vec<Row>> {
        (**self).query(select)
    }

    fn begin(&mut self) -> Result<()> {
        (**self).begin()
    }

    fn commit(&mut self) -> Result<()> {
        (**self).commit()
    }

    fn rollback(&mut self) -> Result<()> {
        (**self).rollback()
    }

    fn in_transaction(&self) -> bool {
        (**self).in_transaction()
    }

    fn capabilities(&self) -> StoreCapabilities {
        (**self).capabilities()
    }
}
