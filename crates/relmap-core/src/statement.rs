//! Structured statements issued by the session to a [`Store`](crate::Store).
//!
//! The session never builds SQL strings itself. It describes each write or
//! lookup as data, and every store decides how to run it: the memory store
//! interprets the structure directly, the SQLite store renders it with
//! [`Statement::to_sql`] and binds the returned parameters.

use crate::identifiers::quote_ident;
use crate::row::Row;
use crate::value::Value;

/// A row filter. Conditions in a list are ANDed together.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `column = value` (never true for NULL)
    Eq(String, Value),
    /// `column IN (values...)`
    In(String, Vec<Value>),
    /// `column IS NULL`
    IsNull(String),
}

impl Condition {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Eq(column.into(), value.into())
    }

    pub fn in_list(column: impl Into<String>, values: Vec<Value>) -> Self {
        Condition::In(column.into(), values)
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Condition::IsNull(column.into())
    }

    pub fn column(&self) -> &str {
        match self {
            Condition::Eq(c, _) | Condition::In(c, _) | Condition::IsNull(c) => c,
        }
    }

    /// Evaluate against a row. Unknown columns never match.
    pub fn matches(&self, row: &Row) -> bool {
        let Some(value) = row.get_by_name(self.column()) else {
            return false;
        };
        match self {
            Condition::Eq(_, expected) => value.sql_eq(expected),
            Condition::In(_, list) => list.iter().any(|v| value.sql_eq(v)),
            Condition::IsNull(_) => value.is_null(),
        }
    }

    fn render(&self, sql: &mut String, params: &mut Vec<Value>) {
        match self {
            Condition::Eq(column, value) => {
                sql.push_str(&quote_ident(column));
                sql.push_str(" = ?");
                params.push(value.clone());
            }
            Condition::In(_, list) if list.is_empty() => sql.push_str("1 = 0"),
            Condition::In(column, list) => {
                sql.push_str(&quote_ident(column));
                sql.push_str(" IN (");
                sql.push_str(&vec!["?"; list.len()].join(", "));
                sql.push(')');
                params.extend(list.iter().cloned());
            }
            Condition::IsNull(column) => {
                sql.push_str(&quote_ident(column));
                sql.push_str(" IS NULL");
            }
        }
    }
}

fn render_where(filter: &[Condition], sql: &mut String, params: &mut Vec<Value>) {
    for (i, cond) in filter.iter().enumerate() {
        sql.push_str(if i == 0 { " WHERE " } else { " AND " });
        cond.render(sql, params);
    }
}

/// Sort key for a select.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }

    /// Parse `"column"`, `"column ASC"` or `"column DESC"`.
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split_whitespace();
        let column = parts.next()?;
        let descending = match parts.next().map(str::to_ascii_uppercase).as_deref() {
            None | Some("ASC") => false,
            Some("DESC") => true,
            Some(_) => return None,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            column: column.to_string(),
            descending,
        })
    }
}

/// How a locking read behaves when another transaction holds the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Block until the lock is released (bounded by the store's lock timeout).
    #[default]
    Wait,
    /// Fail immediately with a lock-contention error.
    NoWait,
}

/// A read of whole rows from one table.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: String,
    pub filter: Vec<Condition>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
    /// Lock matching rows for the rest of the transaction (`FOR UPDATE`).
    pub lock: Option<LockMode>,
}

impl Select {
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            lock: None,
        }
    }

    #[must_use]
    pub fn filter(mut self, cond: Condition) -> Self {
        self.filter.push(cond);
        self
    }

    #[must_use]
    pub fn filters(mut self, conds: impl IntoIterator<Item = Condition>) -> Self {
        self.filter.extend(conds);
        self
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

    /// Render as `SELECT *`. The lock clause is included only when
    /// `with_lock` is set, since not every store has `FOR UPDATE`.
    pub fn to_sql(&self, with_lock: bool) -> (String, Vec<Value>) {
        let mut sql = format!("SELECT * FROM {}", quote_ident(&self.table));
        let mut params = Vec::new();
        render_where(&self.filter, &mut sql, &mut params);
        if !self.order_by.is_empty() {
            let keys: Vec<String> = self
                .order_by
                .iter()
                .map(|o| {
                    format!(
                        "{}{}",
                        quote_ident(&o.column),
                        if o.descending { " DESC" } else { "" }
                    )
                })
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&keys.join(", "));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if with_lock {
            match self.lock {
                Some(LockMode::Wait) => sql.push_str(" FOR UPDATE"),
                Some(LockMode::NoWait) => sql.push_str(" FOR UPDATE NOWAIT"),
                None => {}
            }
        }
        (sql, params)
    }
}

/// `INSERT INTO table (columns) VALUES (values)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table: String,
    pub columns: Vec<String>,
    pub values: Vec<Value>,
    /// Auto-increment column whose generated value should be returned.
    pub returning: Option<String>,
}

/// `UPDATE table SET ... WHERE ...`.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub table: String,
    pub set: Vec<(String, Value)>,
    pub filter: Vec<Condition>,
}

/// `DELETE FROM table WHERE ...`.
#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub table: String,
    pub filter: Vec<Condition>,
}

/// A write statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Insert(Insert),
    Update(Update),
    Delete(Delete),
}

impl Statement {
    pub fn table(&self) -> &str {
        match self {
            Statement::Insert(i) => &i.table,
            Statement::Update(u) => &u.table,
            Statement::Delete(d) => &d.table,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Statement::Insert(_) => "INSERT",
            Statement::Update(_) => "UPDATE",
            Statement::Delete(_) => "DELETE",
        }
    }

    /// Render as parameterized SQL with `?` placeholders.
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        match self {
            Statement::Insert(insert) => {
                let table = quote_ident(&insert.table);
                if insert.columns.is_empty() {
                    return (format!("INSERT INTO {table} DEFAULT VALUES"), Vec::new());
                }
                let cols: Vec<String> = insert.columns.iter().map(|c| quote_ident(c)).collect();
                let sql = format!(
                    "INSERT INTO {table} ({}) VALUES ({})",
                    cols.join(", "),
                    vec!["?"; insert.values.len()].join(", ")
                );
                (sql, insert.values.clone())
            }
            Statement::Update(update) => {
                let mut params = Vec::with_capacity(update.set.len());
                let assignments: Vec<String> = update
                    .set
                    .iter()
                    .map(|(col, value)| {
                        params.push(value.clone());
                        format!("{} = ?", quote_ident(col))
                    })
                    .collect();
                let mut sql = format!(
                    "UPDATE {} SET {}",
                    quote_ident(&update.table),
                    assignments.join(", ")
                );
                render_where(&update.filter, &mut sql, &mut params);
                (sql, params)
            }
            Statement::Delete(delete) => {
                let mut sql = format!("DELETE FROM {}", quote_ident(&delete.table));
                let mut params = Vec::new();
                render_where(&delete.filter, &mut sql, &mut params);
                (sql, params)
            }
        }
    }
}

/// Outcome of a write statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementResult {
    pub rows_affected: u64,
    /// Value generated for the insert's `returning` column.
    pub generated_key: Option<Value>,
}
