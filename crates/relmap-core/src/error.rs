//! Error types for relmap operations.

use std::fmt;

/// The primary error type for all relmap operations.
#[derive(Debug)]
pub enum Error {
    /// Store connection errors (open, I/O)
    Connection(ConnectionError),
    /// Statement execution errors, including constraint violations and lock contention
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Session state and identity errors
    Session(SessionError),
    /// Schema registry errors
    Schema(SchemaError),
    /// Configuration errors
    Config(ConfigError),
    /// Operation timed out
    Timeout,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to open the store
    Connect,
    /// The store handle is no longer usable
    Disconnected,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Malformed statement
    Syntax,
    /// Constraint violation (unique, foreign key, not null)
    Constraint,
    /// Table or column not found
    NotFound,
    /// A row lock is held by another transaction and the caller asked not to wait
    LockNotAvailable,
    /// Deadlock detected
    Deadlock,
    /// Lock wait or statement timeout
    Timeout,
    /// Other store error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct SessionError {
    pub kind: SessionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    /// The session was closed and can no longer be used
    Closed,
    /// Two different entities claim the same (table, primary key)
    IdentityConflict,
    /// The entity handle is not known to this session
    UnknownEntity,
    /// The entity is in a state that does not allow the operation
    InvalidState,
    /// A single-row query returned nothing
    NoResultFound,
    /// A single-row query returned more than one row
    MultipleResultsFound,
    /// Pending inserts reference each other in a cycle
    DependencyCycle,
}

#[derive(Debug)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// Table not registered
    TableNotFound,
    /// Column not declared on the table
    ColumnNotFound,
    /// Relationship not declared on the table
    RelationshipNotFound,
    /// Invalid schema definition
    Invalid,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Is this a retryable error (lock contention, deadlock, timeouts)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::LockNotAvailable
                    | QueryErrorKind::Deadlock
                    | QueryErrorKind::Timeout
            ),
            Error::Timeout => true,
            _ => false,
        }
    }

    /// Did a pessimistic lock request fail because another transaction holds the row?
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, Error::Query(q) if q.kind == QueryErrorKind::LockNotAvailable)
    }

    /// Did the store reject a write because of a unique, foreign key or not-null constraint?
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Error::Query(q) if q.kind == QueryErrorKind::Constraint)
    }

    /// Is this the error returned by operations on a closed session?
    pub fn is_session_closed(&self) -> bool {
        self.session_kind() == Some(SessionErrorKind::Closed)
    }

    /// Get the session error kind, if this is a session error.
    pub fn session_kind(&self) -> Option<SessionErrorKind> {
        match self {
            Error::Session(s) => Some(s.kind),
            _ => None,
        }
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn schema(kind: SchemaErrorKind, message: impl Into<String>) -> Self {
        Error::Schema(SchemaError {
            kind,
            message: message.into(),
        })
    }
}

impl QueryError {
    /// Build a constraint violation with the standard SQLSTATE.
    pub fn constraint(sqlstate: &str, message: impl Into<String>) -> Self {
        Self {
            kind: QueryErrorKind::Constraint,
            sql: None,
            sqlstate: Some(sqlstate.to_string()),
            message: message.into(),
            source: None,
        }
    }

    /// Build a lock contention error (SQLSTATE 55P03).
    pub fn lock_not_available(message: impl Into<String>) -> Self {
        Self {
            kind: QueryErrorKind::LockNotAvailable,
            sql: None,
            sqlstate: Some("55P03".to_string()),
            message: message.into(),
            source: None,
        }
    }

    /// Build an error without SQLSTATE.
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            sql: None,
            sqlstate: None,
            message: message.into(),
            source: None,
        }
    }

    /// Attach the SQL text that failed.
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some(SQLSTATE_UNIQUE_VIOLATION)
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some(SQLSTATE_FOREIGN_KEY_VIOLATION)
    }

    /// Is this a not-null violation?
    pub fn is_not_null_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some(SQLSTATE_NOT_NULL_VIOLATION)
    }
}

pub const SQLSTATE_UNIQUE_VIOLATION: &str = "23505";
pub const SQLSTATE_FOREIGN_KEY_VIOLATION: &str = "23503";
pub const SQLSTATE_NOT_NULL_VIOLATION: &str = "23502";

impl SessionError {
    pub fn new(kind: SessionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The error returned by every operation on a closed session.
    pub fn closed() -> Self {
        Self::new(SessionErrorKind::Closed, "session is closed")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Session(e) => write!(f, "Session error: {}", e.message),
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<SessionError> for Error {
    fn from(err: SessionError) -> Self {
        Error::Session(err)
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for relmap operations.
pub type Result<T> = std::result::Result<T, Error>;
