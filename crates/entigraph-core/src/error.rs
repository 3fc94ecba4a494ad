//! Error types for Entigraph operations.

use crate::identifiers::EntityId;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The primary error type for all Entigraph operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (open, transaction control, lost connection)
    Connection(ConnectionError),
    /// Row query or batch execution errors
    Query(QueryError),
    /// Entity definition errors (unknown type or node, invalid definitions)
    Schema(SchemaError),
    /// Identity map misuse
    Context(ContextError),
    /// Persist planning, validation and write failures
    Persist(PersistError),
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
    /// Connection lost during operation
    Disconnected,
    /// Transaction begin/commit/rollback failed or was used out of order
    Transaction,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    /// Entity type the query or batch targeted
    pub entity_type: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// A write matched no row, or matched a row whose lock token differs
    Stale,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// Entity type not registered
    TypeNotFound,
    /// Node not declared on the entity type
    NodeNotFound,
    /// Node exists but has a different kind than the operation needs
    WrongNodeKind,
    /// Invalid definition
    Invalid,
}

#[derive(Debug)]
pub struct ContextError {
    pub kind: ContextErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextErrorKind {
    /// An entity with the same id is already in the context
    DuplicateId,
    /// An entity with the same type and key is already in the context
    DuplicateKey,
    /// The entity id is not known to this context
    UnknownEntity,
    /// An entity constrained to exist in the database has no row
    MustExistInDb,
    /// A lazy load was needed but the context has no way to perform it
    NotLoaded,
    /// The context has no transaction resource
    NoTransaction,
}

/// A persist attempt failed.
#[derive(Debug)]
pub struct PersistError {
    pub kind: PersistErrorKind,
    pub message: String,
    /// The caller-side entity the failure concerns
    pub entity: Option<EntitySnapshot>,
    /// The conflicting database-side state, for lock mismatches
    pub database_entity: Option<EntitySnapshot>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistErrorKind {
    /// Entity from another context, unresolved save target, duplicate audit change
    IllegalState,
    /// Update, delete or depends-on target absent from the database
    EntityMissing,
    /// In-memory lock token does not match the database token
    OptimisticLockMismatch,
    /// Insert failed and the key now resolves to an existing row
    PrimaryKeyExists,
    /// Any other write failure
    WriteFailed,
    /// The access check rejected an operation
    AccessDenied,
}

/// Detached copy of an entity's identity and values, carried by errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub id: EntityId,
    pub entity_type: String,
    pub key: Option<Value>,
    pub optimistic_lock: Option<Value>,
    pub values: Vec<(String, Value)>,
}

impl fmt::Display for EntitySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{}[{}] {}", self.entity_type, key, self.id)?,
            None => write!(f, "{}[new] {}", self.entity_type, self.id)?,
        }
        if let Some(lock) = &self.optimistic_lock {
            write!(f, " lock={}", lock)?;
        }
        Ok(())
    }
}

impl PersistError {
    /// Create a persist error of the given kind.
    pub fn new(kind: PersistErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            entity: None,
            database_entity: None,
            source: None,
        }
    }

    /// Attach the entity the failure concerns.
    #[must_use]
    pub fn with_entity(mut self, entity: EntitySnapshot) -> Self {
        self.entity = Some(entity);
        self
    }

    /// Attach the database-side state of the entity.
    #[must_use]
    pub fn with_database_entity(mut self, entity: EntitySnapshot) -> Self {
        self.database_entity = Some(entity);
        self
    }

    /// Attach the underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: Error) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl Error {
    /// Shorthand for an illegal request state.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Error::Persist(PersistError::new(PersistErrorKind::IllegalState, message))
    }

    /// Shorthand for a context error.
    pub fn context(kind: ContextErrorKind, message: impl Into<String>) -> Self {
        Error::Context(ContextError {
            kind,
            message: message.into(),
        })
    }

    /// Shorthand for a schema error.
    pub fn schema(kind: SchemaErrorKind, message: impl Into<String>) -> Self {
        Error::Schema(SchemaError {
            kind,
            message: message.into(),
        })
    }

    /// The persist failure kind, if this is a persist error.
    pub fn persist_kind(&self) -> Option<PersistErrorKind> {
        match self {
            Error::Persist(p) => Some(p.kind),
            _ => None,
        }
    }

    /// Is this an optimistic-lock mismatch?
    pub fn is_optimistic_lock(&self) -> bool {
        self.persist_kind() == Some(PersistErrorKind::OptimisticLockMismatch)
    }

    /// Is this a missing-entity failure?
    pub fn is_entity_missing(&self) -> bool {
        self.persist_kind() == Some(PersistErrorKind::EntityMissing)
    }

    /// Is this a primary-key collision?
    pub fn is_primary_key_exists(&self) -> bool {
        self.persist_kind() == Some(PersistErrorKind::PrimaryKeyExists)
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(entity_type) = &e.entity_type {
                    write!(f, "Query error on {}: {}", entity_type, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::Context(e) => write!(f, "Context error: {}", e.message),
            Error::Persist(e) => write!(f, "Persist error: {}", e),
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
            Error::Persist(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(entity) = &self.entity {
            write!(f, " (entity {})", entity)?;
        }
        if let Some(db) = &self.database_entity {
            write!(f, " (database {})", db)?;
        }
        Ok(())
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

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl From<ContextError> for Error {
    fn from(err: ContextError) -> Self {
        Error::Context(err)
    }
}

impl From<PersistError> for Error {
    fn from(err: PersistError) -> Self {
        Error::Persist(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for Entigraph operations.
pub type Result<T> = std::result::Result<T, Error>;
