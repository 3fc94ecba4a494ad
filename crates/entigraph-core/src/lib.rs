//! Core types and traits for Entigraph.
//!
//! This crate provides the foundational abstractions shared by the
//! persistence engine and its storage drivers:
//!
//! - `Value` and `Row` for dynamically typed node values and result rows
//! - `EntityType`/`Definitions` for describing entities and their relations
//! - `Connection`, `DataSource`, `SequenceGenerator` and `AccessControl`
//!   collaborator traits
//! - `AuditRecord` and the `Error` taxonomy

pub mod audit;
pub mod connection;
pub mod definition;
pub mod error;
pub mod identifiers;
pub mod row;
pub mod value;

pub use audit::{AuditRecord, Change};
pub use connection::{
    AccessControl, AllowAll, BatchFailure, Connection, DataSource, FilterOp, Operation, RowFilter,
    RowQuery, SequenceGenerator, WriteBatch, WriteKind, WriteRow,
};
pub use definition::{Definitions, EntityType, EntityTypeBuilder, NodeKind, NodeType, Relation};
pub use error::{
    ConnectionError, ConnectionErrorKind, ContextError, ContextErrorKind, EntitySnapshot, Error,
    PersistError, PersistErrorKind, QueryError, QueryErrorKind, Result, SchemaError,
    SchemaErrorKind,
};
pub use identifiers::{EntityId, is_valid_identifier};
pub use row::Row;
pub use value::Value;
