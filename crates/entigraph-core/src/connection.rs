//! Database collaborator traits.
//!
//! The persistence core talks to storage through a narrow surface:
//!
//! - [`DataSource`] - opens connections
//! - [`Connection`] - row queries, write batches, audit rows and transaction control
//! - [`SequenceGenerator`] - assigns keys to newly created entities
//! - [`AccessControl`] - per-entity capability checks before any write
//!
//! All calls are blocking. A connection is owned by one unit of work at a time.

use crate::audit::AuditRecord;
use crate::definition::EntityType;
use crate::error::{Error, Result};
use crate::identifiers::EntityId;
use crate::row::Row;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Predicate applied to one node of a row.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOp {
    Equals(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowFilter {
    pub node: String,
    pub op: FilterOp,
}

impl RowFilter {
    /// Evaluate the filter against a row. A missing column never matches.
    pub fn matches(&self, row: &Row) -> bool {
        let Some(value) = row.get_by_name(&self.node) else {
            return false;
        };
        match &self.op {
            FilterOp::Equals(v) => value == v,
            FilterOp::In(vs) => vs.contains(value),
            FilterOp::NotIn(vs) => !vs.contains(value),
        }
    }
}

/// Select rows of one entity type matching every filter.
#[derive(Debug, Clone, PartialEq)]
pub struct RowQuery {
    pub entity_type: String,
    pub filters: Vec<RowFilter>,
}

impl RowQuery {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            filters: Vec::new(),
        }
    }

    #[must_use]
    pub fn equals(mut self, node: impl Into<String>, value: Value) -> Self {
        self.filters.push(RowFilter {
            node: node.into(),
            op: FilterOp::Equals(value),
        });
        self
    }

    #[must_use]
    pub fn in_list(mut self, node: impl Into<String>, values: Vec<Value>) -> Self {
        self.filters.push(RowFilter {
            node: node.into(),
            op: FilterOp::In(values),
        });
        self
    }

    #[must_use]
    pub fn not_in(mut self, node: impl Into<String>, values: Vec<Value>) -> Self {
        self.filters.push(RowFilter {
            node: node.into(),
            op: FilterOp::NotIn(values),
        });
        self
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }
}

impl fmt::Display for RowQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entity_type)?;
        for (i, filter) in self.filters.iter().enumerate() {
            f.write_str(if i == 0 { " where " } else { " and " })?;
            match &filter.op {
                FilterOp::Equals(v) => write!(f, "{} = {}", filter.node, v)?,
                FilterOp::In(vs) => write!(f, "{} in ({} values)", filter.node, vs.len())?,
                FilterOp::NotIn(vs) => write!(f, "{} not in ({} values)", filter.node, vs.len())?,
            }
        }
        Ok(())
    }
}

/// Kind of write a batch performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WriteKind::Insert => "insert",
            WriteKind::Update => "update",
            WriteKind::Delete => "delete",
        })
    }
}

/// One row of a write batch.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRow {
    pub entity: EntityId,
    pub key: Value,
    /// Column values by node name (inserts and updates only).
    pub values: Vec<(String, Value)>,
    /// Lock token the database row must currently carry (updates and deletes).
    pub expected_lock: Option<Value>,
}

/// Rows of one entity type written with one statement shape.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteBatch {
    pub kind: WriteKind,
    pub entity_type: String,
    pub key_node: String,
    pub lock_node: Option<String>,
    pub rows: Vec<WriteRow>,
}

impl WriteBatch {
    pub fn new(kind: WriteKind, entity_type: &EntityType) -> Self {
        Self {
            kind,
            entity_type: entity_type.name().to_string(),
            key_node: entity_type.key_node().to_string(),
            lock_node: entity_type.lock_node().map(str::to_string),
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A batch row was rejected; rows before `row_index` were applied.
#[derive(Debug)]
pub struct BatchFailure {
    pub row_index: usize,
    pub cause: Error,
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch row {} failed: {}", self.row_index, self.cause)
    }
}

impl std::error::Error for BatchFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

/// A live database connection.
pub trait Connection {
    /// Run a row query and return the matching rows.
    fn query(&mut self, query: &RowQuery) -> Result<Vec<Row>>;

    /// Execute a write batch, returning the number of affected rows.
    ///
    /// A row that cannot be written (key collision, no matching row, lock
    /// token mismatch, constraint failure) stops the batch and is reported
    /// by index.
    fn execute_batch(&mut self, batch: &WriteBatch) -> std::result::Result<usize, BatchFailure>;

    /// Persist audit records.
    fn write_audit(&mut self, records: &[AuditRecord]) -> Result<()>;

    fn begin(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    fn in_transaction(&self) -> bool;
}

/// Source of database connections.
pub trait DataSource: Send + Sync {
    fn open(&self) -> Result<Box<dyn Connection>>;
}

/// Assigns keys to entities about to be created.
pub trait SequenceGenerator: Send + Sync {
    fn next_key(&self, entity_type: &EntityType) -> Result<Value>;
}

/// Operation checked by [`AccessControl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        })
    }
}

/// Per-entity capability check invoked after planning and before execution.
pub trait AccessControl: Send + Sync {
    fn verify(&self, operation: Operation, entity_type: &EntityType, key: &Value) -> Result<()>;
}

/// Access control that permits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn verify(&self, _operation: Operation, _entity_type: &EntityType, _key: &Value) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_query_filters() {
        let row = Row::from_pairs([
            ("id", Value::BigInt(3)),
            ("order", Value::BigInt(1)),
        ]);
        let q = RowQuery::new("OrderLine")
            .equals("order", Value::BigInt(1))
            .not_in("id", vec![Value::BigInt(1), Value::BigInt(2)]);
        assert!(q.matches(&row));

        let q = RowQuery::new("OrderLine").in_list("id", vec![Value::BigInt(1)]);
        assert!(!q.matches(&row));

        let q = RowQuery::new("OrderLine").equals("missing", Value::Null);
        assert!(!q.matches(&row));
    }

    #[test]
    fn test_row_query_display() {
        let q = RowQuery::new("OrderLine")
            .equals("order", Value::BigInt(1))
            .not_in("id", vec![Value::BigInt(1)]);
        assert_eq!(
            q.to_string(),
            "OrderLine where order = 1 and id not in (1 values)"
        );
    }

    #[test]
    fn test_batch_failure_source() {
        let failure = BatchFailure {
            row_index: 2,
            cause: Error::Custom("boom".to_string()),
        };
        assert_eq!(failure.to_string(), "batch row 2 failed: boom");
        assert!(std::error::Error::source(&failure).is_some());
    }
}
