//! In-memory storage driver for entigraph.
//!
//! `MemoryDatabase` keeps one table of rows per entity type behind a shared
//! `Arc<Mutex<_>>`, so every connection opened from it sees the same data.
//! Transactions work on a private copy of the tables which replaces the
//! shared state on commit and is discarded on rollback.
//!
//! Write batches are applied row by row. A row that collides with an
//! existing key on insert, or matches no row (or a row with another lock
//! token) on update and delete, stops the batch with a [`BatchFailure`]
//! carrying its index.
//!
//! The driver also records a write log, collects audit records, hands out
//! sequential keys and can be told to fail a specific write, which makes it
//! the backend of choice for tests.

use entigraph_core::{
    AuditRecord, BatchFailure, Connection, ConnectionError, ConnectionErrorKind, DataSource,
    Definitions, EntityType, Error, QueryError, QueryErrorKind, Result, Row, RowQuery,
    SequenceGenerator, Value, WriteBatch, WriteKind, WriteRow,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Record = BTreeMap<String, Value>;
type Tables = BTreeMap<String, Vec<Record>>;

/// One row written by a committed batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteLogEntry {
    pub kind: WriteKind,
    pub entity_type: String,
    pub key: Value,
}

#[derive(Debug, Clone, PartialEq)]
struct InjectedFailure {
    kind: WriteKind,
    entity_type: String,
    key: Value,
}

#[derive(Debug, Default)]
struct State {
    tables: Tables,
    audit: Vec<AuditRecord>,
    log: Vec<WriteLogEntry>,
    failures: Vec<InjectedFailure>,
    fail_commit: bool,
    sequences: HashMap<String, i64>,
    queries: usize,
    commits: usize,
    rollbacks: usize,
}

impl State {
    /// Take a matching injected failure, if any.
    fn take_failure(&mut self, kind: WriteKind, entity_type: &str, key: &Value) -> bool {
        let position = self
            .failures
            .iter()
            .position(|f| f.kind == kind && f.entity_type == entity_type && &f.key == key);
        position.map(|i| self.failures.remove(i)).is_some()
    }
}

/// Shared in-memory database.
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    definitions: Arc<Definitions>,
    state: Arc<Mutex<State>>,
}

impl MemoryDatabase {
    pub fn new(definitions: Arc<Definitions>) -> Self {
        Self {
            definitions,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entity_type(&self, name: &str) -> Result<&Arc<EntityType>> {
        self.definitions.get(name)
    }

    /// Insert a committed row directly, bypassing transactions and the log.
    ///
    /// Column nodes missing from `values` are stored as NULL.
    pub fn seed<'a>(
        &self,
        entity_type: &str,
        values: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> Result<()> {
        let ty = self.entity_type(entity_type)?;
        let mut record = empty_record(ty);
        for (node, value) in values {
            record.insert(node.to_string(), value);
        }
        let key = record.get(ty.key_node()).cloned().unwrap_or(Value::Null);
        let mut state = self.lock();
        let table = state.tables.entry(ty.name().to_string()).or_default();
        if find_row(table, ty.key_node(), &key).is_some() {
            return Err(duplicate_key(ty.name(), &key));
        }
        table.push(record);
        Ok(())
    }

    /// Committed row of the given key.
    pub fn row(&self, entity_type: &str, key: &Value) -> Option<Row> {
        let ty = self.entity_type(entity_type).ok()?;
        let state = self.lock();
        let table = state.tables.get(entity_type)?;
        find_row(table, ty.key_node(), key).map(|i| to_row(&table[i]))
    }

    /// All committed rows of a type, in insertion order.
    pub fn rows(&self, entity_type: &str) -> Vec<Row> {
        self.lock()
            .tables
            .get(entity_type)
            .map(|t| t.iter().map(to_row).collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self, entity_type: &str) -> usize {
        self.lock().tables.get(entity_type).map_or(0, Vec::len)
    }

    /// Overwrite one committed value, as a concurrent writer would.
    pub fn set_value(&self, entity_type: &str, key: &Value, node: &str, value: Value) -> Result<()> {
        let ty = self.entity_type(entity_type)?;
        let mut state = self.lock();
        let table = state.tables.entry(ty.name().to_string()).or_default();
        let index = find_row(table, ty.key_node(), key).ok_or_else(|| missing_row(ty.name(), key))?;
        table[index].insert(node.to_string(), value);
        Ok(())
    }

    /// Delete one committed row, as a concurrent writer would.
    pub fn remove_row(&self, entity_type: &str, key: &Value) -> bool {
        let Ok(ty) = self.entity_type(entity_type) else {
            return false;
        };
        let mut state = self.lock();
        let Some(table) = state.tables.get_mut(entity_type) else {
            return false;
        };
        match find_row(table, ty.key_node(), key) {
            Some(index) => {
                table.remove(index);
                true
            }
            None => false,
        }
    }

    /// Make the next write of this kind to this row fail.
    pub fn fail_on(&self, kind: WriteKind, entity_type: &str, key: Value) {
        self.lock().failures.push(InjectedFailure {
            kind,
            entity_type: entity_type.to_string(),
            key,
        });
    }

    /// Make the next commit fail, leaving its transaction open.
    pub fn fail_next_commit(&self) {
        self.lock().fail_commit = true;
    }

    /// Rows written by committed batches, in execution order.
    pub fn write_log(&self) -> Vec<WriteLogEntry> {
        self.lock().log.clone()
    }

    pub fn clear_write_log(&self) {
        self.lock().log.clear();
    }

    /// Committed audit records.
    pub fn audit_records(&self) -> Vec<AuditRecord> {
        self.lock().audit.clone()
    }

    /// Number of row queries served.
    pub fn query_count(&self) -> usize {
        self.lock().queries
    }

    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    pub fn rollback_count(&self) -> usize {
        self.lock().rollbacks
    }

    /// Committed tables as pretty-printed JSON, for debugging.
    pub fn dump_json(&self) -> Result<String> {
        let state = self.lock();
        Ok(serde_json::to_string_pretty(&state.tables)?)
    }
}

impl DataSource for MemoryDatabase {
    fn open(&self) -> Result<Box<dyn Connection>> {
        tracing::trace!("Opening in-memory connection");
        Ok(Box::new(MemoryConnection {
            database: self.clone(),
            transaction: None,
        }))
    }
}

impl SequenceGenerator for MemoryDatabase {
    fn next_key(&self, entity_type: &EntityType) -> Result<Value> {
        let mut state = self.lock();
        let highest = state
            .tables
            .get(entity_type.name())
            .into_iter()
            .flatten()
            .filter_map(|r| r.get(entity_type.key_node()).and_then(Value::as_i64))
            .max()
            .unwrap_or(0);
        let counter = state
            .sequences
            .entry(entity_type.name().to_string())
            .or_insert(0);
        *counter = (*counter).max(highest) + 1;
        Ok(Value::BigInt(*counter))
    }
}

// ============================================================================
// Connection
// ============================================================================

#[derive(Debug, Default)]
struct Transaction {
    tables: Tables,
    audit: Vec<AuditRecord>,
    log: Vec<WriteLogEntry>,
}

/// A connection to a [`MemoryDatabase`].
#[derive(Debug)]
pub struct MemoryConnection {
    database: MemoryDatabase,
    transaction: Option<Transaction>,
}

impl MemoryConnection {
    /// Apply `f` to the tables this connection currently sees.
    fn write<T>(&mut self, f: impl FnOnce(&mut Tables, &mut Vec<WriteLogEntry>, &mut State) -> T) -> T {
        let mut state = self.database.lock();
        match &mut self.transaction {
            Some(tx) => f(&mut tx.tables, &mut tx.log, &mut *state),
            None => {
                let mut tables = std::mem::take(&mut state.tables);
                let mut log = std::mem::take(&mut state.log);
                let result = f(&mut tables, &mut log, &mut *state);
                state.tables = tables;
                state.log = log;
                result
            }
        }
    }
}

impl Connection for MemoryConnection {
    fn query(&mut self, query: &RowQuery) -> Result<Vec<Row>> {
        self.database.entity_type(&query.entity_type)?;
        let mut state = self.database.lock();
        state.queries += 1;
        let tables = match &self.transaction {
            Some(tx) => &tx.tables,
            None => &state.tables,
        };
        let rows: Vec<Row> = tables
            .get(&query.entity_type)
            .into_iter()
            .flatten()
            .map(to_row)
            .filter(|row| query.matches(row))
            .collect();
        tracing::trace!(query = %query, rows = rows.len(), "Memory query");
        Ok(rows)
    }

    fn execute_batch(&mut self, batch: &WriteBatch) -> std::result::Result<usize, BatchFailure> {
        let ty = match self.database.entity_type(&batch.entity_type) {
            Ok(ty) => Arc::clone(ty),
            Err(cause) => return Err(BatchFailure { row_index: 0, cause }),
        };
        self.write(|tables, log, state| {
            let table = tables.entry(batch.entity_type.clone()).or_default();
            for (index, row) in batch.rows.iter().enumerate() {
                let applied = if state.take_failure(batch.kind, &batch.entity_type, &row.key) {
                    Err(Error::Query(QueryError {
                        kind: QueryErrorKind::Database,
                        entity_type: Some(batch.entity_type.clone()),
                        message: format!("injected {} failure for key {}", batch.kind, row.key),
                        source: None,
                    }))
                } else {
                    apply_row(table, &ty, batch, row)
                };
                if let Err(cause) = applied {
                    tracing::debug!(
                        kind = %batch.kind,
                        entity_type = %batch.entity_type,
                        row_index = index,
                        "Memory batch row failed"
                    );
                    return Err(BatchFailure {
                        row_index: index,
                        cause,
                    });
                }
                log.push(WriteLogEntry {
                    kind: batch.kind,
                    entity_type: batch.entity_type.clone(),
                    key: row.key.clone(),
                });
            }
            Ok(batch.rows.len())
        })
    }

    fn write_audit(&mut self, records: &[AuditRecord]) -> Result<()> {
        match &mut self.transaction {
            Some(tx) => tx.audit.extend_from_slice(records),
            None => self.database.lock().audit.extend_from_slice(records),
        }
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        if self.transaction.is_some() {
            return Err(transaction_error("transaction already active"));
        }
        let tables = self.database.lock().tables.clone();
        self.transaction = Some(Transaction {
            tables,
            ..Transaction::default()
        });
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.transaction.is_none() {
            return Err(transaction_error("no transaction to commit"));
        }
        let mut state = self.database.lock();
        if std::mem::take(&mut state.fail_commit) {
            return Err(transaction_error("commit rejected"));
        }
        let tx = self
            .transaction
            .take()
            .ok_or_else(|| transaction_error("no transaction to commit"))?;
        state.tables = tx.tables;
        state.audit.extend(tx.audit);
        state.log.extend(tx.log);
        state.commits += 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.transaction
            .take()
            .ok_or_else(|| transaction_error("no transaction to roll back"))?;
        self.database.lock().rollbacks += 1;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }
}

// ============================================================================
// Row helpers
// ============================================================================

fn empty_record(ty: &EntityType) -> Record {
    ty.column_nodes()
        .map(|n| (n.name.clone(), Value::Null))
        .collect()
}

fn to_row(record: &Record) -> Row {
    Row::from_pairs(record.iter().map(|(k, v)| (k.clone(), v.clone())))
}

fn find_row(table: &[Record], key_node: &str, key: &Value) -> Option<usize> {
    table.iter().position(|r| r.get(key_node) == Some(key))
}

fn apply_row(table: &mut Vec<Record>, ty: &EntityType, batch: &WriteBatch, row: &WriteRow) -> Result<()> {
    let existing = find_row(table, &batch.key_node, &row.key);
    match batch.kind {
        WriteKind::Insert => {
            if existing.is_some() {
                return Err(duplicate_key(&batch.entity_type, &row.key));
            }
            let mut record = empty_record(ty);
            for (node, value) in &row.values {
                record.insert(node.clone(), value.clone());
            }
            record.insert(batch.key_node.clone(), row.key.clone());
            table.push(record);
        }
        WriteKind::Update => {
            let index = existing.ok_or_else(|| stale(&batch.entity_type, &row.key, "no row"))?;
            check_lock(&table[index], batch, row)?;
            for (node, value) in &row.values {
                table[index].insert(node.clone(), value.clone());
            }
        }
        WriteKind::Delete => {
            let index = existing.ok_or_else(|| stale(&batch.entity_type, &row.key, "no row"))?;
            check_lock(&table[index], batch, row)?;
            table.remove(index);
        }
    }
    Ok(())
}

fn check_lock(record: &Record, batch: &WriteBatch, row: &WriteRow) -> Result<()> {
    let (Some(lock_node), Some(expected)) = (&batch.lock_node, &row.expected_lock) else {
        return Ok(());
    };
    let current = record.get(lock_node).unwrap_or(&Value::Null);
    if current == expected {
        Ok(())
    } else {
        Err(stale(&batch.entity_type, &row.key, "lock token changed"))
    }
}

fn duplicate_key(entity_type: &str, key: &Value) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Constraint,
        entity_type: Some(entity_type.to_string()),
        message: format!("duplicate key {} in {}", key, entity_type),
        source: None,
    })
}

fn stale(entity_type: &str, key: &Value, reason: &str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Stale,
        entity_type: Some(entity_type.to_string()),
        message: format!("{}[{}]: {}", entity_type, key, reason),
        source: None,
    })
}

fn missing_row(entity_type: &str, key: &Value) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::NotFound,
        entity_type: Some(entity_type.to_string()),
        message: format!("{}[{}] does not exist", entity_type, key),
        source: None,
    })
}

fn transaction_error(message: &str) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Transaction,
        message: message.to_string(),
        source: None,
    })
}
