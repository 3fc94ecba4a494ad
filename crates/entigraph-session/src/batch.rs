//! Write batches: building them from operation groups and classifying
//! the rows they reject.

use crate::audit::{AuditTrail, current_column};
use crate::context::EntityContext;
use crate::entity::Entity;
use crate::group::OperationGroup;
use crate::snapshot::row_snapshot;
use entigraph_core::{
    BatchFailure, Error, PersistError, PersistErrorKind, Result, RowQuery, Value, WriteBatch,
    WriteKind, WriteRow,
};

/// Build the batches for one group, one per contiguous run of the same
/// entity type, at most `max_batch_size` rows each.
///
/// Update rows carry only the columns the audit trail recorded as changed,
/// plus the new lock token. Rows with nothing to write are left out.
pub fn build_batches(
    ctx: &EntityContext,
    group: &OperationGroup,
    kind: WriteKind,
    trail: &AuditTrail,
    token: &Value,
    max_batch_size: usize,
) -> Result<Vec<WriteBatch>> {
    let max_batch_size = max_batch_size.max(1);
    let mut batches: Vec<WriteBatch> = Vec::new();
    for id in group {
        let entity = ctx.entity(id)?;
        let Some(row) = build_row(ctx, entity, kind, trail, token)? else {
            continue;
        };
        let extend = batches.last().is_some_and(|b| {
            b.entity_type == entity.type_name() && b.rows.len() < max_batch_size
        });
        if !extend {
            batches.push(WriteBatch::new(kind, entity.entity_type()));
        }
        if let Some(batch) = batches.last_mut() {
            batch.rows.push(row);
        }
    }
    Ok(batches)
}

fn build_row(
    ctx: &EntityContext,
    entity: &Entity,
    kind: WriteKind,
    trail: &AuditTrail,
    token: &Value,
) -> Result<Option<WriteRow>> {
    let ty = entity.entity_type();
    let Some(key) = entity.key().cloned() else {
        return Err(Error::illegal_state(format!(
            "cannot {} {}: it has no key",
            kind, entity
        )));
    };
    let lock = ty.lock_node();
    let expected_lock = match lock {
        Some(lock) => Some(entity.value_node(lock)?.loaded_value().or_null()),
        None => None,
    };

    let mut values = Vec::new();
    match kind {
        WriteKind::Insert => {
            for node in ty.column_nodes() {
                if Some(node.name.as_str()) == lock {
                    continue;
                }
                let value = current_column(ctx, entity, &node.name)?.unwrap_or(Value::Null);
                values.push((node.name.clone(), value));
            }
            if let Some(lock) = lock {
                values.push((lock.to_string(), token.clone()));
            }
            return Ok(Some(WriteRow {
                entity: entity.id(),
                key,
                values,
                expected_lock: None,
            }));
        }
        WriteKind::Update => {
            if let Some(record) = trail.record(entity.id()) {
                values.extend(
                    record
                        .changes
                        .iter()
                        .filter(|c| Some(c.node.as_str()) != lock)
                        .map(|c| (c.node.clone(), c.new.clone())),
                );
            }
            if let Some(lock) = lock {
                values.push((lock.to_string(), token.clone()));
            }
            if values.is_empty() {
                tracing::trace!(entity = %entity, "Nothing to update");
                return Ok(None);
            }
        }
        WriteKind::Delete => {}
    }
    Ok(Some(WriteRow {
        entity: entity.id(),
        key,
        values,
        expected_lock,
    }))
}

/// Execute the batches in order, classifying the first rejected row.
#[tracing::instrument(level = "debug", skip_all, fields(batches = batches.len()))]
pub fn execute_batches(ctx: &EntityContext, batches: &[WriteBatch]) -> Result<usize> {
    let mut written = 0;
    for batch in batches {
        match ctx.with_connection(|c| Ok(c.execute_batch(batch)))? {
            Ok(count) => {
                tracing::trace!(
                    kind = %batch.kind,
                    entity_type = %batch.entity_type,
                    rows = count,
                    "Executed batch"
                );
                written += count;
            }
            Err(failure) => return Err(classify_failure(ctx, batch, failure)),
        }
    }
    Ok(written)
}

/// Turn a rejected batch row into a specific persist error with one lookup
/// of the row's key.
pub fn classify_failure(ctx: &EntityContext, batch: &WriteBatch, failure: BatchFailure) -> Error {
    let Some(row) = batch.rows.get(failure.row_index) else {
        return Error::Persist(
            PersistError::new(
                PersistErrorKind::WriteFailed,
                format!("{} batch on {} failed", batch.kind, batch.entity_type),
            )
            .with_source(failure.cause),
        );
    };
    let entity = ctx.get_by_id(row.entity);
    let describe = entity.map_or_else(
        || format!("{}[{}]", batch.entity_type, row.key),
        ToString::to_string,
    );
    let query = RowQuery::new(batch.entity_type.as_str()).equals(batch.key_node.as_str(), row.key.clone());
    let stored = match ctx.with_connection(|c| c.query(&query)) {
        Ok(rows) => rows.into_iter().next(),
        Err(e) => {
            tracing::warn!(entity = %describe, error = %e, "Could not classify write failure");
            return with_entity(
                PersistError::new(
                    PersistErrorKind::WriteFailed,
                    format!("could not {} {}", batch.kind, describe),
                ),
                entity,
            )
            .with_source(failure.cause)
            .into();
        }
    };

    let error = match (batch.kind, stored) {
        (WriteKind::Insert, Some(_)) => PersistError::new(
            PersistErrorKind::PrimaryKeyExists,
            format!("cannot insert {}: the key already exists", describe),
        ),
        (WriteKind::Update | WriteKind::Delete, None) => PersistError::new(
            PersistErrorKind::EntityMissing,
            format!("cannot {} {}: it no longer exists", batch.kind, describe),
        ),
        (WriteKind::Update | WriteKind::Delete, Some(stored)) => {
            let stored_lock = batch
                .lock_node
                .as_deref()
                .map(|lock| stored.get_by_name(lock).cloned().unwrap_or(Value::Null));
            let mismatch = match (&stored_lock, &row.expected_lock) {
                (Some(stored), Some(expected)) => stored != expected,
                _ => false,
            };
            match (mismatch, entity) {
                (true, Some(entity)) => PersistError::new(
                    PersistErrorKind::OptimisticLockMismatch,
                    format!("{} was modified concurrently", describe),
                )
                .with_database_entity(row_snapshot(entity.id(), entity.entity_type(), &stored)),
                (true, None) => PersistError::new(
                    PersistErrorKind::OptimisticLockMismatch,
                    format!("{} was modified concurrently", describe),
                ),
                (false, _) => PersistError::new(
                    PersistErrorKind::WriteFailed,
                    format!("could not {} {}", batch.kind, describe),
                ),
            }
        }
        (WriteKind::Insert, None) => PersistError::new(
            PersistErrorKind::WriteFailed,
            format!("could not insert {}", describe),
        ),
    };
    tracing::debug!(entity = %describe, kind = ?error.kind, "Classified write failure");
    with_entity(error, entity).with_source(failure.cause).into()
}

fn with_entity(error: PersistError, entity: Option<&Entity>) -> PersistError {
    match entity {
        Some(entity) => error.with_entity(entity.snapshot()),
        None => error,
    }
}
