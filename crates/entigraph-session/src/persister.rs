//! Transactional persistence of an entity graph.
//!
//! A persist attempt never works on the caller's context directly. The
//! context is deep-copied into a working context joined to the same
//! transaction slot; analysis, key assignment and post-commit bookkeeping
//! all happen there, and only after the transaction committed are the
//! written entities merged back by id. On any failure the caller's graph is
//! exactly what it was before.

use crate::analyser::{PersistAnalyser, PersistGroups};
use crate::audit::{AuditEngine, AuditTrail};
use crate::batch::{build_batches, execute_batches};
use crate::context::EntityContext;
use crate::entity::{DbPresence, EntityState};
use crate::environment::PersistConfig;
use crate::lock::next_lock_token;
use crate::node::Node;
use crate::request::PersistRequest;
use crate::snapshot::DatabaseSnapshot;
use entigraph_core::{
    AuditRecord, EntityId, Error, Operation, PersistError, PersistErrorKind, Result, Value,
    WriteBatch, WriteKind,
};
use std::collections::BTreeSet;

/// What a successful persist attempt wrote.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistSummary {
    /// Inserted entities, in write order.
    pub created: Vec<EntityId>,
    /// Updated entities, in write order.
    pub updated: Vec<EntityId>,
    /// Deleted entities, in write order.
    pub deleted: Vec<EntityId>,
    /// Entities validated but not written.
    pub depends_on: Vec<EntityId>,
    pub audit: Vec<AuditRecord>,
    /// The lock token stamped on every written entity with a lock node.
    pub lock_token: Option<Value>,
}

impl PersistSummary {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Total number of entities written.
    pub fn total(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}

/// Batches of one persist attempt, in execution order.
#[derive(Debug, Default)]
struct WritePlan {
    inserts: Vec<WriteBatch>,
    updates: Vec<WriteBatch>,
    deletes: Vec<WriteBatch>,
}

/// Outcome of the transactional part of a persist attempt.
struct Executed {
    groups: PersistGroups,
    trail: AuditTrail,
    token: Value,
    loaded_during_analysis: BTreeSet<EntityId>,
}

/// Persists requests against one caller context.
pub struct Persister<'c> {
    ctx: &'c mut EntityContext,
}

impl<'c> Persister<'c> {
    pub fn new(ctx: &'c mut EntityContext) -> Self {
        Self { ctx }
    }

    /// Persist a request.
    ///
    /// Without an active transaction in the caller's context, one is begun
    /// and committed here. A transaction the caller holds is used as is: it
    /// is left open on success and rolled back and released on failure.
    #[tracing::instrument(level = "info", skip_all)]
    pub fn persist(&mut self, request: &PersistRequest) -> Result<PersistSummary> {
        if request.is_empty() {
            return Ok(PersistSummary::default());
        }
        let start = std::time::Instant::now();
        let config = self.ctx.environment().config().clone();
        let mut working = self.ctx.deep_copy();
        let owns_transaction = !working.in_transaction();
        if owns_transaction {
            working.begin_transaction()?;
        }

        let executed = match execute(&mut working, request, &config) {
            Ok(executed) => executed,
            Err(e) => {
                self.abort(&mut working, owns_transaction);
                return Err(self.rewrite_error(e));
            }
        };
        if owns_transaction {
            if let Err(e) = working.commit() {
                tracing::warn!(error = %e, "Commit failed");
                self.abort(&mut working, owns_transaction);
                return Err(self.rewrite_error(e));
            }
        }

        apply_committed(&mut working, &executed)?;
        let written: Vec<EntityId> = executed
            .groups
            .create
            .iter()
            .chain(executed.groups.update.iter())
            .filter(|id| !executed.loaded_during_analysis.contains(id))
            .collect();
        let deleted = executed.groups.delete.ids().to_vec();
        self.ctx.apply_changes(&working, &written, &deleted)?;
        if config.reclaim_after_persist {
            let reclaimed = self.ctx.reclaim();
            tracing::debug!(reclaimed, "Reclaimed placeholders");
        }

        let summary = PersistSummary {
            created: executed.groups.create.ids().to_vec(),
            updated: executed.groups.update.ids().to_vec(),
            deleted,
            depends_on: executed.groups.depends_on.ids().to_vec(),
            audit: executed.trail.records(),
            lock_token: Some(executed.token),
        };
        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            created = summary.created.len(),
            updated = summary.updated.len(),
            deleted = summary.deleted.len(),
            depends_on = summary.depends_on.len(),
            "Persist complete"
        );
        Ok(summary)
    }

    /// Audit records the request would produce, without writing anything.
    ///
    /// Entities to be created are diffed without keys, since no keys are
    /// assigned.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn compare_with_database(&mut self, request: &PersistRequest) -> Result<Vec<AuditRecord>> {
        if request.is_empty() {
            return Ok(Vec::new());
        }
        let config = self.ctx.environment().config().clone();
        let mut working = self.ctx.deep_copy();
        let mut analyser = PersistAnalyser::new();
        analyser
            .analyse(&mut working, request)
            .map_err(|e| self.rewrite_error(e))?;
        let mut groups = analyser.into_groups();
        let snapshot = DatabaseSnapshot::load(&working, &groups)?;
        snapshot
            .validate(&working, &groups, config.validate_depends_on)
            .map_err(|e| self.rewrite_error(e))?;
        let trail = AuditEngine::new(&working, &snapshot).run(&mut groups, &next_lock_token())?;
        Ok(trail.records())
    }

    fn abort(&mut self, working: &mut EntityContext, owns_transaction: bool) {
        let result = if owns_transaction {
            working.rollback()
        } else {
            self.ctx.rollback()
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "Rollback failed");
        }
    }

    /// Point the entity of an optimistic-lock failure at the caller's entity.
    fn rewrite_error(&self, error: Error) -> Error {
        match error {
            Error::Persist(mut p) if p.kind == PersistErrorKind::OptimisticLockMismatch => {
                if let Some(entity) = p
                    .entity
                    .as_ref()
                    .and_then(|snapshot| self.ctx.get_by_id(snapshot.id))
                {
                    p.entity = Some(entity.snapshot());
                }
                Error::Persist(p)
            }
            other => other,
        }
    }
}

/// Everything between analysis and the last write, on the working context.
fn execute(
    working: &mut EntityContext,
    request: &PersistRequest,
    config: &PersistConfig,
) -> Result<Executed> {
    let mut analyser = PersistAnalyser::new();
    analyser.analyse(working, request)?;
    tracing::trace!(plan = %analyser.report(working), "Persist plan");
    let loaded_during_analysis = analyser.loaded_during_analysis().clone();
    let mut groups = analyser.into_groups();

    let snapshot = DatabaseSnapshot::load(working, &groups)?;
    snapshot.validate(working, &groups, config.validate_depends_on)?;

    assign_keys(working, &groups)?;
    let token = next_lock_token();
    let trail = AuditEngine::new(working, &snapshot).run(&mut groups, &token)?;
    let groups = groups.optimized(working);
    verify_access(working, &groups)?;

    let plan = WritePlan {
        inserts: build_batches(
            working,
            &groups.create,
            WriteKind::Insert,
            &trail,
            &token,
            config.max_batch_size,
        )?,
        updates: build_batches(
            working,
            &groups.update,
            WriteKind::Update,
            &trail,
            &token,
            config.max_batch_size,
        )?,
        deletes: build_batches(
            working,
            &groups.delete,
            WriteKind::Delete,
            &trail,
            &token,
            config.max_batch_size,
        )?,
    };
    tracing::debug!(
        inserts = plan.inserts.len(),
        updates = plan.updates.len(),
        deletes = plan.deletes.len(),
        "Executing write plan"
    );
    execute_batches(working, &plan.inserts)?;
    execute_batches(working, &plan.updates)?;
    execute_batches(working, &plan.deletes)?;

    if config.audit {
        let records = trail.records();
        if !records.is_empty() {
            working.with_connection(|c| c.write_audit(&records))?;
            tracing::debug!(count = records.len(), "Wrote audit records");
        }
    }

    Ok(Executed {
        groups,
        trail,
        token,
        loaded_during_analysis,
    })
}

/// Give every keyless entity of the create group a key from the sequence generator.
fn assign_keys(working: &mut EntityContext, groups: &PersistGroups) -> Result<()> {
    for id in &groups.create {
        let entity = working.entity(id)?;
        if entity.key().is_some() {
            continue;
        }
        let key = working
            .environment()
            .sequences()
            .next_key(entity.entity_type())?;
        tracing::trace!(entity = %id, key = %key, "Assigned key");
        working.set_key(id, Some(key))?;
    }
    Ok(())
}

fn verify_access(working: &EntityContext, groups: &PersistGroups) -> Result<()> {
    let access = working.environment().access_control();
    for (operation, group) in [
        (Operation::Create, &groups.create),
        (Operation::Update, &groups.update),
        (Operation::Delete, &groups.delete),
    ] {
        for id in group {
            let entity = working.entity(id)?;
            let key = entity.key().cloned().unwrap_or(Value::Null);
            if let Err(e) = access.verify(operation, entity.entity_type(), &key) {
                if e.persist_kind() == Some(PersistErrorKind::AccessDenied) {
                    return Err(e);
                }
                return Err(Error::Persist(
                    PersistError::new(
                        PersistErrorKind::AccessDenied,
                        format!("{} of {} was denied", operation, entity),
                    )
                    .with_entity(entity.snapshot())
                    .with_source(e),
                ));
            }
        }
    }
    Ok(())
}

/// Bring the working context in line with the committed database state.
fn apply_committed(working: &mut EntityContext, executed: &Executed) -> Result<()> {
    let groups = &executed.groups;
    for id in groups.create.iter().chain(groups.update.iter()) {
        let entity = working.entity_mut(id)?;
        if let Some(lock) = entity.entity_type().lock_node().map(str::to_string) {
            entity.value_node_mut(&lock)?.set(executed.token.clone());
        }
    }

    let deleted = groups.delete.ids().to_vec();
    for id in &deleted {
        if working.contains(*id) {
            working.set_key(*id, None)?;
        }
    }
    working.remove_all(&deleted)?;

    for id in &groups.create {
        let entity = working.entity_mut(id)?;
        entity.set_state(EntityState::Loaded);
        entity.set_presence(DbPresence::ConfirmedInDb);
        for node in entity.nodes_mut() {
            if let Node::ToMany(list) = node {
                list.set_fetched(true);
            }
        }
        entity.refresh();
    }
    for id in &groups.update {
        working.entity_mut(id)?.refresh();
    }
    Ok(())
}

impl EntityContext {
    /// Persist a request against this context. See [`Persister::persist`].
    pub fn persist(&mut self, request: &PersistRequest) -> Result<PersistSummary> {
        Persister::new(self).persist(request)
    }

    /// Classify a request without writing anything.
    ///
    /// Analysis may load entities into this context to resolve presence or
    /// find removed children.
    pub fn analyse(&mut self, request: &PersistRequest) -> Result<PersistAnalyser> {
        let mut analyser = PersistAnalyser::new();
        analyser.analyse(self, request)?;
        Ok(analyser)
    }
}
