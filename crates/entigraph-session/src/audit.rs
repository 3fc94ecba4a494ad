//! Change auditing and optimistic-lock propagation.
//!
//! [`diff_entity`] is the single source of truth for "did it change": its
//! records are written to the audit log and also decide which update-group
//! entities are written at all.

use crate::analyser::PersistGroups;
use crate::context::{EntityContext, to_many_parts};
use crate::entity::Entity;
use crate::node::Node;
use crate::snapshot::DatabaseSnapshot;
use entigraph_core::{
    AuditRecord, EntityId, Error, NodeKind, PersistError, PersistErrorKind, Relation, Result, Row,
    Value, WriteKind,
};
use std::collections::{HashMap, HashSet};

/// Diff an entity for one kind of write.
///
/// - insert: every non-null column, key included, as a change from NULL
/// - update: every loaded column that differs from `row`
/// - delete: every non-null column of `row` (or of the entity) to NULL
///
/// The optimistic-lock node is never part of the diff.
pub fn diff_entity(
    ctx: &EntityContext,
    entity: &Entity,
    kind: WriteKind,
    row: Option<&Row>,
) -> Result<AuditRecord> {
    let ty = entity.entity_type();
    let mut record = AuditRecord::new(ty.name(), entity.key().cloned().unwrap_or(Value::Null));
    let lock = ty.lock_node();
    for node in ty.column_nodes() {
        let name = node.name.as_str();
        if Some(name) == lock {
            continue;
        }
        let current = current_column(ctx, entity, name)?;
        match kind {
            WriteKind::Insert => {
                if let Some(value) = current.filter(|v| !v.is_null()) {
                    record.add_change(name, Value::Null, value)?;
                }
            }
            WriteKind::Update => {
                if name == ty.key_node() {
                    continue;
                }
                let (Some(current), Some(row)) = (current, row) else {
                    continue;
                };
                let stored = row.get_by_name(name).cloned().unwrap_or(Value::Null);
                if stored != current {
                    record.add_change(name, stored, current)?;
                }
            }
            WriteKind::Delete => {
                let old = match row {
                    Some(row) => row.get_by_name(name).cloned(),
                    None => current,
                };
                if let Some(old) = old.filter(|v| !v.is_null()) {
                    record.add_change(name, old, Value::Null)?;
                }
            }
        }
    }
    Ok(record)
}

/// Column value as it would be written: the scalar, or the key of the
/// referenced entity. `None` when the node is not loaded.
pub(crate) fn current_column(
    ctx: &EntityContext,
    entity: &Entity,
    node: &str,
) -> Result<Option<Value>> {
    match entity.node(node)? {
        Node::Value(v) => Ok(v.value().as_value().cloned()),
        Node::Ref(r) if r.is_loaded() => match r.reference() {
            Some(target) => Ok(Some(ctx.entity(target)?.key().cloned().unwrap_or(Value::Null))),
            None => Ok(Some(Value::Null)),
        },
        _ => Ok(None),
    }
}

/// Audit records of one persist attempt, by entity.
#[derive(Debug, Clone, Default)]
pub struct AuditTrail {
    records: HashMap<EntityId, AuditRecord>,
    order: Vec<EntityId>,
}

impl AuditTrail {
    fn insert(&mut self, id: EntityId, record: AuditRecord) {
        if self.records.insert(id, record).is_none() {
            self.order.push(id);
        }
    }

    pub fn record(&self, id: EntityId) -> Option<&AuditRecord> {
        self.records.get(&id)
    }

    /// Records with at least one change, creates first, then updates, then deletes.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|r| !r.is_empty())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.values().filter(|r| !r.is_empty()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Runs the diff over the groups, filters the update group to the required
/// closure and stamps the lock change.
pub struct AuditEngine<'a> {
    ctx: &'a EntityContext,
    snapshot: &'a DatabaseSnapshot,
    trail: AuditTrail,
    delete: HashSet<EntityId>,
    required: HashSet<EntityId>,
    not_required: HashSet<EntityId>,
    visiting: HashSet<EntityId>,
    /// Times the walk reached an entity it was still visiting.
    cycle_hits: usize,
}

impl<'a> AuditEngine<'a> {
    pub fn new(ctx: &'a EntityContext, snapshot: &'a DatabaseSnapshot) -> Self {
        Self {
            ctx,
            snapshot,
            trail: AuditTrail::default(),
            delete: HashSet::new(),
            required: HashSet::new(),
            not_required: HashSet::new(),
            visiting: HashSet::new(),
            cycle_hits: 0,
        }
    }

    /// Audit the groups. Update-group entities that are not required are
    /// removed from `groups`; every remaining create or update entity with a
    /// lock node gets the change to `token`.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn run(mut self, groups: &mut PersistGroups, token: &Value) -> Result<AuditTrail> {
        let ctx = self.ctx;
        for id in &groups.create {
            let record = diff_entity(ctx, ctx.entity(id)?, WriteKind::Insert, None)?;
            self.trail.insert(id, record);
        }
        for id in &groups.update {
            let entity = ctx.entity(id)?;
            let row = self.snapshot.row_for(entity).ok_or_else(|| {
                Error::Persist(
                    PersistError::new(
                        PersistErrorKind::EntityMissing,
                        format!("{} has no database row to compare with", entity),
                    )
                    .with_entity(entity.snapshot()),
                )
            })?;
            let record = diff_entity(ctx, entity, WriteKind::Update, Some(row))?;
            self.trail.insert(id, record);
        }
        for id in &groups.delete {
            let entity = ctx.entity(id)?;
            let record = diff_entity(
                ctx,
                entity,
                WriteKind::Delete,
                self.snapshot.row_for(entity),
            )?;
            self.trail.insert(id, record);
            self.delete.insert(id);
        }

        let before = groups.update.len();
        let mut keep = HashSet::new();
        for id in &groups.update {
            if self.is_required(id)? {
                keep.insert(id);
            }
        }
        groups.update.retain(|id| keep.contains(&id));
        if groups.update.len() < before {
            tracing::debug!(
                dropped = before - groups.update.len(),
                "Dropped unchanged entities from the update group"
            );
        }

        for id in groups.create.iter().chain(groups.update.iter()) {
            let entity = ctx.entity(id)?;
            let Some(lock) = entity.entity_type().lock_node() else {
                continue;
            };
            let old = entity.value_node(lock)?.loaded_value().or_null();
            let record = self.trail.records.entry(id).or_insert_with(|| {
                AuditRecord::new(entity.type_name(), entity.key().cloned().unwrap_or(Value::Null))
            });
            record.add_change(lock, old, token.clone())?;
            if !self.trail.order.contains(&id) {
                self.trail.order.push(id);
            }
        }
        Ok(self.trail)
    }

    fn has_changes(&self, id: EntityId) -> bool {
        self.trail.record(id).is_some_and(|r| !r.is_empty())
    }

    /// Whether `id` must be written: it changed itself, or it owns a loaded
    /// lock-less entity that must be written.
    fn is_required(&mut self, id: EntityId) -> Result<bool> {
        if self.required.contains(&id) {
            return Ok(true);
        }
        if self.not_required.contains(&id) {
            return Ok(false);
        }
        if !self.visiting.insert(id) {
            self.cycle_hits += 1;
            return Ok(false);
        }
        let hits = self.cycle_hits;
        let result = self.compute_required(id);
        self.visiting.remove(&id);
        let required = result?;
        if required {
            self.required.insert(id);
        } else if self.cycle_hits == hits {
            // negatives reached through a cycle are recomputed on the next visit
            self.not_required.insert(id);
        }
        Ok(required)
    }

    fn compute_required(&mut self, id: EntityId) -> Result<bool> {
        if self.has_changes(id) || self.delete.contains(&id) {
            return Ok(true);
        }
        let ctx = self.ctx;
        let entity = ctx.entity(id)?;
        for (node_type, node) in entity.entity_type().nodes().iter().zip(entity.nodes()) {
            match (&node_type.kind, node) {
                (
                    NodeKind::Ref {
                        relation: Relation::Owns,
                        ..
                    },
                    Node::Ref(r),
                ) if r.is_loaded() => {
                    let Some(target) = r.reference() else {
                        continue;
                    };
                    if self.propagates_from(target)? && self.is_required(target)? {
                        return Ok(true);
                    }
                }
                (
                    NodeKind::ToMany {
                        relation: Relation::Owns,
                        ..
                    },
                    Node::ToMany(list),
                ) => {
                    let (target, foreign_node) =
                        to_many_parts(entity.entity_type(), &node_type.name)?;
                    if ctx.entity_type(&target)?.supports_optimistic_lock() {
                        continue;
                    }
                    let mut children: Vec<EntityId> = if list.is_fetched() {
                        list.list().to_vec()
                    } else {
                        Vec::new()
                    };
                    for child in ctx.referring_children(id, &target, &foreign_node) {
                        if !children.contains(&child) {
                            children.push(child);
                        }
                    }
                    for child in self.deleted_children(entity, &target, &foreign_node) {
                        if !children.contains(&child) {
                            children.push(child);
                        }
                    }
                    for child in children {
                        if self.propagates_from(child)? && self.is_required(child)? {
                            return Ok(true);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(false)
    }

    /// Deleted entities whose stored `foreign_node` still points at `parent`.
    fn deleted_children(&self, parent: &Entity, child_type: &str, foreign_node: &str) -> Vec<EntityId> {
        let Some(parent_key) = parent.key() else {
            return Vec::new();
        };
        let mut children: Vec<EntityId> = self
            .delete
            .iter()
            .copied()
            .filter(|id| {
                self.ctx.get_by_id(*id).is_some_and(|child| {
                    child.type_name() == child_type
                        && self
                            .snapshot
                            .row_for(child)
                            .and_then(|row| row.get_by_name(foreign_node))
                            == Some(parent_key)
                })
            })
            .collect();
        children.sort_unstable();
        children
    }

    /// Owned entities propagate a change to their owner only when they were
    /// loaded and carry no lock of their own.
    fn propagates_from(&self, id: EntityId) -> Result<bool> {
        let entity = self.ctx.entity(id)?;
        Ok(!entity.is_clearly_not_in_db()
            && !entity.is_fetch_required()
            && !entity.entity_type().supports_optimistic_lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyser::PersistAnalyser;
    use crate::lock::next_lock_token;
    use crate::request::PersistRequest;
    use crate::test_support::database_and_environment;

    fn seed(db: &entigraph_memory::MemoryDatabase) {
        db.seed(
            "Customer",
            [
                ("id", Value::BigInt(1)),
                ("modified_at", Value::Timestamp(1)),
                ("name", Value::from("Ada")),
            ],
        )
        .unwrap();
        db.seed(
            "Order",
            [
                ("id", Value::BigInt(10)),
                ("modified_at", Value::Timestamp(1)),
                ("status", Value::from("open")),
                ("customer", Value::BigInt(1)),
            ],
        )
        .unwrap();
        db.seed(
            "OrderLine",
            [
                ("id", Value::BigInt(100)),
                ("order", Value::BigInt(10)),
                ("product", Value::from("tea")),
                ("qty", Value::BigInt(1)),
            ],
        )
        .unwrap();
    }

    fn audit(
        ctx: &mut EntityContext,
        request: &PersistRequest,
    ) -> (PersistGroups, AuditTrail) {
        let mut analyser = PersistAnalyser::new();
        analyser.analyse(ctx, request).unwrap();
        let mut groups = analyser.into_groups();
        let snapshot = DatabaseSnapshot::load(ctx, &groups).unwrap();
        let trail = AuditEngine::new(ctx, &snapshot)
            .run(&mut groups, &Value::Timestamp(99))
            .unwrap();
        (groups, trail)
    }

    #[test]
    fn test_create_diff_includes_key_and_references() {
        let (_db, env) = database_and_environment();
        let mut ctx = EntityContext::new(&env);
        let customer = ctx
            .new_entity(
                "Customer",
                Some(Value::BigInt(3)),
                crate::entity::EntityConstraint::none(),
            )
            .unwrap();
        ctx.set_value(customer, "name", "Lin").unwrap();
        let record =
            diff_entity(&ctx, ctx.entity(customer).unwrap(), WriteKind::Insert, None).unwrap();
        assert_eq!(record.len(), 2);
        assert_eq!(record.change_for("id").unwrap().new, Value::BigInt(3));
        assert!(record.change_for("modified_at").is_none());
    }

    #[test]
    fn test_unchanged_update_is_dropped() {
        let (db, env) = database_and_environment();
        seed(&db);
        let mut ctx = EntityContext::new(&env);
        let order = ctx.load("Order", &Value::BigInt(10)).unwrap().unwrap();
        ctx.to_many(order, "lines").unwrap();

        let (groups, trail) = audit(&mut ctx, &PersistRequest::new().save(order));
        assert!(groups.update.is_empty());
        assert!(trail.is_empty());
    }

    #[test]
    fn test_child_change_propagates_lock_to_owner() {
        let (db, env) = database_and_environment();
        seed(&db);
        let mut ctx = EntityContext::new(&env);
        let line = ctx.load("OrderLine", &Value::BigInt(100)).unwrap().unwrap();
        ctx.set_value(line, "qty", 4i64).unwrap();

        let (groups, trail) = audit(&mut ctx, &PersistRequest::new().save(line));
        let order = ctx.find("Order", &Value::BigInt(10)).unwrap();
        assert!(groups.update.contains(line));
        assert!(groups.update.contains(order));

        let order_record = trail.record(order).unwrap();
        assert_eq!(order_record.len(), 1);
        let lock = order_record.change_for("modified_at").unwrap();
        assert_eq!(lock.old, Value::Timestamp(1));
        assert_eq!(lock.new, Value::Timestamp(99));

        let line_record = trail.record(line).unwrap();
        assert_eq!(line_record.change_for("qty").unwrap().old, Value::BigInt(1));
        assert_eq!(line_record.change_for("qty").unwrap().new, Value::BigInt(4));
    }

    #[test]
    fn test_delete_diff_nulls_every_column() {
        let (db, env) = database_and_environment();
        seed(&db);
        let mut ctx = EntityContext::new(&env);
        let line = ctx.load("OrderLine", &Value::BigInt(100)).unwrap().unwrap();

        let (groups, trail) = audit(&mut ctx, &PersistRequest::new().delete(line));
        assert_eq!(groups.delete.ids(), &[line]);
        let record = trail.record(line).unwrap();
        assert_eq!(record.len(), 4);
        assert!(record.changes.iter().all(|c| c.new.is_null()));
    }

    #[test]
    fn test_owner_on_a_cycle_is_still_required() {
        use crate::environment::Environment;
        use entigraph_core::{Definitions, EntityType};
        use entigraph_memory::MemoryDatabase;
        use std::sync::Arc;

        let defs = Arc::new(
            Definitions::from_types([EntityType::builder("Part", "id")
                .value("label")
                .owns("left", "Part")
                .owns("right", "Part")
                .build()
                .unwrap()])
            .unwrap(),
        );
        let db = MemoryDatabase::new(Arc::clone(&defs));
        let env = Environment::new(defs, Arc::new(db.clone()), Arc::new(db.clone()));
        let rows = [
            (1, Value::BigInt(2), Value::BigInt(3)),
            (2, Value::BigInt(1), Value::Null),
            (3, Value::Null, Value::Null),
        ];
        for (id, left, right) in rows {
            db.seed(
                "Part",
                [("id", Value::BigInt(id)), ("left", left), ("right", right)],
            )
            .unwrap();
        }
        let mut ctx = EntityContext::new(&env);
        let top = ctx.load("Part", &Value::BigInt(1)).unwrap().unwrap();
        let looped = ctx.load("Part", &Value::BigInt(2)).unwrap().unwrap();
        let changed = ctx.load("Part", &Value::BigInt(3)).unwrap().unwrap();
        ctx.set_value(changed, "label", "new").unwrap();

        // `top` is judged first: its left branch loops back before its right branch changes
        let mut groups = PersistGroups::default();
        for id in [top, looped, changed] {
            groups.update.add(id);
        }
        let snapshot = DatabaseSnapshot::load(&ctx, &groups).unwrap();
        AuditEngine::new(&ctx, &snapshot)
            .run(&mut groups, &Value::Timestamp(99))
            .unwrap();
        assert!(groups.update.contains(top));
        assert!(groups.update.contains(looped));
        assert!(groups.update.contains(changed));
    }

    #[test]
    fn test_created_entity_gets_lock_token() {
        let (_db, env) = database_and_environment();
        let mut ctx = EntityContext::new(&env);
        let customer = ctx.create("Customer").unwrap();
        let token = next_lock_token();
        let mut groups = PersistGroups::default();
        groups.create.add(customer);
        let trail = AuditEngine::new(&ctx, &DatabaseSnapshot::new())
            .run(&mut groups, &token)
            .unwrap();
        let record = trail.record(customer).unwrap();
        assert_eq!(record.change_for("modified_at").unwrap().new, token);
        assert_eq!(trail.records().len(), 1);
    }
}
