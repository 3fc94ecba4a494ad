//! Persist analysis: classifying the reachable graph into operation groups.
//!
//! Starting from the roots of a [`PersistRequest`], the analyser walks
//! references and to-many relations and places every entity it reaches in
//! one of four groups:
//!
//! - **create**: new entities, referenced entities first
//! - **update**: existing entities that may have changed
//! - **delete**: removed owned entities, children before their parent
//! - **depends-on**: entities whose lock must be current but which are not written
//!
//! A single visited set is shared by all four walks, so the first
//! classification an entity receives is the one it keeps. Only request roots
//! are exempt: each root drops any earlier classification before it is
//! analysed according to its request list.
//!
//! The walk runs in internal mode. The only queries it issues are the
//! batched presence lookup for unresolved entities, database foreign keys of
//! owned references, owners of updated lock-less entities, children removed
//! from fetched to-many relations, and forced loads needed to cascade deletes. Entities these queries bring into
//! the context are reported by [`PersistAnalyser::loaded_during_analysis`].

use crate::context::EntityContext;
use crate::entity::{DbPresence, Entity};
use crate::group::OperationGroup;
use crate::node::Node;
use crate::request::PersistRequest;
use entigraph_core::{EntityId, Error, NodeKind, Relation, Result, Row, RowQuery, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Write as _;

/// The four operation groups of a persist attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistGroups {
    pub create: OperationGroup,
    pub update: OperationGroup,
    pub delete: OperationGroup,
    pub depends_on: OperationGroup,
}

impl PersistGroups {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty()
            && self.update.is_empty()
            && self.delete.is_empty()
            && self.depends_on.is_empty()
    }

    /// Drop `id` from every group.
    pub fn remove(&mut self, id: EntityId) {
        self.create.remove(id);
        self.update.remove(id);
        self.delete.remove(id);
        self.depends_on.remove(id);
    }

    /// Batch-friendly copies of the groups.
    #[must_use]
    pub fn optimized(&self, ctx: &EntityContext) -> Self {
        Self {
            create: self.create.optimized_for_insert(ctx),
            update: self.update.optimized_for_update(ctx),
            delete: self.delete.optimized_for_delete(ctx),
            depends_on: self.depends_on.optimized_for_update(ctx),
        }
    }
}

/// Classifies the entities reachable from a request.
#[derive(Debug, Clone, Default)]
pub struct PersistAnalyser {
    groups: PersistGroups,
    analysing: HashSet<EntityId>,
    loaded_during_analysis: BTreeSet<EntityId>,
    /// Database row of an entity, for foreign keys of owned references.
    db_rows: HashMap<EntityId, Option<Row>>,
    /// Children present in the database but missing from a fetched to-many.
    removed_children: HashMap<(EntityId, String), Vec<EntityId>>,
}

impl PersistAnalyser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn groups(&self) -> &PersistGroups {
        &self.groups
    }

    pub fn into_groups(self) -> PersistGroups {
        self.groups
    }

    pub fn create_group(&self) -> &OperationGroup {
        &self.groups.create
    }

    pub fn update_group(&self) -> &OperationGroup {
        &self.groups.update
    }

    pub fn delete_group(&self) -> &OperationGroup {
        &self.groups.delete
    }

    pub fn depends_on_group(&self) -> &OperationGroup {
        &self.groups.depends_on
    }

    /// Entities brought into the context only to plan the request.
    pub fn loaded_during_analysis(&self) -> &BTreeSet<EntityId> {
        &self.loaded_during_analysis
    }

    /// Batch-friendly orderings of the groups.
    pub fn optimized(&self, ctx: &EntityContext) -> PersistGroups {
        self.groups.optimized(ctx)
    }

    /// Analyse a request against `ctx`, adding to the groups.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn analyse(&mut self, ctx: &mut EntityContext, request: &PersistRequest) -> Result<()> {
        for root in request.roots() {
            if !ctx.contains(root) {
                return Err(Error::illegal_state(format!(
                    "entity {} does not belong to the context being persisted",
                    root
                )));
            }
        }
        let result = ctx.with_internal_mode(|ctx| self.analyse_roots(ctx, request));
        self.analysing.clear();
        result?;
        tracing::debug!(
            create = self.groups.create.len(),
            update = self.groups.update.len(),
            delete = self.groups.delete.len(),
            depends_on = self.groups.depends_on.len(),
            loaded = self.loaded_during_analysis.len(),
            "Analysed persist request"
        );
        Ok(())
    }

    fn analyse_roots(&mut self, ctx: &mut EntityContext, request: &PersistRequest) -> Result<()> {
        self.resolve_presence(ctx, request)?;

        for id in &request.to_insert {
            self.remove_analysis(*id);
            self.analyse_create(ctx, *id)?;
        }
        for id in &request.to_update {
            self.remove_analysis(*id);
            self.analyse_update(ctx, *id)?;
        }
        for id in &request.to_save {
            let entity = ctx.entity(*id)?;
            match entity.presence() {
                DbPresence::Unknown => {
                    return Err(Error::illegal_state(format!(
                        "cannot save {}: database presence is unknown",
                        entity
                    )));
                }
                DbPresence::ClearlyNew => {
                    self.remove_analysis(*id);
                    self.analyse_create(ctx, *id)?;
                }
                DbPresence::ConfirmedInDb => {
                    self.remove_analysis(*id);
                    self.analyse_update(ctx, *id)?;
                }
            }
        }
        for id in &request.to_delete {
            self.remove_analysis(*id);
            self.analyse_delete(ctx, *id)?;
        }
        Ok(())
    }

    /// Forget any classification of `id`.
    pub fn remove_analysis(&mut self, id: EntityId) {
        self.groups.remove(id);
        self.analysing.remove(&id);
    }

    /// Resolve every unknown presence reachable from the roots with one
    /// lookup per entity type.
    fn resolve_presence(&mut self, ctx: &mut EntityContext, request: &PersistRequest) -> Result<()> {
        let mut seen = HashSet::new();
        let mut stack: Vec<EntityId> = request.roots().collect();
        let mut unknown = Vec::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let entity = ctx.entity(id)?;
            if entity.is_unclear_if_in_db() {
                unknown.push(id);
            }
            for node in entity.nodes() {
                match node {
                    Node::Ref(r) => stack.extend(r.reference()),
                    Node::ToMany(t) => stack.extend(t.list().iter().copied()),
                    Node::Value(_) => {}
                }
            }
        }
        if !unknown.is_empty() {
            tracing::debug!(count = unknown.len(), "Resolving database presence");
            ctx.fetch_all(&unknown)?;
        }
        Ok(())
    }

    // ========================================================================
    // Classification
    // ========================================================================

    fn analyse_create(&mut self, ctx: &mut EntityContext, id: EntityId) -> Result<()> {
        if !self.analysing.insert(id) {
            return Ok(());
        }
        self.analyse_ref_nodes(ctx, id, true)?;
        self.groups.create.add(id);
        tracing::trace!(entity = %id, "Create");

        for (_, list, _) in to_many_nodes(ctx, id)? {
            for child in list {
                if ctx.entity(child)?.is_clearly_not_in_db() {
                    self.analyse_create(ctx, child)?;
                } else {
                    tracing::warn!(
                        parent = %id,
                        child = %child,
                        "New entity holds a child that is already in the database"
                    );
                    self.analyse_update(ctx, child)?;
                }
            }
        }
        Ok(())
    }

    fn analyse_ref_nodes(
        &mut self,
        ctx: &mut EntityContext,
        id: EntityId,
        update_owned: bool,
    ) -> Result<()> {
        for (_, relation, target) in ref_nodes(ctx, id)? {
            let Some(target) = target else {
                continue;
            };
            let referenced = ctx.entity(target)?;
            if referenced.is_clearly_not_in_db() {
                self.analyse_create(ctx, target)?;
            } else if referenced.is_fetch_required() {
                continue;
            } else if update_owned && relation.is_owns() {
                self.analyse_update(ctx, target)?;
            } else if relation.is_owns() || relation.is_depends_on() {
                self.analyse_depends_on(ctx, target)?;
            }
        }
        Ok(())
    }

    fn analyse_update(&mut self, ctx: &mut EntityContext, id: EntityId) -> Result<()> {
        if !self.analysing.insert(id) {
            return Ok(());
        }
        self.analyse_ref_nodes(ctx, id, true)?;
        self.groups.update.add(id);
        tracing::trace!(entity = %id, "Update");

        if !ctx.entity(id)?.entity_type().supports_optimistic_lock() {
            self.load_reference_owners(ctx, id)?;
            for owner in ctx.owners(id)? {
                let entity = ctx.entity(owner)?;
                if entity.is_clearly_not_in_db() {
                    continue;
                }
                if entity.is_fetch_required() {
                    ctx.fetch(owner)?;
                    self.loaded_during_analysis.insert(owner);
                }
                self.analyse_update(ctx, owner)?;
            }
        }

        self.analyse_superseded_refs(ctx, id)?;

        for (name, list, (relation, fetched)) in to_many_nodes(ctx, id)? {
            for child in &list {
                let entity = ctx.entity(*child)?;
                if entity.is_clearly_not_in_db() {
                    self.analyse_create(ctx, *child)?;
                } else if entity.is_fetch_required() {
                    continue;
                } else if relation.is_owns() {
                    self.analyse_update(ctx, *child)?;
                } else if relation.is_depends_on() {
                    self.analyse_depends_on(ctx, *child)?;
                }
            }
            if !fetched {
                continue;
            }
            for removed in self.removed_children(ctx, id, &name)? {
                if ctx.entity(removed)?.is_clearly_not_in_db() {
                    tracing::error!(parent = %id, child = %removed, "Removed child is new");
                    continue;
                }
                match relation {
                    Relation::Owns => self.analyse_delete(ctx, removed)?,
                    _ if detached(ctx, id, &name, removed)? => self.analyse_update(ctx, removed)?,
                    Relation::DependsOn => self.analyse_depends_on(ctx, removed)?,
                    Relation::Refers => {
                        tracing::debug!(parent = %id, child = %removed, node = %name, "Removed child left in place");
                    }
                }
            }
        }
        Ok(())
    }

    fn analyse_delete(&mut self, ctx: &mut EntityContext, id: EntityId) -> Result<()> {
        if !self.analysing.insert(id) {
            return Ok(());
        }
        let entity = ctx.entity(id)?;
        if entity.is_clearly_not_in_db() {
            tracing::warn!(entity = %entity, "Skipping delete of an entity that is not in the database");
            return Ok(());
        }
        if entity.is_fetch_required() {
            ctx.fetch(id)?;
            self.loaded_during_analysis.insert(id);
        }

        for (name, _, (relation, fetched)) in to_many_nodes(ctx, id)? {
            if !relation.is_owns() {
                continue;
            }
            let list = if fetched {
                ctx.entity(id)?.to_many(&name)?.list().to_vec()
            } else {
                let (list, added) = ctx.fetch_to_many_tracked(id, &name)?;
                self.loaded_during_analysis.extend(added);
                list
            };
            for child in list {
                if !ctx.entity(child)?.is_clearly_not_in_db() {
                    self.analyse_delete(ctx, child)?;
                }
            }
            for removed in self.removed_children(ctx, id, &name)? {
                self.analyse_delete(ctx, removed)?;
            }
        }

        self.groups.delete.add(id);
        tracing::trace!(entity = %id, "Delete");

        for (_, relation, target) in ref_nodes(ctx, id)? {
            let Some(target) = target else {
                continue;
            };
            if !relation.is_owns() {
                continue;
            }
            if ctx.entity(target)?.is_fetch_required() {
                ctx.fetch(target)?;
                self.loaded_during_analysis.insert(target);
            }
            self.analyse_delete(ctx, target)?;
        }
        self.analyse_superseded_refs(ctx, id)?;
        Ok(())
    }

    fn analyse_depends_on(&mut self, ctx: &mut EntityContext, id: EntityId) -> Result<()> {
        if !self.analysing.insert(id) {
            return Ok(());
        }
        self.analyse_ref_nodes(ctx, id, false)?;
        self.groups.depends_on.add(id);
        tracing::trace!(entity = %id, "Depends on");

        for (name, list, (relation, fetched)) in to_many_nodes(ctx, id)? {
            if !fetched || !(relation.is_owns() || relation.is_depends_on()) {
                continue;
            }
            for child in list {
                let entity = ctx.entity(child)?;
                if !entity.is_clearly_not_in_db() && !entity.is_fetch_required() {
                    self.analyse_depends_on(ctx, child)?;
                }
            }
            for removed in self.removed_children(ctx, id, &name)? {
                self.analyse_depends_on(ctx, removed)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Database lookups
    // ========================================================================

    /// Delete the entities owned references pointed at in the database but no longer do.
    fn analyse_superseded_refs(&mut self, ctx: &mut EntityContext, id: EntityId) -> Result<()> {
        let entity = ctx.entity(id)?;
        if entity.presence() != DbPresence::ConfirmedInDb || entity.key().is_none() {
            return Ok(());
        }
        let ty = std::sync::Arc::clone(entity.entity_type());
        let owned: Vec<(String, String)> = ty
            .ref_nodes()
            .filter_map(|n| match &n.kind {
                NodeKind::Ref {
                    target,
                    relation: Relation::Owns,
                } => Some((n.name.clone(), target.clone())),
                _ => None,
            })
            .collect();
        if owned.is_empty() {
            return Ok(());
        }

        let Some(row) = self.db_row(ctx, id)? else {
            return Ok(());
        };
        for (node, target_type) in owned {
            let reference = ctx.entity(id)?.ref_node(&node)?;
            if !reference.is_loaded() {
                continue;
            }
            let current = match reference.reference() {
                Some(target) => ctx.entity(target)?.key().cloned().unwrap_or(Value::Null),
                None => Value::Null,
            };
            let stored = row.get_by_name(&node).cloned().unwrap_or(Value::Null);
            if stored.is_null() || stored == current {
                continue;
            }
            let Some(old) = self.get_or_load_for_analysis(ctx, &target_type, &stored)? else {
                continue;
            };
            let still_owned = ctx.owners(old)?.iter().any(|o| *o != id);
            if still_owned {
                tracing::debug!(entity = %id, node = %node, previous = %old, "Owned reference moved");
                continue;
            }
            tracing::debug!(entity = %id, node = %node, previous = %old, "Owned reference replaced");
            self.analyse_delete(ctx, old)?;
        }
        Ok(())
    }

    /// Load the entities owning `id` through an owning reference, for every
    /// such reference node the context holds no referrer for.
    fn load_reference_owners(&mut self, ctx: &mut EntityContext, id: EntityId) -> Result<()> {
        let entity = ctx.entity(id)?;
        if entity.presence() != DbPresence::ConfirmedInDb {
            return Ok(());
        }
        let Some(key) = entity.key().cloned() else {
            return Ok(());
        };
        let child_type = entity.type_name().to_string();
        let child_type = child_type.as_str();
        let held: HashSet<(String, String)> = ctx
            .referrers(id)
            .into_iter()
            .filter_map(|r| {
                ctx.get_by_id(r.holder)
                    .map(|holder| (holder.type_name().to_string(), r.node))
            })
            .collect();
        let owning: Vec<(String, String)> = ctx
            .environment()
            .definitions()
            .iter()
            .flat_map(|ty| {
                ty.ref_nodes()
                    .filter(move |n| {
                        matches!(
                            &n.kind,
                            NodeKind::Ref { target, relation: Relation::Owns } if target.as_str() == child_type
                        )
                    })
                    .map(move |n| (ty.name().to_string(), n.name.clone()))
            })
            .filter(|pair| !held.contains(pair))
            .collect();

        for (owner_type, node) in owning {
            let placeholders: HashSet<EntityId> = ctx
                .entities_of_type(&owner_type)
                .into_iter()
                .filter(|o| ctx.get_by_id(*o).is_some_and(Entity::is_fetch_required))
                .collect();
            let query = RowQuery::new(owner_type.as_str()).equals(node.as_str(), key.clone());
            for (owner, created) in ctx.perform_query_tracked(&query)? {
                if created || placeholders.contains(&owner) {
                    tracing::trace!(entity = %id, owner = %owner, node = %node, "Loaded owner");
                    self.loaded_during_analysis.insert(owner);
                }
            }
        }
        Ok(())
    }

    fn db_row(&mut self, ctx: &EntityContext, id: EntityId) -> Result<Option<Row>> {
        if let Some(row) = self.db_rows.get(&id) {
            return Ok(row.clone());
        }
        let entity = ctx.entity(id)?;
        let Some(key) = entity.key() else {
            return Ok(None);
        };
        let query =
            RowQuery::new(entity.type_name()).equals(entity.entity_type().key_node(), key.clone());
        let row = ctx.with_connection(|c| c.query(&query))?.into_iter().next();
        self.db_rows.insert(id, row.clone());
        Ok(row)
    }

    /// The entity with this key, loading it if needed. `None` when it has no row.
    fn get_or_load_for_analysis(
        &mut self,
        ctx: &mut EntityContext,
        entity_type: &str,
        key: &Value,
    ) -> Result<Option<EntityId>> {
        if let Some(id) = ctx.find(entity_type, key) {
            if ctx.entity(id)?.is_fetch_required() {
                if ctx.fetch_all(&[id])?.is_empty() {
                    return Ok(None);
                }
                self.loaded_during_analysis.insert(id);
            }
            return Ok(Some(id));
        }
        let ty = ctx.environment().entity_type(entity_type)?.clone();
        let query = RowQuery::new(entity_type).equals(ty.key_node(), key.clone());
        let loaded = ctx.perform_query_tracked(&query)?;
        for (id, created) in &loaded {
            if *created {
                self.loaded_during_analysis.insert(*id);
            }
        }
        Ok(loaded.first().map(|(id, _)| *id))
    }

    /// Children stored in the database under `parent` that the fetched list no
    /// longer holds, excluding children whose reference moved to another parent.
    /// A child whose reference was cleared counts as removed.
    fn removed_children(
        &mut self,
        ctx: &mut EntityContext,
        parent: EntityId,
        node: &str,
    ) -> Result<Vec<EntityId>> {
        let cache_key = (parent, node.to_string());
        if let Some(ids) = self.removed_children.get(&cache_key) {
            return Ok(ids.clone());
        }
        let entity = ctx.entity(parent)?;
        let Some(parent_key) = entity.key().cloned() else {
            return Ok(Vec::new());
        };
        if entity.presence() != DbPresence::ConfirmedInDb {
            return Ok(Vec::new());
        }
        let NodeKind::ToMany {
            target,
            foreign_node,
            ..
        } = entity.entity_type().require_node(node)?.kind.clone()
        else {
            return Ok(Vec::new());
        };
        let current: Vec<Value> = entity
            .to_many(node)?
            .list()
            .iter()
            .filter_map(|c| ctx.get_by_id(*c).and_then(|e| e.key().cloned()))
            .collect();
        let child_key = ctx.environment().entity_type(&target)?.key_node().to_string();
        let query = RowQuery::new(target.as_str())
            .equals(foreign_node.as_str(), parent_key)
            .not_in(child_key, current);

        let mut removed = Vec::new();
        for (child, created) in ctx.perform_query_tracked(&query)? {
            if created {
                self.loaded_during_analysis.insert(child);
            }
            let foreign = ctx.entity(child)?.ref_node(&foreign_node)?;
            if foreign.is_loaded() && foreign.reference().is_some_and(|other| other != parent) {
                tracing::debug!(parent = %parent, child = %child, "Child moved to another parent");
                continue;
            }
            removed.push(child);
        }
        self.removed_children.insert(cache_key, removed.clone());
        Ok(removed)
    }

    // ========================================================================
    // Reporting
    // ========================================================================

    /// Human-readable rendering of the four groups.
    pub fn report(&self, ctx: &EntityContext) -> String {
        let mut out = String::new();
        for (label, group) in [
            ("create", &self.groups.create),
            ("update", &self.groups.update),
            ("delete", &self.groups.delete),
            ("depends-on", &self.groups.depends_on),
        ] {
            let _ = writeln!(out, "{} ({}):", label, group.len());
            for id in group {
                match ctx.get_by_id(id) {
                    Some(entity) => {
                        let _ = writeln!(out, "  {}", entity);
                    }
                    None => {
                        let _ = writeln!(out, "  {} (not in context)", id);
                    }
                }
            }
        }
        if !self.loaded_during_analysis.is_empty() {
            let _ = writeln!(
                out,
                "loaded during analysis: {}",
                self.loaded_during_analysis.len()
            );
        }
        out
    }
}

/// Whether `child` had its reference back to `parent` through `node` cleared.
fn detached(ctx: &EntityContext, parent: EntityId, node: &str, child: EntityId) -> Result<bool> {
    let NodeKind::ToMany { foreign_node, .. } =
        &ctx.entity(parent)?.entity_type().require_node(node)?.kind
    else {
        return Ok(false);
    };
    let foreign = ctx.entity(child)?.ref_node(foreign_node)?;
    Ok(foreign.is_loaded() && foreign.reference().is_none())
}

/// `(node, relation, reference)` for every loaded reference node.
fn ref_nodes(ctx: &EntityContext, id: EntityId) -> Result<Vec<(String, Relation, Option<EntityId>)>> {
    let entity = ctx.entity(id)?;
    Ok(entity
        .entity_type()
        .nodes()
        .iter()
        .zip(entity.nodes())
        .filter_map(|(nt, node)| match (&nt.kind, node) {
            (NodeKind::Ref { relation, .. }, Node::Ref(r)) if r.is_loaded() => {
                Some((nt.name.clone(), *relation, r.reference()))
            }
            _ => None,
        })
        .collect())
}

/// `(node, members, (relation, fetched))` for every to-many node.
fn to_many_nodes(
    ctx: &EntityContext,
    id: EntityId,
) -> Result<Vec<(String, Vec<EntityId>, (Relation, bool))>> {
    let entity = ctx.entity(id)?;
    Ok(entity
        .entity_type()
        .nodes()
        .iter()
        .zip(entity.nodes())
        .filter_map(|(nt, node)| match (&nt.kind, node) {
            (NodeKind::ToMany { relation, .. }, Node::ToMany(t)) => Some((
                nt.name.clone(),
                t.list().to_vec(),
                (*relation, t.is_fetched()),
            )),
            _ => None,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityConstraint;
    use crate::test_support::database_and_environment;
    use entigraph_core::PersistErrorKind;

    fn seed_order(db: &entigraph_memory::MemoryDatabase) {
        db.seed("Customer", [("id", Value::BigInt(1)), ("name", Value::from("Ada"))])
            .unwrap();
        db.seed(
            "Order",
            [
                ("id", Value::BigInt(10)),
                ("status", Value::from("open")),
                ("customer", Value::BigInt(1)),
            ],
        )
        .unwrap();
        for line in [100, 101] {
            db.seed(
                "OrderLine",
                [("id", Value::BigInt(line)), ("order", Value::BigInt(10))],
            )
            .unwrap();
        }
    }

    #[test]
    fn test_new_graph_is_created_refs_first() {
        let (_db, env) = database_and_environment();
        let mut ctx = EntityContext::new(&env);
        let customer = ctx.create("Customer").unwrap();
        let order = ctx.create("Order").unwrap();
        ctx.set_reference(order, "customer", Some(customer)).unwrap();
        let line = ctx.create("OrderLine").unwrap();
        ctx.add_to_many(order, "lines", line).unwrap();

        let mut analyser = PersistAnalyser::new();
        analyser
            .analyse(&mut ctx, &PersistRequest::new().save(order))
            .unwrap();
        assert_eq!(analyser.create_group().ids(), &[customer, order, line]);
        assert!(analyser.update_group().is_empty());
        assert!(analyser.report(&ctx).contains("create (3)"));
    }

    #[test]
    fn test_unknown_presence_resolved_in_one_lookup() {
        let (db, env) = database_and_environment();
        seed_order(&db);
        let mut ctx = EntityContext::new(&env);
        let existing = ctx
            .new_entity("Customer", Some(Value::BigInt(1)), EntityConstraint::none())
            .unwrap();
        let fresh = ctx
            .new_entity("Customer", Some(Value::BigInt(2)), EntityConstraint::none())
            .unwrap();

        let mut analyser = PersistAnalyser::new();
        let request = PersistRequest::new().save(existing).save(fresh);
        analyser.analyse(&mut ctx, &request).unwrap();
        assert_eq!(db.query_count(), 1);
        assert_eq!(analyser.update_group().ids(), &[existing]);
        assert_eq!(analyser.create_group().ids(), &[fresh]);
    }

    #[test]
    fn test_root_from_another_context_is_illegal() {
        let (_db, env) = database_and_environment();
        let mut other = EntityContext::new(&env);
        let foreign = other.create("Customer").unwrap();
        let mut ctx = EntityContext::new(&env);
        let err = PersistAnalyser::new()
            .analyse(&mut ctx, &PersistRequest::new().update(foreign))
            .unwrap_err();
        assert_eq!(err.persist_kind(), Some(PersistErrorKind::IllegalState));
    }

    #[test]
    fn test_removed_owned_child_is_deleted() {
        let (db, env) = database_and_environment();
        seed_order(&db);
        let mut ctx = EntityContext::new(&env);
        let order = ctx.load("Order", &Value::BigInt(10)).unwrap().unwrap();
        let lines = ctx.to_many(order, "lines").unwrap();
        ctx.remove_from_many(order, "lines", lines[0]).unwrap();

        let mut analyser = PersistAnalyser::new();
        analyser
            .analyse(&mut ctx, &PersistRequest::new().update(order))
            .unwrap();
        assert_eq!(analyser.delete_group().ids(), &[lines[0]]);
        assert!(analyser.update_group().contains(lines[1]));
        // the customer placeholder was never loaded, so it is not classified
        assert!(analyser.depends_on_group().is_empty());
    }

    #[test]
    fn test_detached_owned_child_is_deleted() {
        let (db, env) = database_and_environment();
        seed_order(&db);
        let mut ctx = EntityContext::new(&env);
        let order = ctx.load("Order", &Value::BigInt(10)).unwrap().unwrap();
        let lines = ctx.to_many(order, "lines").unwrap();
        ctx.set_reference(lines[0], "order", None).unwrap();

        let mut analyser = PersistAnalyser::new();
        analyser
            .analyse(&mut ctx, &PersistRequest::new().update(order))
            .unwrap();
        assert_eq!(analyser.delete_group().ids(), &[lines[0]]);
        assert!(!analyser.update_group().contains(lines[0]));
    }

    #[test]
    fn test_stored_child_of_new_parent_is_updated() {
        let (db, env) = database_and_environment();
        seed_order(&db);
        let mut ctx = EntityContext::new(&env);
        let line = ctx.load("OrderLine", &Value::BigInt(100)).unwrap().unwrap();
        let order = ctx.create("Order").unwrap();
        ctx.add_to_many(order, "lines", line).unwrap();

        let mut analyser = PersistAnalyser::new();
        analyser
            .analyse(&mut ctx, &PersistRequest::new().save(order))
            .unwrap();
        assert_eq!(analyser.create_group().ids(), &[order]);
        assert!(analyser.update_group().contains(line));
    }

    #[test]
    fn test_moved_child_is_not_deleted() {
        let (db, env) = database_and_environment();
        seed_order(&db);
        db.seed("Order", [("id", Value::BigInt(11))]).unwrap();
        let mut ctx = EntityContext::new(&env);
        let order = ctx.load("Order", &Value::BigInt(10)).unwrap().unwrap();
        let other = ctx.load("Order", &Value::BigInt(11)).unwrap().unwrap();
        let lines = ctx.to_many(order, "lines").unwrap();
        ctx.to_many(other, "lines").unwrap();
        ctx.set_reference(lines[0], "order", Some(other)).unwrap();

        let mut analyser = PersistAnalyser::new();
        analyser
            .analyse(&mut ctx, &PersistRequest::new().update(order).update(other))
            .unwrap();
        assert!(analyser.delete_group().is_empty());
        assert!(analyser.update_group().contains(lines[0]));
    }

    #[test]
    fn test_delete_fetches_owned_children_for_analysis() {
        let (db, env) = database_and_environment();
        seed_order(&db);
        let mut ctx = EntityContext::new(&env);
        let order = ctx.load("Order", &Value::BigInt(10)).unwrap().unwrap();

        let mut analyser = PersistAnalyser::new();
        analyser
            .analyse(&mut ctx, &PersistRequest::new().delete(order))
            .unwrap();
        let deleted = analyser.delete_group().ids();
        assert_eq!(deleted.len(), 3);
        assert_eq!(deleted[2], order);
        assert_eq!(analyser.loaded_during_analysis().len(), 2);
        // the depended-on customer is never deleted
        let customer = ctx.find("Customer", &Value::BigInt(1)).unwrap();
        assert!(!analyser.delete_group().contains(customer));
    }

    #[test]
    fn test_first_classification_wins() {
        let (db, env) = database_and_environment();
        seed_order(&db);
        db.seed(
            "Invoice",
            [("id", Value::BigInt(50)), ("billed_to", Value::BigInt(1))],
        )
        .unwrap();
        let mut ctx = EntityContext::new(&env);
        let order = ctx.load("Order", &Value::BigInt(10)).unwrap().unwrap();
        let invoice = ctx.load("Invoice", &Value::BigInt(50)).unwrap().unwrap();
        let customer = ctx.find("Customer", &Value::BigInt(1)).unwrap();
        ctx.fetch(customer).unwrap();

        let mut analyser = PersistAnalyser::new();
        analyser
            .analyse(
                &mut ctx,
                &PersistRequest::new().update(order).update(invoice),
            )
            .unwrap();
        assert!(analyser.depends_on_group().contains(customer));
        assert!(!analyser.update_group().contains(customer));
    }

    #[test]
    fn test_root_overrides_earlier_classification() {
        let (db, env) = database_and_environment();
        seed_order(&db);
        let mut ctx = EntityContext::new(&env);
        let order = ctx.load("Order", &Value::BigInt(10)).unwrap().unwrap();
        let customer = ctx.find("Customer", &Value::BigInt(1)).unwrap();
        ctx.fetch(customer).unwrap();

        let mut analyser = PersistAnalyser::new();
        analyser
            .analyse(
                &mut ctx,
                &PersistRequest::new().update(order).update(customer),
            )
            .unwrap();
        assert!(analyser.update_group().contains(customer));
        assert!(!analyser.depends_on_group().contains(customer));
    }
}
