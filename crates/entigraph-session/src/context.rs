//! The entity context: identity map, reference index and unit of work.
//!
//! Entities live in an arena keyed by their stable [`EntityId`]; references
//! between entities are stored as ids and mirrored in a reverse index so the
//! context can answer "who points at this entity" without scanning.
//!
//! Removal follows the unload rule: an entity still referenced by a holder
//! that is not itself being removed is unloaded in place instead of being
//! dropped, so the holder keeps a valid (if stale) handle.

use crate::entity::{DbPresence, Entity, EntityConstraint, EntityState};
use crate::environment::Environment;
use crate::node::Node;
use crate::resources::Resources;
use entigraph_core::{
    ContextErrorKind, EntityId, EntityType, Error, NodeKind, Result, SchemaErrorKind, Value,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::{self, Write as _};
use std::sync::Arc;

/// Whether lazy loads may be triggered implicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContextMode {
    /// Caller-facing: dereferencing unloaded data loads it.
    #[default]
    User,
    /// Engine-internal: implicit loads are suppressed.
    Internal,
}

/// A reference node pointing at an entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefHolder {
    pub holder: EntityId,
    pub node: String,
}

/// Outcome of removing a single entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The entity and its index entries are gone.
    Removed,
    /// The entity is still referenced and was reset to an unloaded placeholder.
    Unloaded,
}

/// Identity map and reference graph of one unit of work.
#[derive(Clone)]
pub struct EntityContext {
    env: Environment,
    entities: BTreeMap<EntityId, Entity>,
    keys: HashMap<(String, u64), Vec<EntityId>>,
    referrers: HashMap<EntityId, BTreeSet<RefHolder>>,
    mode: ContextMode,
    pub(crate) resources: Resources,
}

impl EntityContext {
    /// Create an empty context in user mode.
    pub fn new(env: &Environment) -> Self {
        Self {
            env: env.clone(),
            entities: BTreeMap::new(),
            keys: HashMap::new(),
            referrers: HashMap::new(),
            mode: ContextMode::User,
            resources: Resources::new(),
        }
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn mode(&self) -> ContextMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ContextMode) {
        self.mode = mode;
    }

    /// Run `f` in internal mode, restoring the previous mode afterwards.
    pub(crate) fn with_internal_mode<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        let previous = std::mem::replace(&mut self.mode, ContextMode::Internal);
        let result = f(self);
        self.mode = previous;
        result
    }

    pub(crate) fn entity_type(&self, name: &str) -> Result<Arc<EntityType>> {
        self.env.entity_type(name).cloned()
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn get_by_id(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    /// Like [`get_by_id`](Self::get_by_id), failing for unknown ids.
    pub fn entity(&self, id: EntityId) -> Result<&Entity> {
        self.entities.get(&id).ok_or_else(|| unknown_entity(id))
    }

    pub(crate) fn entity_mut(&mut self, id: EntityId) -> Result<&mut Entity> {
        self.entities.get_mut(&id).ok_or_else(|| unknown_entity(id))
    }

    /// Find an entity by type and key.
    pub fn get(&self, entity_type: &str, key: &Value) -> Option<&Entity> {
        self.find(entity_type, key).and_then(|id| self.entities.get(&id))
    }

    /// Id of the entity with the given type and key.
    pub fn find(&self, entity_type: &str, key: &Value) -> Option<EntityId> {
        if key.is_null() {
            return None;
        }
        self.keys
            .get(&(entity_type.to_string(), key.key_hash()))?
            .iter()
            .copied()
            .find(|id| {
                self.entities
                    .get(id)
                    .is_some_and(|e| e.key() == Some(key))
            })
    }

    pub fn entities_of_type(&self, entity_type: &str) -> Vec<EntityId> {
        self.entities
            .values()
            .filter(|e| e.type_name() == entity_type)
            .map(Entity::id)
            .collect()
    }

    /// Reference nodes currently pointing at `id`.
    pub fn referrers(&self, id: EntityId) -> Vec<RefHolder> {
        self.referrers
            .get(&id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Create an entity and add it to the context.
    ///
    /// Without a key the entity is new. With a key its presence is unknown
    /// until resolved, unless the constraint says it must exist.
    pub fn new_entity(
        &mut self,
        entity_type: &str,
        key: Option<Value>,
        constraint: EntityConstraint,
    ) -> Result<EntityId> {
        let ty = self.entity_type(entity_type)?;
        let key = key.filter(|k| !k.is_null());
        let (state, presence) = match (&key, constraint.must_exist_in_db) {
            (None, _) => (EntityState::NotInDb, DbPresence::ClearlyNew),
            (Some(_), false) => (EntityState::NotLoaded, DbPresence::Unknown),
            (Some(_), true) => (EntityState::NotLoaded, DbPresence::ConfirmedInDb),
        };
        let entity = Entity::new(EntityId::next(), ty, key, state, presence, constraint);
        let id = entity.id();
        self.add(entity)?;
        Ok(id)
    }

    /// Create a brand-new entity without a key.
    pub fn create(&mut self, entity_type: &str) -> Result<EntityId> {
        self.new_entity(entity_type, None, EntityConstraint::none())
    }

    /// The entity with this key, or a new must-exist placeholder for it.
    pub(crate) fn placeholder(&mut self, entity_type: &str, key: Value) -> Result<EntityId> {
        if let Some(id) = self.find(entity_type, &key) {
            return Ok(id);
        }
        self.new_entity(entity_type, Some(key), EntityConstraint::must_exist_in_db())
    }

    /// Add an entity. Fails if its id or `(type, key)` is already taken.
    pub fn add(&mut self, entity: Entity) -> Result<()> {
        let id = entity.id();
        if self.entities.contains_key(&id) {
            return Err(Error::context(
                ContextErrorKind::DuplicateId,
                format!("entity {} is already in the context", id),
            ));
        }
        if let Some(key) = entity.key() {
            if let Some(existing) = self.find(entity.type_name(), key) {
                return Err(Error::context(
                    ContextErrorKind::DuplicateKey,
                    format!("{}[{}] is already held by {}", entity.type_name(), key, existing),
                ));
            }
        }
        let held: Vec<(String, EntityId)> = held_references(&entity);
        self.index_key(&entity);
        self.entities.insert(id, entity);
        for (node, target) in held {
            self.add_reference(id, &node, target);
        }
        Ok(())
    }

    /// Insert or overwrite an entity by id, keeping both indexes in step.
    pub(crate) fn replace_entity(&mut self, entity: Entity) -> Result<()> {
        let id = entity.id();
        if let Some(key) = entity.key() {
            if let Some(existing) = self.find(entity.type_name(), key) {
                if existing != id {
                    return Err(Error::context(
                        ContextErrorKind::DuplicateKey,
                        format!("{}[{}] is already held by {}", entity.type_name(), key, existing),
                    ));
                }
            }
        }
        if let Some(old) = self.entities.remove(&id) {
            self.unindex_key(&old);
            for (node, target) in held_references(&old) {
                self.remove_reference(id, &node, target);
            }
        }
        let held = held_references(&entity);
        self.index_key(&entity);
        self.entities.insert(id, entity);
        for (node, target) in held {
            self.add_reference(id, &node, target);
        }
        Ok(())
    }

    // ========================================================================
    // Index maintenance
    // ========================================================================

    fn key_slot(entity: &Entity) -> Option<(String, u64)> {
        entity
            .key()
            .map(|k| (entity.type_name().to_string(), k.key_hash()))
    }

    fn index_key(&mut self, entity: &Entity) {
        if let Some(slot) = Self::key_slot(entity) {
            let ids = self.keys.entry(slot).or_default();
            if !ids.contains(&entity.id()) {
                ids.push(entity.id());
            }
        }
    }

    fn unindex_key(&mut self, entity: &Entity) {
        if let Some(slot) = Self::key_slot(entity) {
            if let Some(ids) = self.keys.get_mut(&slot) {
                ids.retain(|id| *id != entity.id());
                if ids.is_empty() {
                    self.keys.remove(&slot);
                }
            }
        }
    }

    /// Record that `holder.node` points at `target`.
    pub fn add_reference(&mut self, holder: EntityId, node: &str, target: EntityId) {
        self.referrers.entry(target).or_default().insert(RefHolder {
            holder,
            node: node.to_string(),
        });
    }

    /// Forget that `holder.node` points at `target`.
    pub fn remove_reference(&mut self, holder: EntityId, node: &str, target: EntityId) {
        if let Some(set) = self.referrers.get_mut(&target) {
            set.remove(&RefHolder {
                holder,
                node: node.to_string(),
            });
            if set.is_empty() {
                self.referrers.remove(&target);
            }
        }
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Assign or clear the key of an entity.
    pub fn set_key(&mut self, id: EntityId, key: Option<Value>) -> Result<()> {
        let key = key.filter(|k| !k.is_null());
        let entity = self.entity(id)?;
        if entity.key() == key.as_ref() {
            return Ok(());
        }
        if let Some(k) = &key {
            if let Some(existing) = self.find(entity.type_name(), k) {
                return Err(Error::context(
                    ContextErrorKind::DuplicateKey,
                    format!("{}[{}] is already held by {}", entity.type_name(), k, existing),
                ));
            }
        }
        let old = entity.clone();
        self.unindex_key(&old);
        let entity = self.entity_mut(id)?;
        entity.set_key_raw(key);
        let updated = entity.clone();
        self.index_key(&updated);
        Ok(())
    }

    /// Set a scalar node. Setting the key node goes through [`set_key`](Self::set_key).
    pub fn set_value(&mut self, id: EntityId, node: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let entity = self.entity(id)?;
        if entity.entity_type().key_node() == node {
            return self.set_key(id, Some(value));
        }
        self.entity_mut(id)?.value_node_mut(node)?.set(value);
        Ok(())
    }

    /// Point a reference node at `target` (or clear it).
    ///
    /// Fetched to-many relations whose foreign node is this reference are
    /// kept in step on both the old and the new target.
    pub fn set_reference(
        &mut self,
        holder: EntityId,
        node: &str,
        target: Option<EntityId>,
    ) -> Result<()> {
        self.link_reference(holder, node, target, true)
    }

    pub(crate) fn link_reference(
        &mut self,
        holder: EntityId,
        node: &str,
        target: Option<EntityId>,
        sync_inverse: bool,
    ) -> Result<()> {
        let holder_type = Arc::clone(self.entity(holder)?.entity_type());
        let node_type = holder_type.require_node(node)?;
        let NodeKind::Ref {
            target: target_type,
            ..
        } = &node_type.kind
        else {
            return Err(Error::schema(
                SchemaErrorKind::WrongNodeKind,
                format!("{}.{} is not a reference node", holder_type.name(), node),
            ));
        };
        if let Some(t) = target {
            let found = self.entity(t)?.type_name();
            if found != target_type {
                return Err(Error::schema(
                    SchemaErrorKind::Invalid,
                    format!(
                        "{}.{} expects {}, got {}",
                        holder_type.name(),
                        node,
                        target_type,
                        found
                    ),
                ));
            }
        }
        let previous = self.entity_mut(holder)?.ref_node_mut(node)?.replace(target);
        if previous == target {
            return Ok(());
        }
        if let Some(old) = previous {
            self.remove_reference(holder, node, old);
        }
        if let Some(new) = target {
            self.add_reference(holder, node, new);
        }
        if sync_inverse {
            let target_ty = self.entity_type(target_type)?;
            let inverse = inverse_to_many(&target_ty, holder_type.name(), node);
            if let Some(list_node) = inverse {
                if let Some(old) = previous {
                    let list = self.entity_mut(old)?.to_many_mut(&list_node)?;
                    if list.is_fetched() {
                        list.remove(holder);
                    }
                }
                if let Some(new) = target {
                    let list = self.entity_mut(new)?.to_many_mut(&list_node)?;
                    if list.is_fetched() {
                        list.push(holder);
                    }
                }
            }
        }
        Ok(())
    }

    /// Append `child` to a to-many relation.
    ///
    /// A child whose foreign reference is still null is pointed at the parent.
    pub fn add_to_many(&mut self, parent: EntityId, node: &str, child: EntityId) -> Result<()> {
        let parent_type = Arc::clone(self.entity(parent)?.entity_type());
        let (target, foreign_node) = to_many_parts(&parent_type, node)?;
        let child_entity = self.entity(child)?;
        if child_entity.type_name() != target {
            return Err(Error::schema(
                SchemaErrorKind::Invalid,
                format!(
                    "{}.{} holds {}, got {}",
                    parent_type.name(),
                    node,
                    target,
                    child_entity.type_name()
                ),
            ));
        }
        let foreign = child_entity.ref_node(&foreign_node)?;
        let unset = foreign.reference().is_none();
        self.entity_mut(parent)?.to_many_mut(node)?.push(child);
        if unset {
            self.link_reference(child, &foreign_node, Some(parent), false)?;
        }
        Ok(())
    }

    /// Remove `child` from a to-many relation. The child's foreign reference is left as is.
    pub fn remove_from_many(&mut self, parent: EntityId, node: &str, child: EntityId) -> Result<bool> {
        Ok(self.entity_mut(parent)?.to_many_mut(node)?.remove(child))
    }

    // ========================================================================
    // Removal
    // ========================================================================

    /// Remove a single entity, applying the unload rule.
    pub fn remove(&mut self, id: EntityId) -> Result<Removal> {
        let outcome = self.remove_all(&[id])?;
        Ok(outcome.first().map_or(Removal::Removed, |(_, r)| *r))
    }

    /// Remove a set of entities together.
    ///
    /// An entity is dropped only when every reference to it is held by an
    /// entity of the same set; otherwise it is unloaded.
    pub fn remove_all(&mut self, ids: &[EntityId]) -> Result<Vec<(EntityId, Removal)>> {
        for id in ids {
            self.entity(*id)?;
        }
        let removing: HashSet<EntityId> = ids.iter().copied().collect();
        let plan: Vec<(EntityId, Removal)> = ids
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|id| {
                let pinned = self
                    .referrers
                    .get(&id)
                    .is_some_and(|set| set.iter().any(|r| !removing.contains(&r.holder)));
                (id, if pinned { Removal::Unloaded } else { Removal::Removed })
            })
            .collect();
        for (id, removal) in &plan {
            match removal {
                Removal::Unloaded => self.unload(*id)?,
                Removal::Removed => self.drop_entity(*id)?,
            }
        }
        tracing::trace!(
            requested = ids.len(),
            unloaded = plan.iter().filter(|(_, r)| *r == Removal::Unloaded).count(),
            "Removed entities"
        );
        Ok(plan)
    }

    /// Reset an entity to a placeholder carrying only its id and key.
    pub(crate) fn unload(&mut self, id: EntityId) -> Result<()> {
        let entity = self.entity_mut(id)?;
        let key_node = entity.entity_type().key_node().to_string();
        let names: Vec<String> = entity
            .entity_type()
            .nodes()
            .iter()
            .map(|n| n.name.clone())
            .collect();
        let mut released = Vec::new();
        for (name, node) in names.iter().zip(entity.nodes_mut()) {
            match node {
                Node::Value(v) if *name != key_node => v.unload(),
                Node::Value(_) => {}
                Node::Ref(r) => {
                    if let Some(target) = r.unload() {
                        released.push((name.clone(), target));
                    }
                }
                Node::ToMany(t) => t.unload(),
            }
        }
        entity.set_state(EntityState::NotLoaded);
        if entity.key().is_none() {
            entity.set_presence(DbPresence::ClearlyNew);
        }
        for (node, target) in released {
            self.remove_reference(id, &node, target);
        }
        Ok(())
    }

    fn drop_entity(&mut self, id: EntityId) -> Result<()> {
        let Some(entity) = self.entities.remove(&id) else {
            return Err(unknown_entity(id));
        };
        self.unindex_key(&entity);
        for (node, target) in held_references(&entity) {
            self.remove_reference(id, &node, target);
        }
        self.referrers.remove(&id);

        // list membership is not indexed, so visit every entity of a type
        // declaring a to-many of the dropped type
        let list_nodes: HashMap<String, Vec<usize>> = self
            .env
            .definitions()
            .iter()
            .filter_map(|ty| {
                let indexes: Vec<usize> = ty
                    .nodes()
                    .iter()
                    .enumerate()
                    .filter(|(_, n)| n.is_to_many() && n.target() == Some(entity.type_name()))
                    .map(|(i, _)| i)
                    .collect();
                (!indexes.is_empty()).then(|| (ty.name().to_string(), indexes))
            })
            .collect();
        for other in self.entities.values_mut() {
            let Some(indexes) = list_nodes.get(other.type_name()) else {
                continue;
            };
            let nodes = other.nodes_mut();
            for i in indexes {
                if let Some(Node::ToMany(list)) = nodes.get_mut(*i) {
                    list.remove(id);
                }
            }
        }
        Ok(())
    }

    /// Sweep unloaded placeholders nothing points at. Returns how many were dropped.
    pub fn reclaim(&mut self) -> usize {
        let listed: HashSet<EntityId> = self
            .entities
            .values()
            .flat_map(|e| e.nodes())
            .filter_map(|n| match n {
                Node::ToMany(list) => Some(list.list().iter().copied()),
                _ => None,
            })
            .flatten()
            .collect();
        let sweep: Vec<EntityId> = self
            .entities
            .values()
            .filter(|e| e.state() == EntityState::NotLoaded && e.constraint().must_exist_in_db)
            .filter(|e| !self.referrers.contains_key(&e.id()) && !listed.contains(&e.id()))
            .map(Entity::id)
            .collect();
        for id in &sweep {
            if let Some(entity) = self.entities.remove(id) {
                self.unindex_key(&entity);
            }
        }
        if !sweep.is_empty() {
            tracing::debug!(count = sweep.len(), "Reclaimed placeholder entities");
        }
        sweep.len()
    }

    // ========================================================================
    // Copies and graph helpers
    // ========================================================================

    /// Disposable working copy sharing this context's transaction.
    pub fn deep_copy(&self) -> Self {
        Self {
            env: self.env.clone(),
            entities: self.entities.clone(),
            keys: self.keys.clone(),
            referrers: self.referrers.clone(),
            mode: self.mode,
            resources: self.resources.join_transaction(),
        }
    }

    /// Entities owning `id`, through an owning reference or an owning to-many.
    pub fn owners(&self, id: EntityId) -> Result<Vec<EntityId>> {
        let entity = self.entity(id)?;
        let mut owners = BTreeSet::new();
        for r in self.referrers.get(&id).into_iter().flatten() {
            let holder = self.entity(r.holder)?;
            let owns = holder
                .entity_type()
                .node(&r.node)
                .and_then(|n| n.relation())
                .is_some_and(|rel| rel.is_owns());
            if owns {
                owners.insert(r.holder);
            }
        }
        for node in entity.entity_type().ref_nodes() {
            let Some(parent) = entity.reference(&node.name)? else {
                continue;
            };
            let parent_type = self.entity(parent)?.entity_type();
            let owned_via = parent_type.to_many_nodes().any(|tm| match &tm.kind {
                NodeKind::ToMany {
                    target,
                    foreign_node,
                    relation,
                    ..
                } => relation.is_owns() && target == entity.type_name() && *foreign_node == node.name,
                _ => false,
            });
            if owned_via {
                owners.insert(parent);
            }
        }
        Ok(owners.into_iter().collect())
    }

    /// Entities whose `foreign_node` reference points at `parent`.
    pub(crate) fn referring_children(
        &self,
        parent: EntityId,
        child_type: &str,
        foreign_node: &str,
    ) -> Vec<EntityId> {
        self.referrers
            .get(&parent)
            .into_iter()
            .flatten()
            .filter(|r| r.node == foreign_node)
            .filter(|r| {
                self.entities
                    .get(&r.holder)
                    .is_some_and(|e| e.type_name() == child_type)
            })
            .map(|r| r.holder)
            .collect()
    }

    /// Textual dump of every entity, for diagnostics.
    pub fn report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "EntityContext ({} entities, {:?})", self.len(), self.mode);
        for entity in self.entities.values() {
            let _ = writeln!(
                out,
                "  {} {:?}/{:?}",
                entity,
                entity.state(),
                entity.presence()
            );
            for (nt, node) in entity.entity_type().nodes().iter().zip(entity.nodes()) {
                let rendered = match node {
                    Node::Value(v) => match v.value().as_value() {
                        Some(value) => value.to_string(),
                        None => "<not loaded>".to_string(),
                    },
                    Node::Ref(r) if !r.is_loaded() => "<not loaded>".to_string(),
                    Node::Ref(r) => r
                        .reference()
                        .map_or_else(|| "null".to_string(), |id| id.to_string()),
                    Node::ToMany(t) if !t.is_fetched() => "<not fetched>".to_string(),
                    Node::ToMany(t) => format!(
                        "[{}]",
                        t.list()
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                };
                let _ = writeln!(out, "    {} = {}", nt.name, rendered);
            }
        }
        out
    }
}

impl fmt::Debug for EntityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityContext")
            .field("entities", &self.entities.len())
            .field("mode", &self.mode)
            .field("resources", &self.resources)
            .finish_non_exhaustive()
    }
}

pub(crate) fn unknown_entity(id: EntityId) -> Error {
    Error::context(
        ContextErrorKind::UnknownEntity,
        format!("entity {} is not in this context", id),
    )
}

/// Non-null references held by an entity, by node name.
fn held_references(entity: &Entity) -> Vec<(String, EntityId)> {
    entity
        .entity_type()
        .nodes()
        .iter()
        .zip(entity.nodes())
        .filter_map(|(nt, node)| match node {
            Node::Ref(r) => r.reference().map(|t| (nt.name.clone(), t)),
            _ => None,
        })
        .collect()
}

/// Target type and foreign node of a to-many node.
pub(crate) fn to_many_parts(entity_type: &EntityType, node: &str) -> Result<(String, String)> {
    match &entity_type.require_node(node)?.kind {
        NodeKind::ToMany {
            target,
            foreign_node,
            ..
        } => Ok((target.clone(), foreign_node.clone())),
        _ => Err(Error::schema(
            SchemaErrorKind::WrongNodeKind,
            format!("{}.{} is not a to-many node", entity_type.name(), node),
        )),
    }
}

/// The to-many node on `parent_type` whose foreign node is `child_type.node`.
fn inverse_to_many(parent_type: &EntityType, child_type: &str, node: &str) -> Option<String> {
    parent_type
        .to_many_nodes()
        .find(|tm| match &tm.kind {
            NodeKind::ToMany {
                target,
                foreign_node,
                ..
            } => target == child_type && foreign_node == node,
            _ => false,
        })
        .map(|tm| tm.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::environment;

    #[test]
    fn test_new_entity_presence_follows_key_and_constraint() {
        let env = environment();
        let mut ctx = EntityContext::new(&env);
        let fresh = ctx.create("Customer").unwrap();
        let unknown = ctx
            .new_entity("Customer", Some(Value::BigInt(1)), EntityConstraint::none())
            .unwrap();
        let placeholder = ctx
            .new_entity(
                "Customer",
                Some(Value::BigInt(2)),
                EntityConstraint::must_exist_in_db(),
            )
            .unwrap();
        assert!(ctx.entity(fresh).unwrap().is_clearly_not_in_db());
        assert!(ctx.entity(unknown).unwrap().is_unclear_if_in_db());
        assert!(ctx.entity(placeholder).unwrap().is_fetch_required());
        assert_eq!(ctx.find("Customer", &Value::BigInt(2)), Some(placeholder));
    }

    #[test]
    fn test_duplicate_key_is_rejected() {
        let env = environment();
        let mut ctx = EntityContext::new(&env);
        ctx.new_entity("Customer", Some(Value::BigInt(1)), EntityConstraint::none())
            .unwrap();
        let err = ctx
            .new_entity("Customer", Some(Value::BigInt(1)), EntityConstraint::none())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Context(ref e) if e.kind == ContextErrorKind::DuplicateKey
        ));

        let other = ctx.create("Customer").unwrap();
        assert!(ctx.set_key(other, Some(Value::BigInt(1))).is_err());
        ctx.set_key(other, Some(Value::BigInt(3))).unwrap();
        assert_eq!(ctx.find("Customer", &Value::BigInt(3)), Some(other));
        ctx.set_key(other, None).unwrap();
        assert_eq!(ctx.find("Customer", &Value::BigInt(3)), None);
    }

    #[test]
    fn test_set_reference_maintains_index_and_inverse_list() {
        let env = environment();
        let mut ctx = EntityContext::new(&env);
        let a = ctx.create("Order").unwrap();
        let b = ctx.create("Order").unwrap();
        let line = ctx.create("OrderLine").unwrap();

        ctx.set_reference(line, "order", Some(a)).unwrap();
        assert_eq!(ctx.referrers(a).len(), 1);
        assert!(ctx.entity(a).unwrap().to_many("lines").unwrap().contains(line));

        ctx.set_reference(line, "order", Some(b)).unwrap();
        assert!(ctx.referrers(a).is_empty());
        assert!(!ctx.entity(a).unwrap().to_many("lines").unwrap().contains(line));
        assert!(ctx.entity(b).unwrap().to_many("lines").unwrap().contains(line));

        assert!(ctx.set_reference(line, "order", Some(line)).is_err());
    }

    #[test]
    fn test_add_to_many_points_child_at_parent() {
        let env = environment();
        let mut ctx = EntityContext::new(&env);
        let order = ctx.create("Order").unwrap();
        let line = ctx.create("OrderLine").unwrap();
        ctx.add_to_many(order, "lines", line).unwrap();
        assert_eq!(ctx.entity(line).unwrap().reference("order").unwrap(), Some(order));
        assert!(ctx.remove_from_many(order, "lines", line).unwrap());
        assert_eq!(ctx.entity(line).unwrap().reference("order").unwrap(), Some(order));
    }

    #[test]
    fn test_dropped_child_leaves_every_list_holding_it() {
        let env = environment();
        let mut ctx = EntityContext::new(&env);
        let first = ctx.create("Order").unwrap();
        let second = ctx.create("Order").unwrap();
        let line = ctx.create("OrderLine").unwrap();
        ctx.set_reference(line, "order", Some(second)).unwrap();
        ctx.add_to_many(first, "lines", line).unwrap();
        assert_eq!(ctx.entity(first).unwrap().to_many("lines").unwrap().list(), &[line]);

        assert_eq!(ctx.remove(line).unwrap(), Removal::Removed);
        assert!(ctx.entity(first).unwrap().to_many("lines").unwrap().list().is_empty());
        assert!(ctx.entity(second).unwrap().to_many("lines").unwrap().list().is_empty());
        assert!(ctx.referrers(second).is_empty());
    }

    #[test]
    fn test_remove_unloads_entity_with_outside_referrers() {
        let env = environment();
        let mut ctx = EntityContext::new(&env);
        let customer = ctx
            .new_entity("Customer", Some(Value::BigInt(5)), EntityConstraint::none())
            .unwrap();
        let order = ctx.create("Order").unwrap();
        ctx.set_reference(order, "customer", Some(customer)).unwrap();

        assert_eq!(ctx.remove(customer).unwrap(), Removal::Unloaded);
        let placeholder = ctx.get("Customer", &Value::BigInt(5)).unwrap();
        assert_eq!(placeholder.id(), customer);
        assert_eq!(placeholder.state(), EntityState::NotLoaded);
        assert_eq!(ctx.entity(order).unwrap().reference("customer").unwrap(), Some(customer));
    }

    #[test]
    fn test_remove_all_drops_entities_referenced_only_within_the_set() {
        let env = environment();
        let mut ctx = EntityContext::new(&env);
        let customer = ctx.create("Customer").unwrap();
        let order = ctx.create("Order").unwrap();
        let line = ctx.create("OrderLine").unwrap();
        ctx.set_reference(order, "customer", Some(customer)).unwrap();
        ctx.add_to_many(order, "lines", line).unwrap();

        let outcome = ctx.remove_all(&[customer, order, line]).unwrap();
        assert!(outcome.iter().all(|(_, r)| *r == Removal::Removed));
        assert!(ctx.is_empty());
        assert!(ctx.referrers(customer).is_empty());
    }

    #[test]
    fn test_owners_through_reference_and_to_many() {
        let env = environment();
        let mut ctx = EntityContext::new(&env);
        let order = ctx.create("Order").unwrap();
        let line = ctx.create("OrderLine").unwrap();
        ctx.add_to_many(order, "lines", line).unwrap();
        assert_eq!(ctx.owners(line).unwrap(), vec![order]);

        let invoice = ctx.create("Invoice").unwrap();
        let customer = ctx.create("Customer").unwrap();
        ctx.set_reference(invoice, "billed_to", Some(customer)).unwrap();
        assert_eq!(ctx.owners(customer).unwrap(), vec![invoice]);
    }

    #[test]
    fn test_reclaim_sweeps_unreferenced_placeholders() {
        let env = environment();
        let mut ctx = EntityContext::new(&env);
        let kept = ctx.placeholder("Customer", Value::BigInt(1)).unwrap();
        ctx.placeholder("Customer", Value::BigInt(2)).unwrap();
        let order = ctx.create("Order").unwrap();
        ctx.set_reference(order, "customer", Some(kept)).unwrap();
        assert_eq!(ctx.reclaim(), 1);
        assert!(ctx.contains(kept));
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn test_deep_copy_is_independent() {
        let env = environment();
        let mut ctx = EntityContext::new(&env);
        let customer = ctx.create("Customer").unwrap();
        ctx.set_value(customer, "name", "Ada").unwrap();
        let mut copy = ctx.deep_copy();
        copy.set_value(customer, "name", "Grace").unwrap();
        assert_eq!(ctx.entity(customer).unwrap().get("name"), Some(&Value::from("Ada")));
        assert!(ctx.report().contains("name = Ada"));
    }
}
