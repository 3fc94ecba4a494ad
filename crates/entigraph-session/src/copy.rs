//! Copying entities between contexts.

use crate::context::EntityContext;
use crate::entity::{DbPresence, Entity, EntityConstraint, EntityState};
use crate::node::Node;
use entigraph_core::{EntityId, Result};
use std::collections::{BTreeSet, HashMap};

impl EntityContext {
    /// Copy one entity from this context into `other`.
    ///
    /// The target is matched by id first, then by type and key; when neither
    /// exists the entity is added under its own id. Scalar values and
    /// reference keys are copied without forcing any load: referenced
    /// entities become must-exist placeholders in `other` unless they are new,
    /// in which case they are copied along. Returns the id in `other`.
    pub fn copy_into(&self, other: &mut EntityContext, id: EntityId) -> Result<EntityId> {
        let mut mapped = HashMap::new();
        self.copy_entity(other, id, &mut mapped)
    }

    fn copy_entity(
        &self,
        other: &mut EntityContext,
        id: EntityId,
        mapped: &mut HashMap<EntityId, EntityId>,
    ) -> Result<EntityId> {
        if let Some(target) = mapped.get(&id) {
            return Ok(*target);
        }
        let source = self.entity(id)?;
        let target_id = self.resolve_in(other, source)?;
        mapped.insert(id, target_id);

        let mut copy = source.clone();
        for node in copy.nodes_mut() {
            match node {
                Node::Ref(r) => {
                    if let Some(reference) = r.reference() {
                        let resolved = self.reference_in(other, reference, mapped)?;
                        let original = r.original();
                        r.replace(Some(resolved));
                        if original == Some(reference) {
                            r.refresh();
                        }
                    }
                }
                Node::ToMany(list) => {
                    let mut members = Vec::with_capacity(list.list().len());
                    for child in list.list() {
                        members.push(self.reference_in(other, *child, mapped)?);
                    }
                    list.set_list(members);
                }
                Node::Value(_) => {}
            }
        }
        let copy = rebind(copy, target_id);
        other.replace_entity(copy)?;
        Ok(target_id)
    }

    /// Id in `other` for the entity `source`, creating nothing.
    fn resolve_in(&self, other: &EntityContext, source: &Entity) -> Result<EntityId> {
        if other.contains(source.id()) {
            return Ok(source.id());
        }
        if let Some(key) = source.key() {
            if let Some(existing) = other.find(source.type_name(), key) {
                return Ok(existing);
            }
        }
        Ok(source.id())
    }

    /// Id in `other` for a referenced entity, adding a placeholder or a copy when missing.
    fn reference_in(
        &self,
        other: &mut EntityContext,
        reference: EntityId,
        mapped: &mut HashMap<EntityId, EntityId>,
    ) -> Result<EntityId> {
        if let Some(target) = mapped.get(&reference) {
            return Ok(*target);
        }
        let referenced = self.entity(reference)?;
        let resolved = self.resolve_in(other, referenced)?;
        if other.contains(resolved) {
            return Ok(resolved);
        }
        match referenced.key() {
            Some(key) if !referenced.is_clearly_not_in_db() => {
                let placeholder = Entity::new(
                    reference,
                    std::sync::Arc::clone(referenced.entity_type()),
                    Some(key.clone()),
                    EntityState::NotLoaded,
                    DbPresence::ConfirmedInDb,
                    EntityConstraint::must_exist_in_db(),
                );
                other.add(placeholder)?;
                Ok(reference)
            }
            _ => self.copy_entity(other, reference, mapped),
        }
    }

    /// Merge the state of `ids` from `from` back into this context by id.
    ///
    /// Entities in `deleted` that this context holds lose their key and are
    /// removed under the unload rule.
    #[tracing::instrument(level = "debug", skip_all, fields(changed = ids.len(), deleted = deleted.len()))]
    pub fn apply_changes(
        &mut self,
        from: &EntityContext,
        ids: &[EntityId],
        deleted: &[EntityId],
    ) -> Result<()> {
        let changed: BTreeSet<EntityId> = ids.iter().copied().collect();
        for id in &changed {
            let entity = from.entity(*id)?;
            if let Some(key) = entity.key() {
                if let Some(existing) = self.find(entity.type_name(), key) {
                    if existing != *id {
                        self.set_key(existing, None)?;
                    }
                }
            }
        }
        for id in &changed {
            let mut entity = from.entity(*id)?.clone();
            for node in entity.nodes_mut() {
                match node {
                    Node::Ref(r) => {
                        if let Some(target) = r.reference() {
                            self.ensure_present(from, target, &changed)?;
                        }
                    }
                    Node::ToMany(list) => {
                        let mut members = Vec::with_capacity(list.list().len());
                        for child in list.list() {
                            if self.ensure_present(from, *child, &changed)? {
                                members.push(*child);
                            }
                        }
                        list.set_list(members);
                    }
                    Node::Value(_) => {}
                }
            }
            self.replace_entity(entity)?;
        }

        let present: Vec<EntityId> = deleted
            .iter()
            .copied()
            .filter(|id| self.contains(*id))
            .collect();
        for id in &present {
            self.set_key(*id, None)?;
        }
        self.remove_all(&present)?;
        Ok(())
    }

    /// Make sure `id` resolves here, adding a placeholder for it if needed.
    ///
    /// Returns false when the entity can be neither found nor represented.
    fn ensure_present(
        &mut self,
        from: &EntityContext,
        id: EntityId,
        changed: &BTreeSet<EntityId>,
    ) -> Result<bool> {
        if self.contains(id) || changed.contains(&id) {
            return Ok(true);
        }
        let Some(source) = from.get_by_id(id) else {
            return Ok(false);
        };
        let Some(key) = source.key() else {
            return Ok(false);
        };
        if self.find(source.type_name(), key).is_some() {
            return Ok(false);
        }
        self.add(Entity::new(
            id,
            std::sync::Arc::clone(source.entity_type()),
            Some(key.clone()),
            EntityState::NotLoaded,
            DbPresence::ConfirmedInDb,
            EntityConstraint::must_exist_in_db(),
        ))?;
        Ok(true)
    }
}

/// The same entity data under another id.
fn rebind(entity: Entity, id: EntityId) -> Entity {
    if entity.id() == id {
        return entity;
    }
    let mut rebound = Entity::new(
        id,
        std::sync::Arc::clone(entity.entity_type()),
        None,
        entity.state(),
        entity.presence(),
        entity.constraint(),
    );
    rebound.nodes_mut().clone_from_slice(entity.nodes());
    rebound
}
