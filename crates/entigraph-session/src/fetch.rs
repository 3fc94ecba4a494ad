//! Loading rows into a context.
//!
//! Rows are materialised through [`EntityContext::apply_row`], which respects
//! the identity map: a row for an entity already present only fills the
//! nodes that are not loaded yet, so local modifications survive a reload.

use crate::context::{ContextMode, EntityContext};
use crate::entity::{DbPresence, EntityState};
use crate::node::{Node, NodeValue};
use entigraph_core::{
    ContextErrorKind, EntityId, EntityType, Error, NodeKind, Result, Row, RowQuery,
    SchemaErrorKind, Value,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

impl EntityContext {
    /// Materialise a database row, returning the entity id.
    pub fn apply_row(&mut self, entity_type: &str, row: &Row) -> Result<EntityId> {
        self.apply_row_tracked(entity_type, row).map(|(id, _)| id)
    }

    /// Like [`apply_row`](Self::apply_row), also reporting whether the
    /// entity was absent from the context before.
    pub(crate) fn apply_row_tracked(
        &mut self,
        entity_type: &str,
        row: &Row,
    ) -> Result<(EntityId, bool)> {
        let ty = self.entity_type(entity_type)?;
        let key = row
            .get_by_name(ty.key_node())
            .filter(|k| !k.is_null())
            .cloned()
            .ok_or_else(|| {
                Error::context(
                    ContextErrorKind::NotLoaded,
                    format!("{} row without key", ty.name()),
                )
            })?;
        let (id, created) = match self.find(ty.name(), &key) {
            Some(id) => (id, false),
            None => (self.placeholder(ty.name(), key)?, true),
        };

        for node in ty.nodes() {
            let Some(value) = row.get_by_name(&node.name) else {
                continue;
            };
            match &node.kind {
                NodeKind::Value => {
                    let slot = self.entity_mut(id)?.value_node_mut(&node.name)?;
                    if !slot.value().is_loaded() {
                        slot.set_loaded(value.clone());
                    }
                }
                NodeKind::Ref { target, .. } => {
                    if self.entity(id)?.ref_node(&node.name)?.is_loaded() {
                        continue;
                    }
                    let target_id = if value.is_null() {
                        None
                    } else {
                        Some(self.placeholder(target, value.clone())?)
                    };
                    self.link_reference(id, &node.name, target_id, true)?;
                    self.entity_mut(id)?.ref_node_mut(&node.name)?.refresh();
                }
                NodeKind::ToMany { .. } => {}
            }
        }

        let entity = self.entity_mut(id)?;
        entity.set_state(EntityState::Loaded);
        entity.set_presence(DbPresence::ConfirmedInDb);
        Ok((id, created))
    }

    /// Run a row query and materialise the results.
    pub fn perform_query(&mut self, query: &RowQuery) -> Result<Vec<EntityId>> {
        self.perform_query_tracked(query)
            .map(|rows| rows.into_iter().map(|(id, _)| id).collect())
    }

    pub(crate) fn perform_query_tracked(
        &mut self,
        query: &RowQuery,
    ) -> Result<Vec<(EntityId, bool)>> {
        let rows = self.with_connection(|c| c.query(query))?;
        tracing::trace!(query = %query, rows = rows.len(), "Performed query");
        rows.iter()
            .map(|row| self.apply_row_tracked(&query.entity_type, row))
            .collect()
    }

    /// Load an unloaded entity by key, regardless of mode.
    ///
    /// A missing row marks the entity new, or fails if it must exist.
    pub fn fetch(&mut self, id: EntityId) -> Result<()> {
        self.fetch_all(&[id]).map(|_| ())
    }

    /// Load several unloaded entities with one query per entity type.
    ///
    /// Entities that are loaded, new or without key are skipped. Returns the
    /// ids that were found in the database.
    #[tracing::instrument(level = "debug", skip(self, ids), fields(count = ids.len()))]
    pub fn fetch_all(&mut self, ids: &[EntityId]) -> Result<Vec<EntityId>> {
        let mut by_type: BTreeMap<String, Vec<(EntityId, Value)>> = BTreeMap::new();
        for id in ids {
            let entity = self.entity(*id)?;
            if entity.state() != EntityState::NotLoaded || entity.is_clearly_not_in_db() {
                continue;
            }
            if let Some(key) = entity.key() {
                by_type
                    .entry(entity.type_name().to_string())
                    .or_default()
                    .push((*id, key.clone()));
            }
        }

        let mut found = Vec::new();
        for (type_name, pending) in by_type {
            let ty = self.entity_type(&type_name)?;
            for (id, _) in &pending {
                self.entity_mut(*id)?.set_state(EntityState::Loading);
            }
            let keys: Vec<Value> = pending.iter().map(|(_, k)| k.clone()).collect();
            let query = RowQuery::new(type_name.as_str()).in_list(ty.key_node(), keys);
            let loaded = match self.perform_query(&query) {
                Ok(loaded) => loaded,
                Err(err) => {
                    for (id, _) in &pending {
                        self.entity_mut(*id)?.set_state(EntityState::NotLoaded);
                    }
                    return Err(err);
                }
            };
            let loaded: HashSet<EntityId> = loaded.into_iter().collect();
            for (id, key) in pending {
                if loaded.contains(&id) {
                    found.push(id);
                    continue;
                }
                let entity = self.entity_mut(id)?;
                if entity.constraint().must_exist_in_db {
                    entity.set_state(EntityState::NotLoaded);
                    return Err(Error::context(
                        ContextErrorKind::MustExistInDb,
                        format!("{}[{}] does not exist in the database", type_name, key),
                    ));
                }
                entity.mark_not_in_db();
            }
        }
        Ok(found)
    }

    /// Fetch the current members of a to-many relation.
    ///
    /// Children added locally stay in the list; children whose foreign
    /// reference now points elsewhere are left out. With a join property,
    /// the far-side entities are loaded too.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn fetch_to_many(&mut self, id: EntityId, node: &str) -> Result<Vec<EntityId>> {
        self.fetch_to_many_tracked(id, node)
            .map(|(list, _)| list)
    }

    /// Like [`fetch_to_many`](Self::fetch_to_many), also returning the ids
    /// that were not in the context before.
    pub(crate) fn fetch_to_many_tracked(
        &mut self,
        id: EntityId,
        node: &str,
    ) -> Result<(Vec<EntityId>, Vec<EntityId>)> {
        let parent = self.entity(id)?;
        let parent_type = Arc::clone(parent.entity_type());
        let NodeKind::ToMany {
            target,
            foreign_node,
            join_property,
            ..
        } = &parent_type.require_node(node)?.kind
        else {
            return Err(Error::schema(
                SchemaErrorKind::WrongNodeKind,
                format!("{}.{} is not a to-many node", parent_type.name(), node),
            ));
        };
        let current = parent.to_many(node)?.list().to_vec();
        let key = parent
            .key()
            .filter(|_| !parent.is_clearly_not_in_db())
            .cloned();
        let Some(key) = key else {
            self.entity_mut(id)?.to_many_mut(node)?.set_fetched(true);
            return Ok((current, Vec::new()));
        };

        let query = RowQuery::new(target.as_str()).equals(foreign_node.as_str(), key);
        let rows = self.perform_query_tracked(&query)?;
        let mut added: Vec<EntityId> = rows.iter().filter(|(_, c)| *c).map(|(c, _)| *c).collect();
        let mut list = Vec::with_capacity(rows.len() + current.len());
        for (child, _) in rows {
            if self.entity(child)?.reference(foreign_node)? == Some(id) && !list.contains(&child) {
                list.push(child);
            }
        }
        for child in current {
            if !list.contains(&child) {
                list.push(child);
            }
        }

        if let Some(join) = join_property {
            let mut far = Vec::new();
            for child in &list {
                if let Some(target) = self.entity(*child)?.reference(join)? {
                    if self.entity(target)?.is_fetch_required() {
                        far.push(target);
                    }
                }
            }
            let loaded = self.fetch_all(&far)?;
            added.extend(loaded);
        }

        let slot = self.entity_mut(id)?.to_many_mut(node)?;
        slot.set_list(list.clone());
        slot.set_fetched(true);
        tracing::debug!(parent = %id, node, count = list.len(), "Fetched to-many");
        Ok((list, added))
    }

    /// The entity with this key, loading it when needed. `None` if it has no row.
    pub fn load(&mut self, entity_type: &str, key: &Value) -> Result<Option<EntityId>> {
        let ty: Arc<EntityType> = self.entity_type(entity_type)?;
        if let Some(id) = self.find(ty.name(), key) {
            let entity = self.entity(id)?;
            if entity.is_clearly_not_in_db() {
                return Ok(None);
            }
            if entity.state() == EntityState::NotLoaded && self.fetch_all(&[id])?.is_empty() {
                return Ok(None);
            }
            return Ok(Some(id));
        }
        let query = RowQuery::new(ty.name()).equals(ty.key_node(), key.clone());
        Ok(self.perform_query(&query)?.into_iter().next())
    }

    // ========================================================================
    // Lazy accessors
    // ========================================================================

    fn lazy_fetch_allowed(&self, id: EntityId) -> Result<bool> {
        let entity = self.entity(id)?;
        Ok(self.mode() == ContextMode::User
            && entity.state() == EntityState::NotLoaded
            && !entity.is_clearly_not_in_db()
            && entity.key().is_some())
    }

    /// Dereference a reference node, loading the holder first in user mode.
    pub fn reference(&mut self, id: EntityId, node: &str) -> Result<Option<EntityId>> {
        if !self.entity(id)?.ref_node(node)?.is_loaded() && self.lazy_fetch_allowed(id)? {
            self.fetch(id)?;
        }
        self.entity(id)?.reference(node)
    }

    /// Read a scalar node, loading the holder first in user mode.
    pub fn value(&mut self, id: EntityId, node: &str) -> Result<NodeValue> {
        if !self.entity(id)?.value(node)?.is_loaded() && self.lazy_fetch_allowed(id)? {
            self.fetch(id)?;
        }
        Ok(self.entity(id)?.value(node)?.clone())
    }

    /// Members of a to-many relation, fetching them first in user mode.
    pub fn to_many(&mut self, id: EntityId, node: &str) -> Result<Vec<EntityId>> {
        let entity = self.entity(id)?;
        let list = entity.to_many(node)?;
        if !list.is_fetched() && self.mode() == ContextMode::User {
            return self.fetch_to_many(id, node);
        }
        Ok(list.list().to_vec())
    }

    /// Whether every node of the entity holds loaded data.
    pub fn is_fully_loaded(&self, id: EntityId) -> Result<bool> {
        Ok(self.entity(id)?.nodes().iter().all(|n| match n {
            Node::Value(v) => v.value().is_loaded(),
            Node::Ref(r) => r.is_loaded(),
            Node::ToMany(t) => t.is_fetched(),
        }))
    }
}
