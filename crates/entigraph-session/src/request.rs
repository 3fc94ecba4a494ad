//! Persist requests.

use entigraph_core::EntityId;

/// Root entities classified by the operation the caller wants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistRequest {
    pub to_insert: Vec<EntityId>,
    pub to_update: Vec<EntityId>,
    /// Insert or update, decided by database presence.
    pub to_save: Vec<EntityId>,
    pub to_delete: Vec<EntityId>,
}

impl PersistRequest {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn insert(mut self, id: EntityId) -> Self {
        self.to_insert.push(id);
        self
    }

    #[must_use]
    pub fn update(mut self, id: EntityId) -> Self {
        self.to_update.push(id);
        self
    }

    #[must_use]
    pub fn save(mut self, id: EntityId) -> Self {
        self.to_save.push(id);
        self
    }

    #[must_use]
    pub fn delete(mut self, id: EntityId) -> Self {
        self.to_delete.push(id);
        self
    }

    #[must_use]
    pub fn save_all(mut self, ids: impl IntoIterator<Item = EntityId>) -> Self {
        self.to_save.extend(ids);
        self
    }

    #[must_use]
    pub fn delete_all(mut self, ids: impl IntoIterator<Item = EntityId>) -> Self {
        self.to_delete.extend(ids);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.to_insert.is_empty()
            && self.to_update.is_empty()
            && self.to_save.is_empty()
            && self.to_delete.is_empty()
    }

    /// Every root, in request order.
    pub fn roots(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.to_insert
            .iter()
            .chain(&self.to_update)
            .chain(&self.to_save)
            .chain(&self.to_delete)
            .copied()
    }
}
