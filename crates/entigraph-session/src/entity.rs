//! Entities: typed node sets with identity and database state.

use crate::node::{Node, NodeValue, RefNode, ToManyNode, ValueNode};
use entigraph_core::{
    EntityId, EntitySnapshot, EntityType, Error, NodeKind, Result, SchemaErrorKind, Value,
};
use std::fmt;
use std::sync::Arc;

/// Data completeness of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// Only the identity (and maybe the key) is known.
    NotLoaded,
    /// A fetch is in progress.
    Loading,
    /// Nodes reflect a database row, possibly modified since.
    Loaded,
    /// The entity has no database row.
    NotInDb,
}

/// Whether the entity has a database row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbPresence {
    ClearlyNew,
    /// Must be resolved before persist planning.
    Unknown,
    ConfirmedInDb,
}

/// Constraints checked when an entity is fetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EntityConstraint {
    /// A fetch that finds no row fails instead of marking the entity new.
    pub must_exist_in_db: bool,
}

impl EntityConstraint {
    pub const fn none() -> Self {
        Self {
            must_exist_in_db: false,
        }
    }

    pub const fn must_exist_in_db() -> Self {
        Self {
            must_exist_in_db: true,
        }
    }
}

/// A mutable graph node with a stable id, an optional key and typed nodes.
#[derive(Debug, Clone)]
pub struct Entity {
    id: EntityId,
    entity_type: Arc<EntityType>,
    nodes: Vec<Node>,
    state: EntityState,
    presence: DbPresence,
    constraint: EntityConstraint,
}

impl Entity {
    /// Create an entity whose nodes match the given state.
    ///
    /// New entities start with NULL values, null references and fetched
    /// (empty) to-many relations. Any other state starts fully unloaded.
    pub(crate) fn new(
        id: EntityId,
        entity_type: Arc<EntityType>,
        key: Option<Value>,
        state: EntityState,
        presence: DbPresence,
        constraint: EntityConstraint,
    ) -> Self {
        let fresh = state == EntityState::NotInDb;
        let nodes = entity_type
            .nodes()
            .iter()
            .map(|nt| match nt.kind {
                NodeKind::Value if fresh => Node::Value(ValueNode::new(Value::Null.into())),
                NodeKind::Value => Node::Value(ValueNode::new(NodeValue::NotLoaded)),
                NodeKind::Ref { .. } => Node::Ref(RefNode::new(fresh)),
                NodeKind::ToMany { .. } => Node::ToMany(ToManyNode::new(fresh)),
            })
            .collect();
        let mut entity = Self {
            id,
            entity_type,
            nodes,
            state,
            presence,
            constraint,
        };
        if let Some(key) = key {
            let index = entity.key_index();
            if let Ok(node) = entity.value_node_mut_at(index) {
                node.set_loaded(key);
            }
        }
        entity
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.entity_type
    }

    pub fn type_name(&self) -> &str {
        self.entity_type.name()
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn presence(&self) -> DbPresence {
        self.presence
    }

    pub fn constraint(&self) -> EntityConstraint {
        self.constraint
    }

    fn key_index(&self) -> usize {
        self.entity_type
            .node_index(self.entity_type.key_node())
            .unwrap_or(0)
    }

    /// The database key, `None` while unassigned.
    pub fn key(&self) -> Option<&Value> {
        match self.nodes.get(self.key_index()) {
            Some(Node::Value(v)) => v.value().as_value().filter(|k| !k.is_null()),
            _ => None,
        }
    }

    /// The current optimistic-lock value, if the type has a lock node and it is loaded.
    pub fn lock_value(&self) -> Option<&Value> {
        let lock = self.entity_type.lock_node()?;
        self.value_node(lock).ok()?.value().as_value()
    }

    pub fn is_clearly_not_in_db(&self) -> bool {
        self.presence == DbPresence::ClearlyNew
    }

    pub fn is_unclear_if_in_db(&self) -> bool {
        self.presence == DbPresence::Unknown
    }

    /// Known to be in the database but not loaded yet.
    pub fn is_fetch_required(&self) -> bool {
        self.state == EntityState::NotLoaded && self.presence == DbPresence::ConfirmedInDb
    }

    pub fn is_loaded(&self) -> bool {
        self.state == EntityState::Loaded
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Result<&Node> {
        let index = self.index_of(name)?;
        Ok(&self.nodes[index])
    }

    /// The current value of a scalar node.
    pub fn value(&self, name: &str) -> Result<&NodeValue> {
        Ok(self.value_node(name)?.value())
    }

    /// The loaded value of a scalar node, `None` when unloaded.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.value_node(name).ok()?.value().as_value()
    }

    /// The raw referenced entity, without triggering any load.
    pub fn reference(&self, name: &str) -> Result<Option<EntityId>> {
        Ok(self.ref_node(name)?.reference())
    }

    pub fn to_many(&self, name: &str) -> Result<&ToManyNode> {
        match self.node(name)? {
            Node::ToMany(n) => Ok(n),
            _ => Err(self.wrong_kind(name, "to-many")),
        }
    }

    pub fn value_node(&self, name: &str) -> Result<&ValueNode> {
        match self.node(name)? {
            Node::Value(n) => Ok(n),
            _ => Err(self.wrong_kind(name, "value")),
        }
    }

    pub fn ref_node(&self, name: &str) -> Result<&RefNode> {
        match self.node(name)? {
            Node::Ref(n) => Ok(n),
            _ => Err(self.wrong_kind(name, "reference")),
        }
    }

    /// Detached copy for error reporting.
    pub fn snapshot(&self) -> EntitySnapshot {
        let values = self
            .entity_type
            .nodes()
            .iter()
            .zip(&self.nodes)
            .filter_map(|(nt, node)| match node {
                Node::Value(v) => v.value().as_value().map(|v| (nt.name.clone(), v.clone())),
                _ => None,
            })
            .collect();
        EntitySnapshot {
            id: self.id,
            entity_type: self.type_name().to_string(),
            key: self.key().cloned(),
            optimistic_lock: self.lock_value().cloned(),
            values,
        }
    }

    // ------------------------------------------------------------------
    // Crate-internal mutation. Reference and key bookkeeping lives in the
    // context, which is the only caller of these.
    // ------------------------------------------------------------------

    pub(crate) fn index_of(&self, name: &str) -> Result<usize> {
        self.entity_type.node_index(name).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::NodeNotFound,
                format!("{} has no node '{}'", self.type_name(), name),
            )
        })
    }

    fn wrong_kind(&self, name: &str, expected: &str) -> Error {
        wrong_kind(self.type_name(), name, expected)
    }

    pub(crate) fn set_state(&mut self, state: EntityState) {
        self.state = state;
    }

    pub(crate) fn set_presence(&mut self, presence: DbPresence) {
        self.presence = presence;
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut [Node] {
        &mut self.nodes
    }

    fn value_node_mut_at(&mut self, index: usize) -> Result<&mut ValueNode> {
        let Self {
            nodes, entity_type, ..
        } = self;
        match nodes.get_mut(index) {
            Some(Node::Value(n)) => Ok(n),
            _ => Err(wrong_kind(
                entity_type.name(),
                &format!("#{}", index),
                "value",
            )),
        }
    }

    pub(crate) fn value_node_mut(&mut self, name: &str) -> Result<&mut ValueNode> {
        let index = self.index_of(name)?;
        let Self {
            nodes, entity_type, ..
        } = self;
        match &mut nodes[index] {
            Node::Value(n) => Ok(n),
            _ => Err(wrong_kind(entity_type.name(), name, "value")),
        }
    }

    pub(crate) fn ref_node_mut(&mut self, name: &str) -> Result<&mut RefNode> {
        let index = self.index_of(name)?;
        let Self {
            nodes, entity_type, ..
        } = self;
        match &mut nodes[index] {
            Node::Ref(n) => Ok(n),
            _ => Err(wrong_kind(entity_type.name(), name, "reference")),
        }
    }

    pub(crate) fn to_many_mut(&mut self, name: &str) -> Result<&mut ToManyNode> {
        let index = self.index_of(name)?;
        let Self {
            nodes, entity_type, ..
        } = self;
        match &mut nodes[index] {
            Node::ToMany(n) => Ok(n),
            _ => Err(wrong_kind(entity_type.name(), name, "to-many")),
        }
    }

    /// Write the key node directly. The context keeps its key index in sync.
    pub(crate) fn set_key_raw(&mut self, key: Option<Value>) {
        let index = self.key_index();
        if let Ok(node) = self.value_node_mut_at(index) {
            node.set(key.unwrap_or(Value::Null));
        }
    }

    /// The entity turned out to have no database row.
    pub(crate) fn mark_not_in_db(&mut self) {
        self.state = EntityState::NotInDb;
        self.presence = DbPresence::ClearlyNew;
        for node in &mut self.nodes {
            match node {
                Node::Value(v) if !v.value().is_loaded() => v.set(Value::Null),
                Node::Ref(r) if !r.is_loaded() => {
                    r.replace(None);
                }
                Node::ToMany(t) => t.set_fetched(true),
                _ => {}
            }
        }
    }

    /// Reset the loaded-state snapshot of every node to the current state.
    pub(crate) fn refresh(&mut self) {
        for node in &mut self.nodes {
            match node {
                Node::Value(v) => v.refresh(),
                Node::Ref(r) => r.refresh(),
                Node::ToMany(_) => {}
            }
        }
    }
}

fn wrong_kind(type_name: &str, node: &str, expected: &str) -> Error {
    Error::schema(
        SchemaErrorKind::WrongNodeKind,
        format!("{}.{} is not a {} node", type_name, node, expected),
    )
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key() {
            Some(key) => write!(f, "{}[{}] {}", self.type_name(), key, self.id),
            None => write!(f, "{}[new] {}", self.type_name(), self.id),
        }
    }
}
