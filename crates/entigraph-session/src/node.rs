//! Node slots carried by entities.
//!
//! Each node tracks both its current state and the state last loaded from
//! (or written to) the database, so callers can ask whether it was modified.

use entigraph_core::{EntityId, Value};

/// A scalar slot which may not have been fetched yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum NodeValue {
    /// Not fetched from the database.
    #[default]
    NotLoaded,
    Value(Value),
}

impl NodeValue {
    pub fn is_loaded(&self) -> bool {
        matches!(self, NodeValue::Value(_))
    }

    /// The value, `None` when not loaded.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            NodeValue::Value(v) => Some(v),
            NodeValue::NotLoaded => None,
        }
    }

    /// The value, treating "not loaded" as NULL.
    pub fn or_null(&self) -> Value {
        self.as_value().cloned().unwrap_or(Value::Null)
    }
}

impl From<Value> for NodeValue {
    fn from(v: Value) -> Self {
        NodeValue::Value(v)
    }
}

/// Scalar node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueNode {
    value: NodeValue,
    loaded: NodeValue,
}

impl ValueNode {
    pub(crate) fn new(value: NodeValue) -> Self {
        Self {
            loaded: value.clone(),
            value,
        }
    }

    pub fn value(&self) -> &NodeValue {
        &self.value
    }

    /// The value as last loaded from or written to the database.
    pub fn loaded_value(&self) -> &NodeValue {
        &self.loaded
    }

    pub fn is_modified(&self) -> bool {
        self.value.is_loaded() && self.value != self.loaded
    }

    pub(crate) fn set(&mut self, value: Value) {
        self.value = NodeValue::Value(value);
    }

    /// Set both the current and loaded value.
    pub(crate) fn set_loaded(&mut self, value: Value) {
        self.loaded = NodeValue::Value(value.clone());
        self.value = NodeValue::Value(value);
    }

    pub(crate) fn refresh(&mut self) {
        self.loaded = self.value.clone();
    }

    pub(crate) fn unload(&mut self) {
        self.value = NodeValue::NotLoaded;
        self.loaded = NodeValue::NotLoaded;
    }
}

/// Single-reference node.
///
/// A reference always points at an entity of the context (possibly an
/// unloaded placeholder carrying only its key), so the foreign key value is
/// the key of the referenced entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefNode {
    reference: Option<EntityId>,
    original: Option<EntityId>,
    loaded: bool,
}

impl RefNode {
    pub(crate) fn new(loaded: bool) -> Self {
        Self {
            reference: None,
            original: None,
            loaded,
        }
    }

    /// The referenced entity, `None` for a null or unloaded reference.
    pub fn reference(&self) -> Option<EntityId> {
        self.reference
    }

    /// The referenced entity as last loaded from the database.
    pub fn original(&self) -> Option<EntityId> {
        self.original
    }

    /// Whether the reference itself was loaded (or set).
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn is_modified(&self) -> bool {
        self.loaded && self.reference != self.original
    }

    /// Replace the reference, returning the previous one.
    pub(crate) fn replace(&mut self, reference: Option<EntityId>) -> Option<EntityId> {
        self.loaded = true;
        std::mem::replace(&mut self.reference, reference)
    }

    pub(crate) fn refresh(&mut self) {
        self.original = self.reference;
    }

    /// Reset to unloaded, returning the reference that was held.
    pub(crate) fn unload(&mut self) -> Option<EntityId> {
        self.loaded = false;
        self.original = None;
        self.reference.take()
    }
}

/// Ordered multi-reference node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToManyNode {
    list: Vec<EntityId>,
    fetched: bool,
}

impl ToManyNode {
    pub(crate) fn new(fetched: bool) -> Self {
        Self {
            list: Vec::new(),
            fetched,
        }
    }

    pub fn list(&self) -> &[EntityId] {
        &self.list
    }

    /// Whether the full current set is known.
    pub fn is_fetched(&self) -> bool {
        self.fetched
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.list.contains(&id)
    }

    pub(crate) fn push(&mut self, id: EntityId) -> bool {
        if self.list.contains(&id) {
            return false;
        }
        self.list.push(id);
        true
    }

    pub(crate) fn remove(&mut self, id: EntityId) -> bool {
        let before = self.list.len();
        self.list.retain(|e| *e != id);
        self.list.len() != before
    }

    pub(crate) fn set_list(&mut self, list: Vec<EntityId>) {
        self.list = list;
    }

    pub(crate) fn set_fetched(&mut self, fetched: bool) {
        self.fetched = fetched;
    }

    pub(crate) fn unload(&mut self) {
        self.list.clear();
        self.fetched = false;
    }
}

/// A typed slot on an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Value(ValueNode),
    Ref(RefNode),
    ToMany(ToManyNode),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_node_modification_tracking() {
        let mut node = ValueNode::new(NodeValue::Value(Value::from("a")));
        assert!(!node.is_modified());
        node.set(Value::from("b"));
        assert!(node.is_modified());
        assert_eq!(node.loaded_value(), &NodeValue::Value(Value::from("a")));
        node.refresh();
        assert!(!node.is_modified());
    }

    #[test]
    fn test_unloaded_value_is_never_modified() {
        let mut node = ValueNode::new(NodeValue::Value(Value::BigInt(1)));
        node.unload();
        assert!(!node.is_modified());
        assert_eq!(node.value().or_null(), Value::Null);
    }

    #[test]
    fn test_ref_node_replace_and_unload() {
        let a = EntityId::next();
        let b = EntityId::next();
        let mut node = RefNode::new(false);
        assert!(!node.is_loaded());
        assert_eq!(node.replace(Some(a)), None);
        node.refresh();
        assert_eq!(node.replace(Some(b)), Some(a));
        assert!(node.is_modified());
        assert_eq!(node.unload(), Some(b));
        assert!(!node.is_loaded());
    }

    #[test]
    fn test_to_many_is_duplicate_free() {
        let a = EntityId::next();
        let mut node = ToManyNode::new(true);
        assert!(node.push(a));
        assert!(!node.push(a));
        assert_eq!(node.list().len(), 1);
        assert!(node.remove(a));
        assert!(!node.remove(a));
    }
}
