//! Entity type definitions.
//!
//! An [`EntityType`] describes one kind of entity: its key node, optional
//! optimistic-lock node and the typed node slots it carries. Relation nodes
//! declare how strongly the holder is tied to the target:
//!
//! - [`Relation::Owns`]: cascading create/update/delete and lock propagation
//! - [`Relation::DependsOn`]: the target's lock is validated, nothing is written
//! - [`Relation::Refers`]: no cascading at all
//!
//! Types are registered in a [`Definitions`] registry which checks that every
//! relation points at a known type and every to-many names a real foreign node.

use crate::error::{Error, Result, SchemaErrorKind};
use crate::identifiers::is_valid_identifier;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Strength of a relation between a holder and its target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Relation {
    /// The holder owns the target.
    Owns,
    /// The holder depends on the target being current.
    DependsOn,
    /// Plain reference.
    #[default]
    Refers,
}

impl Relation {
    pub const fn is_owns(self) -> bool {
        matches!(self, Relation::Owns)
    }

    pub const fn is_depends_on(self) -> bool {
        matches!(self, Relation::DependsOn)
    }
}

/// Kind-specific part of a node definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// Scalar value.
    Value,
    /// Single reference to an entity of `target` type.
    Ref { target: String, relation: Relation },
    /// Ordered collection of `target` entities whose `foreign_node`
    /// reference points back at the holder.
    ToMany {
        target: String,
        foreign_node: String,
        /// Reference node on the (join) target to pull in when fetching.
        join_property: Option<String>,
        relation: Relation,
    },
}

/// A named node slot on an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeType {
    pub name: String,
    pub kind: NodeKind,
}

impl NodeType {
    pub fn is_value(&self) -> bool {
        matches!(self.kind, NodeKind::Value)
    }

    pub fn is_ref(&self) -> bool {
        matches!(self.kind, NodeKind::Ref { .. })
    }

    pub fn is_to_many(&self) -> bool {
        matches!(self.kind, NodeKind::ToMany { .. })
    }

    /// Relation strength, `None` for value nodes.
    pub fn relation(&self) -> Option<Relation> {
        match &self.kind {
            NodeKind::Value => None,
            NodeKind::Ref { relation, .. } | NodeKind::ToMany { relation, .. } => Some(*relation),
        }
    }

    /// Target entity type name, `None` for value nodes.
    pub fn target(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Value => None,
            NodeKind::Ref { target, .. } | NodeKind::ToMany { target, .. } => Some(target),
        }
    }
}

/// Static descriptor of a kind of entity.
#[derive(Debug, Clone)]
pub struct EntityType {
    name: String,
    key_node: String,
    lock_node: Option<String>,
    nodes: Vec<NodeType>,
    index: HashMap<String, usize>,
}

impl EntityType {
    /// Start building an entity type with the given name and key node.
    pub fn builder(name: impl Into<String>, key_node: impl Into<String>) -> EntityTypeBuilder {
        EntityTypeBuilder::new(name, key_node)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_node(&self) -> &str {
        &self.key_node
    }

    pub fn lock_node(&self) -> Option<&str> {
        self.lock_node.as_deref()
    }

    pub fn supports_optimistic_lock(&self) -> bool {
        self.lock_node.is_some()
    }

    /// All nodes in declaration order.
    pub fn nodes(&self) -> &[NodeType] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&NodeType> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    /// Look up a node, failing with a schema error if it is not declared.
    pub fn require_node(&self, name: &str) -> Result<&NodeType> {
        self.node(name).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::NodeNotFound,
                format!("{} has no node '{}'", self.name, name),
            )
        })
    }

    /// Position of a node in declaration order.
    pub fn node_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Value and reference nodes: the columns of a row of this type.
    pub fn column_nodes(&self) -> impl Iterator<Item = &NodeType> {
        self.nodes.iter().filter(|n| !n.is_to_many())
    }

    pub fn ref_nodes(&self) -> impl Iterator<Item = &NodeType> {
        self.nodes.iter().filter(|n| n.is_ref())
    }

    pub fn to_many_nodes(&self) -> impl Iterator<Item = &NodeType> {
        self.nodes.iter().filter(|n| n.is_to_many())
    }
}

/// Builder for [`EntityType`].
#[derive(Debug)]
pub struct EntityTypeBuilder {
    name: String,
    key_node: String,
    lock_node: Option<String>,
    nodes: Vec<NodeType>,
}

impl EntityTypeBuilder {
    fn new(name: impl Into<String>, key_node: impl Into<String>) -> Self {
        let key_node = key_node.into();
        Self {
            name: name.into(),
            nodes: vec![NodeType {
                name: key_node.clone(),
                kind: NodeKind::Value,
            }],
            key_node,
            lock_node: None,
        }
    }

    fn push(mut self, name: impl Into<String>, kind: NodeKind) -> Self {
        self.nodes.push(NodeType {
            name: name.into(),
            kind,
        });
        self
    }

    /// Declare the optimistic-lock value node.
    #[must_use]
    pub fn lock(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.lock_node = Some(name.clone());
        self.push(name, NodeKind::Value)
    }

    #[must_use]
    pub fn value(self, name: impl Into<String>) -> Self {
        self.push(name, NodeKind::Value)
    }

    /// Declare a single reference with the given relation strength.
    #[must_use]
    pub fn reference(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        relation: Relation,
    ) -> Self {
        self.push(
            name,
            NodeKind::Ref {
                target: target.into(),
                relation,
            },
        )
    }

    #[must_use]
    pub fn owns(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.reference(name, target, Relation::Owns)
    }

    #[must_use]
    pub fn depends_on(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.reference(name, target, Relation::DependsOn)
    }

    #[must_use]
    pub fn refers(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.reference(name, target, Relation::Refers)
    }

    /// Declare a to-many relation.
    #[must_use]
    pub fn to_many(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_node: impl Into<String>,
        relation: Relation,
    ) -> Self {
        self.push(
            name,
            NodeKind::ToMany {
                target: target.into(),
                foreign_node: foreign_node.into(),
                join_property: None,
                relation,
            },
        )
    }

    /// Declare a to-many relation through a join entity.
    ///
    /// `join_property` is the reference node on the join entity pointing at
    /// the far side; fetching the relation also loads those targets.
    #[must_use]
    pub fn to_many_via(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_node: impl Into<String>,
        join_property: impl Into<String>,
        relation: Relation,
    ) -> Self {
        self.push(
            name,
            NodeKind::ToMany {
                target: target.into(),
                foreign_node: foreign_node.into(),
                join_property: Some(join_property.into()),
                relation,
            },
        )
    }

    #[must_use]
    pub fn owns_many(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_node: impl Into<String>,
    ) -> Self {
        self.to_many(name, target, foreign_node, Relation::Owns)
    }

    #[must_use]
    pub fn depends_on_many(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_node: impl Into<String>,
    ) -> Self {
        self.to_many(name, target, foreign_node, Relation::DependsOn)
    }

    #[must_use]
    pub fn refers_many(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_node: impl Into<String>,
    ) -> Self {
        self.to_many(name, target, foreign_node, Relation::Refers)
    }

    /// Validate names locally and produce the entity type.
    pub fn build(self) -> Result<EntityType> {
        if !is_valid_identifier(&self.name) {
            return Err(invalid(format!("invalid entity type name '{}'", self.name)));
        }
        let mut index = HashMap::with_capacity(self.nodes.len());
        for (i, node) in self.nodes.iter().enumerate() {
            if !is_valid_identifier(&node.name) {
                return Err(invalid(format!(
                    "invalid node name '{}' on {}",
                    node.name, self.name
                )));
            }
            if index.insert(node.name.clone(), i).is_some() {
                return Err(invalid(format!(
                    "duplicate node '{}' on {}",
                    node.name, self.name
                )));
            }
        }
        Ok(EntityType {
            name: self.name,
            key_node: self.key_node,
            lock_node: self.lock_node,
            nodes: self.nodes,
            index,
        })
    }
}

fn invalid(message: String) -> Error {
    Error::schema(SchemaErrorKind::Invalid, message)
}

/// Registry of entity types by name.
#[derive(Debug, Clone, Default)]
pub struct Definitions {
    types: BTreeMap<String, Arc<EntityType>>,
}

impl Definitions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity type. Cross-type checks run in [`Definitions::validate`].
    pub fn register(&mut self, entity_type: EntityType) -> Result<Arc<EntityType>> {
        if self.types.contains_key(entity_type.name()) {
            return Err(invalid(format!(
                "entity type '{}' registered twice",
                entity_type.name()
            )));
        }
        tracing::trace!(
            entity_type = %entity_type.name(),
            nodes = entity_type.nodes().len(),
            "Registered entity type"
        );
        let entity_type = Arc::new(entity_type);
        self.types
            .insert(entity_type.name().to_string(), Arc::clone(&entity_type));
        Ok(entity_type)
    }

    /// Register several types and validate the whole registry.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn from_types(types: impl IntoIterator<Item = EntityType>) -> Result<Self> {
        let mut defs = Self::new();
        for t in types {
            defs.register(t)?;
        }
        if let Err(e) = defs.validate() {
            tracing::warn!(error = %e, "Rejected entity definitions");
            return Err(e);
        }
        tracing::debug!(types = defs.types.len(), "Validated entity definitions");
        Ok(defs)
    }

    /// Check every relation target and foreign node.
    pub fn validate(&self) -> Result<()> {
        for entity_type in self.types.values() {
            for node in entity_type.nodes() {
                match &node.kind {
                    NodeKind::Value => {}
                    NodeKind::Ref { target, .. } => {
                        self.get(target)?;
                    }
                    NodeKind::ToMany {
                        target,
                        foreign_node,
                        join_property,
                        ..
                    } => {
                        let target_type = self.get(target)?;
                        match target_type.node(foreign_node).map(|n| &n.kind) {
                            Some(NodeKind::Ref { target: back, .. }) if back == entity_type.name() => {}
                            _ => {
                                return Err(invalid(format!(
                                    "{}.{}: '{}' is not a reference from {} back to {}",
                                    entity_type.name(),
                                    node.name,
                                    foreign_node,
                                    target,
                                    entity_type.name()
                                )));
                            }
                        }
                        if let Some(join) = join_property {
                            if !target_type.node(join).is_some_and(NodeType::is_ref) {
                                return Err(invalid(format!(
                                    "{}.{}: join property '{}' is not a reference on {}",
                                    entity_type.name(),
                                    node.name,
                                    join,
                                    target
                                )));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Look up an entity type by name.
    pub fn get(&self, name: &str) -> Result<&Arc<EntityType>> {
        self.types.get(name).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::TypeNotFound,
                format!("unknown entity type '{}'", name),
            )
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EntityType>> {
        self.types.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_types() -> Vec<EntityType> {
        vec![
            EntityType::builder("Customer", "id")
                .lock("modified_at")
                .value("name")
                .build()
                .unwrap(),
            EntityType::builder("Order", "id")
                .lock("modified_at")
                .depends_on("customer", "Customer")
                .owns_many("lines", "OrderLine", "order")
                .build()
                .unwrap(),
            EntityType::builder("OrderLine", "id")
                .refers("order", "Order")
                .value("qty")
                .build()
                .unwrap(),
        ]
    }

    #[test]
    fn test_builder_declares_key_and_lock_nodes() {
        let t = EntityType::builder("Customer", "id")
            .lock("modified_at")
            .value("name")
            .build()
            .unwrap();
        assert_eq!(t.key_node(), "id");
        assert_eq!(t.lock_node(), Some("modified_at"));
        assert!(t.node("id").unwrap().is_value());
        assert_eq!(t.node_index("name"), Some(2));
        assert_eq!(t.column_nodes().count(), 3);
    }

    #[test]
    fn test_duplicate_and_invalid_names_rejected() {
        assert!(
            EntityType::builder("A", "id")
                .value("x")
                .value("x")
                .build()
                .is_err()
        );
        assert!(EntityType::builder("bad name", "id").build().is_err());
    }

    #[test]
    fn test_registry_validates_relations() {
        let defs = Definitions::from_types(order_types()).unwrap();
        assert_eq!(defs.len(), 3);
        let order = defs.get("Order").unwrap();
        let lines = order.node("lines").unwrap();
        assert_eq!(lines.relation(), Some(Relation::Owns));
        assert_eq!(lines.target(), Some("OrderLine"));
    }

    #[test]
    fn test_registry_rejects_unknown_target() {
        let t = EntityType::builder("Order", "id")
            .owns("customer", "Nope")
            .build()
            .unwrap();
        let err = Definitions::from_types([t]).unwrap_err();
        assert!(matches!(err, Error::Schema(ref s) if s.kind == SchemaErrorKind::TypeNotFound));
    }

    #[test]
    fn test_registry_rejects_bad_foreign_node() {
        let types = vec![
            EntityType::builder("Order", "id")
                .owns_many("lines", "OrderLine", "parent")
                .build()
                .unwrap(),
            EntityType::builder("OrderLine", "id")
                .refers("order", "Order")
                .build()
                .unwrap(),
        ];
        assert!(Definitions::from_types(types).is_err());
    }
}
