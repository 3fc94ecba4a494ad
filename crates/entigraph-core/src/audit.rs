//! Audit records.

use crate::error::{Error, Result};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One node whose value changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub node: String,
    pub old: Value,
    pub new: Value,
}

/// Changes made to one entity by one persist attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub entity_type: String,
    pub entity_key: Value,
    pub changes: Vec<Change>,
}

impl AuditRecord {
    pub fn new(entity_type: impl Into<String>, entity_key: Value) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_key,
            changes: Vec::new(),
        }
    }

    /// Record a change. Each node may change at most once per record.
    pub fn add_change(&mut self, node: impl Into<String>, old: Value, new: Value) -> Result<()> {
        let node = node.into();
        if self.change_for(&node).is_some() {
            return Err(Error::illegal_state(format!(
                "audit record for {}[{}] already has a change for '{}'",
                self.entity_type, self.entity_key, node
            )));
        }
        self.changes.push(Change { node, old, new });
        Ok(())
    }

    pub fn change_for(&self, node: &str) -> Option<&Change> {
        self.changes.iter().find(|c| c.node == node)
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }
}

impl fmt::Display for AuditRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.entity_type, self.entity_key)?;
        for c in &self.changes {
            write!(f, " {}: {} -> {}", c.node, c.old, c.new)?;
        }
        Ok(())
    }
}
