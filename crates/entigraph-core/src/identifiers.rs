//! Entity identities and definition-name validation.
//!
//! `EntityId` is the process-wide stable identifier of an entity. It is
//! allocated once when an entity is first created and preserved when the
//! entity is copied between contexts, so copies can be matched back to
//! their originals without comparing keys.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ENTITY_ID: AtomicU64 = AtomicU64::new(1);

/// Stable, process-local identifier of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    /// Allocate a fresh id, never returned before in this process.
    pub fn next() -> Self {
        EntityId(NEXT_ENTITY_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw id value.
    pub const fn from_raw(raw: u64) -> Self {
        EntityId(raw)
    }

    /// The raw id value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

fn identifier_regex() -> Option<&'static Regex> {
    static IDENT: OnceLock<Option<Regex>> = OnceLock::new();
    IDENT
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok())
        .as_ref()
}

/// Check whether a name is usable as an entity type or node name.
///
/// ```
/// use entigraph_core::is_valid_identifier;
///
/// assert!(is_valid_identifier("order_line"));
/// assert!(!is_valid_identifier("9lives"));
/// assert!(!is_valid_identifier("a-b"));
/// ```
pub fn is_valid_identifier(name: &str) -> bool {
    identifier_regex().is_some_and(|re| re.is_match(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_ids_are_unique_and_increasing() {
        let a = EntityId::next();
        let b = EntityId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_entity_id_display() {
        assert_eq!(EntityId::from_raw(12).to_string(), "#12");
        assert_eq!(EntityId::from_raw(12).as_u64(), 12);
    }

    #[test]
    fn test_identifier_validation() {
        assert!(is_valid_identifier("Account"));
        assert!(is_valid_identifier("_hidden"));
        assert!(is_valid_identifier("line2"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("two words"));
        assert!(!is_valid_identifier("drop;table"));
    }
}
