//! Stored entity rows.

use crate::value::Value;

/// One stored entity as a data source returns it: node name to value.
///
/// Reference nodes hold the target key. To-many nodes have no column.
/// A node missing from the row was not selected, which is different from
/// a `Value::Null` column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    nodes: Vec<(String, Value)>,
}

impl Row {
    /// Build a row from `(node, value)` pairs. A repeated node keeps its last value.
    pub fn from_pairs<K, I>(pairs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let mut row = Row::default();
        for (name, value) in pairs {
            row.set(name.into(), value);
        }
        row
    }

    fn set(&mut self, name: String, value: Value) {
        match self.nodes.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => self.nodes.push((name, value)),
        }
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.nodes.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.nodes.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unselected_node_differs_from_null() {
        let row = Row::from_pairs([("id", Value::BigInt(7)), ("address", Value::Null)]);
        assert_eq!(row.get_by_name("address"), Some(&Value::Null));
        assert_eq!(row.get_by_name("name"), None);
    }

    #[test]
    fn test_repeated_node_keeps_last_value() {
        let row = Row::from_pairs([
            ("id", Value::BigInt(1)),
            ("name", Value::from("Ada")),
            ("name", Value::from("Grace")),
        ]);
        assert_eq!(row.len(), 2);
        assert_eq!(row.get_by_name("name"), Some(&Value::from("Grace")));
        let names: Vec<&str> = row.iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["id", "name"]);
    }
}
