//! Database snapshot: current rows of the entities a persist attempt touches.

use crate::analyser::PersistGroups;
use crate::context::EntityContext;
use crate::entity::Entity;
use crate::node::NodeValue;
use entigraph_core::{
    EntityId, EntitySnapshot, EntityType, Error, PersistError, PersistErrorKind, Result, Row,
    RowQuery, Value,
};
use std::collections::{BTreeMap, HashMap};

/// Rows loaded from the database, keyed by entity type and key.
#[derive(Debug, Clone, Default)]
pub struct DatabaseSnapshot {
    rows: HashMap<(String, u64), Vec<(Value, Row)>>,
    queries: usize,
}

impl DatabaseSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the rows of every keyed update, delete and depends-on entity
    /// with one `In` query per entity type.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn load(ctx: &EntityContext, groups: &PersistGroups) -> Result<Self> {
        let ids = groups
            .update
            .iter()
            .chain(groups.delete.iter())
            .chain(groups.depends_on.iter());
        Self::load_entities(ctx, ids)
    }

    /// Load the rows of the given entities.
    pub fn load_entities(
        ctx: &EntityContext,
        ids: impl IntoIterator<Item = EntityId>,
    ) -> Result<Self> {
        let mut by_type: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for id in ids {
            let entity = ctx.entity(id)?;
            if entity.is_clearly_not_in_db() {
                continue;
            }
            if let Some(key) = entity.key() {
                let keys = by_type.entry(entity.type_name().to_string()).or_default();
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }

        let mut snapshot = Self::new();
        for (type_name, keys) in by_type {
            let ty = ctx.environment().entity_type(&type_name)?;
            let query = RowQuery::new(type_name.as_str()).in_list(ty.key_node(), keys);
            let rows = ctx.with_connection(|c| c.query(&query))?;
            snapshot.queries += 1;
            for row in rows {
                snapshot.insert(ty, row);
            }
        }
        tracing::debug!(
            rows = snapshot.len(),
            queries = snapshot.queries,
            "Loaded database snapshot"
        );
        Ok(snapshot)
    }

    /// Add a row of the given type.
    pub fn insert(&mut self, entity_type: &EntityType, row: Row) {
        let key = row
            .get_by_name(entity_type.key_node())
            .cloned()
            .unwrap_or(Value::Null);
        let slot = self
            .rows
            .entry((entity_type.name().to_string(), key.key_hash()))
            .or_default();
        slot.retain(|(k, _)| *k != key);
        slot.push((key, row));
    }

    /// The database row of this type and key.
    pub fn row(&self, entity_type: &str, key: &Value) -> Option<&Row> {
        self.rows
            .get(&(entity_type.to_string(), key.key_hash()))?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, row)| row)
    }

    /// The database row of an entity.
    pub fn row_for(&self, entity: &Entity) -> Option<&Row> {
        self.row(entity.type_name(), entity.key()?)
    }

    pub fn len(&self) -> usize {
        self.rows.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Check that every update, delete and depends-on entity still exists and
    /// carries the lock value it was loaded with.
    pub fn validate(&self, ctx: &EntityContext, groups: &PersistGroups, check_depends_on: bool) -> Result<()> {
        let depends_on = groups.depends_on.iter().filter(|_| check_depends_on);
        for id in groups
            .update
            .iter()
            .chain(groups.delete.iter())
            .chain(depends_on)
        {
            self.validate_entity(ctx.entity(id)?)?;
        }
        Ok(())
    }

    fn validate_entity(&self, entity: &Entity) -> Result<()> {
        let Some(row) = self.row_for(entity) else {
            return Err(Error::Persist(
                PersistError::new(
                    PersistErrorKind::EntityMissing,
                    format!("{} no longer exists in the database", entity),
                )
                .with_entity(entity.snapshot()),
            ));
        };
        let Some(lock) = entity.entity_type().lock_node() else {
            return Ok(());
        };
        let NodeValue::Value(expected) = entity.value_node(lock)?.loaded_value() else {
            return Ok(());
        };
        let stored = row.get_by_name(lock).unwrap_or(&Value::Null);
        if stored != expected {
            tracing::debug!(
                entity = %entity,
                expected = %expected,
                stored = %stored,
                "Optimistic lock mismatch"
            );
            return Err(lock_mismatch(entity, row));
        }
        Ok(())
    }
}

/// Optimistic-lock failure naming both sides.
pub(crate) fn lock_mismatch(entity: &Entity, row: &Row) -> Error {
    Error::Persist(
        PersistError::new(
            PersistErrorKind::OptimisticLockMismatch,
            format!("{} was modified concurrently", entity),
        )
        .with_entity(entity.snapshot())
        .with_database_entity(row_snapshot(entity.id(), entity.entity_type(), row)),
    )
}

/// Detached view of a database row, under the id of the entity it belongs to.
pub(crate) fn row_snapshot(id: EntityId, entity_type: &EntityType, row: &Row) -> EntitySnapshot {
    let values = entity_type
        .nodes()
        .iter()
        .filter(|n| n.is_value())
        .filter_map(|n| row.get_by_name(&n.name).map(|v| (n.name.clone(), v.clone())))
        .collect();
    EntitySnapshot {
        id,
        entity_type: entity_type.name().to_string(),
        key: row.get_by_name(entity_type.key_node()).cloned(),
        optimistic_lock: entity_type
            .lock_node()
            .and_then(|lock| row.get_by_name(lock).cloned()),
        values,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyser::PersistAnalyser;
    use crate::request::PersistRequest;
    use crate::test_support::database_and_environment;

    #[test]
    fn test_load_uses_one_query_per_type() {
        let (db, env) = database_and_environment();
        for id in 1..=3 {
            db.seed("Customer", [("id", Value::BigInt(id))]).unwrap();
        }
        let mut ctx = EntityContext::new(&env);
        let ids: Vec<EntityId> = (1..=3)
            .map(|id| ctx.load("Customer", &Value::BigInt(id)).unwrap().unwrap())
            .collect();
        let before = db.query_count();

        let snapshot = DatabaseSnapshot::load_entities(&ctx, ids.iter().copied()).unwrap();
        assert_eq!(db.query_count() - before, 1);
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.row("Customer", &Value::BigInt(2)).is_some());
        assert!(snapshot.row("Customer", &Value::from("2")).is_none());
    }

    #[test]
    fn test_validate_reports_missing_entity() {
        let (db, env) = database_and_environment();
        db.seed("Customer", [("id", Value::BigInt(1))]).unwrap();
        let mut ctx = EntityContext::new(&env);
        let customer = ctx.load("Customer", &Value::BigInt(1)).unwrap().unwrap();
        ctx.set_value(customer, "name", "Grace").unwrap();
        db.remove_row("Customer", &Value::BigInt(1));

        let mut analyser = PersistAnalyser::new();
        analyser
            .analyse(&mut ctx, &PersistRequest::new().update(customer))
            .unwrap();
        let snapshot = DatabaseSnapshot::load(&ctx, analyser.groups()).unwrap();
        let err = snapshot.validate(&ctx, analyser.groups(), true).unwrap_err();
        assert!(err.is_entity_missing());
    }

    #[test]
    fn test_validate_reports_lock_mismatch_with_both_sides() {
        let (db, env) = database_and_environment();
        db.seed(
            "Customer",
            [("id", Value::BigInt(1)), ("modified_at", Value::Timestamp(5))],
        )
        .unwrap();
        let mut ctx = EntityContext::new(&env);
        let customer = ctx.load("Customer", &Value::BigInt(1)).unwrap().unwrap();
        db.set_value("Customer", &Value::BigInt(1), "modified_at", Value::Timestamp(9))
            .unwrap();

        let mut analyser = PersistAnalyser::new();
        analyser
            .analyse(&mut ctx, &PersistRequest::new().update(customer))
            .unwrap();
        let snapshot = DatabaseSnapshot::load(&ctx, analyser.groups()).unwrap();
        let err = snapshot.validate(&ctx, analyser.groups(), true).unwrap_err();
        assert!(err.is_optimistic_lock());
        let Error::Persist(p) = err else {
            panic!("expected a persist error");
        };
        assert_eq!(
            p.entity.unwrap().optimistic_lock,
            Some(Value::Timestamp(5))
        );
        assert_eq!(
            p.database_entity.unwrap().optimistic_lock,
            Some(Value::Timestamp(9))
        );
    }
}
