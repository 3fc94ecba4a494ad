mod support;

use entigraph::prelude::*;
use support::{seed_order, setup};

#[test]
fn persisted_changes_are_written_to_the_audit_log() {
    let (db, env) = setup();
    seed_order(&db);
    let mut ctx = EntityContext::new(&env);
    let customer = ctx.load("Customer", &Value::BigInt(1)).unwrap().unwrap();
    ctx.set_value(customer, "name", "Grace").unwrap();

    let summary = ctx.persist(&PersistRequest::new().save(customer)).unwrap();
    assert_eq!(db.audit_records(), summary.audit);

    let record = &summary.audit[0];
    assert_eq!(record.entity_type, "Customer");
    assert_eq!(record.entity_key, Value::BigInt(1));
    let name = record.change_for("name").unwrap();
    assert_eq!(name.old, Value::from("Ada"));
    assert_eq!(name.new, Value::from("Grace"));
    let version = record.change_for("version").unwrap();
    assert_eq!(version.old, Value::Timestamp(1));
    assert_eq!(Some(&version.new), summary.lock_token.as_ref());

    let json = serde_json::to_string(&summary.audit).unwrap();
    assert!(json.contains("Grace"));
}

#[test]
fn audit_log_can_be_switched_off_by_config() {
    let (db, env) = setup();
    seed_order(&db);
    let config = PersistConfig::from_json(r#"{ "audit": false }"#).unwrap();
    let env = env.with_config(config);
    let mut ctx = EntityContext::new(&env);
    let customer = ctx.load("Customer", &Value::BigInt(1)).unwrap().unwrap();
    ctx.set_value(customer, "name", "Grace").unwrap();

    let summary = ctx.persist(&PersistRequest::new().save(customer)).unwrap();
    assert_eq!(summary.updated, vec![customer]);
    assert!(!summary.audit.is_empty());
    assert!(db.audit_records().is_empty());
}

#[test]
fn compare_with_database_is_a_dry_run() {
    let (db, env) = setup();
    seed_order(&db);
    let mut ctx = EntityContext::new(&env);
    let customer = ctx.load("Customer", &Value::BigInt(1)).unwrap().unwrap();
    ctx.set_value(customer, "name", "Grace").unwrap();

    let records = Persister::new(&mut ctx)
        .compare_with_database(&PersistRequest::new().update(customer))
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].change_for("name").unwrap().new,
        Value::from("Grace")
    );

    assert!(db.write_log().is_empty());
    assert_eq!(db.commit_count(), 0);
    assert!(!ctx.in_transaction());
    assert!(
        ctx.entity(customer)
            .unwrap()
            .value_node("name")
            .unwrap()
            .is_modified()
    );
}
