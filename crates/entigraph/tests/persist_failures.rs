mod support;

use entigraph::prelude::*;
use entigraph::{DbPresence, EntityConstraint, WriteKind};
use support::{seed_order, setup};

#[test]
fn stale_lock_fails_and_leaves_the_caller_untouched() {
    let (db, env) = setup();
    seed_order(&db);
    let mut ctx = EntityContext::new(&env);
    let customer = ctx.load("Customer", &Value::BigInt(1)).unwrap().unwrap();
    ctx.set_value(customer, "name", "Grace").unwrap();
    db.set_value("Customer", &Value::BigInt(1), "version", Value::Timestamp(2))
        .unwrap();

    let err = ctx
        .persist(&PersistRequest::new().update(customer))
        .unwrap_err();
    assert!(err.is_optimistic_lock());
    let Error::Persist(p) = err else {
        panic!("expected a persist error");
    };
    let entity = p.entity.unwrap();
    assert_eq!(entity.id, customer);
    assert!(entity
        .values
        .contains(&("name".to_string(), Value::from("Grace"))));
    let stored = p.database_entity.unwrap();
    assert_eq!(stored.optimistic_lock, Some(Value::Timestamp(2)));

    let caller = ctx.entity(customer).unwrap();
    assert_eq!(caller.get("name"), Some(&Value::from("Grace")));
    assert!(caller.value_node("name").unwrap().is_modified());
    assert_eq!(
        db.row("Customer", &Value::BigInt(1))
            .unwrap()
            .get_by_name("name"),
        Some(&Value::from("Ada"))
    );
    assert_eq!(db.rollback_count(), 1);
    assert_eq!(db.commit_count(), 0);
}

#[test]
fn updating_a_concurrently_deleted_row_reports_it_missing() {
    let (db, env) = setup();
    seed_order(&db);
    let mut ctx = EntityContext::new(&env);
    let customer = ctx.load("Customer", &Value::BigInt(1)).unwrap().unwrap();
    ctx.set_value(customer, "name", "Grace").unwrap();
    assert!(db.remove_row("Customer", &Value::BigInt(1)));

    let err = ctx
        .persist(&PersistRequest::new().update(customer))
        .unwrap_err();
    assert!(err.is_entity_missing());
    assert!(db.write_log().is_empty());
    assert!(ctx.contains(customer));
}

#[test]
fn inserting_an_existing_key_reports_the_collision() {
    let (db, env) = setup();
    seed_order(&db);
    let mut ctx = EntityContext::new(&env);
    let customer = ctx
        .new_entity("Customer", Some(Value::BigInt(1)), EntityConstraint::none())
        .unwrap();
    assert_eq!(ctx.entity(customer).unwrap().presence(), DbPresence::Unknown);

    let err = ctx
        .persist(&PersistRequest::new().insert(customer))
        .unwrap_err();
    assert!(err.is_primary_key_exists());
    assert_eq!(db.row_count("Customer"), 1);
    // presence was only resolved on the working copy
    assert_eq!(ctx.entity(customer).unwrap().presence(), DbPresence::Unknown);
}

#[test]
fn failed_update_rolls_back_earlier_inserts() {
    let (db, env) = setup();
    seed_order(&db);
    db.fail_on(WriteKind::Update, "Order", Value::BigInt(10));
    let mut ctx = EntityContext::new(&env);
    let order = ctx.load("Order", &Value::BigInt(10)).unwrap().unwrap();
    let customer = ctx.create("Customer").unwrap();
    ctx.set_value(customer, "name", "Grace").unwrap();
    ctx.set_reference(order, "customer", Some(customer)).unwrap();
    ctx.set_value(order, "status", "shipped").unwrap();

    let err = ctx.persist(&PersistRequest::new().save(order)).unwrap_err();
    assert_eq!(err.persist_kind(), Some(PersistErrorKind::WriteFailed));
    assert_eq!(db.row_count("Customer"), 1);
    assert!(db.write_log().is_empty());
    assert_eq!(
        db.row("Order", &Value::BigInt(10))
            .unwrap()
            .get_by_name("status"),
        Some(&Value::from("open"))
    );

    assert!(ctx.entity(customer).unwrap().key().is_none());
    let caller_order = ctx.entity(order).unwrap();
    assert!(caller_order.value_node("status").unwrap().is_modified());
    assert_eq!(caller_order.reference("customer").unwrap(), Some(customer));
}

#[test]
fn failure_inside_caller_transaction_releases_it() {
    let (db, env) = setup();
    seed_order(&db);
    let mut ctx = EntityContext::new(&env);
    let customer = ctx.load("Customer", &Value::BigInt(1)).unwrap().unwrap();
    ctx.set_value(customer, "name", "Grace").unwrap();
    db.set_value("Customer", &Value::BigInt(1), "version", Value::Timestamp(2))
        .unwrap();

    ctx.begin_transaction().unwrap();
    let err = ctx
        .persist(&PersistRequest::new().update(customer))
        .unwrap_err();
    assert!(err.is_optimistic_lock());
    assert!(!ctx.in_transaction());
    assert_eq!(db.rollback_count(), 1);
}

#[test]
fn successful_persist_leaves_caller_transaction_open() {
    let (db, env) = setup();
    seed_order(&db);
    let mut ctx = EntityContext::new(&env);
    let customer = ctx.load("Customer", &Value::BigInt(1)).unwrap().unwrap();
    ctx.set_value(customer, "name", "Grace").unwrap();

    ctx.begin_transaction().unwrap();
    ctx.persist(&PersistRequest::new().update(customer))
        .unwrap();
    assert!(ctx.in_transaction());
    assert_eq!(db.commit_count(), 0);
    // not visible until the caller commits
    assert_eq!(
        db.row("Customer", &Value::BigInt(1))
            .unwrap()
            .get_by_name("name"),
        Some(&Value::from("Ada"))
    );

    ctx.commit().unwrap();
    assert_eq!(db.commit_count(), 1);
    assert_eq!(
        db.row("Customer", &Value::BigInt(1))
            .unwrap()
            .get_by_name("name"),
        Some(&Value::from("Grace"))
    );
}
