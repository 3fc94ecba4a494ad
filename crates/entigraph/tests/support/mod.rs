#![allow(dead_code)]

use entigraph::prelude::*;
use std::sync::Arc;

/// Customers own an address; orders depend on a customer, own their lines
/// and depend on their tags; invoices own the customer they bill.
pub fn definitions() -> Arc<Definitions> {
    let types = vec![
        EntityType::builder("Customer", "id")
            .lock("version")
            .value("name")
            .owns("address", "Address")
            .build()
            .unwrap(),
        EntityType::builder("Address", "id")
            .value("street")
            .build()
            .unwrap(),
        EntityType::builder("Order", "id")
            .lock("version")
            .value("status")
            .depends_on("customer", "Customer")
            .owns_many("lines", "OrderLine", "order")
            .depends_on_many("tags", "Tag", "order")
            .build()
            .unwrap(),
        EntityType::builder("OrderLine", "id")
            .refers("order", "Order")
            .value("product")
            .value("qty")
            .build()
            .unwrap(),
        EntityType::builder("Tag", "id")
            .refers("order", "Order")
            .value("label")
            .build()
            .unwrap(),
        EntityType::builder("Invoice", "id")
            .lock("version")
            .owns("billed_to", "Customer")
            .value("total")
            .build()
            .unwrap(),
    ];
    Arc::new(Definitions::from_types(types).unwrap())
}

pub fn setup() -> (MemoryDatabase, Environment) {
    let definitions = definitions();
    let db = MemoryDatabase::new(Arc::clone(&definitions));
    let env = Environment::new(definitions, Arc::new(db.clone()), Arc::new(db.clone()));
    (db, env)
}

/// Customer 1, order 10 with lines 100 and 101, tag 200 on the order.
pub fn seed_order(db: &MemoryDatabase) {
    db.seed(
        "Customer",
        [
            ("id", Value::BigInt(1)),
            ("version", Value::Timestamp(1)),
            ("name", Value::from("Ada")),
        ],
    )
    .unwrap();
    db.seed(
        "Order",
        [
            ("id", Value::BigInt(10)),
            ("version", Value::Timestamp(1)),
            ("status", Value::from("open")),
            ("customer", Value::BigInt(1)),
        ],
    )
    .unwrap();
    for (id, product) in [(100, "tea"), (101, "cake")] {
        db.seed(
            "OrderLine",
            [
                ("id", Value::BigInt(id)),
                ("order", Value::BigInt(10)),
                ("product", Value::from(product)),
                ("qty", Value::BigInt(1)),
            ],
        )
        .unwrap();
    }
    db.seed(
        "Tag",
        [
            ("id", Value::BigInt(200)),
            ("order", Value::BigInt(10)),
            ("label", Value::from("gift")),
        ],
    )
    .unwrap();
}

/// A new order for a new customer, with one line per product.
pub fn new_order(ctx: &mut EntityContext, products: &[&str]) -> (EntityId, EntityId, Vec<EntityId>) {
    let customer = ctx.create("Customer").unwrap();
    ctx.set_value(customer, "name", "Grace").unwrap();
    let order = ctx.create("Order").unwrap();
    ctx.set_value(order, "status", "open").unwrap();
    ctx.set_reference(order, "customer", Some(customer)).unwrap();
    let lines = products
        .iter()
        .map(|product| {
            let line = ctx.create("OrderLine").unwrap();
            ctx.set_value(line, "product", *product).unwrap();
            ctx.set_value(line, "qty", 1i64).unwrap();
            ctx.add_to_many(order, "lines", line).unwrap();
            line
        })
        .collect();
    (customer, order, lines)
}
