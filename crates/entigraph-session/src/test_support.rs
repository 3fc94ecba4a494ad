//! Shared fixtures for unit tests.

use crate::environment::Environment;
use entigraph_core::{Definitions, EntityType};
use entigraph_memory::MemoryDatabase;
use std::sync::Arc;

/// Customers, orders with owned lines, and invoices owning their customer.
pub(crate) fn definitions() -> Arc<Definitions> {
    let types = vec![
        EntityType::builder("Customer", "id")
            .lock("modified_at")
            .value("name")
            .build()
            .unwrap(),
        EntityType::builder("Order", "id")
            .lock("modified_at")
            .value("status")
            .depends_on("customer", "Customer")
            .owns_many("lines", "OrderLine", "order")
            .build()
            .unwrap(),
        EntityType::builder("OrderLine", "id")
            .refers("order", "Order")
            .value("product")
            .value("qty")
            .build()
            .unwrap(),
        EntityType::builder("Invoice", "id")
            .lock("modified_at")
            .owns("billed_to", "Customer")
            .value("total")
            .build()
            .unwrap(),
    ];
    Arc::new(Definitions::from_types(types).unwrap())
}

/// Environment over a fresh, empty database.
pub(crate) fn environment() -> Environment {
    database_and_environment().1
}

pub(crate) fn database_and_environment() -> (MemoryDatabase, Environment) {
    let defs = definitions();
    let db = MemoryDatabase::new(Arc::clone(&defs));
    let env = Environment::new(defs, Arc::new(db.clone()), Arc::new(db.clone()));
    (db, env)
}
