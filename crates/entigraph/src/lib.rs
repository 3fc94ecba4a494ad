//! Entigraph - object-graph persistence with dependency-ordered writes.
//!
//! Entigraph takes a graph of interlinked entities that should be inserted,
//! updated, saved or deleted and turns it into one transaction of batched
//! writes:
//!
//! - Entities reachable from the request are classified by relation strength
//!   (owns, depends-on, refers)
//! - Inserts go parent-first, deletes child-first, and same-type writes are
//!   batched together
//! - Optimistic locks are checked before writing and propagated from owned
//!   lock-less entities to their owners
//! - Every real change is recorded in an audit trail
//!
//! # Quick Start
//!
//! ```ignore
//! use entigraph::prelude::*;
//! use std::sync::Arc;
//!
//! let definitions = Arc::new(Definitions::from_types([
//!     EntityType::builder("Order", "id")
//!         .lock("modified_at")
//!         .value("status")
//!         .owns_many("lines", "OrderLine", "order")
//!         .build()?,
//!     EntityType::builder("OrderLine", "id")
//!         .refers("order", "Order")
//!         .value("qty")
//!         .build()?,
//! ])?);
//! let db = MemoryDatabase::new(Arc::clone(&definitions));
//! let env = Environment::new(definitions, Arc::new(db.clone()), Arc::new(db));
//!
//! let mut ctx = EntityContext::new(&env);
//! let order = ctx.create("Order")?;
//! let line = ctx.create("OrderLine")?;
//! ctx.set_value(line, "qty", 2i64)?;
//! ctx.add_to_many(order, "lines", line)?;
//! ctx.persist(&PersistRequest::new().save(order))?;
//! ```

pub use entigraph_core as core;
pub use entigraph_memory as memory;
pub use entigraph_session as session;

pub use entigraph_core::{
    AccessControl, AllowAll, AuditRecord, BatchFailure, Change, Connection, ContextErrorKind,
    DataSource, Definitions, EntityId, EntitySnapshot, EntityType, EntityTypeBuilder, Error,
    NodeKind, NodeType, Operation, PersistError, PersistErrorKind, Relation, Result, Row,
    RowQuery, SequenceGenerator, Value, WriteBatch, WriteKind, WriteRow,
};
pub use entigraph_memory::{MemoryConnection, MemoryDatabase, WriteLogEntry};
pub use entigraph_session::{
    AuditTrail, ContextMode, DatabaseSnapshot, DbPresence, Entity, EntityConstraint,
    EntityContext, EntityState, Environment, OperationGroup, PersistAnalyser, PersistConfig,
    PersistGroups, PersistRequest, PersistSummary, Persister, Removal,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use entigraph::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // Definitions
        Definitions,
        EntityType,
        Relation,
        // Context
        EntityContext,
        EntityId,
        Environment,
        PersistConfig,
        // Persisting
        PersistRequest,
        PersistSummary,
        Persister,
        // Storage
        MemoryDatabase,
        // Errors and values
        Error,
        PersistErrorKind,
        Result,
        Value,
    };
}
