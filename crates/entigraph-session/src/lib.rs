//! Entity context, persist analysis and transactional persistence for entigraph.
//!
//! `entigraph-session` is the **unit-of-work layer**. It keeps an in-memory
//! graph of entities, works out which of them a request has to write and in
//! what order, and writes them in one transaction.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: [`EntityContext`] holds one [`Entity`] per id and per
//!   `(type, key)`, plus an index of who references whom.
//! - **Planning**: [`PersistAnalyser`] classifies every entity reachable from
//!   a [`PersistRequest`] into create, update, delete and depends-on groups.
//! - **Auditing**: [`AuditEngine`] diffs entities against the database,
//!   drops unchanged updates and propagates optimistic locks to owners.
//! - **Execution**: [`Persister`] validates, batches, writes and commits,
//!   then merges the result back into the caller's context.
//!
//! # Design Philosophy
//!
//! - **Ids, not pointers**: references are [`EntityId`](entigraph_core::EntityId)s
//!   resolved through the context, so cycles need no special handling.
//! - **Copy, then mutate**: a persist attempt works on a deep copy; the
//!   caller's graph only changes after a successful commit.
//! - **Explicit transactions**: the active connection lives in the context's
//!   resource slot and is shared between contexts only by an explicit join.
//!
//! # Example
//!
//! ```ignore
//! let mut ctx = EntityContext::new(&env);
//! let order = ctx.create("Order")?;
//! ctx.set_value(order, "status", "open")?;
//! let line = ctx.create("OrderLine")?;
//! ctx.add_to_many(order, "lines", line)?;
//!
//! let summary = ctx.persist(&PersistRequest::new().save(order))?;
//! assert_eq!(summary.created.len(), 2);
//! ```

pub mod analyser;
pub mod audit;
pub mod batch;
pub mod context;
pub mod copy;
pub mod entity;
pub mod environment;
pub mod fetch;
pub mod group;
pub mod lock;
pub mod node;
pub mod persister;
pub mod request;
pub mod resources;
pub mod snapshot;

#[cfg(test)]
mod test_support;

pub use analyser::{PersistAnalyser, PersistGroups};
pub use audit::{AuditEngine, AuditTrail, diff_entity};
pub use batch::{build_batches, classify_failure, execute_batches};
pub use context::{ContextMode, EntityContext, RefHolder, Removal};
pub use entity::{DbPresence, Entity, EntityConstraint, EntityState};
pub use environment::{Environment, PersistConfig};
pub use group::OperationGroup;
pub use lock::next_lock_token;
pub use node::{Node, NodeValue, RefNode, ToManyNode, ValueNode};
pub use persister::{PersistSummary, Persister};
pub use request::PersistRequest;
pub use resources::{Resources, SharedConnection, TRANSACTION};
pub use snapshot::DatabaseSnapshot;
