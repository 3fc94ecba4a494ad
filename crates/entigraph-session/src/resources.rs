//! Transaction-scoped resource bag.

use crate::context::EntityContext;
use entigraph_core::{
    Connection, ConnectionError, ConnectionErrorKind, ContextErrorKind, Error, Result,
};
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// Resource key of the active transaction.
pub const TRANSACTION: &str = "entigraph.transaction";

/// A connection held in a context's transaction slot.
pub type SharedConnection = Rc<RefCell<Box<dyn Connection>>>;

/// Named resources shared by contexts joined to the same transaction.
#[derive(Clone, Default)]
pub struct Resources {
    map: HashMap<&'static str, Rc<dyn Any>>,
}

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &'static str, value: Rc<dyn Any>) {
        self.map.insert(key, value);
    }

    /// Typed lookup; `None` when missing or of another type.
    pub fn get<T: 'static>(&self, key: &str) -> Option<Rc<T>> {
        let value = self.map.get(key)?;
        Rc::clone(value).downcast::<T>().ok()
    }

    pub fn remove(&mut self, key: &str) -> Option<Rc<dyn Any>> {
        self.map.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn transaction(&self) -> Option<SharedConnection> {
        self.get::<RefCell<Box<dyn Connection>>>(TRANSACTION)
    }

    pub fn set_transaction(&mut self, connection: SharedConnection) {
        self.set(TRANSACTION, connection);
    }

    /// A resource bag holding only the transaction of this one.
    pub fn join_transaction(&self) -> Self {
        let mut joined = Self::new();
        if let Some(tx) = self.map.get(TRANSACTION) {
            joined.map.insert(TRANSACTION, Rc::clone(tx));
        }
        joined
    }
}

impl fmt::Debug for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resources")
            .field("keys", &self.map.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ============================================================================
// Context transaction slot
// ============================================================================

impl EntityContext {
    pub fn set_resource(&mut self, key: &'static str, value: Rc<dyn Any>) {
        self.resources.set(key, value);
    }

    pub fn resource<T: 'static>(&self, key: &str) -> Option<Rc<T>> {
        self.resources.get(key)
    }

    pub fn remove_resource(&mut self, key: &str) -> Option<Rc<dyn Any>> {
        self.resources.remove(key)
    }

    pub fn in_transaction(&self) -> bool {
        self.resources.contains(TRANSACTION)
    }

    /// Open a connection, begin a transaction and hold it in the transaction slot.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn begin_transaction(&mut self) -> Result<()> {
        if self.in_transaction() {
            return Err(transaction_error("a transaction is already active"));
        }
        let mut connection = self.environment().data_source().open()?;
        connection.begin()?;
        self.resources
            .set_transaction(Rc::new(RefCell::new(connection)));
        tracing::debug!("Transaction started");
        Ok(())
    }

    /// Commit and release the transaction slot.
    ///
    /// A failed commit leaves the transaction in the slot so it can still be
    /// rolled back.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn commit(&mut self) -> Result<()> {
        let tx = self.resources.transaction().ok_or_else(|| {
            Error::context(ContextErrorKind::NoTransaction, "no active transaction")
        })?;
        with_shared(&tx, |c| c.commit())?;
        self.resources.remove(TRANSACTION);
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn rollback(&mut self) -> Result<()> {
        let tx = self.take_transaction()?;
        with_shared(&tx, |c| c.rollback())
    }

    fn take_transaction(&mut self) -> Result<SharedConnection> {
        let tx = self.resources.transaction().ok_or_else(|| {
            Error::context(ContextErrorKind::NoTransaction, "no active transaction")
        })?;
        self.resources.remove(TRANSACTION);
        Ok(tx)
    }

    /// An empty context over the same environment joined to this context's transaction.
    pub fn new_context_sharing_transaction(&self) -> EntityContext {
        let mut ctx = EntityContext::new(self.environment());
        ctx.resources = self.resources.join_transaction();
        ctx
    }

    /// Run `f` on the transaction connection, or on a short-lived one.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut dyn Connection) -> Result<T>,
    ) -> Result<T> {
        match self.resources.transaction() {
            Some(tx) => with_shared(&tx, f),
            None => {
                let mut connection = self.environment().data_source().open()?;
                f(connection.as_mut())
            }
        }
    }
}

fn transaction_error(message: &str) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Transaction,
        message: message.to_string(),
        source: None,
    })
}

/// Run `f` with the connection borrowed mutably.
pub(crate) fn with_shared<T>(
    connection: &SharedConnection,
    f: impl FnOnce(&mut dyn Connection) -> Result<T>,
) -> Result<T> {
    let mut conn = connection.try_borrow_mut().map_err(|_| {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Transaction,
            message: "transaction connection is already in use".to_string(),
            source: None,
        })
    })?;
    f(conn.as_mut())
}
