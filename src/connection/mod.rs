pub mod config;
pub mod pool;

use crate::core::{ConnectionId, IsolationLevel, Result};
use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A physical database session as seen by the transaction core.
///
/// Implementations are shared handles: every method takes `&self` and the
/// driver keeps its mutable state (autocommit, isolation, open/closed) behind
/// interior mutability, the same way a JDBC connection behaves.
#[async_trait]
pub trait Session: Send + Sync {
    /// Stable identity of this connection
    fn id(&self) -> ConnectionId;

    fn is_autocommit(&self) -> bool;

    fn is_closed(&self) -> bool;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    /// Release the connection. Closing twice is a no-op.
    async fn close(&self) -> Result<()>;

    async fn isolation_level(&self) -> Result<IsolationLevel>;

    async fn set_isolation_level(&self, level: IsolationLevel) -> Result<()>;
}

/// Type-erased, clonable handle to a pooled connection.
///
/// The scope stack and the resolvers only need the [`Session`] surface, while
/// data-access code wants the concrete driver type back. Both views point at
/// the same `Arc`, so [`downcast`](ScopedConnection::downcast) is free.
#[derive(Clone)]
pub struct ScopedConnection {
    session: Arc<dyn Session>,
    handle: Arc<dyn Any + Send + Sync>,
}

impl ScopedConnection {
    pub fn new<C: Session + 'static>(connection: Arc<C>) -> Self {
        Self {
            session: connection.clone(),
            handle: connection,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.session.id()
    }

    pub fn session(&self) -> &dyn Session {
        self.session.as_ref()
    }

    /// Recover the concrete driver connection, if it is a `C`
    pub fn downcast<C: Session + 'static>(&self) -> Option<Arc<C>> {
        Arc::clone(&self.handle).downcast::<C>().ok()
    }

    /// Two handles are the same connection when they share an id
    pub fn same_as(&self, other: &ScopedConnection) -> bool {
        self.id() == other.id()
    }
}

impl fmt::Debug for ScopedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedConnection")
            .field("id", &self.id())
            .field("closed", &self.session.is_closed())
            .finish()
    }
}

impl<C: Session + 'static> From<Arc<C>> for ScopedConnection {
    fn from(connection: Arc<C>) -> Self {
        Self::new(connection)
    }
}
