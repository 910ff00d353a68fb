use super::stack::ConnectionContext;
use crate::connection::{ScopedConnection, Session};
use crate::core::{DbError, Result};
use std::future::Future;
use std::sync::{Arc, Mutex};

/// Finds "the" connection for data-access code.
///
/// Resolution order:
/// 1. the innermost temporary binding installed with [`bind_temporary`],
/// 2. the pinned connection this resolver was built with, if any,
/// 3. the top of the ambient scope stack of the calling task,
/// 4. otherwise [`DbError::UnresolvedContext`].
///
/// [`bind_temporary`]: ContextResolver::bind_temporary
#[derive(Debug)]
pub struct ContextResolver {
    context: ConnectionContext,
    pinned: Option<ScopedConnection>,
    temporary: Mutex<Vec<Binding>>,
}

#[derive(Debug)]
struct Binding {
    token: u64,
    connection: ScopedConnection,
}

impl ContextResolver {
    /// Resolver that follows the ambient scope of `context`
    pub fn new(context: ConnectionContext) -> Self {
        Self {
            context,
            pinned: None,
            temporary: Mutex::new(Vec::new()),
        }
    }

    /// Resolver permanently bound to `connection`.
    ///
    /// Useful when objects created inside one unit-of-work must keep acting on
    /// its connection regardless of which scope is ambient when they run.
    pub fn pinned(context: ConnectionContext, connection: ScopedConnection) -> Self {
        Self {
            context,
            pinned: Some(connection),
            temporary: Mutex::new(Vec::new()),
        }
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    pub fn current_connection(&self) -> Result<ScopedConnection> {
        if let Some(binding) = self.temporary.lock()?.last() {
            return Ok(binding.connection.clone());
        }
        if let Some(connection) = &self.pinned {
            return Ok(connection.clone());
        }
        self.context.peek().ok_or_else(|| {
            DbError::UnresolvedContext(format!(
                "no connection bound to context {} in this task",
                self.context.id()
            ))
        })
    }

    /// Resolve and downcast to the concrete driver connection
    pub fn current<C: Session + 'static>(&self) -> Result<Arc<C>> {
        let connection = self.current_connection()?;
        connection.downcast::<C>().ok_or_else(|| {
            DbError::ConnectionTypeMismatch(format!(
                "{} is not a {}",
                connection.id(),
                std::any::type_name::<C>()
            ))
        })
    }

    pub fn has_temporary_context(&self) -> bool {
        self.temporary.lock().map(|b| !b.is_empty()).unwrap_or(false)
    }

    /// Route this resolver to `connection` until the returned guard goes away.
    ///
    /// Bindings nest; dropping a guard removes exactly its own binding.
    pub fn bind_temporary(&self, connection: ScopedConnection) -> Result<TemporaryContext<'_>> {
        let mut bindings = self.temporary.lock()?;
        let token = bindings.last().map_or(1, |b| b.token + 1);
        bindings.push(Binding { token, connection });
        Ok(TemporaryContext {
            resolver: self,
            token,
        })
    }

    /// Run `fut` with `connection` bound as the temporary context.
    pub async fn with_temporary_context<F: Future>(
        &self,
        connection: ScopedConnection,
        fut: F,
    ) -> Result<F::Output> {
        let _binding = self.bind_temporary(connection)?;
        Ok(fut.await)
    }

    fn unbind(&self, token: u64) {
        if let Ok(mut bindings) = self.temporary.lock() {
            bindings.retain(|b| b.token != token);
        }
    }
}

/// Guard returned by [`ContextResolver::bind_temporary`].
#[must_use = "the temporary context is removed as soon as the guard is dropped"]
pub struct TemporaryContext<'a> {
    resolver: &'a ContextResolver,
    token: u64,
}

impl TemporaryContext<'_> {
    /// Remove the binding now
    pub fn clear(self) {}
}

impl Drop for TemporaryContext<'_> {
    fn drop(&mut self) {
        self.resolver.unbind(self.token);
    }
}

/// Implemented by data-access objects that resolve their connection through a
/// [`ContextResolver`].
pub trait DataAccess {
    fn resolver(&self) -> &ContextResolver;

    fn connection(&self) -> Result<ScopedConnection> {
        self.resolver().current_connection()
    }

    fn session<C: Session + 'static>(&self) -> Result<Arc<C>> {
        self.resolver().current::<C>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ConnectionId, IsolationLevel};
    use async_trait::async_trait;

    struct StubSession(u64);

    #[async_trait]
    impl Session for StubSession {
        fn id(&self) -> ConnectionId {
            ConnectionId(self.0)
        }
        fn is_autocommit(&self) -> bool {
            false
        }
        fn is_closed(&self) -> bool {
            false
        }
        async fn commit(&self) -> Result<()> {
            Ok(())
        }
        async fn rollback(&self) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
        async fn isolation_level(&self) -> Result<IsolationLevel> {
            Ok(IsolationLevel::ReadCommitted)
        }
        async fn set_isolation_level(&self, _level: IsolationLevel) -> Result<()> {
            Ok(())
        }
    }

    struct Dao {
        resolver: ContextResolver,
    }

    impl DataAccess for Dao {
        fn resolver(&self) -> &ContextResolver {
            &self.resolver
        }
    }

    fn stub(id: u64) -> ScopedConnection {
        ScopedConnection::new(Arc::new(StubSession(id)))
    }

    #[tokio::test]
    async fn test_unresolved_without_scope() {
        let resolver = ContextResolver::new(ConnectionContext::new());
        let err = resolver.current_connection().unwrap_err();
        assert!(matches!(err, DbError::UnresolvedContext(_)));
    }

    #[tokio::test]
    async fn test_resolves_ambient_top() {
        let context = ConnectionContext::new();
        let resolver = ContextResolver::new(context.clone());
        context
            .enter(async {
                context.push(stub(1)).unwrap();
                assert_eq!(resolver.current_connection().unwrap().id(), ConnectionId(1));
                context.push(stub(2)).unwrap();
                assert_eq!(resolver.current_connection().unwrap().id(), ConnectionId(2));
                context.pop();
                assert_eq!(resolver.current_connection().unwrap().id(), ConnectionId(1));
                context.pop();
            })
            .await;
    }

    #[tokio::test]
    async fn test_temporary_context_overrides_ambient_until_cleared() {
        let context = ConnectionContext::new();
        let dao = Dao {
            resolver: ContextResolver::new(context.clone()),
        };
        context
            .enter(async {
                context.push(stub(1)).unwrap();

                let guard = dao.resolver().bind_temporary(stub(9)).unwrap();
                assert!(dao.resolver().has_temporary_context());
                assert_eq!(dao.connection().unwrap().id(), ConnectionId(9));
                guard.clear();

                assert!(!dao.resolver().has_temporary_context());
                assert_eq!(dao.connection().unwrap().id(), ConnectionId(1));
                context.pop();
            })
            .await;
    }

    #[tokio::test]
    async fn test_temporary_bindings_nest() {
        let resolver = ContextResolver::new(ConnectionContext::new());
        let outer = resolver.bind_temporary(stub(5)).unwrap();
        {
            let _inner = resolver.bind_temporary(stub(6)).unwrap();
            assert_eq!(resolver.current_connection().unwrap().id(), ConnectionId(6));
        }
        assert_eq!(resolver.current_connection().unwrap().id(), ConnectionId(5));
        drop(outer);
        assert!(resolver.current_connection().is_err());
    }

    #[tokio::test]
    async fn test_with_temporary_context_scopes_binding() {
        let resolver = ContextResolver::new(ConnectionContext::new());
        let seen = resolver
            .with_temporary_context(stub(7), async { resolver.current_connection().map(|c| c.id()) })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, ConnectionId(7));
        assert!(resolver.current_connection().is_err());
    }

    #[tokio::test]
    async fn test_pinned_resolver_ignores_ambient_but_yields_to_temporary() {
        let context = ConnectionContext::new();
        let resolver = ContextResolver::pinned(context.clone(), stub(3));
        context
            .enter(async {
                context.push(stub(4)).unwrap();
                assert_eq!(resolver.current_connection().unwrap().id(), ConnectionId(3));
                {
                    let _temp = resolver.bind_temporary(stub(8)).unwrap();
                    assert_eq!(resolver.current_connection().unwrap().id(), ConnectionId(8));
                }
                assert_eq!(resolver.current_connection().unwrap().id(), ConnectionId(3));
                context.pop();
            })
            .await;
    }

    #[tokio::test]
    async fn test_typed_resolution() {
        let resolver = ContextResolver::pinned(ConnectionContext::new(), stub(12));
        let dao = Dao { resolver };
        let typed = dao.session::<StubSession>().unwrap();
        assert_eq!(typed.0, 12);
    }
}
