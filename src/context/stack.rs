// ============================================================================
// Scope Stack
// ============================================================================
//
// One stack of active connections per (logical task, ConnectionContext).
// The stacks live in a tokio task-local, so they follow the task across
// worker threads and are never visible to other tasks.
//
// ============================================================================

use crate::connection::ScopedConnection;
use crate::core::{DbError, IsolationLevel, Result};
use log::{debug, error, warn};
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

tokio::task_local! {
    static SCOPES: RefCell<ScopeRegistry>;
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct ScopeRegistry {
    stacks: HashMap<u64, ScopeStack>,
}

/// Ordered connections of the nested units-of-work, innermost last.
#[derive(Debug, Default)]
pub struct ScopeStack {
    entries: Vec<ScopedConnection>,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, connection: ScopedConnection) {
        self.entries.push(connection);
    }

    /// Remove the innermost connection.
    ///
    /// # Panics
    /// On an empty stack: a pop without a matching push is a programming error.
    pub fn pop(&mut self) -> ScopedConnection {
        match self.entries.pop() {
            Some(connection) => connection,
            None => panic!("scope stack underflow: pop without a matching push"),
        }
    }

    pub fn peek(&self) -> Option<&ScopedConnection> {
        self.entries.last()
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Handle to the ambient connection stack of one logical database.
///
/// The value is passed explicitly to the executor and to every resolver;
/// only the stack contents are looked up through the current task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionContext {
    id: u64,
}

impl ConnectionContext {
    pub fn new() -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::SeqCst),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// True when the current task already carries a scope registry
    pub fn is_entered() -> bool {
        SCOPES.try_with(|_| ()).is_ok()
    }

    /// Run `fut` with a scope registry installed for the current task.
    ///
    /// Nested calls reuse the registry of the outermost one, which is what
    /// makes inner units-of-work see the outer connections.
    pub async fn enter<F: Future>(&self, fut: F) -> F::Output {
        if Self::is_entered() {
            fut.await
        } else {
            SCOPES
                .scope(RefCell::new(ScopeRegistry::default()), fut)
                .await
        }
    }

    /// Push `connection` and return the new depth.
    pub fn push(&self, connection: ScopedConnection) -> Result<usize> {
        let id = connection.id();
        let depth = SCOPES
            .try_with(|scopes| {
                let mut scopes = scopes.borrow_mut();
                let stack = scopes.stacks.entry(self.id).or_default();
                stack.push(connection);
                stack.depth()
            })
            .map_err(|_| {
                DbError::ExecutionError(
                    "No scope registry for this task; run inside ConnectionContext::enter".into(),
                )
            })?;
        debug!("Scope push {} (context {}, depth {})", id, self.id, depth);
        Ok(depth)
    }

    /// Pop the innermost connection.
    ///
    /// # Panics
    /// If the stack is empty or the task has no scope registry.
    pub fn pop(&self) -> ScopedConnection {
        let popped = SCOPES.try_with(|scopes| {
            let mut scopes = scopes.borrow_mut();
            let stack = scopes.stacks.entry(self.id).or_default();
            let connection = stack.pop();
            if stack.is_empty() {
                scopes.stacks.remove(&self.id);
            }
            connection
        });
        match popped {
            Ok(connection) => {
                debug!("Scope pop {} (context {})", connection.id(), self.id);
                connection
            }
            Err(_) => panic!("scope stack underflow: no scope registry for this task"),
        }
    }

    /// Pop and check that the innermost connection is `expected`.
    ///
    /// # Panics
    /// On a mismatch, which means push/pop pairing was broken in between.
    pub fn pop_expected(&self, expected: &ScopedConnection) -> ScopedConnection {
        let popped = self.pop();
        if !popped.same_as(expected) {
            panic!(
                "scope stack corrupted: expected {} on top, found {}",
                expected.id(),
                popped.id()
            );
        }
        popped
    }

    /// Innermost connection of the current task, if any
    pub fn peek(&self) -> Option<ScopedConnection> {
        SCOPES
            .try_with(|scopes| {
                scopes
                    .borrow()
                    .stacks
                    .get(&self.id)
                    .and_then(|stack| stack.peek().cloned())
            })
            .ok()
            .flatten()
    }

    pub fn depth(&self) -> usize {
        SCOPES
            .try_with(|scopes| {
                scopes
                    .borrow()
                    .stacks
                    .get(&self.id)
                    .map_or(0, ScopeStack::depth)
            })
            .unwrap_or(0)
    }

    /// Push `connection` and return a guard that pops it again.
    pub fn guard(&self, connection: ScopedConnection) -> Result<ScopeGuard> {
        let depth = self.push(connection.clone())?;
        Ok(ScopeGuard {
            context: self.clone(),
            connection,
            depth,
            restore_isolation: None,
            popped: false,
            finished: false,
        })
    }

    /// Non-panicking pop used from `Drop`
    fn discard(&self, expected: &ScopedConnection) -> bool {
        SCOPES
            .try_with(|scopes| {
                let mut scopes = scopes.borrow_mut();
                let Some(stack) = scopes.stacks.get_mut(&self.id) else {
                    return false;
                };
                if !stack.peek().is_some_and(|top| top.same_as(expected)) {
                    return false;
                }
                stack.pop();
                if stack.is_empty() {
                    scopes.stacks.remove(&self.id);
                }
                true
            })
            .unwrap_or(false)
    }
}

impl Default for ConnectionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII pairing of a scope push with its pop
///
/// The executor pops the scope with [`pop`](ScopeGuard::pop) and calls
/// [`finish`](ScopeGuard::finish) once the connection is closed. A guard
/// dropped before that means the owning future was cancelled: the scope is
/// popped here and the connection is handed to a background task that rolls
/// back, restores the isolation level and closes it.
pub struct ScopeGuard {
    context: ConnectionContext,
    connection: ScopedConnection,
    depth: usize,
    restore_isolation: Option<IsolationLevel>,
    popped: bool,
    finished: bool,
}

impl ScopeGuard {
    pub fn connection(&self) -> &ScopedConnection {
        &self.connection
    }

    /// Stack depth right after this scope was pushed
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Remember the level the background cleanup must restore
    pub fn restore_isolation_on_drop(&mut self, level: Option<IsolationLevel>) {
        self.restore_isolation = level;
    }

    /// Pop the scope. Later calls are no-ops.
    ///
    /// # Panics
    /// If the top of the stack is not this guard's connection.
    pub fn pop(&mut self) {
        if !self.popped {
            self.popped = true;
            self.context.pop_expected(&self.connection);
        }
    }

    /// Pop if still pushed, and mark the connection as finalized
    pub fn finish(mut self) {
        self.pop();
        self.finished = true;
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if !self.popped && !self.context.discard(&self.connection) {
            error!(
                "Scope for {} was not on top of context {} when dropped",
                self.connection.id(),
                self.context.id()
            );
        }

        if self.finished {
            return;
        }

        let connection = self.connection.clone();
        let restore = self.restore_isolation.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(
                    "Scope for {} dropped before finalization, rolling back in background",
                    connection.id()
                );
                handle.spawn(async move {
                    let session = connection.session();
                    if let Err(e) = session.rollback().await {
                        error!("Could not rollback abandoned transaction: {}", e);
                    }
                    if let Some(level) = restore {
                        if let Err(e) = session.set_isolation_level(level).await {
                            error!("Could not restore isolation level: {}", e);
                        }
                    }
                    if let Err(e) = session.close().await {
                        error!("Could not close connection: {}", e);
                    }
                });
            }
            Err(_) => warn!(
                "Scope for {} dropped outside a runtime; connection leaked",
                connection.id()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Session;
    use crate::core::ConnectionId;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct TrackedSession {
        id: u64,
        rolled_back: AtomicBool,
        closed: AtomicBool,
    }

    #[async_trait]
    impl Session for TrackedSession {
        fn id(&self) -> ConnectionId {
            ConnectionId(self.id)
        }
        fn is_autocommit(&self) -> bool {
            false
        }
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
        async fn commit(&self) -> Result<()> {
            Ok(())
        }
        async fn rollback(&self) -> Result<()> {
            self.rolled_back.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn isolation_level(&self) -> Result<IsolationLevel> {
            Ok(IsolationLevel::ReadCommitted)
        }
        async fn set_isolation_level(&self, _level: IsolationLevel) -> Result<()> {
            Ok(())
        }
    }

    fn conn(id: u64) -> (Arc<TrackedSession>, ScopedConnection) {
        let raw = Arc::new(TrackedSession {
            id,
            ..Default::default()
        });
        let scoped = ScopedConnection::new(raw.clone());
        (raw, scoped)
    }

    #[test]
    fn test_stack_push_peek_pop() {
        let mut stack = ScopeStack::new();
        assert!(stack.peek().is_none());

        stack.push(conn(1).1);
        stack.push(conn(2).1);
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.peek().unwrap().id(), ConnectionId(2));

        assert_eq!(stack.pop().id(), ConnectionId(2));
        assert_eq!(stack.peek().unwrap().id(), ConnectionId(1));
    }

    #[test]
    #[should_panic(expected = "scope stack underflow")]
    fn test_pop_on_empty_stack_panics() {
        ScopeStack::new().pop();
    }

    #[tokio::test]
    async fn test_context_outside_enter_is_empty() {
        let context = ConnectionContext::new();
        assert!(!ConnectionContext::is_entered());
        assert!(context.peek().is_none());
        assert_eq!(context.depth(), 0);
        assert!(context.push(conn(3).1).is_err());
    }

    #[tokio::test]
    async fn test_nested_enter_shares_registry() {
        let context = ConnectionContext::new();
        context
            .enter(async {
                context.push(conn(10).1).unwrap();
                context
                    .enter(async {
                        assert_eq!(context.depth(), 1);
                        context.push(conn(11).1).unwrap();
                        assert_eq!(context.peek().unwrap().id(), ConnectionId(11));
                        context.pop();
                    })
                    .await;
                assert_eq!(context.peek().unwrap().id(), ConnectionId(10));
                context.pop();
                assert_eq!(context.depth(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_contexts_are_independent() {
        let a = ConnectionContext::new();
        let b = ConnectionContext::new();
        a.enter(async {
            a.push(conn(20).1).unwrap();
            assert_eq!(b.depth(), 0);
            assert!(b.peek().is_none());
            a.pop();
        })
        .await;
    }

    #[tokio::test]
    async fn test_spawned_task_does_not_inherit_stack() {
        let context = ConnectionContext::new();
        context
            .enter(async {
                context.push(conn(30).1).unwrap();
                let inner = context.clone();
                let seen = tokio::spawn(async move { inner.peek().map(|c| c.id()) })
                    .await
                    .unwrap();
                assert_eq!(seen, None);
                context.pop();
            })
            .await;
    }

    #[tokio::test]
    #[should_panic(expected = "scope stack corrupted")]
    async fn test_pop_expected_detects_mismatch() {
        let context = ConnectionContext::new();
        context
            .enter(async {
                let (_, first) = conn(40);
                context.push(first.clone()).unwrap();
                context.push(conn(41).1).unwrap();
                context.pop_expected(&first);
            })
            .await;
    }

    #[tokio::test]
    async fn test_guard_pop_and_finish() {
        let context = ConnectionContext::new();
        context
            .enter(async {
                let (raw, scoped) = conn(50);
                let mut guard = context.guard(scoped).unwrap();
                assert_eq!(guard.depth(), 1);
                guard.pop();
                guard.pop();
                assert_eq!(context.depth(), 0);
                guard.finish();
                tokio::task::yield_now().await;
                assert!(!raw.rolled_back.load(Ordering::SeqCst));
                assert!(!raw.is_closed());
            })
            .await;
    }

    #[tokio::test]
    async fn test_popped_but_unfinished_guard_still_cleans_up() {
        let context = ConnectionContext::new();
        let (raw, scoped) = conn(55);
        context
            .enter(async {
                let mut guard = context.guard(scoped).unwrap();
                guard.pop();
                drop(guard);
                assert_eq!(context.depth(), 0);
            })
            .await;

        for _ in 0..50 {
            if raw.is_closed() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(raw.is_closed());
    }

    #[tokio::test]
    async fn test_dropped_guard_pops_and_cleans_up() {
        let context = ConnectionContext::new();
        let (raw, scoped) = conn(60);
        context
            .enter(async {
                let guard = context.guard(scoped).unwrap();
                drop(guard);
                assert_eq!(context.depth(), 0);
            })
            .await;

        for _ in 0..50 {
            if raw.is_closed() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(raw.rolled_back.load(Ordering::SeqCst));
        assert!(raw.is_closed());
    }
}
