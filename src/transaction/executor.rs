// ============================================================================
// Transactional Executor
// ============================================================================
//
// Runs a unit-of-work on a freshly acquired connection:
//
//   acquire -> push -> [set isolation] -> body -> commit | rollback
//           -> [restore isolation] -> pop -> close
//
// Every step after the push runs no matter how the body ended. Cleanup
// failures are suppressed onto the primary cause, never lost.
//
// ============================================================================

use super::error::{Step, TransactionError};
use super::outcome::FailureDisposition;
use crate::connection::pool::ResourcePool;
use crate::connection::{ScopedConnection, Session};
use crate::context::{ConnectionContext, ContextResolver, ScopeGuard};
use crate::core::{DbError, IsolationLevel, Result};
use futures::FutureExt;
use log::{debug, error, warn};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

/// One logical database: a pool plus the ambient scope stack of its
/// connections.
///
/// Clones share the pool and the context, so a clone handed to another
/// component sees the same nested units-of-work.
#[derive(Clone)]
pub struct Database {
    name: Arc<str>,
    pool: Arc<dyn ResourcePool>,
    context: ConnectionContext,
}

/// What the body of a unit-of-work gets to work with
#[derive(Debug, Clone)]
pub struct TxScope {
    connection: ScopedConnection,
    database: Arc<str>,
    depth: usize,
    isolation: Option<IsolationLevel>,
}

impl TxScope {
    pub fn connection(&self) -> &ScopedConnection {
        &self.connection
    }

    /// The connection as its concrete driver type
    pub fn session<C: Session + 'static>(&self) -> Result<Arc<C>> {
        self.connection.downcast::<C>().ok_or_else(|| {
            DbError::ConnectionTypeMismatch(format!(
                "{} is not a {}",
                self.connection.id(),
                std::any::type_name::<C>()
            ))
        })
    }

    /// Scope stack depth of this unit-of-work, 1 for the outermost
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Isolation level requested for this unit-of-work, if any
    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.isolation
    }
}

enum BodyOutcome<T, E> {
    Returned(T),
    Failed(E),
    Panicked(Box<dyn Any + Send>),
    TimedOut(Duration),
    Unstarted(DbError),
}

enum Finalized<T, E> {
    Value(T),
    Failed(TransactionError<E>),
    Panicked(Box<dyn Any + Send>),
}

impl<T, E> Finalized<T, E> {
    /// Record a cleanup failure: suppressed on an existing failure, primary
    /// when the unit-of-work had succeeded so far.
    fn record(&mut self, step: Step, source: DbError) {
        if let Finalized::Failed(err) = self {
            err.suppress(step, source);
            return;
        }
        if matches!(self, Finalized::Value(_)) {
            *self = Finalized::Failed(TransactionError::step(step, source));
        }
    }

    fn into_result(self) -> std::result::Result<T, TransactionError<E>> {
        match self {
            Finalized::Value(value) => Ok(value),
            Finalized::Failed(err) => Err(err),
            Finalized::Panicked(payload) => panic::resume_unwind(payload),
        }
    }
}

impl Database {
    pub fn new(name: impl Into<String>, pool: Arc<dyn ResourcePool>) -> Self {
        let name: String = name.into();
        Self {
            name: Arc::from(name),
            pool,
            context: ConnectionContext::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &Arc<dyn ResourcePool> {
        &self.pool
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    /// Resolver following the ambient scope of this database
    pub fn resolver(&self) -> ContextResolver {
        ContextResolver::new(self.context.clone())
    }

    /// Innermost connection of the calling task, if it runs inside a unit-of-work
    pub fn current_connection(&self) -> Option<ScopedConnection> {
        self.context.peek()
    }

    /// Number of nested units-of-work active in the calling task
    pub fn depth(&self) -> usize {
        self.context.depth()
    }

    /// Acquire a raw connection that is not pushed onto the scope stack.
    ///
    /// The caller owns it and must close it.
    pub async fn acquire(&self, autocommit: bool) -> Result<ScopedConnection> {
        self.pool.acquire(autocommit).await
    }

    /// Run `body` in a transaction.
    ///
    /// The body commits when it returns `Ok`. On `Err` the transaction rolls
    /// back, unless a [`NoRollback`](super::NoRollback) sits in the error
    /// chain, in which case the work done so far is committed and the error
    /// is still returned.
    pub async fn transaction<T, F, Fut>(
        &self,
        isolation: Option<IsolationLevel>,
        body: F,
    ) -> std::result::Result<T, TransactionError>
    where
        F: FnOnce(TxScope) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.transaction_ex(isolation, body).await
    }

    /// [`transaction`](Database::transaction) with a typed body error.
    ///
    /// `E` decides through [`FailureDisposition`] whether a failure rolls
    /// back or commits.
    pub async fn transaction_ex<T, E, F, Fut>(
        &self,
        isolation: Option<IsolationLevel>,
        body: F,
    ) -> std::result::Result<T, TransactionError<E>>
    where
        E: FailureDisposition,
        F: FnOnce(TxScope) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.run(isolation, None, body).await
    }

    /// Like [`transaction_ex`](Database::transaction_ex), but the body is
    /// abandoned after `limit`. The transaction then rolls back and the
    /// primary failure is [`DbError::Timeout`] at [`Step::Body`].
    pub async fn transaction_with_timeout<T, E, F, Fut>(
        &self,
        isolation: Option<IsolationLevel>,
        limit: Duration,
        body: F,
    ) -> std::result::Result<T, TransactionError<E>>
    where
        E: FailureDisposition,
        F: FnOnce(TxScope) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.run(isolation, Some(limit), body).await
    }

    /// Run `body` on a pushed connection without transaction control.
    ///
    /// There is no commit and no rollback: with `autocommit` each statement
    /// is durable on its own, without it whatever the body leaves pending is
    /// discarded by the close.
    pub async fn with_connection<T, E, F, Fut>(
        &self,
        autocommit: bool,
        body: F,
    ) -> std::result::Result<T, TransactionError<E>>
    where
        F: FnOnce(TxScope) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let span = tracing::info_span!("connection", database = %self.name, autocommit);
        self.context
            .enter(self.run_with_connection(autocommit, body))
            .instrument(span)
            .await
    }

    async fn run<T, E, F, Fut>(
        &self,
        isolation: Option<IsolationLevel>,
        limit: Option<Duration>,
        body: F,
    ) -> std::result::Result<T, TransactionError<E>>
    where
        E: FailureDisposition,
        F: FnOnce(TxScope) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let span = tracing::info_span!("transaction", database = %self.name, isolation = ?isolation);
        self.context
            .enter(self.run_transaction(isolation, limit, body))
            .instrument(span)
            .await
    }

    async fn open_scope<E>(
        &self,
        autocommit: bool,
    ) -> std::result::Result<(ScopedConnection, ScopeGuard), TransactionError<E>> {
        let connection = self.pool.acquire(autocommit).await.map_err(|e| {
            error!("Could not acquire connection for {}: {}", self.name, e);
            TransactionError::step(Step::Acquire, e)
        })?;

        match self.context.guard(connection.clone()) {
            Ok(guard) => Ok((connection, guard)),
            Err(e) => {
                let mut err = TransactionError::step(Step::Acquire, e);
                if let Err(close) = connection.session().close().await {
                    error!("Could not close connection: {}", close);
                    err.suppress(Step::Close, close);
                }
                Err(err)
            }
        }
    }

    async fn run_transaction<T, E, F, Fut>(
        &self,
        isolation: Option<IsolationLevel>,
        limit: Option<Duration>,
        body: F,
    ) -> std::result::Result<T, TransactionError<E>>
    where
        E: FailureDisposition,
        F: FnOnce(TxScope) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let (connection, mut guard) = self.open_scope::<E>(false).await?;
        let depth = guard.depth();
        let session = connection.session();
        debug!(
            "Begin transaction on {} ({}, depth {})",
            self.name,
            connection.id(),
            depth
        );

        let mut restore = None;
        let mut configured = Ok(());
        if let Some(level) = isolation {
            match session.isolation_level().await {
                Ok(previous) => {
                    restore = Some(previous);
                    guard.restore_isolation_on_drop(Some(previous));
                    configured = session.set_isolation_level(level).await;
                }
                Err(e) => configured = Err(e),
            }
        }

        let outcome = match configured {
            Ok(()) => {
                let scope = TxScope {
                    connection: connection.clone(),
                    database: self.name.clone(),
                    depth,
                    isolation,
                };
                run_body(scope, limit, body).await
            }
            Err(e) => BodyOutcome::Unstarted(e),
        };

        let (mut finalized, needs_rollback) = match outcome {
            BodyOutcome::Returned(value) => match session.commit().await {
                Ok(()) => {
                    debug!("Committed transaction on {}", connection.id());
                    (Finalized::Value(value), false)
                }
                Err(e) => {
                    error!("Could not commit transaction: {}", e);
                    (Finalized::Failed(TransactionError::step(Step::Commit, e)), true)
                }
            },
            BodyOutcome::Failed(error) => {
                let commit = error.commit_anyway();
                let mut err = TransactionError::body(error);
                if commit {
                    debug!(
                        "Transaction on {} failed with commit-despite-failure, committing",
                        connection.id()
                    );
                    match session.commit().await {
                        Ok(()) => err.mark_committed(),
                        Err(e) => {
                            error!("Could not commit transaction: {}", e);
                            err.suppress(Step::Commit, e);
                        }
                    }
                }
                (Finalized::Failed(err), !commit)
            }
            BodyOutcome::TimedOut(limit) => {
                warn!(
                    "Transaction on {} exceeded {:?}, rolling back",
                    connection.id(),
                    limit
                );
                let err = TransactionError::step(Step::Body, DbError::Timeout(limit));
                (Finalized::Failed(err), true)
            }
            BodyOutcome::Unstarted(e) => {
                error!("Could not configure isolation level: {}", e);
                let err = TransactionError::step(Step::ConfigureIsolation, e);
                (Finalized::Failed(err), true)
            }
            BodyOutcome::Panicked(payload) => {
                error!("Transaction body on {} panicked, rolling back", connection.id());
                (Finalized::Panicked(payload), true)
            }
        };

        if needs_rollback {
            match session.rollback().await {
                Ok(()) => debug!("Rolled back transaction on {}", connection.id()),
                Err(e) => {
                    error!("Could not rollback transaction: {}", e);
                    finalized.record(Step::Rollback, e);
                }
            }
        }

        if let Some(previous) = restore {
            if let Err(e) = session.set_isolation_level(previous).await {
                error!("Could not restore isolation level {}: {}", previous, e);
                finalized.record(Step::RestoreIsolation, e);
            }
        }

        guard.pop();
        if let Err(e) = session.close().await {
            error!("Could not close connection: {}", e);
            finalized.record(Step::Close, e);
        }
        guard.finish();

        finalized.into_result()
    }

    async fn run_with_connection<T, E, F, Fut>(
        &self,
        autocommit: bool,
        body: F,
    ) -> std::result::Result<T, TransactionError<E>>
    where
        F: FnOnce(TxScope) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let (connection, mut guard) = self.open_scope::<E>(autocommit).await?;
        let scope = TxScope {
            connection: connection.clone(),
            database: self.name.clone(),
            depth: guard.depth(),
            isolation: None,
        };

        let mut finalized = match run_body(scope, None, body).await {
            BodyOutcome::Returned(value) => Finalized::Value(value),
            BodyOutcome::Failed(error) => Finalized::Failed(TransactionError::body(error)),
            BodyOutcome::Panicked(payload) => Finalized::Panicked(payload),
            BodyOutcome::TimedOut(limit) => {
                Finalized::Failed(TransactionError::step(Step::Body, DbError::Timeout(limit)))
            }
            BodyOutcome::Unstarted(e) => {
                Finalized::Failed(TransactionError::step(Step::ConfigureIsolation, e))
            }
        };

        guard.pop();
        if let Err(e) = connection.session().close().await {
            error!("Could not close connection: {}", e);
            finalized.record(Step::Close, e);
        }
        guard.finish();

        finalized.into_result()
    }
}

async fn run_body<T, E, F, Fut>(
    scope: TxScope,
    limit: Option<Duration>,
    body: F,
) -> BodyOutcome<T, E>
where
    F: FnOnce(TxScope) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let guarded = AssertUnwindSafe(async move { body(scope).await }).catch_unwind();
    let caught = match limit {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(caught) => caught,
            Err(_) => return BodyOutcome::TimedOut(limit),
        },
        None => guarded.await,
    };
    match caught {
        Ok(Ok(value)) => BodyOutcome::Returned(value),
        Ok(Err(error)) => BodyOutcome::Failed(error),
        Err(payload) => BodyOutcome::Panicked(payload),
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("context", &self.context.id())
            .finish()
    }
}
