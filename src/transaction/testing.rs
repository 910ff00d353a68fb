//! Scripted pool and session for exercising executor failure paths.

use crate::connection::config::PoolConfig;
use crate::connection::pool::{PoolFactory, ResourcePool};
use crate::connection::{ScopedConnection, Session};
use crate::core::{ConnectionId, DbError, IsolationLevel, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Failure switches shared by a pool and every session it hands out
#[derive(Default)]
pub(crate) struct Script {
    pub fail_acquire: AtomicBool,
    pub fail_commit: AtomicBool,
    pub fail_rollback: AtomicBool,
    pub fail_close: AtomicBool,
    pub fail_set_isolation: AtomicBool,
    /// Fail every isolation change after the first one
    pub fail_restore: AtomicBool,
}

pub(crate) struct ScriptedSession {
    id: ConnectionId,
    autocommit: bool,
    script: Arc<Script>,
    closed: AtomicBool,
    isolation: Mutex<IsolationLevel>,
    isolation_changes: AtomicUsize,
    events: Mutex<Vec<String>>,
}

impl ScriptedSession {
    fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    /// Successful operations, in order
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn current_isolation(&self) -> IsolationLevel {
        *self.isolation.lock().unwrap()
    }

    fn check(&self, flag: &AtomicBool, what: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(DbError::ExecutionError(format!("scripted {} failure", what)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Session for ScriptedSession {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_autocommit(&self) -> bool {
        self.autocommit
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn commit(&self) -> Result<()> {
        self.check(&self.script.fail_commit, "commit")?;
        self.record("commit");
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.check(&self.script.fail_rollback, "rollback")?;
        self.record("rollback");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.check(&self.script.fail_close, "close")?;
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.record("close");
        }
        Ok(())
    }

    async fn isolation_level(&self) -> Result<IsolationLevel> {
        Ok(self.current_isolation())
    }

    async fn set_isolation_level(&self, level: IsolationLevel) -> Result<()> {
        self.check(&self.script.fail_set_isolation, "isolation")?;
        let previous_changes = self.isolation_changes.fetch_add(1, Ordering::SeqCst);
        if previous_changes > 0 {
            self.check(&self.script.fail_restore, "isolation restore")?;
        }
        *self.isolation.lock().unwrap() = level;
        self.record(format!("isolation:{}", level));
        Ok(())
    }
}

pub(crate) struct ScriptedPool {
    name: String,
    script: Arc<Script>,
    sessions: Mutex<Vec<Arc<ScriptedSession>>>,
}

impl ScriptedPool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Arc::new(Script::default()),
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    /// Most recently acquired session
    pub fn last(&self) -> Arc<ScriptedSession> {
        self.sessions
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no session acquired yet")
    }

    pub fn handed_out(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[async_trait]
impl ResourcePool for ScriptedPool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn acquire(&self, autocommit: bool) -> Result<ScopedConnection> {
        if self.script.fail_acquire.load(Ordering::SeqCst) {
            return Err(DbError::PoolTimeout(format!("{} exhausted", self.name)));
        }
        let session = Arc::new(ScriptedSession {
            id: ConnectionId::next(),
            autocommit,
            script: self.script.clone(),
            closed: AtomicBool::new(false),
            isolation: Mutex::new(IsolationLevel::default()),
            isolation_changes: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
        });
        self.sessions.lock().unwrap().push(session.clone());
        Ok(ScopedConnection::new(session))
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Builds one [`ScriptedPool`] per configured database
#[derive(Default)]
pub(crate) struct ScriptedPoolFactory;

impl PoolFactory for ScriptedPoolFactory {
    fn build(&self, name: &str, _config: &PoolConfig) -> Result<Arc<dyn ResourcePool>> {
        Ok(Arc::new(ScriptedPool::new(name)))
    }
}
