use super::connection::MemConnection;
use super::store::MemoryStore;
use crate::connection::{ScopedConnection, Session};
use crate::connection::config::PoolConfig;
use crate::connection::pool::{PoolFactory, ResourcePool};
use crate::core::{DbError, Result};
use async_trait::async_trait;
use log::{debug, info};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// Connection pool over one [`MemoryStore`].
///
/// At most `max_connections` connections are open at a time; an acquire
/// waits up to `connect_timeout` for one to be closed.
pub struct MemoryPool {
    name: String,
    config: PoolConfig,
    store: Arc<MemoryStore>,
    permits: Arc<Semaphore>,
    total_connections: AtomicUsize,
    shut_down: AtomicBool,
}

impl MemoryPool {
    pub fn new(name: &str, config: PoolConfig, store: Arc<MemoryStore>) -> Result<Self> {
        config.validate().map_err(DbError::InvalidConfig)?;
        Ok(Self {
            name: name.to_string(),
            permits: Arc::new(Semaphore::new(config.max_connections)),
            config,
            store,
            total_connections: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Pool with a fresh, empty store
    pub fn isolated(name: &str, config: PoolConfig) -> Result<Self> {
        Self::new(name, config, Arc::new(MemoryStore::new()))
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Open a connection typed as the driver connection
    pub async fn connect(&self, autocommit: bool) -> Result<Arc<MemConnection>> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(DbError::ExecutionError(format!(
                "Pool '{}' is shut down",
                self.name
            )));
        }

        let permit = tokio::time::timeout(
            self.config.connect_timeout,
            self.permits.clone().acquire_owned(),
        )
        .await
        .map_err(|_| {
            DbError::PoolTimeout(format!(
                "no connection available in '{}' within {:?}",
                self.name, self.config.connect_timeout
            ))
        })?
        .map_err(|_| DbError::ExecutionError(format!("Pool '{}' is shut down", self.name)))?;

        let connection = MemConnection::new(
            self.store.clone(),
            autocommit,
            self.config.default_isolation,
            self.config.lock_timeout,
        )
        .with_permit(permit);
        self.total_connections.fetch_add(1, Ordering::SeqCst);
        debug!("Pool '{}' opened {}", self.name, connection.id());
        Ok(Arc::new(connection))
    }

    pub fn stats(&self) -> PoolStats {
        let available = self.permits.available_permits();
        PoolStats {
            total_connections: self.total_connections.load(Ordering::SeqCst),
            available_connections: available,
            active_connections: self.config.max_connections.saturating_sub(available),
            max_connections: self.config.max_connections,
        }
    }
}

#[async_trait]
impl ResourcePool for MemoryPool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn acquire(&self, autocommit: bool) -> Result<ScopedConnection> {
        Ok(ScopedConnection::new(self.connect(autocommit).await?))
    }

    async fn shutdown(&self) -> Result<()> {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            self.permits.close();
            info!("Pool '{}' shut down ({})", self.name, self.stats());
        }
        Ok(())
    }
}

/// Connection pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections opened over the pool's lifetime
    pub total_connections: usize,
    pub available_connections: usize,
    pub active_connections: usize,
    pub max_connections: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} active, {} available, {} opened",
            self.active_connections,
            self.max_connections,
            self.available_connections,
            self.total_connections
        )
    }
}

type SchemaSetup = dyn Fn(&MemoryStore) -> Result<()> + Send + Sync;

/// Builds a [`MemoryPool`] with its own store for every configured database.
#[derive(Default)]
pub struct MemoryPoolFactory {
    schema: Option<Arc<SchemaSetup>>,
    pools: Mutex<BTreeMap<String, Arc<MemoryPool>>>,
}

impl MemoryPoolFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `setup` on every new store before its pool is handed out
    pub fn with_schema<F>(mut self, setup: F) -> Self
    where
        F: Fn(&MemoryStore) -> Result<()> + Send + Sync + 'static,
    {
        self.schema = Some(Arc::new(setup));
        self
    }

    /// Pool previously built for `name`
    pub fn pool(&self, name: &str) -> Option<Arc<MemoryPool>> {
        self.pools.lock().ok()?.get(name).cloned()
    }
}

impl PoolFactory for MemoryPoolFactory {
    fn build(&self, name: &str, config: &PoolConfig) -> Result<Arc<dyn ResourcePool>> {
        let store = MemoryStore::new();
        if let Some(setup) = &self.schema {
            setup(&store)?;
        }
        let pool = Arc::new(MemoryPool::new(name, config.clone(), Arc::new(store))?);
        self.pools.lock()?.insert(name.to_string(), pool.clone());
        Ok(pool)
    }
}
