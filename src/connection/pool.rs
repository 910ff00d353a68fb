use super::ScopedConnection;
use super::config::PoolConfig;
use crate::core::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Source of physical connections for one logical database.
///
/// Pooling policy lives entirely behind this trait. The transaction core only
/// acquires, and hands the connection back by closing it.
#[async_trait]
pub trait ResourcePool: Send + Sync {
    /// Logical database name this pool serves
    fn name(&self) -> &str;

    /// Acquire a connection, waiting if the pool is exhausted.
    async fn acquire(&self, autocommit: bool) -> Result<ScopedConnection>;

    /// Stop handing out connections
    async fn shutdown(&self) -> Result<()>;
}

/// Builds a pool for a configured database name.
pub trait PoolFactory: Send + Sync {
    fn build(&self, name: &str, config: &PoolConfig) -> Result<Arc<dyn ResourcePool>>;
}
