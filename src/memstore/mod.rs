// ============================================================================
// In-Memory Store
// ============================================================================
//
// A small transactional row store with row locks and foreign keys, used as
// the concrete ResourcePool behind the demo and the integration tests.
//
// ============================================================================

pub mod connection;
pub mod locks;
pub mod pool;
pub mod store;

pub use connection::MemConnection;
pub use locks::{LockManager, LockMode, RowKey};
pub use pool::{MemoryPool, MemoryPoolFactory, PoolStats};
pub use store::{ForeignKey, MemoryStore, Row, TableDef};
