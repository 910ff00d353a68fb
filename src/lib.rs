// ============================================================================
// txscope Library
// ============================================================================

//! Scoped transactional connection context.
//!
//! A [`Database`] runs units-of-work on pooled connections. While a unit-of-work
//! runs, its connection is the ambient one for the calling task: data-access
//! code finds it through a [`ContextResolver`] instead of having it passed
//! around. Units-of-work nest, each on its own connection.
//!
//! ```
//! use std::sync::Arc;
//! use txscope::memstore::{MemConnection, TableDef};
//! use txscope::{Database, MemoryPool, PoolConfig, Value};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! let pool = MemoryPool::isolated("app", PoolConfig::new("app"))?;
//! pool.store().create_table(TableDef::new("notes"))?;
//! let db = Database::new("app", Arc::new(pool));
//!
//! let id = db
//!     .transaction(None, |scope| async move {
//!         let conn = scope.session::<MemConnection>()?;
//!         Ok(conn.insert("notes", [("text", Value::from("hello"))]).await?)
//!     })
//!     .await?;
//! assert_eq!(id, 1);
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod connection;
pub mod context;
pub mod core;
pub mod memstore;
pub mod registry;
pub mod transaction;
pub mod users;

pub use crate::core::{ConnectionId, DbError, IsolationLevel, Result, Value};

pub use connection::{
    ScopedConnection, Session,
    config::{DatabasesConfig, PoolConfig},
    pool::{PoolFactory, ResourcePool},
};

pub use context::{ConnectionContext, ContextResolver, DataAccess, TemporaryContext};

pub use transaction::{
    Abort, Database, Disposition, ErrorCause, Failure, FailureDisposition, NoRollback, ResultExt, Step,
    StepFailure, TransactionError, TxScope,
};

pub use aggregate::{AggregateDeletion, AggregateSpec, AggregateStore, delete_aggregate, lock_aggregate};
pub use memstore::{MemConnection, MemoryPool, MemoryPoolFactory, PoolStats};
pub use registry::DatabaseRegistry;
