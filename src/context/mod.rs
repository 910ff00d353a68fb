pub mod resolver;
pub mod stack;

pub use resolver::{ContextResolver, DataAccess, TemporaryContext};
pub use stack::{ConnectionContext, ScopeGuard, ScopeStack};
