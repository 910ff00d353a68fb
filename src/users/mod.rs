//! Users with e-mail accounts: a small aggregate used to exercise nested
//! units-of-work, commit-despite-failure and the aggregate deletion order.

pub mod dao;
pub mod service;
pub mod user;

pub use dao::{AccountDao, UserDao};
pub use service::UserService;
pub use user::User;

use crate::aggregate::AggregateSpec;
use crate::core::{DbError, Result};
use crate::memstore::{MemoryStore, Row, TableDef};
use crate::transaction::{ErrorCause, FailureDisposition};
use serde::Serialize;
use thiserror::Error;

pub const USERS: &str = "users";
pub const ACCOUNTS: &str = "accounts";

/// Create the `users` and `accounts` tables
pub fn install_schema(store: &MemoryStore) -> Result<()> {
    store.create_table(TableDef::new(USERS))?;
    store.create_table(
        TableDef::new(ACCOUNTS)
            .unique("email")
            .references("user_id", USERS),
    )
}

/// A user together with every account referencing it
pub fn user_aggregate() -> AggregateSpec {
    AggregateSpec::new(USERS).child(ACCOUNTS, "user_id")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRecord {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountRecord {
    pub id: i64,
    pub user_id: i64,
    pub email: String,
}

/// Read-only snapshot of a user aggregate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserView {
    pub user: UserRecord,
    pub accounts: Vec<AccountRecord>,
}

impl TryFrom<Row> for UserRecord {
    type Error = DbError;

    fn try_from(row: Row) -> Result<Self> {
        let name = row
            .get_str("name")
            .ok_or_else(|| invalid(USERS, row.id, "name"))?
            .to_string();
        Ok(Self { id: row.id, name })
    }
}

impl TryFrom<Row> for AccountRecord {
    type Error = DbError;

    fn try_from(row: Row) -> Result<Self> {
        let user_id = row
            .get_i64("user_id")
            .ok_or_else(|| invalid(ACCOUNTS, row.id, "user_id"))?;
        let email = row
            .get_str("email")
            .ok_or_else(|| invalid(ACCOUNTS, row.id, "email"))?
            .to_string();
        Ok(Self {
            id: row.id,
            user_id,
            email,
        })
    }
}

fn invalid(table: &str, id: i64, column: &str) -> DbError {
    DbError::ExecutionError(format!("{}#{} has no valid {}", table, id, column))
}

#[derive(Error, Debug)]
pub enum UserError {
    #[error("Lock must be acquired in order to change user {0}")]
    LockRequired(i64),

    #[error("User {0} not found")]
    NotFound(i64),

    #[error(transparent)]
    Db(#[from] DbError),
}

impl FailureDisposition for UserError {}

impl ErrorCause for UserError {
    fn as_cause(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self)
    }
}
