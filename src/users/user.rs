use super::dao::UserDao;
use super::{AccountRecord, UserError, UserRecord, UserView};
use crate::connection::ScopedConnection;
use crate::context::ConnectionContext;
use log::info;

/// Aggregate root: a user and its accounts, loaded together.
///
/// A user keeps acting on the connection it was loaded from, even when the
/// ambient scope has moved on. Changes need the row lock taken at load time.
pub struct User {
    record: UserRecord,
    accounts: Vec<AccountRecord>,
    locked_for_update: bool,
    users: UserDao,
}

impl User {
    pub(crate) fn new(
        record: UserRecord,
        accounts: Vec<AccountRecord>,
        locked_for_update: bool,
        context: ConnectionContext,
        connection: ScopedConnection,
    ) -> Self {
        Self {
            record,
            accounts,
            locked_for_update,
            users: UserDao::pinned(context, connection),
        }
    }

    pub fn id(&self) -> i64 {
        self.record.id
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn accounts(&self) -> &[AccountRecord] {
        &self.accounts
    }

    pub fn is_locked_for_update(&self) -> bool {
        self.locked_for_update
    }

    pub fn shout_name(&self) -> &str {
        info!("My name is {}!", self.name());
        self.name()
    }

    pub async fn change_name(&mut self, name: &str) -> Result<bool, UserError> {
        self.require_lock()?;
        self.record.name = name.to_string();
        Ok(self.users.update(&self.record).await?)
    }

    pub fn to_view(&self) -> UserView {
        UserView {
            user: self.record.clone(),
            accounts: self.accounts.clone(),
        }
    }

    fn require_lock(&self) -> Result<(), UserError> {
        if !self.locked_for_update {
            return Err(UserError::LockRequired(self.record.id));
        }
        Ok(())
    }
}
