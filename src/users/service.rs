use super::dao::{AccountDao, UserDao};
use super::user::User;
use super::{AccountRecord, UserError, UserView};
use crate::transaction::{Database, NoRollback, TransactionError, TxScope};
use anyhow::Context;
use log::info;

/// Use cases of the user aggregate, one unit-of-work each.
///
/// Every method opens its own transaction. Called from inside another
/// unit-of-work on the same [`Database`], it nests: the inner transaction
/// runs on its own connection and commits independently of the outer one.
pub struct UserService {
    database: Database,
    users: UserDao,
    accounts: AccountDao,
}

impl UserService {
    pub fn new(database: Database) -> Self {
        let context = database.context().clone();
        Self {
            users: UserDao::new(context.clone()),
            accounts: AccountDao::new(context),
            database,
        }
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn users(&self) -> &UserDao {
        &self.users
    }

    pub fn accounts(&self) -> &AccountDao {
        &self.accounts
    }

    /// Create a user with one account per e-mail.
    ///
    /// A duplicate e-mail fails the whole creation.
    pub async fn create_new_user(
        &self,
        name: &str,
        emails: &[&str],
    ) -> Result<UserView, TransactionError> {
        self.database
            .transaction(None, |_| async move {
                let view = self.users.create(name, emails).await?;
                info!(
                    "Created user {} with {} account(s)",
                    view.user.id,
                    view.accounts.len()
                );
                Ok(view)
            })
            .await
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<UserView>, TransactionError> {
        self.database
            .transaction(None, |scope| async move {
                let user = self.load_user(&scope, id, false).await?;
                Ok(user.map(|u| u.to_view()))
            })
            .await
    }

    pub async fn shout_name_of_user(&self, id: i64) -> Result<Option<String>, TransactionError> {
        self.database
            .transaction(None, |scope| async move {
                let user = self.load_user(&scope, id, false).await?;
                Ok(user.map(|u| u.shout_name().to_string()))
            })
            .await
    }

    /// Rename a user under its row lock
    pub async fn change_name(
        &self,
        id: i64,
        new_name: &str,
    ) -> Result<UserView, TransactionError<UserError>> {
        self.database
            .transaction_ex(None, |scope| async move {
                let mut user = self
                    .load_user(&scope, id, true)
                    .await?
                    .ok_or(UserError::NotFound(id))?;
                user.change_name(new_name).await?;
                Ok(user.to_view())
            })
            .await
    }

    /// Delete a user and its accounts. Returns false when there was no such user.
    pub async fn delete_user(&self, id: i64) -> Result<bool, TransactionError> {
        self.database
            .transaction(None, |_| async move { Ok(self.users.delete_by_id(id).await?) })
            .await
    }

    pub async fn add_account(
        &self,
        user_id: i64,
        email: &str,
    ) -> Result<AccountRecord, TransactionError> {
        self.database
            .transaction(None, |_| async move {
                Ok(self.accounts.insert(user_id, email).await?)
            })
            .await
    }

    pub async fn find_all_with_accounts(&self) -> Result<Vec<UserView>, TransactionError> {
        self.database
            .transaction(None, |_| async move { Ok(self.users.find_all_with_accounts().await?) })
            .await
    }

    /// Register e-mails for a user, stopping at the first one already taken.
    ///
    /// The stop is an expected outcome: the accounts registered before it are
    /// committed, and the error names the e-mail that was taken.
    pub async fn register_accounts(
        &self,
        user_id: i64,
        emails: &[&str],
    ) -> Result<Vec<AccountRecord>, TransactionError> {
        self.database
            .transaction(None, |_| async move {
                let mut registered = Vec::with_capacity(emails.len());
                for email in emails {
                    if self.accounts.find_by_email(email).await?.is_some() {
                        return Err(NoRollback::new(format!("{} is already registered", email)))
                            .with_context(|| {
                                format!("registered {} account(s) before stopping", registered.len())
                            });
                    }
                    registered.push(self.accounts.insert(user_id, email).await?);
                }
                Ok(registered)
            })
            .await
    }

    async fn load_user(
        &self,
        scope: &TxScope,
        id: i64,
        lock_for_update: bool,
    ) -> Result<Option<User>, UserError> {
        let Some(record) = self.users.find_by_id(id, lock_for_update).await? else {
            return Ok(None);
        };
        let accounts = self.accounts.find_all_by_user_id(id).await?;
        Ok(Some(User::new(
            record,
            accounts,
            lock_for_update,
            self.database.context().clone(),
            scope.connection().clone(),
        )))
    }
}
