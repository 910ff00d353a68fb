use super::{ACCOUNTS, AccountRecord, USERS, UserRecord, UserView, user_aggregate};
use crate::aggregate::delete_aggregate;
use crate::connection::ScopedConnection;
use crate::context::{ConnectionContext, ContextResolver, DataAccess};
use crate::core::{Result, Value};
use crate::memstore::MemConnection;
use std::sync::Arc;

/// All SQL-ish access to the `users` table goes through here.
pub struct UserDao {
    resolver: ContextResolver,
}

impl DataAccess for UserDao {
    fn resolver(&self) -> &ContextResolver {
        &self.resolver
    }
}

impl UserDao {
    pub fn new(context: ConnectionContext) -> Self {
        Self {
            resolver: ContextResolver::new(context),
        }
    }

    /// DAO bound to `connection` regardless of the ambient scope
    pub fn pinned(context: ConnectionContext, connection: ScopedConnection) -> Self {
        Self {
            resolver: ContextResolver::pinned(context, connection),
        }
    }

    fn conn(&self) -> Result<Arc<MemConnection>> {
        self.session::<MemConnection>()
    }

    pub async fn create(&self, name: &str, emails: &[&str]) -> Result<UserView> {
        let conn = self.conn()?;
        let id = conn.insert(USERS, [("name", Value::from(name))]).await?;

        let mut accounts = Vec::with_capacity(emails.len());
        for email in emails {
            accounts.push(insert_account(&conn, id, email).await?);
        }

        Ok(UserView {
            user: UserRecord {
                id,
                name: name.to_string(),
            },
            accounts,
        })
    }

    pub async fn find_by_id(&self, id: i64, lock_for_update: bool) -> Result<Option<UserRecord>> {
        let conn = self.conn()?;
        let row = if lock_for_update {
            conn.select_for_update(USERS, id).await?
        } else {
            conn.select_by_id(USERS, id).await?
        };
        row.map(UserRecord::try_from).transpose()
    }

    pub async fn update(&self, user: &UserRecord) -> Result<bool> {
        self.conn()?
            .update(USERS, user.id, [("name", Value::from(user.name.as_str()))])
            .await
    }

    pub async fn find_all(&self) -> Result<Vec<UserRecord>> {
        self.conn()?
            .select_all(USERS)
            .await?
            .into_iter()
            .map(UserRecord::try_from)
            .collect()
    }

    /// Delete the user and its accounts.
    ///
    /// The user row is locked before any account is touched, so a concurrent
    /// account insert either lands first and is deleted too, or waits and
    /// then fails on the missing user. The delete of the user itself never
    /// trips over a freshly added account.
    pub async fn delete_by_id(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let deletion = delete_aggregate(conn.as_ref(), &user_aggregate(), id).await?;
        Ok(deletion.is_some_and(|d| d.parent))
    }

    /// Users that have at least one account, ordered by user id
    pub async fn find_all_with_accounts(&self) -> Result<Vec<UserView>> {
        let conn = self.conn()?;
        let mut views = Vec::new();
        for user in self.find_all().await? {
            let accounts: Vec<AccountRecord> = conn
                .select_where(ACCOUNTS, "user_id", &Value::Integer(user.id))
                .await?
                .into_iter()
                .map(AccountRecord::try_from)
                .collect::<Result<_>>()?;
            if !accounts.is_empty() {
                views.push(UserView { user, accounts });
            }
        }
        Ok(views)
    }
}

pub struct AccountDao {
    resolver: ContextResolver,
}

impl DataAccess for AccountDao {
    fn resolver(&self) -> &ContextResolver {
        &self.resolver
    }
}

impl AccountDao {
    pub fn new(context: ConnectionContext) -> Self {
        Self {
            resolver: ContextResolver::new(context),
        }
    }

    fn conn(&self) -> Result<Arc<MemConnection>> {
        self.session::<MemConnection>()
    }

    pub async fn insert(&self, user_id: i64, email: &str) -> Result<AccountRecord> {
        let conn = self.conn()?;
        insert_account(&conn, user_id, email).await
    }

    pub async fn find_all_by_user_id(&self, user_id: i64) -> Result<Vec<AccountRecord>> {
        self.conn()?
            .select_where(ACCOUNTS, "user_id", &Value::Integer(user_id))
            .await?
            .into_iter()
            .map(AccountRecord::try_from)
            .collect()
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<AccountRecord>> {
        self.conn()?
            .select_where(ACCOUNTS, "email", &Value::from(email))
            .await?
            .into_iter()
            .next()
            .map(AccountRecord::try_from)
            .transpose()
    }

    pub async fn count(&self) -> Result<usize> {
        self.conn()?.count(ACCOUNTS).await
    }
}

async fn insert_account(conn: &MemConnection, user_id: i64, email: &str) -> Result<AccountRecord> {
    let id = conn
        .insert(
            ACCOUNTS,
            [
                ("user_id", Value::Integer(user_id)),
                ("email", Value::from(email)),
            ],
        )
        .await?;
    Ok(AccountRecord {
        id,
        user_id,
        email: email.to_string(),
    })
}
