use anyhow::{Result, bail};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use txscope::users::{ACCOUNTS, USERS, UserDao, UserService};
use txscope::{DataAccess, Database, DbError, MemConnection, NoRollback, TransactionError, TxScope, Value};

async fn count(db: &Database, table: &'static str) -> Result<usize> {
    let n = db
        .with_connection(true, |scope| async move {
            scope.session::<MemConnection>()?.count(table).await
        })
        .await?;
    Ok(n)
}

async fn insert_user(scope: &TxScope, name: &str) -> txscope::Result<i64> {
    scope
        .session::<MemConnection>()?
        .insert(USERS, [("name", Value::from(name))])
        .await
}

pub async fn run_scenarios(db: &Database) -> Result<()> {
    // 1: commit
    let before = count(db, USERS).await?;
    let id = db
        .transaction(None, |scope| async move { Ok(insert_user(&scope, "committed").await?) })
        .await?;
    let after = count(db, USERS).await?;
    println!("scenario 1: inserted user {}, {} -> {} rows", id, before, after);

    // 2: rollback
    let before = after;
    let outcome = db
        .transaction(None, |scope| async move {
            insert_user(&scope, "rolled back").await?;
            Err::<(), _>(anyhow::anyhow!("body failed after a partial insert"))
        })
        .await;
    let Err(err) = outcome else {
        bail!("failing body was committed");
    };
    let after = count(db, USERS).await?;
    println!("scenario 2: {} ({} -> {} rows)", err, before, after);

    // 3: commit-despite-failure
    let before = after;
    let outcome = db
        .transaction(None, |scope| async move {
            insert_user(&scope, "kept").await?;
            Err::<(), _>(NoRollback::new("quota reached, keeping partial work").into())
        })
        .await;
    let Err(err) = outcome else {
        bail!("commit-override body reported success");
    };
    let after = count(db, USERS).await?;
    println!(
        "scenario 3: {} (committed: {}, {} -> {} rows)",
        err,
        err.was_committed(),
        before,
        after
    );

    // 4: nested unit-of-work through a temporary context
    let service = UserService::new(db.clone());
    let victim = service.create_new_user("temporary", &[]).await?.user.id;
    let visible_before_commit = db
        .transaction(None, |outer| async move {
            let users = UserDao::pinned(db.context().clone(), outer.connection().clone());
            let users = &users;
            let deleted = db
                .transaction(None, |inner| async move {
                    let _bound = users.resolver().bind_temporary(inner.connection().clone())?;
                    Ok(users.delete_by_id(victim).await?)
                })
                .await?;
            if !deleted {
                bail!("user {} was not deleted", victim);
            }
            Ok(users.find_by_id(victim, false).await?.is_none())
        })
        .await?;
    println!(
        "scenario 4: inner delete of user {} visible to outer before commit: {}",
        victim, visible_before_commit
    );

    Ok(())
}

/// Delete accounts first and the user afterwards, without the user lock
async fn delete_without_parent_lock(db: &Database, user_id: i64) -> Result<bool, TransactionError> {
    db.transaction(None, |scope| async move {
        let conn = scope.session::<MemConnection>()?;
        conn.delete_where(ACCOUNTS, "user_id", &Value::Integer(user_id))
            .await?;
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(conn.delete(USERS, user_id).await?)
    })
    .await
}

#[derive(Debug, Default)]
struct RaceTally {
    deletes_failed: usize,
    inserts_rejected: usize,
    orphaned_accounts: usize,
}

pub async fn run_race(db: &Database, iterations: usize, naive: bool) -> Result<()> {
    let service = Arc::new(UserService::new(db.clone()));
    let mut tally = RaceTally::default();

    for i in 0..iterations {
        let first = format!("user{}-0@example.com", i);
        let user_id = service
            .create_new_user(&format!("user-{}", i), &[first.as_str()])
            .await?
            .user
            .id;

        let deleter = {
            let service = service.clone();
            let db = db.clone();
            tokio::spawn(async move {
                if naive {
                    delete_without_parent_lock(&db, user_id).await
                } else {
                    service.delete_user(user_id).await
                }
            })
        };
        let inserter = {
            let service = service.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                let email = format!("user{}-1@example.com", user_id);
                service.add_account(user_id, &email).await
            })
        };

        if let Err(e) = deleter.await? {
            warn!("delete of user {} failed: {}", user_id, e);
            tally.deletes_failed += 1;
        }
        if let Err(e) = inserter.await? {
            info!("account insert for user {} rejected: {}", user_id, e);
            tally.inserts_rejected += 1;
        }

        let user_gone = service.get_user(user_id).await?.is_none();
        let remaining = db
            .with_connection(true, |scope| async move {
                let conn = scope.session::<MemConnection>()?;
                Ok::<_, DbError>(
                    conn.select_where(ACCOUNTS, "user_id", &Value::Integer(user_id))
                        .await?
                        .len(),
                )
            })
            .await?;
        if user_gone && remaining > 0 {
            tally.orphaned_accounts += remaining;
        }
    }

    println!(
        "{} iteration(s), {}: {:?}",
        iterations,
        if naive { "children first" } else { "parent locked first" },
        tally
    );
    Ok(())
}
