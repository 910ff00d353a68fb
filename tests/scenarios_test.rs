use std::sync::Arc;
use txscope::memstore::MemConnection;
use txscope::users::{self, USERS, UserDao};
use txscope::{DataAccess, Database, MemoryPool, NoRollback, PoolConfig, Step, TxScope, Value};

fn database() -> Database {
    let pool = MemoryPool::isolated("scenarios", PoolConfig::new("scenarios")).unwrap();
    users::install_schema(pool.store()).unwrap();
    Database::new("scenarios", Arc::new(pool))
}

async fn insert_user(scope: &TxScope, name: &str) -> txscope::Result<i64> {
    scope
        .session::<MemConnection>()?
        .insert(USERS, [("name", Value::from(name))])
        .await
}

async fn user_count(db: &Database) -> usize {
    db.with_connection(true, |scope| async move {
        scope.session::<MemConnection>()?.count(USERS).await
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_commit_makes_insert_visible() {
    let db = database();

    let id = db
        .transaction(None, |scope| async move { Ok(insert_user(&scope, "ann").await?) })
        .await
        .unwrap();

    assert_eq!(id, 1);
    let row = db
        .with_connection(true, |scope| async move {
            scope.session::<MemConnection>()?.select_by_id(USERS, id).await
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get_str("name"), Some("ann"));
}

#[tokio::test]
async fn test_failure_rolls_back_partial_insert() {
    let db = database();

    let err = db
        .transaction(None, |scope| async move {
            insert_user(&scope, "ann").await?;
            insert_user(&scope, "bob").await?;
            Err::<(), _>(anyhow::anyhow!("validation failed"))
        })
        .await
        .unwrap_err();

    assert_eq!(err.failed_step(), Step::Body);
    assert!(!err.was_committed());
    assert!(err.suppressed().is_empty());
    assert_eq!(err.body_error().unwrap().to_string(), "validation failed");
    assert_eq!(user_count(&db).await, 0);
}

#[tokio::test]
async fn test_no_rollback_commits_and_still_fails() {
    let db = database();

    let err = db
        .transaction(None, |scope| async move {
            insert_user(&scope, "ann").await?;
            Err::<(), _>(NoRollback::new("stopping early").into())
        })
        .await
        .unwrap_err();

    assert!(err.was_committed());
    assert!(err.body_error().unwrap().is::<NoRollback>());
    assert_eq!(user_count(&db).await, 1);
}

#[tokio::test]
async fn test_inner_delete_visible_to_outer_before_commit() {
    let db = database();
    let service = users::UserService::new(db.clone());
    let victim = service.create_new_user("victim", &["v@x"]).await.unwrap().user.id;
    let survivor = service.create_new_user("survivor", &[]).await.unwrap().user.id;

    let db_ref = &db;
    let seen = db
        .transaction(None, |outer| async move {
            let dao = UserDao::pinned(db_ref.context().clone(), outer.connection().clone());
            assert!(dao.find_by_id(victim, false).await?.is_some());

            let dao_ref = &dao;
            let outer_conn = outer.connection().clone();
            let deleted = db_ref
                .transaction(None, |inner| async move {
                    assert!(!inner.connection().same_as(&outer_conn));
                    assert_eq!(inner.depth(), 2);
                    let _bound = dao_ref.resolver().bind_temporary(inner.connection().clone())?;
                    assert!(dao_ref.connection()?.same_as(inner.connection()));
                    Ok(dao_ref.delete_by_id(victim).await?)
                })
                .await?;
            assert!(deleted);
            assert!(!dao.resolver().has_temporary_context());
            assert!(dao.connection()?.same_as(outer.connection()));

            let remaining: Vec<i64> = dao.find_all().await?.into_iter().map(|u| u.id).collect();
            Ok(remaining)
        })
        .await
        .unwrap();

    assert_eq!(seen, vec![survivor]);
    assert!(service.get_user(victim).await.unwrap().is_none());
    let accounts = service.accounts();
    let left = db
        .transaction(None, |_| async move { Ok(accounts.count().await?) })
        .await
        .unwrap();
    assert_eq!(left, 0);
}
