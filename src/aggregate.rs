// ============================================================================
// Aggregate Deletion Protocol
// ============================================================================
//
// Deleting a parent row together with the children that reference it must
// take the parent's exclusive lock FIRST. A concurrent child insert holds a
// shared lock on the same parent, so with the parent locked up front the two
// serialize and no child can slip in between "delete children" and
// "delete parent".
//
// The order is enforced by types: child and parent deletes need a
// ParentLock, and only lock_aggregate can mint one.
//
// ============================================================================

use crate::core::{ConnectionId, DbError, Result};
use async_trait::async_trait;
use log::debug;

/// Child table referencing the aggregate root through `column`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildRef {
    pub table: String,
    pub column: String,
}

/// Root table of an aggregate plus the tables that reference it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateSpec {
    pub parent_table: String,
    pub children: Vec<ChildRef>,
}

impl AggregateSpec {
    pub fn new(parent_table: &str) -> Self {
        Self {
            parent_table: parent_table.to_string(),
            children: Vec::new(),
        }
    }

    pub fn child(mut self, table: &str, column: &str) -> Self {
        self.children.push(ChildRef {
            table: table.to_string(),
            column: column.to_string(),
        });
        self
    }
}

/// Proof that `holder` owns the exclusive lock on a parent row.
#[derive(Debug)]
pub struct ParentLock {
    spec: AggregateSpec,
    id: i64,
    holder: ConnectionId,
}

impl ParentLock {
    pub fn spec(&self) -> &AggregateSpec {
        &self.spec
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// Connection holding the lock
    pub fn holder(&self) -> ConnectionId {
        self.holder
    }
}

/// Storage operations the deletion protocol is built from.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Connection the operations run on
    fn holder(&self) -> ConnectionId;

    /// Take the exclusive row lock on `table#id`. Returns false when the row
    /// does not exist.
    async fn lock_parent(&self, table: &str, id: i64) -> Result<bool>;

    /// Delete the rows of `child` that reference the locked parent
    async fn delete_children(&self, lock: &ParentLock, child: &ChildRef) -> Result<u64>;

    /// Delete the locked parent row itself
    async fn delete_parent(&self, lock: &ParentLock) -> Result<bool>;
}

/// Outcome of deleting a whole aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AggregateDeletion {
    pub children: u64,
    pub parent: bool,
}

/// A parent row locked on `store`, ready for deletion
pub struct LockedParent<'a, S: AggregateStore + ?Sized> {
    store: &'a S,
    lock: ParentLock,
}

impl<'a, S: AggregateStore + ?Sized> LockedParent<'a, S> {
    pub fn lock(&self) -> &ParentLock {
        &self.lock
    }

    /// Delete the children of every child table, in declaration order
    pub async fn delete_children(&self) -> Result<u64> {
        let mut deleted = 0;
        for child in &self.lock.spec.children {
            let n = self.store.delete_children(&self.lock, child).await?;
            debug!(
                "Deleted {} row(s) from {} for {}#{}",
                n, child.table, self.lock.spec.parent_table, self.lock.id
            );
            deleted += n;
        }
        Ok(deleted)
    }

    /// Delete the children and then the parent
    pub async fn delete(self) -> Result<AggregateDeletion> {
        let children = self.delete_children().await?;
        let parent = self.store.delete_parent(&self.lock).await?;
        Ok(AggregateDeletion { children, parent })
    }
}

/// Lock the parent row of an aggregate.
///
/// Returns `None` when the parent does not exist.
pub async fn lock_aggregate<'a, S>(
    store: &'a S,
    spec: &AggregateSpec,
    id: i64,
) -> Result<Option<LockedParent<'a, S>>>
where
    S: AggregateStore + ?Sized,
{
    if !store.lock_parent(&spec.parent_table, id).await? {
        debug!("{}#{} not found, nothing to lock", spec.parent_table, id);
        return Ok(None);
    }
    Ok(Some(LockedParent {
        store,
        lock: ParentLock {
            spec: spec.clone(),
            id,
            holder: store.holder(),
        },
    }))
}

/// Lock the parent, delete its children, delete the parent.
///
/// Returns `None` when the parent does not exist.
pub async fn delete_aggregate<S>(
    store: &S,
    spec: &AggregateSpec,
    id: i64,
) -> Result<Option<AggregateDeletion>>
where
    S: AggregateStore + ?Sized,
{
    match lock_aggregate(store, spec, id).await? {
        Some(locked) => locked.delete().await.map(Some),
        None => Ok(None),
    }
}

/// Reject a lock minted on another connection
pub fn check_holder(lock: &ParentLock, holder: ConnectionId) -> Result<()> {
    if lock.holder != holder {
        return Err(DbError::ExecutionError(format!(
            "lock on {}#{} is held by {}, not {}",
            lock.spec.parent_table, lock.id, lock.holder, holder
        )));
    }
    Ok(())
}
