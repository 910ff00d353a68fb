use super::locks::{LockMode, RowKey};
use super::store::{Change, MemoryStore, Row, Table};
use crate::aggregate::{AggregateStore, ChildRef, ParentLock, check_holder};
use crate::connection::Session;
use crate::core::{ConnectionId, DbError, IsolationLevel, Result, Value};
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit};

struct ConnState {
    pending: Vec<Change>,
    isolation: IsolationLevel,
}

/// A connection to a [`MemoryStore`].
///
/// Writes are buffered until commit and guarded by row locks. Reads see the
/// committed state of the store with this connection's own pending changes
/// on top. Whatever the requested isolation level, other connections'
/// changes become visible as soon as they commit.
pub struct MemConnection {
    id: ConnectionId,
    store: Arc<MemoryStore>,
    autocommit: bool,
    lock_timeout: Duration,
    state: Mutex<ConnState>,
    closed: AtomicBool,
    permit: std::sync::Mutex<Option<OwnedSemaphorePermit>>,
}

impl MemConnection {
    pub fn new(
        store: Arc<MemoryStore>,
        autocommit: bool,
        isolation: IsolationLevel,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            id: ConnectionId::next(),
            store,
            autocommit,
            lock_timeout,
            state: Mutex::new(ConnState {
                pending: Vec::new(),
                isolation,
            }),
            closed: AtomicBool::new(false),
            permit: std::sync::Mutex::new(None),
        }
    }

    /// Hold `permit` until the connection is closed
    pub(crate) fn with_permit(self, permit: OwnedSemaphorePermit) -> Self {
        if let Ok(mut slot) = self.permit.lock() {
            *slot = Some(permit);
        }
        self
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Number of buffered changes not yet committed
    pub async fn pending_changes(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::ConnectionClosed(self.id));
        }
        Ok(())
    }

    async fn lock_row(&self, table: &str, id: i64, mode: LockMode) -> Result<()> {
        self.store
            .locks()
            .acquire(self.id, &RowKey::new(table, id), mode, self.lock_timeout)
            .await
    }

    fn view(&self, state: &ConnState, table: &str) -> Result<Table> {
        let mut view = self.store.snapshot(table)?;
        for change in state.pending.iter().filter(|c| c.table() == table) {
            view.apply(change);
        }
        Ok(view)
    }

    /// Buffer `change`, committing right away in autocommit mode
    fn stage(&self, state: &mut ConnState, change: Change) -> Result<()> {
        state.pending.push(change);
        if self.autocommit {
            let applied = self.store.apply(&state.pending);
            state.pending.clear();
            self.store.locks().release_all(self.id);
            applied?;
        }
        Ok(())
    }

    /// Statement end in autocommit mode releases what the statement locked
    fn end_read(&self) {
        if self.autocommit {
            self.store.locks().release_all(self.id);
        }
    }

    /// Insert a row and return its id.
    ///
    /// A row referencing a parent takes a shared lock on that parent, so the
    /// parent cannot be deleted while this transaction is open.
    pub async fn insert<I, K>(&self, table: &str, fields: I) -> Result<i64>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.ensure_open()?;
        let fields: BTreeMap<String, Value> =
            fields.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let def = self.store.table_def(table)?;

        if let Some(fk) = &def.foreign_key {
            if let Some(value) = fields.get(&fk.column) {
                let parent_id = value.as_i64().ok_or_else(|| {
                    DbError::ConstraintViolation(format!(
                        "{}.{} must be an integer, got {}",
                        table,
                        fk.column,
                        value.type_name()
                    ))
                })?;
                self.lock_row(&fk.parent_table, parent_id, LockMode::Shared)
                    .await?;
            }
        }

        let mut state = self.state.lock().await;
        if let Some(fk) = &def.foreign_key {
            if let Some(parent_id) = fields.get(&fk.column).and_then(Value::as_i64) {
                if !self.view(&state, &fk.parent_table)?.rows.contains_key(&parent_id) {
                    self.end_read();
                    return Err(DbError::ConstraintViolation(format!(
                        "{}.{} references missing {}#{}",
                        table, fk.column, fk.parent_table, parent_id
                    )));
                }
            }
        }

        let id = self.store.next_id(table)?;
        if let Some((column, value)) = self.view(&state, table)?.unique_conflict(id, &fields) {
            self.end_read();
            return Err(DbError::ConstraintViolation(format!(
                "duplicate {}.{} = {}",
                table, column, value
            )));
        }

        debug!("{} insert {}#{}", self.id, table, id);
        let row = Row { id, fields };
        self.stage(
            &mut state,
            Change::Insert {
                table: table.to_string(),
                row,
            },
        )?;
        Ok(id)
    }

    pub async fn select_by_id(&self, table: &str, id: i64) -> Result<Option<Row>> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        Ok(self.view(&state, table)?.rows.remove(&id))
    }

    /// Select a row and lock it exclusively until the transaction ends
    pub async fn select_for_update(&self, table: &str, id: i64) -> Result<Option<Row>> {
        self.ensure_open()?;
        self.lock_row(table, id, LockMode::Exclusive).await?;
        let state = self.state.lock().await;
        let row = self.view(&state, table)?.rows.remove(&id);
        self.end_read();
        Ok(row)
    }

    /// Rows whose `column` equals `value`, ordered by id
    pub async fn select_where(&self, table: &str, column: &str, value: &Value) -> Result<Vec<Row>> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        Ok(self.view(&state, table)?.matching(column, value))
    }

    pub async fn select_all(&self, table: &str) -> Result<Vec<Row>> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        Ok(self.view(&state, table)?.rows.into_values().collect())
    }

    pub async fn count(&self, table: &str) -> Result<usize> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        Ok(self.view(&state, table)?.rows.len())
    }

    /// Overwrite the given columns of `table#id`. Returns false when the row
    /// does not exist.
    pub async fn update<I, K>(&self, table: &str, id: i64, fields: I) -> Result<bool>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.ensure_open()?;
        let fields: BTreeMap<String, Value> =
            fields.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self.lock_row(table, id, LockMode::Exclusive).await?;

        let mut state = self.state.lock().await;
        let view = self.view(&state, table)?;
        if !view.rows.contains_key(&id) {
            self.end_read();
            return Ok(false);
        }
        if let Some((column, value)) = view.unique_conflict(id, &fields) {
            self.end_read();
            return Err(DbError::ConstraintViolation(format!(
                "duplicate {}.{} = {}",
                table, column, value
            )));
        }

        debug!("{} update {}#{}", self.id, table, id);
        self.stage(
            &mut state,
            Change::Update {
                table: table.to_string(),
                id,
                fields,
            },
        )?;
        Ok(true)
    }

    /// Delete `table#id`. Returns false when the row does not exist.
    ///
    /// Fails with a constraint violation while rows visible to this
    /// connection still reference it.
    pub async fn delete(&self, table: &str, id: i64) -> Result<bool> {
        self.ensure_open()?;
        self.lock_row(table, id, LockMode::Exclusive).await?;
        let referencing = self.store.referencing(table)?;

        let mut state = self.state.lock().await;
        if !self.view(&state, table)?.rows.contains_key(&id) {
            self.end_read();
            return Ok(false);
        }
        for child in &referencing {
            if let Some(fk) = &child.foreign_key {
                let children = self
                    .view(&state, &child.name)?
                    .matching(&fk.column, &Value::Integer(id));
                if !children.is_empty() {
                    self.end_read();
                    return Err(DbError::ConstraintViolation(format!(
                        "{}#{} is still referenced by {} row(s) of {}",
                        table,
                        id,
                        children.len(),
                        child.name
                    )));
                }
            }
        }

        debug!("{} delete {}#{}", self.id, table, id);
        self.stage(
            &mut state,
            Change::Delete {
                table: table.to_string(),
                id,
            },
        )?;
        Ok(true)
    }

    /// Delete every row whose `column` equals `value`
    pub async fn delete_where(&self, table: &str, column: &str, value: &Value) -> Result<u64> {
        let ids: Vec<i64> = self
            .select_where(table, column, value)
            .await?
            .into_iter()
            .map(|row| row.id)
            .collect();

        let mut deleted = 0;
        for id in ids {
            if self.delete(table, id).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

#[async_trait]
impl Session for MemConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_autocommit(&self) -> bool {
        self.autocommit
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn commit(&self) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        if !state.pending.is_empty() {
            self.store.apply(&state.pending)?;
            debug!("{} committed {} change(s)", self.id, state.pending.len());
            state.pending.clear();
        }
        self.store.locks().release_all(self.id);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        if !state.pending.is_empty() {
            debug!("{} discarded {} change(s)", self.id, state.pending.len());
            state.pending.clear();
        }
        self.store.locks().release_all(self.id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        if !state.pending.is_empty() {
            warn!(
                "{} closed with {} uncommitted change(s), discarding",
                self.id,
                state.pending.len()
            );
            state.pending.clear();
        }
        self.store.locks().release_all(self.id);
        self.permit.lock()?.take();
        debug!("{} closed", self.id);
        Ok(())
    }

    async fn isolation_level(&self) -> Result<IsolationLevel> {
        self.ensure_open()?;
        Ok(self.state.lock().await.isolation)
    }

    async fn set_isolation_level(&self, level: IsolationLevel) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        if !state.pending.is_empty() {
            return Err(DbError::ExecutionError(format!(
                "cannot change isolation level of {} with {} pending change(s)",
                self.id,
                state.pending.len()
            )));
        }
        state.isolation = level;
        Ok(())
    }
}

#[async_trait]
impl AggregateStore for MemConnection {
    fn holder(&self) -> ConnectionId {
        self.id
    }

    async fn lock_parent(&self, table: &str, id: i64) -> Result<bool> {
        Ok(self.select_for_update(table, id).await?.is_some())
    }

    async fn delete_children(&self, lock: &ParentLock, child: &ChildRef) -> Result<u64> {
        check_holder(lock, self.id)?;
        self.delete_where(&child.table, &child.column, &Value::Integer(lock.id()))
            .await
    }

    async fn delete_parent(&self, lock: &ParentLock) -> Result<bool> {
        check_holder(lock, self.id)?;
        self.delete(&lock.spec().parent_table, lock.id()).await
    }
}
