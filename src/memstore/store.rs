use super::locks::LockManager;
use crate::core::{DbError, Result, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

/// Reference from a column to the id of a row in `parent_table`.
///
/// Deleting a referenced parent is restricted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: String,
    pub parent_table: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub unique: Vec<String>,
    pub foreign_key: Option<ForeignKey>,
}

impl TableDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            unique: Vec::new(),
            foreign_key: None,
        }
    }

    pub fn unique(mut self, column: &str) -> Self {
        self.unique.push(column.to_string());
        self
    }

    pub fn references(mut self, column: &str, parent_table: &str) -> Self {
        self.foreign_key = Some(ForeignKey {
            column: column.to_string(),
            parent_table: parent_table.to_string(),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: i64,
    pub fields: BTreeMap<String, Value>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(Value::as_i64)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Value::as_str)
    }

    /// Column value, treating the implicit `id` column like any other
    pub(crate) fn column(&self, column: &str) -> Option<Value> {
        if column == "id" {
            Some(Value::Integer(self.id))
        } else {
            self.fields.get(column).cloned()
        }
    }
}

/// A buffered, not yet committed modification
#[derive(Debug, Clone)]
pub(crate) enum Change {
    Insert { table: String, row: Row },
    Update { table: String, id: i64, fields: BTreeMap<String, Value> },
    Delete { table: String, id: i64 },
}

impl Change {
    pub(crate) fn table(&self) -> &str {
        match self {
            Change::Insert { table, .. }
            | Change::Update { table, .. }
            | Change::Delete { table, .. } => table,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Table {
    pub def: TableDef,
    pub rows: BTreeMap<i64, Row>,
    sequence: Arc<AtomicI64>,
}

impl Table {
    fn new(def: TableDef) -> Self {
        Self {
            def,
            rows: BTreeMap::new(),
            sequence: Arc::new(AtomicI64::new(1)),
        }
    }

    pub(crate) fn apply(&mut self, change: &Change) {
        match change {
            Change::Insert { row, .. } => {
                self.rows.insert(row.id, row.clone());
            }
            Change::Update { id, fields, .. } => {
                if let Some(row) = self.rows.get_mut(id) {
                    row.fields
                        .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
            Change::Delete { id, .. } => {
                self.rows.remove(id);
            }
        }
    }

    /// Rows whose `column` equals `value`
    pub(crate) fn matching(&self, column: &str, value: &Value) -> Vec<Row> {
        self.rows
            .values()
            .filter(|row| row.column(column).as_ref() == Some(value))
            .cloned()
            .collect()
    }

    /// First unique column on which `fields` collides with a row other than `id`
    pub(crate) fn unique_conflict(
        &self,
        id: i64,
        fields: &BTreeMap<String, Value>,
    ) -> Option<(String, Value)> {
        for column in &self.def.unique {
            let Some(value) = fields.get(column) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let taken = self
                .rows
                .values()
                .any(|row| row.id != id && row.get(column) == Some(value));
            if taken {
                return Some((column.clone(), value.clone()));
            }
        }
        None
    }
}

/// Committed state of an in-memory database.
///
/// Tables live behind one lock so a commit swaps them in a single step.
/// Row locks are kept in the store's [`LockManager`], shared by all its
/// connections.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<BTreeMap<String, Table>>,
    locks: LockManager,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn create_table(&self, def: TableDef) -> Result<()> {
        let mut tables = self.tables.write()?;
        if tables.contains_key(&def.name) {
            return Err(DbError::TableExists(def.name));
        }
        if let Some(fk) = &def.foreign_key {
            if !tables.contains_key(&fk.parent_table) {
                return Err(DbError::TableNotFound(fk.parent_table.clone()));
            }
        }
        tables.insert(def.name.clone(), Table::new(def));
        Ok(())
    }

    pub fn table_names(&self) -> Result<Vec<String>> {
        Ok(self.tables.read()?.keys().cloned().collect())
    }

    pub fn table_def(&self, name: &str) -> Result<TableDef> {
        self.tables
            .read()?
            .get(name)
            .map(|t| t.def.clone())
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }

    /// Tables holding a foreign key to `parent`
    pub fn referencing(&self, parent: &str) -> Result<Vec<TableDef>> {
        Ok(self
            .tables
            .read()?
            .values()
            .filter(|t| {
                t.def
                    .foreign_key
                    .as_ref()
                    .is_some_and(|fk| fk.parent_table == parent)
            })
            .map(|t| t.def.clone())
            .collect())
    }

    /// Allocate the next row id of `table`. Ids are never reused.
    pub(crate) fn next_id(&self, table: &str) -> Result<i64> {
        let tables = self.tables.read()?;
        let table = tables
            .get(table)
            .ok_or_else(|| DbError::TableNotFound(table.to_string()))?;
        Ok(table.sequence.fetch_add(1, Ordering::SeqCst))
    }

    /// Copy of the committed table
    pub(crate) fn snapshot(&self, name: &str) -> Result<Table> {
        self.tables
            .read()?
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }

    /// Committed rows of `table`, ordered by id
    pub fn committed_rows(&self, table: &str) -> Result<Vec<Row>> {
        Ok(self.snapshot(table)?.rows.into_values().collect())
    }

    /// Apply `changes` atomically.
    ///
    /// Constraints are checked against the resulting state; on a violation
    /// nothing is applied.
    pub(crate) fn apply(&self, changes: &[Change]) -> Result<()> {
        let mut tables = self.tables.write()?;
        let mut next = tables.clone();
        for change in changes {
            let table = next
                .get_mut(change.table())
                .ok_or_else(|| DbError::TableNotFound(change.table().to_string()))?;
            table.apply(change);
        }
        validate(&next)?;
        *tables = next;
        Ok(())
    }
}

fn validate(tables: &BTreeMap<String, Table>) -> Result<()> {
    for table in tables.values() {
        for column in &table.def.unique {
            let mut seen = HashSet::new();
            for row in table.rows.values() {
                match row.get(column) {
                    Some(value) if !value.is_null() => {
                        if !seen.insert(value) {
                            return Err(DbError::ConstraintViolation(format!(
                                "duplicate {}.{} = {}",
                                table.def.name, column, value
                            )));
                        }
                    }
                    _ => {}
                }
            }
        }

        let Some(fk) = &table.def.foreign_key else {
            continue;
        };
        let parent = tables
            .get(&fk.parent_table)
            .ok_or_else(|| DbError::TableNotFound(fk.parent_table.clone()))?;
        for row in table.rows.values() {
            let Some(parent_id) = row.get_i64(&fk.column) else {
                continue;
            };
            if !parent.rows.contains_key(&parent_id) {
                return Err(DbError::ConstraintViolation(format!(
                    "{}#{} references missing {}#{}",
                    table.def.name, row.id, fk.parent_table, parent_id
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.create_table(TableDef::new("users")).unwrap();
        store
            .create_table(
                TableDef::new("accounts")
                    .unique("email")
                    .references("user_id", "users"),
            )
            .unwrap();
        store
    }

    fn row(id: i64, fields: &[(&str, Value)]) -> Row {
        Row {
            id,
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    fn insert(table: &str, row: Row) -> Change {
        Change::Insert {
            table: table.to_string(),
            row,
        }
    }

    #[test]
    fn test_create_table_checks_names() {
        let store = store();
        assert!(matches!(
            store.create_table(TableDef::new("users")),
            Err(DbError::TableExists(_))
        ));
        assert!(matches!(
            store.create_table(TableDef::new("orders").references("user_id", "customers")),
            Err(DbError::TableNotFound(_))
        ));
        assert_eq!(store.referencing("users").unwrap()[0].name, "accounts");
    }

    #[test]
    fn test_sequences_are_per_table() {
        let store = store();
        assert_eq!(store.next_id("users").unwrap(), 1);
        assert_eq!(store.next_id("users").unwrap(), 2);
        assert_eq!(store.next_id("accounts").unwrap(), 1);
    }

    #[test]
    fn test_apply_is_all_or_nothing() {
        let store = store();
        store
            .apply(&[insert("users", row(1, &[("name", "ann".into())]))])
            .unwrap();

        let orphan = [
            insert("accounts", row(1, &[("user_id", Value::Integer(1)), ("email", "a@x".into())])),
            insert("accounts", row(2, &[("user_id", Value::Integer(9)), ("email", "b@x".into())])),
        ];
        let err = store.apply(&orphan).unwrap_err();
        assert!(matches!(err, DbError::ConstraintViolation(_)));
        assert!(store.committed_rows("accounts").unwrap().is_empty());
    }

    #[test]
    fn test_unique_checked_on_apply() {
        let store = store();
        store
            .apply(&[
                insert("users", row(1, &[("name", "ann".into())])),
                insert("accounts", row(1, &[("user_id", Value::Integer(1)), ("email", "a@x".into())])),
            ])
            .unwrap();

        let dup = [insert("accounts", row(2, &[("user_id", Value::Integer(1)), ("email", "a@x".into())]))];
        assert!(store.apply(&dup).is_err());
    }

    #[test]
    fn test_restrict_on_parent_delete() {
        let store = store();
        store
            .apply(&[
                insert("users", row(1, &[("name", "ann".into())])),
                insert("accounts", row(1, &[("user_id", Value::Integer(1)), ("email", "a@x".into())])),
            ])
            .unwrap();

        let delete_parent = [Change::Delete {
            table: "users".into(),
            id: 1,
        }];
        assert!(store.apply(&delete_parent).is_err());
        assert_eq!(store.committed_rows("users").unwrap().len(), 1);
    }
}
