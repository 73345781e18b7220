//! SQLite-backed local store.
//!
//! Tables are generated from the registry: one column per schema column,
//! snake_case names, timestamps as INTEGER epoch milliseconds, booleans as
//! 0/1 and `label_ids` as JSON text. Foreign keys are checked by the engine
//! rather than by SQLite so that pulled children can arrive before a parent
//! that failed to pull.
//!
//! The pool holds a single connection. That gives `sqlite::memory:` one shared
//! database and serializes every write through one writer.

use async_trait::async_trait;
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, FromQueryResult,
    QueryResult, Statement,
};
use serde_json::Value;

use crate::error::StoreError;
use crate::protocol;
use crate::queue::{ChangeKey, PendingChange};
use crate::queue_log;
use crate::record::{Fields, ID, Record};
use crate::registry::{Column, ColumnKind, Table, TableMeta};
use crate::store::{LocalStore, Predicate, StoreAdapter};

const SCHEMA_VERSION_KEY: &str = "schema_version";

type Migration = fn() -> Vec<String>;

/// Applied in order; the schema version is the number applied so far.
const MIGRATIONS: &[Migration] = &[initial_schema, owner_indexes];

fn initial_schema() -> Vec<String> {
    Table::ALL
        .into_iter()
        .map(|table| create_table_sql(table.meta()))
        .collect()
}

fn owner_indexes() -> Vec<String> {
    Table::ALL
        .into_iter()
        .map(|table| {
            format!(
                "CREATE INDEX IF NOT EXISTS \"idx_{name}_owner_updated\" ON \"{name}\" (owner_id, updated_at)",
                name = table.name()
            )
        })
        .collect()
}

fn sql_type(kind: ColumnKind) -> &'static str {
    match kind {
        ColumnKind::Text | ColumnKind::IdList => "TEXT",
        ColumnKind::Integer | ColumnKind::Boolean | ColumnKind::Timestamp => "INTEGER",
    }
}

fn create_table_sql(meta: &TableMeta) -> String {
    let columns: Vec<String> = meta
        .columns
        .iter()
        .map(|c| {
            let mut def = format!("\"{}\" {}", c.column, sql_type(c.kind));
            if c.field == ID {
                def.push_str(" PRIMARY KEY");
            } else if !c.nullable {
                def.push_str(" NOT NULL");
            }
            def
        })
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" ({})",
        meta.name,
        columns.join(", ")
    )
}

fn column_list(meta: &TableMeta) -> String {
    meta.columns
        .iter()
        .map(|c| format!("\"{}\"", c.column))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Convert a normalized internal value to a bound SQL value.
fn bind_value(column: &Column, value: &Value) -> Result<sea_orm::Value, StoreError> {
    let bound = match column.kind {
        ColumnKind::Text => value.as_str().map(str::to_string).into(),
        ColumnKind::Integer | ColumnKind::Timestamp => value.as_i64().into(),
        ColumnKind::Boolean => value.as_bool().into(),
        ColumnKind::IdList => {
            let ids: Vec<String> = protocol::parse_id_list(value)?.into_iter().collect();
            Some(serde_json::to_string(&ids)?).into()
        }
    };
    Ok(bound)
}

/// Read one column of a result row back into its internal form.
fn read_value(row: &QueryResult, column: &Column) -> Result<Value, StoreError> {
    let value = match column.kind {
        ColumnKind::Text => row
            .try_get::<Option<String>>("", column.column)?
            .map(Value::String)
            .unwrap_or(Value::Null),
        ColumnKind::Integer | ColumnKind::Timestamp => row
            .try_get::<Option<i64>>("", column.column)?
            .map(Value::from)
            .unwrap_or(Value::Null),
        ColumnKind::Boolean => row
            .try_get::<Option<bool>>("", column.column)?
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        ColumnKind::IdList => {
            let text = row.try_get::<Option<String>>("", column.column)?;
            let ids = match text {
                Some(text) => protocol::parse_id_list(&Value::String(text))?,
                None => Default::default(),
            };
            Value::Array(ids.into_iter().map(Value::String).collect())
        }
    };
    Ok(value)
}

fn decode_row(meta: &TableMeta, row: &QueryResult) -> Result<Record, StoreError> {
    let mut fields = Fields::new();
    for column in meta.columns {
        fields.insert(column.field.to_string(), read_value(row, column)?);
    }
    Ok(Record::new(fields))
}

/// Translate a predicate into a WHERE clause and its bound values.
fn where_clause(
    meta: &TableMeta,
    predicate: &Predicate,
    values: &mut Vec<sea_orm::Value>,
) -> Result<String, StoreError> {
    let clause = match predicate {
        Predicate::All => "1 = 1".to_string(),
        Predicate::Eq(field, value) => {
            let column = meta.field(field).ok_or_else(|| {
                StoreError::validation(format!("{} has no field {field:?}", meta.name))
            })?;
            let normalized = protocol::normalize_value(column, value)?;
            if normalized.is_null() {
                format!("\"{}\" IS NULL", column.column)
            } else {
                values.push(bind_value(column, &normalized)?);
                format!("\"{}\" = ?", column.column)
            }
        }
        Predicate::ModifiedSince(ts) => {
            values.push((*ts).into());
            "updated_at >= ?".to_string()
        }
        Predicate::Dirty => "(synced_at IS NULL OR synced_at < updated_at)".to_string(),
        Predicate::And(parts) => {
            let mut clauses = Vec::with_capacity(parts.len());
            for part in parts {
                clauses.push(where_clause(meta, part, values)?);
            }
            if clauses.is_empty() {
                "1 = 1".to_string()
            } else {
                format!("({})", clauses.join(" AND "))
            }
        }
    };
    Ok(clause)
}

#[derive(Debug, FromQueryResult)]
struct MetaRow {
    value: String,
}

/// Local store on an embedded SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    db: DatabaseConnection,
}

impl SqliteStore {
    /// Connect and bring the schema up to date.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let mut opts = ConnectOptions::new(url);
        opts.max_connections(1).min_connections(1).sqlx_logging(false);
        let db = Database::connect(opts).await?;
        let store = Self { db };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the underlying SeaORM connection.
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn schema_version(&self) -> Result<usize, StoreError> {
        let version = self.load_meta(SCHEMA_VERSION_KEY).await?;
        Ok(version.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        self.db
            .execute_unprepared(
                "CREATE TABLE IF NOT EXISTS _tasksync_meta (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                )",
            )
            .await?;
        queue_log::create_queue_table(&self.db).await?;

        let current = self.schema_version().await?;
        for (index, migration) in MIGRATIONS.iter().enumerate().skip(current) {
            for sql in migration() {
                self.db.execute_unprepared(&sql).await?;
            }
            let version = index + 1;
            self.save_meta(SCHEMA_VERSION_KEY, &version.to_string())
                .await?;
            log::debug!("Applied local schema migration {version}");
        }
        Ok(())
    }

    async fn fetch(
        &self,
        meta: &TableMeta,
        clause: &str,
        values: Vec<sea_orm::Value>,
    ) -> Result<Vec<Record>, StoreError> {
        let sql = format!(
            "SELECT {} FROM \"{}\" WHERE {} ORDER BY created_at ASC, id ASC",
            column_list(meta),
            meta.name,
            clause
        );
        let rows = self
            .db
            .query_all_raw(Statement::from_sql_and_values(
                DatabaseBackend::Sqlite,
                sql,
                values,
            ))
            .await?;
        rows.iter().map(|row| decode_row(meta, row)).collect()
    }
}

#[async_trait]
impl StoreAdapter for SqliteStore {
    async fn get(&self, table: Table, id: &str) -> Result<Option<Record>, StoreError> {
        let meta = table.meta();
        let mut rows = self.fetch(meta, "id = ?", vec![id.into()]).await?;
        Ok(rows.pop())
    }

    async fn query(&self, table: Table, predicate: &Predicate) -> Result<Vec<Record>, StoreError> {
        let meta = table.meta();
        let mut values = Vec::new();
        let clause = where_clause(meta, predicate, &mut values)?;
        self.fetch(meta, &clause, values).await
    }

    async fn create(&self, table: Table, record: &Record) -> Result<Option<Record>, StoreError> {
        let meta = table.meta();
        let record = meta.canonicalize(record.fields())?;
        let id = record
            .id()
            .ok_or_else(|| StoreError::validation(format!("{table} record without id")))?
            .to_string();

        let mut values = Vec::with_capacity(meta.columns.len());
        for column in meta.columns {
            let value = record.get(column.field).unwrap_or(&Value::Null);
            values.push(bind_value(column, value)?);
        }
        let placeholders = vec!["?"; meta.columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO \"{}\" ({}) VALUES ({})",
            meta.name,
            column_list(meta),
            placeholders
        );
        self.db
            .execute_raw(Statement::from_sql_and_values(
                DatabaseBackend::Sqlite,
                sql,
                values,
            ))
            .await?;
        self.get(table, &id).await
    }

    async fn update(
        &self,
        table: Table,
        id: &str,
        patch: &Fields,
    ) -> Result<Option<Record>, StoreError> {
        let meta = table.meta();
        let patch = meta.normalize_patch(patch)?;

        let mut assignments = Vec::new();
        let mut values = Vec::new();
        for (field, value) in &patch {
            if field == ID {
                continue;
            }
            // normalize_patch already rejected unknown fields
            let Some(column) = meta.field(field) else {
                continue;
            };
            assignments.push(format!("\"{}\" = ?", column.column));
            values.push(bind_value(column, value)?);
        }
        if assignments.is_empty() {
            return self.get(table, id).await;
        }
        values.push(id.into());
        let sql = format!(
            "UPDATE \"{}\" SET {} WHERE id = ?",
            meta.name,
            assignments.join(", ")
        );
        let result = self
            .db
            .execute_raw(Statement::from_sql_and_values(
                DatabaseBackend::Sqlite,
                sql,
                values,
            ))
            .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get(table, id).await
    }

    async fn delete(&self, table: Table, id: &str) -> Result<Option<Record>, StoreError> {
        let Some(existing) = self.get(table, id).await? else {
            return Ok(None);
        };
        self.db
            .execute_raw(Statement::from_sql_and_values(
                DatabaseBackend::Sqlite,
                format!("DELETE FROM \"{}\" WHERE id = ?", table.name()),
                [id.into()],
            ))
            .await?;
        Ok(Some(existing))
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn load_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = MetaRow::find_by_statement(Statement::from_sql_and_values(
            DatabaseBackend::Sqlite,
            "SELECT value FROM _tasksync_meta WHERE key = ?",
            [key.into()],
        ))
        .one(&self.db)
        .await?;
        Ok(row.map(|r| r.value))
    }

    async fn save_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.db
            .execute_raw(Statement::from_sql_and_values(
                DatabaseBackend::Sqlite,
                "INSERT OR REPLACE INTO _tasksync_meta (key, value) VALUES (?, ?)",
                [key.into(), value.into()],
            ))
            .await?;
        Ok(())
    }

    async fn save_pending(&self, owner_id: &str, entry: &PendingChange) -> Result<(), StoreError> {
        queue_log::save(&self.db, owner_id, entry).await
    }

    async fn remove_pending(&self, owner_id: &str, key: &ChangeKey) -> Result<(), StoreError> {
        queue_log::remove(&self.db, owner_id, key).await
    }

    async fn load_pending(&self, owner_id: &str) -> Result<Vec<PendingChange>, StoreError> {
        queue_log::load(&self.db, owner_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_table_sql_quotes_reserved_names() {
        let sql = create_table_sql(Table::Subtasks.meta());
        assert!(sql.contains("\"order\" INTEGER NOT NULL"));
        assert!(sql.contains("\"id\" TEXT PRIMARY KEY"));
        assert!(sql.contains("\"synced_at\" INTEGER"));
        assert!(!sql.contains("\"synced_at\" INTEGER NOT NULL"));
    }

    #[test]
    fn test_dirty_predicate_translates_to_sql() {
        let mut values = Vec::new();
        let clause = where_clause(
            Table::Tasks.meta(),
            &Predicate::owner("u1").and(Predicate::Dirty),
            &mut values,
        )
        .unwrap();
        assert_eq!(
            clause,
            "(\"owner_id\" = ? AND (synced_at IS NULL OR synced_at < updated_at))"
        );
        assert_eq!(values.len(), 1);
    }

    #[test]
    fn test_null_equality_uses_is_null() {
        let mut values = Vec::new();
        let clause = where_clause(
            Table::Tasks.meta(),
            &Predicate::eq("projectId", Value::Null),
            &mut values,
        )
        .unwrap();
        assert_eq!(clause, "\"project_id\" IS NULL");
        assert!(values.is_empty());
    }
}
