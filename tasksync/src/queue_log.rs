//! Persistent journal of the change queue.
//!
//! The `_tasksync_queue` table mirrors the in-memory [`ChangeQueue`] so that
//! pending mutations survive a restart:
//! - every enqueue writes the folded entry (INSERT OR REPLACE by owner and key)
//! - every confirmed push or discard removes it
//! - [`SyncEngineBuilder::build()`](crate::SyncEngineBuilder::build) reloads it
//!
//! [`ChangeQueue`]: crate::queue::ChangeQueue

use sea_orm::{ConnectionTrait, DatabaseBackend, DbErr, ExecResult, FromQueryResult, Statement};

use crate::error::StoreError;
use crate::queue::{ChangeKey, EntryState, Operation, PendingChange};
use crate::record::Fields;

/// Create the `_tasksync_queue` table if it does not already exist.
pub async fn create_queue_table(db: &impl ConnectionTrait) -> Result<ExecResult, DbErr> {
    db.execute_unprepared(
        "CREATE TABLE IF NOT EXISTS _tasksync_queue (
            owner_id TEXT NOT NULL,
            table_name TEXT NOT NULL,
            record_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload TEXT NOT NULL,
            revision INTEGER NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            state TEXT NOT NULL,
            sequence INTEGER NOT NULL,
            enqueued_at INTEGER NOT NULL,
            PRIMARY KEY (owner_id, table_name, record_id)
        )",
    )
    .await
}

/// Write the current state of one queue entry.
pub async fn save(
    db: &impl ConnectionTrait,
    owner_id: &str,
    entry: &PendingChange,
) -> Result<(), StoreError> {
    let payload = serde_json::to_string(&entry.payload)?;
    db.execute_raw(Statement::from_sql_and_values(
        DatabaseBackend::Sqlite,
        "INSERT OR REPLACE INTO _tasksync_queue
            (owner_id, table_name, record_id, operation, payload, revision, attempts, state, sequence, enqueued_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        [
            owner_id.into(),
            entry.key.table.name().into(),
            entry.key.record_id.clone().into(),
            entry.operation.as_str().into(),
            payload.into(),
            (entry.revision as i64).into(),
            (entry.attempts as i64).into(),
            entry.state.as_str().into(),
            (entry.sequence as i64).into(),
            entry.enqueued_at.into(),
        ],
    ))
    .await?;
    Ok(())
}

pub async fn remove(
    db: &impl ConnectionTrait,
    owner_id: &str,
    key: &ChangeKey,
) -> Result<(), StoreError> {
    db.execute_raw(Statement::from_sql_and_values(
        DatabaseBackend::Sqlite,
        "DELETE FROM _tasksync_queue WHERE owner_id = ? AND table_name = ? AND record_id = ?",
        [
            owner_id.into(),
            key.table.name().into(),
            key.record_id.clone().into(),
        ],
    ))
    .await?;
    Ok(())
}

#[derive(Debug, FromQueryResult)]
struct QueueRow {
    table_name: String,
    record_id: String,
    operation: String,
    payload: String,
    revision: i64,
    attempts: i64,
    state: String,
    sequence: i64,
    enqueued_at: i64,
}

impl QueueRow {
    fn into_change(self) -> Result<PendingChange, StoreError> {
        let table = self.table_name.parse()?;
        let operation = Operation::parse(&self.operation).ok_or_else(|| {
            StoreError::validation(format!("unknown queued operation {:?}", self.operation))
        })?;
        let state = EntryState::parse(&self.state).unwrap_or(EntryState::Pending);
        let payload: Fields = serde_json::from_str(&self.payload)?;
        Ok(PendingChange {
            key: ChangeKey::new(table, self.record_id),
            operation,
            payload,
            revision: self.revision as u64,
            attempts: self.attempts as u32,
            state,
            sequence: self.sequence as u64,
            enqueued_at: self.enqueued_at,
        })
    }
}

/// Load an owner's journaled entries in push order. Rows that no longer
/// decode are skipped with a warning.
pub async fn load(
    db: &impl ConnectionTrait,
    owner_id: &str,
) -> Result<Vec<PendingChange>, StoreError> {
    let rows = QueueRow::find_by_statement(Statement::from_sql_and_values(
        DatabaseBackend::Sqlite,
        "SELECT table_name, record_id, operation, payload, revision, attempts, state, sequence, enqueued_at
         FROM _tasksync_queue WHERE owner_id = ? ORDER BY sequence ASC",
        [owner_id.into()],
    ))
    .all(db)
    .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let key = format!("{}/{}", row.table_name, row.record_id);
        match row.into_change() {
            Ok(entry) => entries.push(entry),
            Err(e) => log::warn!("Skipping unreadable queue entry {key}: {e}"),
        }
    }
    Ok(entries)
}
