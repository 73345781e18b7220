//! In-process remote backend.
//!
//! Holds snake_case wire rows exactly as a hosted backend would, so every
//! record crossing it goes through the same boundary codec as with
//! [`RestRemote`](crate::remote::RestRemote). Connectivity, per-record
//! rejection and latency can be switched at runtime, which makes it the
//! backend of choice for exercising the engine in tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::connectivity::ReachabilityProbe;
use crate::error::StoreError;
use crate::protocol;
use crate::record::{Fields, ID, Record};
use crate::registry::Table;
use crate::store::{Predicate, StoreAdapter};

type WireRow = Map<String, Value>;

#[derive(Default)]
pub struct MemoryRemote {
    rows: Mutex<HashMap<Table, BTreeMap<String, WireRow>>>,
    offline: AtomicBool,
    rejected: Mutex<HashSet<(Table, String)>>,
    latency: Mutex<Option<Duration>>,
    writes: AtomicUsize,
}

fn contains_dirty(predicate: &Predicate) -> bool {
    match predicate {
        Predicate::Dirty => true,
        Predicate::And(parts) => parts.iter().any(contains_dirty),
        _ => false,
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }

    /// Reject every write to this record with a validation error.
    pub fn reject(&self, table: Table, id: &str) {
        self.rejected.lock().unwrap().insert((table, id.to_string()));
    }

    pub fn accept(&self, table: Table, id: &str) {
        self.rejected.lock().unwrap().remove(&(table, id.to_string()));
    }

    /// Delay every request by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap() = latency;
    }

    /// The stored wire row, as a backend would return it.
    pub fn row(&self, table: Table, id: &str) -> Option<WireRow> {
        self.rows
            .lock()
            .unwrap()
            .get(&table)
            .and_then(|rows| rows.get(id))
            .cloned()
    }

    /// Store a wire row directly, as if another device had written it.
    pub fn insert_wire(&self, table: Table, row: Value) -> Result<(), StoreError> {
        let record = protocol::from_wire(table, &row)?;
        let wire = protocol::to_wire(table, record.fields())?;
        let id = record
            .id()
            .ok_or_else(|| StoreError::validation(format!("{table} row without id")))?
            .to_string();
        self.rows
            .lock()
            .unwrap()
            .entry(table)
            .or_default()
            .insert(id, wire);
        Ok(())
    }

    pub fn len(&self, table: Table) -> usize {
        self.rows
            .lock()
            .unwrap()
            .get(&table)
            .map_or(0, BTreeMap::len)
    }

    /// Number of create/update/delete requests that reached the backend.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<(), StoreError> {
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.is_online() {
            Ok(())
        } else {
            Err(StoreError::Connectivity("remote unreachable".into()))
        }
    }

    async fn enter_write(&self, table: Table, id: &str) -> Result<(), StoreError> {
        self.enter().await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self
            .rejected
            .lock()
            .unwrap()
            .contains(&(table, id.to_string()))
        {
            return Err(StoreError::validation(format!("{table}/{id} rejected")));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreAdapter for MemoryRemote {
    async fn get(&self, table: Table, id: &str) -> Result<Option<Record>, StoreError> {
        self.enter().await?;
        self.row(table, id)
            .map(|row| protocol::from_wire(table, &Value::Object(row)))
            .transpose()
    }

    async fn query(&self, table: Table, predicate: &Predicate) -> Result<Vec<Record>, StoreError> {
        self.enter().await?;
        if contains_dirty(predicate) {
            return Err(StoreError::Unsupported(
                "dirty filter on the remote store".into(),
            ));
        }
        let rows: Vec<WireRow> = self
            .rows
            .lock()
            .unwrap()
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        let mut records = Vec::new();
        for row in rows {
            let record = protocol::from_wire(table, &Value::Object(row))?;
            if predicate.matches(&record) {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.updated_at());
        Ok(records)
    }

    async fn create(&self, table: Table, record: &Record) -> Result<Option<Record>, StoreError> {
        let id = record
            .id()
            .ok_or_else(|| StoreError::validation(format!("{table} record without id")))?
            .to_string();
        self.enter_write(table, &id).await?;
        let row = protocol::to_wire(table, record.fields())?;
        let stored = protocol::from_wire(table, &Value::Object(row.clone()))?;
        let mut rows = self.rows.lock().unwrap();
        let table_rows = rows.entry(table).or_default();
        if table_rows.contains_key(&id) {
            return Err(StoreError::Conflict(format!(
                "duplicate key value violates unique constraint \"{table}_pkey\""
            )));
        }
        table_rows.insert(id, row);
        Ok(Some(stored))
    }

    async fn update(
        &self,
        table: Table,
        id: &str,
        patch: &Fields,
    ) -> Result<Option<Record>, StoreError> {
        self.enter_write(table, id).await?;
        let mut changes = protocol::to_wire(table, patch)?;
        changes.remove(ID);
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows.get_mut(&table).and_then(|rows| rows.get_mut(id)) else {
            return Ok(None);
        };
        row.extend(changes);
        protocol::from_wire(table, &Value::Object(row.clone())).map(Some)
    }

    async fn delete(&self, table: Table, id: &str) -> Result<Option<Record>, StoreError> {
        self.enter_write(table, id).await?;
        let removed = self
            .rows
            .lock()
            .unwrap()
            .get_mut(&table)
            .and_then(|rows| rows.remove(id));
        removed
            .map(|row| protocol::from_wire(table, &Value::Object(row)))
            .transpose()
    }
}

#[async_trait]
impl ReachabilityProbe for MemoryRemote {
    async fn probe(&self) -> bool {
        self.is_online()
    }
}
