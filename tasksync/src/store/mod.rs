//! Store adapters.
//!
//! Every store, local or remote, speaks the same [`StoreAdapter`] contract over
//! canonical internal [`Record`]s. The local side additionally implements
//! [`LocalStore`] for sync metadata and the queue journal.
//!
//! Two local implementations exist, chosen once at startup by [`open_local`]:
//! [`SqliteStore`](sqlite::SqliteStore) for platforms with an embedded
//! database and [`NullStore`](null::NullStore) for platforms without one.

pub mod null;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{LocalStorage, SyncConfig};
use crate::error::StoreError;
use crate::queue::{ChangeKey, PendingChange};
use crate::record::{Fields, Record, Timestamp, UPDATED_AT};
use crate::registry::Table;

/// Filter for [`StoreAdapter::query`].
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    All,
    /// Field equals value. Field names are camelCase.
    Eq(String, Value),
    /// `updatedAt >= ts`.
    ModifiedSince(Timestamp),
    /// Never synced, or modified after the last sync. Local stores only.
    Dirty,
    And(Vec<Predicate>),
}

impl Predicate {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Eq(field.into(), value.into())
    }

    pub fn owner(owner_id: &str) -> Self {
        Predicate::eq(crate::record::OWNER_ID, owner_id)
    }

    /// Combine with another predicate, flattening nested conjunctions.
    pub fn and(self, other: Predicate) -> Self {
        let mut parts = match self {
            Predicate::All => Vec::new(),
            Predicate::And(parts) => parts,
            p => vec![p],
        };
        match other {
            Predicate::All => {}
            Predicate::And(more) => parts.extend(more),
            p => parts.push(p),
        }
        match parts.len() {
            0 => Predicate::All,
            1 => parts.remove(0),
            _ => Predicate::And(parts),
        }
    }

    /// Evaluate against a canonical record.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Eq(field, value) => record.get(field).unwrap_or(&Value::Null) == value,
            Predicate::ModifiedSince(ts) => record.timestamp(UPDATED_AT).is_some_and(|u| u >= *ts),
            Predicate::Dirty => record.is_dirty(),
            Predicate::And(parts) => parts.iter().all(|p| p.matches(record)),
        }
    }
}

/// CRUD over the synced tables.
///
/// Records are canonical internal records. `update` takes a partial patch and
/// returns the full record after the patch, or `None` if no row matched;
/// `delete` returns the removed record, or `None` if it did not exist.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    async fn get(&self, table: Table, id: &str) -> Result<Option<Record>, StoreError>;

    async fn query(&self, table: Table, predicate: &Predicate) -> Result<Vec<Record>, StoreError>;

    async fn create(&self, table: Table, record: &Record) -> Result<Option<Record>, StoreError>;

    async fn update(
        &self,
        table: Table,
        id: &str,
        patch: &Fields,
    ) -> Result<Option<Record>, StoreError>;

    async fn delete(&self, table: Table, id: &str) -> Result<Option<Record>, StoreError>;
}

/// The on-device side of sync.
#[async_trait]
pub trait LocalStore: StoreAdapter {
    /// Whether writes survive the process. When `false` the engine sends
    /// mutations straight to the remote store.
    fn is_persistent(&self) -> bool;

    async fn load_meta(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn save_meta(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Journal the current state of a queue entry for `owner_id`.
    async fn save_pending(&self, owner_id: &str, entry: &PendingChange) -> Result<(), StoreError>;

    async fn remove_pending(&self, owner_id: &str, key: &ChangeKey) -> Result<(), StoreError>;

    async fn load_pending(&self, owner_id: &str) -> Result<Vec<PendingChange>, StoreError>;
}

/// Open the local store the configuration asks for. `Auto` picks SQLite
/// wherever the target can run it.
pub async fn open_local(config: &SyncConfig) -> Result<Arc<dyn LocalStore>, StoreError> {
    let use_sqlite = match config.local_storage {
        LocalStorage::Sqlite => true,
        LocalStorage::None => false,
        LocalStorage::Auto => cfg!(not(target_arch = "wasm32")),
    };
    if use_sqlite {
        let store = sqlite::SqliteStore::connect(&config.database_url).await?;
        log::info!("Local store: sqlite at {}", config.database_url);
        Ok(Arc::new(store))
    } else {
        log::info!("Local store: none, mutations go straight to the remote");
        Ok(Arc::new(null::NullStore))
    }
}
