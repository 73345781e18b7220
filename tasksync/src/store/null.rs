use async_trait::async_trait;

use crate::error::StoreError;
use crate::queue::{ChangeKey, PendingChange};
use crate::record::{Fields, Record};
use crate::registry::Table;
use crate::store::{LocalStore, Predicate, StoreAdapter};

/// Local store for platforms without embedded storage.
///
/// Reads are empty and writes are accepted without being kept. The engine
/// sees `is_persistent() == false` and routes mutations to the remote store.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStore;

#[async_trait]
impl StoreAdapter for NullStore {
    async fn get(&self, _table: Table, _id: &str) -> Result<Option<Record>, StoreError> {
        Ok(None)
    }

    async fn query(&self, _table: Table, _predicate: &Predicate) -> Result<Vec<Record>, StoreError> {
        Ok(Vec::new())
    }

    async fn create(&self, _table: Table, record: &Record) -> Result<Option<Record>, StoreError> {
        Ok(Some(record.clone()))
    }

    async fn update(
        &self,
        _table: Table,
        _id: &str,
        _patch: &Fields,
    ) -> Result<Option<Record>, StoreError> {
        Ok(None)
    }

    async fn delete(&self, _table: Table, _id: &str) -> Result<Option<Record>, StoreError> {
        Ok(None)
    }
}

#[async_trait]
impl LocalStore for NullStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn load_meta(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Ok(None)
    }

    async fn save_meta(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn save_pending(&self, _owner_id: &str, _entry: &PendingChange) -> Result<(), StoreError> {
        Ok(())
    }

    async fn remove_pending(&self, _owner_id: &str, _key: &ChangeKey) -> Result<(), StoreError> {
        Ok(())
    }

    async fn load_pending(&self, _owner_id: &str) -> Result<Vec<PendingChange>, StoreError> {
        Ok(Vec::new())
    }
}
