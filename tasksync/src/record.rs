//! The row-shaped record that flows through stores, the queue and the engine.
//!
//! Internally every record is a JSON object keyed by camelCase field names,
//! with timestamps held as epoch milliseconds and `labelIds` as a sorted JSON
//! array. Conversion to and from the remote snake_case shape lives in
//! [`protocol`](crate::protocol).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// Milliseconds since the Unix epoch, UTC.
pub type Timestamp = i64;

/// A set of camelCase fields: a full record body or a partial patch.
pub type Fields = serde_json::Map<String, Value>;

pub const ID: &str = "id";
pub const OWNER_ID: &str = "ownerId";
pub const CREATED_AT: &str = "createdAt";
pub const UPDATED_AT: &str = "updatedAt";
pub const SYNCED_AT: &str = "syncedAt";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Fields);

impl Record {
    pub fn new(fields: Fields) -> Self {
        Record(fields)
    }

    /// Wrap a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self, StoreError> {
        match value {
            Value::Object(fields) => Ok(Record(fields)),
            other => Err(StoreError::validation(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get(ID).and_then(Value::as_str)
    }

    pub fn owner_id(&self) -> Option<&str> {
        self.0.get(OWNER_ID).and_then(Value::as_str)
    }

    pub fn updated_at(&self) -> Option<Timestamp> {
        self.timestamp(UPDATED_AT)
    }

    pub fn synced_at(&self) -> Option<Timestamp> {
        self.timestamp(SYNCED_AT)
    }

    pub fn timestamp(&self, field: &str) -> Option<Timestamp> {
        self.0.get(field).and_then(Value::as_i64)
    }

    /// A record is dirty when it has never been synced or was modified after
    /// its last confirmed sync.
    pub fn is_dirty(&self) -> bool {
        match (self.updated_at(), self.synced_at()) {
            (_, None) => true,
            (Some(updated), Some(synced)) => synced < updated,
            (None, Some(_)) => false,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(field.into(), value.into());
    }

    /// Apply a patch; fields in `patch` win.
    pub fn merge(&mut self, patch: &Fields) {
        for (field, value) in patch {
            self.0.insert(field.clone(), value.clone());
        }
    }

    /// Compare two records on everything except the local sync marker.
    pub fn same_content(&self, other: &Record) -> bool {
        let strip = |fields: &Fields| -> Fields {
            fields
                .iter()
                .filter(|(k, _)| k.as_str() != SYNCED_AT)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        strip(&self.0) == strip(&other.0)
    }

    /// The record without its local-only fields, ready to be pushed.
    pub fn without_local_fields(&self) -> Record {
        let mut fields = self.0.clone();
        fields.remove(SYNCED_AT);
        Record(fields)
    }

    pub fn fields(&self) -> &Fields {
        &self.0
    }

    pub fn into_fields(self) -> Fields {
        self.0
    }
}

impl From<Fields> for Record {
    fn from(fields: Fields) -> Self {
        Record(fields)
    }
}
