use serde::{Deserialize, Serialize};

use crate::queue::Operation;
use crate::registry::Table;

/// Where a change to the local store came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOrigin {
    /// A mutation submitted on this device.
    Local,
    /// A record merged in by a pull.
    Remote,
}

/// Lightweight notification emitted after a record changes locally.
///
/// Subscribers re-read the record if they need its contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub table: Table,
    pub record_id: String,
    pub operation: Operation,
    pub origin: ChangeOrigin,
}
