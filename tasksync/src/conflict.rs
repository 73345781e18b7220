//! Pull-side merge policy.
//!
//! A pulled remote record is compared against the local copy of the same row.
//! Local edits that have not been confirmed by a push always win: a record is
//! kept if it is dirty or has a pending queue entry. Otherwise the remote copy
//! replaces the local one, unless the two already agree.

use crate::record::{Record, SYNCED_AT};

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Not present locally.
    Insert(Record),
    /// Local copy is clean and differs from the remote one.
    Overwrite(Record),
    /// Local copy has unpushed edits; the remote version is discarded for now.
    KeepLocal,
    /// Local copy already matches.
    Unchanged,
}

/// Decide what to do with a pulled remote record.
///
/// `remote` must be canonical. The record to write, if any, carries
/// `syncedAt` equal to the remote `updatedAt` so it is clean once stored.
pub fn resolve(remote: &Record, local: Option<&Record>, has_pending: bool) -> Resolution {
    let mut incoming = remote.clone();
    match remote.updated_at() {
        Some(updated) => incoming.set(SYNCED_AT, updated),
        None => incoming.set(SYNCED_AT, serde_json::Value::Null),
    }

    match local {
        None if has_pending => Resolution::KeepLocal,
        None => Resolution::Insert(incoming),
        Some(local) if has_pending || local.is_dirty() => Resolution::KeepLocal,
        Some(local) if local.same_content(&incoming) => Resolution::Unchanged,
        Some(_) => Resolution::Overwrite(incoming),
    }
}
