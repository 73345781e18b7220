//! Push phase: drain the queue against the remote store.

use serde_json::Value;

use crate::error::{ErrorClass, StoreError};
use crate::queue::{ChangeTicket, Operation, PendingChange};
use crate::record::{Fields, Record, SYNCED_AT, Timestamp, UPDATED_AT};
use crate::status::EntryFailure;

use super::EngineInner;

/// Push every pending entry. Failures are isolated per entry and never stop
/// the batch. Returns the number pushed and the failures.
pub(super) async fn run(inner: &EngineInner) -> (usize, Vec<EntryFailure>) {
    let batch = inner.queue.lock().unwrap().drain();
    if batch.is_empty() {
        return (0, Vec::new());
    }
    log::debug!("Pushing {} change(s)", batch.len());

    let mut pushed = 0;
    let mut failures = Vec::new();
    for entry in batch {
        let ticket = entry.ticket();
        match push_entry(inner, &entry).await {
            Ok(stamp) => {
                pushed += 1;
                confirm(inner, &ticket, stamp).await;
            }
            Err(err) => failures.push(reject(inner, &entry, &ticket, err).await),
        }
    }
    (pushed, failures)
}

/// The `updatedAt` a pushed write carries: the edit time, raised to the
/// current time and to the newest remote version already pulled. Devices
/// whose watermark passed the version this write replaces still fetch it.
fn push_stamp(inner: &EngineInner, entry: &PendingChange) -> Timestamp {
    let edited = entry
        .payload
        .get(UPDATED_AT)
        .and_then(Value::as_i64)
        .unwrap_or_default();
    let seen = inner.watermark.lock().unwrap().unwrap_or_default();
    edited.max(seen).max(inner.clock.now())
}

/// The full local record to send when a partial update is not enough.
async fn full_record(
    inner: &EngineInner,
    entry: &PendingChange,
    stamp: Timestamp,
) -> Result<Record, StoreError> {
    let table = entry.key.table;
    let mut record = match inner.local.get(table, &entry.key.record_id).await? {
        Some(record) => record.without_local_fields(),
        None => Record::new(entry.payload.clone()).without_local_fields(),
    };
    record.set(UPDATED_AT, stamp);
    Ok(record)
}

/// Send one entry. Returns the `updatedAt` the remote row now carries, or
/// `None` for a delete.
async fn push_entry(
    inner: &EngineInner,
    entry: &PendingChange,
) -> Result<Option<Timestamp>, StoreError> {
    let table = entry.key.table;
    let id = entry.key.record_id.as_str();
    let remote = &inner.remote;
    let stamp = push_stamp(inner, entry);

    match entry.operation {
        Operation::Create => {
            let record = full_record(inner, entry, stamp).await?;
            match remote.create(table, &record).await {
                Ok(_) => {}
                Err(e) if e.is_conflict() => {
                    log::debug!("{table}/{id} already exists remotely, pushing as update");
                    if remote.update(table, id, record.fields()).await?.is_none() {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Operation::Update => {
            let mut patch = entry.payload.clone();
            patch.insert(UPDATED_AT.to_string(), Value::from(stamp));
            match remote.update(table, id, &patch).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    log::debug!("{table}/{id} missing remotely, pushing as create");
                    let record = full_record(inner, entry, stamp).await?;
                    remote.create(table, &record).await?;
                }
                Err(e) if e.is_conflict() => {
                    log::debug!("{table}/{id} conflicted, re-pushing local copy");
                    let record = full_record(inner, entry, stamp).await?;
                    remote.update(table, id, record.fields()).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Operation::Delete => {
            // A row that is already gone counts as deleted.
            remote.delete(table, id).await?;
            return Ok(None);
        }
    }
    Ok(Some(stamp))
}

/// Clear a pushed entry and stamp the local record with the pushed
/// `updatedAt`, which also marks it synced.
async fn confirm(inner: &EngineInner, ticket: &ChangeTicket, stamp: Option<Timestamp>) {
    let key = &ticket.key;
    // No local edit may land between the clear and the stamp.
    let _writes = inner.local_writes.lock().await;
    let removed = inner
        .queue
        .lock()
        .unwrap()
        .clear(std::slice::from_ref(ticket));
    inner.journal_save(key).await;
    let Some(stamp) = stamp else {
        return;
    };
    if !removed.contains(key) {
        return;
    }

    let table = key.table;
    let id = key.record_id.as_str();
    let mut patch = Fields::new();
    patch.insert(UPDATED_AT.to_string(), Value::from(stamp));
    patch.insert(SYNCED_AT.to_string(), Value::from(stamp));
    if let Err(e) = inner.local.update(table, id, &patch).await {
        log::warn!("Pushed {table}/{id} but could not mark it synced: {e}");
    }
}

/// Record a failed push and describe it.
async fn reject(
    inner: &EngineInner,
    entry: &PendingChange,
    ticket: &ChangeTicket,
    err: StoreError,
) -> EntryFailure {
    let class = err.class();
    let parked = {
        let mut queue = inner.queue.lock().unwrap();
        if class == ErrorClass::Validation {
            queue.record_rejection(ticket, inner.config.max_push_attempts)
        } else {
            queue.release(ticket);
            false
        }
    };
    inner.journal_save(&ticket.key).await;

    if parked {
        log::warn!(
            "Giving up on {} of {}/{} after {} attempts: {err}",
            entry.operation.as_str(),
            entry.key.table,
            entry.key.record_id,
            inner.config.max_push_attempts
        );
    } else {
        log::warn!(
            "Push of {} {}/{} failed ({class:?}): {err}",
            entry.operation.as_str(),
            entry.key.table,
            entry.key.record_id
        );
    }

    EntryFailure {
        table: entry.key.table,
        record_id: entry.key.record_id.clone(),
        operation: entry.operation,
        class,
        message: err.to_string(),
        parked,
    }
}
