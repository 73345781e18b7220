//! Pull phase: merge remote changes since the watermark.

use crate::conflict::{self, Resolution};
use crate::error::StoreError;
use crate::messages::ChangeOrigin;
use crate::model;
use crate::queue::Operation;
use crate::record::{Record, Timestamp};
use crate::registry::Table;
use crate::status::PullSummary;
use crate::store::Predicate;

use super::{EngineInner, watermark_key};

pub(super) struct PullOutcome {
    pub summary: PullSummary,
    pub error: Option<String>,
    pub watermark: Option<Timestamp>,
}

/// Pull every table, parents first. The watermark only advances when all
/// tables were fetched, so a partial pull is repeated in full. A record that
/// could not be written locally holds the watermark at its own `updatedAt`
/// so the next pull fetches it again.
pub(super) async fn run(inner: &EngineInner) -> PullOutcome {
    let since = *inner.watermark.lock().unwrap();
    if !inner.local.is_persistent() {
        return PullOutcome {
            summary: PullSummary::default(),
            error: None,
            watermark: since,
        };
    }

    let mut predicate = Predicate::owner(&inner.owner_id);
    if let Some(since) = since {
        predicate = predicate.and(Predicate::ModifiedSince(since));
    }

    let mut summary = PullSummary::default();
    let mut errors = Vec::new();
    let mut newest = since;
    let mut held: Option<Timestamp> = None;
    for table in Table::ALL {
        match pull_table(inner, table, &predicate, &mut newest, &mut held).await {
            Ok(table_summary) => summary.absorb(table_summary),
            Err(e) => {
                log::warn!("Pull of {table} failed: {e}");
                errors.push(format!("{table}: {e}"));
            }
        }
    }

    if let Some(held) = held {
        newest = Some(newest.map_or(held, |n| n.min(held)));
    }
    if errors.is_empty() && newest != since {
        *inner.watermark.lock().unwrap() = newest;
        if let Some(ts) = newest {
            if let Err(e) = inner
                .local
                .save_meta(&watermark_key(&inner.owner_id), &ts.to_string())
                .await
            {
                log::warn!("Could not persist pull watermark: {e}");
            }
        }
    }

    let watermark = *inner.watermark.lock().unwrap();
    PullOutcome {
        summary,
        error: if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        },
        watermark,
    }
}

async fn pull_table(
    inner: &EngineInner,
    table: Table,
    predicate: &Predicate,
    newest: &mut Option<Timestamp>,
    held: &mut Option<Timestamp>,
) -> Result<PullSummary, StoreError> {
    let records = inner.remote.query(table, predicate).await?;
    let mut summary = PullSummary {
        fetched: records.len(),
        ..Default::default()
    };
    for remote in records {
        let updated = remote.updated_at();
        if let Some(updated) = updated {
            *newest = Some(newest.map_or(updated, |n| n.max(updated)));
        }
        let id = remote.id().unwrap_or_default().to_string();
        if let Err(e) = merge(inner, table, remote, &mut summary).await {
            log::warn!("Could not store remote {table}/{id}, retrying on next pull: {e}");
            summary.failed += 1;
            if let Some(updated) = updated {
                *held = Some(held.map_or(updated, |h| h.min(updated)));
            }
        }
    }
    if summary.fetched > 0 {
        log::debug!("Pulled {table}: {summary:?}");
    }
    Ok(summary)
}

async fn merge(
    inner: &EngineInner,
    table: Table,
    remote: Record,
    summary: &mut PullSummary,
) -> Result<(), StoreError> {
    let Some(id) = remote.id().map(str::to_string) else {
        summary.skipped += 1;
        return Ok(());
    };
    if remote.owner_id() != Some(inner.owner_id.as_str()) {
        log::warn!("Ignoring {table}/{id} owned by someone else");
        summary.skipped += 1;
        return Ok(());
    }
    if let Err(e) = model::validate(table, &remote) {
        log::warn!("Ignoring invalid remote {table}/{id}: {e}");
        summary.skipped += 1;
        return Ok(());
    }

    let _writes = inner.local_writes.lock().await;
    let has_pending = inner.queue.lock().unwrap().contains(table, &id);
    let local = inner.local.get(table, &id).await?;
    match conflict::resolve(&remote, local.as_ref(), has_pending) {
        Resolution::Insert(record) => {
            inner.local.create(table, &record).await?;
            inner.notify(table, &id, Operation::Create, ChangeOrigin::Remote);
            summary.inserted += 1;
        }
        Resolution::Overwrite(record) => {
            inner.local.update(table, &id, record.fields()).await?;
            inner.notify(table, &id, Operation::Update, ChangeOrigin::Remote);
            summary.overwritten += 1;
        }
        Resolution::KeepLocal => {
            log::debug!("Keeping local {table}/{id}, it has unpushed edits");
            summary.kept_local += 1;
        }
        Resolution::Unchanged => summary.unchanged += 1,
    }
    Ok(())
}
