//! The sync orchestrator.
//!
//! A [`SyncEngine`] is built per signed-in owner. It accepts local mutations
//! with [`SyncEngine::submit_mutation`], writes them optimistically to the
//! local store and queues them. A cycle ([`SyncEngine::request_sync`]) pushes
//! the queue to the remote store and then pulls remote changes since the
//! watermark. [`SyncEngine::start`] runs cycles in the background on a timer,
//! on reconnect and after mutations, until [`SyncHandle::shutdown`].
//!
//! On a platform without local persistence the engine sends mutations
//! straight to the remote store and only queues them if it is unreachable.

mod backoff;
mod pull;
mod push;

pub use backoff::Backoff;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::connectivity::{self, ConnectivityMonitor, ReachabilityProbe, Reconnected};
use crate::error::{ErrorClass, StoreError, SyncError};
use crate::messages::{ChangeNotification, ChangeOrigin};
use crate::model::{self, Entity};
use crate::queue::{ChangeKey, ChangeQueue, EntryState, Operation, PendingChange};
use crate::record::{CREATED_AT, Fields, ID, OWNER_ID, Record, SYNCED_AT, Timestamp, UPDATED_AT};
use crate::registry::Table;
use crate::status::{CycleReport, SyncPhase, SyncStatus};
use crate::store::{LocalStore, Predicate, StoreAdapter};

const LABEL_IDS: &str = "labelIds";

fn watermark_key(owner_id: &str) -> String {
    format!("pull_watermark:{owner_id}")
}

fn last_synced_key(owner_id: &str) -> String {
    format!("last_synced_at:{owner_id}")
}

/// Where submitted mutations go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    /// Optimistic local write plus a queued change.
    Queued,
    /// Straight to the remote store; queued only when it is unreachable.
    Direct,
}

pub(crate) struct EngineInner {
    owner_id: String,
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn StoreAdapter>,
    queue: Mutex<ChangeQueue>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    status: watch::Sender<SyncStatus>,
    changes: broadcast::Sender<ChangeNotification>,
    cycle_lock: tokio::sync::Mutex<()>,
    /// Serializes writes to local records between mutation intake, push
    /// confirmation and pull merges.
    local_writes: tokio::sync::Mutex<()>,
    last_report: Mutex<Option<CycleReport>>,
    backoff: Mutex<Backoff>,
    watermark: Mutex<Option<Timestamp>>,
    connectivity: Option<ConnectivityMonitor>,
    probe: Option<Arc<dyn ReachabilityProbe>>,
    nudge: Notify,
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    owner_id: String,
    local: Option<Arc<dyn LocalStore>>,
    remote: Option<Arc<dyn StoreAdapter>>,
    clock: Option<Arc<dyn Clock>>,
    config: SyncConfig,
    connectivity: Option<ConnectivityMonitor>,
    probe: Option<Arc<dyn ReachabilityProbe>>,
}

impl SyncEngineBuilder {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            local: None,
            remote: None,
            clock: None,
            config: SyncConfig::default(),
            connectivity: None,
            probe: None,
        }
    }

    pub fn local(mut self, local: Arc<dyn LocalStore>) -> Self {
        self.local = Some(local);
        self
    }

    pub fn remote(mut self, remote: Arc<dyn StoreAdapter>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connectivity(mut self, monitor: ConnectivityMonitor) -> Self {
        self.connectivity = Some(monitor);
        self
    }

    /// Poll this probe from the background scheduler. Needs a connectivity
    /// monitor to report to.
    pub fn probe(mut self, probe: Arc<dyn ReachabilityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Build the engine, restoring this owner's pending changes and sync
    /// metadata from the local store.
    pub async fn build(self) -> Result<SyncEngine, SyncError> {
        let local = self.local.ok_or(SyncError::Incomplete("local store"))?;
        let remote = self.remote.ok_or(SyncError::Incomplete("remote store"))?;
        if self.owner_id.trim().is_empty() {
            return Err(StoreError::validation("owner id must not be empty").into());
        }
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);

        let journal = local.load_pending(&self.owner_id).await?;
        if !journal.is_empty() {
            log::info!(
                "Restored {} pending change(s) for {}",
                journal.len(),
                self.owner_id
            );
        }
        let queue = ChangeQueue::restore(journal);

        let watermark = local
            .load_meta(&watermark_key(&self.owner_id))
            .await?
            .and_then(|v| v.parse::<Timestamp>().ok());
        let last_synced_at = local
            .load_meta(&last_synced_key(&self.owner_id))
            .await?
            .and_then(|v| v.parse::<Timestamp>().ok());

        let online = self
            .connectivity
            .as_ref()
            .map_or(true, ConnectivityMonitor::is_online);
        let (status, _) = watch::channel(SyncStatus {
            phase: SyncPhase::Idle,
            last_synced_at,
            pending: queue.len(),
            failed: queue.failed_count(),
            online,
            last_error: None,
        });
        let (changes, _) = broadcast::channel(256);

        let backoff = Backoff::new(self.config.backoff_base(), self.config.backoff_max());

        Ok(SyncEngine {
            inner: Arc::new(EngineInner {
                owner_id: self.owner_id,
                local,
                remote,
                queue: Mutex::new(queue),
                clock,
                config: self.config,
                status,
                changes,
                cycle_lock: tokio::sync::Mutex::new(()),
                local_writes: tokio::sync::Mutex::new(()),
                last_report: Mutex::new(None),
                backoff: Mutex::new(backoff),
                watermark: Mutex::new(watermark),
                connectivity: self.connectivity,
                probe: self.probe,
                nudge: Notify::new(),
            }),
        })
    }
}

impl EngineInner {
    fn route(&self) -> Route {
        if self.local.is_persistent() {
            Route::Queued
        } else {
            Route::Direct
        }
    }

    fn is_online(&self) -> bool {
        self.connectivity
            .as_ref()
            .map_or(true, ConnectivityMonitor::is_online)
    }

    fn notify(&self, table: Table, record_id: &str, operation: Operation, origin: ChangeOrigin) {
        let _ = self.changes.send(ChangeNotification {
            table,
            record_id: record_id.to_string(),
            operation,
            origin,
        });
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.status.send_modify(|s| s.phase = phase);
    }

    /// Refresh queue counts and reachability in the published status.
    fn refresh_status(&self) {
        let (pending, failed) = {
            let queue = self.queue.lock().unwrap();
            (queue.len(), queue.failed_count())
        };
        let online = self.is_online();
        self.status.send_modify(|s| {
            s.pending = pending;
            s.failed = failed;
            s.online = online;
        });
    }

    /// Mirror a queue entry into the journal. Journal failures degrade
    /// durability only, so they are logged and swallowed.
    async fn journal_save(&self, key: &ChangeKey) {
        let entry = self.queue.lock().unwrap().get(key).cloned();
        let result = match entry {
            Some(entry) => self.local.save_pending(&self.owner_id, &entry).await,
            None => self.local.remove_pending(&self.owner_id, key).await,
        };
        if let Err(e) = result {
            log::warn!(
                "Could not journal pending change {}/{}: {e}",
                key.table,
                key.record_id
            );
        }
    }

    fn enqueue(&self, table: Table, id: &str, operation: Operation, payload: Fields) -> ChangeKey {
        let now = self.clock.now();
        let entry = self
            .queue
            .lock()
            .unwrap()
            .enqueue(table, id, operation, payload, now);
        log::debug!(
            "Queued {} of {table}/{id} (revision {})",
            entry.operation.as_str(),
            entry.revision
        );
        entry.key
    }
}

impl SyncEngine {
    pub fn owner_id(&self) -> &str {
        &self.inner.owner_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn connectivity(&self) -> Option<&ConnectivityMonitor> {
        self.inner.connectivity.as_ref()
    }

    /// Apply a local mutation.
    ///
    /// The payload is normalized and checked, written to the local store and
    /// queued for the next push. Returns the record as written (for a delete,
    /// the record that was removed). Never waits on the network unless the
    /// local store is not persistent.
    pub async fn submit_mutation(
        &self,
        table: Table,
        record_id: &str,
        operation: Operation,
        payload: Fields,
    ) -> Result<Option<Record>, SyncError> {
        let inner = &self.inner;
        if record_id.trim().is_empty() {
            return Err(StoreError::validation("record id must not be empty").into());
        }
        let meta = table.meta();
        let mut patch = meta.normalize_patch(&payload)?;
        patch.remove(SYNCED_AT);
        if let Some(id) = patch.remove(ID) {
            if id.as_str() != Some(record_id) {
                return Err(StoreError::validation(format!(
                    "payload id {id} does not match {record_id}"
                ))
                .into());
            }
        }
        if let Some(owner) = patch.get(OWNER_ID) {
            if owner.as_str() != Some(inner.owner_id.as_str()) {
                return Err(StoreError::validation(format!(
                    "{table}/{record_id} cannot be owned by {owner}"
                ))
                .into());
            }
        }

        let _writes = inner.local_writes.lock().await;
        let route = inner.route();
        let (existing, reader_reachable) = self.current(table, record_id).await?;
        if let Some(existing) = &existing {
            if existing.owner_id() != Some(inner.owner_id.as_str()) {
                return Err(StoreError::validation(format!(
                    "{table}/{record_id} belongs to another owner"
                ))
                .into());
            }
        }

        let now = inner.clock.now();
        let (record, queued_payload) = match operation {
            Operation::Create => {
                if existing.is_some() {
                    return Err(StoreError::Conflict(format!(
                        "{table}/{record_id} already exists"
                    ))
                    .into());
                }
                let mut fields = patch;
                fields.insert(ID.to_string(), record_id.into());
                fields.insert(OWNER_ID.to_string(), inner.owner_id.clone().into());
                if fields.get(CREATED_AT).is_none_or(Value::is_null) {
                    fields.insert(CREATED_AT.to_string(), now.into());
                }
                fields.insert(UPDATED_AT.to_string(), now.into());
                let record = meta.canonicalize(&fields)?;
                model::validate(table, &record)?;
                if reader_reachable {
                    self.check_references(table, &record, record.fields())
                        .await?;
                }
                let payload = record.without_local_fields().into_fields();
                (Some(record), payload)
            }
            Operation::Update => {
                patch.remove(CREATED_AT);
                patch.insert(UPDATED_AT.to_string(), now.into());
                match &existing {
                    Some(existing) => {
                        let mut merged = existing.clone();
                        merged.merge(&patch);
                        model::validate(table, &merged)?;
                        self.check_references(table, &merged, &patch).await?;
                        (Some(merged), patch)
                    }
                    None if route == Route::Direct && !reader_reachable => (None, patch),
                    None => {
                        return Err(
                            StoreError::NotFound(table, record_id.to_string()).into()
                        );
                    }
                }
            }
            Operation::Delete => {
                if existing.is_none() && (route == Route::Queued || reader_reachable) {
                    return Err(StoreError::NotFound(table, record_id.to_string()).into());
                }
                (existing.clone(), Fields::new())
            }
        };

        let written = match route {
            Route::Queued => {
                let written = self
                    .write_local(table, record_id, operation, record, &queued_payload)
                    .await?;
                let key = inner.enqueue(table, record_id, operation, queued_payload);
                inner.journal_save(&key).await;
                written
            }
            Route::Direct => {
                self.write_direct(table, record_id, operation, record, queued_payload)
                    .await?
            }
        };

        inner.notify(table, record_id, operation, ChangeOrigin::Local);
        inner.refresh_status();
        if inner.config.sync_on_mutation && route == Route::Queued {
            inner.nudge.notify_one();
        }
        Ok(written)
    }

    /// Look up the current copy of a record from whichever store backs reads
    /// for the active route. The flag is `false` when that store could not be
    /// reached, in which case the record is unknown rather than absent.
    async fn current(&self, table: Table, id: &str) -> Result<(Option<Record>, bool), SyncError> {
        let inner = &self.inner;
        match inner.route() {
            Route::Queued => Ok((inner.local.get(table, id).await?, true)),
            Route::Direct => match inner.remote.get(table, id).await {
                Ok(record) => Ok((record, true)),
                Err(e) if e.class() == ErrorClass::Connectivity => Ok((None, false)),
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Foreign keys touched by `changed` must point at an existing record of
    /// the same owner.
    async fn check_references(
        &self,
        table: Table,
        record: &Record,
        changed: &Fields,
    ) -> Result<(), StoreError> {
        let inner = &self.inner;
        for column in table.meta().foreign_keys() {
            if !changed.contains_key(column.field) {
                continue;
            }
            let Some(target_id) = record.get(column.field).and_then(Value::as_str) else {
                if column.nullable {
                    continue;
                }
                return Err(StoreError::Constraint(format!(
                    "{table}.{} is required",
                    column.field
                )));
            };
            let Some(target) = column.references else {
                continue;
            };
            let parent = match inner.route() {
                Route::Queued => inner.local.get(target, target_id).await?,
                Route::Direct => inner.remote.get(target, target_id).await?,
            };
            let owned = parent
                .as_ref()
                .is_some_and(|p| p.owner_id() == Some(inner.owner_id.as_str()));
            if !owned {
                return Err(StoreError::Constraint(format!(
                    "{table}.{} references missing {target}/{target_id}",
                    column.field
                )));
            }
        }
        Ok(())
    }

    async fn write_local(
        &self,
        table: Table,
        id: &str,
        operation: Operation,
        record: Option<Record>,
        patch: &Fields,
    ) -> Result<Option<Record>, StoreError> {
        let local = &self.inner.local;
        match operation {
            Operation::Create => match record {
                Some(record) => local.create(table, &record).await,
                None => Ok(None),
            },
            Operation::Update => local.update(table, id, patch).await,
            Operation::Delete => local.delete(table, id).await,
        }
    }

    async fn write_direct(
        &self,
        table: Table,
        id: &str,
        operation: Operation,
        record: Option<Record>,
        payload: Fields,
    ) -> Result<Option<Record>, StoreError> {
        let inner = &self.inner;
        let result = match operation {
            Operation::Create => inner.remote.create(table, &Record::new(payload.clone())).await,
            Operation::Update => inner.remote.update(table, id, &payload).await,
            Operation::Delete => inner.remote.delete(table, id).await,
        };
        match result {
            Ok(written) => Ok(written.or(record)),
            Err(e) if e.class() == ErrorClass::Connectivity => {
                log::info!("Remote unreachable, queueing {} of {table}/{id}", operation.as_str());
                inner.enqueue(table, id, operation, payload);
                Ok(record)
            }
            Err(e) => Err(e),
        }
    }

    /// Read one record of this owner. Task label references to labels that
    /// no longer exist are dropped.
    pub async fn read(&self, table: Table, id: &str) -> Result<Option<Record>, SyncError> {
        let record = self.inner.local.get(table, id).await?;
        let Some(record) = record.filter(|r| r.owner_id() == Some(self.owner_id())) else {
            return Ok(None);
        };
        let labels = self.label_ids(table).await?;
        Ok(Some(strip_orphan_labels(record, labels.as_ref())))
    }

    /// List this owner's records matching `predicate`.
    pub async fn list(&self, table: Table, predicate: Predicate) -> Result<Vec<Record>, SyncError> {
        let predicate = Predicate::owner(self.owner_id()).and(predicate);
        let records = self.inner.local.query(table, &predicate).await?;
        let labels = self.label_ids(table).await?;
        Ok(records
            .into_iter()
            .map(|r| strip_orphan_labels(r, labels.as_ref()))
            .collect())
    }

    pub async fn get_entity<E: Entity>(&self, id: &str) -> Result<Option<E>, SyncError> {
        match self.read(E::TABLE, id).await? {
            Some(record) => Ok(Some(E::from_record(&record)?)),
            None => Ok(None),
        }
    }

    pub async fn list_entities<E: Entity>(&self) -> Result<Vec<E>, SyncError> {
        let records = self.list(E::TABLE, Predicate::All).await?;
        records
            .iter()
            .map(|r| E::from_record(r).map_err(SyncError::from))
            .collect()
    }

    /// Submit a typed entity as a create.
    pub async fn create_entity<E: Entity>(&self, entity: &E) -> Result<Option<Record>, SyncError> {
        let record = entity.to_record()?;
        self.submit_mutation(E::TABLE, entity.id(), Operation::Create, record.into_fields())
            .await
    }

    /// Existing label ids of this owner, when `table` has label references.
    async fn label_ids(&self, table: Table) -> Result<Option<BTreeSet<String>>, StoreError> {
        if table.meta().field(LABEL_IDS).is_none() {
            return Ok(None);
        }
        let labels = self
            .inner
            .local
            .query(Table::Labels, &Predicate::owner(self.owner_id()))
            .await?;
        Ok(Some(
            labels
                .iter()
                .filter_map(|l| l.id().map(str::to_string))
                .collect(),
        ))
    }

    /// Run one push-then-pull cycle and return its report.
    ///
    /// If a cycle is already running this waits for it and returns its
    /// report, marked as coalesced, without starting another.
    pub async fn request_sync(&self) -> CycleReport {
        let inner = &self.inner;
        let _guard = match inner.cycle_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                let _joined = inner.cycle_lock.lock().await;
                let mut report = inner
                    .last_report
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or_default();
                report.coalesced = true;
                return report;
            }
        };
        let report = self.run_cycle().await;
        *inner.last_report.lock().unwrap() = Some(report.clone());
        report
    }

    async fn run_cycle(&self) -> CycleReport {
        let inner = &self.inner;
        let started_at = inner.clock.now();

        inner.set_phase(SyncPhase::Pushing);
        let (pushed, failures) = push::run(inner).await;

        inner.set_phase(SyncPhase::Pulling);
        let pull = pull::run(inner).await;

        let finished_at = inner.clock.now();
        let report = CycleReport {
            started_at,
            finished_at,
            pushed,
            failures,
            pull: pull.summary,
            pull_error: pull.error,
            watermark: pull.watermark,
            coalesced: false,
        };

        if report.is_success() {
            inner.backoff.lock().unwrap().reset();
            if let Err(e) = inner
                .local
                .save_meta(&last_synced_key(&inner.owner_id), &finished_at.to_string())
                .await
            {
                log::warn!("Could not record last sync time: {e}");
            }
            inner.status.send_modify(|s| {
                s.phase = SyncPhase::Idle;
                s.last_synced_at = Some(finished_at);
                s.last_error = None;
            });
            log::info!(
                "Sync cycle for {} done: {} pushed, {} pulled",
                inner.owner_id,
                report.pushed,
                report.local_mutations()
            );
        } else {
            let delay = inner.backoff.lock().unwrap().next_delay();
            let error = report.first_error();
            inner.status.send_modify(|s| {
                s.phase = SyncPhase::Error;
                s.last_error = error;
            });
            log::info!(
                "Sync cycle for {} incomplete ({} failed entries, pull error: {}); retrying in {delay:?}",
                inner.owner_id,
                report.failures.len(),
                report.pull_error.as_deref().unwrap_or("none")
            );
        }
        inner.refresh_status();
        report
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.refresh_status();
        self.inner.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeNotification> {
        self.inner.changes.subscribe()
    }

    /// Every queued change, in push order.
    pub fn pending_changes(&self) -> Vec<PendingChange> {
        self.inner.queue.lock().unwrap().peek_pending()
    }

    /// The watermark the next pull starts from.
    pub fn watermark(&self) -> Option<Timestamp> {
        *self.inner.watermark.lock().unwrap()
    }

    /// Give every failed entry another round of attempts.
    pub async fn retry_failed(&self) -> usize {
        let inner = &self.inner;
        let keys: Vec<ChangeKey> = {
            let mut queue = inner.queue.lock().unwrap();
            let failed: Vec<ChangeKey> = queue
                .peek_pending()
                .into_iter()
                .filter(|e| e.state == EntryState::Failed)
                .map(|e| e.key)
                .collect();
            queue.retry_failed();
            failed
        };
        for key in &keys {
            inner.journal_save(key).await;
        }
        inner.refresh_status();
        if !keys.is_empty() {
            inner.nudge.notify_one();
        }
        keys.len()
    }

    /// Drop a queued change without pushing it. The local record keeps its
    /// edits and stays dirty until it is changed again.
    pub async fn discard_change(&self, table: Table, record_id: &str) -> Option<PendingChange> {
        let inner = &self.inner;
        let key = ChangeKey::new(table, record_id);
        let removed = inner.queue.lock().unwrap().discard(&key);
        if removed.is_some() {
            inner.journal_save(&key).await;
            inner.refresh_status();
        }
        removed
    }

    /// Start background sync: a cycle every `sync_interval`, on reconnect,
    /// after local mutations, and on backoff expiry after a failed cycle.
    pub fn start(&self) -> SyncHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let probe_task = match (&self.inner.connectivity, &self.inner.probe) {
            (Some(monitor), Some(probe)) => Some(connectivity::spawn_probe(
                monitor.clone(),
                probe.clone(),
                self.inner.config.probe_interval(),
                shutdown_rx.clone(),
            )),
            _ => None,
        };

        let engine = self.clone();
        let task = tokio::spawn(async move { engine.run_scheduler(shutdown_rx).await });

        SyncHandle {
            shutdown: shutdown_tx,
            task,
            probe_task,
        }
    }

    /// Delay before the background scheduler retries, while the last cycle
    /// has failed.
    pub fn retry_delay(&self) -> Option<Duration> {
        self.inner.backoff.lock().unwrap().pending()
    }

    fn next_delay(&self) -> Duration {
        self.retry_delay()
            .unwrap_or_else(|| self.inner.config.sync_interval())
    }

    async fn run_scheduler(self, mut shutdown: watch::Receiver<bool>) {
        let inner = &self.inner;
        let mut reconnects = inner.connectivity.as_ref().map(ConnectivityMonitor::subscribe);
        log::info!("Background sync started for {}", inner.owner_id);

        // Catch up on anything restored from the journal.
        if inner.is_online() {
            self.request_sync().await;
        }

        let mut deadline = Instant::now() + self.next_delay();
        loop {
            let rearm = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    false
                }
                _ = tokio::time::sleep_until(deadline) => {
                    if inner.status.borrow().phase == SyncPhase::Error {
                        inner.set_phase(SyncPhase::Idle);
                    }
                    if inner.is_online() {
                        self.request_sync().await;
                    } else {
                        log::debug!("Offline, skipping scheduled sync");
                        inner.refresh_status();
                    }
                    true
                }
                true = next_reconnect(&mut reconnects) => {
                    log::info!("Back online, syncing {}", inner.owner_id);
                    self.request_sync().await;
                    true
                }
                _ = inner.nudge.notified() => {
                    // A failed cycle is retried by the timer, not by new edits.
                    if inner.is_online() && self.retry_delay().is_none() {
                        self.request_sync().await;
                        true
                    } else {
                        false
                    }
                }
            };
            if rearm {
                deadline = Instant::now() + self.next_delay();
            }
        }
        log::info!("Background sync stopped for {}", inner.owner_id);
    }
}

/// Wait for the next offline→online edge. Never resolves without a monitor.
async fn next_reconnect(rx: &mut Option<broadcast::Receiver<Reconnected>>) -> bool {
    match rx {
        Some(rx) => match rx.recv().await {
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => true,
            Err(broadcast::error::RecvError::Closed) => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

fn strip_orphan_labels(mut record: Record, labels: Option<&BTreeSet<String>>) -> Record {
    let Some(labels) = labels else {
        return record;
    };
    if let Some(Value::Array(ids)) = record.get(LABEL_IDS) {
        let kept: Vec<Value> = ids
            .iter()
            .filter(|id| id.as_str().is_some_and(|id| labels.contains(id)))
            .cloned()
            .collect();
        if kept.len() != ids.len() {
            record.set(LABEL_IDS, Value::Array(kept));
        }
    }
    record
}

/// Handle to the background scheduler of one session.
pub struct SyncHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    probe_task: Option<JoinHandle<()>>,
}

impl SyncHandle {
    /// Stop background sync and wait for it to wind down. A cycle already in
    /// progress runs to completion first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            log::warn!("Sync scheduler ended abnormally: {e}");
        }
        if let Some(probe) = self.probe_task {
            let _ = probe.await;
        }
    }
}
