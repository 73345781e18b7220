use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tasksync::sea_orm::DbErr;
use tasksync::{
    ChangeKey, ChangeOrigin, ConnectivityMonitor, Fields, LocalStore, ManualClock, MemoryRemote,
    NullStore, Operation, PendingChange, Predicate, Record, SqliteStore, StoreAdapter, StoreError,
    SyncConfig, SyncEngine, SyncEngineBuilder, SyncPhase, Table,
};
use tokio::sync::Notify;
use tokio::time::timeout;
use uuid::Uuid;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fields(value: Value) -> Fields {
    value.as_object().cloned().expect("object payload")
}

fn new_task(title: &str) -> Fields {
    fields(json!({"title": title, "priority": 2, "status": "to_do"}))
}

struct Harness {
    engine: SyncEngine,
    local: SqliteStore,
    remote: Arc<MemoryRemote>,
    clock: ManualClock,
}

async fn harness(config: SyncConfig) -> Harness {
    init_logger();
    let local = SqliteStore::connect("sqlite::memory:")
        .await
        .expect("Failed to open SQLite");
    let remote = Arc::new(MemoryRemote::new());
    let clock = ManualClock::new(100);
    let engine = SyncEngineBuilder::new("user-1")
        .local(Arc::new(local.clone()))
        .remote(remote.clone())
        .clock(Arc::new(clock.clone()))
        .config(config)
        .build()
        .await
        .expect("Failed to build engine");
    Harness {
        engine,
        local,
        remote,
        clock,
    }
}

/// Rewrite a remote row as if another device had edited it.
fn edit_remote(remote: &MemoryRemote, table: Table, id: &str, changes: Value) {
    let mut row = remote.row(table, id).expect("remote row");
    if let Value::Object(changes) = changes {
        row.extend(changes);
    }
    remote
        .insert_wire(table, Value::Object(row))
        .expect("Failed to write remote row");
}

#[tokio::test]
async fn test_offline_create_is_pushed_after_reconnect() {
    let h = harness(SyncConfig::default()).await;
    h.remote.set_online(false);

    let written = h
        .engine
        .submit_mutation(Table::Tasks, "t1", Operation::Create, new_task("Offline"))
        .await
        .expect("Failed to submit")
        .expect("written record");
    assert!(written.is_dirty());

    let report = h.engine.request_sync().await;
    assert!(!report.is_success());
    assert_eq!(report.pushed, 0);
    assert_eq!(report.failures.len(), 1);
    assert!(report.pull_error.is_some());
    let status = h.engine.status();
    assert_eq!(status.phase, SyncPhase::Error);
    assert_eq!(status.pending, 1);
    assert!(status.last_synced_at.is_none());

    h.remote.set_online(true);
    h.clock.set(200);
    let report = h.engine.request_sync().await;
    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.pushed, 1);

    let row = h.remote.row(Table::Tasks, "t1").expect("pushed row");
    assert_eq!(row.get("title"), Some(&json!("Offline")));
    assert_eq!(row.get("owner_id"), Some(&json!("user-1")));
    assert!(row.get("synced_at").is_none());

    let local = h.local.get(Table::Tasks, "t1").await.unwrap().unwrap();
    assert!(!local.is_dirty());
    assert_eq!(local.synced_at(), Some(200));

    let status = h.engine.status();
    assert_eq!(status.phase, SyncPhase::Idle);
    assert_eq!(status.pending, 0);
    assert_eq!(status.last_synced_at, Some(200));
}

#[tokio::test]
async fn test_pull_overwrites_clean_record() {
    let h = harness(SyncConfig::default()).await;
    h.engine
        .submit_mutation(Table::Tasks, "t1", Operation::Create, new_task("A"))
        .await
        .unwrap();
    assert!(h.engine.request_sync().await.is_success());
    let local = h.local.get(Table::Tasks, "t1").await.unwrap().unwrap();
    assert_eq!(local.synced_at(), Some(100));
    assert_eq!(h.engine.watermark(), Some(100));

    edit_remote(
        &h.remote,
        Table::Tasks,
        "t1",
        json!({"title": "B", "updated_at": 150}),
    );
    let mut changes = h.engine.subscribe_changes();
    h.clock.set(300);

    let report = h.engine.request_sync().await;
    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.pull.overwritten, 1);
    assert_eq!(report.local_mutations(), 1);

    let local = h.local.get(Table::Tasks, "t1").await.unwrap().unwrap();
    assert_eq!(local.get("title"), Some(&json!("B")));
    assert_eq!(local.updated_at(), Some(150));
    assert_eq!(local.synced_at(), Some(150));
    assert_eq!(h.engine.watermark(), Some(150));

    let change = changes.try_recv().expect("change notification");
    assert_eq!(change.table, Table::Tasks);
    assert_eq!(change.record_id, "t1");
    assert_eq!(change.operation, Operation::Update);
    assert_eq!(change.origin, ChangeOrigin::Remote);

    // Nothing new on the remote: the repeated pull writes nothing.
    let again = h.engine.request_sync().await;
    assert!(again.is_success());
    assert_eq!(again.local_mutations(), 0);
    assert_eq!(again.pull.unchanged, 1);
    assert!(changes.try_recv().is_err());
}

#[tokio::test]
async fn test_pull_inserts_records_from_other_devices() {
    let h = harness(SyncConfig::default()).await;
    h.remote
        .insert_wire(
            Table::Projects,
            json!({
                "id": "p1", "name": "Garden", "color": "#00aa00",
                "created_at": "2024-05-01T10:00:00Z",
                "updated_at": "2024-05-01T10:00:00Z",
                "owner_id": "user-1"
            }),
        )
        .unwrap();
    h.remote
        .insert_wire(
            Table::Tasks,
            json!({
                "id": "t9", "title": "Prune roses", "priority": 3, "status": "to_do",
                "project_id": "p1", "label_ids": "[]",
                "created_at": 1_714_557_600_000_i64, "updated_at": 1_714_557_600_000_i64,
                "owner_id": "user-1"
            }),
        )
        .unwrap();
    h.remote
        .insert_wire(
            Table::Tasks,
            json!({
                "id": "x1", "title": "Not mine", "priority": 3, "status": "to_do",
                "created_at": 1, "updated_at": 1, "owner_id": "user-2"
            }),
        )
        .unwrap();

    let report = h.engine.request_sync().await;
    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.pull.inserted, 2);

    let task = h.local.get(Table::Tasks, "t9").await.unwrap().unwrap();
    assert_eq!(task.get("projectId"), Some(&json!("p1")));
    assert!(!task.is_dirty());
    assert!(h.local.get(Table::Tasks, "x1").await.unwrap().is_none());
    assert_eq!(h.engine.watermark(), Some(1_714_557_600_000));
}

#[tokio::test]
async fn test_update_then_delete_pushes_only_the_delete() {
    let h = harness(SyncConfig::default()).await;
    h.engine
        .submit_mutation(Table::Tasks, "t1", Operation::Create, new_task("Short lived"))
        .await
        .unwrap();
    assert!(h.engine.request_sync().await.is_success());
    let writes_before = h.remote.write_count();

    h.clock.advance(10);
    h.engine
        .submit_mutation(
            Table::Tasks,
            "t1",
            Operation::Update,
            fields(json!({"title": "Renamed"})),
        )
        .await
        .unwrap();
    h.clock.advance(10);
    h.engine
        .submit_mutation(Table::Tasks, "t1", Operation::Delete, Fields::new())
        .await
        .unwrap();

    let pending = h.engine.pending_changes();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation, Operation::Delete);
    assert!(h.local.get(Table::Tasks, "t1").await.unwrap().is_none());

    let report = h.engine.request_sync().await;
    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.pushed, 1);
    assert_eq!(h.remote.write_count(), writes_before + 1);
    assert!(h.remote.row(Table::Tasks, "t1").is_none());
    assert!(h.engine.pending_changes().is_empty());
    assert!(h.local.load_pending("user-1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unpushed_local_edit_survives_pull() {
    let h = harness(SyncConfig::default()).await;
    h.engine
        .submit_mutation(Table::Tasks, "t1", Operation::Create, new_task("A"))
        .await
        .unwrap();
    assert!(h.engine.request_sync().await.is_success());

    h.clock.set(200);
    h.engine
        .submit_mutation(
            Table::Tasks,
            "t1",
            Operation::Update,
            fields(json!({"title": "mine"})),
        )
        .await
        .unwrap();
    edit_remote(
        &h.remote,
        Table::Tasks,
        "t1",
        json!({"title": "theirs", "updated_at": 250}),
    );
    // Keep the local edit from reaching the remote in this cycle.
    h.remote.reject(Table::Tasks, "t1");

    let report = h.engine.request_sync().await;
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.pull.kept_local, 1);
    let local = h.local.get(Table::Tasks, "t1").await.unwrap().unwrap();
    assert_eq!(local.get("title"), Some(&json!("mine")));
    assert!(local.is_dirty());

    // Once the edit goes through, the remote carries the local title.
    h.remote.accept(Table::Tasks, "t1");
    let report = h.engine.request_sync().await;
    assert!(report.is_success(), "{report:?}");
    let row = h.remote.row(Table::Tasks, "t1").unwrap();
    assert_eq!(row.get("title"), Some(&json!("mine")));
}

#[tokio::test]
async fn test_rejected_entry_is_parked_then_retried_or_discarded() {
    let config = SyncConfig {
        max_push_attempts: 2,
        ..SyncConfig::default()
    };
    let h = harness(config).await;
    h.remote.reject(Table::Tasks, "t1");
    h.remote.reject(Table::Tasks, "t2");
    h.engine
        .submit_mutation(Table::Tasks, "t1", Operation::Create, new_task("one"))
        .await
        .unwrap();
    h.engine
        .submit_mutation(Table::Tasks, "t2", Operation::Create, new_task("two"))
        .await
        .unwrap();

    let first = h.engine.request_sync().await;
    assert_eq!(first.failures.len(), 2);
    assert!(first.failures.iter().all(|f| !f.parked));

    let second = h.engine.request_sync().await;
    assert!(second.failures.iter().all(|f| f.parked));
    assert_eq!(h.engine.status().failed, 2);

    // Parked entries are left alone by later cycles.
    let writes = h.remote.write_count();
    let third = h.engine.request_sync().await;
    assert!(third.failures.is_empty());
    assert_eq!(h.remote.write_count(), writes);

    h.remote.accept(Table::Tasks, "t1");
    let discarded = h.engine.discard_change(Table::Tasks, "t2").await;
    assert_eq!(discarded.map(|e| e.operation), Some(Operation::Create));
    assert_eq!(h.engine.retry_failed().await, 1);

    let report = h.engine.request_sync().await;
    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.pushed, 1);
    assert!(h.remote.row(Table::Tasks, "t1").is_some());
    assert!(h.remote.row(Table::Tasks, "t2").is_none());
    assert_eq!(h.engine.status().failed, 0);
    assert_eq!(h.engine.status().pending, 0);

    // The discarded record keeps its local edits.
    let t2 = h.local.get(Table::Tasks, "t2").await.unwrap().unwrap();
    assert!(t2.is_dirty());
}

#[tokio::test]
async fn test_one_failing_entry_does_not_block_the_rest() {
    let h = harness(SyncConfig::default()).await;
    h.remote.reject(Table::Tasks, "bad");
    for id in ["bad", "good"] {
        h.engine
            .submit_mutation(Table::Tasks, id, Operation::Create, new_task(id))
            .await
            .unwrap();
    }

    let report = h.engine.request_sync().await;
    assert_eq!(report.pushed, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].record_id, "bad");
    assert!(h.remote.row(Table::Tasks, "good").is_some());
    assert_eq!(h.engine.pending_changes().len(), 1);
}

#[tokio::test]
async fn test_parent_is_pushed_before_child() {
    let h = harness(SyncConfig::default()).await;
    let project_id = Uuid::new_v4().to_string();
    let task_id = Uuid::new_v4().to_string();
    h.engine
        .submit_mutation(
            Table::Projects,
            &project_id,
            Operation::Create,
            fields(json!({"name": "Home", "color": "#ff0000"})),
        )
        .await
        .unwrap();
    h.engine
        .submit_mutation(
            Table::Tasks,
            &task_id,
            Operation::Create,
            fields(json!({"title": "Paint", "priority": 1, "status": "to_do", "projectId": project_id})),
        )
        .await
        .unwrap();
    h.engine
        .submit_mutation(
            Table::Comments,
            &Uuid::new_v4().to_string(),
            Operation::Create,
            fields(json!({"taskId": task_id, "content": "white or grey?"})),
        )
        .await
        .unwrap();

    let order: Vec<Table> = h
        .engine
        .pending_changes()
        .iter()
        .map(|e| e.key.table)
        .collect();
    assert_eq!(order, vec![Table::Projects, Table::Tasks, Table::Comments]);

    let report = h.engine.request_sync().await;
    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.pushed, 3);
}

#[tokio::test]
async fn test_concurrent_requests_share_one_cycle() {
    let h = harness(SyncConfig::default()).await;
    h.engine
        .submit_mutation(Table::Tasks, "t1", Operation::Create, new_task("once"))
        .await
        .unwrap();
    h.remote.set_latency(Some(Duration::from_millis(50)));

    let (a, b) = tokio::join!(h.engine.request_sync(), h.engine.request_sync());
    assert_ne!(a.coalesced, b.coalesced);
    assert_eq!(a.pushed, 1);
    assert_eq!(b.pushed, 1);
    assert_eq!(h.remote.write_count(), 1);
}

#[tokio::test]
async fn test_without_local_store_mutations_go_remote() {
    init_logger();
    let remote = Arc::new(MemoryRemote::new());
    let engine = SyncEngineBuilder::new("user-1")
        .local(Arc::new(NullStore))
        .remote(remote.clone())
        .clock(Arc::new(ManualClock::new(100)))
        .build()
        .await
        .unwrap();

    let written = engine
        .submit_mutation(Table::Tasks, "t1", Operation::Create, new_task("direct"))
        .await
        .unwrap()
        .expect("written record");
    assert_eq!(written.get("title"), Some(&json!("direct")));
    assert!(remote.row(Table::Tasks, "t1").is_some());
    assert!(engine.pending_changes().is_empty());

    // Unreachable: the change waits in memory until the next cycle.
    remote.set_online(false);
    engine
        .submit_mutation(
            Table::Tasks,
            "t1",
            Operation::Update,
            fields(json!({"title": "later"})),
        )
        .await
        .unwrap();
    assert_eq!(engine.pending_changes().len(), 1);

    remote.set_online(true);
    let report = engine.request_sync().await;
    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.pushed, 1);
    assert_eq!(report.pull.fetched, 0);
    let row = remote.row(Table::Tasks, "t1").unwrap();
    assert_eq!(row.get("title"), Some(&json!("later")));
}

#[tokio::test]
async fn test_background_sync_runs_on_reconnect() {
    init_logger();
    let local = SqliteStore::connect("sqlite::memory:").await.unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let monitor = ConnectivityMonitor::new(false);
    let config = SyncConfig {
        sync_interval_secs: 3600,
        sync_on_mutation: false,
        ..SyncConfig::default()
    };
    let engine = SyncEngineBuilder::new("user-1")
        .local(Arc::new(local))
        .remote(remote.clone())
        .config(config)
        .connectivity(monitor.clone())
        .build()
        .await
        .unwrap();
    engine
        .submit_mutation(Table::Tasks, "t1", Operation::Create, new_task("queued"))
        .await
        .unwrap();
    assert!(!engine.status().online);

    let handle = engine.start();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(remote.row(Table::Tasks, "t1").is_none());

    assert!(monitor.report(true));
    tokio::time::timeout(Duration::from_secs(5), async {
        while remote.row(Table::Tasks, "t1").is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("reconnect did not trigger a sync");

    handle.shutdown().await;
    let status = engine.status();
    assert!(status.online);
    assert_eq!(status.pending, 0);
}

/// SQLite store that can fail writes to chosen records and hold the next
/// journal removal until released.
#[derive(Clone)]
struct FlakyStore {
    inner: SqliteStore,
    failing: Arc<Mutex<HashSet<String>>>,
    journal_gate: Arc<Mutex<Option<(Arc<Notify>, Arc<Notify>)>>>,
}

impl FlakyStore {
    async fn connect() -> Self {
        Self {
            inner: SqliteStore::connect("sqlite::memory:")
                .await
                .expect("Failed to open SQLite"),
            failing: Arc::default(),
            journal_gate: Arc::default(),
        }
    }

    fn fail_writes(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    fn heal(&self, id: &str) {
        self.failing.lock().unwrap().remove(id);
    }

    /// Returns (entered, release).
    fn hold_next_journal_removal(&self) -> (Arc<Notify>, Arc<Notify>) {
        let gate = (Arc::new(Notify::new()), Arc::new(Notify::new()));
        *self.journal_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    fn check(&self, table: Table, id: &str) -> Result<(), StoreError> {
        if self.failing.lock().unwrap().contains(id) {
            return Err(StoreError::Database(DbErr::Custom(format!(
                "disk I/O error writing {table}/{id}"
            ))));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreAdapter for FlakyStore {
    async fn get(&self, table: Table, id: &str) -> Result<Option<Record>, StoreError> {
        self.inner.get(table, id).await
    }

    async fn query(&self, table: Table, predicate: &Predicate) -> Result<Vec<Record>, StoreError> {
        self.inner.query(table, predicate).await
    }

    async fn create(&self, table: Table, record: &Record) -> Result<Option<Record>, StoreError> {
        self.check(table, record.id().unwrap_or_default())?;
        self.inner.create(table, record).await
    }

    async fn update(
        &self,
        table: Table,
        id: &str,
        patch: &Fields,
    ) -> Result<Option<Record>, StoreError> {
        self.check(table, id)?;
        self.inner.update(table, id, patch).await
    }

    async fn delete(&self, table: Table, id: &str) -> Result<Option<Record>, StoreError> {
        self.inner.delete(table, id).await
    }
}

#[async_trait]
impl LocalStore for FlakyStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn load_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.load_meta(key).await
    }

    async fn save_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.save_meta(key, value).await
    }

    async fn save_pending(&self, owner_id: &str, entry: &PendingChange) -> Result<(), StoreError> {
        self.inner.save_pending(owner_id, entry).await
    }

    async fn remove_pending(&self, owner_id: &str, key: &ChangeKey) -> Result<(), StoreError> {
        let gate = self.journal_gate.lock().unwrap().take();
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }
        self.inner.remove_pending(owner_id, key).await
    }

    async fn load_pending(&self, owner_id: &str) -> Result<Vec<PendingChange>, StoreError> {
        self.inner.load_pending(owner_id).await
    }
}

async fn device(
    local: Arc<dyn LocalStore>,
    remote: &Arc<MemoryRemote>,
    clock: &ManualClock,
) -> SyncEngine {
    SyncEngineBuilder::new("user-1")
        .local(local)
        .remote(remote.clone())
        .clock(Arc::new(clock.clone()))
        .build()
        .await
        .expect("Failed to build engine")
}

#[tokio::test]
async fn test_edit_that_wins_a_conflict_reaches_other_devices() {
    init_logger();
    let remote = Arc::new(MemoryRemote::new());
    let clock = ManualClock::new(100);
    let phone_store = SqliteStore::connect("sqlite::memory:").await.unwrap();
    let laptop_store = SqliteStore::connect("sqlite::memory:").await.unwrap();
    let phone = device(Arc::new(phone_store.clone()), &remote, &clock).await;
    let laptop = device(Arc::new(laptop_store.clone()), &remote, &clock).await;

    phone
        .submit_mutation(Table::Tasks, "t1", Operation::Create, new_task("draft"))
        .await
        .unwrap();
    assert!(phone.request_sync().await.is_success());
    assert!(laptop.request_sync().await.is_success());
    let copy = laptop_store.get(Table::Tasks, "t1").await.unwrap().unwrap();
    assert_eq!(copy.get("title"), Some(&json!("draft")));

    // The phone edits offline; the laptop edits later and syncs first.
    clock.set(200);
    phone
        .submit_mutation(
            Table::Tasks,
            "t1",
            Operation::Update,
            fields(json!({"title": "mine"})),
        )
        .await
        .unwrap();
    clock.set(250);
    laptop
        .submit_mutation(
            Table::Tasks,
            "t1",
            Operation::Update,
            fields(json!({"title": "theirs"})),
        )
        .await
        .unwrap();
    assert!(laptop.request_sync().await.is_success());
    assert_eq!(laptop.watermark(), Some(250));

    clock.set(300);
    let report = phone.request_sync().await;
    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.pushed, 1);
    let row = remote.row(Table::Tasks, "t1").unwrap();
    assert_eq!(row.get("title"), Some(&json!("mine")));
    let mine = phone_store.get(Table::Tasks, "t1").await.unwrap().unwrap();
    assert_eq!(mine.updated_at(), Some(300));
    assert_eq!(mine.synced_at(), Some(300));

    // The laptop is past the version it overwrote and still gets the edit.
    clock.set(310);
    let report = laptop.request_sync().await;
    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.pull.overwritten, 1);
    let copy = laptop_store.get(Table::Tasks, "t1").await.unwrap().unwrap();
    assert_eq!(copy.get("title"), Some(&json!("mine")));
    assert!(!copy.is_dirty());
    assert_eq!(laptop.watermark(), Some(300));
}

#[tokio::test]
async fn test_local_write_failure_skips_only_that_record() {
    init_logger();
    let store = FlakyStore::connect().await;
    store.fail_writes("t2");
    let remote = Arc::new(MemoryRemote::new());
    for (id, ts) in [("t1", 100), ("t2", 200), ("t3", 300)] {
        remote
            .insert_wire(
                Table::Tasks,
                json!({
                    "id": id, "title": id, "priority": 3, "status": "to_do",
                    "created_at": ts, "updated_at": ts, "owner_id": "user-1"
                }),
            )
            .unwrap();
    }
    let engine = device(Arc::new(store.clone()), &remote, &ManualClock::new(400)).await;

    let report = engine.request_sync().await;
    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.pull.inserted, 2);
    assert_eq!(report.pull.failed, 1);
    assert!(store.get(Table::Tasks, "t2").await.unwrap().is_none());
    assert!(store.get(Table::Tasks, "t3").await.unwrap().is_some());
    // Held at the failed record so the next pull fetches it again.
    assert_eq!(engine.watermark(), Some(200));

    store.heal("t2");
    let report = engine.request_sync().await;
    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.pull.inserted, 1);
    assert_eq!(report.pull.unchanged, 1);
    assert_eq!(report.pull.failed, 0);
    assert!(store.get(Table::Tasks, "t2").await.unwrap().is_some());
    assert_eq!(engine.watermark(), Some(300));
}

#[tokio::test]
async fn test_failed_cycle_is_retried_after_backoff() {
    init_logger();
    let local = SqliteStore::connect("sqlite::memory:").await.unwrap();
    let remote = Arc::new(MemoryRemote::new());
    remote.set_online(false);
    let config = SyncConfig {
        sync_interval_secs: 3600,
        backoff_base_secs: 1,
        backoff_max_secs: 8,
        ..SyncConfig::default()
    };
    let engine = SyncEngineBuilder::new("user-1")
        .local(Arc::new(local))
        .remote(remote.clone())
        .clock(Arc::new(ManualClock::new(100)))
        .config(config)
        .build()
        .await
        .unwrap();
    engine
        .submit_mutation(Table::Tasks, "t1", Operation::Create, new_task("retry me"))
        .await
        .unwrap();

    let mut status = engine.subscribe_status();
    let handle = engine.start();
    timeout(
        Duration::from_secs(5),
        status.wait_for(|s| s.phase == SyncPhase::Error),
    )
    .await
    .expect("first cycle did not fail")
    .unwrap();
    assert_eq!(engine.retry_delay(), Some(Duration::from_secs(1)));

    // Edits made while a retry is pending wait for the retry timer.
    engine
        .submit_mutation(Table::Tasks, "t2", Operation::Create, new_task("also waits"))
        .await
        .unwrap();
    assert!(
        timeout(
            Duration::from_millis(300),
            status.wait_for(|s| s.phase == SyncPhase::Pushing),
        )
        .await
        .is_err(),
        "a cycle started before the retry delay ran out"
    );

    // No reconnect event: only the backoff timer can bring the queue out.
    remote.set_online(true);
    timeout(
        Duration::from_secs(5),
        status.wait_for(|s| s.last_synced_at.is_some()),
    )
    .await
    .expect("no retry after the backoff delay")
    .unwrap();

    handle.shutdown().await;
    let status = engine.status();
    assert_eq!(status.phase, SyncPhase::Idle);
    assert_eq!(status.pending, 0);
    assert!(status.last_error.is_none());
    assert_eq!(engine.retry_delay(), None);
    assert!(remote.row(Table::Tasks, "t1").is_some());
    assert!(remote.row(Table::Tasks, "t2").is_some());
}

#[tokio::test]
async fn test_edit_during_push_confirmation_stays_dirty() {
    init_logger();
    let store = FlakyStore::connect().await;
    let remote = Arc::new(MemoryRemote::new());
    let clock = ManualClock::new(100);
    let engine = device(Arc::new(store.clone()), &remote, &clock).await;
    engine
        .submit_mutation(Table::Tasks, "t1", Operation::Create, new_task("first"))
        .await
        .unwrap();

    let (entered, release) = store.hold_next_journal_removal();
    let sync = tokio::spawn({
        let engine = engine.clone();
        async move { engine.request_sync().await }
    });
    // The push went through and its queue entry is being cleared.
    entered.notified().await;

    clock.set(300);
    let edit = tokio::spawn({
        let engine = engine.clone();
        async move {
            engine
                .submit_mutation(
                    Table::Tasks,
                    "t1",
                    Operation::Update,
                    fields(json!({"title": "second"})),
                )
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    release.notify_one();

    let report = sync.await.unwrap();
    assert_eq!(report.pushed, 1);
    edit.await.unwrap().expect("Failed to submit edit");

    let local = store.get(Table::Tasks, "t1").await.unwrap().unwrap();
    assert_eq!(local.get("title"), Some(&json!("second")));
    assert!(local.is_dirty());
    let pending = engine.pending_changes();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation, Operation::Update);
    assert_eq!(store.load_pending("user-1").await.unwrap().len(), 1);

    let report = engine.request_sync().await;
    assert!(report.is_success(), "{report:?}");
    let row = remote.row(Table::Tasks, "t1").unwrap();
    assert_eq!(row.get("title"), Some(&json!("second")));
    assert!(!store.get(Table::Tasks, "t1").await.unwrap().unwrap().is_dirty());
}
