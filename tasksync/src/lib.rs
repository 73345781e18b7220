//! # tasksync
//!
//! Offline-first sync between an on-device store and a hosted backend for
//! projects, tasks, labels, subtasks and comments.
//!
//! Local mutations are written optimistically to SQLite (through SeaORM) and
//! queued. A [`SyncEngine`] pushes the queue to the remote store and pulls
//! remote changes since a watermark, keeping unpushed local edits over remote
//! ones. On platforms without local storage, mutations go straight to the
//! remote store.
//!
//! ## Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tasksync::{Operation, RestRemote, SyncConfig, SyncEngineBuilder, Table, open_local};
//!
//! let config = SyncConfig::from_env()?;
//! let engine = SyncEngineBuilder::new("user-1")
//!     .local(open_local(&config).await?)
//!     .remote(Arc::new(RestRemote::from_config(&config)?))
//!     .config(config)
//!     .build()
//!     .await?;
//!
//! let payload = serde_json::json!({"title": "Buy milk", "priority": 2, "status": "to_do"});
//! engine
//!     .submit_mutation(Table::Tasks, "t-1", Operation::Create, payload.as_object().unwrap().clone())
//!     .await?;
//!
//! let handle = engine.start();
//! // ...
//! handle.shutdown().await;
//! ```
//!
//! ## Key types
//!
//! - [`SyncEngine`]: accepts mutations, runs sync cycles, publishes status
//! - [`ChangeQueue`]: coalesces pending mutations per record
//! - [`StoreAdapter`] / [`LocalStore`]: the store contract, implemented by
//!   [`SqliteStore`], [`NullStore`], [`RestRemote`] and [`MemoryRemote`]
//! - [`ConnectivityMonitor`]: reachability plus reconnect edges
//! - [`Table`] / [`TableMeta`]: the schema description every adapter consumes

pub mod clock;
pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod messages;
pub mod model;
pub mod protocol;
pub mod queue;
pub mod queue_log;
pub mod record;
pub mod registry;
pub mod remote;
pub mod status;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{LocalStorage, SyncConfig};
pub use connectivity::{ConnectivityMonitor, HttpProbe, ReachabilityProbe, Reconnected};
pub use engine::{SyncEngine, SyncEngineBuilder, SyncHandle};
pub use error::{ConfigError, ErrorClass, StoreError, SyncError};
pub use messages::{ChangeNotification, ChangeOrigin};
pub use model::{Comment, Entity, Label, Priority, Project, ProjectPhase, Subtask, Task, TaskStatus};
pub use queue::{ChangeKey, ChangeQueue, EntryState, Operation, PendingChange};
pub use record::{Fields, Record, Timestamp};
pub use registry::{Table, TableMeta};
pub use remote::{MemoryRemote, RestRemote};
pub use status::{CycleReport, EntryFailure, PullSummary, SyncPhase, SyncStatus};
pub use store::null::NullStore;
pub use store::sqlite::SqliteStore;
pub use store::{LocalStore, Predicate, StoreAdapter, open_local};

// Re-export sea-orm for callers that want the raw connection
pub use sea_orm;
