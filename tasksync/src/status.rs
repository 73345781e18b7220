//! Observable sync state.

use serde::{Deserialize, Serialize};

use crate::error::ErrorClass;
use crate::queue::Operation;
use crate::record::Timestamp;
use crate::registry::Table;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Pushing,
    Pulling,
    /// The last cycle did not fully succeed; a retry is scheduled.
    Error,
}

/// Aggregate status surfaced to the UI.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub phase: SyncPhase,
    /// Completion time of the last fully successful cycle.
    pub last_synced_at: Option<Timestamp>,
    /// Queue entries still waiting to be pushed, including failed ones.
    pub pending: usize,
    /// Entries parked after repeated rejection.
    pub failed: usize,
    pub online: bool,
    pub last_error: Option<String>,
}

impl SyncStatus {
    pub fn summary(&self) -> String {
        let phase = match self.phase {
            SyncPhase::Idle => "idle",
            SyncPhase::Pushing => "pushing",
            SyncPhase::Pulling => "pulling",
            SyncPhase::Error => "error",
        };
        let mut out = format!("{phase}, {} pending", self.pending);
        if self.failed > 0 {
            out.push_str(&format!(" ({} failed)", self.failed));
        }
        if !self.online {
            out.push_str(", offline");
        }
        match self.last_synced_at {
            Some(ts) => out.push_str(&format!(", last synced at {ts}")),
            None => out.push_str(", never synced"),
        }
        out
    }
}

/// A queue entry that could not be pushed in a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryFailure {
    pub table: Table,
    pub record_id: String,
    pub operation: Operation,
    pub class: ErrorClass,
    pub message: String,
    /// The entry was parked as failed by this attempt.
    pub parked: bool,
}

/// Counts from merging one pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PullSummary {
    pub fetched: usize,
    pub inserted: usize,
    pub overwritten: usize,
    pub kept_local: usize,
    pub unchanged: usize,
    /// Remote records that failed validation and were ignored.
    pub skipped: usize,
    /// Remote records the local store failed to write. Fetched again by the
    /// next pull.
    pub failed: usize,
}

impl PullSummary {
    pub fn absorb(&mut self, other: PullSummary) {
        self.fetched += other.fetched;
        self.inserted += other.inserted;
        self.overwritten += other.overwritten;
        self.kept_local += other.kept_local;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Outcome of one push-then-pull cycle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CycleReport {
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub pushed: usize,
    pub failures: Vec<EntryFailure>,
    pub pull: PullSummary,
    /// Set when at least one table could not be pulled.
    pub pull_error: Option<String>,
    /// Pull watermark after the cycle.
    pub watermark: Option<Timestamp>,
    /// The request joined a cycle that was already running; this is that
    /// cycle's report.
    pub coalesced: bool,
}

impl CycleReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.pull_error.is_none()
    }

    /// Records written to the local store by the pull.
    pub fn local_mutations(&self) -> usize {
        self.pull.inserted + self.pull.overwritten
    }

    pub fn first_error(&self) -> Option<String> {
        self.failures
            .first()
            .map(|f| format!("{}/{}: {}", f.table, f.record_id, f.message))
            .or_else(|| self.pull_error.clone())
    }
}
