//! Coalescing queue of local mutations waiting to be pushed.
//!
//! The queue holds at most one [`PendingChange`] per `(table, record id)`.
//! Enqueuing onto an existing key folds the two operations with [`coalesce`].
//! Entries handed out by [`ChangeQueue::drain`] stay in the queue, marked
//! in-flight, so that edits arriving mid-push still coalesce with them; each
//! entry carries a revision that is bumped on every fold, and
//! [`ChangeQueue::clear`] only removes an entry whose revision still matches
//! the ticket that was pushed.
//!
//! The queue never fails. Durability is handled by the engine, which mirrors
//! every change into the local store's journal.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::record::{Fields, Timestamp};
use crate::registry::Table;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Operation::Create),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeKey {
    pub table: Table,
    pub record_id: String,
}

impl ChangeKey {
    pub fn new(table: Table, record_id: impl Into<String>) -> Self {
        Self {
            table,
            record_id: record_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Pending,
    InFlight,
    /// Rejected too many times; waits for the user.
    Failed,
}

impl EntryState {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryState::Pending => "pending",
            EntryState::InFlight => "in_flight",
            EntryState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EntryState::Pending),
            "in_flight" => Some(EntryState::InFlight),
            "failed" => Some(EntryState::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    pub key: ChangeKey,
    pub operation: Operation,
    pub payload: Fields,
    /// Bumped every time another mutation folds into this entry.
    pub revision: u64,
    /// Rejected push attempts since the last local edit.
    pub attempts: u32,
    pub state: EntryState,
    /// Position in push order; kept when later edits fold in.
    pub sequence: u64,
    pub enqueued_at: Timestamp,
}

impl PendingChange {
    pub fn ticket(&self) -> ChangeTicket {
        ChangeTicket {
            key: self.key.clone(),
            revision: self.revision,
            operation: self.operation,
        }
    }
}

/// Identifies exactly what was pushed for an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeTicket {
    pub key: ChangeKey,
    pub revision: u64,
    pub operation: Operation,
}

/// Fold an incoming operation onto the pending one for the same record.
///
/// - create then update → create with merged payload
/// - anything then delete → delete, payload discarded
/// - update then update → update, later fields win
/// - delete then create → update with the new payload (the remote row is
///   presumed to exist until the delete is confirmed)
/// - delete then update → delete; the record is gone locally
/// - create then create, update then create → merged, keeping the first kind
pub fn coalesce(
    pending: Operation,
    pending_payload: Fields,
    incoming: Operation,
    incoming_payload: Fields,
) -> (Operation, Fields) {
    match (pending, incoming) {
        (_, Operation::Delete) | (Operation::Delete, Operation::Update) => {
            (Operation::Delete, Fields::new())
        }
        (Operation::Delete, Operation::Create) => (Operation::Update, incoming_payload),
        (kind @ (Operation::Create | Operation::Update), _) => {
            let mut merged = pending_payload;
            merged.extend(incoming_payload);
            (kind, merged)
        }
    }
}

#[derive(Debug, Default)]
pub struct ChangeQueue {
    entries: HashMap<ChangeKey, PendingChange>,
    next_sequence: u64,
    next_revision: u64,
}

impl ChangeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a queue from journaled entries. In-flight entries from an
    /// interrupted session go back to pending.
    pub fn restore(entries: impl IntoIterator<Item = PendingChange>) -> Self {
        let mut queue = Self::new();
        for mut entry in entries {
            if entry.state == EntryState::InFlight {
                entry.state = EntryState::Pending;
            }
            queue.next_sequence = queue.next_sequence.max(entry.sequence + 1);
            queue.next_revision = queue.next_revision.max(entry.revision + 1);
            queue.entries.insert(entry.key.clone(), entry);
        }
        queue
    }

    /// Record a local mutation, folding it into any pending entry for the same
    /// record. Returns the resulting entry.
    pub fn enqueue(
        &mut self,
        table: Table,
        record_id: impl Into<String>,
        operation: Operation,
        payload: Fields,
        now: Timestamp,
    ) -> PendingChange {
        let key = ChangeKey::new(table, record_id);
        let revision = self.next_revision;
        self.next_revision += 1;

        let entry = match self.entries.remove(&key) {
            Some(existing) => {
                let (operation, payload) =
                    coalesce(existing.operation, existing.payload, operation, payload);
                PendingChange {
                    key: key.clone(),
                    operation,
                    payload,
                    revision,
                    attempts: 0,
                    state: EntryState::Pending,
                    sequence: existing.sequence,
                    enqueued_at: existing.enqueued_at,
                }
            }
            None => {
                let sequence = self.next_sequence;
                self.next_sequence += 1;
                PendingChange {
                    key: key.clone(),
                    operation,
                    payload,
                    revision,
                    attempts: 0,
                    state: EntryState::Pending,
                    sequence,
                    enqueued_at: now,
                }
            }
        };
        self.entries.insert(key, entry.clone());
        entry
    }

    /// Hand out every pending entry in enqueue order and mark it in-flight.
    /// Failed entries are skipped.
    pub fn drain(&mut self) -> Vec<PendingChange> {
        let mut batch: Vec<PendingChange> = self
            .entries
            .values_mut()
            .filter(|e| e.state == EntryState::Pending)
            .map(|e| {
                e.state = EntryState::InFlight;
                e.clone()
            })
            .collect();
        batch.sort_by_key(|e| e.sequence);
        batch
    }

    /// Remove entries that were pushed successfully.
    ///
    /// An entry whose revision moved on since its ticket was issued stays
    /// pending. Its operation is rebased on what the remote now holds: a
    /// pending create becomes an update once the create went through, and a
    /// pending re-create becomes a create once the delete went through.
    ///
    /// Returns the keys that were removed.
    pub fn clear(&mut self, tickets: &[ChangeTicket]) -> Vec<ChangeKey> {
        let mut removed = Vec::new();
        for ticket in tickets {
            let Some(entry) = self.entries.get_mut(&ticket.key) else {
                continue;
            };
            if entry.revision == ticket.revision {
                self.entries.remove(&ticket.key);
                removed.push(ticket.key.clone());
                continue;
            }
            match (ticket.operation, entry.operation) {
                (Operation::Create, Operation::Create) => entry.operation = Operation::Update,
                (Operation::Delete, Operation::Update) => entry.operation = Operation::Create,
                (Operation::Delete, Operation::Delete) => {
                    self.entries.remove(&ticket.key);
                    removed.push(ticket.key.clone());
                }
                _ => {}
            }
        }
        removed
    }

    /// Return an in-flight entry to pending after a failed push.
    pub fn release(&mut self, ticket: &ChangeTicket) {
        match self.entries.get_mut(&ticket.key) {
            Some(entry)
                if entry.revision == ticket.revision && entry.state == EntryState::InFlight =>
            {
                entry.state = EntryState::Pending;
            }
            _ => {}
        }
    }

    /// Count a rejected push. Once `max_attempts` is reached the entry is
    /// parked as failed. Returns `true` if it was parked by this call.
    pub fn record_rejection(&mut self, ticket: &ChangeTicket, max_attempts: u32) -> bool {
        let Some(entry) = self.entries.get_mut(&ticket.key) else {
            return false;
        };
        if entry.revision != ticket.revision {
            // A newer local edit arrived; give it a fresh chance.
            return false;
        }
        entry.attempts += 1;
        if entry.attempts >= max_attempts {
            entry.state = EntryState::Failed;
            true
        } else {
            entry.state = EntryState::Pending;
            false
        }
    }

    /// Move every failed entry back to pending. Returns how many moved.
    pub fn retry_failed(&mut self) -> usize {
        let mut moved = 0;
        for entry in self.entries.values_mut() {
            if entry.state == EntryState::Failed {
                entry.state = EntryState::Pending;
                entry.attempts = 0;
                moved += 1;
            }
        }
        moved
    }

    /// Drop an entry without pushing it.
    pub fn discard(&mut self, key: &ChangeKey) -> Option<PendingChange> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &ChangeKey) -> Option<&PendingChange> {
        self.entries.get(key)
    }

    pub fn contains(&self, table: Table, record_id: &str) -> bool {
        self.entries
            .contains_key(&ChangeKey::new(table, record_id.to_string()))
    }

    /// Every entry, in push order, without changing any state.
    pub fn peek_pending(&self) -> Vec<PendingChange> {
        let mut all: Vec<PendingChange> = self.entries.values().cloned().collect();
        all.sort_by_key(|e| e.sequence);
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn failed_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.state == EntryState::Failed)
            .count()
    }
}
