//! Typed domain records.
//!
//! These are plain structs whose serde shape matches the internal record form
//! (camelCase, epoch-millisecond timestamps). The engine stores and moves
//! [`Record`]s; these types give callers a checked view of them and are used
//! to validate every record before it is written locally.

use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;
use crate::record::{Record, Timestamp};
use crate::registry::Table;

/// A typed record belonging to one synced table.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync {
    const TABLE: Table;

    fn id(&self) -> &str;

    fn to_record(&self) -> Result<Record, StoreError> {
        let record = Record::from_value(serde_json::to_value(self)?)?;
        Self::TABLE.meta().canonicalize(record.fields())
    }

    fn from_record(record: &Record) -> Result<Self, StoreError> {
        serde_json::from_value(Value::Object(record.fields().clone())).map_err(|e| {
            StoreError::validation(format!("invalid {} record: {e}", Self::TABLE))
        })
    }
}

/// Check that a canonical record decodes as its table's entity type.
pub fn validate(table: Table, record: &Record) -> Result<(), StoreError> {
    match table {
        Table::Projects => Project::from_record(record).map(drop),
        Table::Labels => Label::from_record(record).map(drop),
        Table::Tasks => Task::from_record(record).map(drop),
        Table::Subtasks => Subtask::from_record(record).map(drop),
        Table::Comments => Comment::from_record(record).map(drop),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    Urgent = 1,
    High = 2,
    Medium = 3,
    Low = 4,
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Priority::Urgent),
            2 => Ok(Priority::High),
            3 => Ok(Priority::Medium),
            4 => Ok(Priority::Low),
            other => Err(format!("priority must be 1-4, got {other}")),
        }
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> u8 {
        priority as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    ToDo,
    InProgress,
    Blocked,
    OnHold,
    Completed,
    Cancelled,
}

/// Board column of a task inside an agile project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectPhase {
    Backlog,
    Sprint,
    Review,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub color: String,
    pub icon: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub owner_id: String,
    #[serde(default)]
    pub synced_at: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub start_date: Option<Timestamp>,
    pub due_date: Option<Timestamp>,
    pub priority: Priority,
    pub project_id: Option<String>,
    #[serde(default)]
    pub label_ids: BTreeSet<String>,
    pub completed_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub owner_id: String,
    pub recurring_pattern: Option<String>,
    pub status: TaskStatus,
    pub project_phase: Option<ProjectPhase>,
    #[serde(default)]
    pub synced_at: Option<Timestamp>,
}

impl Task {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Label {
    pub id: String,
    pub name: String,
    pub color: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub owner_id: String,
    #[serde(default)]
    pub synced_at: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subtask {
    pub id: String,
    pub task_id: String,
    pub title: String,
    pub completed: bool,
    pub order: i64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub owner_id: String,
    #[serde(default)]
    pub synced_at: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub task_id: String,
    pub content: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub owner_id: String,
    #[serde(default)]
    pub synced_at: Option<Timestamp>,
}

macro_rules! impl_entity {
    ($ty:ty, $table:expr) => {
        impl Entity for $ty {
            const TABLE: Table = $table;

            fn id(&self) -> &str {
                &self.id
            }
        }
    };
}

impl_entity!(Project, Table::Projects);
impl_entity!(Label, Table::Labels);
impl_entity!(Task, Table::Tasks);
impl_entity!(Subtask, Table::Subtasks);
impl_entity!(Comment, Table::Comments);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task_record(priority: i64, status: &str) -> Record {
        let fields = json!({
            "id": "t1",
            "title": "Plan sprint",
            "priority": priority,
            "labelIds": ["l1"],
            "status": status,
            "createdAt": 1,
            "updatedAt": 2,
            "ownerId": "u1"
        });
        Table::Tasks
            .meta()
            .canonicalize(fields.as_object().unwrap())
            .unwrap()
    }

    #[test]
    fn test_task_decodes_from_canonical_record() {
        let task = Task::from_record(&task_record(2, "in_progress")).unwrap();
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(task.label_ids.contains("l1"));
        assert!(!task.is_completed());
        assert_eq!(task.synced_at, None);
    }

    #[test]
    fn test_out_of_range_priority_is_invalid() {
        assert!(validate(Table::Tasks, &task_record(7, "to_do")).is_err());
    }

    #[test]
    fn test_unknown_status_is_invalid() {
        assert!(validate(Table::Tasks, &task_record(1, "someday")).is_err());
    }

    #[test]
    fn test_entity_to_record_is_canonical() {
        let label = Label {
            id: "l1".into(),
            name: "errands".into(),
            color: "#ff0000".into(),
            created_at: 10,
            updated_at: 10,
            owner_id: "u1".into(),
            synced_at: None,
        };
        let record = label.to_record().unwrap();
        assert_eq!(record.id(), Some("l1"));
        assert_eq!(record.get("syncedAt"), Some(&Value::Null));
        assert_eq!(Label::from_record(&record).unwrap(), label);
    }
}
