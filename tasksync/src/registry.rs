//! Schema description for the synced tables.
//!
//! Each [`Table`] has a static [`TableMeta`] listing its columns: the camelCase
//! field name used internally, the snake_case column name used by SQLite and
//! by the remote backend, the value kind, nullability and the table a foreign
//! key points at. Both store adapters and the boundary codec consume this
//! description; nothing is derived by reflection.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;
use crate::protocol;
use crate::record::{Fields, Record};

/// The five synced tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Projects,
    Labels,
    Tasks,
    Subtasks,
    Comments,
}

impl Table {
    /// All tables, parents before children. Pulls walk this order so foreign
    /// keys resolve.
    pub const ALL: [Table; 5] = [
        Table::Projects,
        Table::Labels,
        Table::Tasks,
        Table::Subtasks,
        Table::Comments,
    ];

    pub fn name(self) -> &'static str {
        self.meta().name
    }

    pub fn meta(self) -> &'static TableMeta {
        match self {
            Table::Projects => &PROJECTS,
            Table::Labels => &LABELS,
            Table::Tasks => &TASKS,
            Table::Subtasks => &SUBTASKS,
            Table::Comments => &COMMENTS,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Table {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Table::ALL
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| StoreError::validation(format!("unknown table {s:?}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    Boolean,
    /// Epoch milliseconds internally; ISO-8601 on the wire.
    Timestamp,
    /// A set of record ids. JSON array internally, serialized JSON on the wire.
    IdList,
}

/// One column of a synced table.
#[derive(Debug, Clone, Copy)]
pub struct Column {
    /// camelCase name used in records.
    pub field: &'static str,
    /// snake_case name used by SQLite and the remote backend.
    pub column: &'static str,
    pub kind: ColumnKind,
    pub nullable: bool,
    /// Target table when the column is a foreign key.
    pub references: Option<Table>,
    /// Local-only columns never cross the remote boundary.
    pub local_only: bool,
}

const fn required(field: &'static str, column: &'static str, kind: ColumnKind) -> Column {
    Column {
        field,
        column,
        kind,
        nullable: false,
        references: None,
        local_only: false,
    }
}

const fn optional(field: &'static str, column: &'static str, kind: ColumnKind) -> Column {
    Column {
        field,
        column,
        kind,
        nullable: true,
        references: None,
        local_only: false,
    }
}

const fn foreign(
    field: &'static str,
    column: &'static str,
    target: Table,
    nullable: bool,
) -> Column {
    Column {
        field,
        column,
        kind: ColumnKind::Text,
        nullable,
        references: Some(target),
        local_only: false,
    }
}

const ID: Column = required("id", "id", ColumnKind::Text);
const CREATED_AT: Column = required("createdAt", "created_at", ColumnKind::Timestamp);
const UPDATED_AT: Column = required("updatedAt", "updated_at", ColumnKind::Timestamp);
const OWNER_ID: Column = required("ownerId", "owner_id", ColumnKind::Text);
const SYNCED_AT: Column = Column {
    field: "syncedAt",
    column: "synced_at",
    kind: ColumnKind::Timestamp,
    nullable: true,
    references: None,
    local_only: true,
};

/// Metadata about a synced table.
#[derive(Debug)]
pub struct TableMeta {
    pub table: Table,
    /// Table name, identical locally and remotely.
    pub name: &'static str,
    pub columns: &'static [Column],
}

static PROJECTS: TableMeta = TableMeta {
    table: Table::Projects,
    name: "projects",
    columns: &[
        ID,
        required("name", "name", ColumnKind::Text),
        required("color", "color", ColumnKind::Text),
        optional("icon", "icon", ColumnKind::Text),
        CREATED_AT,
        UPDATED_AT,
        OWNER_ID,
        SYNCED_AT,
    ],
};

static LABELS: TableMeta = TableMeta {
    table: Table::Labels,
    name: "labels",
    columns: &[
        ID,
        required("name", "name", ColumnKind::Text),
        required("color", "color", ColumnKind::Text),
        CREATED_AT,
        UPDATED_AT,
        OWNER_ID,
        SYNCED_AT,
    ],
};

static TASKS: TableMeta = TableMeta {
    table: Table::Tasks,
    name: "tasks",
    columns: &[
        ID,
        required("title", "title", ColumnKind::Text),
        optional("description", "description", ColumnKind::Text),
        optional("startDate", "start_date", ColumnKind::Timestamp),
        optional("dueDate", "due_date", ColumnKind::Timestamp),
        required("priority", "priority", ColumnKind::Integer),
        foreign("projectId", "project_id", Table::Projects, true),
        required("labelIds", "label_ids", ColumnKind::IdList),
        optional("completedAt", "completed_at", ColumnKind::Timestamp),
        CREATED_AT,
        UPDATED_AT,
        OWNER_ID,
        optional("recurringPattern", "recurring_pattern", ColumnKind::Text),
        required("status", "status", ColumnKind::Text),
        optional("projectPhase", "project_phase", ColumnKind::Text),
        SYNCED_AT,
    ],
};

static SUBTASKS: TableMeta = TableMeta {
    table: Table::Subtasks,
    name: "subtasks",
    columns: &[
        ID,
        foreign("taskId", "task_id", Table::Tasks, false),
        required("title", "title", ColumnKind::Text),
        required("completed", "completed", ColumnKind::Boolean),
        required("order", "order", ColumnKind::Integer),
        CREATED_AT,
        UPDATED_AT,
        OWNER_ID,
        SYNCED_AT,
    ],
};

static COMMENTS: TableMeta = TableMeta {
    table: Table::Comments,
    name: "comments",
    columns: &[
        ID,
        foreign("taskId", "task_id", Table::Tasks, false),
        required("content", "content", ColumnKind::Text),
        CREATED_AT,
        UPDATED_AT,
        OWNER_ID,
        SYNCED_AT,
    ],
};

impl TableMeta {
    /// Look up a column by its camelCase field name.
    pub fn field(&self, field: &str) -> Option<&'static Column> {
        self.columns.iter().find(|c| c.field == field)
    }

    /// Look up a column by its snake_case column name.
    pub fn column(&self, column: &str) -> Option<&'static Column> {
        self.columns.iter().find(|c| c.column == column)
    }

    /// Columns that cross the remote boundary.
    pub fn remote_columns(&self) -> impl Iterator<Item = &'static Column> {
        self.columns.iter().filter(|c| !c.local_only)
    }

    pub fn foreign_keys(&self) -> impl Iterator<Item = &'static Column> {
        self.columns.iter().filter(|c| c.references.is_some())
    }

    /// Normalize the fields of a patch without filling in absent columns.
    /// Unknown fields are rejected.
    pub fn normalize_patch(&self, patch: &Fields) -> Result<Fields, StoreError> {
        let mut out = Fields::new();
        for (field, value) in patch {
            let column = self.field(field).ok_or_else(|| {
                StoreError::validation(format!("{} has no field {field:?}", self.name))
            })?;
            out.insert(field.clone(), protocol::normalize_value(column, value)?);
        }
        Ok(out)
    }

    /// Build the canonical internal form of a full record: every column
    /// present, normalized, nulls explicit, `labelIds` defaulting to `[]`.
    pub fn canonicalize(&self, fields: &Fields) -> Result<Record, StoreError> {
        let normalized = self.normalize_patch(fields)?;
        let mut out = Fields::new();
        for column in self.columns {
            let value = match normalized.get(column.field) {
                Some(value) => value.clone(),
                None if column.kind == ColumnKind::IdList => Value::Array(Vec::new()),
                None => Value::Null,
            };
            out.insert(column.field.to_string(), value);
        }
        Ok(Record::new(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_table_names_round_trip() {
        for table in Table::ALL {
            assert_eq!(table.name().parse::<Table>().unwrap(), table);
        }
        assert!("widgets".parse::<Table>().is_err());
    }

    #[test]
    fn test_synced_at_stays_local() {
        for table in Table::ALL {
            assert!(table.meta().remote_columns().all(|c| c.field != "syncedAt"));
            assert!(table.meta().field("syncedAt").is_some());
        }
    }

    #[test]
    fn test_foreign_keys_point_at_parents() {
        let fks: Vec<_> = Table::Tasks.meta().foreign_keys().collect();
        assert_eq!(fks.len(), 1);
        assert_eq!(fks[0].references, Some(Table::Projects));
        assert!(fks[0].nullable);

        let fk = Table::Comments.meta().field("taskId").unwrap();
        assert_eq!(fk.references, Some(Table::Tasks));
        assert!(!fk.nullable);
    }

    #[test]
    fn test_canonicalize_fills_every_column() {
        let mut fields = Fields::new();
        fields.insert("id".into(), json!("t1"));
        fields.insert("title".into(), json!("Write report"));
        let record = Table::Tasks.meta().canonicalize(&fields).unwrap();

        assert_eq!(record.fields().len(), Table::Tasks.meta().columns.len());
        assert_eq!(record.get("labelIds"), Some(&json!([])));
        assert_eq!(record.get("dueDate"), Some(&Value::Null));
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let mut fields = Fields::new();
        fields.insert("colour".into(), json!("red"));
        assert!(Table::Labels.meta().normalize_patch(&fields).is_err());
    }
}
