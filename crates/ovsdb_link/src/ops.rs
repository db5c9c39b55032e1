//! Transaction operations and monitor structures.
//!
//! Shapes here mirror the JSON the server expects member for member, so
//! the structs serialize straight into `transact` and `monitor_cond`
//! params without a translation step.

use std::collections::BTreeMap;

use serde::{de, Deserialize, Serialize};
use uuid::Uuid;

use crate::value::{Row, Value};

/// One operation inside a `transact` call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Operation {
    pub op: OpKind,
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<Row>,
    #[serde(default, rename = "uuid-name", skip_serializing_if = "Option::is_none")]
    pub uuid_name: Option<String>,
    #[serde(default, rename = "where", skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutations: Option<Vec<Mutation>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Insert,
    Update,
    Mutate,
    Delete,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OpKind::Insert => "insert",
            OpKind::Update => "update",
            OpKind::Mutate => "mutate",
            OpKind::Delete => "delete",
        })
    }
}

impl Operation {
    pub fn insert(table: impl Into<String>, row: Row) -> Operation {
        Operation {
            op: OpKind::Insert,
            table: table.into(),
            row: Some(row),
            uuid_name: None,
            conditions: None,
            mutations: None,
        }
    }

    /// Name the inserted row so later operations in the same transaction
    /// can reference it through `named-uuid`.
    pub fn with_uuid_name(mut self, name: impl Into<String>) -> Operation {
        self.uuid_name = Some(name.into());
        self
    }

    pub fn update(table: impl Into<String>, conditions: Vec<Condition>, row: Row) -> Operation {
        Operation {
            op: OpKind::Update,
            table: table.into(),
            row: Some(row),
            uuid_name: None,
            conditions: Some(conditions),
            mutations: None,
        }
    }

    pub fn mutate(
        table: impl Into<String>,
        conditions: Vec<Condition>,
        mutations: Vec<Mutation>,
    ) -> Operation {
        Operation {
            op: OpKind::Mutate,
            table: table.into(),
            row: None,
            uuid_name: None,
            conditions: Some(conditions),
            mutations: Some(mutations),
        }
    }

    pub fn delete(table: impl Into<String>, conditions: Vec<Condition>) -> Operation {
        Operation {
            op: OpKind::Delete,
            table: table.into(),
            row: None,
            uuid_name: None,
            conditions: Some(conditions),
            mutations: None,
        }
    }
}

/// `[column, function, value]` clause for a `where` member.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Condition(pub String, pub String, pub Value);

impl Condition {
    pub fn eq(column: impl Into<String>, value: Value) -> Condition {
        Condition(column.into(), "==".into(), value)
    }
}

/// `[column, mutator, value]` clause for a `mutate` operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Mutation(pub String, pub String, pub Value);

impl Mutation {
    pub fn insert(column: impl Into<String>, value: Value) -> Mutation {
        Mutation(column.into(), "insert".into(), value)
    }

    pub fn delete(column: impl Into<String>, value: Value) -> Mutation {
        Mutation(column.into(), "delete".into(), value)
    }
}

/// Per-operation member of a `transact` reply.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct OperationResult {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default, deserialize_with = "de_opt_wire_uuid")]
    pub uuid: Option<Uuid>,
    #[serde(default)]
    pub rows: Vec<Row>,
}

impl OperationResult {
    /// Error member, when present and non-empty.
    pub fn failure(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.is_empty())
    }
}

fn de_opt_wire_uuid<'de, D>(deserializer: D) -> Result<Option<Uuid>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Option::<(String, String)>::deserialize(deserializer)? {
        None => Ok(None),
        Some((tag, id)) if tag == "uuid" => {
            Uuid::parse_str(&id).map(Some).map_err(de::Error::custom)
        }
        Some((tag, _)) => Err(de::Error::custom(format!(
            "expected a uuid pair, got tag {tag:?}"
        ))),
    }
}

/// Per-table member of a monitor request.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MonitorRequest {
    /// Empty means every column.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<MonitorSelect>,
}

impl MonitorRequest {
    pub fn all_columns() -> MonitorRequest {
        MonitorRequest {
            columns: Vec::new(),
            select: Some(MonitorSelect::all()),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MonitorSelect {
    pub initial: bool,
    pub insert: bool,
    pub delete: bool,
    pub modify: bool,
}

impl MonitorSelect {
    pub fn all() -> MonitorSelect {
        MonitorSelect {
            initial: true,
            insert: true,
            delete: true,
            modify: true,
        }
    }
}

/// Classic monitor payload: table, then row id, then old/new pair.
pub type TableUpdates = BTreeMap<String, BTreeMap<Uuid, RowUpdate>>;

/// Conditional monitor payload with delta rows.
pub type TableUpdates2 = BTreeMap<String, BTreeMap<Uuid, RowUpdate2>>;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RowUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Row>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RowUpdate2 {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert: Option<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modify: Option<Row>,
    /// Presence alone marks the delete; servers usually send null here.
    #[serde(
        default,
        deserialize_with = "de_delete_marker",
        skip_serializing_if = "Option::is_none"
    )]
    pub delete: Option<Row>,
}

fn de_delete_marker<'de, D>(deserializer: D) -> Result<Option<Row>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<Row>::deserialize(deserializer)?;
    Ok(Some(raw.unwrap_or_default()))
}

/// Reply to `monitor_cond_since`.
#[derive(Clone, Debug)]
pub struct MonitorCondSinceReply {
    /// Whether the server still had the transaction we resumed from.
    pub found: bool,
    pub last_txn: String,
    pub updates: TableUpdates2,
}

/// Reply to `lock` and `steal`.
#[derive(Clone, Debug, Deserialize)]
pub struct LockReply {
    #[serde(default)]
    pub locked: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_op_wire_shape() {
        let mut row = Row::new();
        row.insert("name".into(), Value::Str("ls0".into()));
        let op = Operation::insert("Logical_Switch", row).with_uuid_name("row1");
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({
                "op": "insert",
                "table": "Logical_Switch",
                "row": {"name": "ls0"},
                "uuid-name": "row1",
            })
        );
    }

    #[test]
    fn mutate_op_wire_shape() {
        let op = Operation::mutate(
            "Logical_Switch",
            vec![Condition::eq("name", Value::Str("ls0".into()))],
            vec![Mutation::insert(
                "ports",
                Value::NamedUuid("row1".into()),
            )],
        );
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({
                "op": "mutate",
                "table": "Logical_Switch",
                "where": [["name", "==", "ls0"]],
                "mutations": [["ports", "insert", ["named-uuid", "row1"]]],
            })
        );
    }

    #[test]
    fn delete_op_keeps_empty_where() {
        let op = Operation::delete("ACL", Vec::new());
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({"op": "delete", "table": "ACL", "where": []})
        );
    }

    #[test]
    fn result_uuid_pair_decodes() {
        let result: OperationResult = serde_json::from_value(json!({
            "uuid": ["uuid", "7a3e4c2e-78cf-4a8d-a6b4-b6a1f53a43f1"]
        }))
        .unwrap();
        assert_eq!(
            result.uuid.map(|u| u.to_string()).as_deref(),
            Some("7a3e4c2e-78cf-4a8d-a6b4-b6a1f53a43f1")
        );
        assert!(result.failure().is_none());
    }

    #[test]
    fn result_error_member_decodes() {
        let result: OperationResult = serde_json::from_value(json!({
            "error": "constraint violation",
            "details": "duplicate name",
        }))
        .unwrap();
        assert_eq!(result.failure(), Some("constraint violation"));
        assert_eq!(result.details.as_deref(), Some("duplicate name"));
    }

    #[test]
    fn delete_marker_survives_null() {
        let update: RowUpdate2 = serde_json::from_value(json!({"delete": null})).unwrap();
        assert_eq!(update.delete, Some(Row::new()));
        let update: RowUpdate2 = serde_json::from_value(json!({"insert": {"n": 1}})).unwrap();
        assert!(update.delete.is_none());
        assert!(update.insert.is_some());
    }
}
