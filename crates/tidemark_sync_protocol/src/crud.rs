//! Pending local writes.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Type of a local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UpdateType {
    /// Insert or replace a row.
    Put,
    /// Update some columns of a row.
    Patch,
    /// Delete a row.
    Delete,
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateType::Put => f.write_str("PUT"),
            UpdateType::Patch => f.write_str("PATCH"),
            UpdateType::Delete => f.write_str("DELETE"),
        }
    }
}

/// The JSON document stored in the `data` column of a write-queue row.
#[derive(Debug, Deserialize)]
struct CrudRowData {
    op: UpdateType,
    #[serde(rename = "type")]
    table: String,
    id: String,
    #[serde(default)]
    data: Option<Map<String, Value>>,
    #[serde(default)]
    metadata: Option<String>,
    #[serde(default)]
    old: Option<Map<String, Value>>,
}

/// One pending local write.
///
/// Created by a trigger inside the storage engine, read through the
/// write-queue API and deleted once its batch is completed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrudEntry {
    /// Auto-incrementing id of the queue row. Never reissued.
    pub client_id: i64,
    /// Type of the write.
    pub op: UpdateType,
    /// Target table.
    pub table: String,
    /// Target row id.
    pub id: String,
    /// Local transaction the write belongs to.
    pub transaction_id: Option<i64>,
    /// Written columns (absent for DELETE).
    pub op_data: Option<Map<String, Value>>,
    /// Application-supplied metadata.
    pub metadata: Option<String>,
    /// Previous column values, when the table tracks them.
    pub previous_values: Option<Map<String, Value>>,
}

impl CrudEntry {
    /// Builds an entry from a write-queue row.
    pub fn from_row(client_id: i64, transaction_id: Option<i64>, data: &str) -> ProtocolResult<Self> {
        let row: CrudRowData = serde_json::from_str(data)?;
        if row.table.is_empty() {
            return Err(ProtocolError::invalid_structure("crud entry without table"));
        }

        Ok(Self {
            client_id,
            op: row.op,
            table: row.table,
            id: row.id,
            transaction_id,
            op_data: row.data,
            metadata: row.metadata,
            previous_values: row.old,
        })
    }

    /// Encodes the row document the storage engine keeps for this entry.
    pub fn row_data(&self) -> String {
        let mut doc = Map::new();
        doc.insert("op".into(), Value::String(self.op.to_string()));
        doc.insert("type".into(), Value::String(self.table.clone()));
        doc.insert("id".into(), Value::String(self.id.clone()));
        if let Some(data) = &self.op_data {
            doc.insert("data".into(), Value::Object(data.clone()));
        }
        if let Some(metadata) = &self.metadata {
            doc.insert("metadata".into(), Value::String(metadata.clone()));
        }
        if let Some(old) = &self.previous_values {
            doc.insert("old".into(), Value::Object(old.clone()));
        }
        Value::Object(doc).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_row_put() {
        let entry = CrudEntry::from_row(
            4,
            Some(2),
            r#"{"op":"PUT","type":"todos","id":"t1","data":{"title":"milk"}}"#,
        )
        .unwrap();

        assert_eq!(entry.client_id, 4);
        assert_eq!(entry.transaction_id, Some(2));
        assert_eq!(entry.op, UpdateType::Put);
        assert_eq!(entry.table, "todos");
        assert_eq!(entry.op_data.unwrap()["title"], "milk");
    }

    #[test]
    fn from_row_delete_without_data() {
        let entry =
            CrudEntry::from_row(9, None, r#"{"op":"DELETE","type":"todos","id":"t1"}"#).unwrap();
        assert_eq!(entry.op, UpdateType::Delete);
        assert!(entry.op_data.is_none());
    }

    #[test]
    fn from_row_rejects_garbage() {
        assert!(CrudEntry::from_row(1, None, "not json").is_err());
        assert!(CrudEntry::from_row(1, None, r#"{"op":"MERGE","type":"t","id":"1"}"#).is_err());
        assert!(CrudEntry::from_row(1, None, r#"{"op":"PUT","type":"","id":"1"}"#).is_err());
    }

    #[test]
    fn row_data_is_readable_again() {
        let entry = CrudEntry::from_row(
            1,
            None,
            r#"{"op":"PATCH","type":"lists","id":"l1","data":{"name":"x"},"metadata":"m"}"#,
        )
        .unwrap();
        let again = CrudEntry::from_row(1, None, &entry.row_data()).unwrap();
        assert_eq!(again, entry);
    }
}
