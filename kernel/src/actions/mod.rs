//! The typed records that make up a commit file. One action serializes to a
//! single-line JSON object whose sole top-level key names the variant
//! (`protocol`, `metaData`, `add`, `remove`, `cdc`, `txn`, `commitInfo`).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DlResult;
use crate::schema::Schema;

pub(crate) mod serde_i64;

/// Table feature versions a client must understand to read/write the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Protocol {
    pub min_reader_version: i32,
    pub min_writer_version: i32,
}

impl Default for Protocol {
    fn default() -> Self {
        Self {
            min_reader_version: 1,
            min_writer_version: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Format {
    pub provider: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl Format {
    pub fn parquet() -> Self {
        Self {
            provider: "parquet".to_string(),
            options: HashMap::new(),
        }
    }
}

/// Table-level configuration key flipping the change data feed on.
pub const CDC_FEED_CONFIG_KEY: &str = "delta.enableChangeDataFeed";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub format: Format,
    pub schema_string: String,
    #[serde(default)]
    pub partition_columns: Vec<String>,
    #[serde(default, with = "serde_i64::option")]
    pub created_time: Option<i64>,
    #[serde(default)]
    pub configuration: HashMap<String, String>,
}

impl Metadata {
    pub fn new(schema: &Schema, partition_columns: Vec<String>, created_time: i64) -> DlResult<Self> {
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: None,
            description: None,
            format: Format::parquet(),
            schema_string: serde_json::to_string(schema)?,
            partition_columns,
            created_time: Some(created_time),
            configuration: HashMap::new(),
        })
    }

    pub fn schema(&self) -> DlResult<Schema> {
        Ok(serde_json::from_str(&self.schema_string)?)
    }

    pub fn with_schema(mut self, schema: &Schema) -> DlResult<Self> {
        self.schema_string = serde_json::to_string(schema)?;
        Ok(self)
    }

    pub fn cdc_enabled(&self) -> bool {
        self.configuration
            .get(CDC_FEED_CONFIG_KEY)
            .is_some_and(|v| v == "true")
    }

    pub fn set_cdc_enabled(&mut self, enabled: bool) {
        if enabled {
            self.configuration
                .insert(CDC_FEED_CONFIG_KEY.to_string(), "true".to_string());
        } else {
            self.configuration.remove(CDC_FEED_CONFIG_KEY);
        }
    }
}

/// Per-column zone map attached to an [`Add`]. Stored as a JSON string in
/// the log, Delta style.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub num_records: u64,
    #[serde(default)]
    pub min_values: HashMap<String, Value>,
    #[serde(default)]
    pub max_values: HashMap<String, Value>,
    #[serde(default)]
    pub null_count: HashMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Add {
    pub path: String,
    #[serde(default)]
    pub partition_values: HashMap<String, Option<String>>,
    #[serde(with = "serde_i64")]
    pub size: i64,
    #[serde(with = "serde_i64")]
    pub modification_time: i64,
    pub data_change: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<String>,
}

impl Add {
    /// Decode the zone map, tolerating absent or malformed stats.
    pub fn parsed_stats(&self) -> Option<Stats> {
        self.stats
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Remove {
    pub path: String,
    #[serde(default, with = "serde_i64::option", skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<i64>,
    pub data_change: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_values: Option<HashMap<String, Option<String>>>,
    #[serde(default, with = "serde_i64::option", skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
}

impl Remove {
    pub fn for_add(add: &Add, deletion_timestamp: i64, data_change: bool) -> Self {
        Self {
            path: add.path.clone(),
            deletion_timestamp: Some(deletion_timestamp),
            data_change,
            partition_values: Some(add.partition_values.clone()),
            size: Some(add.size),
        }
    }
}

/// Pointer to a change-data file written alongside the commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cdc {
    pub path: String,
    #[serde(default)]
    pub partition_values: HashMap<String, Option<String>>,
    #[serde(with = "serde_i64")]
    pub size: i64,
    #[serde(default)]
    pub data_change: bool,
}

/// Idempotency anchor for external drivers replaying writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Txn {
    pub app_id: String,
    #[serde(with = "serde_i64")]
    pub version: i64,
    #[serde(default, with = "serde_i64::option", skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    #[serde(with = "serde_i64")]
    pub timestamp: i64,
    pub operation: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub operation_parameters: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_info: Option<String>,
}

impl CommitInfo {
    pub fn new(timestamp: i64, operation: impl Into<String>) -> Self {
        Self {
            timestamp,
            operation: operation.into(),
            operation_parameters: HashMap::new(),
            read_version: None,
            engine_info: Some(format!("doclake/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

/// One record in a commit file. The serde representation is externally
/// tagged, which is exactly the single-top-level-key wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "commitInfo")]
    CommitInfo(CommitInfo),
    #[serde(rename = "protocol")]
    Protocol(Protocol),
    #[serde(rename = "metaData")]
    Metadata(Metadata),
    #[serde(rename = "add")]
    Add(Add),
    #[serde(rename = "remove")]
    Remove(Remove),
    #[serde(rename = "cdc")]
    Cdc(Cdc),
    #[serde(rename = "txn")]
    Txn(Txn),
}

impl From<Add> for Action {
    fn from(add: Add) -> Self {
        Self::Add(add)
    }
}

impl From<Remove> for Action {
    fn from(remove: Remove) -> Self {
        Self::Remove(remove)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_wire_format_is_single_key() {
        let add = Add {
            path: "part-00000000000000000001-0.parquet".to_string(),
            partition_values: HashMap::new(),
            size: 262,
            modification_time: 1587968586000,
            data_change: true,
            stats: None,
        };
        let line = serde_json::to_string(&Action::Add(add)).unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert!(obj.contains_key("add"));
        assert_eq!(value["add"]["modificationTime"], 1587968586000i64);
    }

    #[test]
    fn parses_delta_style_add_with_string_stats() {
        let line = r#"{"add":{"path":"p.parquet","partitionValues":{},"size":262,"modificationTime":1587968586000,"dataChange":true,"stats":"{\"numRecords\":2,\"nullCount\":{\"id\":0},\"minValues\":{\"id\":1},\"maxValues\":{\"id\":3}}"}}"#;
        let action: Action = serde_json::from_str(line).unwrap();
        let Action::Add(add) = action else {
            panic!("expected add")
        };
        let stats = add.parsed_stats().unwrap();
        assert_eq!(stats.num_records, 2);
        assert_eq!(stats.min_values["id"], Value::from(1));
    }

    #[test]
    fn oversized_numbers_round_trip_as_strings() {
        let txn = Txn {
            app_id: "loader".to_string(),
            version: (1i64 << 60) + 7,
            last_updated: None,
        };
        let line = serde_json::to_string(&Action::Txn(txn.clone())).unwrap();
        // Beyond 2^53 the codec renders a decimal string.
        assert!(line.contains("\"1152921504606846983\""));
        let back: Action = serde_json::from_str(&line).unwrap();
        assert_eq!(back, Action::Txn(txn));
    }

    #[test]
    fn metadata_cdc_flag() {
        let schema = Schema::empty();
        let mut metadata = Metadata::new(&schema, vec![], 1700000000000).unwrap();
        assert!(!metadata.cdc_enabled());
        metadata.set_cdc_enabled(true);
        assert!(metadata.cdc_enabled());
        assert_eq!(
            metadata.configuration.get(CDC_FEED_CONFIG_KEY).unwrap(),
            "true"
        );
        metadata.set_cdc_enabled(false);
        assert!(!metadata.cdc_enabled());
    }
}
