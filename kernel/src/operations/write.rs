//! INSERT: append a batch of rows, creating the table on first write.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::actions::{Action, Metadata, Protocol, Txn};
use crate::cdc::{read_cdc_config, ChangeType, StagedChange};
use crate::error::{DlResult, Error};
use crate::metrics::EngineMetrics;
use crate::schema::{Row, Schema};
use crate::table::Table;
use crate::transaction::{CommitResult, PreparedCommit};
use crate::writer::{write_data_files, WriteOptions};

#[derive(Debug, Clone, Default)]
pub struct InsertOptions {
    /// Partition columns recorded in the table metadata when this insert
    /// creates the table; ignored afterwards.
    pub partition_columns: Vec<String>,
    /// Idempotency anchor: a snapshot whose transaction for this app id is
    /// at or past this version skips the insert.
    pub app_transaction: Option<Txn>,
}

impl Table {
    /// Append rows to the table, creating it (version 0) if absent.
    pub async fn insert(&self, rows: Vec<Row>) -> DlResult<CommitResult> {
        self.insert_with(rows, InsertOptions::default()).await
    }

    pub async fn insert_with(
        &self,
        rows: Vec<Row>,
        options: InsertOptions,
    ) -> DlResult<CommitResult> {
        if rows.is_empty() {
            return Err(Error::validation("cannot commit an empty write"));
        }
        let rows = Arc::new(rows);
        let options = Arc::new(options);
        let result = self
            .commit_with_retry(Box::new(move |snapshot| {
                let rows = rows.clone();
                let options = options.clone();
                Box::pin(async move {
                    let cdc_on = read_cdc_config(self.storage()).await;
                    let batch_schema = Schema::infer(&rows)?;

                    let mut actions: Vec<Action> = Vec::new();
                    let (write_schema, partition_columns, next_version, read_version) =
                        match &snapshot {
                            None => {
                                let mut metadata = Metadata::new(
                                    &batch_schema,
                                    options.partition_columns.clone(),
                                    Utc::now().timestamp_millis(),
                                )?;
                                metadata.set_cdc_enabled(cdc_on);
                                actions.push(Action::Protocol(Protocol::default()));
                                actions.push(Action::Metadata(metadata));
                                (batch_schema, options.partition_columns.clone(), 0, None)
                            }
                            Some(snapshot) => {
                                let table_schema = snapshot.schema()?;
                                let write_schema = table_schema
                                    .merge(&batch_schema, self.config().schema_evolution)?;
                                let metadata = snapshot.metadata();
                                if write_schema != table_schema
                                    || metadata.cdc_enabled() != cdc_on
                                {
                                    let mut updated =
                                        metadata.clone().with_schema(&write_schema)?;
                                    updated.set_cdc_enabled(cdc_on);
                                    actions.push(Action::Metadata(updated));
                                }
                                (
                                    write_schema,
                                    metadata.partition_columns.clone(),
                                    snapshot.version() + 1,
                                    Some(snapshot.version()),
                                )
                            }
                        };

                    let write_options = WriteOptions {
                        target_file_size: self.config().compaction.target_file_size,
                        statistics: self.config().statistics,
                        partition_columns,
                        data_change: true,
                    };
                    let adds = write_data_files(
                        self.storage(),
                        next_version,
                        &write_schema,
                        &rows,
                        &write_options,
                    )
                    .await?;
                    EngineMetrics::add(&self.metrics().files_written, adds.len() as u64);
                    EngineMetrics::add(&self.metrics().rows_written, rows.len() as u64);
                    EngineMetrics::add(
                        &self.metrics().bytes_written,
                        adds.iter().map(|a| a.size as u64).sum(),
                    );

                    let staged = adds
                        .iter()
                        .map(|a| object_store::path::Path::from(a.path.as_str()))
                        .collect();
                    actions.extend(adds.into_iter().map(Action::Add));

                    let changes = if cdc_on {
                        rows.iter()
                            .map(|row| StagedChange::new(ChangeType::Insert, row.clone()))
                            .collect()
                    } else {
                        Vec::new()
                    };

                    Ok(PreparedCommit {
                        operation: "WRITE".to_string(),
                        parameters: HashMap::from([(
                            "mode".to_string(),
                            Value::String("Append".to_string()),
                        )]),
                        actions,
                        staged,
                        changes,
                        read_version,
                        txn: options.app_transaction.clone(),
                    })
                })
            }))
            .await?;
        Ok(result)
    }

    /// Commit an empty table (protocol + metadata only) at version 0.
    pub(crate) async fn create_table_commit(
        &self,
        schema: &Schema,
        partition_columns: Vec<String>,
    ) -> DlResult<CommitResult> {
        let schema = schema.clone();
        self.commit_with_retry(Box::new(move |snapshot| {
            let schema = schema.clone();
            let partition_columns = partition_columns.clone();
            Box::pin(async move {
                if let Some(snapshot) = snapshot {
                    return Err(Error::validation(format!(
                        "table already exists at version {}",
                        snapshot.version()
                    )));
                }
                let cdc_on = read_cdc_config(self.storage()).await;
                let mut metadata = Metadata::new(
                    &schema,
                    partition_columns,
                    Utc::now().timestamp_millis(),
                )?;
                metadata.set_cdc_enabled(cdc_on);
                Ok(PreparedCommit {
                    operation: "CREATE".to_string(),
                    parameters: HashMap::new(),
                    actions: vec![
                        Action::Protocol(Protocol::default()),
                        Action::Metadata(metadata),
                    ],
                    staged: vec![],
                    changes: vec![],
                    read_version: None,
                    txn: None,
                })
            })
        }))
        .await
    }
}
