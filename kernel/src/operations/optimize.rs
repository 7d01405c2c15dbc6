//! Compaction: merge many small files into few near-target-size files,
//! per partition, without changing the row multiset.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use crate::actions::{Action, Add, Remove};
use crate::error::{DlResult, Error};
use crate::parquet::looks_like_parquet;
use crate::schema::Row;
use crate::table::Table;
use crate::transaction::{CommitResult, PreparedCommit};
use crate::writer::{write_data_files, WriteOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompactionStrategy {
    /// Merge files in log order.
    #[default]
    Greedy,
    /// First-fit-decreasing packing into target-size bins.
    BinPack,
    /// Merge smallest files first.
    SortBySize,
}

#[derive(Debug, Clone, Default)]
pub struct CompactionOptions {
    /// Defaults to the engine's `compaction.target_file_size`.
    pub target_file_size: Option<u64>,
    /// Minimum small files per partition before compaction kicks in.
    pub min_files: Option<usize>,
    pub strategy: CompactionStrategy,
    /// Refuse source files whose bytes do not look like Parquet.
    pub verify_integrity: bool,
    /// Plan and report without writing or committing.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompactionMetrics {
    pub files_compacted: usize,
    pub files_created: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub partitions_compacted: usize,
    /// Mean fill fraction of the planned bins, in `[0, 1]`.
    pub bin_packing_efficiency: f64,
    pub rows: usize,
    pub elapsed_ms: u64,
    pub throughput_bytes_per_sec: f64,
    pub num_retries: u32,
    pub dry_run: bool,
    pub commit: Option<CommitResult>,
}

/// Files grouped per partition, ordered per strategy, packed into bins of
/// at most `target` bytes (one bin may exceed it when a single file does).
fn plan_bins(files: &mut Vec<Add>, strategy: CompactionStrategy, target: u64) -> Vec<Vec<Add>> {
    match strategy {
        CompactionStrategy::Greedy => {}
        CompactionStrategy::SortBySize => files.sort_by_key(|f| f.size),
        CompactionStrategy::BinPack => files.sort_by_key(|f| std::cmp::Reverse(f.size)),
    }
    let mut bins: Vec<(u64, Vec<Add>)> = Vec::new();
    for file in files.drain(..) {
        let size = file.size.max(0) as u64;
        let slot = match strategy {
            // First fit into any bin with room.
            CompactionStrategy::BinPack => bins
                .iter_mut()
                .find(|(filled, _)| filled + size <= target),
            // Sequential fill.
            _ => bins
                .last_mut()
                .filter(|(filled, _)| filled + size <= target),
        };
        match slot {
            Some((filled, bin)) => {
                *filled += size;
                bin.push(file);
            }
            None => bins.push((size, vec![file])),
        }
    }
    bins.into_iter().map(|(_, bin)| bin).collect()
}

impl Table {
    /// Compact small live files. See [`CompactionOptions`].
    pub async fn compact(&self, options: CompactionOptions) -> DlResult<CompactionMetrics> {
        let started = Instant::now();
        let target = options
            .target_file_size
            .unwrap_or(self.config().compaction.target_file_size);
        let min_files = options
            .min_files
            .unwrap_or(self.config().compaction.min_files_for_compaction);
        if target == 0 {
            return Err(Error::validation("target file size must be positive"));
        }

        if options.dry_run {
            let snapshot = self.snapshot().await?;
            let mut metrics = CompactionMetrics {
                dry_run: true,
                ..Default::default()
            };
            for (_, mut group) in group_by_partition(&snapshot) {
                group.retain(|f| (f.size.max(0) as u64) < target);
                if group.len() < min_files {
                    continue;
                }
                metrics.partitions_compacted += 1;
                metrics.files_compacted += group.len();
                metrics.bytes_before += group.iter().map(|f| f.size.max(0) as u64).sum::<u64>();
                let bins = plan_bins(&mut group, options.strategy, target);
                metrics.bin_packing_efficiency = efficiency(&bins, target);
                metrics.files_created += bins.len();
            }
            metrics.elapsed_ms = started.elapsed().as_millis() as u64;
            return Ok(metrics);
        }

        let options = Arc::new(options);
        let shared = Arc::new(Mutex::new(CompactionMetrics::default()));
        let bytes_processed = Arc::new(AtomicU64::new(0));

        let build_options = options.clone();
        let build_metrics = shared.clone();
        let build_bytes = bytes_processed.clone();
        let result = self
            .commit_with_retry(Box::new(move |snapshot| {
                let options = build_options.clone();
                let shared = build_metrics.clone();
                let bytes_processed = build_bytes.clone();
                Box::pin(async move {
                    let snapshot = snapshot.ok_or_else(|| {
                        Error::not_found("cannot compact a table that does not exist")
                    })?;
                    let schema = snapshot.schema()?;
                    let partition_columns = snapshot.metadata().partition_columns.clone();
                    let next_version = snapshot.version() + 1;
                    let now = Utc::now().timestamp_millis();

                    let mut metrics = CompactionMetrics::default();
                    let mut actions = Vec::new();
                    let mut staged = Vec::new();

                    for (partition, mut group) in group_by_partition(&snapshot) {
                        group.retain(|f| (f.size.max(0) as u64) < target);
                        if group.len() < min_files {
                            continue;
                        }
                        metrics.partitions_compacted += 1;
                        let bins = plan_bins(&mut group, options.strategy, target);
                        metrics.bin_packing_efficiency = efficiency(&bins, target);
                        debug!(
                            partition = ?partition,
                            bins = bins.len(),
                            "compacting partition"
                        );

                        for bin in bins {
                            let mut rows: Vec<Row> = Vec::new();
                            for file in &bin {
                                if options.verify_integrity {
                                    let bytes = self.read_file_bytes(&file.path).await?;
                                    if !looks_like_parquet(&bytes) {
                                        return Err(Error::integrity(
                                            file.path.clone(),
                                            "file does not look like Parquet",
                                        ));
                                    }
                                }
                                rows.extend(self.read_file_rows(&file.path).await?);
                                metrics.bytes_before += file.size.max(0) as u64;
                            }
                            metrics.files_compacted += bin.len();
                            metrics.rows += rows.len();

                            let write_options = WriteOptions {
                                target_file_size: target,
                                statistics: self.config().statistics,
                                partition_columns: partition_columns.clone(),
                                data_change: false,
                            };
                            let adds = write_data_files(
                                self.storage(),
                                next_version,
                                &schema,
                                &rows,
                                &write_options,
                            )
                            .await?;
                            metrics.files_created += adds.len();
                            metrics.bytes_after +=
                                adds.iter().map(|a| a.size.max(0) as u64).sum::<u64>();
                            staged.extend(
                                adds.iter()
                                    .map(|a| object_store::path::Path::from(a.path.as_str())),
                            );
                            actions.extend(
                                bin.iter()
                                    .map(|f| Action::Remove(Remove::for_add(f, now, false))),
                            );
                            actions.extend(adds.into_iter().map(Action::Add));
                        }
                    }

                    bytes_processed.store(metrics.bytes_before, Ordering::SeqCst);
                    if let Ok(mut slot) = shared.lock() {
                        *slot = metrics;
                    }

                    Ok(PreparedCommit {
                        operation: "OPTIMIZE".to_string(),
                        parameters: HashMap::from([
                            ("targetSize".to_string(), Value::from(target)),
                            (
                                "strategy".to_string(),
                                Value::String(format!("{:?}", options.strategy)),
                            ),
                        ]),
                        actions,
                        staged,
                        changes: vec![],
                        read_version: Some(snapshot.version()),
                        txn: None,
                    })
                })
            }))
            .await?;

        let mut metrics = shared
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default();
        metrics.num_retries = result.num_retries;
        metrics.elapsed_ms = started.elapsed().as_millis() as u64;
        let secs = (metrics.elapsed_ms as f64 / 1000.0).max(0.001);
        metrics.throughput_bytes_per_sec = bytes_processed.load(Ordering::SeqCst) as f64 / secs;
        metrics.commit = (!result.skipped).then_some(result);
        info!(
            files_compacted = metrics.files_compacted,
            files_created = metrics.files_created,
            "compaction finished"
        );
        Ok(metrics)
    }
}

fn efficiency(bins: &[Vec<Add>], target: u64) -> f64 {
    if bins.is_empty() || target == 0 {
        return 0.0;
    }
    let filled: u64 = bins
        .iter()
        .flat_map(|bin| bin.iter())
        .map(|f| f.size.max(0) as u64)
        .sum();
    (filled as f64 / (bins.len() as u64 * target) as f64).min(1.0)
}

/// Live files grouped by partition values; the empty partition map is one
/// logical partition.
fn group_by_partition(
    snapshot: &crate::snapshot::Snapshot,
) -> Vec<(Vec<(String, Option<String>)>, Vec<Add>)> {
    let mut groups: indexmap::IndexMap<Vec<(String, Option<String>)>, Vec<Add>> =
        indexmap::IndexMap::new();
    for add in snapshot.files() {
        let mut key: Vec<(String, Option<String>)> = add
            .partition_values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        key.sort();
        groups.entry(key).or_default().push(add.clone());
    }
    groups.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn add(path: &str, size: i64) -> Add {
        Add {
            path: path.to_string(),
            partition_values: StdHashMap::new(),
            size,
            modification_time: 0,
            data_change: true,
            stats: None,
        }
    }

    #[test]
    fn greedy_packs_in_order() {
        let mut files = vec![add("a", 4), add("b", 4), add("c", 4)];
        let bins = plan_bins(&mut files, CompactionStrategy::Greedy, 8);
        assert_eq!(bins.len(), 2);
        assert_eq!(bins[0].len(), 2);
        assert_eq!(bins[0][0].path, "a");
    }

    #[test]
    fn sort_by_size_orders_ascending() {
        let mut files = vec![add("big", 6), add("small", 1), add("mid", 3)];
        let bins = plan_bins(&mut files, CompactionStrategy::SortBySize, 100);
        assert_eq!(bins.len(), 1);
        let paths: Vec<_> = bins[0].iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, ["small", "mid", "big"]);
    }

    #[test]
    fn bin_pack_first_fit_decreasing() {
        let mut files = vec![add("a", 7), add("b", 5), add("c", 3), add("d", 1)];
        let bins = plan_bins(&mut files, CompactionStrategy::BinPack, 8);
        // FFD: [7,1], [5,3]
        assert_eq!(bins.len(), 2);
        let sizes: Vec<i64> = bins.iter().map(|b| b.iter().map(|f| f.size).sum()).collect();
        assert_eq!(sizes, vec![8, 8]);
    }

    #[test]
    fn oversized_single_file_gets_its_own_bin() {
        let mut files = vec![add("huge", 100), add("tiny", 1)];
        let bins = plan_bins(&mut files, CompactionStrategy::Greedy, 10);
        assert_eq!(bins.len(), 2);
    }

    #[test]
    fn efficiency_is_fill_fraction() {
        let bins = vec![vec![add("a", 4), add("b", 4)]];
        assert!((efficiency(&bins, 16) - 0.5).abs() < f64::EPSILON);
    }
}
