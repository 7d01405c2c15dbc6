//! Vacuum: physically delete data files the log no longer references.
//! A dry run reports every unreferenced file; the destructive pass
//! additionally honors the retention horizon and keeps anything still
//! reachable from a snapshot inside the retention window. The log, change
//! data, and configuration are never touched.

use std::collections::HashSet;

use chrono::Utc;
use tracing::{info, warn};

use crate::actions::Action;
use crate::config::VACUUM_RETENTION_FLOOR_HOURS;
use crate::error::DlResult;
use crate::log::{codec, segment};
use crate::metrics::EngineMetrics;
use crate::path::is_internal_path;
use crate::table::Table;

#[derive(Debug, Clone, Default)]
pub struct VacuumOptions {
    /// Defaults to the engine's `vacuum.retention_hours`; floored at 1h.
    pub retention_hours: Option<u64>,
    /// Report the unreferenced set without mutating anything.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VacuumMetrics {
    /// Unreferenced files: deletion candidates (dry run) or the files
    /// actually considered (destructive run).
    pub files_to_delete: Vec<String>,
    pub bytes: u64,
    pub files_deleted: usize,
    pub dry_run: bool,
    pub retention_hours: u64,
}

impl Table {
    /// Delete unreferenced data files past the retention horizon.
    pub async fn vacuum(&self, options: VacuumOptions) -> DlResult<VacuumMetrics> {
        let retention_hours = options
            .retention_hours
            .unwrap_or(self.config().vacuum.retention_hours)
            .max(VACUUM_RETENTION_FLOOR_HOURS);
        let now = Utc::now();
        let cutoff_ms = now.timestamp_millis() - (retention_hours as i64) * 3_600_000;

        // One replay over the whole log. `current` tracks the live set as
        // of each commit; `window_union` accumulates every live set whose
        // snapshot falls inside the retention window (those snapshots must
        // stay readable), always including the latest.
        let commits = segment::list_commits(self.storage()).await?;
        let latest = commits.last().map(|(p, _)| p.version);
        let mut current: HashSet<String> = HashSet::new();
        let mut window_union: HashSet<String> = HashSet::new();
        for (commit, mtime) in &commits {
            let bytes = self.storage().read(&commit.location).await?;
            let mut commit_ts = None;
            for action in codec::decode_commit(&bytes)? {
                match action {
                    Action::Add(add) => {
                        current.insert(add.path);
                    }
                    Action::Remove(remove) => {
                        current.remove(&remove.path);
                    }
                    Action::CommitInfo(info) => commit_ts = Some(info.timestamp),
                    _ => {}
                }
            }
            let ts = commit_ts.unwrap_or_else(|| mtime.timestamp_millis());
            if ts >= cutoff_ms || Some(commit.version) == latest {
                window_union.extend(current.iter().cloned());
            }
        }

        let entries = self.storage().list(None).await?;
        let mut metrics = VacuumMetrics {
            dry_run: options.dry_run,
            retention_hours,
            ..Default::default()
        };
        let mut deletable: Vec<(String, bool)> = Vec::new();
        for entry in entries {
            if is_internal_path(&entry.path) {
                continue;
            }
            let rel = entry.path.as_ref().to_string();
            if current.contains(&rel) {
                continue;
            }
            // The destructive pass spares files a windowed snapshot still
            // references and files younger than the horizon (they may
            // belong to an in-flight commit).
            let safe_now = !window_union.contains(&rel)
                && entry.last_modified.timestamp_millis() < cutoff_ms;
            metrics.bytes += entry.size;
            deletable.push((rel, safe_now));
        }
        deletable.sort();
        metrics.files_to_delete = deletable.iter().map(|(path, _)| path.clone()).collect();

        if options.dry_run {
            info!(candidates = metrics.files_to_delete.len(), "vacuum dry run");
            return Ok(metrics);
        }

        for (path, safe_now) in &deletable {
            if !*safe_now {
                continue;
            }
            match self
                .storage()
                .delete(&object_store::path::Path::from(path.as_str()))
                .await
            {
                Ok(()) => metrics.files_deleted += 1,
                Err(e) => warn!(path = %path, error = %e, "vacuum failed to delete file"),
            }
        }
        EngineMetrics::add(
            &self.metrics().files_vacuumed,
            metrics.files_deleted as u64,
        );
        info!(deleted = metrics.files_deleted, "vacuum finished");
        Ok(metrics)
    }
}
