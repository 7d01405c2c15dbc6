//! Maintenance operations: compaction, vacuum, deduplication, z-ordering.

use doclake::operations::{
    CompactionOptions, CompactionStrategy, DedupOptions, KeepStrategy, VacuumOptions,
    ZOrderOptions,
};
use serde_json::{json, Value};
use test_utils::{column, memory_table, rows, sized_batch};

/// Eight separate commits, eight small files.
async fn eight_small_files(table: &doclake::Table) {
    for i in 0..8 {
        table.insert(sized_batch(i * 10, 10, 64)).await.unwrap();
    }
    assert_eq!(table.refresh().await.unwrap().num_files(), 8);
}

#[test_log::test(tokio::test)]
async fn compaction_preserves_rows_and_shrinks_the_file_count() {
    let table = memory_table();
    eight_small_files(&table).await;
    let before = table.query(json!({}), Value::Null).await.unwrap();

    let metrics = table
        .compact(CompactionOptions {
            target_file_size: Some(1024 * 1024),
            strategy: CompactionStrategy::BinPack,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(metrics.files_compacted, 8);
    assert!(metrics.files_created <= 3);
    assert!(metrics.commit.is_some());
    assert!(metrics.bytes_before > 0);

    let snapshot = table.refresh().await.unwrap();
    assert!(snapshot.num_files() < 8);

    let after = table.query(json!({}), Value::Null).await.unwrap();
    assert_eq!(after.len(), before.len());
    let mut before_ids = column(&before, "id");
    let mut after_ids = column(&after, "id");
    before_ids.sort_by_key(|v| v.as_str().map(String::from));
    after_ids.sort_by_key(|v| v.as_str().map(String::from));
    assert_eq!(before_ids, after_ids);
}

#[tokio::test]
async fn compaction_dry_run_only_plans() {
    let table = memory_table();
    eight_small_files(&table).await;
    let version_before = table.version().await.unwrap();

    let metrics = table
        .compact(CompactionOptions {
            target_file_size: Some(1024 * 1024),
            dry_run: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(metrics.dry_run);
    assert_eq!(metrics.files_compacted, 8);
    assert!(metrics.commit.is_none());
    assert_eq!(table.refresh().await.unwrap().version(), version_before);
    assert_eq!(table.refresh().await.unwrap().num_files(), 8);
}

#[tokio::test]
async fn compaction_respects_the_minimum_file_threshold() {
    let table = memory_table();
    table.insert(sized_batch(0, 10, 64)).await.unwrap();
    let metrics = table
        .compact(CompactionOptions {
            target_file_size: Some(1024 * 1024),
            min_files: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(metrics.files_compacted, 0);
    assert!(metrics.commit.is_none());
}

#[tokio::test]
async fn vacuum_dry_run_lists_compacted_sources_without_deleting() {
    let location = test_utils::shared_memory_location();
    let table = test_utils::open_shared(&location);
    eight_small_files(&table).await;
    let live_before: Vec<String> = table
        .refresh()
        .await
        .unwrap()
        .files()
        .map(|a| a.path.clone())
        .collect();

    table
        .compact(CompactionOptions {
            target_file_size: Some(1024 * 1024),
            strategy: CompactionStrategy::BinPack,
            ..Default::default()
        })
        .await
        .unwrap();

    let metrics = table
        .vacuum(VacuumOptions {
            retention_hours: Some(168),
            dry_run: true,
        })
        .await
        .unwrap();
    // the eight tombstoned source files are candidates...
    assert_eq!(metrics.files_to_delete.len(), 8);
    for path in &live_before {
        assert!(metrics.files_to_delete.contains(path));
    }
    assert_eq!(metrics.files_deleted, 0);

    // ...and none of them was touched.
    let storage = doclake::storage::parse_table_url(
        &location,
        &doclake::storage::StorageOptions::default(),
    )
    .unwrap();
    for path in &live_before {
        let stat = storage
            .stat(&object_store::path::Path::from(path.as_str()))
            .await
            .unwrap();
        assert!(stat.is_some(), "{path} should still exist");
    }
}

#[tokio::test]
async fn vacuum_spares_young_files_on_a_destructive_run() {
    let table = memory_table();
    eight_small_files(&table).await;
    table
        .compact(CompactionOptions {
            target_file_size: Some(1024 * 1024),
            ..Default::default()
        })
        .await
        .unwrap();

    let metrics = table
        .vacuum(VacuumOptions {
            retention_hours: Some(1),
            dry_run: false,
        })
        .await
        .unwrap();
    // everything is younger than the 1h floor, so nothing is deleted
    assert_eq!(metrics.files_deleted, 0);
    assert_eq!(metrics.retention_hours, 1);
    let all = table.query(json!({}), Value::Null).await.unwrap();
    assert_eq!(all.len(), 80);
}

#[tokio::test]
async fn exact_dedup_collapses_identical_rows() {
    let table = memory_table();
    table
        .insert(rows(vec![
            json!({"id": "1", "value": 1}),
            json!({"id": "1", "value": 1}),
            json!({"id": "2", "value": 2}),
        ]))
        .await
        .unwrap();
    table
        .insert(rows(vec![json!({"id": "1", "value": 1})]))
        .await
        .unwrap();

    let metrics = table.dedup(DedupOptions::default()).await.unwrap();
    assert_eq!(metrics.rows_before, 4);
    assert_eq!(metrics.rows_after, 2);
    assert_eq!(metrics.duplicates_removed, 2);
    assert!((metrics.deduplication_ratio - 0.5).abs() < 1e-9);

    let all = table.query(json!({}), Value::Null).await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn keyed_dedup_keeps_the_latest_by_order_column() {
    let table = memory_table();
    table
        .insert(rows(vec![
            json!({"id": "a", "rev": 1, "payload": "old"}),
            json!({"id": "a", "rev": 3, "payload": "new"}),
            json!({"id": "a", "rev": 2, "payload": "mid"}),
            json!({"id": "b", "rev": 1, "payload": "only"}),
        ]))
        .await
        .unwrap();

    let metrics = table
        .dedup(DedupOptions {
            key_columns: vec!["id".to_string()],
            keep: KeepStrategy::Latest,
            order_by: Some("rev".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(metrics.rows_after, 2);
    assert_eq!(metrics.max_duplicates_per_key, Some(3));
    let distribution = metrics.distribution.unwrap();
    assert_eq!(distribution.len(), 1);

    let survivors = table.query(json!({"id": "a"}), Value::Null).await.unwrap();
    assert_eq!(survivors.len(), 1);
    assert_eq!(survivors[0]["payload"], json!("new"));
}

#[tokio::test]
async fn dedup_with_no_duplicates_commits_nothing() {
    let table = memory_table();
    table
        .insert(rows(vec![json!({"id": "1"}), json!({"id": "2"})]))
        .await
        .unwrap();
    let metrics = table.dedup(DedupOptions::default()).await.unwrap();
    assert_eq!(metrics.duplicates_removed, 0);
    assert!(metrics.commit.is_none());
}

#[test_log::test(tokio::test)]
async fn zorder_preserves_data_and_reports_stats() {
    let table = memory_table();
    for chunk in 0..4 {
        table
            .insert(rows(
                (0..25)
                    .map(|i| {
                        let n = chunk * 25 + i;
                        json!({
                            "id": n.to_string(),
                            "x": n % 10,
                            "y": n / 10,
                        })
                    })
                    .collect(),
            ))
            .await
            .unwrap();
    }
    let before = table.query(json!({}), Value::Null).await.unwrap();

    let metrics = table
        .zorder(ZOrderOptions {
            columns: vec!["x".to_string(), "y".to_string()],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(metrics.files_before, 4);
    assert_eq!(metrics.rows, 100);
    assert!((0.31..=0.9).contains(&metrics.estimated_skip_rate));
    assert!(metrics.commit.is_some());

    let after = table.query(json!({}), Value::Null).await.unwrap();
    assert_eq!(after.len(), before.len());
    let mut before_ids = column(&before, "id");
    let mut after_ids = column(&after, "id");
    before_ids.sort_by_key(|v| v.as_str().map(String::from));
    after_ids.sort_by_key(|v| v.as_str().map(String::from));
    assert_eq!(before_ids, after_ids);
}

#[tokio::test]
async fn maintenance_commits_do_not_feed_cdc() {
    let table = memory_table();
    table.enable_cdc().await.unwrap();
    eight_small_files(&table).await;
    let compaction = table
        .compact(CompactionOptions {
            target_file_size: Some(1024 * 1024),
            ..Default::default()
        })
        .await
        .unwrap();
    let version = compaction.commit.unwrap().version;
    let records = table
        .cdc_reader()
        .read_by_version(version, version)
        .await
        .unwrap();
    assert!(records.is_empty());
}
