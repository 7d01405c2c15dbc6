//! Time travel by version and by timestamp.

use serde_json::{json, Value};
use test_utils::{memory_table, rows};

#[tokio::test]
async fn snapshots_at_old_versions_see_old_data() {
    let table = memory_table();
    table
        .insert(rows(vec![json!({"id": "1", "value": 100})]))
        .await
        .unwrap();
    table
        .update(json!({"id": "1"}), json!({"value": 200}))
        .await
        .unwrap();

    let v0 = table.query_at(0, json!({"id": "1"}), Value::Null).await.unwrap();
    assert_eq!(v0[0]["value"], json!(100));
    let v1 = table.query_at(1, json!({"id": "1"}), Value::Null).await.unwrap();
    assert_eq!(v1[0]["value"], json!(200));

    let latest = table.query(json!({"id": "1"}), Value::Null).await.unwrap();
    assert_eq!(latest[0]["value"], json!(200));
}

#[tokio::test]
async fn missing_versions_are_rejected() {
    let table = memory_table();
    table.insert(rows(vec![json!({"id": "1"})])).await.unwrap();
    let err = table.snapshot_at(5).await.unwrap_err();
    assert!(matches!(err, doclake::Error::Validation(_)));
}

#[tokio::test]
async fn timestamp_travel_picks_the_last_commit_at_or_before() {
    let table = memory_table();
    let first = table
        .insert(rows(vec![json!({"id": "1", "value": 100})]))
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let second = table
        .update(json!({"id": "1"}), json!({"value": 200}))
        .await
        .unwrap()
        .commit
        .unwrap();

    let at_first = table
        .snapshot_at_timestamp(first.timestamp_ms)
        .await
        .unwrap();
    assert_eq!(at_first.version(), 0);

    let between = table
        .snapshot_at_timestamp(second.timestamp_ms - 1)
        .await
        .unwrap();
    assert_eq!(between.version(), 0);

    let at_second = table
        .snapshot_at_timestamp(second.timestamp_ms)
        .await
        .unwrap();
    assert_eq!(at_second.version(), 1);

    let err = table
        .snapshot_at_timestamp(first.timestamp_ms - 10_000)
        .await
        .unwrap_err();
    assert!(matches!(err, doclake::Error::Validation(_)));
}
