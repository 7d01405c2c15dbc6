//! Writing: table creation, appends, idempotent transactions, schema
//! evolution.

use doclake::actions::Txn;
use doclake::operations::InsertOptions;
use doclake::{EngineConfig, Error, Table};
use serde_json::{json, Value};
use test_utils::{column, memory_table, rows};

#[tokio::test]
async fn first_insert_creates_the_table_at_version_zero() {
    let table = memory_table();
    let result = table
        .insert(rows(vec![json!({"id": "1", "name": "Alice", "value": 100})]))
        .await
        .unwrap();
    assert_eq!(result.version, 0);
    assert!(!result.skipped);

    let snapshot = table.snapshot().await.unwrap();
    assert_eq!(snapshot.version(), 0);
    assert_eq!(snapshot.num_files(), 1);

    let found = table
        .query(json!({"name": "Alice"}), Value::Null)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["value"], json!(100));
}

#[tokio::test]
async fn appends_advance_versions_without_gaps() {
    let table = memory_table();
    for i in 0..4i64 {
        let result = table
            .insert(rows(vec![json!({"id": i.to_string(), "value": i})]))
            .await
            .unwrap();
        assert_eq!(result.version, i as u64);
    }
    let snapshot = table.snapshot().await.unwrap();
    assert_eq!(snapshot.version(), 3);
    assert_eq!(snapshot.num_files(), 4);

    let all = table.query(json!({}), Value::Null).await.unwrap();
    assert_eq!(all.len(), 4);
}

#[tokio::test]
async fn round_trip_preserves_the_row_multiset() {
    let table = memory_table();
    let batch = rows(vec![
        json!({"id": "1", "name": "Alice", "score": 1.5, "active": true}),
        json!({"id": "2", "name": "Bob", "score": 2.0, "active": false}),
        json!({"id": "2", "name": "Bob", "score": 2.0, "active": false}),
        json!({"id": "3", "name": "Carol", "nested": {"a": [1, 2]}}),
    ]);
    table.insert(batch).await.unwrap();

    let mut back = table.query(json!({}), Value::Null).await.unwrap();
    back.sort_by_key(|r| r["id"].as_str().unwrap_or_default().to_string());
    assert_eq!(back.len(), 4);
    assert_eq!(back[0]["name"], json!("Alice"));
    assert_eq!(back[0]["score"], json!(1.5));
    assert_eq!(back[1]["active"], json!(false));
    // duplicate row survives as a duplicate
    assert_eq!(back[1], back[2]);
    assert_eq!(back[3]["nested"], json!({"a": [1, 2]}));
}

#[tokio::test]
async fn empty_write_is_a_validation_error() {
    let table = memory_table();
    let err = table.insert(vec![]).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn txn_anchor_makes_replays_idempotent() {
    let table = memory_table();
    table
        .insert(rows(vec![json!({"id": "seed"})]))
        .await
        .unwrap();

    let options = InsertOptions {
        app_transaction: Some(Txn {
            app_id: "loader".to_string(),
            version: 7,
            last_updated: None,
        }),
        ..Default::default()
    };
    let first = table
        .insert_with(rows(vec![json!({"id": "a"})]), options.clone())
        .await
        .unwrap();
    assert!(!first.skipped);

    // Same anchor again: no new physical commit.
    let replay = table
        .insert_with(rows(vec![json!({"id": "a"})]), options)
        .await
        .unwrap();
    assert!(replay.skipped);
    assert_eq!(replay.version, first.version);

    let all = table.query(json!({"id": "a"}), Value::Null).await.unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn schema_evolution_is_gated() {
    let strict = Table::from_storage(
        doclake::storage::in_memory(),
        EngineConfig::new().with_schema_evolution(false),
    );
    strict
        .insert(rows(vec![json!({"id": "1", "value": 1})]))
        .await
        .unwrap();
    let err = strict
        .insert(rows(vec![json!({"id": "2", "value": 2, "extra": "x"})]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let evolving = Table::from_storage(
        doclake::storage::in_memory(),
        EngineConfig::new().with_schema_evolution(true),
    );
    evolving
        .insert(rows(vec![json!({"id": "1", "value": 1})]))
        .await
        .unwrap();
    evolving
        .insert(rows(vec![json!({"id": "2", "value": 2, "extra": "x"})]))
        .await
        .unwrap();

    let snapshot = evolving.refresh().await.unwrap();
    let schema = snapshot.schema().unwrap();
    assert!(schema.field("extra").is_some());
    assert!(schema.field("extra").unwrap().nullable);

    // Old rows read back with an explicit null for the new column.
    let olds = evolving.query(json!({"id": "1"}), Value::Null).await.unwrap();
    assert_eq!(olds[0]["extra"], Value::Null);
}

#[tokio::test]
async fn type_changes_are_rejected() {
    let table = memory_table();
    table
        .insert(rows(vec![json!({"id": "1", "value": 1})]))
        .await
        .unwrap();
    let err = table
        .insert(rows(vec![json!({"id": "2", "value": true})]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn update_and_delete_roundtrip() {
    let table = memory_table();
    table
        .insert(rows(vec![
            json!({"id": "1", "value": 100}),
            json!({"id": "2", "value": 200}),
            json!({"id": "3", "value": 300}),
        ]))
        .await
        .unwrap();

    let updated = table
        .update(json!({"id": "2"}), json!({"value": 250}))
        .await
        .unwrap();
    assert_eq!(updated.rows_updated, 1);
    assert_eq!(updated.files_rewritten, 1);
    assert!(updated.commit.is_some());

    let deleted = table.delete(json!({"value": {"$lt": 150}})).await.unwrap();
    assert_eq!(deleted.rows_deleted, 1);

    let mut remaining = column(
        &table.query(json!({}), json!(["value"])).await.unwrap(),
        "value",
    );
    remaining.sort_by_key(|v| v.as_i64());
    assert_eq!(remaining, vec![json!(250), json!(300)]);

    // a delete matching nothing commits nothing
    let before = table.version().await.unwrap();
    let noop = table.delete(json!({"id": "missing"})).await.unwrap();
    assert_eq!(noop.rows_deleted, 0);
    assert!(noop.commit.is_none());
    assert_eq!(table.refresh().await.unwrap().version(), before);
}

#[tokio::test]
async fn merge_upserts_and_deletes() {
    use doclake::operations::Merge;

    let table = memory_table();
    table
        .insert(rows(vec![
            json!({"id": "1", "value": 100}),
            json!({"id": "2", "value": 200}),
        ]))
        .await
        .unwrap();

    let incoming = rows(vec![
        json!({"id": "2", "value": 999}),
        json!({"id": "3", "value": 300}),
    ]);
    let metrics = table
        .merge(Merge::new(incoming).on_columns(["id"]))
        .await
        .unwrap();
    assert_eq!(metrics.rows_updated, 1);
    assert_eq!(metrics.rows_inserted, 1);
    assert_eq!(metrics.rows_deleted, 0);

    let mut values = column(
        &table.query(json!({}), json!(["id", "value"])).await.unwrap(),
        "value",
    );
    values.sort_by_key(|v| v.as_i64());
    assert_eq!(values, vec![json!(100), json!(300), json!(999)]);

    // matched-returns-None deletes
    let metrics = table
        .merge(
            Merge::new(rows(vec![json!({"id": "1"})]))
                .on_columns(["id"])
                .when_matched(|_existing, _incoming| None)
                .when_not_matched(|_incoming| None),
        )
        .await
        .unwrap();
    assert_eq!(metrics.rows_deleted, 1);
    assert_eq!(metrics.rows_inserted, 0);
    let all = table.query(json!({}), Value::Null).await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn history_records_operations_newest_first() {
    let table = memory_table();
    table.insert(rows(vec![json!({"id": "1"})])).await.unwrap();
    table.insert(rows(vec![json!({"id": "2"})])).await.unwrap();
    table
        .update(json!({"id": "2"}), json!({"touched": true}))
        .await
        .unwrap();

    let history = table.history(None).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].version, 2);
    let ops: Vec<_> = history
        .iter()
        .filter_map(|h| h.info.as_ref().map(|i| i.operation.clone()))
        .collect();
    assert_eq!(ops, vec!["UPDATE", "WRITE", "WRITE"]);

    let limited = table.history(Some(1)).await.unwrap();
    assert_eq!(limited.len(), 1);
}
