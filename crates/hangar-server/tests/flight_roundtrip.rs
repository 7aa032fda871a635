//! End-to-end tests: a real listener, a real client, a real warehouse.

use std::{sync::Arc, time::Duration};

use arrow::{
    array::{Int64Array, RecordBatch, StringArray},
    datatypes::{DataType, Field, Schema},
};
use chrono::{NaiveDateTime, Utc};
use tempfile::TempDir;

use hangar_client::{ClientConfig, ClientError, HangarClient, InsertMode, SnapshotOutcome};
use hangar_core::store::StoreConfig;
use hangar_server::{IngestServer, ServerHandle, ServerState};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn sample_batch(rows: &[(i64, &str)]) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, true),
        Field::new("value", DataType::Utf8, true),
    ]));
    let ids: Vec<i64> = rows.iter().map(|(id, _)| *id).collect();
    let values: Vec<&str> = rows.iter().map(|(_, v)| *v).collect();
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(ids)),
            Arc::new(StringArray::from(values)),
        ],
    )
    .expect("valid batch")
}

async fn start_server(tmp: &TempDir) -> ServerHandle {
    let config = StoreConfig::new(tmp.path().join("warehouse"));
    let server = IngestServer::connect(config).await.expect("connect store");
    server
        .serve("127.0.0.1:0".parse().expect("valid addr"))
        .await
        .expect("bind server")
}

async fn client_for(handle: &ServerHandle) -> HangarClient {
    let config = ClientConfig::new()
        .host("127.0.0.1")
        .port(handle.addr().port())
        .connect_timeout(Duration::from_secs(2));
    HangarClient::connect(config).await.expect("connect client")
}

#[tokio::test]
async fn upload_then_read_roundtrip_with_snapshot() -> TestResult {
    let tmp = TempDir::new()?;
    let handle = start_server(&tmp).await;
    assert_eq!(handle.state(), ServerState::Serving);

    let mut client = client_for(&handle).await;

    let before = Utc::now().naive_utc();
    let result = client
        .upload(
            "t",
            vec![sample_batch(&[(1, "a"), (2, "b")])],
            InsertMode::Overwrite,
            Some("iceberg"),
        )
        .await?;

    assert_eq!(result.table_name, "t");
    assert_eq!(result.rows_written, 2);
    let SnapshotOutcome::Completed { key, path } = &result.snapshot else {
        panic!("expected completed snapshot, got {:?}", result.snapshot);
    };

    // The artifact exists and is dated at or after the upload started.
    assert!(std::path::Path::new(path).exists());
    let stamp = NaiveDateTime::parse_from_str(&key[..15], "%Y%m%d_%H%M%S")?;
    assert!(stamp >= before - chrono::Duration::seconds(1));

    // Schema probe sees the adopted schema.
    let schema = client.get_schema("t").await?;
    let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
    assert_eq!(names, vec!["id", "value"]);

    // DoGet returns exactly the uploaded rows.
    let batch = client.execute("t").await?;
    assert_eq!(batch.num_rows(), 2);
    let ids: Vec<i64> = batch
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("id column")
        .iter()
        .flatten()
        .collect();
    assert_eq!(ids, vec![1, 2]);
    let values = batch
        .column(1)
        .as_any()
        .downcast_ref::<StringArray>()
        .expect("value column");
    assert_eq!(values.value(0), "a");
    assert_eq!(values.value(1), "b");

    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn append_accumulates_across_uploads() -> TestResult {
    let tmp = TempDir::new()?;
    let handle = start_server(&tmp).await;
    let mut client = client_for(&handle).await;

    client
        .upload(
            "t",
            vec![sample_batch(&[(1, "a")])],
            InsertMode::Overwrite,
            None,
        )
        .await?;
    let result = client
        .upload(
            "t",
            vec![sample_batch(&[(2, "b")])],
            InsertMode::Append,
            None,
        )
        .await?;
    assert_eq!(result.rows_written, 1);

    let batch = client.execute("t").await?;
    assert_eq!(batch.num_rows(), 2);

    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn zero_row_upload_is_success_with_no_effect() -> TestResult {
    let tmp = TempDir::new()?;
    let handle = start_server(&tmp).await;
    let mut client = client_for(&handle).await;

    let result = client
        .upload(
            "t",
            vec![sample_batch(&[])],
            InsertMode::Overwrite,
            None,
        )
        .await?;

    assert_eq!(result.rows_written, 0);
    assert_eq!(result.snapshot, SnapshotOutcome::Skipped);

    // No snapshot artifact appeared for the no-op.
    let snap_dir = handle.store().snapshot_dir();
    assert!(!snap_dir.exists() || std::fs::read_dir(snap_dir)?.next().is_none());

    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn append_to_missing_table_is_rejected_as_not_found() -> TestResult {
    let tmp = TempDir::new()?;
    let handle = start_server(&tmp).await;
    let mut client = client_for(&handle).await;

    let err = client
        .upload(
            "ghost",
            vec![sample_batch(&[(1, "a")])],
            InsertMode::Append,
            None,
        )
        .await
        .expect_err("expected rejection");

    assert!(matches!(err, ClientError::TableNotFound { .. }));

    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn schema_probe_of_missing_table_is_not_found() -> TestResult {
    let tmp = TempDir::new()?;
    let handle = start_server(&tmp).await;
    let mut client = client_for(&handle).await;

    let err = client
        .get_schema("ghost")
        .await
        .expect_err("expected not found");
    assert!(matches!(err, ClientError::TableNotFound { table } if table == "ghost"));

    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn malformed_probe_query_is_rejected() -> TestResult {
    let tmp = TempDir::new()?;
    let handle = start_server(&tmp).await;
    let mut client = client_for(&handle).await;

    let err = client
        .get_schema_for_query("SELEKT broken FORM nowhere")
        .await
        .expect_err("expected rejection");
    assert!(matches!(err, ClientError::Rejected { .. }));

    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn connect_to_unreachable_endpoint_fails_fast() -> TestResult {
    // Bind a port, then free it so the connect gets a refusal.
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);

    let config = ClientConfig::new()
        .host("127.0.0.1")
        .port(port)
        .connect_timeout(Duration::from_millis(500));

    let started = std::time::Instant::now();
    let err = HangarClient::connect(config)
        .await
        .expect_err("expected connection failure");

    assert!(matches!(err, ClientError::Connection { .. }));
    assert!(started.elapsed() < Duration::from_secs(5));
    Ok(())
}

#[tokio::test]
async fn shutdown_drains_to_stopped() -> TestResult {
    let tmp = TempDir::new()?;
    let handle = start_server(&tmp).await;
    assert_eq!(handle.state(), ServerState::Serving);

    let mut client = client_for(&handle).await;
    client
        .upload(
            "t",
            vec![sample_batch(&[(1, "a")])],
            InsertMode::Overwrite,
            None,
        )
        .await?;

    handle.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn concurrent_uploads_to_different_tables_both_land() -> TestResult {
    let tmp = TempDir::new()?;
    let handle = start_server(&tmp).await;

    let mut left = client_for(&handle).await;
    let mut right = client_for(&handle).await;

    let (a, b) = tokio::join!(
        left.upload(
            "left",
            vec![sample_batch(&[(1, "l")])],
            InsertMode::Overwrite,
            None,
        ),
        right.upload(
            "right",
            vec![sample_batch(&[(2, "r")])],
            InsertMode::Overwrite,
            None,
        ),
    );
    assert_eq!(a?.rows_written, 1);
    assert_eq!(b?.rows_written, 1);

    let mut reader = client_for(&handle).await;
    assert_eq!(reader.execute("left").await?.num_rows(), 1);
    assert_eq!(reader.execute("right").await?.num_rows(), 1);

    handle.shutdown().await?;
    Ok(())
}
