//! Full pipeline: feed server -> decoder -> workers -> store

use crate::support::{
    ltp_packet, quote_packet, static_auth, test_config, wait_for_ticks, FeedServer, ServerSession,
};
use async_trait::async_trait;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tick_ingest::auth::{AuthError, Authenticator, Session};
use tick_ingest::config::WriteMode;
use tick_ingest::ingest::Ingestor;
use tick_ingest::storage::{MemoryStore, ParquetStore, TickStore};
use tick_ingest::supervisor::SupervisorError;
use tick_ingest::telemetry::PipelineMetrics;
use tick_ingest::ws::TungsteniteTransport;
use tokio::sync::watch;

struct RejectingAuth;

#[async_trait]
impl Authenticator for RejectingAuth {
    async fn authenticate(&self) -> Result<Session, AuthError> {
        Err(AuthError::Rejected("Invalid totp".into()))
    }
}

#[tokio::test]
async fn test_end_to_end_single_writes() {
    let server = FeedServer::start(vec![ServerSession {
        packets: vec![
            ltp_packet("2885", 250000, 1),
            vec![1, 1, 0, 0],
            quote_packet("1594", 150000, 42_000),
        ],
        close_after: false,
    }])
    .await;

    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(PipelineMetrics::new());
    let ingest = Ingestor::new(
        test_config(&server.url),
        static_auth(),
        Arc::new(TungsteniteTransport),
        store.clone(),
        metrics.clone(),
    )
    .with_client("A123", "api-key");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(ingest.run(shutdown_rx));

    wait_for_ticks(&store, 2).await;

    let reliance = store.query_last("2885").await.unwrap();
    assert_eq!(reliance.last_price, dec!(2500.00));
    assert_eq!(reliance.exchange_timestamp.timestamp_millis(), 1_700_000_000_001);

    let infy = store.query_last("1594").await.unwrap();
    assert_eq!(infy.last_price, dec!(1500.00));
    assert_eq!(infy.volume, 42_000);
    assert_eq!(infy.high_price, dec!(1505.00));

    let conn = server.connection(0);
    assert_eq!(conn.header("authorization"), Some("Bearer jwt-token"));
    assert_eq!(conn.header("x-client-code"), Some("A123"));
    assert_eq!(conn.header("x-api-key"), Some("api-key"));
    assert_eq!(conn.header("x-feed-token"), Some("feed-token"));

    let subscribe: serde_json::Value = serde_json::from_str(&conn.texts[0]).unwrap();
    assert_eq!(subscribe["action"], 1);
    assert_eq!(subscribe["params"]["mode"], 2);
    assert_eq!(subscribe["params"]["tokenList"][0]["tokens"][0], "2885");

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("pipeline should stop")
        .unwrap()
        .unwrap();

    let snap = metrics.snapshot();
    assert_eq!(snap.processed, 2);
    assert_eq!(snap.decode_errors, 1);
    assert_eq!(snap.errors, 0);
}

#[tokio::test]
async fn test_ticks_continue_after_reconnect() {
    let server = FeedServer::start(vec![
        ServerSession {
            packets: vec![ltp_packet("2885", 250000, 1)],
            close_after: true,
        },
        ServerSession {
            packets: vec![ltp_packet("2885", 251000, 2)],
            close_after: false,
        },
    ])
    .await;

    let store = Arc::new(MemoryStore::new());
    let ingest = Ingestor::new(
        test_config(&server.url),
        static_auth(),
        Arc::new(TungsteniteTransport),
        store.clone(),
        Arc::new(PipelineMetrics::new()),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(ingest.run(shutdown_rx));

    wait_for_ticks(&store, 2).await;
    assert_eq!(server.connection_count(), 2);
    assert!(server.connection(1).texts[0].contains("correlationID"));
    assert_eq!(store.query_last("2885").await.unwrap().last_price, dec!(2510.00));

    shutdown_tx.send(true).unwrap();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_batch_mode_flushes_to_parquet_on_shutdown() {
    let server = FeedServer::start(vec![ServerSession {
        packets: (1..=5).map(|i| ltp_packet("3045", 60000 + i, i)).collect(),
        close_after: false,
    }])
    .await;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ParquetStore::open(dir.path()).unwrap());
    let metrics = Arc::new(PipelineMetrics::new());

    let mut config = test_config(&server.url);
    config.pipeline.write_mode = WriteMode::Batch;
    config.pipeline.batch_size = 1000;
    config.pipeline.flush_interval_secs = 3600;

    let ingest = Ingestor::new(
        config,
        static_auth(),
        Arc::new(TungsteniteTransport),
        store.clone(),
        metrics.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(ingest.run(shutdown_rx));

    // nothing is written until the batch fills or the pipeline stops
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(store.files().unwrap().is_empty());

    shutdown_tx.send(true).unwrap();
    run.await.unwrap().unwrap();

    assert_eq!(store.files().unwrap().len(), 1);
    let stats = store.query_aggregates("3045").await.unwrap();
    assert_eq!(stats.tick_count, 5);
    assert_eq!(
        store.query_last("3045").await.unwrap().last_price,
        dec!(600.05)
    );
    assert_eq!(metrics.snapshot().processed, 5);
}

#[tokio::test]
async fn test_single_writes_share_parquet_files() {
    let server = FeedServer::start(vec![ServerSession {
        packets: (1..=20).map(|i| ltp_packet("11536", 350000 + i, i)).collect(),
        close_after: false,
    }])
    .await;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ParquetStore::open(dir.path()).unwrap());
    let metrics = Arc::new(PipelineMetrics::new());

    let ingest = Ingestor::new(
        test_config(&server.url),
        static_auth(),
        Arc::new(TungsteniteTransport),
        store.clone(),
        metrics.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(ingest.run(shutdown_rx));

    // every tick is acknowledged but staged in memory
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while metrics.snapshot().processed < 20 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(waited.is_ok());
    assert!(store.files().unwrap().is_empty());
    assert_eq!(store.staged().await, 20);

    shutdown_tx.send(true).unwrap();
    run.await.unwrap().unwrap();

    assert_eq!(store.files().unwrap().len(), 1);
    assert_eq!(store.staged().await, 0);
    assert_eq!(store.query_aggregates("11536").await.unwrap().tick_count, 20);
    assert_eq!(metrics.snapshot().processed, 20);
}

#[tokio::test]
async fn test_supervisor_gives_up_when_login_keeps_failing() {
    let mut config = test_config("ws://127.0.0.1:1/unused");
    config.supervisor.initial_interval_ms = 50;
    config.supervisor.max_interval_secs = 1;
    config.supervisor.max_elapsed_secs = 1;

    let ingest = Ingestor::new(
        config,
        Arc::new(RejectingAuth),
        Arc::new(TungsteniteTransport),
        Arc::new(MemoryStore::new()),
        Arc::new(PipelineMetrics::new()),
    );

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let result = tokio::time::timeout(Duration::from_secs(10), ingest.run(shutdown_rx))
        .await
        .expect("supervisor should give up");

    let SupervisorError::BudgetExhausted {
        attempts,
        last_error,
    } = result.unwrap_err();
    assert!(attempts > 1);
    assert!(last_error.contains("Invalid totp"));
}
