//! Stream client against a real WebSocket server

use crate::support::{ltp_packet, FeedServer, ServerSession};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tick_ingest::decoder::{ExchangeType, SubscriptionMode};
use tick_ingest::feed::{SubscriptionRequest, TokenList};
use tick_ingest::ws::{ConnectionState, MessageHandler, StreamClient, TungsteniteTransport, WsConfig, WsError};
use tokio::sync::watch;

#[derive(Default)]
struct Collector {
    frames: Mutex<Vec<Vec<u8>>>,
}

impl MessageHandler for Collector {
    fn on_message(&self, data: &[u8]) {
        self.frames.lock().push(data.to_vec());
    }
}

fn subscription() -> SubscriptionRequest {
    SubscriptionRequest::subscribe(
        "it",
        SubscriptionMode::Ltp,
        vec![TokenList::new(ExchangeType::NseCm, ["2885"])],
    )
}

async fn wait_for_frames(collector: &Collector, n: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while collector.frames.lock().len() < n {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("frames did not arrive");
}

#[tokio::test]
async fn test_frames_and_headers() {
    let server = FeedServer::start(vec![ServerSession {
        packets: vec![ltp_packet("2885", 250000, 1), ltp_packet("2885", 250100, 2)],
        close_after: false,
    }])
    .await;

    let collector = Arc::new(Collector::default());
    let config = WsConfig::new(&server.url).header("X-Feed-Token", "feed-1");
    let mut client = StreamClient::new(config, Arc::new(TungsteniteTransport), collector.clone());

    client.connect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    client.send_subscription(&subscription()).await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(async move { client.run(shutdown_rx).await });

    wait_for_frames(&collector, 2).await;
    assert_eq!(collector.frames.lock()[0], ltp_packet("2885", 250000, 1));

    let conn = server.connection(0);
    assert_eq!(conn.header("x-feed-token"), Some("feed-1"));
    assert!(conn.texts[0].contains(r#""correlationID":"it""#));

    shutdown_tx.send(true).unwrap();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_reconnect_resubscribes() {
    let server = FeedServer::start(vec![
        ServerSession {
            packets: vec![ltp_packet("2885", 250000, 1)],
            close_after: true,
        },
        ServerSession {
            packets: vec![ltp_packet("2885", 250500, 2)],
            close_after: false,
        },
    ])
    .await;

    let collector = Arc::new(Collector::default());
    let config = WsConfig::new(&server.url).reconnect_delay(Duration::from_millis(100));
    let mut client = StreamClient::new(config, Arc::new(TungsteniteTransport), collector.clone());
    client.connect().await.unwrap();
    client.send_subscription(&subscription()).await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(async move { client.run(shutdown_rx).await });

    wait_for_frames(&collector, 2).await;
    assert_eq!(server.connection_count(), 2);
    assert_eq!(server.connection(0).texts, server.connection(1).texts);

    shutdown_tx.send(true).unwrap();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_connect_refused() {
    let collector = Arc::new(Collector::default());
    let mut client = StreamClient::new(
        WsConfig::new("ws://127.0.0.1:1/closed"),
        Arc::new(TungsteniteTransport),
        collector,
    );

    assert!(matches!(
        client.connect().await,
        Err(WsError::ConnectionFailed(_))
    ));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}
