//! Local feed server and helpers shared by the integration tests

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tick_ingest::auth::{Session, StaticAuthenticator};
use tick_ingest::config::{Config, StorageBackend};
use tick_ingest::decoder::{encode, DecodedTick, ExchangeType, QuoteFields, SubscriptionMode};
use tick_ingest::storage::MemoryStore;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

/// What the server does on one accepted connection
#[derive(Debug, Clone, Default)]
pub struct ServerSession {
    /// Binary frames sent once the subscription arrives
    pub packets: Vec<Vec<u8>>,
    /// Send a close frame after the packets
    pub close_after: bool,
}

/// What the server saw on one connection
#[derive(Debug, Clone, Default)]
pub struct ConnectionLog {
    pub headers: Vec<(String, String)>,
    pub texts: Vec<String>,
}

impl ConnectionLog {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// WebSocket feed on a random local port
pub struct FeedServer {
    pub url: String,
    pub connections: Arc<Mutex<Vec<ConnectionLog>>>,
}

impl FeedServer {
    /// Connection `n` follows `script[n]`; later connections just stay open
    pub async fn start(script: Vec<ServerSession>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/smart-stream", listener.local_addr().unwrap());
        let connections = Arc::new(Mutex::new(Vec::new()));

        let logs = connections.clone();
        tokio::spawn(async move {
            let mut index = 0;
            while let Ok((stream, _)) = listener.accept().await {
                let session = script.get(index).cloned().unwrap_or_default();
                let logs = logs.clone();
                index += 1;
                tokio::spawn(async move {
                    serve(stream, session, logs).await;
                });
            }
        });

        Self { url, connections }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn connection(&self, n: usize) -> ConnectionLog {
        self.connections.lock()[n].clone()
    }
}

async fn serve(
    stream: tokio::net::TcpStream,
    session: ServerSession,
    logs: Arc<Mutex<Vec<ConnectionLog>>>,
) {
    let mut headers = Vec::new();
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        headers = req
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        Ok(resp)
    };
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };

    let slot = {
        let mut logs = logs.lock();
        logs.push(ConnectionLog {
            headers,
            texts: Vec::new(),
        });
        logs.len() - 1
    };
    let record = |text: String| logs.lock()[slot].texts.push(text);

    let (mut sink, mut stream) = ws.split();
    let mut subscribed = false;

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) if text == "ping" => {
                record(text);
                if sink.send(Message::Text("pong".into())).await.is_err() {
                    return;
                }
            }
            Message::Text(text) => {
                record(text);
                if subscribed {
                    continue;
                }
                subscribed = true;

                for packet in &session.packets {
                    if sink.send(Message::Binary(packet.clone())).await.is_err() {
                        return;
                    }
                }
                if session.close_after {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
            }
            Message::Close(_) => return,
            _ => {}
        }
    }
}

pub fn ltp_packet(token: &str, price: i64, sequence: i64) -> Vec<u8> {
    encode(&DecodedTick {
        subscription_mode: SubscriptionMode::Ltp,
        exchange_type: ExchangeType::NseCm,
        token: token.to_string(),
        sequence_number: sequence,
        exchange_timestamp: 1_700_000_000_000 + sequence,
        last_traded_price: price,
        quote: QuoteFields::default(),
    })
}

pub fn quote_packet(token: &str, price: i64, volume: i64) -> Vec<u8> {
    encode(&DecodedTick {
        subscription_mode: SubscriptionMode::Quote,
        exchange_type: ExchangeType::NseCm,
        token: token.to_string(),
        sequence_number: 1,
        exchange_timestamp: 1_700_000_000_000,
        last_traded_price: price,
        quote: QuoteFields {
            volume_traded_for_day: volume,
            open_price: price - 100,
            high_price: price + 500,
            low_price: price - 500,
            close_price: price - 200,
            ..QuoteFields::default()
        },
    })
}

pub fn static_auth() -> Arc<StaticAuthenticator> {
    Arc::new(StaticAuthenticator(Session {
        jwt_token: "jwt-token".into(),
        feed_token: "feed-token".into(),
    }))
}

/// In-memory, fast-reconnecting config pointed at `url`
pub fn test_config(url: &str) -> Config {
    let mut config = Config::default();
    config.feed.url = url.to_string();
    config.feed.reconnect_delay_secs = 1;
    config.storage.backend = StorageBackend::Memory;
    config.pipeline.num_workers = 2;
    config.pipeline.verify_interval_secs = 0;
    config.telemetry.metrics_port = 0;
    config
}

/// Poll until the store holds `n` ticks
pub async fn wait_for_ticks(store: &MemoryStore, n: usize) {
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while store.len().await < n {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "expected {} ticks, have {}", n, store.len().await);
}
