//! Stream client with heartbeat, reconnection and resubscription

use super::transport::{Connection, Transport};
use super::types::{ConnectionState, Frame, WsConfig, WsError, HEARTBEAT_REPLY, HEARTBEAT_TEXT};
use super::MessageHandler;
use crate::feed::SubscriptionRequest;
use crate::telemetry::PipelineMetrics;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};

/// How a connected session ended
enum SessionEnd {
    Shutdown,
    Lost(WsError),
}

/// Persistent feed connection
///
/// Binary frames are handed synchronously to the registered
/// [`MessageHandler`]. Every subscription sent through
/// [`StreamClient::send_subscription`] is replayed after a reconnect.
pub struct StreamClient {
    config: WsConfig,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn MessageHandler>,
    metrics: Option<Arc<PipelineMetrics>>,
    connection: Option<Box<dyn Connection>>,
    subscriptions: Vec<String>,
    state_tx: watch::Sender<ConnectionState>,
}

impl StreamClient {
    pub fn new(
        config: WsConfig,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            transport,
            handler,
            metrics: None,
            connection: None,
            subscriptions: Vec::new(),
            state_tx,
        }
    }

    /// Export connection state changes through the pipeline metrics
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Get the configured URL
    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Open the connection
    pub async fn connect(&mut self) -> Result<(), WsError> {
        self.set_state(ConnectionState::Connecting);
        match self.dial().await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Send a subscription and remember it for reconnects
    pub async fn send_subscription(&mut self, request: &SubscriptionRequest) -> Result<(), WsError> {
        let text = request.to_json()?;
        let conn = self.connection.as_mut().ok_or(WsError::NotConnected)?;
        conn.send_text(text.clone()).await?;

        tracing::info!(
            correlation_id = %request.correlation_id,
            tokens = request.tokens().count(),
            mode = ?request.params.mode,
            "Subscription sent"
        );
        self.subscriptions.push(text);
        Ok(())
    }

    /// Drop the connection; safe to call repeatedly
    pub async fn close(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            if let Err(e) = conn.close().await {
                tracing::debug!(error = %e, "Error closing WebSocket");
            }
            tracing::info!("WebSocket closed");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Read, heartbeat and reconnect until `shutdown` flips to true
    ///
    /// Returns `MaxReconnectsExceeded` if the reconnect limit is hit.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), WsError> {
        loop {
            if *shutdown.borrow() {
                self.close().await;
                return Ok(());
            }

            let end = match self.connection.as_mut() {
                Some(conn) => {
                    Self::session(&self.config, conn.as_mut(), &*self.handler, &mut shutdown).await
                }
                None => SessionEnd::Lost(WsError::NotConnected),
            };

            match end {
                SessionEnd::Shutdown => {
                    self.close().await;
                    return Ok(());
                }
                SessionEnd::Lost(e) => {
                    tracing::warn!(error = %e, "WebSocket connection lost, reconnecting...");
                    self.connection = None;
                    self.set_state(ConnectionState::Reconnecting);

                    if !self.reconnect(&mut shutdown).await? {
                        self.close().await;
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One connected session: reads frames and sends heartbeats
    async fn session(
        config: &WsConfig,
        conn: &mut dyn Connection,
        handler: &dyn MessageHandler,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let mut heartbeat = interval_at(
            Instant::now() + config.heartbeat_interval,
            config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return SessionEnd::Shutdown;
                    }
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = conn.send_text(HEARTBEAT_TEXT.to_string()).await {
                        return SessionEnd::Lost(e);
                    }
                    tracing::trace!("Heartbeat sent");
                }

                frame = conn.recv() => {
                    match frame {
                        Ok(Frame::Binary(data)) => handler.on_message(&data),
                        Ok(Frame::Text(text)) if text == HEARTBEAT_REPLY => {
                            tracing::trace!("Heartbeat acknowledged");
                        }
                        Ok(Frame::Text(text)) => {
                            tracing::debug!(text = %text, "Text frame from feed");
                        }
                        Ok(Frame::Close) => {
                            tracing::info!("Received close frame");
                            return SessionEnd::Lost(WsError::Closed);
                        }
                        Err(e) => return SessionEnd::Lost(e),
                    }
                }
            }
        }
    }

    /// Retry on a fixed delay until connected and resubscribed
    ///
    /// Returns `Ok(false)` if shutdown was requested while waiting.
    async fn reconnect(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<bool, WsError> {
        let mut attempts = 0u32;

        loop {
            if self.config.max_reconnect_attempts > 0 && attempts >= self.config.max_reconnect_attempts {
                tracing::error!(attempts, "Max reconnection attempts reached");
                self.set_state(ConnectionState::Disconnected);
                return Err(WsError::MaxReconnectsExceeded { attempts });
            }

            tokio::select! {
                _ = sleep(self.config.reconnect_delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(false);
                    }
                }
            }

            attempts += 1;
            tracing::info!(attempt = attempts, url = %self.config.url, "Reconnecting");

            if let Err(e) = self.dial().await {
                tracing::warn!(error = %e, attempt = attempts, "Reconnect failed");
                continue;
            }

            match self.resubscribe().await {
                Ok(()) => {
                    self.set_state(ConnectionState::Connected);
                    tracing::info!(attempt = attempts, "Reconnected");
                    return Ok(true);
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt = attempts, "Resubscribe failed");
                    self.connection = None;
                }
            }
        }
    }

    async fn dial(&mut self) -> Result<(), WsError> {
        tracing::info!(url = %self.config.url, "Connecting to WebSocket");
        let conn = self
            .transport
            .dial(&self.config.url, &self.config.headers)
            .await?;
        self.connection = Some(conn);
        tracing::info!("WebSocket connected");
        Ok(())
    }

    async fn resubscribe(&mut self) -> Result<(), WsError> {
        let conn = self.connection.as_mut().ok_or(WsError::NotConnected)?;
        for text in &self.subscriptions {
            conn.send_text(text.clone()).await?;
        }
        if !self.subscriptions.is_empty() {
            tracing::info!(count = self.subscriptions.len(), "Subscriptions restored");
        }
        Ok(())
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Connection state changed");
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_connection_state(state);
        }
    }
}
