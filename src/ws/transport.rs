//! Transport seam between the stream client and the network

use super::types::{Frame, WsError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Opens connections
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<Box<dyn Connection>, WsError>;
}

/// One open duplex connection
#[async_trait]
pub trait Connection: Send {
    async fn send_text(&mut self, text: String) -> Result<(), WsError>;

    async fn send_json(&mut self, value: &serde_json::Value) -> Result<(), WsError> {
        let text = serde_json::to_string(value)?;
        self.send_text(text).await
    }

    /// Next data or close frame; control frames are handled internally
    async fn recv(&mut self) -> Result<Frame, WsError>;

    async fn close(&mut self) -> Result<(), WsError>;
}

/// Production transport over `tokio-tungstenite`
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteTransport;

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn dial(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<Box<dyn Connection>, WsError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| WsError::ConnectionFailed(e.to_string()))?;

        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| WsError::InvalidHeader(name.clone()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| WsError::InvalidHeader(name.as_str().to_string()))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| WsError::ConnectionFailed(e.to_string()))?;

        Ok(Box::new(TungsteniteConnection { stream }))
    }
}

struct TungsteniteConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for TungsteniteConnection {
    async fn send_text(&mut self, text: String) -> Result<(), WsError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| WsError::SendFailed(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Frame, WsError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Frame::Binary(data)),
                Some(Ok(Message::Text(text))) => return Ok(Frame::Text(text)),
                Some(Ok(Message::Close(_))) => return Ok(Frame::Close),
                // pings are answered by tungstenite on the next flush
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Err(e)) => return Err(WsError::ReceiveFailed(e.to_string())),
                None => return Err(WsError::ReceiveFailed("Stream ended unexpectedly".into())),
            }
        }
    }

    async fn close(&mut self) -> Result<(), WsError> {
        self.stream
            .close(None)
            .await
            .map_err(|e| WsError::SendFailed(e.to_string()))
    }
}
