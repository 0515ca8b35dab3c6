use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, stream::SplitSink};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("write: {0}")]
    Write(String),
}

/// Write half of a registered tunnel connection.
///
/// Each call writes one whole message; implementations serialize concurrent writers.
#[async_trait]
pub trait TunnelSink: Send + Sync {
    async fn send_text(&self, text: String) -> Result<(), TransportError>;
    async fn close(&self);
}

/// [`TunnelSink`] over the write half of an axum WebSocket.
pub struct WsSink {
    inner: Mutex<Option<SplitSink<WebSocket, Message>>>,
}

impl WsSink {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            inner: Mutex::new(Some(sink)),
        }
    }
}

#[async_trait]
impl TunnelSink for WsSink {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        let mut guard = self.inner.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::Closed)?;
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|err| TransportError::Write(err.to_string()))
    }

    async fn close(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(mut sink) = guard.take() {
            let _ = sink.close().await;
        }
    }
}
