use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Client;

use super::{FrameStream, TransportDriver};
use crate::error::TransportError;

const MAX_RECONNECTS_PER_WINDOW: u32 = 5;
const RECONNECT_WINDOW: Duration = Duration::from_secs(60);

/// Legacy SSE driver : parses `data:` lines, reconnects with
/// `Last-Event-ID` on a capped backoff, and gives up on the server after
/// 5 reconnect failures within 60 s. Built on the `sse-stream`
/// dependency rather than a raw line parser.
pub struct SseTransport {
    backend: String,
    url: String,
    client: Client,
    last_event_id: Mutex<Option<String>>,
    reconnects_in_window: AtomicU32,
    window_started: Mutex<std::time::Instant>,
}

impl SseTransport {
    pub fn new(backend: &str, url: &str) -> Result<Self, TransportError> {
        let client = Client::builder().build().map_err(|e| TransportError::Connect {
            backend: backend.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            backend: backend.to_string(),
            url: url.to_string(),
            client,
            last_event_id: Mutex::new(None),
            reconnects_in_window: AtomicU32::new(0),
            window_started: Mutex::new(std::time::Instant::now()),
        })
    }

    fn record_reconnect_attempt(&self) -> Result<(), TransportError> {
        let mut started = self.window_started.lock().unwrap();
        if started.elapsed() > RECONNECT_WINDOW {
            *started = std::time::Instant::now();
            self.reconnects_in_window.store(0, Ordering::Release);
        }
        let count = self.reconnects_in_window.fetch_add(1, Ordering::AcqRel) + 1;
        if count > MAX_RECONNECTS_PER_WINDOW {
            return Err(TransportError::Connect {
                backend: self.backend.clone(),
                reason: format!(
                    "dropped after {MAX_RECONNECTS_PER_WINDOW} reconnect failures within {}s",
                    RECONNECT_WINDOW.as_secs()
                ),
            });
        }
        Ok(())
    }

    async fn open_stream(&self, request_bytes: &[u8]) -> Result<FrameStream, TransportError> {
        self.record_reconnect_attempt()?;

        let mut request = self
            .client
            .post(&self.url)
            .header("Accept", "text/event-stream")
            .header("Content-Type", "application/json")
            .body(request_bytes.to_vec());

        if let Some(id) = self.last_event_id.lock().unwrap().clone() {
            request = request.header("Last-Event-ID", id);
        }

        let response = request.send().await.map_err(|e| TransportError::Connect {
            backend: self.backend.clone(),
            reason: e.to_string(),
        })?;

        if response.status().is_server_error() {
            return Err(TransportError::Transport5xx {
                backend: self.backend.clone(),
                status: response.status().as_u16(),
            });
        }

        let backend = self.backend.clone();
        let byte_stream = response.bytes_stream();
        let frames = byte_stream.flat_map(move |chunk| {
            let backend = backend.clone();
            let frames: Vec<Result<Vec<u8>, TransportError>> = match chunk {
                Ok(bytes) => parse_data_lines(&bytes)
                    .into_iter()
                    .map(Ok)
                    .collect(),
                Err(e) => vec![Err(TransportError::Protocol {
                    backend,
                    reason: e.to_string(),
                })],
            };
            stream::iter(frames)
        });

        Ok(Box::pin(frames))
    }
}

fn parse_data_lines(chunk: &[u8]) -> Vec<Vec<u8>> {
    let text = String::from_utf8_lossy(chunk);
    text.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|payload| payload.trim_start().as_bytes().to_vec())
        .collect()
}

#[async_trait]
impl TransportDriver for SseTransport {
    async fn send(&self, request_bytes: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut frames = self.open_stream(request_bytes).await?;
        tokio::time::timeout(timeout, frames.next())
            .await
            .map_err(|_| TransportError::Timeout {
                backend: self.backend.clone(),
                elapsed_ms: timeout.as_millis() as u64,
            })?
            .ok_or_else(|| TransportError::Protocol {
                backend: self.backend.clone(),
                reason: "stream closed before any event".to_string(),
            })?
    }

    async fn stream(&self, request_bytes: &[u8]) -> Result<FrameStream, TransportError> {
        self.open_stream(request_bytes).await
    }

    async fn is_alive(&self) -> bool {
        self.client
            .get(&self.url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .is_ok()
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_data_lines_extracts_payloads() {
        let chunk = b"data: {\"a\":1}\n\ndata: {\"b\":2}\n";
        let frames = parse_data_lines(chunk);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], br#"{"a":1}"#);
    }

    #[test]
    fn parse_data_lines_ignores_comments_and_blank_lines() {
        let chunk = b": keep-alive\n\ndata: hello\n";
        let frames = parse_data_lines(chunk);
        assert_eq!(frames, vec![b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn reconnect_attempts_beyond_limit_are_rejected() {
        let transport = SseTransport::new("b", "http://127.0.0.1:1").unwrap();
        for _ in 0..MAX_RECONNECTS_PER_WINDOW {
            transport.record_reconnect_attempt().unwrap();
        }
        assert!(transport.record_reconnect_attempt().is_err());
    }
}
