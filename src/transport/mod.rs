pub mod http;
pub mod sse;
pub mod stdio;
pub mod websocket;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

use crate::error::TransportError;

/// A single JSON-RPC response frame yielded by a streaming call.
pub type Frame = Vec<u8>;
pub type FrameStream = BoxStream<'static, Result<Frame, TransportError>>;

/// Transport driver trait : one JSON-RPC request/response
/// exchange, or a streaming exchange that yields frames incrementally.
/// Implemented once per transport kind; a [`crate::pool`] entry wraps a
/// concrete driver instance bound to one backend connection/process.
#[async_trait]
pub trait TransportDriver: Send + Sync {
    /// Send `request_bytes` and wait for the single-shot response,
    /// failing with [`TransportError::Timeout`] if `timeout` elapses.
    async fn send(&self, request_bytes: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Send `request_bytes` and yield response frames as they arrive.
    /// Used for SSE/chunked/WebSocket streaming responses; the handler
    /// proxies frames without buffering the full payload.
    async fn stream(&self, request_bytes: &[u8]) -> Result<FrameStream, TransportError>;

    /// Best-effort liveness probe independent of a real JSON-RPC call,
    /// used by the pool's cheap re-probe on `release` and by C3's
    /// active health checker when no `health/check` method is declared.
    async fn is_alive(&self) -> bool;

    /// Close the underlying connection/process. Idempotent.
    async fn close(&self);
}
