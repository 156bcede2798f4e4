use thiserror::Error;

/// Top-level engine error. Every component-specific error type below
/// converts into this one at the protocol handler boundary, where it is
/// mapped to a JSON-RPC error object.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Breaker(#[from] BreakerError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("{0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors raised by transport drivers (C1).
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("failed to connect to backend '{backend}': {reason}")]
    Connect { backend: String, reason: String },

    #[error("request to backend '{backend}' timed out after {elapsed_ms}ms")]
    Timeout { backend: String, elapsed_ms: u64 },

    #[error("malformed JSON-RPC from backend '{backend}': {reason}")]
    Protocol { backend: String, reason: String },

    #[error("backend '{backend}' reported server error: {status}")]
    Transport5xx { backend: String, status: u16 },

    #[error("authentication failed for backend '{backend}'")]
    Auth { backend: String },

    #[error("command '{command}' for backend '{backend}' is not in the stdio allowlist")]
    ConfigViolation { backend: String, command: String },
}

/// Errors raised by the pool manager (C2).
#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("pool for backend '{backend}' exhausted after waiting {waited_ms}ms")]
    Exhausted { backend: String, waited_ms: u64 },

    #[error("pool for backend '{backend}' is draining, no new acquisitions accepted")]
    Draining { backend: String },

    #[error("acquire for backend '{backend}' canceled")]
    Canceled { backend: String },
}

/// Errors raised by the server registry (C4).
#[derive(Error, Debug, Clone)]
pub enum RegistryError {
    #[error("backend '{backend}' failed its install-time health gate: {reason}")]
    HealthGateFailed { backend: String, reason: String },

    #[error("descriptor for backend '{backend}' is invalid: {reason}")]
    InvalidDescriptor { backend: String, reason: String },

    #[error("backend '{0}' not present in the current registry generation")]
    UnknownBackend(String),
}

/// Errors raised by the router / load balancer (C5).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("no backend available to serve this request")]
    NoBackendAvailable,
}

/// Errors raised by the circuit breaker (part of C3).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BreakerError {
    #[error("circuit open for backend '{0}'")]
    Open(String),
}

/// Errors raised by the response cache (C7).
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("cache entry too large for layer '{layer}' ({size_bytes} bytes)")]
    EntryTooLarge { layer: &'static str, size_bytes: usize },
}

/// Errors raised by the protocol handler (C10) itself, as opposed to
/// errors bubbled up from a lower component.
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("invalid JSON-RPC envelope: {0}")]
    ParseError(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("schema fetch failed for tool '{0}'")]
    SchemaFetchFailed(String),

    #[error("request deadline exceeded")]
    Canceled,

    #[error("authorization denied: {0}")]
    Denied(String),
}

/// Standard JSON-RPC error object returned to the client.
#[derive(Debug, Clone, serde::Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Maps an [`EngineError`] to the JSON-RPC error code table in
impl From<&EngineError> for JsonRpcError {
    fn from(err: &EngineError) -> Self {
        match err {
            EngineError::Protocol(ProtocolError::ParseError(msg)) => {
                JsonRpcError::new(-32700, format!("parse error: {msg}"))
            }
            EngineError::Protocol(ProtocolError::InvalidRequest(msg)) => {
                JsonRpcError::new(-32600, format!("invalid request: {msg}"))
            }
            EngineError::Protocol(ProtocolError::MethodNotFound(method)) => {
                JsonRpcError::new(-32601, format!("method not found: {method}"))
            }
            EngineError::Protocol(ProtocolError::InvalidParams(msg)) => {
                JsonRpcError::new(-32602, format!("invalid params: {msg}"))
            }
            EngineError::Protocol(ProtocolError::SchemaFetchFailed(tool)) => {
                JsonRpcError::new(-32602, format!("schema fetch failed for '{tool}'"))
            }
            EngineError::Protocol(ProtocolError::Canceled) => {
                JsonRpcError::new(-32006, "request canceled")
            }
            EngineError::Protocol(ProtocolError::Denied(reason)) => {
                JsonRpcError::new(-32004, format!("denied: {reason}"))
            }
            EngineError::Router(RouterError::NoBackendAvailable) => {
                JsonRpcError::new(-32001, "no backend available")
            }
            EngineError::Breaker(BreakerError::Open(backend)) => {
                JsonRpcError::new(-32002, format!("circuit open for backend '{backend}'"))
            }
            EngineError::Transport(TransportError::Timeout { backend, .. }) => {
                JsonRpcError::new(-32003, format!("timeout calling backend '{backend}'"))
            }
            EngineError::Transport(t) => JsonRpcError::new(-32004, t.to_string()),
            EngineError::Pool(PoolError::Exhausted { backend, waited_ms }) => JsonRpcError::new(
                -32005,
                format!("pool exhausted for backend '{backend}' after {waited_ms}ms"),
            ),
            EngineError::Pool(p) => JsonRpcError::new(-32005, p.to_string()),
            EngineError::Registry(r) => JsonRpcError::new(-32001, r.to_string()),
            EngineError::Cache(c) => JsonRpcError::new(-32603, c.to_string()),
            EngineError::Other(e) => JsonRpcError::new(-32603, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_no_backend_available() {
        let err = EngineError::Router(RouterError::NoBackendAvailable);
        let rpc: JsonRpcError = (&err).into();
        assert_eq!(rpc.code, -32001);
    }

    #[test]
    fn maps_circuit_open() {
        let err = EngineError::Breaker(BreakerError::Open("exa".into()));
        let rpc: JsonRpcError = (&err).into();
        assert_eq!(rpc.code, -32002);
        assert!(rpc.message.contains("exa"));
    }

    #[test]
    fn maps_timeout() {
        let err = EngineError::Transport(TransportError::Timeout {
            backend: "exa".into(),
            elapsed_ms: 5000,
        });
        let rpc: JsonRpcError = (&err).into();
        assert_eq!(rpc.code, -32003);
    }

    #[test]
    fn maps_invalid_params() {
        let err = EngineError::Protocol(ProtocolError::InvalidParams("bad arg".into()));
        let rpc: JsonRpcError = (&err).into();
        assert_eq!(rpc.code, -32602);
    }

    #[test]
    fn maps_method_not_found() {
        let err = EngineError::Protocol(ProtocolError::MethodNotFound("foo/bar".into()));
        let rpc: JsonRpcError = (&err).into();
        assert_eq!(rpc.code, -32601);
    }

    #[test]
    fn maps_pool_exhausted() {
        let err = EngineError::Pool(PoolError::Exhausted {
            backend: "exa".into(),
            waited_ms: 30_000,
        });
        let rpc: JsonRpcError = (&err).into();
        assert_eq!(rpc.code, -32005);
    }
}
