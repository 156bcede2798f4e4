use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use rand::Rng;
use reqwest::Client;

use super::{FrameStream, TransportDriver};
use crate::config::RetryConfig;
use crate::error::TransportError;

const BUILTIN_IDEMPOTENT_METHODS: &[&str] = &["tools/list", "resources/list", "prompts/list", "ping"];

/// HTTP / streamable-HTTP driver : POSTs the JSON-RPC
/// envelope, retrying idempotent methods with capped exponential
/// backoff and jitter. Non-idempotent methods (`tools/call` unless the
/// backend declares it read-only) are never retried at this layer.
pub struct HttpTransport {
    backend: String,
    url: String,
    client: Client,
    headers: reqwest::header::HeaderMap,
    retry: RetryConfig,
    idempotent_methods: HashSet<String>,
}

impl HttpTransport {
    pub fn new(
        backend: &str,
        url: &str,
        headers: &std::collections::HashMap<String, String>,
        retry: RetryConfig,
        extra_idempotent_methods: &[String],
    ) -> Result<Self, TransportError> {
        let mut header_map = reqwest::header::HeaderMap::new();
        for (k, v) in headers {
            let name = reqwest::header::HeaderName::from_bytes(k.as_bytes()).map_err(|e| {
                TransportError::Connect {
                    backend: backend.to_string(),
                    reason: format!("invalid header name '{k}': {e}"),
                }
            })?;
            let value = reqwest::header::HeaderValue::from_str(v).map_err(|e| TransportError::Connect {
                backend: backend.to_string(),
                reason: format!("invalid header value for '{k}': {e}"),
            })?;
            header_map.insert(name, value);
        }

        let client = Client::builder()
            .build()
            .map_err(|e| TransportError::Connect {
                backend: backend.to_string(),
                reason: e.to_string(),
            })?;

        let mut idempotent_methods: HashSet<String> =
            BUILTIN_IDEMPOTENT_METHODS.iter().map(|s| s.to_string()).collect();
        idempotent_methods.extend(extra_idempotent_methods.iter().cloned());

        Ok(Self {
            backend: backend.to_string(),
            url: url.to_string(),
            client,
            headers: header_map,
            retry,
            idempotent_methods,
        })
    }

    fn is_idempotent(&self, request_bytes: &[u8]) -> bool {
        method_of(request_bytes)
            .map(|m| self.idempotent_methods.contains(&m))
            .unwrap_or(false)
    }

    async fn post_once(&self, request_bytes: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let response = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .body(request_bytes.to_vec())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout {
                        backend: self.backend.clone(),
                        elapsed_ms: timeout.as_millis() as u64,
                    }
                } else {
                    TransportError::Connect {
                        backend: self.backend.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(TransportError::Transport5xx {
                backend: self.backend.clone(),
                status: status.as_u16(),
            });
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(TransportError::Auth {
                backend: self.backend.clone(),
            });
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| TransportError::Protocol {
                backend: self.backend.clone(),
                reason: e.to_string(),
            })
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.retry.initial_delay.as_millis() as f64;
        let cap = self.retry.max_delay.as_millis() as f64;
        let exp = base * 2f64.powi(attempt as i32);
        let capped = exp.min(cap);
        let jitter = rand::rng().random_range(-self.retry.jitter_pct..=self.retry.jitter_pct);
        let jittered = (capped * (1.0 + jitter)).max(0.0);
        Duration::from_millis(jittered as u64)
    }
}

fn method_of(request_bytes: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(request_bytes).ok()?;
    value.get("method")?.as_str().map(str::to_string)
}

#[async_trait]
impl TransportDriver for HttpTransport {
    async fn send(&self, request_bytes: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !self.is_idempotent(request_bytes) {
            return self.post_once(request_bytes, timeout).await;
        }

        let mut attempt = 0;
        loop {
            match self.post_once(request_bytes, timeout).await {
                Ok(response) => return Ok(response),
                Err(err) if attempt >= self.retry.max_retries => return Err(err),
                Err(TransportError::Transport5xx { .. }) | Err(TransportError::Timeout { .. }) => {
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn stream(&self, request_bytes: &[u8]) -> Result<FrameStream, TransportError> {
        let body = self.send(request_bytes, Duration::from_secs(30)).await;
        Ok(stream::iter(vec![body]).boxed())
    }

    async fn is_alive(&self) -> bool {
        self.client
            .get(&self.url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map(|r| r.status().is_success() || r.status().as_u16() == 404)
            .unwrap_or(false)
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_of_parses_json_rpc_method() {
        let body = br#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#;
        assert_eq!(method_of(body), Some("tools/list".to_string()));
    }

    #[test]
    fn method_of_returns_none_for_malformed_body() {
        assert_eq!(method_of(b"not json"), None);
    }

    #[test]
    fn backoff_delay_never_exceeds_configured_cap_with_jitter() {
        let transport = HttpTransport::new(
            "b",
            "http://127.0.0.1:1",
            &std::collections::HashMap::new(),
            RetryConfig {
                max_retries: 3,
                initial_delay: Duration::from_millis(50),
                max_delay: Duration::from_millis(200),
                jitter_pct: 0.2,
            },
            &[],
        )
        .unwrap();
        for attempt in 0..10 {
            let delay = transport.backoff_delay(attempt);
            assert!(delay.as_millis() <= 240); // cap * (1 + jitter_pct)
        }
    }

    #[test]
    fn is_idempotent_recognizes_builtin_and_declared_methods() {
        let transport = HttpTransport::new(
            "b",
            "http://127.0.0.1:1",
            &std::collections::HashMap::new(),
            RetryConfig::default(),
            &["custom/read".to_string()],
        )
        .unwrap();
        assert!(transport.is_idempotent(br#"{"method":"tools/list"}"#));
        assert!(transport.is_idempotent(br#"{"method":"custom/read"}"#));
        assert!(!transport.is_idempotent(br#"{"method":"tools/call"}"#));
    }
}
