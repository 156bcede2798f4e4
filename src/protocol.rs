//! Protocol handler (C10)
//!
//! Transport-agnostic: accepts one parsed JSON-RPC request at a time
//! and returns one JSON-RPC response. An outer layer (stdio loop, HTTP
//! handler, whatever exposes the engine to a client) owns framing and
//! is out of scope here.
//!
//! Request path for a routed call: cache (C7) -> batcher (C8) -> router
//! (C5) -> health/breaker gate (C3) -> pool (C2) -> transport (C1),
//! matching the fixed lock-acquisition order requires to avoid
//! deadlock.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::batcher::{BatchExecutor, Batcher};
use crate::cache::{CacheKey, CacheLayer, ResponseCache};
use crate::compressor::Compressor;
use crate::error::{BreakerError, EngineError, JsonRpcError, PoolError, ProtocolError};
use crate::external::{AllowAllAuthorizer, AuditEvent, AuditSink, AuthDecision, Authorizer, MetricsSink, NullAuditSink, NullMetricsSink};
use crate::health::HealthManager;
use crate::pool::PoolManager;
use crate::registry::Registry;
use crate::router;
use crate::tools::{SchemaFetcher, ToolRegistry, ToolSchema, ToolStub};
use crate::tracker::CallTracker;
use crate::transport::TransportDriver;

const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);
const DEFAULT_FANOUT_CONCURRENCY: usize = 16;

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    fn ok(id: Option<Value>, result: Value) -> Self {
        Self { jsonrpc: "2.0", id, result: Some(result), error: None }
    }
    fn err(id: Option<Value>, error: JsonRpcError) -> Self {
        Self { jsonrpc: "2.0", id, result: None, error: Some(error) }
    }
}

/// Ties together the eight components behind the protocol handler.
/// Built once at startup and shared via `Arc` across every connection.
pub struct Engine {
    pub registry: Arc<Registry>,
    pub health: Arc<HealthManager>,
    pub pools: Arc<PoolManager>,
    pub cache: Arc<ResponseCache>,
    pub batcher: Arc<Batcher>,
    pub compressor: Arc<Compressor>,
    pub tools: Arc<ToolRegistry>,
    pub tracker: Arc<CallTracker>,
    pub authorizer: Arc<dyn Authorizer>,
    pub metrics: Arc<dyn MetricsSink>,
    pub audit: Arc<dyn AuditSink>,
    global_inflight: Semaphore,
}

impl Engine {
    pub fn new(
        registry: Arc<Registry>,
        health: Arc<HealthManager>,
        pools: Arc<PoolManager>,
        cache: Arc<ResponseCache>,
        batcher: Arc<Batcher>,
        compressor: Arc<Compressor>,
        tools: Arc<ToolRegistry>,
        tracker: Arc<CallTracker>,
        global_concurrency: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            health,
            pools,
            cache,
            batcher,
            compressor,
            tools,
            tracker,
            authorizer: Arc::new(AllowAllAuthorizer),
            metrics: Arc::new(NullMetricsSink),
            audit: Arc::new(NullAuditSink),
            global_inflight: Semaphore::new(global_concurrency),
        })
    }

    /// Handle one parsed request end to end. Returns `None` for
    /// notifications (no `id`), per JSON-RPC 2.0.
    pub async fn handle(self: &Arc<Self>, principal: &str, req: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let is_notification = req.id.is_none();
        let start = Instant::now();

        if req.jsonrpc != "2.0" {
            let err: JsonRpcError = (&EngineError::Protocol(ProtocolError::InvalidRequest(
                "jsonrpc field must be \"2.0\"".to_string(),
            ))).into();
            return response_unless_notification(is_notification, req.id, Err(err));
        }

        let tool_name = req.params.get("name").and_then(|n| n.as_str()).map(|s| s.to_string());
        let decision = self.authorizer.authorize(principal, &req.method, tool_name.as_deref()).await;
        if decision == AuthDecision::Deny {
            self.audit.record(AuditEvent {
                principal: principal.to_string(),
                method: req.method.clone(),
                tool: tool_name.clone(),
                backend_id: None,
                decision,
            });
            let err: JsonRpcError = (&EngineError::Protocol(ProtocolError::Denied("not authorized".to_string()))).into();
            return response_unless_notification(is_notification, req.id, Err(err));
        }

        let _permit = match self.global_inflight.acquire().await {
            Ok(p) => p,
            Err(_) => {
                let err: JsonRpcError = (&EngineError::Protocol(ProtocolError::Canceled)).into();
                return response_unless_notification(is_notification, req.id, Err(err));
            }
        };

        let result = self.dispatch(&req.method, req.params.clone(), tool_name.as_deref()).await;

        self.metrics.histogram(
            crate::external::metric_names::REQUEST_DURATION_SECONDS,
            start.elapsed().as_secs_f64(),
            &[("method", req.method.as_str())],
        );
        self.metrics.counter(crate::external::metric_names::REQUESTS_TOTAL, 1, &[("method", req.method.as_str())]);
        self.audit.record(AuditEvent {
            principal: principal.to_string(),
            method: req.method.clone(),
            tool: tool_name,
            backend_id: None,
            decision,
        });

        let jsonrpc_result = result.map_err(|e| JsonRpcError::from(&e));
        response_unless_notification(is_notification, req.id, jsonrpc_result)
    }

    async fn dispatch(self: &Arc<Self>, method: &str, params: Value, tool_name: Option<&str>) -> Result<Value, EngineError> {
        match method {
            "ping" => Ok(serde_json::json!({})),
            "initialize" => Ok(self.initialize_result()),
            "tools/list" => Ok(serde_json::json!({ "tools": self.tools.list_stubs() })),
            "resources/list" | "prompts/list" => self.fanout_list(method).await,
            "tools/call" => self.routed_call(method, params, tool_name).await,
            "resources/read" | "prompts/get" => self.routed_call(method, params, None).await,
            other => Err(EngineError::Protocol(ProtocolError::MethodNotFound(other.to_string()))),
        }
    }

    fn initialize_result(&self) -> Value {
        let generation = self.registry.current();
        serde_json::json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": {}, "resources": {}, "prompts": {} },
            "serverInfo": { "name": "gatemini-core", "version": env!("CARGO_PKG_VERSION") },
            "backendCount": generation.backends.len(),
        })
    }

    /// Fan out `method` to every serviceable backend, bounded
    /// concurrency, merge by name, skip-and-log per-backend failures.
    /// The aggregate succeeds if at least one backend responded.
    /// Cached in L3.
    async fn fanout_list(self: &Arc<Self>, method: &str) -> Result<Value, EngineError> {
        let key = CacheKey::compute(None, method, &Value::Null);
        if let Some(cached) = self.cache.get(CacheLayer::L3, &key) {
            self.metrics.counter(crate::external::metric_names::CACHE_HITS_TOTAL, 1, &[("method", method)]);
            let value: Value = serde_json::from_slice(&cached).map_err(|e| EngineError::Other(e.into()))?;
            return Ok(value);
        }
        self.metrics.counter(crate::external::metric_names::CACHE_MISSES_TOTAL, 1, &[("method", method)]);

        let generation = self.registry.current();
        let backend_ids: Vec<String> = generation
            .backends
            .keys()
            .filter(|id| self.health.get(id.as_str()).map(|h| h.is_serviceable()).unwrap_or(false))
            .cloned()
            .collect();

        let fanout_sem = Arc::new(Semaphore::new(DEFAULT_FANOUT_CONCURRENCY));
        let mut handles = Vec::with_capacity(backend_ids.len());
        for backend_id in backend_ids {
            let engine = Arc::clone(self);
            let sem = Arc::clone(&fanout_sem);
            let method = method.to_string();
            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok()?;
                match engine.call_backend_raw(&backend_id, &method, &Value::Null).await {
                    Ok(value) => Some(value),
                    Err(e) => {
                        warn!(backend = %backend_id, method = %method, error = %e, "fan-out call failed, skipping backend");
                        None
                    }
                }
            }));
        }

        let mut seen = HashSet::new();
        let mut merged: Vec<Value> = Vec::new();
        let mut any_responded = false;
        let field = match method {
            "resources/list" => "resources",
            "prompts/list" => "prompts",
            _ => "items",
        };
        for handle in handles {
            if let Ok(Some(value)) = handle.await {
                any_responded = true;
                if let Some(items) = value.get(field).and_then(|v| v.as_array()) {
                    for item in items {
                        let name = item.get("name").and_then(|n| n.as_str()).unwrap_or_default().to_string();
                        if seen.insert(name) {
                            merged.push(item.clone());
                        }
                    }
                }
            }
        }

        if !any_responded && !self.registry.current().backends.is_empty() {
            return Err(EngineError::Router(crate::error::RouterError::NoBackendAvailable));
        }

        let result = serde_json::json!({ field: merged });
        if let Ok(bytes) = serde_json::to_vec(&result) {
            let _ = self.cache.put(CacheLayer::L3, key, bytes);
        }
        Ok(result)
    }

    /// Routed call: cache -> batcher -> router -> health/breaker -> pool
    /// -> transport step 4.
    async fn routed_call(self: &Arc<Self>, method: &str, params: Value, tool_name: Option<&str>) -> Result<Value, EngineError> {
        let routing_tool_name = match method {
            "tools/call" => tool_name,
            _ => None,
        };

        let idempotent = match method {
            "tools/call" => {
                let name = routing_tool_name.ok_or_else(|| {
                    EngineError::Protocol(ProtocolError::InvalidParams("tools/call requires a tool name".to_string()))
                })?;
                tool_is_idempotent(&self.tools, &self.registry.current(), name)
            }
            _ => true,
        };
        let cacheable = crate::cache::is_cacheable_method(method, idempotent);
        let layer = CacheLayer::for_method(method);
        let cache_key = CacheKey::compute(None, method, &params);

        if cacheable {
            if let Some(cached) = self.cache.get(layer, &cache_key) {
                self.metrics.counter(crate::external::metric_names::CACHE_HITS_TOTAL, 1, &[("method", method)]);
                return serde_json::from_slice(&cached).map_err(|e| EngineError::Other(e.into()));
            }
            self.metrics.counter(crate::external::metric_names::CACHE_MISSES_TOTAL, 1, &[("method", method)]);
        }

        if method == "tools/call" {
            let name = routing_tool_name.expect("checked above when computing `idempotent`");
            let engine = Arc::clone(self);
            let fetcher: Arc<dyn SchemaFetcher> = engine.clone();
            let schema = self.tools.get_or_fetch_schema(name, fetcher.as_ref()).await.map_err(EngineError::Protocol)?;
            schema.validate_args(&params).map_err(EngineError::Protocol)?;
        }

        let key = router::routing_key(method, routing_tool_name);
        let generation = self.registry.current();
        let backend_id = router::select_backend(&generation, &self.health, method, &key)?;

        if let Some(name) = routing_tool_name {
            let engine = Arc::clone(self);
            let fetcher: Arc<dyn SchemaFetcher> = engine.clone();
            let name = name.to_string();
            let tools = Arc::clone(&self.tools);
            tokio::spawn(async move {
                tools.record_call_and_predict(&name, fetcher.as_ref()).await;
            });
        }

        let value = if self.batcher.is_batchable(method) {
            let executor: Arc<dyn BatchExecutor> = Arc::clone(self);
            self.batcher.submit(&backend_id, method, params, executor).await?
        } else {
            self.call_backend_raw(&backend_id, method, &params).await?
        };

        if cacheable {
            if let Ok(bytes) = serde_json::to_vec(&value) {
                let _ = self.cache.put(layer, cache_key, bytes);
            }
        }
        Ok(value)
    }

    /// One non-batched backend call: health/breaker admit -> pool
    /// acquire -> transport send -> pool release, recording the
    /// outcome into both health and the call tracker.
    async fn call_backend_raw(self: &Arc<Self>, backend_id: &str, method: &str, params: &Value) -> Result<Value, EngineError> {
        let health = self.health.get(backend_id).ok_or_else(|| {
            EngineError::Registry(crate::error::RegistryError::UnknownBackend(backend_id.to_string()))
        })?;
        health.try_admit(backend_id).map_err(EngineError::Breaker)?;

        let pool = self.pools.get(backend_id).ok_or_else(|| {
            EngineError::Registry(crate::error::RegistryError::UnknownBackend(backend_id.to_string()))
        })?;
        let entry = pool.acquire().await.map_err(EngineError::Pool)?;

        let generation = self.registry.current();
        let timeout = generation.get(backend_id).map(|d| d.timeout).unwrap_or(DEFAULT_DEADLINE);

        let envelope = serde_json::json!({
            "jsonrpc": "2.0",
            "id": uuid::Uuid::new_v4().to_string(),
            "method": method,
            "params": params,
        });
        let request_bytes = serde_json::to_vec(&envelope).map_err(|e| EngineError::Other(e.into()))?;

        let started = Instant::now();
        let outcome = entry.driver.send(&request_bytes, timeout).await;
        let elapsed = started.elapsed();

        self.metrics.counter(
            crate::external::metric_names::BACKEND_REQUESTS_TOTAL,
            1,
            &[("backend", backend_id), ("method", method)],
        );

        match outcome {
            Ok(bytes) => {
                pool.release(entry).await;
                health.record_outcome(true, elapsed);
                self.tracker.record(method, backend_id, elapsed, true);
                let parsed: Value = serde_json::from_slice(&bytes).map_err(|e| {
                    EngineError::Protocol(ProtocolError::ParseError(format!("malformed backend response: {e}")))
                })?;
                if let Some(error) = parsed.get("error") {
                    debug!(backend = backend_id, method, %error, "backend returned a JSON-RPC error");
                    return Err(EngineError::Other(anyhow::anyhow!("backend error: {error}")));
                }
                Ok(parsed.get("result").cloned().unwrap_or(Value::Null))
            }
            Err(e) => {
                pool.discard(entry).await;
                health.record_outcome(false, elapsed);
                self.tracker.record(method, backend_id, elapsed, false);
                Err(EngineError::Transport(e))
            }
        }
    }

    /// Stream a call's response frames directly to the caller without
    /// caching step 5.
    pub async fn stream_call(
        self: &Arc<Self>,
        backend_id: &str,
        method: &str,
        params: &Value,
    ) -> Result<impl futures::Stream<Item = Result<Vec<u8>, EngineError>>, EngineError> {
        let health = self.health.get(backend_id).ok_or_else(|| {
            EngineError::Registry(crate::error::RegistryError::UnknownBackend(backend_id.to_string()))
        })?;
        health.try_admit(backend_id).map_err(EngineError::Breaker)?;
        let pool = self.pools.get(backend_id).ok_or_else(|| {
            EngineError::Registry(crate::error::RegistryError::UnknownBackend(backend_id.to_string()))
        })?;
        let entry = pool.acquire().await.map_err(EngineError::Pool)?;

        let envelope = serde_json::json!({
            "jsonrpc": "2.0",
            "id": uuid::Uuid::new_v4().to_string(),
            "method": method,
            "params": params,
        });
        let request_bytes = serde_json::to_vec(&envelope).map_err(|e| EngineError::Other(e.into()))?;
        let frames = entry.driver.stream(&request_bytes).await.map_err(EngineError::Transport)?;
        pool.release(entry).await;
        Ok(frames.map(|r| r.map_err(EngineError::Transport)))
    }
}

/// The schema fetcher the tool registry needs is just a thin wrapper
/// around `tools/schema` on the owning backend.
#[async_trait::async_trait]
impl SchemaFetcher for Engine {
    async fn fetch_schema(&self, backend_id: &str, tool_name: &str) -> Result<ToolSchema, ProtocolError> {
        // Deliberately bypasses the cache/batcher path: the tool
        // registry already caches schemas with its own TTL, and a
        // schema fetch is never a candidate for request coalescing.
        let params = serde_json::json!({ "name": tool_name });
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": uuid::Uuid::new_v4().to_string(),
            "method": "tools/schema",
            "params": params,
        });
        let bytes = serde_json::to_vec(&request).map_err(|_| ProtocolError::SchemaFetchFailed(tool_name.to_string()))?;
        let pool = self.pools.get(backend_id).ok_or_else(|| ProtocolError::SchemaFetchFailed(tool_name.to_string()))?;
        let entry = pool.acquire().await.map_err(|_| ProtocolError::SchemaFetchFailed(tool_name.to_string()))?;
        let response = entry.driver.send(&bytes, Duration::from_secs(10)).await;
        pool.release(entry).await;
        let response = response.map_err(|_| ProtocolError::SchemaFetchFailed(tool_name.to_string()))?;
        let parsed: Value = serde_json::from_slice(&response).map_err(|_| ProtocolError::SchemaFetchFailed(tool_name.to_string()))?;
        let result = parsed.get("result").cloned().unwrap_or(Value::Null);
        Ok(ToolSchema {
            name: tool_name.to_string(),
            description: result.get("description").and_then(|d| d.as_str()).unwrap_or_default().to_string(),
            json_schema: result.get("inputSchema").cloned().unwrap_or(Value::Null),
            examples: result.get("examples").and_then(|e| e.as_array()).cloned().unwrap_or_default(),
            backend_id: backend_id.to_string(),
            loaded_at: None,
        })
    }
}

/// Coalesced batch execution: fans each arg set out as an individual
/// backend call today (many backends have no native batch endpoint);
/// a backend that advertises `capabilities.batch` can be special-cased
/// here once it is modeled in the registry descriptor.
#[async_trait::async_trait]
impl BatchExecutor for Engine {
    async fn execute_batch(&self, backend_id: &str, method: &str, args: Vec<Value>) -> Vec<Result<Value, EngineError>> {
        info!(backend = backend_id, method, size = args.len(), "executing coalesced batch");
        let mut results = Vec::with_capacity(args.len());
        for arg in args {
            let health = match self.health.get(backend_id) {
                Some(h) => h,
                None => {
                    results.push(Err(EngineError::Registry(crate::error::RegistryError::UnknownBackend(backend_id.to_string()))));
                    continue;
                }
            };
            if let Err(e) = health.try_admit(backend_id) {
                results.push(Err(EngineError::Breaker(e)));
                continue;
            }
            results.push(self.call_backend_via_pool(backend_id, method, &arg).await);
        }
        results
    }
}

impl Engine {
    async fn call_backend_via_pool(&self, backend_id: &str, method: &str, params: &Value) -> Result<Value, EngineError> {
        let pool = self.pools.get(backend_id).ok_or_else(|| {
            EngineError::Registry(crate::error::RegistryError::UnknownBackend(backend_id.to_string()))
        })?;
        let entry = pool.acquire().await.map_err(EngineError::Pool)?;
        let envelope = serde_json::json!({
            "jsonrpc": "2.0",
            "id": uuid::Uuid::new_v4().to_string(),
            "method": method,
            "params": params,
        });
        let bytes = serde_json::to_vec(&envelope).map_err(|e| EngineError::Other(e.into()))?;
        let timeout = self.registry.current().get(backend_id).map(|d| d.timeout).unwrap_or(DEFAULT_DEADLINE);
        let result = entry.driver.send(&bytes, timeout).await;
        match result {
            Ok(bytes) => {
                pool.release(entry).await;
                let parsed: Value = serde_json::from_slice(&bytes).map_err(|e| {
                    EngineError::Protocol(ProtocolError::ParseError(e.to_string()))
                })?;
                Ok(parsed.get("result").cloned().unwrap_or(Value::Null))
            }
            Err(e) => {
                pool.discard(entry).await;
                Err(EngineError::Transport(e))
            }
        }
    }
}

/// Whether `tool_name`'s owning backend declares it idempotent/read-only,
/// the gate for caching a `tools/call` result per the cacheability rule
/// ("non-idempotent methods are not cached unless the backend explicitly
/// declares the tool as idempotent"). Defaults to non-idempotent when the
/// tool or its backend can't be resolved in the current generation.
fn tool_is_idempotent(tools: &ToolRegistry, generation: &crate::registry::RegistryGeneration, tool_name: &str) -> bool {
    tools
        .resolve_backend(tool_name)
        .and_then(|backend_id| generation.get(&backend_id).cloned())
        .map(|descriptor| descriptor.idempotent_methods.iter().any(|m| m == tool_name))
        .unwrap_or(false)
}

fn response_unless_notification(
    is_notification: bool,
    id: Option<Value>,
    result: Result<Value, JsonRpcError>,
) -> Option<JsonRpcResponse> {
    if is_notification {
        return None;
    }
    Some(match result {
        Ok(value) => JsonRpcResponse::ok(id, value),
        Err(error) => JsonRpcResponse::err(id, error),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_request_parses_with_no_params() {
        let raw = r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#;
        let req: JsonRpcRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.method, "ping");
        assert_eq!(req.params, Value::Null);
    }

    #[test]
    fn notification_has_no_id() {
        let raw = r#"{"jsonrpc":"2.0","method":"ping"}"#;
        let req: JsonRpcRequest = serde_json::from_str(raw).unwrap();
        assert!(req.id.is_none());
    }

    #[test]
    fn ok_response_has_no_error_field() {
        let resp = JsonRpcResponse::ok(Some(serde_json::json!(1)), serde_json::json!({"ok": true}));
        let value = serde_json::to_value(&resp).unwrap();
        assert!(value.get("error").is_none());
        assert!(value.get("result").is_some());
    }

    #[test]
    fn err_response_has_no_result_field() {
        let resp = JsonRpcResponse::err(Some(serde_json::json!(1)), JsonRpcError::new(-32601, "nope"));
        let value = serde_json::to_value(&resp).unwrap();
        assert!(value.get("result").is_none());
        assert!(value.get("error").is_some());
    }

    fn generation_with_backend(idempotent_methods: Vec<String>) -> crate::registry::RegistryGeneration {
        use crate::registry::{BackendDescriptor, Endpoint};
        use crate::registry::hashring::HashRing;

        let descriptor = BackendDescriptor {
            id: "b".to_string(),
            name: "b".to_string(),
            transport: crate::config::Transport::Stdio,
            endpoint: Endpoint::Command {
                command: "echo".to_string(),
                args: vec![],
                env: std::collections::HashMap::new(),
                cwd: None,
            },
            timeout: Duration::from_secs(30),
            tool_name_patterns: vec![],
            priority: 0,
            idempotent_methods,
            batchable_methods: vec![],
        };
        let mut ring = HashRing::new(160);
        ring.add_backend("b");
        let mut backends = std::collections::HashMap::new();
        backends.insert("b".to_string(), Arc::new(descriptor));
        crate::registry::RegistryGeneration {
            version: 1,
            backends,
            ring,
            installed_at: Instant::now(),
        }
    }

    #[test]
    fn tool_declared_idempotent_is_cacheable() {
        let tools = crate::tools::ToolRegistry::new(vec![]);
        tools.register_backend_tools("b", vec![crate::tools::ToolStub::new("fs.read", "d", "b")]);
        let generation = generation_with_backend(vec!["fs.read".to_string()]);
        assert!(tool_is_idempotent(&tools, &generation, "fs.read"));
    }

    #[test]
    fn tool_not_declared_idempotent_defaults_to_non_cacheable() {
        let tools = crate::tools::ToolRegistry::new(vec![]);
        tools.register_backend_tools("b", vec![crate::tools::ToolStub::new("fs.write", "d", "b")]);
        let generation = generation_with_backend(vec!["fs.read".to_string()]);
        assert!(!tool_is_idempotent(&tools, &generation, "fs.write"));
    }

    #[test]
    fn unknown_tool_is_not_idempotent() {
        let tools = crate::tools::ToolRegistry::new(vec![]);
        let generation = generation_with_backend(vec![]);
        assert!(!tool_is_idempotent(&tools, &generation, "missing"));
    }
}
