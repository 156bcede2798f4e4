//! MCP aggregating proxy engine: a single-endpoint request-path engine
//! that fronts many Model Context Protocol backends behind one
//! JSON-RPC surface, load-balancing, health-gating, caching, batching,
//! and compressing calls as they pass through.
//!
//! The ten components (C1-C10) each live in their own module; `Engine`
//! in [`protocol`] wires them together behind the JSON-RPC dispatch
//! loop. Everything here is transport-agnostic with respect to the
//! *client* side -- an outer loop (see `main.rs`) owns how requests
//! actually arrive.

pub mod batcher;
pub mod cache;
pub mod cli;
pub mod compressor;
pub mod config;
pub mod error;
pub mod external;
pub mod health;
pub mod pool;
pub mod prerequisite;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod tools;
pub mod tracker;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::{BackendConfig, Config, PoolLimits, Transport as TransportKind};
use crate::health::HealthManager;
use crate::pool::{Pool, PoolManager};
use crate::protocol::Engine;
use crate::registry::{BackendDescriptor, HealthGate, Registry};
use crate::transport::{http::HttpTransport, sse::SseTransport, stdio::StdioTransport, websocket::WebSocketTransport, TransportDriver};

type DriverFactory = Arc<dyn Fn() -> futures::future::BoxFuture<'static, Result<Arc<dyn TransportDriver>, crate::error::PoolError>> + Send + Sync>;

/// Build the fully-wired [`Engine`] from a loaded [`Config`], spawning
/// the background maintenance tasks (pool upkeep, cache sweep, health
/// probes). This is the one assembly point every entry point (the
/// binary, tests, embedders) should use.
pub async fn build_engine(config: &Config) -> anyhow::Result<Arc<Engine>> {
    config.validate()?;

    let registry = Arc::new(Registry::new(config.router.virtual_nodes));
    let health = Arc::new(HealthManager::new());
    let pools = Arc::new(PoolManager::new());
    let cache = Arc::new(crate::cache::ResponseCache::new(&config.cache));
    let batcher = crate::batcher::Batcher::new(config.batcher.clone());
    let compressor = crate::compressor::Compressor::new(config.compression.clone());
    let tools = Arc::new(crate::tools::ToolRegistry::new(Vec::new()));
    let tracker = Arc::new(crate::tracker::CallTracker::new());

    let mut descriptors = HashMap::with_capacity(config.backends.len());
    for (id, backend_cfg) in &config.backends {
        descriptors.insert(id.clone(), BackendDescriptor::from_config(id, backend_cfg)?);
    }

    let gate = EngineHealthGate {
        configs: config.backends.clone(),
        stdio_command_allowlist: config.pools.stdio_command_allowlist.clone(),
    };
    registry.install(descriptors, &gate).await?;

    let global_concurrency = (config.pools.http.max as usize + config.pools.stdio.max as usize).max(1);
    let engine = Engine::new(registry, health, pools, cache, batcher, compressor, tools, tracker, global_concurrency);

    for (id, backend_cfg) in &config.backends {
        spawn_backend_runtime(&engine, id, backend_cfg, config).await?;
    }

    engine.cache.spawn_sweeper();
    for backend_id in engine.health.backend_ids() {
        if let Some(pool) = engine.pools.get(&backend_id) {
            pool.spawn_maintenance();
        }
    }

    Ok(engine)
}

/// Register a backend's pool and health state, and spawn its
/// prerequisite process if declared.
async fn spawn_backend_runtime(
    engine: &Arc<Engine>,
    id: &str,
    backend_cfg: &BackendConfig,
    config: &Config,
) -> anyhow::Result<()> {
    engine.health.insert(id, config.health.clone(), config.circuit_breaker.clone());

    if let Some(prereq) = &backend_cfg.prerequisite {
        if let Err(e) = crate::prerequisite::ensure_prerequisite(id, prereq).await {
            warn!(backend = id, error = %e, "prerequisite process did not start cleanly");
        }
    }

    let limits: PoolLimits = match backend_cfg.transport {
        TransportKind::Stdio => config.pools.stdio.clone(),
        _ => config.pools.http.clone(),
    };
    let pool = Pool::new(
        id.to_string(),
        limits,
        backend_factory(id, backend_cfg, &config.pools.stdio_command_allowlist),
    );
    engine.pools.insert(pool);
    info!(backend = id, transport = ?backend_cfg.transport, "backend runtime ready");
    Ok(())
}

fn backend_factory(id: &str, backend_cfg: &BackendConfig, stdio_command_allowlist: &[String]) -> DriverFactory {
    let id = id.to_string();
    let backend_cfg = backend_cfg.clone();
    let stdio_command_allowlist = stdio_command_allowlist.to_vec();
    Arc::new(move || {
        let id = id.clone();
        let backend_cfg = backend_cfg.clone();
        let stdio_command_allowlist = stdio_command_allowlist.clone();
        Box::pin(async move {
            match backend_cfg.transport {
                TransportKind::Stdio => {
                    let command = backend_cfg.command.clone().ok_or_else(|| crate::error::PoolError::Exhausted {
                        backend: id.clone(),
                        waited_ms: 0,
                    })?;
                    let driver = StdioTransport::spawn(
                        &id,
                        &command,
                        &backend_cfg.args,
                        &backend_cfg.env,
                        backend_cfg.cwd.as_deref(),
                        backend_cfg.framing,
                        &stdio_command_allowlist,
                    )
                    .await
                    .map_err(|e| {
                        if matches!(e, crate::error::TransportError::ConfigViolation { .. }) {
                            warn!(backend = %id, command = %command, "stdio command rejected by allowlist");
                        }
                        crate::error::PoolError::Exhausted { backend: id.clone(), waited_ms: 0 }
                    })?;
                    Ok(Arc::new(driver) as Arc<dyn TransportDriver>)
                }
                TransportKind::Http | TransportKind::StreamableHttp => {
                    let url = backend_cfg.url.clone().ok_or_else(|| crate::error::PoolError::Exhausted {
                        backend: id.clone(),
                        waited_ms: 0,
                    })?;
                    let driver = HttpTransport::new(
                        &id,
                        &url,
                        &backend_cfg.headers,
                        backend_cfg.retry.clone(),
                        &backend_cfg.idempotent_methods,
                    )
                    .map_err(|_| crate::error::PoolError::Exhausted { backend: id.clone(), waited_ms: 0 })?;
                    Ok(Arc::new(driver) as Arc<dyn TransportDriver>)
                }
                TransportKind::Sse => {
                    let url = backend_cfg.url.clone().ok_or_else(|| crate::error::PoolError::Exhausted {
                        backend: id.clone(),
                        waited_ms: 0,
                    })?;
                    let driver = SseTransport::new(&id, &url)
                        .map_err(|_| crate::error::PoolError::Exhausted { backend: id.clone(), waited_ms: 0 })?;
                    Ok(Arc::new(driver) as Arc<dyn TransportDriver>)
                }
                TransportKind::WebSocket => {
                    let url = backend_cfg.url.clone().ok_or_else(|| crate::error::PoolError::Exhausted {
                        backend: id.clone(),
                        waited_ms: 0,
                    })?;
                    let driver = WebSocketTransport::connect(&id, &url)
                        .await
                        .map_err(|_| crate::error::PoolError::Exhausted { backend: id.clone(), waited_ms: 0 })?;
                    Ok(Arc::new(driver) as Arc<dyn TransportDriver>)
                }
            }
        })
    })
}

/// Install-time health gate (step 2): spawns a probe
/// connection via the pool factory and issues a `ping`.
struct EngineHealthGate {
    configs: HashMap<String, BackendConfig>,
    stdio_command_allowlist: Vec<String>,
}

#[async_trait]
impl HealthGate for EngineHealthGate {
    async fn probe(&self, descriptor: &BackendDescriptor) -> bool {
        let Some(backend_cfg) = self.configs.get(&descriptor.id) else {
            return false;
        };
        let factory = backend_factory(&descriptor.id, backend_cfg, &self.stdio_command_allowlist);
        match factory().await {
            Ok(driver) => {
                let ping = serde_json::json!({"jsonrpc":"2.0","id":"probe","method":"ping"});
                let bytes = serde_json::to_vec(&ping).unwrap_or_default();
                let alive = driver.send(&bytes, std::time::Duration::from_secs(5)).await.is_ok();
                driver.close().await;
                alive
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn build_engine_with_no_backends_succeeds() {
        let config = Config::default();
        let engine = build_engine(&config).await.unwrap();
        assert_eq!(engine.registry.current().backends.len(), 0);
    }

    #[tokio::test]
    async fn build_engine_rejects_invalid_virtual_node_count() {
        let mut config = Config::default();
        config.router.virtual_nodes = 10;
        let result = build_engine(&config).await;
        assert!(result.is_err());
    }
}
