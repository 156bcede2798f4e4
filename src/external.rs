//! External interfaces: the narrow seams a real deployment plugs
//! into without touching the core engine. Every trait here ships a
//! no-op default so the crate runs standalone; auth, metrics export,
//! and audit sinks are genuinely out of scope to implement, only the
//! seam is.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use tracing::{error, info};

use crate::config::Config;

/// Authorization decision for a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny,
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, principal: &str, method: &str, tool: Option<&str>) -> AuthDecision;
}

/// Default authorizer: permits everything. A real RBAC layer is out of
/// scope for this engine.
pub struct AllowAllAuthorizer;

#[async_trait]
impl Authorizer for AllowAllAuthorizer {
    async fn authorize(&self, _principal: &str, _method: &str, _tool: Option<&str>) -> AuthDecision {
        AuthDecision::Allow
    }
}

/// Push-style metrics sink. Metric names are fixed so swapping in a
/// real exporter (Prometheus, OTel) later is a one-line change at the
/// construction site, not at any call site.
pub trait MetricsSink: Send + Sync {
    fn counter(&self, name: &str, value: u64, labels: &[(&str, &str)]);
    fn gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]);
    fn histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]);
}

/// Metric names used verbatim at every call site.
pub mod metric_names {
    pub const REQUESTS_TOTAL: &str = "requests_total";
    pub const REQUEST_DURATION_SECONDS: &str = "request_duration_seconds";
    pub const BACKEND_REQUESTS_TOTAL: &str = "backend_requests_total";
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const TOKENS_SAVED_TOTAL: &str = "tokens_saved_total";
    pub const TOKENS_BASELINE: &str = "tokens_baseline";
    pub const TOKENS_OPTIMIZED: &str = "tokens_optimized";
    pub const CIRCUIT_BREAKER_STATE: &str = "circuit_breaker_state";
    pub const HEALTH_STATUS: &str = "health_status";
    pub const POOL_ACTIVE: &str = "pool_active";
    pub const POOL_IDLE: &str = "pool_idle";
    pub const BATCH_SIZE: &str = "batch_size";
    pub const COMPRESSION_RATIO: &str = "compression_ratio";
}

/// Default sink: drops every observation on the floor.
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn counter(&self, _name: &str, _value: u64, _labels: &[(&str, &str)]) {}
    fn gauge(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
    fn histogram(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
}

#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub principal: String,
    pub method: String,
    pub tool: Option<String>,
    pub backend_id: Option<String>,
    pub decision: AuthDecision,
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _event: AuditEvent) {}
}

/// Produces a `Config` snapshot; the file-backed default just calls
/// `Config::load`.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<Config>;
}

pub struct FileConfigSource {
    pub path: PathBuf,
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> Result<Config> {
        Config::load(&self.path)
    }
}

/// Watches the config file for changes and invokes `on_change` with
/// each successfully parsed reload, debounced to absorb editor
/// save-related rapid-fire events. Exists to exercise the install
/// protocol end-to-end; full CLI/file-watch ergonomics are out of scope.
pub struct ConfigWatcher {
    path: PathBuf,
    current: Arc<ArcSwap<Config>>,
}

impl ConfigWatcher {
    pub fn new(path: PathBuf, current: Arc<ArcSwap<Config>>) -> Self {
        Self { path, current }
    }

    /// Run the watch loop until `shutdown` fires. `on_reload` receives
    /// the previous and newly loaded config and decides whether/how to
    /// install it (diffing, health-gating, etc. all happen above this
    /// layer).
    pub async fn run<F>(self, shutdown: Arc<tokio::sync::Notify>, on_reload: F)
    where
        F: Fn(Arc<Config>, Config) + Send + Sync + 'static,
    {
        use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

        let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);
        let watcher_result: std::result::Result<RecommendedWatcher, _> =
            notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| {
                if let Ok(event) = res
                    && matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_))
                {
                    let _ = tx.try_send(());
                }
            });

        let mut watcher = match watcher_result {
            Ok(w) => w,
            Err(e) => {
                error!(error = %e, "failed to create config file watcher");
                return;
            }
        };

        if let Err(e) = watcher.watch(&self.path, RecursiveMode::NonRecursive) {
            error!(path = %self.path.display(), error = %e, "failed to watch config file");
            return;
        }

        info!(path = %self.path.display(), "config file watcher started");
        let debounce = Duration::from_millis(500);

        loop {
            tokio::select! {
                Some(()) = rx.recv() => {
                    tokio::time::sleep(debounce).await;
                    while rx.try_recv().is_ok() {}

                    info!("config file changed, reloading");
                    match Config::load(&self.path) {
                        Ok(new_config) => {
                            let old = self.current.load_full();
                            on_reload(old, new_config);
                        }
                        Err(e) => {
                            error!(error = %e, "failed to parse reloaded config, keeping current");
                        }
                    }
                }
                _ = shutdown.notified() => {
                    info!("config watcher shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allow_all_authorizer_always_allows() {
        let authorizer = AllowAllAuthorizer;
        let decision = authorizer.authorize("anyone", "tools/call", Some("fs.read")).await;
        assert_eq!(decision, AuthDecision::Allow);
    }

    #[test]
    fn null_sinks_do_not_panic() {
        let metrics = NullMetricsSink;
        metrics.counter(metric_names::REQUESTS_TOTAL, 1, &[("method", "tools/call")]);
        metrics.gauge(metric_names::POOL_ACTIVE, 3.0, &[]);
        metrics.histogram(metric_names::REQUEST_DURATION_SECONDS, 0.05, &[]);

        let audit = NullAuditSink;
        audit.record(AuditEvent {
            principal: "anyone".to_string(),
            method: "tools/call".to_string(),
            tool: Some("fs.read".to_string()),
            backend_id: Some("b".to_string()),
            decision: AuthDecision::Allow,
        });
    }
}
