pub mod hashring;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use async_trait::async_trait;

use crate::config::{BackendConfig, Transport};
use crate::error::RegistryError;
use hashring::HashRing;

/// Immutable per-generation backend descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct BackendDescriptor {
    pub id: String,
    pub name: String,
    pub transport: Transport,
    pub endpoint: Endpoint,
    pub timeout: std::time::Duration,
    pub tool_name_patterns: Vec<String>,
    pub priority: i32,
    pub idempotent_methods: Vec<String>,
    pub batchable_methods: Vec<String>,
}

/// Where a backend is reached, normalized out of [`BackendConfig`].
#[derive(Debug, Clone, PartialEq)]
pub enum Endpoint {
    Command {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        cwd: Option<String>,
    },
    Url {
        url: String,
        headers: HashMap<String, String>,
    },
}

impl BackendDescriptor {
    pub fn from_config(id: &str, cfg: &BackendConfig) -> Result<Self, RegistryError> {
        let endpoint = match cfg.transport {
            Transport::Stdio => {
                let command = cfg.command.clone().ok_or_else(|| RegistryError::InvalidDescriptor {
                    backend: id.to_string(),
                    reason: "stdio backend missing command".to_string(),
                })?;
                Endpoint::Command {
                    command,
                    args: cfg.args.clone(),
                    env: cfg.env.clone(),
                    cwd: cfg.cwd.clone(),
                }
            }
            Transport::Http | Transport::StreamableHttp | Transport::Sse | Transport::WebSocket => {
                let url = cfg.url.clone().ok_or_else(|| RegistryError::InvalidDescriptor {
                    backend: id.to_string(),
                    reason: "network backend missing url".to_string(),
                })?;
                Endpoint::Url {
                    url,
                    headers: cfg.headers.clone(),
                }
            }
        };
        Ok(Self {
            id: id.to_string(),
            name: id.to_string(),
            transport: cfg.transport,
            endpoint,
            timeout: cfg.timeout,
            tool_name_patterns: cfg.tool_name_patterns.clone(),
            priority: cfg.priority,
            idempotent_methods: cfg.idempotent_methods.clone(),
            batchable_methods: cfg.batchable_methods.clone(),
        })
    }
}

/// A single installed, immutable snapshot of the backend set plus the
/// hash ring built over it: a "Registry Generation".
#[derive(Debug, Clone)]
pub struct RegistryGeneration {
    pub version: u64,
    pub backends: HashMap<String, Arc<BackendDescriptor>>,
    pub ring: HashRing,
    pub installed_at: Instant,
}

impl RegistryGeneration {
    fn empty() -> Self {
        Self {
            version: 0,
            backends: HashMap::new(),
            ring: HashRing::new(160),
            installed_at: Instant::now(),
        }
    }

    pub fn get(&self, backend_id: &str) -> Option<&Arc<BackendDescriptor>> {
        self.backends.get(backend_id)
    }

    /// Backends declaring a tool name or method pattern matching `key`.
    pub fn declaring(&self, key: &str) -> Vec<&Arc<BackendDescriptor>> {
        self.backends
            .values()
            .filter(|d| {
                d.tool_name_patterns.is_empty()
                    || d.tool_name_patterns.iter().any(|pat| {
                        regex::Regex::new(pat).map(|re| re.is_match(key)).unwrap_or(false)
                    })
            })
            .collect()
    }
}

/// Callback the install protocol uses to run the synchronous health
/// gate of step 2, without the registry module depending
/// concretely on the transport/pool layers.
#[async_trait]
pub trait HealthGate: Send + Sync {
    async fn probe(&self, descriptor: &BackendDescriptor) -> bool;
}

/// No-op gate for tests and for installs that intentionally skip
/// probing (e.g. constructing the very first empty generation).
pub struct AlwaysHealthy;

#[async_trait]
impl HealthGate for AlwaysHealthy {
    async fn probe(&self, _descriptor: &BackendDescriptor) -> bool {
        true
    }
}

/// Outcome of a successful install, carrying the diff so callers (pool
/// manager, health monitor) know which backend ids to start draining.
pub struct InstallOutcome {
    pub version: u64,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

/// Dual-copy atomic registry: active/standby swap via `ArcSwap`.
/// There is exactly one writer (the reconfiguration task);
/// readers take a cheap `Arc` snapshot with `current()`.
pub struct Registry {
    active: ArcSwap<RegistryGeneration>,
    virtual_nodes: u32,
}

impl Registry {
    pub fn new(virtual_nodes: u32) -> Self {
        Self {
            active: ArcSwap::from_pointee(RegistryGeneration::empty()),
            virtual_nodes,
        }
    }

    /// Constant-time read of the current active generation.
    pub fn current(&self) -> Arc<RegistryGeneration> {
        self.active.load_full()
    }

    /// Run the install protocol against a candidate
    /// descriptor set: build a standby generation, health-gate every
    /// new-or-changed backend, then atomically swap.
    pub async fn install(
        &self,
        descriptors: HashMap<String, BackendDescriptor>,
        gate: &dyn HealthGate,
    ) -> Result<InstallOutcome, RegistryError> {
        let previous = self.current();

        let mut added = Vec::new();
        let mut changed = Vec::new();
        for (id, desc) in &descriptors {
            match previous.backends.get(id) {
                None => added.push(id.clone()),
                Some(old) if old.as_ref() != desc => changed.push(id.clone()),
                Some(_) => {}
            }
        }
        let removed: Vec<String> = previous
            .backends
            .keys()
            .filter(|id| !descriptors.contains_key(*id))
            .cloned()
            .collect();

        for id in added.iter().chain(changed.iter()) {
            let desc = &descriptors[id];
            if !gate.probe(desc).await {
                return Err(RegistryError::HealthGateFailed {
                    backend: id.clone(),
                    reason: "install-time health probe failed".to_string(),
                });
            }
        }

        let mut ring = HashRing::new(self.virtual_nodes);
        let mut backends = HashMap::with_capacity(descriptors.len());
        for (id, desc) in descriptors {
            ring.add_backend(&id);
            backends.insert(id, Arc::new(desc));
        }

        let version = previous.version + 1;
        let next = RegistryGeneration {
            version,
            backends,
            ring,
            installed_at: Instant::now(),
        };
        self.active.store(Arc::new(next));

        added.sort();
        changed.sort();
        Ok(InstallOutcome {
            version,
            added,
            removed,
            changed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn desc(id: &str) -> BackendDescriptor {
        BackendDescriptor {
            id: id.to_string(),
            name: id.to_string(),
            transport: Transport::Stdio,
            endpoint: Endpoint::Command {
                command: "echo".to_string(),
                args: vec![],
                env: Map::new(),
                cwd: None,
            },
            timeout: std::time::Duration::from_secs(30),
            tool_name_patterns: vec![],
            priority: 0,
            idempotent_methods: vec![],
            batchable_methods: vec![],
        }
    }

    #[tokio::test]
    async fn install_starts_at_version_one() {
        let registry = Registry::new(160);
        let mut descs = Map::new();
        descs.insert("a".to_string(), desc("a"));
        let outcome = registry.install(descs, &AlwaysHealthy).await.unwrap();
        assert_eq!(outcome.version, 1);
        assert_eq!(outcome.added, vec!["a".to_string()]);
        assert_eq!(registry.current().version, 1);
    }

    #[tokio::test]
    async fn reader_sees_new_generation_after_swap() {
        let registry = Registry::new(160);
        let mut first = Map::new();
        first.insert("a".to_string(), desc("a"));
        registry.install(first, &AlwaysHealthy).await.unwrap();

        let snapshot_before = registry.current();
        assert!(snapshot_before.get("b").is_none());

        let mut second = Map::new();
        second.insert("a".to_string(), desc("a"));
        second.insert("b".to_string(), desc("b"));
        registry.install(second, &AlwaysHealthy).await.unwrap();

        assert!(registry.current().get("b").is_some());
        // The snapshot obtained before the swap is untouched (old generation
        // survives for any holder of the Arc).
        assert!(snapshot_before.get("b").is_none());
    }

    struct AlwaysFails;
    #[async_trait]
    impl HealthGate for AlwaysFails {
        async fn probe(&self, _descriptor: &BackendDescriptor) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn failed_health_gate_leaves_active_generation_unchanged() {
        let registry = Registry::new(160);
        let mut first = Map::new();
        first.insert("a".to_string(), desc("a"));
        registry.install(first, &AlwaysHealthy).await.unwrap();

        let mut bad = Map::new();
        bad.insert("a".to_string(), desc("a"));
        bad.insert("broken".to_string(), desc("broken"));
        let result = registry.install(bad, &AlwaysFails).await;
        assert!(result.is_err());
        assert_eq!(registry.current().version, 1);
        assert!(registry.current().get("broken").is_none());
    }

    #[tokio::test]
    async fn unchanged_backend_is_not_in_added_or_changed() {
        let registry = Registry::new(160);
        let mut first = Map::new();
        first.insert("a".to_string(), desc("a"));
        registry.install(first, &AlwaysHealthy).await.unwrap();

        let mut second = Map::new();
        second.insert("a".to_string(), desc("a"));
        second.insert("b".to_string(), desc("b"));
        let outcome = registry.install(second, &AlwaysHealthy).await.unwrap();
        assert_eq!(outcome.added, vec!["b".to_string()]);
        assert!(!outcome.changed.contains(&"a".to_string()));
    }
}
