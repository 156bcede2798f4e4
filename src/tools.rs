//! Tool registry (C6)
//!
//! Splits every backend tool into an always-resident stub (name + short
//! description + backend id) and a lazily-loaded full schema (input
//! JSON schema, examples, validation rules), TTL-cached. `tools/list`
//! only ever serializes stubs — the design's universal invariant "for all
//! tools t, `tools/list` never contains the full JSON schema of t" is
//! enforced structurally here, not by a runtime check, since the stub
//! type has no schema field to leak.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

const SCHEMA_TTL: Duration = Duration::from_secs(5 * 60);
const NEGATIVE_CACHE_TTL: Duration = Duration::from_secs(10);
const COOCCURRENCE_WINDOW: Duration = Duration::from_secs(60);
const COOCCURRENCE_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Always-resident tool entry Deliberately has no schema
/// field: `tools/list` serializes these directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolStub {
    pub name: String,
    pub short_description: String,
    pub backend_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ToolStub {
    pub fn new(name: impl Into<String>, description: &str, backend_id: impl Into<String>) -> Self {
        let mut short = description.to_string();
        if short.len() > 100 {
            short.truncate(97);
            short.push_str("...");
        }
        Self {
            name: name.into(),
            short_description: short,
            backend_id: backend_id.into(),
            tags: Vec::new(),
        }
    }
}

/// Full tool schema Loaded on demand via [`SchemaFetcher`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub json_schema: Value,
    #[serde(default)]
    pub examples: Vec<Value>,
    pub backend_id: String,
    #[serde(skip)]
    pub loaded_at: Option<Instant>,
}

impl ToolSchema {
    /// Validate `args` against `json_schema`, step 3. A
    /// backend that declared no schema (`null`) is treated as permissive.
    /// A schema that itself fails to compile is logged and skipped rather
    /// than rejecting the caller's arguments for a backend-side defect.
    pub fn validate_args(&self, args: &Value) -> Result<(), ProtocolError> {
        if self.json_schema.is_null() {
            return Ok(());
        }
        let validator = match jsonschema::validator_for(&self.json_schema) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(tool = %self.name, error = %e, "tool declares an uncompilable schema, skipping validation");
                return Ok(());
            }
        };
        if validator.is_valid(args) {
            Ok(())
        } else {
            Err(ProtocolError::InvalidParams(format!(
                "arguments for tool '{}' do not match its declared schema",
                self.name
            )))
        }
    }
}

/// Fetches a tool's full schema from its owning backend. Implemented by
/// the protocol handler's backend-call path; kept as a trait here so
/// the tool registry has no compile-time dependency on the transport
/// layer, per one-way data flow.
#[async_trait]
pub trait SchemaFetcher: Send + Sync {
    async fn fetch_schema(&self, backend_id: &str, tool_name: &str) -> Result<ToolSchema, ProtocolError>;
}

enum SchemaCacheEntry {
    Present(Arc<ToolSchema>),
    NegativeUntil(Instant),
}

/// One (tool, co-occurring tool) observation bucket used by the
/// predictive preloader.
#[derive(Default)]
struct CoOccurrence {
    triggered: u64,
    followed: HashMap<String, u64>,
}

pub struct ToolRegistry {
    stubs: DashMap<String, ToolStub>,
    schemas: DashMap<String, SchemaCacheEntry>,
    recent_calls: std::sync::Mutex<VecDeque<(String, Instant)>>,
    cooccurrence: DashMap<String, CoOccurrence>,
    preload_list: Vec<String>,
}

impl ToolRegistry {
    pub fn new(preload_list: Vec<String>) -> Self {
        Self {
            stubs: DashMap::new(),
            schemas: DashMap::new(),
            recent_calls: std::sync::Mutex::new(VecDeque::new()),
            cooccurrence: DashMap::new(),
            preload_list,
        }
    }

    /// Replace all stubs for `backend_id` (called after a registry
    /// install fetches the backend's `tools/list`).
    pub fn register_backend_tools(&self, backend_id: &str, stubs: Vec<ToolStub>) {
        self.stubs.retain(|_, s| s.backend_id != backend_id);
        for stub in stubs {
            self.stubs.insert(stub.name.clone(), stub);
        }
    }

    /// Drop every stub belonging to a backend id removed from the
    /// current registry generation, per the invariant "every tool
    /// stub's backend_id is in the current registry generation".
    pub fn remove_backend(&self, backend_id: &str) {
        self.stubs.retain(|_, s| s.backend_id != backend_id);
        self.schemas.retain(|name, _| {
            self.stubs.get(name).map(|s| s.backend_id != backend_id).unwrap_or(true)
        });
    }

    /// `tools/list`: stubs only, lexicographically ordered (matches the
    /// fan-out dedup-by-name ordering used elsewhere in the handler).
    pub fn list_stubs(&self) -> Vec<ToolStub> {
        let mut stubs: Vec<ToolStub> = self.stubs.iter().map(|r| r.value().clone()).collect();
        stubs.sort_by(|a, b| a.name.cmp(&b.name));
        stubs
    }

    pub fn resolve_backend(&self, tool_name: &str) -> Option<String> {
        self.stubs.get(tool_name).map(|s| s.backend_id.clone())
    }

    pub fn stub_count(&self) -> usize {
        self.stubs.len()
    }

    /// Fetch (from cache or backend) the full schema for `tool_name`,
    /// step 2. A cached negative (recorded after a fetch
    /// failure) short-circuits for 10s before retrying.
    pub async fn get_or_fetch_schema(
        &self,
        tool_name: &str,
        fetcher: &dyn SchemaFetcher,
    ) -> Result<Arc<ToolSchema>, ProtocolError> {
        if let Some(entry) = self.schemas.get(tool_name) {
            match &*entry {
                SchemaCacheEntry::Present(schema) if !is_expired(schema) => return Ok(Arc::clone(schema)),
                SchemaCacheEntry::NegativeUntil(until) if Instant::now() < *until => {
                    return Err(ProtocolError::SchemaFetchFailed(tool_name.to_string()));
                }
                _ => {}
            }
        }

        let backend_id = self
            .resolve_backend(tool_name)
            .ok_or_else(|| ProtocolError::MethodNotFound(tool_name.to_string()))?;

        match fetcher.fetch_schema(&backend_id, tool_name).await {
            Ok(mut schema) => {
                schema.loaded_at = Some(Instant::now());
                let arc = Arc::new(schema);
                self.schemas
                    .insert(tool_name.to_string(), SchemaCacheEntry::Present(Arc::clone(&arc)));
                Ok(arc)
            }
            Err(_) => {
                self.schemas.insert(
                    tool_name.to_string(),
                    SchemaCacheEntry::NegativeUntil(Instant::now() + NEGATIVE_CACHE_TTL),
                );
                Err(ProtocolError::SchemaFetchFailed(tool_name.to_string()))
            }
        }
    }

    /// Fetch and cache schemas for the configured `preload` list at
    /// startup.
    pub async fn preload_configured(&self, fetcher: &dyn SchemaFetcher) {
        for name in self.preload_list.clone() {
            let _ = self.get_or_fetch_schema(&name, fetcher).await;
        }
    }

    /// Record that `tool_name` was called, updating the co-occurrence
    /// window and, if a confident prediction exists, prefetching the
    /// predicted tool's schema (deterministic co-occurrence
    /// preloader: confidence > 0.7 within a 60s window).
    pub async fn record_call_and_predict(&self, tool_name: &str, fetcher: &dyn SchemaFetcher) {
        let now = Instant::now();
        let recent: Vec<String> = {
            let mut calls = self.recent_calls.lock().unwrap();
            calls.retain(|(_, t)| now.duration_since(*t) <= COOCCURRENCE_WINDOW);
            let within_window: Vec<String> = calls.iter().map(|(n, _)| n.clone()).collect();
            calls.push_back((tool_name.to_string(), now));
            while calls.len() > 1000 {
                calls.pop_front();
            }
            within_window
        };

        for earlier in &recent {
            if earlier == tool_name {
                continue;
            }
            let mut entry = self.cooccurrence.entry(earlier.clone()).or_default();
            entry.triggered += 1;
            *entry.followed.entry(tool_name.to_string()).or_insert(0) += 1;
        }

        if let Some(entry) = self.cooccurrence.get(tool_name) {
            for (candidate, count) in &entry.followed {
                let confidence = *count as f64 / entry.triggered.max(1) as f64;
                if confidence > COOCCURRENCE_CONFIDENCE_THRESHOLD && self.stubs.contains_key(candidate) {
                    let _ = self.get_or_fetch_schema(candidate, fetcher).await;
                }
            }
        }
    }

    /// On-disk snapshot of tool stubs for instant `tools/list`
    /// availability before backends finish handshaking, using the
    /// same layered-TTL approach used for the response cache. Persisted
    /// state is advisory and may be discarded.
    pub async fn save_snapshot(&self, path: &std::path::Path) {
        let snapshot: Vec<ToolStub> = self.stubs.iter().map(|r| r.value().clone()).collect();
        let Ok(json) = serde_json::to_string(&StubSnapshot { version: 1, stubs: snapshot }) else {
            return;
        };
        let tmp = path.with_extension("tmp");
        if tokio::fs::write(&tmp, &json).await.is_ok() {
            let _ = tokio::fs::rename(&tmp, path).await;
        }
    }

    /// Load a previously saved stub snapshot, filtered to backend ids
    /// present in `known_backends` so stale entries from removed
    /// backends never surface.
    pub async fn load_snapshot(&self, path: &std::path::Path, known_backends: &[String]) -> usize {
        let Ok(data) = tokio::fs::read_to_string(path).await else {
            return 0;
        };
        let Ok(snapshot) = serde_json::from_str::<StubSnapshot>(&data) else {
            return 0;
        };
        let mut loaded = 0;
        for stub in snapshot.stubs {
            if known_backends.contains(&stub.backend_id) {
                self.stubs.insert(stub.name.clone(), stub);
                loaded += 1;
            }
        }
        loaded
    }
}

fn is_expired(schema: &ToolSchema) -> bool {
    schema.loaded_at.map(|t| t.elapsed() > SCHEMA_TTL).unwrap_or(true)
}

#[derive(Serialize, Deserialize)]
struct StubSnapshot {
    version: u32,
    stubs: Vec<ToolStub>,
}
