//! Layered response cache (C7)
//!
//! Three TTL+LRU layers keyed by method class: L1 (hot tool results), L2
//! (warm resource listings), L3 (cold prompts/static lists). Keys are a
//! 256-bit BLAKE3 hash of a canonicalized `{version, method, args}` tuple
//! with sorted-key-serialized args. `moka::sync::Cache`
//! supplies entry-count LRU/TTL eviction; the byte-ceiling accounting on
//! top of it is ours, since total size across all three layers must
//! stay under one configured ceiling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use moka::sync::Cache as MokaCache;
use serde::Serialize;
use serde_json::Value;

use crate::config::{CacheConfig, CacheLayerConfig};
use crate::error::CacheError;

/// Which of the three layers a method class belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheLayer {
    /// Hot, tool results (only idempotent/read-only tools land here).
    L1,
    /// Warm, resource listings.
    L2,
    /// Cold, prompts / static lists.
    L3,
}

impl CacheLayer {
    fn name(self) -> &'static str {
        match self {
            CacheLayer::L1 => "l1",
            CacheLayer::L2 => "l2",
            CacheLayer::L3 => "l3",
        }
    }

    /// Method-class routing: which layer a given method belongs to.
    pub fn for_method(method: &str) -> CacheLayer {
        match method {
            "tools/call" => CacheLayer::L1,
            "resources/list" | "resources/read" => CacheLayer::L2,
            _ => CacheLayer::L3,
        }
    }
}

/// Whether `method` is eligible for caching at all. `tools/call` is
/// cacheable only when the backend has declared the specific tool
/// idempotent/read-only; every other listing/get method is cacheable
/// unconditionally (subject to the response carrying no error, checked
/// by the caller before `put`).
pub fn is_cacheable_method(method: &str, tool_declared_idempotent: bool) -> bool {
    match method {
        "tools/call" => tool_declared_idempotent,
        "tools/list" | "resources/list" | "resources/read" | "prompts/list" | "prompts/get" | "initialize" => true,
        _ => false,
    }
}

/// A 256-bit cache key ("32-byte content hash").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(pub [u8; 32]);

impl CacheKey {
    /// Hash a canonicalized `{version, method, args}`, with an optional
    /// tenant namespace prefix. Args are recursively
    /// key-sorted before serialization so field order never changes the
    /// hash.
    pub fn compute(namespace: Option<&str>, method: &str, args: &Value) -> Self {
        let canonical_args = canonicalize(args);
        let mut hasher = blake3::Hasher::new();
        if let Some(ns) = namespace {
            hasher.update(ns.as_bytes());
            hasher.update(b"\0");
        }
        hasher.update(b"v1\0");
        hasher.update(method.as_bytes());
        hasher.update(b"\0");
        hasher.update(canonical_args.to_string().as_bytes());
        Self(*hasher.finalize().as_bytes())
    }
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(String, Value)> =
                map.iter().map(|(k, v)| (k.clone(), canonicalize(v))).collect();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Cache entry payload
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub payload: Arc<Vec<u8>>,
    pub created_at: Instant,
    pub size_bytes: usize,
    pub hit_count: Arc<AtomicU64>,
}

struct Layer {
    store: MokaCache<[u8; 32], CacheEntry>,
    bytes_used: AtomicU64,
}

impl Layer {
    fn new(config: CacheLayerConfig) -> Self {
        let store = MokaCache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(config.ttl)
            .build();
        Self {
            store,
            bytes_used: AtomicU64::new(0),
        }
    }
}

/// The layered response cache. One instance serves the whole engine;
/// `L1`/`L2`/`L3` are independently entry-capped and TTL'd, and jointly
/// bounded by `max_total_bytes`.
pub struct ResponseCache {
    l1: Layer,
    l2: Layer,
    l3: Layer,
    max_total_bytes: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            l1: Layer::new(config.l1.clone()),
            l2: Layer::new(config.l2.clone()),
            l3: Layer::new(config.l3.clone()),
            max_total_bytes: config.max_total_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn layer(&self, layer: CacheLayer) -> &Layer {
        match layer {
            CacheLayer::L1 => &self.l1,
            CacheLayer::L2 => &self.l2,
            CacheLayer::L3 => &self.l3,
        }
    }

    /// Look up `key` in `layer`. Bumps the entry's hit counter on a hit.
    pub fn get(&self, layer: CacheLayer, key: &CacheKey) -> Option<Arc<Vec<u8>>> {
        match self.layer(layer).store.get(&key.0) {
            Some(e) => {
                e.hit_count.fetch_add(1, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(e.payload)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert `payload` into `layer` under `key`, evicting the oldest
    /// entries across all layers first if needed to keep total size at
    /// or under the configured ceiling at all times after eviction.
    pub fn put(&self, layer: CacheLayer, key: CacheKey, payload: Vec<u8>) -> Result<(), CacheError> {
        let size_bytes = payload.len();
        if size_bytes as u64 > self.max_total_bytes {
            return Err(CacheError::EntryTooLarge {
                layer: layer.name(),
                size_bytes,
            });
        }

        self.make_room(size_bytes as u64);

        let l = self.layer(layer);
        let entry = CacheEntry {
            payload: Arc::new(payload),
            created_at: Instant::now(),
            size_bytes,
            hit_count: Arc::new(AtomicU64::new(0)),
        };
        l.bytes_used.fetch_add(size_bytes as u64, Ordering::Relaxed);
        l.store.insert(key.0, entry);
        Ok(())
    }

    /// Evict entries across all layers, oldest-created first, until
    /// `required_bytes` of headroom exists under the ceiling.
    fn make_room(&self, required_bytes: u64) {
        if self.total_bytes() + required_bytes <= self.max_total_bytes {
            return;
        }
        for l in [&self.l1, &self.l2, &self.l3] {
            l.store.run_pending_tasks();
        }
        let mut victims: Vec<(CacheLayer, [u8; 32], Instant)> = Vec::new();
        for (layer, l) in [
            (CacheLayer::L1, &self.l1),
            (CacheLayer::L2, &self.l2),
            (CacheLayer::L3, &self.l3),
        ] {
            victims.extend(l.store.iter().map(|(k, v)| (layer, *k, v.created_at)));
        }
        victims.sort_by_key(|(_, _, created_at)| *created_at);

        for (layer, key, _) in victims {
            if self.total_bytes() + required_bytes <= self.max_total_bytes {
                break;
            }
            let l = self.layer(layer);
            if let Some(evicted) = l.store.remove(&key) {
                l.bytes_used.fetch_sub(evicted.size_bytes as u64, Ordering::Relaxed);
            }
        }
    }

    fn total_bytes(&self) -> u64 {
        self.l1.bytes_used.load(Ordering::Relaxed)
            + self.l2.bytes_used.load(Ordering::Relaxed)
            + self.l3.bytes_used.load(Ordering::Relaxed)
    }

    /// Background sweep reconciling byte accounting
    /// with whatever moka has lazily expired since the last pass.
    pub fn sweep_expired(&self) {
        for (layer, l) in [
            (CacheLayer::L1, &self.l1),
            (CacheLayer::L2, &self.l2),
            (CacheLayer::L3, &self.l3),
        ] {
            l.store.run_pending_tasks();
            let live_bytes: u64 = l.store.iter().map(|(_, v)| v.size_bytes as u64).sum();
            l.bytes_used.store(live_bytes, Ordering::Relaxed);
            tracing::trace!(layer = layer.name(), bytes = live_bytes, "cache sweep");
        }
    }

    /// Invalidate every entry in `layer`. A full per-key prefix index
    /// (e.g. `resources:list:<parent-uri>/*`) is out of scope for the
    /// opaque 256-bit key scheme used here; mutation hooks that need
    /// prefix invalidation call this with the coarser
    /// whole-layer granularity, which is conservative but correct, and
    /// rate-limited by the caller.
    pub fn invalidate_layer(&self, layer: CacheLayer) {
        self.layer(layer).store.invalidate_all();
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                cache.sweep_expired();
            }
        })
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            l1_bytes: self.l1.bytes_used.load(Ordering::Relaxed),
            l2_bytes: self.l2.bytes_used.load(Ordering::Relaxed),
            l3_bytes: self.l3.bytes_used.load(Ordering::Relaxed),
            total_ceiling: self.max_total_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub l1_bytes: u64,
    pub l2_bytes: u64,
    pub l3_bytes: u64,
    pub total_ceiling: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn cfg() -> CacheConfig {
        CacheConfig {
            l1: CacheLayerConfig {
                max_entries: 1_000,
                ttl: Duration::from_secs(5 * 60),
            },
            l2: CacheLayerConfig {
                max_entries: 5_000,
                ttl: Duration::from_secs(30 * 60),
            },
            l3: CacheLayerConfig {
                max_entries: 10_000,
                ttl: Duration::from_secs(2 * 60 * 60),
            },
            max_total_bytes: 1024 * 1024,
        }
    }

    #[test]
    fn get_after_put_returns_byte_identical_value() {
        let cache = ResponseCache::new(&cfg());
        let key = CacheKey::compute(None, "tools/list", &Value::Null);
        cache.put(CacheLayer::L3, key, b"hello".to_vec()).unwrap();
        let got = cache.get(CacheLayer::L3, &key).unwrap();
        assert_eq!(&**got, b"hello");
    }

    #[test]
    fn miss_on_unknown_key() {
        let cache = ResponseCache::new(&cfg());
        let key = CacheKey::compute(None, "tools/list", &Value::Null);
        assert!(cache.get(CacheLayer::L3, &key).is_none());
    }

    #[test]
    fn key_is_stable_across_arg_field_order() {
        let a = CacheKey::compute(None, "tools/call", &json!({"a": 1, "b": 2}));
        let b = CacheKey::compute(None, "tools/call", &json!({"b": 2, "a": 1}));
        assert_eq!(a, b);
    }

    #[test]
    fn different_methods_produce_different_keys() {
        let a = CacheKey::compute(None, "tools/list", &Value::Null);
        let b = CacheKey::compute(None, "resources/list", &Value::Null);
        assert_ne!(a, b);
    }

    #[test]
    fn namespace_changes_key() {
        let a = CacheKey::compute(Some("tenant-a"), "tools/list", &Value::Null);
        let b = CacheKey::compute(Some("tenant-b"), "tools/list", &Value::Null);
        assert_ne!(a, b);
    }

    #[test]
    fn entry_larger_than_ceiling_is_rejected() {
        let mut c = cfg();
        c.max_total_bytes = 10;
        let cache = ResponseCache::new(&c);
        let key = CacheKey::compute(None, "tools/list", &Value::Null);
        let result = cache.put(CacheLayer::L3, key, vec![0u8; 100]);
        assert!(result.is_err());
    }

    #[test]
    fn total_size_never_exceeds_ceiling_after_insert() {
        let mut c = cfg();
        c.max_total_bytes = 300;
        let cache = ResponseCache::new(&c);
        for i in 0..10 {
            let key = CacheKey::compute(None, "tools/list", &json!({"i": i}));
            let _ = cache.put(CacheLayer::L3, key, vec![0u8; 50]);
        }
        let stats = cache.stats();
        assert!(stats.l1_bytes + stats.l2_bytes + stats.l3_bytes <= stats.total_ceiling);
    }

    #[test]
    fn non_idempotent_tools_call_is_not_cacheable_by_default() {
        assert!(!is_cacheable_method("tools/call", false));
        assert!(is_cacheable_method("tools/call", true));
    }

    #[test]
    fn listing_methods_are_always_cacheable() {
        assert!(is_cacheable_method("tools/list", false));
        assert!(is_cacheable_method("resources/list", false));
        assert!(is_cacheable_method("prompts/list", false));
    }

    #[test]
    fn layer_routing_matches_method_class() {
        assert!(matches!(CacheLayer::for_method("tools/call"), CacheLayer::L1));
        assert!(matches!(CacheLayer::for_method("resources/list"), CacheLayer::L2));
        assert!(matches!(CacheLayer::for_method("prompts/list"), CacheLayer::L3));
    }

    #[test]
    fn invalidate_layer_clears_entries() {
        let cache = ResponseCache::new(&cfg());
        let key = CacheKey::compute(None, "tools/list", &Value::Null);
        cache.put(CacheLayer::L3, key, b"x".to_vec()).unwrap();
        cache.invalidate_layer(CacheLayer::L3);
        cache.l3.store.run_pending_tasks();
        assert!(cache.get(CacheLayer::L3, &key).is_none());
    }
}
