//! Request batcher (C8)
//!
//! Coalesces concurrent requests for the same (backend, method) into a
//! single upstream call within a short rolling window, then
//! de-multiplexes the combined result back to each original waiter.
//! Only configured methods on configured backends participate;
//! everything else is a pass-through the caller should not route
//! through the batcher at all.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use crate::config::BatcherConfig;
use crate::error::EngineError;

/// A single caller's contribution to a pending batch.
struct Waiter {
    args: Value,
    reply: oneshot::Sender<Result<Value, EngineError>>,
}

struct PendingBatch {
    waiters: Vec<Waiter>,
    opened_at: Instant,
    oldest_deadline: Instant,
}

/// Executes one coalesced upstream call for a batch window and returns
/// one result per input arg set, in the same order. Implemented by the
/// protocol handler, which knows how to speak the backend's batch
/// request shape (or fan multiple individual calls if the backend has
/// no native batch endpoint).
#[async_trait::async_trait]
pub trait BatchExecutor: Send + Sync {
    async fn execute_batch(
        &self,
        backend_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Vec<Result<Value, EngineError>>;
}

pub struct Batcher {
    config: BatcherConfig,
    pending: Mutex<HashMap<(String, String), PendingBatch>>,
}

impl Batcher {
    pub fn new(config: BatcherConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_batchable(&self, method: &str) -> bool {
        self.config.enabled_methods.iter().any(|m| m == method)
    }

    /// Enqueue a call; resolves once the batch it joined has been
    /// flushed and de-multiplexed. Never blocks longer than the
    /// caller's own request deadline -- the batch window itself is
    /// capped at `window_ms`.
    pub async fn submit(
        &self,
        backend_id: &str,
        method: &str,
        args: Value,
        executor: Arc<dyn BatchExecutor>,
    ) -> Result<Value, EngineError> {
        let (tx, rx) = oneshot::channel();
        let key = (backend_id.to_string(), method.to_string());
        let window = Duration::from_millis(self.config.window_ms);

        let should_spawn_flusher = {
            let mut pending = self.pending.lock().await;
            let entry = pending.entry(key.clone());
            match entry {
                std::collections::hash_map::Entry::Occupied(mut occ) => {
                    let batch = occ.get_mut();
                    batch.waiters.push(Waiter { args, reply: tx });
                    if batch.waiters.len() >= self.config.max_batch_size {
                        let batch = occ.remove();
                        drop(pending);
                        self.flush_batch(backend_id, method, batch, Arc::clone(&executor)).await;
                        false
                    } else {
                        false
                    }
                }
                std::collections::hash_map::Entry::Vacant(vac) => {
                    let now = Instant::now();
                    vac.insert(PendingBatch {
                        waiters: vec![Waiter { args, reply: tx }],
                        opened_at: now,
                        oldest_deadline: now + window,
                    });
                    true
                }
            }
        };

        if should_spawn_flusher {
            self.spawn_window_flush(key, window, executor);
        }

        rx.await.unwrap_or_else(|_| {
            Err(EngineError::Other(anyhow::anyhow!(
                "batch reply channel dropped before flush"
            )))
        })
    }

    fn spawn_window_flush(
        self: &Arc<Self>,
        key: (String, String),
        window: Duration,
        executor: Arc<dyn BatchExecutor>,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let batch = {
                let mut pending = this.pending.lock().await;
                pending.remove(&key)
            };
            if let Some(batch) = batch {
                this.flush_batch(&key.0, &key.1, batch, executor).await;
            }
        });
    }

    /// 80%-of-oldest-deadline early flush check: if a new
    /// arrival would push the oldest waiter past 80% of the window
    /// before the window naturally closes, flush immediately instead
    /// of waiting. Exposed for the protocol handler to call on a timer
    /// tick if it wants tighter latency control; the window-based flush
    /// above is the unconditional backstop.
    pub async fn flush_if_near_deadline(
        self: &Arc<Self>,
        backend_id: &str,
        method: &str,
        executor: Arc<dyn BatchExecutor>,
    ) {
        let key = (backend_id.to_string(), method.to_string());
        let batch = {
            let mut pending = self.pending.lock().await;
            match pending.get(&key) {
                Some(batch) => {
                    let window = batch.oldest_deadline - batch.opened_at;
                    let elapsed = batch.opened_at.elapsed();
                    if elapsed.as_secs_f64() >= window.as_secs_f64() * 0.8 {
                        pending.remove(&key)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(batch) = batch {
            self.flush_batch(backend_id, method, batch, executor).await;
        }
    }

    async fn flush_batch(
        &self,
        backend_id: &str,
        method: &str,
        batch: PendingBatch,
        executor: Arc<dyn BatchExecutor>,
    ) {
        let size = batch.waiters.len();
        debug!(backend = backend_id, method, size, "flushing batch");
        let args: Vec<Value> = batch.waiters.iter().map(|w| w.args.clone()).collect();
        let mut results = executor.execute_batch(backend_id, method, args).await;
        if results.len() != batch.waiters.len() {
            results.resize_with(batch.waiters.len(), || {
                Err(EngineError::Other(anyhow::anyhow!(
                    "batch executor returned fewer results than requests"
                )))
            });
        }
        for (waiter, result) in batch.waiters.into_iter().zip(results) {
            let _ = waiter.reply.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingExecutor {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl BatchExecutor for CountingExecutor {
        async fn execute_batch(
            &self,
            _backend_id: &str,
            _method: &str,
            args: Vec<Value>,
        ) -> Vec<Result<Value, EngineError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            args.into_iter().map(Ok).collect()
        }
    }

    fn config() -> BatcherConfig {
        BatcherConfig {
            window_ms: 30,
            max_batch_size: 50,
            enabled_methods: vec!["tools/call".to_string()],
        }
    }

    #[tokio::test]
    async fn concurrent_submits_share_one_upstream_call() {
        let batcher = Batcher::new(config());
        let calls = Arc::new(AtomicUsize::new(0));
        let executor: Arc<dyn BatchExecutor> = Arc::new(CountingExecutor { calls: Arc::clone(&calls) });

        let b1 = Arc::clone(&batcher);
        let e1 = Arc::clone(&executor);
        let t1 = tokio::spawn(async move { b1.submit("backend", "tools/call", serde_json::json!(1), e1).await });
        let b2 = Arc::clone(&batcher);
        let e2 = Arc::clone(&executor);
        let t2 = tokio::spawn(async move { b2.submit("backend", "tools/call", serde_json::json!(2), e2).await });

        let (r1, r2) = tokio::join!(t1, t2);
        assert_eq!(r1.unwrap().unwrap(), serde_json::json!(1));
        assert_eq!(r2.unwrap().unwrap(), serde_json::json!(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn batch_flushes_immediately_at_cap() {
        let mut cfg = config();
        cfg.window_ms = 5_000;
        cfg.max_batch_size = 2;
        let batcher = Batcher::new(cfg);
        let calls = Arc::new(AtomicUsize::new(0));
        let executor: Arc<dyn BatchExecutor> = Arc::new(CountingExecutor { calls: Arc::clone(&calls) });

        let b1 = Arc::clone(&batcher);
        let e1 = Arc::clone(&executor);
        let t1 = tokio::spawn(async move { b1.submit("b", "tools/call", serde_json::json!("a"), e1).await });
        let b2 = Arc::clone(&batcher);
        let e2 = Arc::clone(&executor);
        let t2 = tokio::spawn(async move { b2.submit("b", "tools/call", serde_json::json!("b"), e2).await });

        let (r1, r2) = tokio::time::timeout(Duration::from_millis(500), async { tokio::join!(t1, t2) })
            .await
            .expect("batch should flush at cap without waiting for the window");
        assert!(r1.unwrap().is_ok());
        assert!(r2.unwrap().is_ok());
    }

    #[test]
    fn is_batchable_checks_configured_methods() {
        let batcher = Batcher::new(config());
        assert!(batcher.is_batchable("tools/call"));
        assert!(!batcher.is_batchable("resources/read"));
    }
}
