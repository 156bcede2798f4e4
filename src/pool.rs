//! Per-backend connection/process pool manager (C2)
//!
//! One [`Pool`] per backend id, holding a free list of already-connected
//! [`TransportDriver`] instances plus a factory closure that knows how
//! to create a new one from the backend's descriptor. `acquire` blocks
//! up to `acquire_timeout`; `release` re-probes liveness before putting
//! the entry back on the free list. A maintenance task closes idle-too-long entries, tops up the minimum idle count,
//! and drops entries the health monitor has flagged unhealthy.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::config::PoolLimits;
use crate::error::PoolError;
use crate::transport::TransportDriver;

/// One pooled entry: a live transport plus bookkeeping "Pool
/// Entry" generalized across stdio/HTTP since both are just a
/// `TransportDriver` handle from this layer's point of view.
pub struct PoolEntry {
    pub driver: Arc<dyn TransportDriver>,
    pub spawned_at: Instant,
    pub last_used: Instant,
}

type Factory = Arc<dyn Fn() -> futures::future::BoxFuture<'static, Result<Arc<dyn TransportDriver>, PoolError>> + Send + Sync>;

/// Bounded pool for a single backend. `max` caps total live entries
/// (in-use + idle); `acquire` waits on a semaphore for a free slot, then
/// pops an idle entry or creates a new one via `factory`.
pub struct Pool {
    backend_id: String,
    limits: PoolLimits,
    factory: Factory,
    idle: Mutex<VecDeque<PoolEntry>>,
    permits: Semaphore,
    live_count: AtomicUsize,
    draining: AtomicBool,
}

impl Pool {
    pub fn new(backend_id: impl Into<String>, limits: PoolLimits, factory: Factory) -> Arc<Self> {
        let max = limits.max as usize;
        Arc::new(Self {
            backend_id: backend_id.into(),
            limits,
            factory,
            idle: Mutex::new(VecDeque::new()),
            permits: Semaphore::new(max),
            live_count: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
        })
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Acquire a pooled entry, waiting up to `acquire_timeout`,
    /// returning `Exhausted` on timeout.
    pub async fn acquire(&self) -> Result<PoolEntry, PoolError> {
        if self.is_draining() {
            return Err(PoolError::Draining {
                backend: self.backend_id.clone(),
            });
        }

        let wait_start = Instant::now();
        let permit = tokio::time::timeout(self.limits.acquire_timeout, self.permits.acquire())
            .await
            .map_err(|_| PoolError::Exhausted {
                backend: self.backend_id.clone(),
                waited_ms: wait_start.elapsed().as_millis() as u64,
            })?
            .map_err(|_| PoolError::Canceled {
                backend: self.backend_id.clone(),
            })?;
        permit.forget(); // released explicitly in `release`/`discard`

        {
            let mut idle = self.idle.lock().await;
            if let Some(entry) = idle.pop_front() {
                return Ok(entry);
            }
        }

        match (self.factory)().await {
            Ok(driver) => {
                self.live_count.fetch_add(1, Ordering::AcqRel);
                let now = Instant::now();
                Ok(PoolEntry {
                    driver,
                    spawned_at: now,
                    last_used: now,
                })
            }
            Err(e) => {
                self.permits.add_permits(1);
                Err(e)
            }
        }
    }

    /// Return an entry to the idle list after a cheap liveness re-probe.
    /// If draining or the probe fails, the entry is closed
    /// instead and its permit is returned to the pool.
    pub async fn release(&self, mut entry: PoolEntry) {
        entry.last_used = Instant::now();
        if self.is_draining() || !entry.driver.is_alive().await {
            entry.driver.close().await;
            self.live_count.fetch_sub(1, Ordering::AcqRel);
            self.permits.add_permits(1);
            return;
        }
        self.idle.lock().await.push_back(entry);
        self.permits.add_permits(1);
    }

    /// Discard an entry without returning it to idle (e.g. the caller
    /// observed a transport error mid-call).
    pub async fn discard(&self, entry: PoolEntry) {
        entry.driver.close().await;
        self.live_count.fetch_sub(1, Ordering::AcqRel);
        self.permits.add_permits(1);
    }

    /// One maintenance pass, run every 60s: close idle entries
    /// past `max_idle`, then top up to `min_idle` via the factory.
    pub async fn run_maintenance(&self) {
        let mut closed = 0usize;
        {
            let mut idle = self.idle.lock().await;
            let keep: VecDeque<PoolEntry> = idle
                .drain(..)
                .filter(|e| {
                    let stale = e.last_used.elapsed() > self.limits.max_idle;
                    if stale {
                        closed += 1;
                    }
                    !stale
                })
                .collect();
            *idle = keep;
        }
        for _ in 0..closed {
            self.live_count.fetch_sub(1, Ordering::AcqRel);
            self.permits.add_permits(1);
        }
        if closed > 0 {
            debug!(backend = %self.backend_id, closed, "pool maintenance: closed idle entries");
        }

        if self.is_draining() {
            return;
        }
        let idle_len = self.idle.lock().await.len();
        let deficit = (self.limits.min_idle as usize).saturating_sub(idle_len);
        for _ in 0..deficit {
            if self.permits.available_permits() == 0 {
                break;
            }
            match (self.factory)().await {
                Ok(driver) => {
                    let now = Instant::now();
                    self.live_count.fetch_add(1, Ordering::AcqRel);
                    self.idle.lock().await.push_back(PoolEntry {
                        driver,
                        spawned_at: now,
                        last_used: now,
                    });
                    let _ = self.permits.acquire().await.map(|p| p.forget());
                }
                Err(e) => {
                    warn!(backend = %self.backend_id, error = %e, "failed to warm idle pool entry");
                    break;
                }
            }
        }
    }

    /// Transition the pool to draining: no further acquisitions, idle
    /// entries close immediately, in-use entries close on release.
    /// After `drain_timeout` the caller should force-close any
    /// stragglers (step 5).
    pub async fn begin_drain(&self) {
        self.draining.store(true, Ordering::Release);
        let mut idle = self.idle.lock().await;
        for entry in idle.drain(..) {
            entry.driver.close().await;
            self.live_count.fetch_sub(1, Ordering::AcqRel);
            self.permits.add_permits(1);
        }
    }

    pub fn live_count(&self) -> usize {
        self.live_count.load(Ordering::Acquire)
    }

    /// Spawn the periodic 60s maintenance loop.
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                if pool.is_draining() {
                    continue;
                }
                pool.run_maintenance().await;
            }
        })
    }
}

/// Registry of all per-backend pools, owned by the engine and consulted
/// by the protocol handler after the router has picked a backend.
pub struct PoolManager {
    pools: dashmap::DashMap<String, Arc<Pool>>,
}

impl Default for PoolManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolManager {
    pub fn new() -> Self {
        Self {
            pools: dashmap::DashMap::new(),
        }
    }

    pub fn insert(&self, pool: Arc<Pool>) {
        self.pools.insert(pool.backend_id().to_string(), pool);
    }

    pub fn get(&self, backend_id: &str) -> Option<Arc<Pool>> {
        self.pools.get(backend_id).map(|p| p.clone())
    }

    /// Begin draining and remove `backend_id`'s pool after `drain_timeout`.
    pub async fn drain_and_remove(&self, backend_id: &str, drain_timeout: Duration) {
        let Some(pool) = self.get(backend_id) else { return };
        pool.begin_drain().await;
        info!(backend = backend_id, "pool draining");
        let pools = self.pools.clone();
        let backend_id = backend_id.to_string();
        tokio::spawn(async move {
            let deadline = Instant::now() + drain_timeout;
            while Instant::now() < deadline && pool.live_count() > 0 {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            pools.remove(&backend_id);
            info!(backend = %backend_id, "pool finalized after drain window");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct FakeTransport {
        alive: AtomicBool,
        closes: Arc<AtomicU32>,
    }

    #[async_trait]
    impl TransportDriver for FakeTransport {
        async fn send(&self, _req: &[u8], _timeout: Duration) -> Result<Vec<u8>, crate::error::TransportError> {
            Ok(vec![])
        }
        async fn stream(&self, _req: &[u8]) -> Result<crate::transport::FrameStream, crate::error::TransportError> {
            use futures::stream::{self, StreamExt};
            Ok(stream::iter(Vec::<Result<Vec<u8>, crate::error::TransportError>>::new()).boxed())
        }
        async fn is_alive(&self) -> bool {
            self.alive.load(Ordering::Relaxed)
        }
        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn limits() -> PoolLimits {
        PoolLimits {
            max: 2,
            min_idle: 0,
            max_idle: Duration::from_secs(300),
            acquire_timeout: Duration::from_millis(200),
            drain_timeout: Duration::from_millis(200),
        }
    }

    fn factory(closes: Arc<AtomicU32>) -> Factory {
        Arc::new(move || {
            let closes = Arc::clone(&closes);
            Box::pin(async move {
                Ok(Arc::new(FakeTransport {
                    alive: AtomicBool::new(true),
                    closes,
                }) as Arc<dyn TransportDriver>)
            })
        })
    }

    #[tokio::test]
    async fn acquire_creates_then_reuses_released_entry() {
        let closes = Arc::new(AtomicU32::new(0));
        let pool = Pool::new("b", limits(), factory(closes));
        let entry = pool.acquire().await.unwrap();
        pool.release(entry).await;
        assert_eq!(pool.live_count(), 1);
        let entry2 = pool.acquire().await.unwrap();
        pool.release(entry2).await;
        assert_eq!(pool.live_count(), 1);
    }

    #[tokio::test]
    async fn acquire_past_max_times_out_with_exhausted() {
        let closes = Arc::new(AtomicU32::new(0));
        let pool = Pool::new("b", limits(), factory(closes));
        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { .. }));
    }

    #[tokio::test]
    async fn draining_pool_rejects_new_acquisitions() {
        let closes = Arc::new(AtomicU32::new(0));
        let pool = Pool::new("b", limits(), factory(closes));
        pool.begin_drain().await;
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Draining { .. }));
    }

    #[tokio::test]
    async fn maintenance_closes_entries_past_max_idle() {
        let closes = Arc::new(AtomicU32::new(0));
        let mut lim = limits();
        lim.max_idle = Duration::from_millis(1);
        let pool = Pool::new("b", lim, factory(Arc::clone(&closes)));
        let entry = pool.acquire().await.unwrap();
        pool.release(entry).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.run_maintenance().await;
        assert_eq!(pool.live_count(), 0);
        assert_eq!(closes.load(Ordering::Relaxed), 1);
    }
}
