use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::error::{GateError, Result};

/// One queued admission request. The sender side hands the freed slot
/// over; a closed sender means the requester stopped listening and must
/// never be given a slot.
struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

/// Mutable per-pool state. This is the only cross-request shared state in
/// the engine. The mutex is never held across an await point.
struct PoolState {
    in_flight: usize,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    stats: AdmissionStatistics,
}

#[derive(Debug, Default, Clone)]
struct AdmissionStatistics {
    admitted: u64,
    queued_then_admitted: u64,
    rejected: u64,
    timed_out: u64,
}

/// A named concurrency class with one origin target. Admission is a
/// bounded-wait acquire: immediate service below the ceiling, FIFO
/// queueing up to `wait_limit` at the ceiling, immediate rejection beyond.
pub struct BackendPool {
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl BackendPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(PoolState {
                in_flight: 0,
                waiters: VecDeque::new(),
                next_waiter_id: 0,
                stats: AdmissionStatistics::default(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn origin_base_url(&self) -> String {
        format!("http://{}:{}", self.config.host, self.config.port)
    }

    /// Whether this pool applies a concurrency ceiling at all.
    pub fn is_limited(&self) -> bool {
        self.config.max_connections > 0
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().in_flight
    }

    pub fn queued(&self) -> usize {
        self.state.lock().unwrap().waiters.len()
    }

    /// Acquire an admission slot. Three observable outcomes: immediate
    /// service, bounded delay, or immediate rejection. Never unbounded
    /// queueing.
    pub async fn acquire(self: Arc<Self>) -> Result<AdmissionPermit> {
        if !self.is_limited() {
            return Ok(AdmissionPermit { pool: None });
        }

        let (waiter_id, mut rx) = {
            let mut state = self.state.lock().unwrap();

            if state.in_flight < self.config.max_connections {
                state.in_flight += 1;
                state.stats.admitted += 1;
                return Ok(AdmissionPermit {
                    pool: Some(self.clone()),
                });
            }

            // Abandoned waiters (client gone) must not occupy queue slots.
            state.waiters.retain(|w| !w.tx.is_closed());

            if state.waiters.len() >= self.config.wait_limit {
                state.stats.rejected += 1;
                warn!(
                    "Pool '{}' overflow: {} in flight, {} queued",
                    self.config.name,
                    state.in_flight,
                    state.waiters.len()
                );
                return Err(GateError::AdmissionRejected {
                    pool: self.config.name.clone(),
                });
            }

            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { id, tx });
            debug!(
                "Pool '{}' saturated, queueing (position {})",
                self.config.name,
                state.waiters.len()
            );
            (id, rx)
        };

        let enqueued_at = Instant::now();
        let sleep = tokio::time::sleep(self.config.wait_timeout);
        tokio::pin!(sleep);

        tokio::select! {
            res = &mut rx => {
                match res {
                    Ok(()) => {
                        let mut state = self.state.lock().unwrap();
                        state.stats.queued_then_admitted += 1;
                        drop(state);
                        Ok(AdmissionPermit { pool: Some(self.clone()) })
                    }
                    // Sender dropped without a handoff; should not happen
                    // while the pool is alive.
                    Err(_) => Err(GateError::Internal(format!(
                        "pool '{}' dropped a queued waiter",
                        self.config.name
                    ))),
                }
            }
            _ = &mut sleep => {
                let mut state = self.state.lock().unwrap();
                if let Some(pos) = state.waiters.iter().position(|w| w.id == waiter_id) {
                    state.waiters.remove(pos);
                    state.stats.timed_out += 1;
                    drop(state);
                    debug!("Pool '{}' admission timed out", self.config.name);
                    Err(GateError::AdmissionTimeout {
                        pool: self.config.name.clone(),
                        waited_ms: enqueued_at.elapsed().as_millis() as u64,
                    })
                } else {
                    // A release promoted us in the same instant the timer
                    // fired. The handoff is sent under the state lock, so
                    // the slot is already buffered in the channel: take it.
                    state.stats.queued_then_admitted += 1;
                    drop(state);
                    match rx.try_recv() {
                        Ok(()) => Ok(AdmissionPermit { pool: Some(self.clone()) }),
                        Err(_) => Err(GateError::Internal(format!(
                            "pool '{}' lost a promoted slot",
                            self.config.name
                        ))),
                    }
                }
            }
        }
    }

    /// Hand the freed slot to the oldest live waiter, or decrement the
    /// in-flight count when nobody is queued. Called from permit drop.
    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        loop {
            match state.waiters.pop_front() {
                Some(waiter) => {
                    // A successful send transfers the slot: in_flight
                    // stays unchanged. A failed send means the waiter
                    // gave up; try the next one.
                    if waiter.tx.send(()).is_ok() {
                        return;
                    }
                }
                None => {
                    debug_assert!(state.in_flight > 0);
                    state.in_flight = state.in_flight.saturating_sub(1);
                    return;
                }
            }
        }
    }

    /// Snapshot of admission counters for diagnostics.
    pub fn get_statistics(&self) -> serde_json::Value {
        let state = self.state.lock().unwrap();
        serde_json::json!({
            "pool": self.config.name,
            "in_flight": state.in_flight,
            "queued": state.waiters.len(),
            "max_connections": self.config.max_connections,
            "wait_limit": self.config.wait_limit,
            "admitted": state.stats.admitted,
            "queued_then_admitted": state.stats.queued_then_admitted,
            "rejected": state.stats.rejected,
            "timed_out": state.stats.timed_out,
        })
    }
}

/// RAII admission slot: dropping it releases the slot and promotes the
/// oldest queued waiter. Pass-through pools hand out uncounted permits.
pub struct AdmissionPermit {
    pool: Option<Arc<BackendPool>>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release();
        }
    }
}

/// Static registry of pools, built once from configuration.
pub struct PoolRegistry {
    pools: HashMap<String, Arc<BackendPool>>,
}

impl PoolRegistry {
    pub fn from_config(configs: &[PoolConfig]) -> Self {
        let pools = configs
            .iter()
            .map(|c| (c.name.clone(), BackendPool::new(c.clone())))
            .collect();
        Self { pools }
    }

    pub fn get(&self, name: &str) -> Option<Arc<BackendPool>> {
        self.pools.get(name).cloned()
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<BackendPool>> {
        self.pools.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pool(max_connections: usize, wait_limit: usize, wait_timeout_ms: u64) -> Arc<BackendPool> {
        BackendPool::new(PoolConfig {
            name: "test".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8080,
            connect_timeout: Duration::from_secs(1),
            first_byte_timeout: Duration::from_secs(1),
            between_bytes_timeout: Duration::from_secs(1),
            max_connections,
            wait_limit,
            wait_timeout: Duration::from_millis(wait_timeout_ms),
        })
    }

    /// Let spawned tasks run up to their suspension points.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn admits_queues_then_rejects() {
        let pool = pool(2, 2, 1_000);

        let p1 = pool.clone().acquire().await.unwrap();
        let p2 = pool.clone().acquire().await.unwrap();
        assert_eq!(pool.in_flight(), 2);

        let q1 = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });
        let q2 = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });
        settle().await;
        assert_eq!(pool.queued(), 2);

        // Fifth request: ceiling reached and queue full, immediate reject.
        let fifth = pool.clone().acquire().await;
        assert!(matches!(fifth, Err(GateError::AdmissionRejected { .. })));

        drop(p1);
        drop(p2);
        settle().await;
        assert!(q1.await.unwrap().is_ok());
        assert!(q2.await.unwrap().is_ok());
        assert_eq!(pool.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_waiter_times_out_and_frees_slot() {
        let pool = pool(1, 2, 100);

        let _held = pool.clone().acquire().await.unwrap();

        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });
        settle().await;
        assert_eq!(pool.queued(), 1);

        tokio::time::advance(Duration::from_millis(150)).await;
        settle().await;

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(GateError::AdmissionTimeout { .. })));
        assert_eq!(pool.queued(), 0);
        assert_eq!(pool.in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn release_promotes_oldest_waiter_first() {
        let pool = pool(1, 4, 10_000);

        let held = pool.clone().acquire().await.unwrap();

        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
        for label in ["first", "second", "third"] {
            let pool = pool.clone();
            let done_tx = done_tx.clone();
            tokio::spawn(async move {
                let permit = pool.clone().acquire().await.unwrap();
                done_tx.send(label).unwrap();
                drop(permit);
            });
            // Enqueue deterministically, one at a time.
            settle().await;
        }
        assert_eq!(pool.queued(), 3);

        drop(held);
        settle().await;

        assert_eq!(done_rx.recv().await.unwrap(), "first");
        assert_eq!(done_rx.recv().await.unwrap(), "second");
        assert_eq!(done_rx.recv().await.unwrap(), "third");
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_never_receives_a_slot() {
        let pool = pool(1, 2, 10_000);

        let held = pool.clone().acquire().await.unwrap();

        let cancelled = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });
        settle().await;
        let survivor = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });
        settle().await;
        assert_eq!(pool.queued(), 2);

        cancelled.abort();
        settle().await;

        // The freed slot must skip the dead waiter and reach the survivor.
        drop(held);
        settle().await;
        assert!(survivor.await.unwrap().is_ok());
        assert_eq!(pool.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_waiters_do_not_count_against_wait_limit() {
        let pool = pool(1, 1, 10_000);

        let _held = pool.clone().acquire().await.unwrap();

        let cancelled = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });
        settle().await;
        assert_eq!(pool.queued(), 1);
        cancelled.abort();
        settle().await;

        // The abandoned entry is purged on the next acquire instead of
        // causing a spurious overflow rejection.
        let queued = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });
        settle().await;
        assert_eq!(pool.queued(), 1);
        queued.abort();
    }

    #[tokio::test]
    async fn unlimited_pool_never_blocks() {
        let pool = pool(0, 0, 1_000);
        let mut permits = Vec::new();
        for _ in 0..100 {
            permits.push(pool.clone().acquire().await.unwrap());
        }
        assert_eq!(pool.in_flight(), 0);
    }
}
