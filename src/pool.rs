use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::descriptor::ProxyDescriptor;
use crate::socks::{self, ProxyError};

/// Failures before a proxy is taken out of rotation
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

const PROBE_DEADLINE: Duration = Duration::from_secs(5);
const REPROBE_TICK: Duration = Duration::from_secs(5);
const BACKOFF_BASE: Duration = Duration::from_secs(30);
const BACKOFF_CAP: Duration = Duration::from_secs(600);

/// Mutable health state for one upstream proxy
#[derive(Debug, Clone)]
pub struct ProxyHealth {
    pub alive: bool,
    pub consecutive_failures: u32,
    pub last_check: Instant,
    pub avg_latency_ms: Option<f64>,
    pub measured_bw_bps: Option<u64>,
    pub in_flight: u32,
    next_probe_at: Option<Instant>,
}

impl ProxyHealth {
    fn new() -> Self {
        ProxyHealth {
            alive: true,
            consecutive_failures: 0,
            last_check: Instant::now(),
            avg_latency_ms: None,
            measured_bw_bps: None,
            in_flight: 0,
            next_probe_at: None,
        }
    }

    fn eligible(&self) -> bool {
        self.alive && self.consecutive_failures < MAX_CONSECUTIVE_FAILURES
    }
}

struct PoolInner {
    health: Vec<ProxyHealth>,
    rr_cursor: u64,
    active_count: usize,
    /// Proxy ids ordered by measured throughput, best first. Identity order
    /// until the optimizer supplies measurements.
    order: Vec<usize>,
}

/// All upstream proxies plus their shared health table.
///
/// The descriptor list is immutable; every mutation of health state, the
/// round-robin cursor, or the active window goes through the single inner
/// mutex, which is only ever held for in-memory bookkeeping.
pub struct ProxyPool {
    descriptors: Vec<ProxyDescriptor>,
    inner: Mutex<PoolInner>,
}

impl ProxyPool {
    pub fn new(descriptors: Vec<ProxyDescriptor>) -> Self {
        let count = descriptors.len();
        ProxyPool {
            descriptors,
            inner: Mutex::new(PoolInner {
                health: (0..count).map(|_| ProxyHealth::new()).collect(),
                rr_cursor: 0,
                active_count: count,
                order: (0..count).collect(),
            }),
        }
    }

    pub fn descriptors(&self) -> &[ProxyDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, id: usize) -> &ProxyDescriptor {
        &self.descriptors[id]
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        // Health bookkeeping never panics while the lock is held.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pick the next eligible proxy by weighted interleaved round-robin.
    pub fn pick(&self) -> Result<usize, ProxyError> {
        self.pick_excluding(&[])
    }

    /// As `pick`, skipping ids a session has already tried. The sweep is
    /// bounded by one full pass over the virtual weight sequence.
    pub fn pick_excluding(&self, excluded: &[usize]) -> Result<usize, ProxyError> {
        let mut inner = self.lock();
        let inner = &mut *inner;
        let window_len = inner.active_count.min(inner.order.len());
        let window = &inner.order[..window_len];

        let total_weight: u64 = window
            .iter()
            .map(|&id| u64::from(self.descriptors[id].weight))
            .sum();
        if total_weight == 0 {
            return Err(ProxyError::NoHealthyProxy);
        }

        for _ in 0..total_weight {
            let slot = inner.rr_cursor % total_weight;
            inner.rr_cursor = inner.rr_cursor.wrapping_add(1);
            let id = slot_to_proxy(window, &self.descriptors, slot);
            let health = &inner.health[id];
            if health.eligible() && !excluded.contains(&id) {
                return Ok(id);
            }
        }
        Err(ProxyError::NoHealthyProxy)
    }

    /// Increment the in-flight count for `id`, returning a guard that
    /// decrements it exactly once on drop.
    pub fn lease(self: &Arc<Self>, id: usize) -> PoolLease {
        self.lock().health[id].in_flight += 1;
        PoolLease {
            pool: Arc::clone(self),
            id,
        }
    }

    pub fn report_success(&self, id: usize, latency: Duration) {
        let mut inner = self.lock();
        let health = &mut inner.health[id];
        health.consecutive_failures = 0;
        health.alive = true;
        health.last_check = Instant::now();
        health.next_probe_at = None;
        let ms = latency.as_secs_f64() * 1000.0;
        health.avg_latency_ms = Some(match health.avg_latency_ms {
            Some(prev) => prev * 0.7 + ms * 0.3,
            None => ms,
        });
    }

    pub fn report_failure(&self, id: usize) {
        let now = Instant::now();
        let mut inner = self.lock();
        let health = &mut inner.health[id];
        health.consecutive_failures += 1;
        health.last_check = now;
        if health.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            if health.alive {
                warn!(
                    proxy = %self.descriptors[id].connection_string(),
                    failures = health.consecutive_failures,
                    "upstream proxy marked down"
                );
            }
            health.alive = false;
            health.next_probe_at = Some(now + backoff(health.consecutive_failures));
        }
    }

    pub fn record_bandwidth(&self, id: usize, bps: u64) {
        self.lock().health[id].measured_bw_bps = Some(bps);
    }

    /// Restrict selection to the first `count` proxies of the throughput
    /// ordering. Clamped to `[1, len]`; an optimizer round that computes 0
    /// therefore still leaves one proxy active.
    pub fn set_active_count(&self, count: usize) {
        let clamped = count.clamp(1, self.descriptors.len());
        let mut inner = self.lock();
        if inner.active_count != clamped {
            info!(active = clamped, total = self.descriptors.len(), "active proxy window resized");
        }
        inner.active_count = clamped;
    }

    /// Install a new throughput ordering. `order` must be a permutation of
    /// all proxy ids.
    pub fn set_throughput_order(&self, order: Vec<usize>) {
        debug_assert_eq!(order.len(), self.descriptors.len());
        self.lock().order = order;
    }

    pub fn active_count(&self) -> usize {
        self.lock().active_count
    }

    pub fn alive_ids(&self) -> Vec<usize> {
        let inner = self.lock();
        inner
            .health
            .iter()
            .enumerate()
            .filter(|(_, h)| h.alive)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn health_snapshot(&self, id: usize) -> ProxyHealth {
        self.lock().health[id].clone()
    }

    /// Ids whose scheduled re-probe time has arrived. Clears the schedule so
    /// a slow probe is not issued twice.
    fn due_reprobes(&self, now: Instant) -> Vec<usize> {
        let mut inner = self.lock();
        let mut due = Vec::new();
        for (id, health) in inner.health.iter_mut().enumerate() {
            if health.next_probe_at.is_some_and(|at| at <= now) {
                health.next_probe_at = None;
                due.push(id);
            }
        }
        due
    }

    fn apply_probe_outcome(&self, id: usize, outcome: Result<Duration, ProxyError>) {
        match outcome {
            Ok(latency) => {
                debug!(
                    proxy = %self.descriptors[id].connection_string(),
                    latency_ms = latency.as_millis() as u64,
                    "probe succeeded"
                );
                self.report_success(id, latency);
            }
            Err(err) => {
                debug!(proxy = %self.descriptors[id].connection_string(), %err, "probe failed");
                self.report_failure(id);
            }
        }
    }
}

/// RAII in-flight lease; dropping it releases the slot.
pub struct PoolLease {
    pool: Arc<ProxyPool>,
    id: usize,
}

impl PoolLease {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        let mut inner = self.pool.lock();
        let health = &mut inner.health[self.id];
        health.in_flight = health.in_flight.saturating_sub(1);
    }
}

fn backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(MAX_CONSECUTIVE_FAILURES).min(5);
    (BACKOFF_BASE * 2u32.pow(exp)).min(BACKOFF_CAP)
}

fn slot_to_proxy(window: &[usize], descriptors: &[ProxyDescriptor], slot: u64) -> usize {
    let mut cumulative = 0u64;
    for &id in window {
        cumulative += u64::from(descriptors[id].weight);
        if slot < cumulative {
            return id;
        }
    }
    // slot < total weight, so the loop always returns
    window[window.len() - 1]
}

/// Background health probing: a full sweep of every descriptor on the
/// configured cadence, plus ad-hoc probes for proxies whose backoff expired.
/// Probes run concurrently against a 5s deadline each.
pub async fn run_health_probes(pool: Arc<ProxyPool>, interval: Duration) {
    let mut tick = tokio::time::interval(REPROBE_TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_sweep = Instant::now();

    loop {
        tick.tick().await;
        let now = Instant::now();
        let mut targets = pool.due_reprobes(now);
        if now.duration_since(last_sweep) >= interval {
            last_sweep = now;
            targets = (0..pool.len()).collect();
        }
        if targets.is_empty() {
            continue;
        }

        let mut probes = JoinSet::new();
        for id in targets {
            let pool = Arc::clone(&pool);
            probes.spawn(async move {
                let outcome = socks::probe(pool.descriptor(id), PROBE_DEADLINE).await;
                (id, outcome)
            });
        }

        let mut alive = 0usize;
        let mut total = 0usize;
        while let Some(joined) = probes.join_next().await {
            let Ok((id, outcome)) = joined else { continue };
            total += 1;
            if outcome.is_ok() {
                alive += 1;
            }
            pool.apply_probe_outcome(id, outcome);
        }
        debug!(alive, total, "health probe round finished");
    }
}
