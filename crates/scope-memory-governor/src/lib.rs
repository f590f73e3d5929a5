//! Memory Governor (C6): tracks named allocations contributed by other
//! components and instructs them to shed memory under pressure. Grounded
//! on `smartscope-core::state`'s background-thread-plus-channel shape
//! (there the thread watches a `notify` filesystem event; here it polls
//! `sysinfo` at a fixed cadence, since there is no file to watch), and on
//! the original `MemoryManager` in `scan_frame_processor.py`'s reclamation
//! policy (sort by size, release until ~20% of budget is freed).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use sysinfo::System;
use tracing::{debug, info, warn};

/// System-wide free-memory floor below which reclamation kicks in.
const SYSTEM_PRESSURE_THRESHOLD_PERCENT: f64 = 20.0;
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Fraction of the governor's own current budget it tries to free per pass.
const RECLAIM_FRACTION: f64 = 0.2;

pub type ReclaimCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct Allocation {
    size_mb: f64,
    kind: String,
    priority: u8,
    on_reclaim: ReclaimCallback,
}

struct Registry {
    allocations: HashMap<String, Allocation>,
}

impl Registry {
    fn current_mb(&self) -> f64 {
        self.allocations.values().map(|a| a.size_mb).sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    pub current_mb: f64,
    pub by_kind: HashMap<String, f64>,
}

/// Observes registered allocations and the process-wide memory budget.
/// Construction starts a background observer thread at ~1 Hz; dropping the
/// governor stops it.
pub struct MemoryGovernor {
    registry: Arc<Mutex<Registry>>,
    budget_mb: f64,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MemoryGovernor {
    /// `budget_mb` is this governor's own policy-level ceiling
    /// (`ScopeConfig::memory_budget_mb`), independent of system-wide RAM.
    pub fn new(budget_mb: u64) -> Self {
        let registry = Arc::new(Mutex::new(Registry {
            allocations: HashMap::new(),
        }));
        let running = Arc::new(AtomicBool::new(true));

        let observer_registry = registry.clone();
        let observer_running = running.clone();
        let handle = std::thread::Builder::new()
            .name("scope-memory-governor".to_string())
            .spawn(move || observe_loop(observer_registry, observer_running))
            .expect("failed to spawn memory governor thread");

        Self {
            registry,
            budget_mb: budget_mb as f64,
            running,
            handle: Some(handle),
        }
    }

    /// Registers a named allocation. `on_reclaim` may be invoked by the
    /// observer thread with this `id` if the system comes under memory
    /// pressure; it must not reacquire any lock held by its registrar (§5).
    pub fn register<F>(&self, id: impl Into<String>, size_mb: f64, kind: impl Into<String>, priority: u8, on_reclaim: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let id = id.into();
        let mut registry = self.registry.lock().unwrap();
        registry.allocations.insert(
            id,
            Allocation {
                size_mb,
                kind: kind.into(),
                priority: priority.clamp(1, 10),
                on_reclaim: Arc::new(on_reclaim),
            },
        );
    }

    pub fn unregister(&self, id: &str) {
        self.registry.lock().unwrap().allocations.remove(id);
    }

    /// True if both this governor's own budget and a system-level safety
    /// margin admit `requested_mb` more resident memory.
    pub fn check(&self, requested_mb: f64) -> bool {
        let current = self.registry.lock().unwrap().current_mb();
        if current + requested_mb > self.budget_mb {
            return false;
        }
        match system_available_mb() {
            Some(available) => available >= requested_mb * 1.5,
            None => true,
        }
    }

    pub fn stats(&self) -> MemoryStats {
        let registry = self.registry.lock().unwrap();
        let mut by_kind: HashMap<String, f64> = HashMap::new();
        for alloc in registry.allocations.values() {
            *by_kind.entry(alloc.kind.clone()).or_insert(0.0) += alloc.size_mb;
        }
        MemoryStats {
            current_mb: registry.current_mb(),
            by_kind,
        }
    }

    /// Runs one reclamation pass immediately, bypassing the poll interval.
    /// Exposed for tests and for callers that want to force a sweep after
    /// a known-large allocation.
    pub fn force_reclaim(&self) {
        reclaim_pass(&self.registry);
    }
}

impl Drop for MemoryGovernor {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn observe_loop(registry: Arc<Mutex<Registry>>, running: Arc<AtomicBool>) {
    let mut system = System::new();
    while running.load(Ordering::SeqCst) {
        system.refresh_memory();
        let total = system.total_memory();
        if total > 0 {
            let available_percent = system.available_memory() as f64 / total as f64 * 100.0;
            if available_percent < SYSTEM_PRESSURE_THRESHOLD_PERCENT {
                warn!(available_percent, "system memory under pressure, reclaiming");
                reclaim_pass(&registry);
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Iterates registered allocations in descending `size * (11 - priority)`
/// order, invoking `on_reclaim` until 20% of the governor's own current
/// budget has been released or the list is exhausted. The registry lock is
/// never held while a callback runs.
fn reclaim_pass(registry: &Arc<Mutex<Registry>>) {
    let (target_mb, mut candidates): (f64, Vec<(String, f64, ReclaimCallback)>) = {
        let inner = registry.lock().unwrap();
        let current = inner.current_mb();
        let mut candidates: Vec<(String, f64, ReclaimCallback)> = inner
            .allocations
            .iter()
            .map(|(id, a)| (id.clone(), a.size_mb * (11 - a.priority as i32) as f64, a.on_reclaim.clone()))
            .collect();
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        (current * RECLAIM_FRACTION, candidates)
    };

    let mut released = 0.0;
    for (id, weighted_size, on_reclaim) in candidates.drain(..) {
        if released >= target_mb {
            break;
        }
        debug!(id, weighted_size, "invoking reclaim callback");
        on_reclaim(&id);
        released += weighted_size.max(1.0);
    }
    if released > 0.0 {
        info!(released_mb = released, "memory governor reclamation pass complete");
    }
}

fn system_available_mb() -> Option<f64> {
    let mut system = System::new();
    system.refresh_memory();
    if system.total_memory() == 0 {
        return None;
    }
    Some(system.available_memory() as f64 / (1024.0 * 1024.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn register_and_stats_track_kind_totals() {
        let gov = MemoryGovernor::new(2048);
        gov.register("frame-store", 100.0, "buffer", 5, |_| {});
        gov.register("point-cloud", 20.0, "cache", 3, |_| {});
        let stats = gov.stats();
        assert!((stats.current_mb - 120.0).abs() < 1e-9);
        assert_eq!(stats.by_kind.get("buffer"), Some(&100.0));
    }

    #[test]
    fn unregister_removes_allocation_from_stats() {
        let gov = MemoryGovernor::new(2048);
        gov.register("frame-store", 100.0, "buffer", 5, |_| {});
        gov.unregister("frame-store");
        assert_eq!(gov.stats().current_mb, 0.0);
    }

    #[test]
    fn check_rejects_requests_that_exceed_the_budget() {
        let gov = MemoryGovernor::new(100);
        gov.register("frame-store", 90.0, "buffer", 5, |_| {});
        assert!(!gov.check(50.0));
    }

    #[test]
    fn force_reclaim_invokes_callbacks_until_target_released() {
        let gov = MemoryGovernor::new(2048);
        let calls = Arc::new(AtomicU32::new(0));

        let c1 = calls.clone();
        gov.register("big-low-priority", 1000.0, "buffer", 1, move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = calls.clone();
        gov.register("small-high-priority", 10.0, "buffer", 10, move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        });

        gov.force_reclaim();
        // Target is 20% of 1010MB = 202MB; the big low-priority allocation
        // alone (weighted 1000*10=10000) satisfies it in one callback.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_may_call_unregister_on_its_own_id_without_deadlocking() {
        let gov = Arc::new(MemoryGovernor::new(2048));
        let gov_in_callback = gov.clone();
        gov.register("self-unregistering", 500.0, "buffer", 1, move |id| {
            // Would deadlock if force_reclaim held the registry lock here.
            gov_in_callback.unregister(id);
        });
        gov.force_reclaim();
        assert_eq!(gov.stats().current_mb, 0.0);
    }
}
