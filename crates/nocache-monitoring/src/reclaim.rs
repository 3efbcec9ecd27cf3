//! Best-effort memory reclamation
//!
//! Reclamation never runs on the caller's stack: a pass is handed to a tokio
//! blocking worker, or to a plain thread when no runtime is available. Every
//! failure is logged and counted, never returned.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Host primitives that give memory back. Both must be safe to call
/// repeatedly and from any thread.
#[cfg_attr(test, mockall::automock)]
pub trait MemoryReclaimer: Send + Sync {
    /// Drop unreachable host objects
    fn collect_garbage(&self) -> anyhow::Result<()>;

    /// Return cached device memory to the driver
    fn release_device_memory(&self) -> anyhow::Result<()>;
}

/// Reclaimer for hosts with nothing to reclaim
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReclaimer;

impl MemoryReclaimer for NoopReclaimer {
    fn collect_garbage(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn release_device_memory(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Timing of a repeated reclamation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimSchedule {
    /// Number of passes
    pub attempts: u32,
    /// Wait before each pass
    pub delay: Duration,
}

impl Default for ReclaimSchedule {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

/// Counters of a worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    /// Passes run
    pub passes: u64,
    /// Primitive calls that failed
    pub failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    passes: AtomicU64,
    failures: AtomicU64,
}

/// Runs reclamation passes off the caller's thread
#[derive(Clone)]
pub struct ReclaimWorker {
    reclaimer: Arc<dyn MemoryReclaimer>,
    schedule: ReclaimSchedule,
    counters: Arc<Counters>,
}

impl ReclaimWorker {
    /// Create a worker around `reclaimer`
    pub fn new(reclaimer: Arc<dyn MemoryReclaimer>) -> Self {
        Self {
            reclaimer,
            schedule: ReclaimSchedule::default(),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Use a different schedule for repeated reclamation
    pub fn with_schedule(mut self, schedule: ReclaimSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Schedule used by [`ReclaimWorker::trigger_repeated`]
    pub fn schedule(&self) -> ReclaimSchedule {
        self.schedule
    }

    /// Counters so far
    pub fn stats(&self) -> ReclaimStats {
        ReclaimStats {
            passes: self.counters.passes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Run one pass on the current thread. Returns whether both primitives succeeded.
    pub fn reclaim_now(&self, reason: &str) -> bool {
        debug!(reason, "Running memory reclamation pass");
        self.counters.passes.fetch_add(1, Ordering::Relaxed);

        let mut clean = true;
        if let Err(e) = self.reclaimer.collect_garbage() {
            warn!(reason, "Garbage collection failed: {:#}", e);
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            clean = false;
        }
        if let Err(e) = self.reclaimer.release_device_memory() {
            warn!(reason, "Releasing device memory failed: {:#}", e);
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            clean = false;
        }
        clean
    }

    /// Fire-and-forget a single pass.
    ///
    /// Returns the task handle when a tokio runtime is available; without one
    /// the pass runs on a detached thread.
    pub fn trigger(&self, reason: &str) -> Option<JoinHandle<()>> {
        let worker = self.clone();
        let reason = reason.to_string();
        match Handle::try_current() {
            Ok(handle) => Some(handle.spawn_blocking(move || {
                worker.reclaim_now(&reason);
            })),
            Err(_) => {
                std::thread::spawn(move || {
                    worker.reclaim_now(&reason);
                });
                None
            }
        }
    }

    /// Fire-and-forget `schedule.attempts` passes, each after `schedule.delay`.
    pub fn trigger_repeated(&self, reason: &str) -> Option<JoinHandle<()>> {
        let worker = self.clone();
        let reason = reason.to_string();
        let ReclaimSchedule { attempts, delay } = self.schedule;

        match Handle::try_current() {
            Ok(handle) => Some(handle.spawn(async move {
                for attempt in 1..=attempts {
                    tokio::time::sleep(delay).await;
                    let worker = worker.clone();
                    let reason = reason.clone();
                    let pass = tokio::task::spawn_blocking(move || worker.reclaim_now(&reason)).await;
                    if let Err(e) = pass {
                        warn!(attempt, "Reclamation pass did not complete: {}", e);
                    }
                }
            })),
            Err(_) => {
                std::thread::spawn(move || {
                    for _ in 0..attempts {
                        std::thread::sleep(delay);
                        worker.reclaim_now(&reason);
                    }
                });
                None
            }
        }
    }
}

impl Default for ReclaimWorker {
    fn default() -> Self {
        Self::new(Arc::new(NoopReclaimer))
    }
}

impl std::fmt::Debug for ReclaimWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReclaimWorker")
            .field("schedule", &self.schedule)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn quick() -> ReclaimSchedule {
        ReclaimSchedule {
            attempts: 3,
            delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_failures_are_counted_not_raised() {
        let mut reclaimer = MockMemoryReclaimer::new();
        reclaimer.expect_collect_garbage().times(1).returning(|| Ok(()));
        reclaimer
            .expect_release_device_memory()
            .times(1)
            .returning(|| Err(anyhow!("driver busy")));

        let worker = ReclaimWorker::new(Arc::new(reclaimer));

        assert!(!worker.reclaim_now("test"));
        assert_eq!(
            worker.stats(),
            ReclaimStats {
                passes: 1,
                failures: 1
            }
        );
    }

    #[tokio::test]
    async fn test_trigger_runs_one_pass() {
        let mut reclaimer = MockMemoryReclaimer::new();
        reclaimer.expect_collect_garbage().times(1).returning(|| Ok(()));
        reclaimer.expect_release_device_memory().times(1).returning(|| Ok(()));
        let worker = ReclaimWorker::new(Arc::new(reclaimer));

        worker.trigger("purge").expect("runtime available").await.unwrap();

        assert_eq!(worker.stats().passes, 1);
    }

    #[tokio::test]
    async fn test_trigger_repeated_runs_every_attempt() {
        let mut reclaimer = MockMemoryReclaimer::new();
        reclaimer.expect_collect_garbage().times(3).returning(|| Ok(()));
        reclaimer.expect_release_device_memory().times(3).returning(|| Ok(()));
        let worker = ReclaimWorker::new(Arc::new(reclaimer)).with_schedule(quick());

        worker.trigger_repeated("@gc").expect("runtime available").await.unwrap();

        assert_eq!(worker.stats().passes, 3);
        assert_eq!(worker.stats().failures, 0);
    }

    #[test]
    fn test_trigger_without_runtime_uses_thread() {
        let worker = ReclaimWorker::default();
        assert!(worker.trigger("no runtime").is_none());

        for _ in 0..500 {
            if worker.stats().passes == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(worker.stats().passes, 1);
    }

    #[test]
    fn test_default_schedule() {
        assert_eq!(
            ReclaimSchedule::default(),
            ReclaimSchedule {
                attempts: 3,
                delay: Duration::from_secs(1)
            }
        );
    }
}
