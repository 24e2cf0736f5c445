//! Background consolidation daemon
//!
//! A long-lived tokio task that walks every session with pending episodic
//! entries, consolidates one batch per session per tick and sleeps for an
//! interval chosen from the remaining queue depth. Shutdown goes through a
//! watch channel and is observed at the top of every tick, so a pass that is
//! applying always runs to completion.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{MemoryError, Result};

use super::engine::ConsolidationEngine;

/// Queue depth above which the fast interval is used
const FAST_QUEUE_DEPTH: usize = 100;
/// Queue depth at or above which the normal interval is used
const NORMAL_QUEUE_DEPTH: usize = 10;
/// Consecutive failed passes before the daemon backs off to the slow interval
const CIRCUIT_BREAK_FAILURES: u64 = 10;
/// Sessions consolidated concurrently within one tick
const MAX_CONCURRENT_SESSIONS: usize = 4;

/// Counters exported for observability
#[derive(Debug, Default)]
pub struct DaemonMetrics {
    ticks: AtomicU64,
    passes: AtomicU64,
    entries_processed: AtomicU64,
    operations_applied: AtomicU64,
    failures: AtomicU64,
    consecutive_failures: AtomicU64,
    queue_depth: AtomicU64,
    skipped_busy: AtomicU64,
    pauses: AtomicU64,
}

/// Point-in-time copy of [`DaemonMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub ticks: u64,
    pub passes: u64,
    pub entries_processed: u64,
    pub operations_applied: u64,
    pub failures: u64,
    pub consecutive_failures: u64,
    pub queue_depth: u64,
    pub skipped_busy: u64,
    pub pauses: u64,
}

impl DaemonMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
            entries_processed: self.entries_processed.load(Ordering::Relaxed),
            operations_applied: self.operations_applied.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            skipped_busy: self.skipped_busy.load(Ordering::Relaxed),
            pauses: self.pauses.load(Ordering::Relaxed),
        }
    }
}

/// Counts a pass as in flight until dropped
struct OperationGuard<'a> {
    in_flight: &'a AtomicU64,
}

impl<'a> OperationGuard<'a> {
    fn new(in_flight: &'a AtomicU64) -> Self {
        in_flight.fetch_add(1, Ordering::SeqCst);
        Self { in_flight }
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub sessions: usize,
    pub entries_processed: usize,
    pub failures: usize,
    /// Unconsolidated entries left after the tick
    pub queue_depth: usize,
}

struct DaemonShared {
    engine: Arc<ConsolidationEngine>,
    metrics: DaemonMetrics,
    in_flight: AtomicU64,
}

pub struct ConsolidationDaemon {
    shared: Arc<DaemonShared>,
    running: Arc<AtomicBool>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ConsolidationDaemon {
    pub fn new(engine: Arc<ConsolidationEngine>) -> Self {
        Self {
            shared: Arc::new(DaemonShared {
                engine,
                metrics: DaemonMetrics::default(),
                in_flight: AtomicU64::new(0),
            }),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Passes currently analysing or applying
    pub fn in_flight(&self) -> u64 {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Spawn the background loop on the current runtime
    pub fn start(&self) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(MemoryError::Consolidation(
                "consolidation daemon is already running".to_string(),
            ));
        }

        let (tx, rx) = watch::channel(false);
        let shared = self.shared.clone();
        let running = self.running.clone();
        let handle = tokio::spawn(async move {
            run_loop(shared, rx).await;
            running.store(false, Ordering::SeqCst);
        });

        *self.shutdown.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!("Consolidation daemon started");
        Ok(())
    }

    /// Signal shutdown and wait for the loop to exit. In-flight passes finish first.
    pub async fn stop(&self) {
        let sender = self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = sender {
            let _ = tx.send(true);
        }

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Consolidation daemon task failed: {}", e);
            }
            info!("Consolidation daemon stopped");
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Run one tick synchronously, outside the background loop
    pub async fn tick(&self) -> TickOutcome {
        tick(&self.shared).await
    }
}

async fn run_loop(shared: Arc<DaemonShared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            debug!("Consolidation daemon observed shutdown");
            break;
        }

        let outcome = tick(&shared).await;
        let settings = shared.engine.settings();
        let metrics = &shared.metrics;

        let interval = if metrics.consecutive_failures.load(Ordering::Relaxed) >= CIRCUIT_BREAK_FAILURES {
            warn!(
                "Consolidation failed {} times in a row, pausing for {}s",
                CIRCUIT_BREAK_FAILURES, settings.slow_interval_secs
            );
            metrics.consecutive_failures.store(0, Ordering::Relaxed);
            metrics.pauses.fetch_add(1, Ordering::Relaxed);
            settings.slow_interval_secs
        } else {
            select_interval(
                outcome.queue_depth,
                settings.fast_interval_secs,
                settings.interval_secs,
                settings.slow_interval_secs,
            )
        };
        debug!(
            "Consolidation tick done: {} sessions, {} entries, {} pending, next in {}s",
            outcome.sessions, outcome.entries_processed, outcome.queue_depth, interval
        );

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    // Sender dropped without signalling
                    break;
                }
            }
        }
    }
}

async fn tick(shared: &DaemonShared) -> TickOutcome {
    let metrics = &shared.metrics;
    metrics.ticks.fetch_add(1, Ordering::Relaxed);

    let engine = &shared.engine;
    let mut outcome = TickOutcome::default();

    // Sessions hold independent locks, so their passes can overlap
    let results: Vec<_> = stream::iter(engine.pending_sessions())
        .map(|session| async move {
            let _guard = OperationGuard::new(&shared.in_flight);
            let result = engine.consolidate_if_idle(&session).await;
            (session, result)
        })
        .buffer_unordered(MAX_CONCURRENT_SESSIONS)
        .collect()
        .await;

    for (session, result) in results {
        match result {
            Ok(Some(report)) => {
                outcome.sessions += 1;
                outcome.entries_processed += report.entries_processed;
                metrics.passes.fetch_add(1, Ordering::Relaxed);
                metrics
                    .entries_processed
                    .fetch_add(report.entries_processed as u64, Ordering::Relaxed);
                metrics
                    .operations_applied
                    .fetch_add(report.stats.mutations() as u64, Ordering::Relaxed);
                metrics.consecutive_failures.store(0, Ordering::Relaxed);
            }
            Ok(None) => {
                debug!("Session {} busy, skipping this tick", session);
                metrics.skipped_busy.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                outcome.failures += 1;
                metrics.failures.fetch_add(1, Ordering::Relaxed);
                metrics.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                if e.is_recoverable() {
                    warn!("Consolidation of {} failed, will retry: {}", session, e);
                } else {
                    error!("Consolidation of {} failed: {}", session, e);
                }
            }
        }
    }

    outcome.queue_depth = engine.pending_entries();
    metrics
        .queue_depth
        .store(outcome.queue_depth as u64, Ordering::Relaxed);
    outcome
}

/// Pick the sleep interval for the remaining queue depth
pub fn select_interval(queue_depth: usize, fast: u64, normal: u64, slow: u64) -> u64 {
    if queue_depth > FAST_QUEUE_DEPTH {
        fast
    } else if queue_depth >= NORMAL_QUEUE_DEPTH {
        normal
    } else {
        slow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConsolidationConfig, EpisodicConfig};
    use crate::episodic::{EpisodicStore, LinearBackend, Role};
    use crate::semantic::SemanticGraphStore;
    use crate::testing::{HashingEmbedder, ManualClock, ScriptedGenerator};

    fn daemon(generator: Arc<ScriptedGenerator>) -> (ConsolidationDaemon, Arc<EpisodicStore>) {
        let clock = Arc::new(ManualClock::default());
        let episodic = Arc::new(EpisodicStore::new(
            Arc::new(LinearBackend::new()),
            Arc::new(HashingEmbedder::default()),
            clock.clone(),
            EpisodicConfig::default(),
        ));
        let engine = Arc::new(ConsolidationEngine::new(
            episodic.clone(),
            Arc::new(SemanticGraphStore::new(clock)),
            generator,
            ConsolidationConfig::default(),
        ));
        (ConsolidationDaemon::new(engine), episodic)
    }

    #[test]
    fn test_select_interval() {
        assert_eq!(select_interval(500, 30, 300, 1800), 30);
        assert_eq!(select_interval(101, 30, 300, 1800), 30);
        assert_eq!(select_interval(100, 30, 300, 1800), 300);
        assert_eq!(select_interval(10, 30, 300, 1800), 300);
        assert_eq!(select_interval(9, 30, 300, 1800), 1800);
        assert_eq!(select_interval(0, 30, 300, 1800), 1800);
    }

    #[tokio::test]
    async fn test_tick_processes_every_session() {
        let (daemon, episodic) = daemon(Arc::new(ScriptedGenerator::new()));
        episodic.record("a", Role::User, "one").await.unwrap();
        episodic.record("b", Role::User, "two").await.unwrap();

        let outcome = daemon.tick().await;
        assert_eq!(outcome.sessions, 2);
        assert_eq!(outcome.entries_processed, 2);
        assert_eq!(outcome.queue_depth, 0);

        let metrics = daemon.metrics();
        assert_eq!(metrics.passes, 2);
        assert_eq!(metrics.ticks, 1);
        assert_eq!(daemon.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failures_are_counted_and_entries_kept() {
        let generator = Arc::new(ScriptedGenerator::new().with_fallback("garbage"));
        let (daemon, episodic) = daemon(generator);
        episodic.record("a", Role::User, "one").await.unwrap();

        daemon.tick().await;
        daemon.tick().await;
        let metrics = daemon.metrics();
        assert_eq!(metrics.failures, 2);
        assert_eq!(metrics.consecutive_failures, 2);
        assert_eq!(metrics.queue_depth, 1);
        assert_eq!(episodic.count_unconsolidated(None), 1);
    }

    #[tokio::test]
    async fn test_start_stop() {
        let (daemon, _) = daemon(Arc::new(ScriptedGenerator::new()));
        daemon.start().unwrap();
        assert!(daemon.is_running());
        assert!(daemon.start().is_err());

        daemon.stop().await;
        assert!(!daemon.is_running());

        // Restartable after a clean stop
        daemon.start().unwrap();
        daemon.stop().await;
    }
}
