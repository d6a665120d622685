/// Carrier pose acquisition
///
/// - `PoseSource`: externally supplied pose query
/// - `PoseCache`: most recent pose with its arrival time, read with a staleness bound
/// - `PosePoller`: periodic poll task on a dedicated tokio runtime, also
///   running optional lost-target eviction
use crate::error::{BeaconError, PoseError, Result};
use aoatrack::{Pose, TargetTracker};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tokio::sync::oneshot;

/// Query for the carrier's current pose.
///
/// Implementations may block (HTTP client, IPC); the poller bounds every call
/// with a timeout and never runs two queries at once.
pub trait PoseSource: Send + Sync {
    fn get_pose(&self) -> std::result::Result<Pose, PoseError>;
}

impl<F> PoseSource for F
where
    F: Fn() -> std::result::Result<Pose, PoseError> + Send + Sync,
{
    fn get_pose(&self) -> std::result::Result<Pose, PoseError> {
        self()
    }
}

/// Latest pose sample and when it arrived
#[derive(Debug, Default)]
pub struct PoseCache {
    latest: Mutex<Option<(Pose, Instant)>>,
}

impl PoseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a pose; non-finite poses are refused and leave the cache untouched
    pub fn update(&self, pose: Pose) -> std::result::Result<(), PoseError> {
        if !pose.is_finite() {
            return Err(PoseError::Invalid);
        }
        *self.latest.lock() = Some((pose, Instant::now()));
        Ok(())
    }

    /// Latest pose if it is younger than `max_age`
    pub fn fresh(&self, max_age: Duration) -> Option<Pose> {
        let (pose, stamp) = (*self.latest.lock())?;
        (stamp.elapsed() <= max_age).then_some(pose)
    }

    /// Latest pose regardless of age
    pub fn latest(&self) -> Option<Pose> {
        let latest = *self.latest.lock();
        latest.map(|(pose, _)| pose)
    }

    /// Time since the last stored pose
    pub fn age(&self) -> Option<Duration> {
        let latest = *self.latest.lock();
        latest.map(|(_, stamp)| stamp.elapsed())
    }
}

/// Poll outcome counters
#[derive(Debug, Default)]
pub struct PosePollStats {
    pub polls_ok: AtomicU64,
    pub polls_failed: AtomicU64,
    pub polls_timed_out: AtomicU64,
    /// Ticks skipped because the previous query had not returned
    pub polls_skipped: AtomicU64,
    pub targets_evicted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PosePollSnapshot {
    pub polls_ok: u64,
    pub polls_failed: u64,
    pub polls_timed_out: u64,
    pub polls_skipped: u64,
    pub targets_evicted: u64,
}

impl PosePollStats {
    pub fn snapshot(&self) -> PosePollSnapshot {
        PosePollSnapshot {
            polls_ok: self.polls_ok.load(Ordering::Relaxed),
            polls_failed: self.polls_failed.load(Ordering::Relaxed),
            polls_timed_out: self.polls_timed_out.load(Ordering::Relaxed),
            polls_skipped: self.polls_skipped.load(Ordering::Relaxed),
            targets_evicted: self.targets_evicted.load(Ordering::Relaxed),
        }
    }
}

/// Periodic eviction of tags that stopped reporting
pub struct Eviction {
    pub tracker: Arc<TargetTracker>,
    /// Tracker timestamps are seconds since this instant
    pub clock: Instant,
    pub timeout_s: f64,
}

/// Settings of the poll task
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    pub query_timeout: Duration,
}

/// Periodic pose poll task running on its own single-worker runtime
pub struct PosePoller {
    runtime: Option<Runtime>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    stats: Arc<PosePollStats>,
}

impl PosePoller {
    /// Start polling. `source` may be `None` when poses are only pushed; the
    /// task then only runs eviction.
    pub fn start(
        source: Option<Arc<dyn PoseSource>>,
        cache: Arc<PoseCache>,
        config: PollerConfig,
        eviction: Option<Eviction>,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("pose-poller")
            .enable_all()
            .build()
            .map_err(|e| BeaconError::runtime(format!("pose poller runtime: {}", e)))?;

        let stats = Arc::new(PosePollStats::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task_stats = Arc::clone(&stats);
        runtime.spawn(async move {
            Self::poll_loop(source, cache, config, eviction, task_stats, shutdown_rx).await;
        });

        Ok(Self {
            runtime: Some(runtime),
            shutdown_tx: Some(shutdown_tx),
            stats,
        })
    }

    pub fn stats(&self) -> PosePollSnapshot {
        self.stats.snapshot()
    }

    /// Cancel the task and shut its runtime down, waiting at most `timeout`.
    /// A pose query stuck in the source is abandoned.
    pub fn shutdown(&mut self, timeout: Duration) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(timeout);
        }
    }

    async fn poll_loop(
        source: Option<Arc<dyn PoseSource>>,
        cache: Arc<PoseCache>,
        config: PollerConfig,
        eviction: Option<Eviction>,
        stats: Arc<PosePollStats>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        log::info!(
            "Pose poller started (every {:?}, query timeout {:?}, eviction {})",
            config.interval,
            config.query_timeout,
            if eviction.is_some() { "on" } else { "off" }
        );

        let mut interval = tokio::time::interval(config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let in_flight = Arc::new(AtomicBool::new(false));
        let mut cycles = 0_u64;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    cycles += 1;

                    if let Some(source) = &source {
                        Self::poll_once(source, &cache, config.query_timeout, &in_flight, &stats).await;
                    }

                    if let Some(eviction) = &eviction {
                        let now = eviction.clock.elapsed().as_secs_f64();
                        let evicted = eviction.tracker.remove_lost_targets(now, eviction.timeout_s);
                        if !evicted.is_empty() {
                            stats.targets_evicted.fetch_add(evicted.len() as u64, Ordering::Relaxed);
                        }
                    }

                    // Periodic status log
                    if cycles % 600 == 0 {
                        let s = stats.snapshot();
                        log::info!(
                            "Pose poller: {} cycles, {} ok, {} failed, {} timed out",
                            cycles,
                            s.polls_ok,
                            s.polls_failed,
                            s.polls_timed_out
                        );
                    }
                }
                _ = &mut shutdown_rx => {
                    log::info!("Pose poller shutting down after {} cycles", cycles);
                    break;
                }
            }
        }

        log::info!("Pose poller stopped");
    }

    /// Run one query bounded by `query_timeout`. `None` when the previous
    /// query is still running.
    async fn query_pose(
        source: &Arc<dyn PoseSource>,
        query_timeout: Duration,
        in_flight: &Arc<AtomicBool>,
    ) -> Option<std::result::Result<Pose, PoseError>> {
        if in_flight.swap(true, Ordering::AcqRel) {
            return None;
        }

        let query_source = Arc::clone(source);
        let flag = Arc::clone(in_flight);
        let query = tokio::task::spawn_blocking(move || {
            let result = query_source.get_pose();
            flag.store(false, Ordering::Release);
            result
        });

        let result = match tokio::time::timeout(query_timeout, query).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                // The query panicked before clearing the flag
                in_flight.store(false, Ordering::Release);
                Err(PoseError::Unavailable(format!("query panicked: {}", join_error)))
            }
            // The blocking query keeps running and clears the flag when it returns
            Err(_) => Err(PoseError::Timeout),
        };
        Some(result)
    }

    async fn poll_once(
        source: &Arc<dyn PoseSource>,
        cache: &PoseCache,
        query_timeout: Duration,
        in_flight: &Arc<AtomicBool>,
        stats: &PosePollStats,
    ) {
        let Some(result) = Self::query_pose(source, query_timeout, in_flight).await else {
            stats.polls_skipped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        match result.and_then(|pose| cache.update(pose)) {
            Ok(()) => {
                stats.polls_ok.fetch_add(1, Ordering::Relaxed);
            }
            Err(PoseError::Timeout) => {
                stats.polls_timed_out.fetch_add(1, Ordering::Relaxed);
                log::warn!("Pose query timed out after {:?}", query_timeout);
            }
            Err(e @ PoseError::Invalid) => {
                stats.polls_failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("Pose rejected: {}", e);
            }
            Err(e) => {
                stats.polls_failed.fetch_add(1, Ordering::Relaxed);
                log::debug!("Pose query failed: {}", e);
            }
        }
    }
}

impl Drop for PosePoller {
    fn drop(&mut self) {
        self.shutdown(Duration::from_millis(100));
    }
}
