/// Beacon pipeline: bytes in, frames, tracks and global positions out
///
/// Threads:
/// - acquisition: owns the byte source and the frame extractor, feeds the
///   tracker, and hands events to the delivery pool without ever blocking
/// - delivery pool: fixed worker threads calling subscribers
/// - pose poller: tokio task refreshing the pose cache (and evicting lost tags)
///
/// `stop()` is bounded by `shutdown_timeout_ms` no matter what a subscriber,
/// the byte source or the pose source is doing.
use crate::config::BeaconConfig;
use crate::delivery::{DeliveryPool, Dispatcher, SubscriberId, SubscriberRegistry};
use crate::error::{BeaconError, PoseError, Result, TransportError};
use crate::pose::{Eviction, PollerConfig, PoseCache, PosePoller, PoseSource};
use crate::protocol::{ExtractorCounters, Frame, FrameExtractor};
use crate::transport::ByteSource;
use crate::types::{EventKind, PipelineEvent, PipelineStatus, ShutdownReport};
use aoatrack::{project, IngestOutcome, Pose, TagId, TargetTracker, TrackState};
use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// State shared between the pipeline handle and the acquisition thread
#[derive(Debug, Default)]
struct Shared {
    stop: AtomicBool,
    frames_ok: AtomicU64,
    frames_error: AtomicU64,
    bytes_consumed: AtomicU64,
    globals_published: AtomicU64,
    globals_skipped: AtomicU64,
    transport_connected: AtomicBool,
    last_transport_error: Mutex<Option<String>>,
    filter_enabled: AtomicBool,
}

/// Everything the acquisition thread needs besides its source
#[derive(Clone)]
struct Stage {
    shared: Arc<Shared>,
    tracker: Arc<TargetTracker>,
    pose_cache: Arc<PoseCache>,
    dispatcher: Dispatcher,
    clock: Instant,
    read_timeout: Duration,
    pose_max_age: Duration,
    min_heading_speed: f64,
    stats_log_every: u64,
}

struct Acquisition {
    handle: thread::JoinHandle<()>,
    done_rx: Receiver<()>,
}

/// Signals thread exit on drop, so a panicking thread still reports done
struct DoneSignal(Sender<()>);

impl Drop for DoneSignal {
    fn drop(&mut self) {
        let _ = self.0.try_send(());
    }
}

pub struct BeaconPipeline {
    config: BeaconConfig,
    stage: Stage,
    registry: Arc<SubscriberRegistry>,
    pool: Mutex<Option<DeliveryPool>>,
    poller: Mutex<Option<PosePoller>>,
    acquisition: Mutex<Option<Acquisition>>,
    running: AtomicBool,
}

impl BeaconPipeline {
    /// Build and start the pipeline.
    ///
    /// `source` may be `None` and attached later with [`attach_source`](Self::attach_source);
    /// `pose_source` may be `None` when poses are pushed with [`push_pose`](Self::push_pose).
    pub fn start(
        config: BeaconConfig,
        source: Option<Box<dyn ByteSource>>,
        pose_source: Option<Arc<dyn PoseSource>>,
    ) -> Result<Self> {
        config.validate()?;
        let pipeline_config = &config.pipeline;

        let tracker = Arc::new(TargetTracker::new(config.tracker.clone()));
        let pose_cache = Arc::new(PoseCache::new());
        let registry = Arc::new(SubscriberRegistry::new());
        let clock = Instant::now();

        let pool = DeliveryPool::new(
            pipeline_config.delivery_workers,
            pipeline_config.delivery_queue_capacity,
            Arc::clone(&registry),
        )?;

        let eviction = pipeline_config.lost_target_timeout_s.map(|timeout_s| Eviction {
            tracker: Arc::clone(&tracker),
            clock,
            timeout_s,
        });
        let poller = PosePoller::start(
            pose_source,
            Arc::clone(&pose_cache),
            PollerConfig {
                interval: pipeline_config.pose_poll_interval(),
                query_timeout: pipeline_config.pose_query_timeout(),
            },
            eviction,
        )?;

        let stage = Stage {
            shared: Arc::new(Shared {
                filter_enabled: AtomicBool::new(pipeline_config.filter_enabled),
                ..Shared::default()
            }),
            tracker,
            pose_cache,
            dispatcher: pool.dispatcher(),
            clock,
            read_timeout: pipeline_config.read_timeout(),
            pose_max_age: pipeline_config.pose_max_age(),
            min_heading_speed: pipeline_config.min_heading_speed,
            stats_log_every: pipeline_config.stats_log_every,
        };

        let pipeline = Self {
            config,
            stage,
            registry,
            pool: Mutex::new(Some(pool)),
            poller: Mutex::new(Some(poller)),
            acquisition: Mutex::new(None),
            running: AtomicBool::new(true),
        };

        if let Some(source) = source {
            pipeline.attach_source(source)?;
        }

        log::info!("Beacon pipeline started");
        Ok(pipeline)
    }

    pub fn config(&self) -> &BeaconConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start reading from `source`, e.g. after a transport loss.
    ///
    /// Fails if the previous source is still being read.
    pub fn attach_source(&self, source: Box<dyn ByteSource>) -> Result<()> {
        if !self.is_running() {
            return Err(BeaconError::NotRunning);
        }

        let mut acquisition = self.acquisition.lock();
        if let Some(current) = acquisition.as_ref() {
            if !current.handle.is_finished() {
                return Err(BeaconError::SourceAttached);
            }
        }
        if let Some(previous) = acquisition.take() {
            let _ = previous.handle.join();
        }

        let (done_tx, done_rx) = bounded::<()>(1);
        let stage = self.stage.clone();
        let label = source.describe();
        let handle = thread::Builder::new()
            .name("beacon-acquisition".to_string())
            .spawn(move || {
                let _done = DoneSignal(done_tx);
                stage.run(source);
            })?;

        log::info!("Acquisition attached to {}", label);
        *acquisition = Some(Acquisition { handle, done_rx });
        Ok(())
    }

    pub fn subscribe_fn<F>(&self, kinds: &[EventKind], callback: F) -> SubscriberId
    where
        F: Fn(&PipelineEvent) + Send + Sync + 'static,
    {
        self.registry.subscribe_fn(kinds, callback)
    }

    pub fn subscribe_channel(
        &self,
        kinds: &[EventKind],
        capacity: usize,
    ) -> (SubscriberId, Receiver<PipelineEvent>) {
        self.registry.subscribe_channel(kinds, capacity)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.registry.unsubscribe(id)
    }

    /// Push mode: store a pose sample received from outside
    pub fn push_pose(&self, pose: Pose) -> std::result::Result<(), PoseError> {
        self.stage.pose_cache.update(pose)
    }

    pub fn tracker(&self) -> Arc<TargetTracker> {
        Arc::clone(&self.stage.tracker)
    }

    pub fn get_state(&self, tag_id: TagId) -> Option<TrackState> {
        self.stage.tracker.get_state(tag_id)
    }

    /// Track of `tag_id` as it was closest to `timestamp` (pipeline clock seconds)
    pub fn state_at(&self, tag_id: TagId, timestamp: f64) -> Option<TrackState> {
        self.stage.tracker.state_at(tag_id, timestamp)
    }

    /// Seconds since start; the time base of every track and event timestamp
    pub fn clock_seconds(&self) -> f64 {
        self.stage.clock.elapsed().as_secs_f64()
    }

    /// Switch Kalman filtering on or off while running.
    ///
    /// While off, every valid reading is converted and published as is and
    /// the tracks keep their last filtered state.
    pub fn set_filter_enabled(&self, enabled: bool) {
        let previous = self
            .stage
            .shared
            .filter_enabled
            .swap(enabled, Ordering::AcqRel);
        if previous != enabled {
            log::info!("Kalman filtering {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    pub fn filter_enabled(&self) -> bool {
        self.stage.shared.filter_enabled.load(Ordering::Acquire)
    }

    pub fn status(&self) -> PipelineStatus {
        let shared = &self.stage.shared;
        let delivery = self
            .pool
            .lock()
            .as_ref()
            .map(|pool| pool.counters())
            .unwrap_or_default();
        let pose_polls = self
            .poller
            .lock()
            .as_ref()
            .map(|poller| poller.stats())
            .unwrap_or_default();
        let tracker = self.stage.tracker.counters();

        PipelineStatus {
            running: self.is_running(),
            filter_enabled: self.filter_enabled(),
            frames_ok: shared.frames_ok.load(Ordering::Relaxed),
            frames_error: shared.frames_error.load(Ordering::Relaxed),
            bytes_consumed: shared.bytes_consumed.load(Ordering::Relaxed),
            active_tag_ids: self.stage.tracker.tag_ids(),
            last_pose_age: self.stage.pose_cache.age().map(|age| age.as_secs_f64()),
            transport_connected: shared.transport_connected.load(Ordering::Relaxed),
            last_transport_error: shared.last_transport_error.lock().clone(),
            events_dispatched: delivery.events_dispatched,
            events_dropped: delivery.events_dropped,
            subscriber_overflows: delivery.subscriber_overflows,
            subscriber_panics: delivery.subscriber_panics,
            globals_published: shared.globals_published.load(Ordering::Relaxed),
            globals_skipped: shared.globals_skipped.load(Ordering::Relaxed),
            rejected_measurements: tracker.rejected(),
            tracker,
            pose_polls,
        }
    }

    /// Stop every thread, waiting at most `shutdown_timeout_ms` in total.
    /// Calling it again is a no-op.
    pub fn stop(&self) -> ShutdownReport {
        if !self.running.swap(false, Ordering::AcqRel) {
            return ShutdownReport::default();
        }

        let started = Instant::now();
        let deadline = started + self.config.pipeline.shutdown_timeout();
        let remaining = || deadline.saturating_duration_since(Instant::now());
        log::info!("Stopping beacon pipeline");

        self.stage.shared.stop.store(true, Ordering::Release);

        let acquisition = self.acquisition.lock().take();
        let acquisition_joined = match acquisition {
            Some(acquisition) => match acquisition.done_rx.recv_timeout(remaining()) {
                Ok(()) => {
                    let _ = acquisition.handle.join();
                    true
                }
                Err(_) => {
                    log::warn!("Acquisition thread still blocked in a read, detaching it");
                    false
                }
            },
            None => true,
        };

        // Both are put back afterwards so status() still reports their counters
        let mut poller = self.poller.lock().take();
        if let Some(poller) = poller.as_mut() {
            poller.shutdown(remaining());
        }
        *self.poller.lock() = poller;

        let mut pool = self.pool.lock().take();
        let pool_report = pool
            .as_mut()
            .map(|pool| pool.shutdown(remaining()))
            .unwrap_or_default();
        *self.pool.lock() = pool;

        let report = ShutdownReport {
            acquisition_joined,
            workers_detached: pool_report.workers_detached,
            events_discarded: pool_report.events_discarded,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        log::info!(
            "Beacon pipeline stopped in {} ms ({} workers detached, {} events discarded)",
            report.elapsed_ms,
            report.workers_detached,
            report.events_discarded
        );
        report
    }
}

impl Drop for BeaconPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Stage {
    fn run(&self, mut source: Box<dyn ByteSource>) {
        let shared = &self.shared;
        let label = source.describe();
        let mut extractor = FrameExtractor::new();
        let mut reported = ExtractorCounters::default();

        shared.transport_connected.store(true, Ordering::Release);
        log::info!("Acquisition started on {}", label);

        while !shared.stop.load(Ordering::Acquire) {
            match source.read(self.read_timeout) {
                Ok(Some(bytes)) => {
                    let (frames, _) = extractor.feed(&bytes);
                    reported = self.publish_extractor_counters(extractor.counters(), reported);
                    for frame in frames {
                        self.process_frame(frame);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    self.record_transport_error(&label, &e);
                    break;
                }
            }
        }

        shared.transport_connected.store(false, Ordering::Release);
        log::info!(
            "Acquisition on {} stopped: {} frames, {} checksum errors",
            label,
            extractor.counters().frames_ok,
            extractor.counters().frames_error
        );
    }

    /// Fold the extractor's cumulative counters into the pipeline totals,
    /// which survive source re-attachment
    fn publish_extractor_counters(
        &self,
        now: ExtractorCounters,
        before: ExtractorCounters,
    ) -> ExtractorCounters {
        let shared = &self.shared;
        let new_frames = now.frames_ok - before.frames_ok;
        let frames_ok = shared.frames_ok.fetch_add(new_frames, Ordering::Relaxed) + new_frames;
        shared
            .frames_error
            .fetch_add(now.frames_error - before.frames_error, Ordering::Relaxed);
        shared
            .bytes_consumed
            .fetch_add(now.bytes_consumed - before.bytes_consumed, Ordering::Relaxed);

        let every = self.stats_log_every;
        if every > 0 && frames_ok / every != (frames_ok - new_frames) / every {
            log::info!(
                "Pipeline stats: {} frames, {} checksum errors, {} tags tracked",
                frames_ok,
                shared.frames_error.load(Ordering::Relaxed),
                self.tracker.len()
            );
        }
        now
    }

    fn record_transport_error(&self, label: &str, error: &TransportError) {
        log::error!("Transport {} lost: {}", label, error);
        *self.shared.last_transport_error.lock() = Some(error.to_string());
    }

    /// Filtered state after ingesting `frame`, or the raw reading when
    /// filtering is off. `None` if the reading was not usable.
    fn track_frame(&self, frame: &Frame, timestamp: f64) -> Option<TrackState> {
        if !self.shared.filter_enabled.load(Ordering::Acquire) {
            return self
                .tracker
                .unfiltered(
                    frame.tag_id,
                    frame.distance_mm,
                    frame.angle_centidegrees,
                    timestamp,
                )
                .ok();
        }

        match self.tracker.ingest(
            frame.tag_id,
            frame.distance_mm,
            frame.angle_centidegrees,
            timestamp,
        ) {
            IngestOutcome::Created | IngestOutcome::Updated => self.tracker.get_state(frame.tag_id),
            IngestOutcome::Rejected(_) | IngestOutcome::Degenerate => None,
        }
    }

    fn process_frame(&self, frame: Frame) {
        let timestamp = self.clock.elapsed().as_secs_f64();
        log::debug!(
            "Frame anchor={} tag={} d={:.3}m a={:.2}deg",
            frame.anchor_id,
            frame.tag_id,
            frame.distance_m(),
            frame.angle_deg()
        );

        if self.dispatcher.wants(EventKind::Frame) {
            self.dispatcher.dispatch(PipelineEvent::Frame(frame));
        }

        let Some(track) = self.track_frame(&frame, timestamp) else {
            return;
        };

        let global = match self.pose_cache.fresh(self.pose_max_age) {
            Some(pose) => {
                self.shared.globals_published.fetch_add(1, Ordering::Relaxed);
                Some(project(&track, &pose, timestamp, self.min_heading_speed))
            }
            None => {
                self.shared.globals_skipped.fetch_add(1, Ordering::Relaxed);
                None
            }
        };

        if self.dispatcher.wants(EventKind::Track) {
            self.dispatcher.dispatch(PipelineEvent::Track(track));
        }
        if let Some(global) = global {
            if self.dispatcher.wants(EventKind::Global) {
                self.dispatcher.dispatch(PipelineEvent::Global(global));
            }
        }
    }
}
