/// Event fan-out to subscribers
///
/// The acquisition thread never calls a subscriber. It hands events to a
/// fixed pool of delivery workers through bounded per-worker queues:
/// - routing by `tag_id % workers` keeps per-tag order
/// - a full queue drops the event (counted) instead of blocking the producer
/// - a panicking callback is caught and counted, the worker keeps going
use crate::error::Result;
use crate::types::{DeliveryCounters, EventKind, EventMask, PipelineEvent};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::RwLock;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub type SubscriberId = u64;

/// Callback subscriber; runs on a delivery worker thread
pub type EventCallback = Box<dyn Fn(&PipelineEvent) + Send + Sync>;

enum Sink {
    Callback(EventCallback),
    Channel(Sender<PipelineEvent>),
}

struct Subscriber {
    id: SubscriberId,
    mask: EventMask,
    sink: Sink,
}

/// Registered subscribers. Workers deliver from a snapshot so no lock is
/// held while a callback runs.
#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
    wanted: RwLock<EventMask>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, mask: EventMask, sink: Sink) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut subscribers = self.subscribers.write();
        subscribers.push(Arc::new(Subscriber { id, mask, sink }));
        *self.wanted.write() = Self::union(&subscribers);
        id
    }

    fn union(subscribers: &[Arc<Subscriber>]) -> EventMask {
        subscribers
            .iter()
            .fold(EventMask::default(), |mask, sub| mask.union(sub.mask))
    }

    pub fn subscribe_fn<F>(&self, kinds: &[EventKind], callback: F) -> SubscriberId
    where
        F: Fn(&PipelineEvent) + Send + Sync + 'static,
    {
        let id = self.add(EventMask::from_kinds(kinds), Sink::Callback(Box::new(callback)));
        log::debug!("Callback subscriber {} registered for {:?}", id, kinds);
        id
    }

    /// Subscribe through a bounded channel; events are dropped when the
    /// receiver falls `capacity` events behind
    pub fn subscribe_channel(
        &self,
        kinds: &[EventKind],
        capacity: usize,
    ) -> (SubscriberId, Receiver<PipelineEvent>) {
        let (tx, rx) = bounded(capacity.max(1));
        let id = self.add(EventMask::from_kinds(kinds), Sink::Channel(tx));
        log::debug!("Channel subscriber {} registered for {:?}", id, kinds);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|sub| sub.id != id);
        *self.wanted.write() = Self::union(&subscribers);
        before != subscribers.len()
    }

    /// Whether any subscriber wants `kind`; lets the producer skip building events
    pub fn wants(&self, kind: EventKind) -> bool {
        self.wanted.read().contains(kind)
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    fn snapshot(&self, kind: EventKind) -> Vec<Arc<Subscriber>> {
        self.subscribers
            .read()
            .iter()
            .filter(|sub| sub.mask.contains(kind))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
struct DeliveryStats {
    events_dispatched: AtomicU64,
    events_dropped: AtomicU64,
    deliveries: AtomicU64,
    subscriber_overflows: AtomicU64,
    subscriber_panics: AtomicU64,
    events_discarded: AtomicU64,
}

impl DeliveryStats {
    fn snapshot(&self) -> DeliveryCounters {
        DeliveryCounters {
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            subscriber_overflows: self.subscriber_overflows.load(Ordering::Relaxed),
            subscriber_panics: self.subscriber_panics.load(Ordering::Relaxed),
            events_discarded: self.events_discarded.load(Ordering::Relaxed),
        }
    }
}

/// Producer handle of the pool; cheap to clone into the acquisition thread
#[derive(Clone)]
pub struct Dispatcher {
    queues: Arc<[Sender<PipelineEvent>]>,
    registry: Arc<SubscriberRegistry>,
    stats: Arc<DeliveryStats>,
    closing: Arc<AtomicBool>,
}

impl Dispatcher {
    /// Queue an event without blocking. Returns false if it was dropped.
    pub fn dispatch(&self, event: PipelineEvent) -> bool {
        if self.closing.load(Ordering::Acquire) || self.queues.is_empty() {
            return false;
        }

        let worker = event.tag_id() as usize % self.queues.len();
        match self.queues[worker].try_send(event) {
            Ok(()) => {
                self.stats.events_dispatched.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(event)) => {
                let dropped = self.stats.events_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 100 == 0 {
                    log::warn!(
                        "Delivery worker {} is behind, dropped {:?} event for tag {} ({} dropped so far)",
                        worker,
                        event.kind(),
                        event.tag_id(),
                        dropped
                    );
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn wants(&self, kind: EventKind) -> bool {
        self.registry.wants(kind)
    }
}

/// Outcome of [`DeliveryPool::shutdown`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolShutdown {
    pub workers_joined: usize,
    pub workers_detached: usize,
    pub events_discarded: u64,
}

/// Fixed set of delivery worker threads
pub struct DeliveryPool {
    dispatcher: Dispatcher,
    workers: Vec<Option<thread::JoinHandle<()>>>,
    done_rx: Receiver<usize>,
    cancel: Arc<AtomicBool>,
}

impl DeliveryPool {
    pub fn new(
        num_workers: usize,
        queue_capacity: usize,
        registry: Arc<SubscriberRegistry>,
    ) -> Result<Self> {
        let num_workers = num_workers.max(1);
        let stats = Arc::new(DeliveryStats::default());
        let closing = Arc::new(AtomicBool::new(false));
        let cancel = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = bounded::<usize>(num_workers);

        let mut queues = Vec::with_capacity(num_workers);
        let mut workers = Vec::with_capacity(num_workers);

        for worker_id in 0..num_workers {
            let (tx, rx) = bounded::<PipelineEvent>(queue_capacity.max(1));
            queues.push(tx);

            let worker = Worker {
                id: worker_id,
                rx,
                registry: Arc::clone(&registry),
                stats: Arc::clone(&stats),
                closing: Arc::clone(&closing),
                cancel: Arc::clone(&cancel),
            };
            let done_tx = done_tx.clone();

            let handle = thread::Builder::new()
                .name(format!("beacon-delivery-{}", worker_id))
                .spawn(move || {
                    worker.run();
                    let _ = done_tx.send(worker_id);
                })?;
            workers.push(Some(handle));
        }

        log::info!(
            "Delivery pool started: {} workers, queue capacity {}",
            num_workers,
            queue_capacity
        );

        Ok(Self {
            dispatcher: Dispatcher {
                queues: queues.into(),
                registry,
                stats,
                closing,
            },
            workers,
            done_rx,
            cancel,
        })
    }

    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    pub fn counters(&self) -> DeliveryCounters {
        self.dispatcher.stats.snapshot()
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting events and let workers drain for at most `timeout`.
    ///
    /// After the deadline the remaining queued events are discarded and any
    /// worker still inside a subscriber is detached.
    pub fn shutdown(&mut self, timeout: Duration) -> PoolShutdown {
        self.dispatcher.closing.store(true, Ordering::Release);
        let deadline = Instant::now() + timeout;

        let mut joined = 0;
        let running = self.workers.iter().filter(|w| w.is_some()).count();
        while joined < running {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.done_rx.recv_timeout(remaining) {
                Ok(worker_id) => {
                    if let Some(handle) = self.workers.get_mut(worker_id).and_then(Option::take) {
                        let _ = handle.join();
                    }
                    joined += 1;
                }
                Err(_) => break,
            }
        }

        let detached = running - joined;
        if detached > 0 {
            self.cancel.store(true, Ordering::Release);
            log::warn!(
                "Delivery pool: {} workers still busy after {:?}, detaching them",
                detached,
                timeout
            );
            // Dropping the handles detaches the threads
            self.workers.iter_mut().for_each(|w| drop(w.take()));
        }

        let counters = self.counters();
        log::info!(
            "Delivery pool stopped: {} dispatched, {} delivered, {} dropped, {} panics",
            counters.events_dispatched,
            counters.deliveries,
            counters.events_dropped,
            counters.subscriber_panics
        );

        PoolShutdown {
            workers_joined: joined,
            workers_detached: detached,
            events_discarded: counters.events_discarded,
        }
    }
}

impl Drop for DeliveryPool {
    fn drop(&mut self) {
        if self.workers.iter().any(Option::is_some) {
            self.shutdown(Duration::from_millis(100));
        }
    }
}

struct Worker {
    id: usize,
    rx: Receiver<PipelineEvent>,
    registry: Arc<SubscriberRegistry>,
    stats: Arc<DeliveryStats>,
    closing: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
}

impl Worker {
    const IDLE_POLL: Duration = Duration::from_millis(20);

    fn run(&self) {
        log::debug!("Delivery worker {} started", self.id);
        let mut delivered = 0_u64;

        loop {
            if self.cancel.load(Ordering::Acquire) {
                let discarded = self.rx.try_iter().count() as u64;
                self.stats
                    .events_discarded
                    .fetch_add(discarded, Ordering::Relaxed);
                break;
            }

            match self.rx.recv_timeout(Self::IDLE_POLL) {
                Ok(event) => {
                    if self.cancel.load(Ordering::Acquire) {
                        self.stats.events_discarded.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    self.deliver(&event);
                    delivered += 1;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.closing.load(Ordering::Acquire) && self.rx.is_empty() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        log::debug!(
            "Delivery worker {} stopped after {} events",
            self.id,
            delivered
        );
    }

    fn deliver(&self, event: &PipelineEvent) {
        for subscriber in self.registry.snapshot(event.kind()) {
            match &subscriber.sink {
                Sink::Callback(callback) => {
                    match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                        Ok(()) => {
                            self.stats.deliveries.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(panic) => {
                            self.stats.subscriber_panics.fetch_add(1, Ordering::Relaxed);
                            log::error!(
                                "Subscriber {} panicked on {:?} event: {}",
                                subscriber.id,
                                event.kind(),
                                panic_message(panic.as_ref())
                            );
                        }
                    }
                }
                Sink::Channel(tx) => match tx.try_send(event.clone()) {
                    Ok(()) => {
                        self.stats.deliveries.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Full(_)) => {
                        self.stats
                            .subscriber_overflows
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        log::debug!("Channel subscriber {} went away", subscriber.id);
                        self.registry.unsubscribe(subscriber.id);
                    }
                },
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Frame;
    use crate::test_util::wait_until;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn frame_event(tag_id: u8, distance_mm: i32) -> PipelineEvent {
        PipelineEvent::Frame(Frame::measurement(1, tag_id, distance_mm, 0))
    }

    #[test]
    fn test_registry_masks() {
        let registry = SubscriberRegistry::new();
        assert!(!registry.wants(EventKind::Frame));

        let id = registry.subscribe_fn(&[EventKind::Track], |_| {});
        let (_, _rx) = registry.subscribe_channel(&[EventKind::Global], 4);
        assert!(registry.wants(EventKind::Track));
        assert!(registry.wants(EventKind::Global));
        assert!(!registry.wants(EventKind::Frame));

        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        assert!(!registry.wants(EventKind::Track));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_per_tag_order_is_preserved() {
        let registry = Arc::new(SubscriberRegistry::new());
        let (_, rx) = registry.subscribe_channel(&EventKind::ALL, 1024);
        let mut pool = DeliveryPool::new(3, 256, Arc::clone(&registry)).unwrap();
        assert_eq!(pool.num_workers(), 3);
        let dispatcher = pool.dispatcher();

        for i in 0..100 {
            assert!(dispatcher.dispatch(frame_event((i % 5) as u8, i)));
        }
        assert!(wait_until(Duration::from_secs(2), || rx.len() == 100));
        pool.shutdown(Duration::from_secs(1));

        let mut last = [-1i32; 5];
        for event in rx.try_iter() {
            match event {
                PipelineEvent::Frame(frame) => {
                    let slot = &mut last[frame.tag_id as usize];
                    assert!(frame.distance_mm > *slot);
                    *slot = frame.distance_mm;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn test_full_queue_drops_instead_of_blocking() {
        let registry = Arc::new(SubscriberRegistry::new());
        let (release_tx, release_rx) = bounded::<()>(0);
        registry.subscribe_fn(&EventKind::ALL, move |_| {
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        });
        let mut pool = DeliveryPool::new(1, 2, Arc::clone(&registry)).unwrap();
        let dispatcher = pool.dispatcher();

        let started = Instant::now();
        let accepted = (0..50).filter(|&i| dispatcher.dispatch(frame_event(0, i))).count();
        assert!(started.elapsed() < Duration::from_millis(100));

        // One event in the callback, two queued
        assert!(accepted <= 3);
        assert!(pool.counters().events_dropped >= 47);

        drop(release_tx);
        pool.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let registry = Arc::new(SubscriberRegistry::new());
        registry.subscribe_fn(&EventKind::ALL, |event| {
            if event.tag_id() == 0 {
                panic!("subscriber bug");
            }
        });
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        registry.subscribe_fn(&EventKind::ALL, move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        let mut pool = DeliveryPool::new(1, 16, Arc::clone(&registry)).unwrap();
        let dispatcher = pool.dispatcher();
        for i in 0..4 {
            dispatcher.dispatch(frame_event(0, i));
        }
        assert!(wait_until(Duration::from_secs(2), || seen.load(Ordering::Relaxed) == 4));
        let report = pool.shutdown(Duration::from_secs(1));

        assert_eq!(pool.counters().subscriber_panics, 4);
        assert_eq!(report.workers_detached, 0);
    }

    #[test]
    fn test_shutdown_detaches_stuck_worker() {
        let registry = Arc::new(SubscriberRegistry::new());
        let entered = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&entered);
        let (release_tx, release_rx) = bounded::<()>(0);
        registry.subscribe_fn(&EventKind::ALL, move |_| {
            flag.store(true, Ordering::Release);
            let _ = release_rx.recv_timeout(Duration::from_secs(10));
        });

        let mut pool = DeliveryPool::new(1, 8, Arc::clone(&registry)).unwrap();
        let dispatcher = pool.dispatcher();
        for i in 0..5 {
            dispatcher.dispatch(frame_event(0, i));
        }
        assert!(wait_until(Duration::from_secs(2), || entered.load(Ordering::Acquire)));

        let started = Instant::now();
        let report = pool.shutdown(Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(report.workers_detached, 1);
        assert!(!dispatcher.dispatch(frame_event(0, 99)));

        // Unblock the worker; it throws away the rest of its queue
        drop(release_tx);
        assert!(wait_until(Duration::from_secs(2), || pool.counters().events_discarded == 4));
    }

    #[test]
    fn test_pool_has_at_least_one_worker() {
        let registry = Arc::new(SubscriberRegistry::new());
        let mut pool = DeliveryPool::new(0, 0, Arc::clone(&registry)).unwrap();
        assert_eq!(pool.num_workers(), 1);
        assert!(pool.dispatcher().dispatch(frame_event(200, 1)));
        assert_eq!(pool.shutdown(Duration::from_secs(1)).workers_joined, 1);
    }

    #[test]
    fn test_dropped_channel_subscriber_is_removed() {
        let registry = Arc::new(SubscriberRegistry::new());
        let (_, rx) = registry.subscribe_channel(&EventKind::ALL, 4);
        drop(rx);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        registry.subscribe_fn(&[EventKind::Frame], move |event| sink.lock().push(event.tag_id()));

        let mut pool = DeliveryPool::new(2, 8, Arc::clone(&registry)).unwrap();
        pool.dispatcher().dispatch(frame_event(3, 1));
        assert!(wait_until(Duration::from_secs(2), || received.lock().len() == 1));
        pool.shutdown(Duration::from_secs(1));

        assert_eq!(registry.len(), 1);
    }
}
