//! Queue consumers and the per-message dispatch pipeline.
//!
//! Each bound queue gets one dedicated OS thread for the lifetime of the
//! process:
//!
//! ```text
//! Idle → Declared → Subscribed → (Receiving ⇄ Dispatching) → Closed
//! ```
//!
//! Per message the worker decodes the envelope, decodes the typed payload for
//! the event name, consults the optional dedup filter and calls the registered
//! handler. Bad messages are logged and dropped; the worker keeps going.
//! Messages are auto-acknowledged, so anything dropped here is gone.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::bus::{BrokerError, Delivery, MessageBroker, Subscription};
use crate::dedup::DedupFilter;
use crate::envelope::Envelope;
use crate::event::DomainEvent;
use crate::handler::{EventMeta, HandlerRegistry};
use crate::topology::{Topology, TopologyError};

/// Lifecycle of a single queue worker.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Idle,
    Declared,
    Subscribed,
    Receiving,
    Dispatching,
    Closed,
}

/// Per-queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub received: u64,
    pub dispatched: u64,
    pub handler_failures: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub unhandled: u64,
}

/// What happened to one delivery.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handler ran and returned `Ok`.
    Dispatched,
    /// Handler ran and returned `Err` (logged, not retried).
    HandlerFailed,
    /// Dedup filter had already seen these bytes.
    Duplicate,
    /// Envelope or payload failed to decode.
    Malformed,
    /// No handler registered for the event name.
    Unhandled,
}

impl WorkerStats {
    fn record(&mut self, outcome: DispatchOutcome) {
        self.received += 1;
        match outcome {
            DispatchOutcome::Dispatched => self.dispatched += 1,
            DispatchOutcome::HandlerFailed => self.handler_failures += 1,
            DispatchOutcome::Duplicate => self.duplicates += 1,
            DispatchOutcome::Malformed => self.malformed += 1,
            DispatchOutcome::Unhandled => self.unhandled += 1,
        }
    }
}

/// Decode → dedup → handler, for a single queue.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    queue: String,
    handlers: Arc<HandlerRegistry>,
    dedup: Option<DedupFilter>,
}

impl Dispatcher {
    pub fn new(
        queue: impl Into<String>,
        handlers: Arc<HandlerRegistry>,
        dedup: Option<DedupFilter>,
    ) -> Self {
        Self {
            queue: queue.into(),
            handlers,
            dedup,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn dispatch(&self, delivery: &Delivery) -> DispatchOutcome {
        let queue = self.queue.as_str();

        let envelope = match Envelope::<JsonValue>::from_slice(&delivery.body) {
            Ok(env) => env,
            Err(err) => {
                warn!(queue, routing_key = %delivery.routing_key, error = %err, "dropping malformed message");
                return DispatchOutcome::Malformed;
            }
        };

        let Some(handler) = self.handlers.get(envelope.event()) else {
            warn!(queue, event = envelope.event(), "no handler registered; dropping message");
            return DispatchOutcome::Unhandled;
        };

        let envelope = match envelope.try_map_data(DomainEvent::decode) {
            Ok(env) => env,
            Err(err) => {
                warn!(queue, error = %err, "dropping message with invalid payload");
                return DispatchOutcome::Malformed;
            }
        };
        let event = envelope.event();

        if let Some(dedup) = &self.dedup {
            if dedup.is_duplicate(event, &delivery.body) {
                info!(queue, event, "skipping duplicate event");
                return DispatchOutcome::Duplicate;
            }
        }

        debug!(queue, event, "received event");
        let meta = EventMeta {
            event,
            timestamp: envelope.timestamp(),
            queue,
        };
        match handler(envelope.data(), &meta) {
            Ok(()) => DispatchOutcome::Dispatched,
            Err(err) => {
                warn!(queue, event, error = ?err, "event handler failed");
                DispatchOutcome::HandlerFailed
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("failed to subscribe to {queue}: {source}")]
    Subscribe {
        queue: String,
        #[source]
        source: BrokerError,
    },

    #[error("failed to spawn worker for {queue}: {source}")]
    Spawn {
        queue: String,
        #[source]
        source: std::io::Error,
    },
}

/// Declares a service's topology and runs one worker per queue.
#[derive(Debug)]
pub struct Consumer {
    topology: Topology,
    handlers: Arc<HandlerRegistry>,
    dedup: Option<DedupFilter>,
    tick: Duration,
}

impl Consumer {
    pub fn new(topology: Topology, handlers: HandlerRegistry) -> Self {
        Self {
            topology,
            handlers: Arc::new(handlers),
            dedup: None,
            tick: Duration::from_millis(250),
        }
    }

    /// Enable duplicate suppression for every queue of this consumer.
    pub fn with_dedup(mut self, filter: DedupFilter) -> Self {
        self.dedup = Some(filter);
        self
    }

    /// How often idle workers check for a shutdown request.
    pub fn with_shutdown_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Declare the topology, subscribe every queue, then spawn the workers.
    ///
    /// Any failure before the first worker runs is returned and nothing keeps
    /// consuming: a half-built topology never serves traffic.
    pub fn start<B>(self, broker: &B) -> Result<ConsumerHandle, ConsumerError>
    where
        B: MessageBroker + ?Sized,
    {
        let monitors: Vec<(String, QueueMonitor)> = self
            .topology
            .queues()
            .map(|q| (q.to_string(), QueueMonitor::new()))
            .collect();

        self.topology.declare(broker)?;
        for (_, monitor) in &monitors {
            monitor.set(QueueState::Declared);
        }

        let mut subscriptions = Vec::with_capacity(monitors.len());
        for (queue, monitor) in monitors {
            let sub = match broker.consume(&queue) {
                Ok(sub) => sub,
                Err(source) => {
                    // Auto-ack consumers left registered would swallow messages.
                    for (taken, _, sub) in subscriptions {
                        if let Err(e) = broker.cancel(sub) {
                            warn!(queue = %taken, error = %e, "failed to cancel subscription");
                        }
                    }
                    return Err(ConsumerError::Subscribe { queue, source });
                }
            };
            monitor.set(QueueState::Subscribed);
            subscriptions.push((queue, monitor, sub));
        }

        let mut workers = Vec::with_capacity(subscriptions.len());
        for (queue, monitor, sub) in subscriptions {
            let dispatcher = Dispatcher::new(queue.clone(), self.handlers.clone(), self.dedup.clone());
            match QueueWorker::spawn(dispatcher, sub, monitor, self.tick) {
                Ok(worker) => workers.push(worker),
                Err(source) => {
                    let handle = ConsumerHandle { workers };
                    handle.shutdown();
                    return Err(ConsumerError::Spawn { queue, source });
                }
            }
        }

        info!(
            queues = workers.len(),
            dedup = self.dedup.is_some(),
            "consumer started"
        );
        Ok(ConsumerHandle { workers })
    }
}

#[derive(Debug, Clone)]
struct QueueMonitor {
    state: Arc<Mutex<QueueState>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl QueueMonitor {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::Idle)),
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    fn set(&self, state: QueueState) {
        if let Ok(mut s) = self.state.lock() {
            *s = state;
        }
    }

    fn state(&self) -> QueueState {
        self.state.lock().map(|s| *s).unwrap_or(QueueState::Closed)
    }

    fn record(&self, outcome: DispatchOutcome) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.record(outcome);
        }
    }

    fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Handle to one running queue worker.
#[derive(Debug)]
struct QueueWorker {
    queue: String,
    monitor: QueueMonitor,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl QueueWorker {
    fn spawn(
        dispatcher: Dispatcher,
        sub: Subscription,
        monitor: QueueMonitor,
        tick: Duration,
    ) -> std::io::Result<Self> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let queue = dispatcher.queue().to_string();
        let worker_monitor = monitor.clone();

        let join = thread::Builder::new()
            .name(format!("consumer:{queue}"))
            .spawn(move || worker_loop(dispatcher, sub, shutdown_rx, worker_monitor, tick))?;

        Ok(Self {
            queue,
            monitor,
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }

    fn request_shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    fn join(&mut self) {
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                warn!(queue = %self.queue, "queue worker panicked");
                self.monitor.set(QueueState::Closed);
            }
        }
    }
}

fn worker_loop(
    dispatcher: Dispatcher,
    sub: Subscription,
    shutdown_rx: mpsc::Receiver<()>,
    monitor: QueueMonitor,
    tick: Duration,
) {
    let queue = dispatcher.queue();
    info!(queue, "consuming");

    loop {
        // Shutdown check (non-blocking)
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        monitor.set(QueueState::Receiving);
        match sub.recv_timeout(tick) {
            Ok(delivery) => {
                monitor.set(QueueState::Dispatching);
                let outcome = dispatcher.dispatch(&delivery);
                monitor.record(outcome);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    monitor.set(QueueState::Closed);
    info!(queue, "queue worker stopped");
}

/// Running consumer: one worker per queue.
#[derive(Debug)]
pub struct ConsumerHandle {
    workers: Vec<QueueWorker>,
}

impl ConsumerHandle {
    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.workers.iter().map(|w| w.queue.as_str())
    }

    pub fn state(&self, queue: &str) -> Option<QueueState> {
        self.worker(queue).map(|w| w.monitor.state())
    }

    pub fn stats(&self, queue: &str) -> Option<WorkerStats> {
        self.worker(queue).map(|w| w.monitor.stats())
    }

    fn worker(&self, queue: &str) -> Option<&QueueWorker> {
        self.workers.iter().find(|w| w.queue == queue)
    }

    /// Stop every worker and wait for them. In-flight messages are not requeued.
    pub fn shutdown(mut self) {
        for w in &self.workers {
            w.request_shutdown();
        }
        for w in &mut self.workers {
            w.join();
        }
    }

    /// Wait for every worker to stop on its own (e.g. after the broker closed).
    pub fn join(mut self) {
        for w in &mut self.workers {
            w.join();
        }
    }
}
