use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use domain::error::AuditError;
use domain::event::AuditEvent;
use domain::query::{EventFilter, QuerySummary};
use ports::secondary::event_sink::{EventSink, MatchHandler};

/// Buffering behavior of a [`BufferedSink`].
#[derive(Debug, Clone)]
pub struct BufferingPolicy {
    /// When false the wrapper is a pass-through.
    pub enabled: bool,
    /// Flush when the queue reaches this many events.
    pub max_size: usize,
    /// Flush this long after the first queued event, even below `max_size`.
    /// `Duration::ZERO` disables the time trigger.
    pub max_time: Duration,
    /// When true, `publish` never blocks on the downstream sink; when
    /// false, every `publish` also drains the backlog synchronously.
    pub autoflush: bool,
}

impl Default for BufferingPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size: 1000,
            max_time: Duration::from_millis(100),
            autoflush: true,
        }
    }
}

struct QueueState {
    queue: VecDeque<(String, AuditEvent)>,
    /// Enqueue time of the oldest undelivered event; drives the time trigger.
    first_enqueued_at: Option<Instant>,
    stopped: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    wakeup: Condvar,
    /// Serializes batch dispatch: at most one flush is in flight.
    flush_gate: Mutex<()>,
}

/// Decorates any sink with a bounded, asynchronously flushed queue.
///
/// `publish` enqueues and returns immediately (the event id is assigned
/// upstream by the service). A single background flusher drains the queue
/// when `max_size` or `max_time` is reached; events are dispatched
/// downstream in enqueue order. A downstream failure drops the remainder
/// of the in-flight batch but does not poison the queue. On shutdown the
/// wrapper stops accepting publishes, drains synchronously, then shuts
/// the downstream sink.
pub struct BufferedSink {
    inner: Arc<dyn EventSink>,
    policy: BufferingPolicy,
    shared: Arc<Shared>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedSink {
    pub fn new(inner: Arc<dyn EventSink>, policy: BufferingPolicy) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                first_enqueued_at: None,
                stopped: false,
            }),
            wakeup: Condvar::new(),
            flush_gate: Mutex::new(()),
        });

        let flusher = if policy.enabled {
            let shared = Arc::clone(&shared);
            let inner = Arc::clone(&inner);
            let policy = policy.clone();
            let handle = std::thread::Builder::new()
                .name("audit-buffer-flush".to_string())
                .spawn(move || flusher_loop(&shared, inner.as_ref(), &policy))
                .expect("failed to spawn buffer flusher thread");
            Some(handle)
        } else {
            None
        };

        Self {
            inner,
            policy,
            shared,
            flusher: Mutex::new(flusher),
        }
    }

    /// Drain the whole backlog on the calling thread.
    ///
    /// The flush gate is taken before the queue so that two concurrent
    /// drains cannot dispatch batches out of enqueue order.
    fn drain_now(&self) {
        let _gate = self.shared.flush_gate.lock();
        loop {
            let batch = {
                let mut state = match self.shared.state.lock() {
                    Ok(state) => state,
                    Err(_) => return,
                };
                state.first_enqueued_at = None;
                if state.queue.is_empty() {
                    return;
                }
                std::mem::take(&mut state.queue)
            };
            dispatch_batch(self.inner.as_ref(), batch);
        }
    }
}

impl EventSink for BufferedSink {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn startup(&self) -> Result<(), AuditError> {
        self.inner.startup()
    }

    fn shutdown(&self) -> Result<(), AuditError> {
        if !self.policy.enabled {
            return self.inner.shutdown();
        }

        {
            let mut state = self
                .shared
                .state
                .lock()
                .map_err(|_| AuditError::Internal("buffer lock poisoned".into()))?;
            state.stopped = true;
            self.shared.wakeup.notify_all();
        }

        if let Ok(mut flusher) = self.flusher.lock()
            && let Some(handle) = flusher.take()
            && handle.join().is_err()
        {
            tracing::warn!("buffer flusher thread panicked");
        }

        // The flusher exits without draining once stopped; finish the
        // backlog synchronously before shutting the downstream sink.
        self.drain_now();
        self.inner.shutdown()
    }

    fn publish(&self, topic: &str, event: &AuditEvent) -> Result<(), AuditError> {
        if !self.policy.enabled {
            return self.inner.publish(topic, event);
        }

        {
            let mut state = self
                .shared
                .state
                .lock()
                .map_err(|_| AuditError::Internal("buffer lock poisoned".into()))?;
            if state.stopped {
                return Err(AuditError::Unavailable("buffered sink is shut down".into()));
            }
            state.queue.push_back((topic.to_string(), event.clone()));
            if state.first_enqueued_at.is_none() {
                state.first_enqueued_at = Some(Instant::now());
            }
            self.shared.wakeup.notify_all();
        }

        if !self.policy.autoflush {
            self.drain_now();
        }
        Ok(())
    }

    fn read(&self, topic: &str, id: &str) -> Result<AuditEvent, AuditError> {
        // Reads see the downstream state; queued events are not yet visible.
        self.inner.read(topic, id)
    }

    fn query(
        &self,
        topic: &str,
        filter: &EventFilter,
        on_match: &mut MatchHandler<'_>,
    ) -> Result<QuerySummary, AuditError> {
        self.inner.query(topic, filter, on_match)
    }
}

fn flusher_loop(shared: &Shared, inner: &dyn EventSink, policy: &BufferingPolicy) {
    loop {
        // Wait phase: hold only the queue lock until a trigger fires.
        {
            let mut state = match shared.state.lock() {
                Ok(state) => state,
                Err(_) => return,
            };
            loop {
                if state.stopped {
                    return;
                }
                if state.queue.len() >= policy.max_size {
                    break;
                }
                let deadline = match (policy.max_time.is_zero(), state.first_enqueued_at) {
                    (false, Some(first)) => Some(first + policy.max_time),
                    _ => None,
                };
                match deadline {
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        state = match shared.wakeup.wait_timeout(state, deadline - now) {
                            Ok((state, _)) => state,
                            Err(_) => return,
                        };
                    }
                    None => {
                        state = match shared.wakeup.wait(state) {
                            Ok(state) => state,
                            Err(_) => return,
                        };
                    }
                }
            }
        }

        // Flush phase: gate first, then take the batch, so a synchronous
        // drain racing this thread cannot reorder batches.
        let _gate = shared.flush_gate.lock();
        let batch = {
            let mut state = match shared.state.lock() {
                Ok(state) => state,
                Err(_) => return,
            };
            state.first_enqueued_at = None;
            std::mem::take(&mut state.queue)
        };
        if !batch.is_empty() {
            dispatch_batch(inner, batch);
        }
    }
}

/// Deliver a batch downstream in enqueue order. A failure drops the
/// remainder of the batch; subsequent batches are unaffected.
fn dispatch_batch(inner: &dyn EventSink, mut batch: VecDeque<(String, AuditEvent)>) {
    while let Some((topic, event)) = batch.pop_front() {
        if let Err(e) = inner.publish(&topic, &event) {
            tracing::warn!(
                sink = %inner.name(),
                topic = %topic,
                dropped = batch.len() + 1,
                error = %e,
                "buffered flush failed; dropping remainder of batch"
            );
            return;
        }
    }
}
