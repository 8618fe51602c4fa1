//! Shared test doubles for the secondary ports.
//!
//! Available to other crates' tests through the `test-utils` feature.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use domain::error::AuditError;
use domain::event::AuditEvent;
use domain::query::{EventFilter, QueryFlow, QuerySummary};

use crate::secondary::event_sink::{EventSink, MatchHandler};
use crate::secondary::key_store::{ENTRY_INITIAL_KEY, KeyStore};
use crate::secondary::scheduler::{ScheduledTask, Scheduler};

// ── Key store ──────────────────────────────────────────────────────

/// In-memory key store seeded with an initial key and one keypair.
///
/// The keypair is stored as raw bytes; tests that need a usable signing
/// identity generate it with their crypto crate and pass both halves in.
pub struct MemoryKeyStore {
    secrets: Mutex<BTreeMap<String, Vec<u8>>>,
    signing_seed: [u8; 32],
    verifying_key: [u8; 32],
}

impl MemoryKeyStore {
    pub fn new(initial_key: &[u8], signing_seed: [u8; 32], verifying_key: [u8; 32]) -> Self {
        let mut secrets = BTreeMap::new();
        secrets.insert(ENTRY_INITIAL_KEY.to_string(), initial_key.to_vec());
        Self {
            secrets: Mutex::new(secrets),
            signing_seed,
            verifying_key,
        }
    }

    /// Current bytes stored under `alias`, for assertions.
    pub fn secret(&self, alias: &str) -> Option<Vec<u8>> {
        self.secrets.lock().unwrap().get(alias).cloned()
    }

    pub fn remove_secret(&self, alias: &str) {
        self.secrets.lock().unwrap().remove(alias);
    }
}

impl KeyStore for MemoryKeyStore {
    fn read_secret(&self, alias: &str) -> Result<Option<Vec<u8>>, AuditError> {
        Ok(self.secrets.lock().unwrap().get(alias).cloned())
    }

    fn write_secret(&self, alias: &str, secret: &[u8]) -> Result<(), AuditError> {
        self.secrets
            .lock()
            .unwrap()
            .insert(alias.to_string(), secret.to_vec());
        Ok(())
    }

    fn read_signing_key(&self, _alias: &str) -> Result<[u8; 32], AuditError> {
        Ok(self.signing_seed)
    }

    fn read_verifying_key(&self, _alias: &str) -> Result<[u8; 32], AuditError> {
        Ok(self.verifying_key)
    }
}

/// Key store whose writes fail, for exercising fatal-write paths.
pub struct FailingKeyStore {
    inner: MemoryKeyStore,
    fail_writes: AtomicBool,
}

impl FailingKeyStore {
    pub fn new(inner: MemoryKeyStore) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl KeyStore for FailingKeyStore {
    fn read_secret(&self, alias: &str) -> Result<Option<Vec<u8>>, AuditError> {
        self.inner.read_secret(alias)
    }

    fn write_secret(&self, alias: &str, secret: &[u8]) -> Result<(), AuditError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AuditError::KeyStore("simulated write failure".into()));
        }
        self.inner.write_secret(alias, secret)
    }

    fn read_signing_key(&self, alias: &str) -> Result<[u8; 32], AuditError> {
        self.inner.read_signing_key(alias)
    }

    fn read_verifying_key(&self, alias: &str) -> Result<[u8; 32], AuditError> {
        self.inner.read_verifying_key(alias)
    }
}

// ── Scheduler ──────────────────────────────────────────────────────

type TaskFn = Box<dyn FnOnce() + Send>;

struct ManualEntry {
    delay: Duration,
    /// `Some` while the task is still armed; taken on fire or cancel.
    cell: Mutex<Option<TaskFn>>,
    done: AtomicBool,
    cancelled: AtomicBool,
}

/// Scheduler that never fires on its own; tests pump it explicitly.
#[derive(Default)]
pub struct ManualScheduler {
    tasks: Mutex<Vec<Arc<ManualEntry>>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the oldest still-armed task. Returns `false` when none is armed.
    pub fn fire_next(&self) -> bool {
        let task = {
            let tasks = self.tasks.lock().unwrap();
            tasks.iter().find_map(|entry| {
                entry
                    .cell
                    .lock()
                    .unwrap()
                    .take()
                    .map(|f| (Arc::clone(entry), f))
            })
        };
        match task {
            Some((entry, f)) => {
                // Run outside the registry lock: the task may re-enter the
                // scheduler (e.g. the writer re-arming after a signature).
                f();
                entry.done.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Number of armed (not yet fired or cancelled) tasks.
    pub fn armed(&self) -> usize {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.cell.lock().unwrap().is_some())
            .count()
    }

    /// Total `schedule` calls observed.
    pub fn scheduled_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Delay requested for the most recent `schedule` call.
    pub fn last_delay(&self) -> Option<Duration> {
        self.tasks.lock().unwrap().last().map(|entry| entry.delay)
    }
}

struct ManualHandle(Arc<ManualEntry>);

impl ScheduledTask for ManualHandle {
    fn cancel(&self) -> bool {
        if self.0.cell.lock().unwrap().take().is_some() {
            self.0.cancelled.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    fn is_done(&self) -> bool {
        self.0.done.load(Ordering::SeqCst) || self.0.cancelled.load(Ordering::SeqCst)
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: TaskFn) -> Box<dyn ScheduledTask> {
        let entry = Arc::new(ManualEntry {
            delay,
            cell: Mutex::new(Some(task)),
            done: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        });
        self.tasks.lock().unwrap().push(Arc::clone(&entry));
        Box::new(ManualHandle(entry))
    }
}

// ── Event sink ─────────────────────────────────────────────────────

/// Sink that records every publish and serves reads/queries from memory.
pub struct RecordingSink {
    name: String,
    events: Mutex<Vec<(String, AuditEvent)>>,
    startup_calls: AtomicU32,
    shutdown_calls: AtomicU32,
    fail_publish: AtomicBool,
    fail_startup: AtomicBool,
}

impl RecordingSink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            events: Mutex::new(Vec::new()),
            startup_calls: AtomicU32::new(0),
            shutdown_calls: AtomicU32::new(0),
            fail_publish: AtomicBool::new(false),
            fail_startup: AtomicBool::new(false),
        }
    }

    pub fn published(&self) -> Vec<(String, AuditEvent)> {
        self.events.lock().unwrap().clone()
    }

    pub fn published_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn startup_calls(&self) -> u32 {
        self.startup_calls.load(Ordering::SeqCst)
    }

    pub fn shutdown_calls(&self) -> u32 {
        self.shutdown_calls.load(Ordering::SeqCst)
    }

    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn fail_startup(&self, fail: bool) {
        self.fail_startup.store(fail, Ordering::SeqCst);
    }
}

impl EventSink for RecordingSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn startup(&self) -> Result<(), AuditError> {
        self.startup_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_startup.load(Ordering::SeqCst) {
            return Err(AuditError::Internal("simulated startup failure".into()));
        }
        Ok(())
    }

    fn shutdown(&self) -> Result<(), AuditError> {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn publish(&self, topic: &str, event: &AuditEvent) -> Result<(), AuditError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(AuditError::Io("simulated publish failure".into()));
        }
        self.events
            .lock()
            .unwrap()
            .push((topic.to_string(), event.clone()));
        Ok(())
    }

    fn read(&self, topic: &str, id: &str) -> Result<AuditEvent, AuditError> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|(t, e)| t == topic && e.id() == Some(id))
            .map(|(_, e)| e.clone())
            .ok_or_else(|| AuditError::NotFound(format!("no event '{id}' in topic '{topic}'")))
    }

    fn query(
        &self,
        topic: &str,
        filter: &EventFilter,
        on_match: &mut MatchHandler<'_>,
    ) -> Result<QuerySummary, AuditError> {
        let mut summary = QuerySummary::default();
        for (t, event) in self.events.lock().unwrap().iter() {
            if t == topic && filter.matches(event) {
                summary.matched += 1;
                if on_match(event.clone()) == QueryFlow::Stop {
                    break;
                }
            }
        }
        Ok(summary)
    }
}
