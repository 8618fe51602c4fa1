//! The tamper-evident CSV writer.
//!
//! Appends event rows with a trailing MAC cell, persists the evolving
//! chain secret to the key store after every row, and periodically seals
//! the chain with a signature row. All mutations of chain state, the file
//! handle, and the signature task handle happen under one exclusive lock;
//! within one writer, rows appear in the file in lock acquisition order.
//!
//! A failed append or key-store write is fatal: the in-memory chain must
//! not advance past what is durably recorded, so the writer closes itself
//! and every later operation fails until the sink is rebuilt.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use domain::error::AuditError;
use domain::event::AuditEvent;
use ports::secondary::key_store::{
    ENTRY_CURRENT_KEY, ENTRY_CURRENT_SIGNATURE, ENTRY_INITIAL_KEY, ENTRY_SIGNATURE, KeyStore,
};
use ports::secondary::scheduler::{ScheduledTask, Scheduler};

use super::chain::HmacChain;
use super::codec::{self, HEADER_MAC, HEADER_SIGNATURE};
use super::sign::RowSigner;

pub struct SecureCsvWriter {
    shared: Arc<WriterShared>,
}

impl std::fmt::Debug for SecureCsvWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureCsvWriter").finish()
    }
}

struct WriterShared {
    path: PathBuf,
    key_store: Arc<dyn KeyStore>,
    scheduler: Arc<dyn Scheduler>,
    signature_interval: Duration,
    signer: RowSigner,
    state: Mutex<WriterState>,
}

struct WriterState {
    file: Option<BufWriter<File>>,
    chain: HmacChain,
    last_mac: Option<String>,
    /// Raw bytes of the most recent signature row; empty before the first.
    last_signature: Vec<u8>,
    /// Schema fields, without the two trailing columns.
    header: Option<Vec<String>>,
    pending_signature: Option<Box<dyn ScheduledTask>>,
    /// A data row has been appended since the last signature row.
    unsealed: bool,
    closed: bool,
}

impl SecureCsvWriter {
    /// Open a writer for a fresh log file.
    ///
    /// The chain starts from the `InitialKey` entry; the writer seeds
    /// `CurrentKey` with it before the first row so a crash between rows
    /// resumes a well-defined prefix. The header is not written until
    /// [`SecureCsvWriter::write_header`].
    pub fn create(
        path: &Path,
        key_store: Arc<dyn KeyStore>,
        scheduler: Arc<dyn Scheduler>,
        signature_interval: Duration,
    ) -> Result<Self, AuditError> {
        let key = key_store
            .read_secret(ENTRY_INITIAL_KEY)?
            .ok_or_else(|| {
                AuditError::KeyStore(format!(
                    "expected an {ENTRY_INITIAL_KEY} entry in the key store"
                ))
            })?;
        key_store.write_secret(ENTRY_CURRENT_KEY, &key)?;

        Self::open(
            path, key_store, scheduler, signature_interval, key, None, Vec::new(), None,
        )
    }

    /// Open a writer that continues an existing, verified log.
    ///
    /// The caller (the CSV sink) verifies the file first and passes the
    /// replayed chain position; the chain secret resumes from the
    /// `CurrentKey` entry rather than `InitialKey`.
    pub fn resume(
        path: &Path,
        key_store: Arc<dyn KeyStore>,
        scheduler: Arc<dyn Scheduler>,
        signature_interval: Duration,
        fields: Vec<String>,
        last_mac: Option<String>,
        last_signature: Vec<u8>,
    ) -> Result<Self, AuditError> {
        let key = key_store.read_secret(ENTRY_CURRENT_KEY)?.ok_or_else(|| {
            AuditError::KeyStore(format!(
                "resuming an existing log but there is no {ENTRY_CURRENT_KEY} entry"
            ))
        })?;

        Self::open(
            path,
            key_store,
            scheduler,
            signature_interval,
            key,
            Some(fields),
            last_signature,
            last_mac,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn open(
        path: &Path,
        key_store: Arc<dyn KeyStore>,
        scheduler: Arc<dyn Scheduler>,
        signature_interval: Duration,
        key: Vec<u8>,
        header: Option<Vec<String>>,
        last_signature: Vec<u8>,
        last_mac: Option<String>,
    ) -> Result<Self, AuditError> {
        let seed = key_store.read_signing_key(ENTRY_SIGNATURE)?;
        let signer = RowSigner::from_seed(seed);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| AuditError::Io(format!("cannot open {}: {e}", path.display())))?;

        Ok(Self {
            shared: Arc::new(WriterShared {
                path: path.to_path_buf(),
                key_store,
                scheduler,
                signature_interval,
                signer,
                state: Mutex::new(WriterState {
                    file: Some(BufWriter::new(file)),
                    chain: HmacChain::new(&key),
                    last_mac,
                    last_signature,
                    header,
                    pending_signature: None,
                    unsealed: false,
                    closed: false,
                }),
            }),
        })
    }

    /// Emit the header row: the schema fields plus `HMAC` and `SIGNATURE`.
    /// Called once per file, before the first event.
    pub fn write_header(&self, fields: &[String]) -> Result<(), AuditError> {
        let mut state = self.shared.lock()?;
        if state.closed {
            return Err(AuditError::Io("writer is closed".into()));
        }
        if state.header.is_some() {
            return Err(AuditError::Internal("header already written".into()));
        }

        let mut row = fields.to_vec();
        row.push(HEADER_MAC.to_string());
        row.push(HEADER_SIGNATURE.to_string());
        if let Err(e) = append_row(&mut state, &row) {
            poison(&mut state);
            return Err(e);
        }
        state.header = Some(fields.to_vec());
        Ok(())
    }

    /// Append one data row: schema cells, the chain MAC, an empty
    /// signature cell. Persists the ratcheted secret before committing it
    /// in memory, then arms the signature timer if none is pending.
    pub fn write(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let mut state = self.shared.lock()?;
        if state.closed {
            return Err(AuditError::Io("writer is closed".into()));
        }
        let Some(fields) = state.header.clone() else {
            return Err(AuditError::Internal("write called before write_header".into()));
        };

        let cells = codec::canonical_cells(&fields, event);
        let (mac_b64, next_key) = match state.chain.mac(&cells) {
            Ok(result) => result,
            Err(e) => {
                poison(&mut state);
                return Err(e);
            }
        };

        let mut row = cells;
        row.push(mac_b64.clone());
        row.push(String::new());
        if let Err(e) = append_row(&mut state, &row) {
            poison(&mut state);
            return Err(e);
        }

        if let Err(e) = self
            .shared
            .key_store
            .write_secret(ENTRY_CURRENT_KEY, &next_key)
        {
            // The file and the key store now disagree; a later writer
            // resuming from CurrentKey would fork the chain.
            poison(&mut state);
            return Err(e);
        }

        state.chain.advance(next_key);
        state.last_mac = Some(mac_b64);
        state.unsealed = true;
        self.arm_signature(&mut state);
        Ok(())
    }

    /// Force pending file I/O to the OS.
    pub fn flush(&self) -> Result<(), AuditError> {
        let mut state = self.shared.lock()?;
        match state.file.as_mut() {
            Some(file) => {
                if let Err(e) = file.flush() {
                    poison(&mut state);
                    return Err(e.into());
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Cancel any pending signature task, seal the tail if a data row
    /// landed after the last signature row, and close the file.
    ///
    /// Idempotent: a second call does nothing and never emits a second
    /// signature. A signature task that already started racing this call
    /// finds the writer closed and becomes a no-op.
    pub fn close(&self) -> Result<(), AuditError> {
        let mut state = self.shared.lock()?;
        if state.closed {
            return Ok(());
        }

        if let Some(task) = state.pending_signature.take() {
            task.cancel();
        }
        if state.unsealed {
            write_signature_locked(&self.shared, &mut state)?;
        }
        if let Some(mut file) = state.file.take() {
            file.flush()
                .map_err(|e| AuditError::Io(format!("flush on close failed: {e}")))?;
        }
        state.closed = true;
        Ok(())
    }

    /// Arm the signature timer. Idempotent within a window: while a task
    /// is scheduled or running, further writes do not re-arm, so a burst
    /// of events yields one signature per interval.
    fn arm_signature(&self, state: &mut MutexGuard<'_, WriterState>) {
        let armed = state
            .pending_signature
            .as_ref()
            .is_some_and(|task| !task.is_done());
        if armed {
            return;
        }

        let weak: Weak<WriterShared> = Arc::downgrade(&self.shared);
        let task = self.shared.scheduler.schedule(
            self.shared.signature_interval,
            Box::new(move || {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                match shared.lock() {
                    Ok(mut state) => {
                        if let Err(e) = write_signature_locked(&shared, &mut state) {
                            tracing::error!(
                                path = %shared.path.display(),
                                error = %e,
                                "scheduled signature row failed"
                            );
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "signature task could not lock writer"),
                }
            }),
        );
        state.pending_signature = Some(task);
    }

    #[cfg(test)]
    pub(crate) fn current_key_for_tests(&self) -> Vec<u8> {
        self.shared.lock().unwrap().chain.current_key().to_vec()
    }
}

impl WriterShared {
    fn lock(&self) -> Result<MutexGuard<'_, WriterState>, AuditError> {
        self.state
            .lock()
            .map_err(|_| AuditError::Internal("writer lock poisoned".into()))
    }
}

/// Append a signature row under the caller's lock.
///
/// No-op once the writer is closed or when the tail is already sealed;
/// the signature binds the previous signature and the most recent MAC,
/// and is persisted to `CurrentSignature` before being committed.
fn write_signature_locked(
    shared: &WriterShared,
    state: &mut MutexGuard<'_, WriterState>,
) -> Result<(), AuditError> {
    if state.closed || !state.unsealed {
        return Ok(());
    }
    let Some(fields) = state.header.as_ref() else {
        return Ok(());
    };

    let signature = shared
        .signer
        .sign(&state.last_signature, state.last_mac.as_deref());

    let mut row = vec![String::new(); fields.len() + 1];
    row.push(BASE64.encode(&signature));
    if let Err(e) = append_row(state, &row) {
        poison(state);
        return Err(e);
    }

    if let Err(e) = shared
        .key_store
        .write_secret(ENTRY_CURRENT_SIGNATURE, &signature)
    {
        poison(state);
        return Err(e);
    }

    state.last_signature = signature;
    state.unsealed = false;
    Ok(())
}

fn append_row(state: &mut WriterState, row: &[String]) -> Result<(), AuditError> {
    let file = state
        .file
        .as_mut()
        .ok_or_else(|| AuditError::Io("writer is closed".into()))?;
    codec::write_row(file, row)?;
    file.flush()?;
    Ok(())
}

/// Freeze the writer after a fatal failure: drop the file handle so no
/// further rows can land, and cancel the signature timer.
fn poison(state: &mut WriterState) {
    state.closed = true;
    state.file = None;
    if let Some(task) = state.pending_signature.take() {
        task.cancel();
    }
}
