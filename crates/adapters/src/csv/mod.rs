//! The CSV event sink: one log file per topic under a log directory.
//!
//! With security disabled the sink writes plain CSV; with security
//! enabled every topic log is tamper-evident (per-row MAC chain plus
//! periodic signature rows) and is verified before being appended to on
//! restart. Writers are created lazily on the first event of a topic and
//! closed on sink shutdown.

pub mod chain;
pub mod codec;
pub mod secure_writer;
pub mod sign;
pub mod verifier;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use domain::error::AuditError;
use domain::event::{AuditEvent, FIELD_ID};
use domain::query::{EventFilter, QueryFlow, QuerySummary};
use domain::topic::TopicRegistry;
use ports::secondary::event_sink::{EventSink, MatchHandler};
use ports::secondary::key_store::KeyStore;
use ports::secondary::scheduler::Scheduler;

use self::secure_writer::SecureCsvWriter;
use self::verifier::SecureCsvVerifier;

/// Sink name used for registration and query designation.
pub const SINK_NAME: &str = "csv";

/// Tamper-evidence wiring for the sink: the shared key store, the
/// scheduler driving signature timers, and the signature interval.
#[derive(Clone)]
pub struct CsvSinkSecurity {
    pub key_store: Arc<dyn KeyStore>,
    pub scheduler: Arc<dyn Scheduler>,
    pub signature_interval: Duration,
}

enum TopicWriter {
    Plain(Mutex<PlainCsvWriter>),
    Secure(SecureCsvWriter),
}

impl TopicWriter {
    fn write(&self, event: &AuditEvent) -> Result<(), AuditError> {
        match self {
            Self::Plain(writer) => writer
                .lock()
                .map_err(|_| AuditError::Internal("writer lock poisoned".into()))?
                .write(event),
            Self::Secure(writer) => writer.write(event),
        }
    }

    fn close(&self) -> Result<(), AuditError> {
        match self {
            Self::Plain(writer) => writer
                .lock()
                .map_err(|_| AuditError::Internal("writer lock poisoned".into()))?
                .close(),
            Self::Secure(writer) => writer.close(),
        }
    }
}

/// Writer for an unsecured topic log: schema cells only, no trailing
/// columns. Shares the codec with the secure writer so the quoting
/// discipline is identical.
struct PlainCsvWriter {
    file: Option<BufWriter<File>>,
    fields: Vec<String>,
}

impl PlainCsvWriter {
    fn create(path: &Path, fields: Vec<String>) -> Result<Self, AuditError> {
        let fresh = !path.exists()
            || std::fs::metadata(path)
                .map(|m| m.len() == 0)
                .unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| AuditError::Io(format!("cannot open {}: {e}", path.display())))?;
        let mut writer = Self {
            file: Some(BufWriter::new(file)),
            fields,
        };
        if fresh {
            let header = writer.fields.clone();
            writer.append(&header)?;
        }
        Ok(writer)
    }

    fn write(&mut self, event: &AuditEvent) -> Result<(), AuditError> {
        let cells = codec::canonical_cells(&self.fields, event);
        self.append(&cells)
    }

    fn append(&mut self, row: &[String]) -> Result<(), AuditError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| AuditError::Io("writer is closed".into()))?;
        codec::write_row(file, row)?;
        file.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), AuditError> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }
}

pub struct CsvEventSink {
    log_directory: PathBuf,
    registry: TopicRegistry,
    security: Option<CsvSinkSecurity>,
    writers: Mutex<HashMap<String, Arc<TopicWriter>>>,
}

impl CsvEventSink {
    pub fn new(
        log_directory: impl Into<PathBuf>,
        registry: TopicRegistry,
        security: Option<CsvSinkSecurity>,
    ) -> Self {
        Self {
            log_directory: log_directory.into(),
            registry,
            security,
            writers: Mutex::new(HashMap::new()),
        }
    }

    fn topic_path(&self, topic: &str) -> PathBuf {
        self.log_directory.join(format!("{topic}.csv"))
    }

    /// Look up or lazily create the writer for `topic`.
    fn writer_for(&self, topic: &str) -> Result<Arc<TopicWriter>, AuditError> {
        let mut writers = self
            .writers
            .lock()
            .map_err(|_| AuditError::Internal("writer map lock poisoned".into()))?;
        if let Some(writer) = writers.get(topic) {
            return Ok(Arc::clone(writer));
        }

        let writer = Arc::new(self.open_writer(topic)?);
        writers.insert(topic.to_string(), Arc::clone(&writer));
        Ok(writer)
    }

    fn open_writer(&self, topic: &str) -> Result<TopicWriter, AuditError> {
        let schema = self.registry.get(topic)?;
        std::fs::create_dir_all(&self.log_directory)?;
        let path = self.topic_path(topic);
        let fields = schema.fields().to_vec();

        let Some(security) = &self.security else {
            return Ok(TopicWriter::Plain(Mutex::new(PlainCsvWriter::create(
                &path, fields,
            )?)));
        };

        let existing = path.exists()
            && std::fs::metadata(&path)
                .map(|m| m.len() > 0)
                .unwrap_or(false);
        let writer = if existing {
            // Never append to a log that no longer verifies.
            let report =
                SecureCsvVerifier::new(Arc::clone(&security.key_store)).verify_file(&path)?;
            if !report.accepted {
                return Err(AuditError::Crypto(format!(
                    "cannot resume '{}': {}",
                    path.display(),
                    report.reason.unwrap_or_else(|| "verification failed".into())
                )));
            }
            if report.schema_fields != fields {
                return Err(AuditError::Crypto(format!(
                    "cannot resume '{}': header does not match the registered schema",
                    path.display()
                )));
            }
            SecureCsvWriter::resume(
                &path,
                Arc::clone(&security.key_store),
                Arc::clone(&security.scheduler),
                security.signature_interval,
                fields,
                report.last_mac,
                report.last_signature,
            )?
        } else {
            let writer = SecureCsvWriter::create(
                &path,
                Arc::clone(&security.key_store),
                Arc::clone(&security.scheduler),
                security.signature_interval,
            )?;
            writer.write_header(&fields)?;
            writer
        };
        Ok(TopicWriter::Secure(writer))
    }

    /// Load a topic log as (fields, data rows), skipping signature rows
    /// and the MAC column of secured files.
    fn load_rows(&self, topic: &str) -> Result<(Vec<String>, Vec<Vec<String>>), AuditError> {
        self.registry.get(topic)?;
        let path = self.topic_path(topic);
        if !path.exists() {
            return Ok((Vec::new(), Vec::new()));
        }
        let content = std::fs::read_to_string(&path)?;
        let mut rows = codec::parse_rows(&content)
            .map_err(|e| AuditError::Internal(format!("corrupt log {}: {e}", path.display())))?;
        if rows.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let header = rows.remove(0);
        // The sink's own security mode decides whether the trailing chain
        // columns exist, mirroring open_writer. Sniffing the header text
        // would misread a plain log whose last fields happen to be named
        // like the chain columns.
        let secured = self.security.is_some();
        let field_count = if secured {
            header.len().saturating_sub(2)
        } else {
            header.len()
        };
        let fields = header[..field_count].to_vec();

        let data_rows = rows
            .into_iter()
            .filter(|row| {
                // Drop signature rows; their schema cells are all empty.
                !(secured && row.last().is_some_and(|cell| !cell.is_empty()))
            })
            .map(|mut row| {
                row.truncate(field_count);
                row
            })
            .collect();
        Ok((fields, data_rows))
    }
}

impl EventSink for CsvEventSink {
    fn name(&self) -> &str {
        SINK_NAME
    }

    fn startup(&self) -> Result<(), AuditError> {
        std::fs::create_dir_all(&self.log_directory)?;
        Ok(())
    }

    /// Close every writer. Secure writers seal their tail with a final
    /// signature row; individual close failures are logged, not raised.
    fn shutdown(&self) -> Result<(), AuditError> {
        let mut writers = self
            .writers
            .lock()
            .map_err(|_| AuditError::Internal("writer map lock poisoned".into()))?;
        for (topic, writer) in writers.drain() {
            if let Err(e) = writer.close() {
                tracing::warn!(topic = %topic, error = %e, "unable to close topic writer");
            }
        }
        Ok(())
    }

    fn publish(&self, topic: &str, event: &AuditEvent) -> Result<(), AuditError> {
        self.writer_for(topic)?.write(event)
    }

    fn read(&self, topic: &str, id: &str) -> Result<AuditEvent, AuditError> {
        let (fields, rows) = self.load_rows(topic)?;
        let id_index = fields
            .iter()
            .position(|f| f == FIELD_ID)
            .ok_or_else(|| AuditError::NotFound(format!("no event '{id}' in topic '{topic}'")))?;

        rows.iter()
            .find(|row| row[id_index] == id)
            .map(|row| codec::event_from_cells(&fields, row))
            .ok_or_else(|| AuditError::NotFound(format!("no event '{id}' in topic '{topic}'")))
    }

    fn query(
        &self,
        topic: &str,
        filter: &EventFilter,
        on_match: &mut MatchHandler<'_>,
    ) -> Result<QuerySummary, AuditError> {
        let (fields, rows) = self.load_rows(topic)?;
        let mut summary = QuerySummary::default();
        for row in &rows {
            let event = codec::event_from_cells(&fields, row);
            if filter.matches(&event) {
                summary.matched += 1;
                if on_match(event) == QueryFlow::Stop {
                    break;
                }
            }
        }
        Ok(summary)
    }
}
