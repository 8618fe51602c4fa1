use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use adapters::csv::verifier::SecureCsvVerifier;
use adapters::csv::{CsvEventSink, CsvSinkSecurity, SINK_NAME as CSV_SINK};
use adapters::keystore::FileKeyStore;
use adapters::schedule::ThreadScheduler;
use anyhow::{Context, bail};
use application::audit_service::{AuditServiceBuilder, AuditServiceImpl};
use application::buffered_sink::{BufferedSink, BufferingPolicy};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use domain::error::AuditError;
use domain::event::AuditEvent;
use infrastructure::config::AuditConfig;
use ports::secondary::event_sink::EventSink;
use ports::secondary::key_store::KeyStore;
use rand::RngCore;
use rand::rngs::OsRng;

use crate::cli::{Cli, Command, KeystoreArgs, KeystoreCommand};

/// Command verdict, mapped to the process exit code in `main`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl From<Outcome> for ExitCode {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => ExitCode::SUCCESS,
            Outcome::Failure => ExitCode::FAILURE,
        }
    }
}

pub fn run(cli: Cli) -> anyhow::Result<Outcome> {
    match cli.command {
        Command::Version => {
            println!("auditctl {}", env!("CARGO_PKG_VERSION"));
            Ok(Outcome::Success)
        }
        Command::Verify { file, keystore } => verify(&cli.config, &file, keystore),
        Command::Publish { topic, event } => publish(&cli.config, &topic, &event),
        Command::Read { topic, id } => read(&cli.config, &topic, &id),
        Command::Keystore {
            command: KeystoreCommand::Init {
                keystore,
                initial_key_b64,
            },
        } => keystore_init(&cli.config, keystore, initial_key_b64),
    }
}

/// Resolve the key container path and password from flags, falling back
/// to `csv.security` in the config file.
fn resolve_keystore(config_path: &str, args: KeystoreArgs) -> anyhow::Result<(PathBuf, String)> {
    if let (Some(path), Some(password)) = (&args.keystore, &args.password) {
        return Ok((path.clone(), password.clone()));
    }

    let config = AuditConfig::load(Path::new(config_path))
        .with_context(|| format!("cannot load config {config_path}"))?;
    let security = &config.csv.security;
    let path = args
        .keystore
        .unwrap_or_else(|| PathBuf::from(&security.filename));
    let password = args.password.unwrap_or_else(|| security.password.clone());

    if path.as_os_str().is_empty() {
        bail!("no key container given: pass --keystore or set csv.security.filename");
    }
    if password.is_empty() {
        bail!("no key container password given: pass --password or set csv.security.password");
    }
    Ok((path, password))
}

fn verify(config_path: &str, file: &Path, keystore: KeystoreArgs) -> anyhow::Result<Outcome> {
    let (store_path, password) = resolve_keystore(config_path, keystore)?;
    let key_store: Arc<dyn KeyStore> = Arc::new(FileKeyStore::open(&store_path, &password)?);

    let report = SecureCsvVerifier::new(key_store).verify_file(file)?;
    if report.accepted {
        println!(
            "{}: accepted ({} data rows, {} signature rows)",
            file.display(),
            report.data_rows,
            report.signature_rows
        );
        Ok(Outcome::Success)
    } else {
        println!(
            "{}: REJECTED: {}",
            file.display(),
            report.reason.unwrap_or_else(|| "verification failed".into())
        );
        Ok(Outcome::Failure)
    }
}

fn publish(config_path: &str, topic: &str, event_json: &str) -> anyhow::Result<Outcome> {
    let config = AuditConfig::load(Path::new(config_path))
        .with_context(|| format!("cannot load config {config_path}"))?;
    let service = build_service(&config)?;
    service.startup()?;

    let value: serde_json::Value =
        serde_json::from_str(event_json).context("event is not valid JSON")?;
    let event = AuditEvent::from_value(value)?;

    let outcome = match service.publish(topic, event) {
        Ok(report) => {
            println!(
                "published {} to {} sink(s)",
                report.event_id, report.delivered
            );
            for failure in &report.failures {
                eprintln!("sink '{}' failed: {}", failure.sink, failure.error);
            }
            if report.failures.is_empty() {
                Outcome::Success
            } else {
                Outcome::Failure
            }
        }
        Err(e) => {
            service.shutdown()?;
            return Err(e.into());
        }
    };

    service.shutdown()?;
    Ok(outcome)
}

fn read(config_path: &str, topic: &str, id: &str) -> anyhow::Result<Outcome> {
    let config = AuditConfig::load(Path::new(config_path))
        .with_context(|| format!("cannot load config {config_path}"))?;
    let service = build_service(&config)?;
    service.startup()?;

    let outcome = match service.read(topic, id) {
        Ok(event) => {
            println!("{}", serde_json::to_string_pretty(&event)?);
            Outcome::Success
        }
        Err(AuditError::NotFound(message)) => {
            eprintln!("{message}");
            Outcome::Failure
        }
        Err(e) => {
            service.shutdown()?;
            return Err(e.into());
        }
    };

    service.shutdown()?;
    Ok(outcome)
}

fn keystore_init(
    config_path: &str,
    args: KeystoreArgs,
    initial_key_b64: Option<String>,
) -> anyhow::Result<Outcome> {
    let (path, password) = resolve_keystore(config_path, args)?;

    let initial_key = match initial_key_b64 {
        Some(b64) => {
            let bytes = BASE64
                .decode(&b64)
                .context("initial key is not valid base64")?;
            if bytes.len() != 32 {
                bail!("initial key must be 32 bytes, got {}", bytes.len());
            }
            bytes
        }
        None => {
            let mut bytes = vec![0u8; 32];
            OsRng.fill_bytes(&mut bytes);
            bytes
        }
    };

    FileKeyStore::provision(&path, &password, &initial_key)?;
    println!(
        "provisioned key container {} with InitialKey and Signature entries",
        path.display()
    );
    Ok(Outcome::Success)
}

/// Wire the audit service from configuration: the CSV sink (secured and
/// buffered as configured), every topic routed to it, and the query sink
/// designation taken from the config.
fn build_service(config: &AuditConfig) -> anyhow::Result<AuditServiceImpl> {
    let registry = config.service.to_registry()?;

    let security = if config.csv.security.enabled {
        let store = FileKeyStore::open(
            Path::new(&config.csv.security.filename),
            &config.csv.security.password,
        )?;
        Some(CsvSinkSecurity {
            key_store: Arc::new(store) as Arc<dyn KeyStore>,
            scheduler: Arc::new(ThreadScheduler),
            signature_interval: config.csv.security.signature_interval(),
        })
    } else {
        None
    };

    let csv_sink: Arc<dyn EventSink> = Arc::new(CsvEventSink::new(
        &config.csv.log_directory,
        registry.clone(),
        security,
    ));
    let csv_sink: Arc<dyn EventSink> = if config.csv.buffering.enabled {
        Arc::new(BufferedSink::new(
            csv_sink,
            BufferingPolicy {
                enabled: true,
                max_size: config.csv.buffering.max_size,
                max_time: config.csv.buffering.max_time(),
                autoflush: config.csv.buffering.autoflush,
            },
        ))
    } else {
        csv_sink
    };

    let mut builder = AuditServiceBuilder::new(registry.clone()).register_sink(csv_sink);
    for topic in registry.names() {
        builder = builder.route(topic, CSV_SINK);
    }
    if let Some(query_sink) = &config.service.handler_for_queries {
        builder = builder.handler_for_queries(query_sink);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    use crate::cli::Cli;

    fn run_args(args: &[&str]) -> anyhow::Result<Outcome> {
        run(Cli::try_parse_from(args).unwrap())
    }

    /// Write a config enabling security, pointing at a tempdir layout.
    fn write_config(dir: &Path) -> String {
        let config_path = dir.join("audit.yaml");
        let yaml = format!(
            r#"
service:
  handler_for_queries: csv
  topics:
    - name: access
      fields: [_id, timestamp, transactionId]
csv:
  log_directory: {log_dir}
  security:
    enabled: true
    filename: {keystore}
    password: test-password
    signature_interval_secs: 60
"#,
            log_dir = dir.join("logs").display(),
            keystore = dir.join("keystore.json").display(),
        );
        std::fs::write(&config_path, yaml).unwrap();
        config_path.display().to_string()
    }

    #[test]
    fn version_succeeds() {
        assert_eq!(run_args(&["auditctl", "version"]).unwrap(), Outcome::Success);
    }

    #[test]
    fn end_to_end_provision_publish_read_verify() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path());

        let outcome = run_args(&["auditctl", "--config", &config, "keystore", "init"]).unwrap();
        assert_eq!(outcome, Outcome::Success);

        let outcome = run_args(&[
            "auditctl",
            "--config",
            &config,
            "publish",
            "--topic",
            "access",
            "--event",
            r#"{"_id":"_id0","timestamp":"t","transactionId":"tx"}"#,
        ])
        .unwrap();
        assert_eq!(outcome, Outcome::Success);

        let outcome = run_args(&[
            "auditctl",
            "--config",
            &config,
            "read",
            "--topic",
            "access",
            "--id",
            "_id0",
        ])
        .unwrap();
        assert_eq!(outcome, Outcome::Success);

        let log = dir.path().join("logs").join("access.csv");
        let outcome = run_args(&[
            "auditctl",
            "--config",
            &config,
            "verify",
            "--file",
            log.to_str().unwrap(),
        ])
        .unwrap();
        assert_eq!(outcome, Outcome::Success);
    }

    #[test]
    fn verify_rejects_tampered_log() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path());

        run_args(&["auditctl", "--config", &config, "keystore", "init"]).unwrap();
        run_args(&[
            "auditctl",
            "--config",
            &config,
            "publish",
            "--topic",
            "access",
            "--event",
            r#"{"_id":"_id0","timestamp":"t","transactionId":"tx"}"#,
        ])
        .unwrap();

        let log = dir.path().join("logs").join("access.csv");
        let tampered = std::fs::read_to_string(&log)
            .unwrap()
            .replacen("_id0", "_idX", 1);
        std::fs::write(&log, tampered).unwrap();

        let outcome = run_args(&[
            "auditctl",
            "--config",
            &config,
            "verify",
            "--file",
            log.to_str().unwrap(),
        ])
        .unwrap();
        assert_eq!(outcome, Outcome::Failure);
    }

    #[test]
    fn publish_to_unknown_topic_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path());
        run_args(&["auditctl", "--config", &config, "keystore", "init"]).unwrap();

        let result = run_args(&[
            "auditctl",
            "--config",
            &config,
            "publish",
            "--topic",
            "nonsense",
            "--event",
            r#"{"timestamp":"t","transactionId":"tx"}"#,
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn read_missing_event_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path());
        run_args(&["auditctl", "--config", &config, "keystore", "init"]).unwrap();

        let outcome = run_args(&[
            "auditctl",
            "--config",
            &config,
            "read",
            "--topic",
            "access",
            "--id",
            "ghost",
        ])
        .unwrap();
        assert_eq!(outcome, Outcome::Failure);
    }

    #[test]
    fn keystore_init_accepts_seeded_key() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path());

        let outcome = run_args(&[
            "auditctl",
            "--config",
            &config,
            "keystore",
            "init",
            "--initial-key-b64",
            "zmq4EoprX52XLGyLkMENcin0gv0jwYyrySi3YOqfhFY=",
        ])
        .unwrap();
        assert_eq!(outcome, Outcome::Success);
    }

    #[test]
    fn keystore_init_rejects_short_key() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(dir.path());

        let result = run_args(&[
            "auditctl",
            "--config",
            &config,
            "keystore",
            "init",
            "--initial-key-b64",
            "c2hvcnQ=",
        ]);
        assert!(result.is_err());
    }
}
