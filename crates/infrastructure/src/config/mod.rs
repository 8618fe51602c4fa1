//! Subsystem configuration: structs, parsing, and validation.
//!
//! Split across sub-modules:
//! - `common`: shared helpers and `ConfigError`
//! - `service`: topic schemas and query-sink designation
//! - `csv`: CSV sink, tamper-evidence, and buffering settings

mod common;
mod csv;
mod service;

pub use common::ConfigError;
pub use csv::{CsvBufferingConfig, CsvHandlerConfig, CsvSecurityConfig};
pub use service::{ServiceConfig, TopicConfig};

use std::path::Path;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use common::warn_if_world_readable;

// ── Top-level config ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    pub service: ServiceConfig,

    #[serde(default)]
    pub csv: CsvHandlerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AuditConfig {
    /// Load config from a YAML file.
    ///
    /// On Unix, logs a warning if the config file or the key container is
    /// world-readable: the config carries the container password.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        warn_if_world_readable(path, "config file");
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_yaml(&content)?;

        if config.csv.security.enabled && !config.csv.security.filename.is_empty() {
            warn_if_world_readable(Path::new(&config.csv.security.filename), "key container");
        }

        Ok(config)
    }

    /// Parse config from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Return a copy of the config with the key-container password masked.
    #[must_use]
    pub fn sanitized(&self) -> Self {
        let mut sanitized = self.clone();
        if !sanitized.csv.security.password.is_empty() {
            sanitized.csv.security.password = "***".to_string();
        }
        sanitized
    }

    /// Validate the config after deserialization.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.service.validate()?;
        self.csv.validate()?;
        Ok(())
    }
}

// ── Logging section ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Flattened JSON, production and log-aggregator compatible.
    #[default]
    Json,
    /// Human-readable colored output for development.
    Text,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
service:
  handler_for_queries: csv
  topics:
    - name: access
      fields: [_id, timestamp, transactionId, server, client]
    - name: activity
      fields: [_id, timestamp, transactionId, runAs]
csv:
  log_directory: /var/log/audit
  security:
    enabled: true
    filename: /etc/audit/keystore.json
    password: correct-horse
    signature_interval_secs: 10
  buffering:
    enabled: true
    max_size: 500
    max_time_millis: 250
    autoflush: true
logging:
  level: debug
  format: text
"#;

    #[test]
    fn parses_full_sample() {
        let config = AuditConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.service.handler_for_queries.as_deref(), Some("csv"));
        assert_eq!(config.service.topics.len(), 2);
        assert_eq!(config.csv.log_directory, "/var/log/audit");
        assert!(config.csv.security.enabled);
        assert_eq!(config.csv.security.signature_interval_secs, 10);
        assert_eq!(config.csv.buffering.max_size, 500);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn defaults_apply_to_omitted_sections() {
        let yaml = r#"
service:
  topics:
    - name: access
      fields: [_id, timestamp, transactionId]
csv:
  log_directory: /tmp/audit
"#;
        let config = AuditConfig::from_yaml(yaml).unwrap();
        assert!(!config.csv.security.enabled);
        assert_eq!(config.csv.security.mac_algorithm, "HmacSHA256");
        assert_eq!(config.csv.security.signature_algorithm, "Ed25519");
        assert!(!config.csv.buffering.enabled);
        assert!(config.csv.buffering.autoflush);
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn rejects_unknown_top_level_fields() {
        let yaml = "service:\n  topics: []\nsurprise: 1\n";
        assert!(AuditConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn rejects_empty_topic_list() {
        let yaml = "service:\n  topics: []\ncsv:\n  log_directory: /tmp\n";
        let err = AuditConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("service.topics"));
    }

    #[test]
    fn rejects_schema_missing_mandatory_fields() {
        let yaml = r#"
service:
  topics:
    - name: access
      fields: [_id, timestamp]
csv:
  log_directory: /tmp
"#;
        let err = AuditConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("transactionId"));
    }

    #[test]
    fn rejects_security_without_password() {
        let yaml = r#"
service:
  topics:
    - name: access
      fields: [_id, timestamp, transactionId]
csv:
  log_directory: /tmp
  security:
    enabled: true
    filename: /tmp/keystore.json
"#;
        let err = AuditConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("password"));
    }

    #[test]
    fn rejects_unsupported_algorithms() {
        let yaml = r#"
service:
  topics:
    - name: access
      fields: [_id, timestamp, transactionId]
csv:
  log_directory: /tmp
  security:
    mac_algorithm: HmacMD5
"#;
        let err = AuditConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn rejects_buffering_with_zero_max_size() {
        let yaml = r#"
service:
  topics:
    - name: access
      fields: [_id, timestamp, transactionId]
csv:
  log_directory: /tmp
  buffering:
    enabled: true
    max_size: 0
"#;
        assert!(AuditConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn sanitized_masks_password() {
        let config = AuditConfig::from_yaml(SAMPLE).unwrap();
        let sanitized = config.sanitized();
        assert_eq!(sanitized.csv.security.password, "***");
        // Original untouched.
        assert_eq!(config.csv.security.password, "correct-horse");
    }

    #[test]
    fn registry_preserves_field_order() {
        let config = AuditConfig::from_yaml(SAMPLE).unwrap();
        let registry = config.service.to_registry().unwrap();
        let schema = registry.get("access").unwrap();
        assert_eq!(
            schema.fields(),
            &["_id", "timestamp", "transactionId", "server", "client"]
        );
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.yaml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = AuditConfig::load(&path).unwrap();
        assert_eq!(config.service.topics.len(), 2);
    }
}
