//! CSV sink configuration: log directory, tamper-evidence, buffering.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::common::{ConfigError, default_true};
use crate::constants::{
    DEFAULT_SIGNATURE_INTERVAL_SECS, MAC_ALGORITHM_HMAC_SHA256, SIGNATURE_ALGORITHM_ED25519,
};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CsvHandlerConfig {
    /// Directory receiving one `<topic>.csv` file per topic.
    #[serde(default)]
    pub log_directory: String,

    #[serde(default)]
    pub security: CsvSecurityConfig,

    #[serde(default)]
    pub buffering: CsvBufferingConfig,
}

/// Tamper-evidence settings. When disabled, the sink writes plain CSV
/// without the `HMAC`/`SIGNATURE` columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvSecurityConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Path of the password-protected key container.
    #[serde(default)]
    pub filename: String,

    /// Password unlocking the key container.
    #[serde(default)]
    pub password: String,

    /// Interval between signature rows.
    #[serde(default = "default_signature_interval_secs")]
    pub signature_interval_secs: u64,

    /// Row-MAC algorithm name. Must match between writer and verifier.
    #[serde(default = "default_mac_algorithm")]
    pub mac_algorithm: String,

    /// Signature-row algorithm name. Must match between writer and verifier.
    #[serde(default = "default_signature_algorithm")]
    pub signature_algorithm: String,
}

impl Default for CsvSecurityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            filename: String::new(),
            password: String::new(),
            signature_interval_secs: default_signature_interval_secs(),
            mac_algorithm: default_mac_algorithm(),
            signature_algorithm: default_signature_algorithm(),
        }
    }
}

impl CsvSecurityConfig {
    pub fn signature_interval(&self) -> Duration {
        Duration::from_secs(self.signature_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvBufferingConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Flush when this many events are queued.
    #[serde(default = "default_buffer_max_size")]
    pub max_size: usize,

    /// Flush this long after the first queued event. `0` disables the
    /// time trigger.
    #[serde(default = "default_buffer_max_time_millis")]
    pub max_time_millis: u64,

    /// When false, every publish drains the backlog synchronously.
    #[serde(default = "default_true")]
    pub autoflush: bool,
}

impl Default for CsvBufferingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size: default_buffer_max_size(),
            max_time_millis: default_buffer_max_time_millis(),
            autoflush: true,
        }
    }
}

impl CsvBufferingConfig {
    pub fn max_time(&self) -> Duration {
        Duration::from_millis(self.max_time_millis)
    }
}

fn default_signature_interval_secs() -> u64 {
    DEFAULT_SIGNATURE_INTERVAL_SECS
}
fn default_mac_algorithm() -> String {
    MAC_ALGORITHM_HMAC_SHA256.to_string()
}
fn default_signature_algorithm() -> String {
    SIGNATURE_ALGORITHM_ED25519.to_string()
}
fn default_buffer_max_size() -> usize {
    1000
}
fn default_buffer_max_time_millis() -> u64 {
    100
}

impl CsvHandlerConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.log_directory.is_empty() {
            return Err(ConfigError::Validation {
                field: "csv.log_directory".to_string(),
                message: "log directory is required".to_string(),
            });
        }

        if self.security.enabled {
            if self.security.filename.is_empty() {
                return Err(ConfigError::Validation {
                    field: "csv.security.filename".to_string(),
                    message: "security is enabled but no key container is set".to_string(),
                });
            }
            if self.security.password.is_empty() {
                return Err(ConfigError::Validation {
                    field: "csv.security.password".to_string(),
                    message: "security is enabled but no password is set".to_string(),
                });
            }
            if self.security.signature_interval_secs == 0 {
                return Err(ConfigError::Validation {
                    field: "csv.security.signature_interval_secs".to_string(),
                    message: "signature interval must be positive".to_string(),
                });
            }
        }

        if self.security.mac_algorithm != MAC_ALGORITHM_HMAC_SHA256 {
            return Err(ConfigError::InvalidValue {
                field: "csv.security.mac_algorithm".to_string(),
                value: self.security.mac_algorithm.clone(),
                expected: MAC_ALGORITHM_HMAC_SHA256.to_string(),
            });
        }
        if self.security.signature_algorithm != SIGNATURE_ALGORITHM_ED25519 {
            return Err(ConfigError::InvalidValue {
                field: "csv.security.signature_algorithm".to_string(),
                value: self.security.signature_algorithm.clone(),
                expected: SIGNATURE_ALGORITHM_ED25519.to_string(),
            });
        }

        if self.buffering.enabled && self.buffering.max_size == 0 {
            return Err(ConfigError::Validation {
                field: "csv.buffering.max_size".to_string(),
                message: "buffering is enabled but max_size is 0".to_string(),
            });
        }

        Ok(())
    }
}
