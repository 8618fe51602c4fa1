use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use infrastructure::config::{LogFormat, LogLevel};
use infrastructure::constants::DEFAULT_CONFIG_PATH;

#[derive(Parser, Debug)]
#[command(
    name = "auditctl",
    about = "Tamper-evident audit log toolkit",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: String,

    /// Log level override
    #[arg(short, long)]
    pub log_level: Option<LogLevel>,

    /// Log format: json (production) or text (development)
    #[arg(long)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Display version information
    Version,

    /// Verify a tamper-evident log offline
    Verify {
        /// Path to the CSV log file
        #[arg(long)]
        file: PathBuf,

        #[command(flatten)]
        keystore: KeystoreArgs,
    },

    /// Publish one event through the configured sinks
    Publish {
        /// Event topic
        #[arg(long)]
        topic: String,

        /// Event body as inline JSON
        #[arg(long)]
        event: String,
    },

    /// Read one event by id through the configured query sink
    Read {
        /// Event topic
        #[arg(long)]
        topic: String,

        /// Event identifier
        #[arg(long)]
        id: String,
    },

    /// Manage the key container
    Keystore {
        #[command(subcommand)]
        command: KeystoreCommand,
    },
}

/// Key container location and password. Either pass them explicitly or
/// let them default to `csv.security` from the config file.
#[derive(Args, Debug)]
pub struct KeystoreArgs {
    /// Path to the key container
    #[arg(long)]
    pub keystore: Option<PathBuf>,

    /// Key container password
    #[arg(long, env = "AUDIT_KEYSTORE_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum KeystoreCommand {
    /// Provision a fresh key container with an initial chain secret and
    /// a signing keypair
    Init {
        #[command(flatten)]
        keystore: KeystoreArgs,

        /// Base64 of the 32-byte initial chain secret; generated when omitted
        #[arg(long)]
        initial_key_b64: Option<String>,
    },
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_path() {
        let cli = Cli::try_parse_from(["auditctl", "version"]).unwrap();
        assert_eq!(cli.config, DEFAULT_CONFIG_PATH);
        assert!(cli.log_level.is_none());
    }

    #[test]
    fn verify_subcommand() {
        let cli = Cli::try_parse_from([
            "auditctl",
            "verify",
            "--file",
            "/var/log/audit/access.csv",
            "--keystore",
            "/etc/audit/keystore.json",
            "--password",
            "pw",
        ])
        .unwrap();
        match cli.command {
            Command::Verify { file, keystore } => {
                assert_eq!(file, PathBuf::from("/var/log/audit/access.csv"));
                assert_eq!(
                    keystore.keystore,
                    Some(PathBuf::from("/etc/audit/keystore.json"))
                );
                assert_eq!(keystore.password.as_deref(), Some("pw"));
            }
            _ => panic!("expected Verify command"),
        }
    }

    #[test]
    fn verify_requires_file() {
        assert!(Cli::try_parse_from(["auditctl", "verify"]).is_err());
    }

    #[test]
    fn publish_subcommand() {
        let cli = Cli::try_parse_from([
            "auditctl",
            "publish",
            "--topic",
            "access",
            "--event",
            r#"{"transactionId":"tx","timestamp":"t"}"#,
        ])
        .unwrap();
        match cli.command {
            Command::Publish { topic, event } => {
                assert_eq!(topic, "access");
                assert!(event.contains("transactionId"));
            }
            _ => panic!("expected Publish command"),
        }
    }

    #[test]
    fn read_subcommand() {
        let cli =
            Cli::try_parse_from(["auditctl", "read", "--topic", "access", "--id", "_id0"]).unwrap();
        match cli.command {
            Command::Read { topic, id } => {
                assert_eq!(topic, "access");
                assert_eq!(id, "_id0");
            }
            _ => panic!("expected Read command"),
        }
    }

    #[test]
    fn keystore_init_subcommand() {
        let cli = Cli::try_parse_from([
            "auditctl",
            "keystore",
            "init",
            "--keystore",
            "/tmp/keystore.json",
            "--password",
            "pw",
        ])
        .unwrap();
        match cli.command {
            Command::Keystore {
                command: KeystoreCommand::Init { keystore, initial_key_b64 },
            } => {
                assert_eq!(keystore.keystore, Some(PathBuf::from("/tmp/keystore.json")));
                assert!(initial_key_b64.is_none());
            }
            _ => panic!("expected Keystore Init command"),
        }
    }

    #[test]
    fn log_level_override() {
        let cli = Cli::try_parse_from(["auditctl", "--log-level", "debug", "version"]).unwrap();
        assert_eq!(cli.log_level, Some(LogLevel::Debug));
    }

    #[test]
    fn invalid_log_level_rejected() {
        assert!(Cli::try_parse_from(["auditctl", "--log-level", "banana", "version"]).is_err());
    }
}
