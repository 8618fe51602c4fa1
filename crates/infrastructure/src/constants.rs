/// Default path of the YAML configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/audit/audit.yaml";

/// The only supported row-MAC algorithm name.
///
/// The name travels through configuration and must match between the
/// writer and the verifier of a log.
pub const MAC_ALGORITHM_HMAC_SHA256: &str = "HmacSHA256";

/// The only supported signature-row algorithm name.
pub const SIGNATURE_ALGORITHM_ED25519: &str = "Ed25519";

/// Default interval between signature rows, in seconds.
pub const DEFAULT_SIGNATURE_INTERVAL_SECS: u64 = 60;
