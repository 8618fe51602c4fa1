use thiserror::Error;

/// Error taxonomy shared by the audit service and every sink.
///
/// The first four variants classify caller-visible request failures; the
/// last four classify infrastructure failures inside a sink or the secure
/// writer. Writer-internal `Io`/`KeyStore`/`Crypto` failures are fatal to
/// the writer that raised them (see the CSV sink adapter).
#[derive(Debug, Error)]
pub enum AuditError {
    /// Client-shaped input error (missing mandatory field, malformed event).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Unknown topic, or an operation the service does not support.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Read for an id that is not in the log.
    #[error("not found: {0}")]
    NotFound(String),

    /// Service is not in the running state.
    #[error("audit service unavailable: {0}")]
    Unavailable(String),

    /// MAC or signature primitive failure, malformed key material.
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// Missing alias, wrong password, or corrupt key container.
    #[error("key store failure: {0}")]
    KeyStore(String),

    /// File I/O failure on read or append.
    #[error("I/O failure: {0}")]
    Io(String),

    /// Anything unclassified.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for AuditError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
