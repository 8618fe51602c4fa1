use domain::error::AuditError;

/// Alias of the pre-provisioned chain start secret. Read-only after first use.
pub const ENTRY_INITIAL_KEY: &str = "InitialKey";
/// Alias of the evolving chain secret. Rewritten after every data row.
pub const ENTRY_CURRENT_KEY: &str = "CurrentKey";
/// Alias holding the last signature bytes. Rewritten after every signature row.
pub const ENTRY_CURRENT_SIGNATURE: &str = "CurrentSignature";
/// Alias of the long-lived signing identity (keypair).
pub const ENTRY_SIGNATURE: &str = "Signature";

/// Password-protected container of named key entries.
///
/// Symmetric entries carry raw secret material; the signing entry carries
/// an Ed25519 keypair. All operations are synchronous and fail with
/// `KeyStore` on a missing container, wrong password, or corrupt entry.
pub trait KeyStore: Send + Sync {
    /// Read a symmetric secret, or `None` if the alias has no entry.
    fn read_secret(&self, alias: &str) -> Result<Option<Vec<u8>>, AuditError>;

    /// Create or replace a symmetric secret under `alias` and persist it.
    fn write_secret(&self, alias: &str, secret: &[u8]) -> Result<(), AuditError>;

    /// Read the Ed25519 signing seed stored under `alias`.
    fn read_signing_key(&self, alias: &str) -> Result<[u8; 32], AuditError>;

    /// Read the Ed25519 public key stored under `alias`.
    fn read_verifying_key(&self, alias: &str) -> Result<[u8; 32], AuditError>;
}
