//! The MAC chain engine: per-row keyed MACs under a forward-ratcheted
//! secret.
//!
//! Each data row is authenticated with HMAC-SHA-256 over the concatenation
//! of its cell texts in schema order. After every MAC the secret is
//! replaced by a one-way derivation of itself, so compromise of the
//! current secret does not expose MACs already on disk; the periodic
//! signature rows bind the chain externally.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use domain::error::AuditError;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Fixed ratchet label: `next = HMAC(current, RATCHET_LABEL)`.
/// Changing it invalidates every existing log.
const RATCHET_LABEL: &[u8] = b"csv-chain-key-ratchet-v1";

pub struct HmacChain {
    key: Zeroizing<Vec<u8>>,
}

impl HmacChain {
    pub fn new(key: &[u8]) -> Self {
        Self {
            key: Zeroizing::new(key.to_vec()),
        }
    }

    /// MAC the given cells under the current secret and derive the next
    /// secret. The caller decides when to commit via [`HmacChain::advance`];
    /// the chain state is unchanged until then.
    pub fn mac(&self, cells: &[String]) -> Result<(String, Zeroizing<Vec<u8>>), AuditError> {
        let mut mac = self.new_mac()?;
        for cell in cells {
            mac.update(cell.as_bytes());
        }
        let mac_b64 = BASE64.encode(mac.finalize().into_bytes());
        let next = self.next_key()?;
        Ok((mac_b64, next))
    }

    /// Commit a secret previously derived by [`HmacChain::mac`].
    pub fn advance(&mut self, next: Zeroizing<Vec<u8>>) {
        self.key = next;
    }

    /// The current secret, for persisting to the key store.
    pub fn current_key(&self) -> &[u8] {
        &self.key
    }

    fn next_key(&self) -> Result<Zeroizing<Vec<u8>>, AuditError> {
        let mut mac = self.new_mac()?;
        mac.update(RATCHET_LABEL);
        Ok(Zeroizing::new(mac.finalize().into_bytes().to_vec()))
    }

    fn new_mac(&self) -> Result<HmacSha256, AuditError> {
        HmacSha256::new_from_slice(&self.key)
            .map_err(|e| AuditError::Crypto(format!("invalid HMAC key: {e}")))
    }
}
