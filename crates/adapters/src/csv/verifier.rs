//! Offline verification of a tamper-evident CSV log.
//!
//! The verifier replays the writer's computation from the `InitialKey`
//! entry: every data row must carry the MAC of its cells under the
//! ratcheting secret, every signature row must bind the previous
//! signature and the most recent MAC, and the file must end with a
//! signature row: an unsigned tail means the log was truncated after
//! the last seal.

use std::path::Path;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use domain::error::AuditError;
use ports::secondary::key_store::{ENTRY_INITIAL_KEY, ENTRY_SIGNATURE, KeyStore};

use super::chain::HmacChain;
use super::codec::{self, HEADER_MAC, HEADER_SIGNATURE};
use super::sign::RowVerifier;

/// Outcome of one verification run.
///
/// `last_mac`, `last_signature` and `schema_fields` describe the replayed
/// chain position; the CSV sink uses them to resume a writer on an
/// existing log after a restart.
#[derive(Debug)]
pub struct VerifyReport {
    pub accepted: bool,
    /// Rejection reason, with the offending row number when applicable.
    pub reason: Option<String>,
    pub data_rows: usize,
    pub signature_rows: usize,
    pub schema_fields: Vec<String>,
    pub last_mac: Option<String>,
    pub last_signature: Vec<u8>,
}

impl VerifyReport {
    fn rejected(reason: String) -> Self {
        Self {
            accepted: false,
            reason: Some(reason),
            data_rows: 0,
            signature_rows: 0,
            schema_fields: Vec::new(),
            last_mac: None,
            last_signature: Vec::new(),
        }
    }
}

pub struct SecureCsvVerifier {
    key_store: Arc<dyn KeyStore>,
}

impl SecureCsvVerifier {
    pub fn new(key_store: Arc<dyn KeyStore>) -> Self {
        Self { key_store }
    }

    pub fn verify_file(&self, path: &Path) -> Result<VerifyReport, AuditError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AuditError::Io(format!("cannot read {}: {e}", path.display())))?;
        self.verify_text(&content)
    }

    /// Replay the chain over the log text.
    ///
    /// `Err` means verification could not run (key store or crypto
    /// failure); a tampered or truncated log is `Ok` with
    /// `accepted == false`.
    pub fn verify_text(&self, content: &str) -> Result<VerifyReport, AuditError> {
        let verifying_key = self.key_store.read_verifying_key(ENTRY_SIGNATURE)?;
        let row_verifier = RowVerifier::from_bytes(verifying_key)?;
        let initial_key = self
            .key_store
            .read_secret(ENTRY_INITIAL_KEY)?
            .ok_or_else(|| {
                AuditError::KeyStore(format!(
                    "expected an {ENTRY_INITIAL_KEY} entry in the key store"
                ))
            })?;

        let rows = match codec::parse_rows(content) {
            Ok(rows) => rows,
            Err(e) => return Ok(VerifyReport::rejected(format!("malformed CSV: {e}"))),
        };

        let Some(header) = rows.first() else {
            return Ok(VerifyReport::rejected("missing header row".into()));
        };
        if header.len() < 2
            || header[header.len() - 2] != HEADER_MAC
            || header[header.len() - 1] != HEADER_SIGNATURE
        {
            return Ok(VerifyReport::rejected(format!(
                "header must end with the {HEADER_MAC} and {HEADER_SIGNATURE} columns"
            )));
        }
        let schema_len = header.len() - 2;
        let schema_fields = header[..schema_len].to_vec();

        let mut report = VerifyReport {
            accepted: false,
            reason: None,
            data_rows: 0,
            signature_rows: 0,
            schema_fields,
            last_mac: None,
            last_signature: Vec::new(),
        };
        let mut chain = HmacChain::new(&initial_key);
        let mut last_row_was_signed = false;

        for (idx, row) in rows[1..].iter().enumerate() {
            let row_no = idx + 2;
            if row.len() != header.len() {
                report.reason = Some(format!(
                    "row {row_no}: expected {} cells, found {}",
                    header.len(),
                    row.len()
                ));
                return Ok(report);
            }

            let signature_cell = &row[header.len() - 1];
            if !signature_cell.is_empty() {
                // Signature row: all other cells must be empty.
                if row[..header.len() - 1].iter().any(|c| !c.is_empty()) {
                    report.reason =
                        Some(format!("row {row_no}: signature row carries data cells"));
                    return Ok(report);
                }
                let Ok(signature) = BASE64.decode(signature_cell) else {
                    report.reason =
                        Some(format!("row {row_no}: signature is not valid base64"));
                    return Ok(report);
                };
                let valid = row_verifier.verify(
                    &signature,
                    &report.last_signature,
                    report.last_mac.as_deref(),
                )?;
                if !valid {
                    report.reason = Some(format!("row {row_no}: signature does not verify"));
                    return Ok(report);
                }
                report.last_signature = signature;
                report.signature_rows += 1;
                last_row_was_signed = true;
            } else {
                let mac_cell = &row[schema_len];
                let (expected_mac, next_key) = chain.mac(&row[..schema_len])?;
                if *mac_cell != expected_mac {
                    report.reason = Some(format!("row {row_no}: HMAC mismatch"));
                    return Ok(report);
                }
                chain.advance(next_key);
                report.last_mac = Some(expected_mac);
                report.data_rows += 1;
                last_row_was_signed = false;
            }
        }

        if !last_row_was_signed {
            report.reason = Some("log does not end with a signature row".into());
            return Ok(report);
        }

        report.accepted = true;
        Ok(report)
    }
}
