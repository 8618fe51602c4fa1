//! Password-protected key container backing the chain state.
//!
//! A single JSON document holds every named entry. The password is
//! stretched once at open with Argon2id into a 32-byte master key; each
//! entry is sealed with ChaCha20-Poly1305 under alias-bound AAD, so an
//! entry cannot be silently renamed or moved between containers.
//!
//! `CurrentKey` is rewritten after every data row, which is why the
//! master key is derived once and cached rather than per operation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use argon2::{Argon2, Params};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use domain::error::AuditError;
use ed25519_dalek::SigningKey;
use ports::secondary::key_store::{ENTRY_INITIAL_KEY, ENTRY_SIGNATURE, KeyStore};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

const STORE_VERSION: u32 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    salt: String,
    entries: BTreeMap<String, StoreEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreEntry {
    kind: EntryKind,
    nonce: String,
    ciphertext: String,
    /// Keypair entries expose the public half unencrypted; it is not a
    /// secret and the verifier must read it without the signing seed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    public: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum EntryKind {
    Secret,
    Keypair,
}

impl EntryKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Secret => "secret",
            Self::Keypair => "keypair",
        }
    }
}

pub struct FileKeyStore {
    path: PathBuf,
    master_key: Zeroizing<[u8; 32]>,
    salt: Vec<u8>,
    entries: Mutex<BTreeMap<String, StoreEntry>>,
}

impl std::fmt::Debug for FileKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKeyStore")
            .field("path", &self.path)
            .finish()
    }
}

impl FileKeyStore {
    /// Open an existing container, verifying the password against the
    /// first entry.
    pub fn open(path: &Path, password: &str) -> Result<Self, AuditError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AuditError::KeyStore(format!("cannot read key container {}: {e}", path.display()))
        })?;
        let document: StoreDocument = serde_json::from_str(&content)
            .map_err(|e| AuditError::KeyStore(format!("corrupt key container: {e}")))?;
        if document.version != STORE_VERSION {
            return Err(AuditError::KeyStore(format!(
                "unsupported key container version {}",
                document.version
            )));
        }
        let salt = BASE64
            .decode(&document.salt)
            .map_err(|e| AuditError::KeyStore(format!("corrupt container salt: {e}")))?;
        let master_key = derive_master_key(password, &salt)?;

        let store = Self {
            path: path.to_path_buf(),
            master_key,
            salt,
            entries: Mutex::new(document.entries),
        };

        // A wrong password fails here rather than on first use.
        {
            let entries = store.lock_entries()?;
            if let Some((alias, entry)) = entries.iter().next() {
                store.unseal(alias, entry).map_err(|_| {
                    AuditError::KeyStore("wrong password or corrupt key container".into())
                })?;
            }
        }
        Ok(store)
    }

    /// Create a fresh container holding `InitialKey` and a newly
    /// generated Ed25519 signing identity under `Signature`.
    pub fn provision(path: &Path, password: &str, initial_key: &[u8]) -> Result<Self, AuditError> {
        if path.exists() {
            return Err(AuditError::KeyStore(format!(
                "refusing to overwrite existing key container {}",
                path.display()
            )));
        }

        let mut salt = vec![0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let master_key = derive_master_key(password, &salt)?;

        let store = Self {
            path: path.to_path_buf(),
            master_key,
            salt,
            entries: Mutex::new(BTreeMap::new()),
        };

        let mut seed = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut seed[..]);
        let public = SigningKey::from_bytes(&seed).verifying_key().to_bytes();

        {
            let mut entries = store.lock_entries()?;
            let initial = store.seal(ENTRY_INITIAL_KEY, EntryKind::Secret, initial_key, None)?;
            entries.insert(ENTRY_INITIAL_KEY.to_string(), initial);
            let keypair = store.seal(
                ENTRY_SIGNATURE,
                EntryKind::Keypair,
                &seed[..],
                Some(BASE64.encode(public)),
            )?;
            entries.insert(ENTRY_SIGNATURE.to_string(), keypair);
            store.persist(&entries)?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_entries(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, StoreEntry>>, AuditError> {
        self.entries
            .lock()
            .map_err(|_| AuditError::Internal("key store lock poisoned".into()))
    }

    fn seal(
        &self,
        alias: &str,
        kind: EntryKind,
        plaintext: &[u8],
        public: Option<String>,
    ) -> Result<StoreEntry, AuditError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.master_key[..]));
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &entry_aad(alias, kind),
                },
            )
            .map_err(|_| AuditError::KeyStore(format!("cannot seal entry '{alias}'")))?;
        Ok(StoreEntry {
            kind,
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
            public,
        })
    }

    fn unseal(&self, alias: &str, entry: &StoreEntry) -> Result<Zeroizing<Vec<u8>>, AuditError> {
        let nonce = BASE64
            .decode(&entry.nonce)
            .map_err(|e| AuditError::KeyStore(format!("corrupt nonce for '{alias}': {e}")))?;
        if nonce.len() != NONCE_LEN {
            return Err(AuditError::KeyStore(format!(
                "corrupt nonce for '{alias}': expected {NONCE_LEN} bytes"
            )));
        }
        let ciphertext = BASE64
            .decode(&entry.ciphertext)
            .map_err(|e| AuditError::KeyStore(format!("corrupt ciphertext for '{alias}': {e}")))?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.master_key[..]));
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: &entry_aad(alias, entry.kind),
                },
            )
            .map_err(|_| {
                AuditError::KeyStore(format!(
                    "cannot unseal entry '{alias}': wrong password or tampered container"
                ))
            })?;
        Ok(Zeroizing::new(plaintext))
    }

    /// Persist the container atomically: write a sibling temp file, then
    /// rename over the original so a crash never leaves a torn document.
    fn persist(&self, entries: &BTreeMap<String, StoreEntry>) -> Result<(), AuditError> {
        let document = StoreDocument {
            version: STORE_VERSION,
            salt: BASE64.encode(&self.salt),
            entries: entries.clone(),
        };
        let json = serde_json::to_string_pretty(&document)
            .map_err(|e| AuditError::KeyStore(format!("cannot serialize key container: {e}")))?;

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(|e| {
            AuditError::KeyStore(format!("cannot write key container {}: {e}", tmp.display()))
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            AuditError::KeyStore(format!(
                "cannot replace key container {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(())
    }
}

impl KeyStore for FileKeyStore {
    fn read_secret(&self, alias: &str) -> Result<Option<Vec<u8>>, AuditError> {
        let entries = self.lock_entries()?;
        match entries.get(alias) {
            None => Ok(None),
            Some(entry) => {
                if entry.kind != EntryKind::Secret {
                    return Err(AuditError::KeyStore(format!(
                        "entry '{alias}' holds a keypair, not a secret"
                    )));
                }
                Ok(Some(self.unseal(alias, entry)?.to_vec()))
            }
        }
    }

    fn write_secret(&self, alias: &str, secret: &[u8]) -> Result<(), AuditError> {
        let mut entries = self.lock_entries()?;
        if entries.get(alias).is_some_and(|e| e.kind != EntryKind::Secret) {
            return Err(AuditError::KeyStore(format!(
                "entry '{alias}' holds a keypair and cannot be overwritten with a secret"
            )));
        }
        let sealed = self.seal(alias, EntryKind::Secret, secret, None)?;
        entries.insert(alias.to_string(), sealed);
        self.persist(&entries)
    }

    fn read_signing_key(&self, alias: &str) -> Result<[u8; 32], AuditError> {
        let entries = self.lock_entries()?;
        let entry = entries
            .get(alias)
            .ok_or_else(|| AuditError::KeyStore(format!("no entry named '{alias}'")))?;
        if entry.kind != EntryKind::Keypair {
            return Err(AuditError::KeyStore(format!(
                "entry '{alias}' does not hold a keypair"
            )));
        }
        let seed = self.unseal(alias, entry)?;
        seed.as_slice().try_into().map_err(|_| {
            AuditError::KeyStore(format!("entry '{alias}' seed is not 32 bytes"))
        })
    }

    fn read_verifying_key(&self, alias: &str) -> Result<[u8; 32], AuditError> {
        let entries = self.lock_entries()?;
        let entry = entries
            .get(alias)
            .ok_or_else(|| AuditError::KeyStore(format!("no entry named '{alias}'")))?;
        let public = entry.public.as_ref().ok_or_else(|| {
            AuditError::KeyStore(format!("entry '{alias}' has no public key"))
        })?;
        let bytes = BASE64
            .decode(public)
            .map_err(|e| AuditError::KeyStore(format!("corrupt public key for '{alias}': {e}")))?;
        bytes.try_into().map_err(|_| {
            AuditError::KeyStore(format!("public key for '{alias}' is not 32 bytes"))
        })
    }
}

fn derive_master_key(password: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>, AuditError> {
    let params = Params::new(64 * 1024, 3, 1, Some(32))
        .map_err(|e| AuditError::KeyStore(format!("KDF parameters rejected: {e}")))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut out = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut out[..])
        .map_err(|e| AuditError::KeyStore(format!("key derivation failed: {e}")))?;
    Ok(out)
}

fn entry_aad(alias: &str, kind: EntryKind) -> Vec<u8> {
    format!("audit-keystore:v{STORE_VERSION}:{}:{alias}", kind.as_str()).into_bytes()
}
