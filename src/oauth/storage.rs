//! Token persistence backends.
//!
//! Two variants: an in-memory map for tests, and an encrypted on-disk store
//! using AES-256-GCM with a key derived by SHA-256 of a passphrase. The
//! nonce is prepended to the ciphertext, files are mode 0600, and provider
//! names are sanitized before they become file names.

use std::collections::HashMap;
use std::path::PathBuf;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

/// Nonce length for AES-GCM (96 bits).
const NONCE_LENGTH: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("token storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("token record is corrupt: {0}")]
    Corrupt(String),

    #[error("decryption failed: wrong passphrase or corrupt data")]
    Decrypt,

    #[error("encryption failed")]
    Encrypt,
}

/// Tokens persisted per provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredTokens {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix seconds.
    pub expires_at: i64,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Pluggable token persistence.
#[async_trait]
pub trait TokenStorage: Send + Sync {
    async fn load(&self, provider: &str) -> Result<Option<StoredTokens>, StorageError>;
    async fn save(&self, provider: &str, tokens: &StoredTokens) -> Result<(), StorageError>;
    async fn delete(&self, provider: &str) -> Result<(), StorageError>;
}

/// In-memory storage for tests.
#[derive(Debug, Default)]
pub struct MemoryTokenStorage {
    tokens: RwLock<HashMap<String, StoredTokens>>,
}

impl MemoryTokenStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStorage for MemoryTokenStorage {
    async fn load(&self, provider: &str) -> Result<Option<StoredTokens>, StorageError> {
        Ok(self.tokens.read().await.get(provider).cloned())
    }

    async fn save(&self, provider: &str, tokens: &StoredTokens) -> Result<(), StorageError> {
        self.tokens
            .write()
            .await
            .insert(provider.to_string(), tokens.clone());
        Ok(())
    }

    async fn delete(&self, provider: &str) -> Result<(), StorageError> {
        self.tokens.write().await.remove(provider);
        Ok(())
    }
}

/// Encrypted file-per-provider storage. No `Debug` impl; the derived key
/// must never reach the logs.
pub struct EncryptedFileTokenStorage {
    dir: PathBuf,
    key: [u8; 32],
}

impl EncryptedFileTokenStorage {
    /// Derive the AES key as SHA-256 of the passphrase.
    pub fn new(dir: PathBuf, passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { dir, key }
    }

    fn file_for(&self, provider: &str) -> PathBuf {
        self.dir.join(format!("{}.token", sanitize_name(provider)))
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, StorageError> {
        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|_| StorageError::Encrypt)?;
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| StorageError::Encrypt)?;

        let mut combined = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(combined)
    }

    fn decrypt(&self, combined: &[u8]) -> Result<Vec<u8>, StorageError> {
        if combined.len() < NONCE_LENGTH {
            return Err(StorageError::Corrupt("record shorter than nonce".into()));
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LENGTH);
        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|_| StorageError::Decrypt)?;
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| StorageError::Decrypt)
    }
}

#[async_trait]
impl TokenStorage for EncryptedFileTokenStorage {
    async fn load(&self, provider: &str) -> Result<Option<StoredTokens>, StorageError> {
        let path = self.file_for(provider);
        let combined = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let plaintext = self.decrypt(&combined)?;
        let tokens = serde_json::from_slice(&plaintext)
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;
        Ok(Some(tokens))
    }

    async fn save(&self, provider: &str, tokens: &StoredTokens) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.dir)?;
        let plaintext =
            serde_json::to_vec(tokens).map_err(|e| StorageError::Corrupt(e.to_string()))?;
        let combined = self.encrypt(&plaintext)?;

        let path = self.file_for(provider);
        {
            use std::io::Write;
            let mut options = std::fs::OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let mut file = options.open(&path)?;
            file.write_all(&combined)?;
        }
        Ok(())
    }

    async fn delete(&self, provider: &str) -> Result<(), StorageError> {
        match std::fs::remove_file(self.file_for(provider)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Replace characters that do not belong in a file name.
fn sanitize_name(provider: &str) -> String {
    provider
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
