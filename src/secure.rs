//! Secure store - the native encrypted backend.
//!
//! One file per cell, holding the base64 of `nonce || ciphertext` where the
//! ciphertext is the AES-256-GCM encryption of the record's JSON text, with
//! the cell name as associated data. The master key is operator-managed and
//! supplied through [`StorageConfig`](crate::router::StorageConfig).
//!
//! Cipher: AES-256-GCM, fresh random nonce per write.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use base64::Engine;
use rand::RngCore;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::backend::{Backend, StoredRecord};
use crate::error::{Result, StoreError};

/// Master key length in bytes.
pub const KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;

/// Encrypted file-per-cell implementation of [`Backend`].
pub struct SecureStore {
    dir: PathBuf,
    key: [u8; KEY_BYTES],
}

impl SecureStore {
    /// Create a store writing under the given directory with the given
    /// master key. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>, key: [u8; KEY_BYTES]) -> Self {
        Self {
            dir: dir.into(),
            key,
        }
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.cell"))
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| StoreError::Crypto("invalid master key".to_string()))
    }

    fn try_read(&self, name: &str, path: &Path) -> Result<Option<StoredRecord>> {
        let encoded = match fs::read_to_string(path) {
            Ok(encoded) => encoded,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let blob = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| StoreError::Crypto("invalid record encoding".to_string()))?;
        if blob.len() < NONCE_BYTES {
            return Err(StoreError::Crypto("record too short".to_string()));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_BYTES);

        let plaintext = self
            .cipher()?
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: name.as_bytes(),
                },
            )
            .map_err(|_| StoreError::Crypto("record decryption failed".to_string()))?;

        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    fn try_write(&self, name: &str, record: &StoredRecord) -> Result<()> {
        let plaintext = serde_json::to_vec(record)?;

        let mut nonce_bytes = [0u8; NONCE_BYTES];
        rand::rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher()?
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext.as_slice(),
                    aad: name.as_bytes(),
                },
            )
            .map_err(|_| StoreError::Crypto("record encryption failed".to_string()))?;

        let mut blob = nonce_bytes.to_vec();
        blob.extend_from_slice(&ciphertext);

        fs::create_dir_all(&self.dir)?;
        fs::write(
            self.record_path(name),
            base64::engine::general_purpose::STANDARD.encode(blob),
        )?;
        Ok(())
    }
}

#[async_trait]
impl Backend for SecureStore {
    async fn read(&self, name: &str) -> Option<StoredRecord> {
        let path = self.record_path(name);
        match self.try_read(name, &path) {
            Ok(record) => record,
            Err(err) => {
                warn!(%name, %err, "secure read failed, treating record as absent");
                None
            }
        }
    }

    async fn write(&self, name: &str, record: StoredRecord) {
        if let Err(err) = self.try_write(name, &record) {
            warn!(%name, %err, "dropping secure store write");
        }
    }

    async fn delete(&self, name: &str) {
        if let Err(err) = fs::remove_file(self.record_path(name)) {
            if err.kind() != ErrorKind::NotFound {
                warn!(%name, %err, "secure delete failed");
            }
        }
    }
}
