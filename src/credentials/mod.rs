//! Credential-at-rest encryption for Stream and Account passwords.
//!
//! Stream URLs and Xtream Account passwords are stored AES-256-GCM encrypted.
//! The key is derived with HKDF-SHA256 from a per-install random salt and the
//! host's machine identifier, so the ciphertext in the database is useless
//! without both the salt file and the host it was generated on.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

const SALT_FILENAME: &str = "credential_salt";
const SALT_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;
const HKDF_INFO: &[u8] = b"iptv-bridge credential encryption v1";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("encryption error: {0}")]
    EncryptionError(String),
    #[error("decryption error: {0}")]
    DecryptionError(String),
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, CredentialError>;

/// Encrypts and decrypts stream/account passwords for database storage.
pub struct CredentialManager {
    data_dir: PathBuf,
}

impl CredentialManager {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    pub fn encrypt_password(&self, password: &str) -> Result<Vec<u8>> {
        let key = self.derive_key()?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CredentialError::EncryptionError(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, password.as_bytes())
            .map_err(|e| CredentialError::EncryptionError(e.to_string()))?;

        let mut result = nonce_bytes.to_vec();
        result.extend(ciphertext);
        Ok(result)
    }

    pub fn decrypt_password(&self, encrypted: &[u8]) -> Result<String> {
        if encrypted.len() < NONCE_LENGTH {
            return Err(CredentialError::InvalidData("encrypted data too short".to_string()));
        }

        let key = self.derive_key()?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CredentialError::DecryptionError(e.to_string()))?;

        let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_LENGTH);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| CredentialError::DecryptionError(e.to_string()))?;

        String::from_utf8(plaintext).map_err(|e| CredentialError::DecryptionError(e.to_string()))
    }

    fn derive_key(&self) -> Result<[u8; 32]> {
        let salt = self.get_or_create_salt()?;
        let machine_id = machine_identifier();

        let hk = Hkdf::<Sha256>::new(Some(&salt), &machine_id);
        let mut key = [0u8; 32];
        hk.expand(HKDF_INFO, &mut key)
            .map_err(|e| CredentialError::EncryptionError(format!("key derivation failed: {}", e)))?;
        Ok(key)
    }

    fn get_or_create_salt(&self) -> Result<[u8; SALT_LENGTH]> {
        let salt_path = self.data_dir.join(SALT_FILENAME);

        if salt_path.exists() {
            let salt_data = fs::read(&salt_path)?;
            if salt_data.len() == SALT_LENGTH {
                let mut salt = [0u8; SALT_LENGTH];
                salt.copy_from_slice(&salt_data);
                return Ok(salt);
            }
        }

        let mut salt = [0u8; SALT_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut salt);

        if let Some(parent) = salt_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&salt_path, salt)?;

        Ok(salt)
    }
}

fn machine_identifier() -> Vec<u8> {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "default-machine".to_string())
        .into_bytes()
}
