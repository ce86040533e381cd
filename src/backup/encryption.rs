//! AES-256-GCM encryption of backup archives.
//!
//! One key is generated on first use and kept in a key file readable only by
//! the owner. Every later run reuses that key; there is no rotation and no
//! per-backup data key.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, OsRng},
};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info};

use crate::errors::EncryptionError;
use crate::utils::{sha256_bytes, sha256_file};

/// Size of the AES-GCM nonce in bytes (96 bits)
const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;
/// Header identifying the file layout: MAGIC || nonce || ciphertext+tag
const MAGIC: &[u8; 8] = b"DBVENC01";
const ENCRYPTED_SUFFIX: &str = "enc";

#[derive(Clone)]
pub struct EncryptionManager {
    key_path: PathBuf,
    key: OnceLock<[u8; KEY_SIZE]>,
}

impl EncryptionManager {
    pub fn new(key_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: key_path.into(),
            key: OnceLock::new(),
        }
    }

    fn key(&self) -> Result<&[u8; KEY_SIZE], EncryptionError> {
        if let Some(key) = self.key.get() {
            return Ok(key);
        }
        let key = load_or_create_key(&self.key_path)?;
        Ok(self.key.get_or_init(|| key))
    }

    /// Short fingerprint of the loaded key, recorded with each encrypted backup.
    pub fn key_id(&self) -> Result<String, EncryptionError> {
        let digest = sha256_bytes(self.key()?);
        Ok(digest[..16].to_string())
    }

    /// Encrypts `input` into `<input>.enc`, returning the output path and the
    /// SHA-256 of the ciphertext file.
    pub fn encrypt(&self, input: &Path) -> Result<(PathBuf, String), EncryptionError> {
        let cipher = Aes256Gcm::new_from_slice(self.key()?)
            .map_err(|e| EncryptionError::Cipher(e.to_string()))?;
        let plaintext = fs::read(input)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_ref())
            .map_err(|e| EncryptionError::Cipher(format!("Encryption failed: {}", e)))?;

        let output = append_extension(input, ENCRYPTED_SUFFIX);
        let mut file = fs::File::create(&output)?;
        file.write_all(MAGIC)?;
        file.write_all(&nonce_bytes)?;
        file.write_all(&ciphertext)?;
        file.sync_all()?;
        drop(file);

        let checksum = sha256_file(&output)?;
        info!(
            "✓ Encrypted {} ({} bytes) to {}",
            input.display(),
            plaintext.len(),
            output.display()
        );
        Ok((output, checksum))
    }

    /// Inverse of [`encrypt`](Self::encrypt). Fails closed: nothing is written
    /// unless the ciphertext authenticates under the loaded key.
    pub fn decrypt(&self, input: &Path) -> Result<PathBuf, EncryptionError> {
        let data = fs::read(input)?;
        let header = MAGIC.len() + NONCE_SIZE;
        if data.len() < header || &data[..MAGIC.len()] != MAGIC {
            return Err(EncryptionError::Format(input.display().to_string()));
        }
        let (nonce_bytes, ciphertext) = data[MAGIC.len()..].split_at(NONCE_SIZE);

        let cipher = Aes256Gcm::new_from_slice(self.key()?)
            .map_err(|e| EncryptionError::Cipher(e.to_string()))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| EncryptionError::Authentication)?;

        let output = decrypted_path(input);
        fs::write(&output, &plaintext)?;
        debug!("Decrypted {} to {}", input.display(), output.display());
        Ok(output)
    }

    /// Like [`decrypt`](Self::decrypt) but first checks that the archive was
    /// written under the currently loaded key.
    pub fn decrypt_for(&self, input: &Path, expected_key_id: &str) -> Result<PathBuf, EncryptionError> {
        let actual = self.key_id()?;
        if actual != expected_key_id {
            return Err(EncryptionError::KeyMismatch {
                expected: expected_key_id.to_string(),
                actual,
            });
        }
        self.decrypt(input)
    }
}

fn load_or_create_key(path: &Path) -> Result<[u8; KEY_SIZE], EncryptionError> {
    let key_error = |message: String| EncryptionError::KeyFile {
        path: path.to_path_buf(),
        message,
    };

    if path.exists() {
        let encoded = fs::read_to_string(path).map_err(|e| key_error(e.to_string()))?;
        let bytes = hex::decode(encoded.trim()).map_err(|e| key_error(e.to_string()))?;
        return <[u8; KEY_SIZE]>::try_from(bytes.as_slice())
            .map_err(|_| key_error(format!("expected {} key bytes, found {}", KEY_SIZE, bytes.len())));
    }

    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| key_error(e.to_string()))?;
        }
    }
    write_restricted(path, hex::encode(key).as_bytes()).map_err(|e| key_error(e.to_string()))?;
    info!("Generated new encryption key at {}", path.display());
    Ok(key)
}

#[cfg(unix)]
fn write_restricted(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_restricted(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(contents)
}

fn append_extension(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

fn decrypted_path(input: &Path) -> PathBuf {
    if input.extension().is_some_and(|ext| ext == ENCRYPTED_SUFFIX) {
        input.with_extension("")
    } else {
        append_extension(input, "dec")
    }
}
