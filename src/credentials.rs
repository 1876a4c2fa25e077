use crate::crypto::{self, KEY_SIZE, SALT_SIZE};
use crate::error::SyncError;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const KEYFILE_NAME: &str = "keyfile.json";

/// On-disk representation of `<config>/keyfile.json` (sec 6). All binary
/// fields are base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyfileRecord {
    salt: String,
    encrypted_master_key: String,
    key_id: String,
    created_at: DateTime<Utc>,
}

/// Two-key credential store: `master_key` is derived from the user's
/// password via Argon2id, `data_key` is a random 256-bit key used to
/// encrypt file chunks. `data_key` is wrapped by `master_key` on disk.
pub struct CredentialStore {
    config_dir: PathBuf,
    key_id: String,
    created_at: DateTime<Utc>,
    salt: [u8; SALT_SIZE],
    encrypted_master_key: Vec<u8>,
    data_key: [u8; KEY_SIZE],
}

impl CredentialStore {
    fn keyfile_path(config_dir: &Path) -> PathBuf {
        config_dir.join(KEYFILE_NAME)
    }

    /// Creates a new store with a random data key, wrapped under a
    /// password-derived master key. Fails if a keyfile already exists.
    pub fn create(config_dir: &Path, password: &[u8]) -> Result<Self, SyncError> {
        std::fs::create_dir_all(config_dir)
            .map_err(|e| SyncError::Fatal(format!("failed to create config dir: {e}")))?;

        let keyfile = Self::keyfile_path(config_dir);
        if keyfile.exists() {
            return Err(SyncError::Validation(format!(
                "keystore already exists at {}",
                keyfile.display()
            )));
        }

        let data_key = crypto::generate_data_key();
        let salt = crypto::generate_salt();
        let master_key = crypto::derive_key(password, &salt)?;
        let encrypted_master_key = crypto::encrypt(&data_key, &master_key);
        let key_id = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now();

        let store = CredentialStore {
            config_dir: config_dir.to_path_buf(),
            key_id,
            created_at,
            salt,
            encrypted_master_key,
            data_key,
        };
        store.save()?;

        tracing::info!(target: "credentials", key_id = %store.key_id, "credential store created");
        Ok(store)
    }

    /// Loads an existing store, unlocking `data_key` with `password`.
    pub fn load(config_dir: &Path, password: &[u8]) -> Result<Self, SyncError> {
        let keyfile = Self::keyfile_path(config_dir);
        let content = std::fs::read_to_string(&keyfile).map_err(|_| {
            SyncError::NotFound(format!("keystore not found at {}", keyfile.display()))
        })?;
        let record: KeyfileRecord = serde_json::from_str(&content)
            .map_err(|e| SyncError::Validation(format!("corrupt keyfile: {e}")))?;

        let salt = decode_fixed::<SALT_SIZE>(&record.salt, "salt")?;
        let encrypted_master_key = BASE64
            .decode(&record.encrypted_master_key)
            .map_err(|e| SyncError::Validation(format!("bad base64 in keyfile: {e}")))?;

        let master_key = crypto::derive_key(password, &salt)?;
        let unwrapped = crypto::decrypt(&encrypted_master_key, &master_key)?;
        let data_key = to_fixed_key(unwrapped)?;

        tracing::info!(target: "credentials", key_id = %record.key_id, "credential store loaded");
        Ok(CredentialStore {
            config_dir: config_dir.to_path_buf(),
            key_id: record.key_id,
            created_at: record.created_at,
            salt,
            encrypted_master_key,
            data_key,
        })
    }

    /// The unwrapped data key used to encrypt/decrypt file chunks.
    pub fn data_key(&self) -> &[u8; KEY_SIZE] {
        &self.data_key
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Exports the data key as base64, for multi-device setup.
    pub fn export_key(&self) -> String {
        BASE64.encode(self.data_key)
    }

    /// Imports a data key exported from another device, re-wrapping it
    /// under a fresh salt derived from `password`. The wrapping key is
    /// always derived from the `password` argument of this call, never
    /// from any previously unlocked master key.
    pub fn import_key(&mut self, key_b64: &str, password: &[u8]) -> Result<(), SyncError> {
        let decoded = BASE64
            .decode(key_b64)
            .map_err(|e| SyncError::Validation(format!("invalid key format: not valid base64: {e}")))?;
        let data_key = to_fixed_key(decoded)?;

        let salt = crypto::generate_salt();
        let master_key = crypto::derive_key(password, &salt)?;
        let encrypted_master_key = crypto::encrypt(&data_key, &master_key);

        self.data_key = data_key;
        self.salt = salt;
        self.encrypted_master_key = encrypted_master_key;
        self.key_id = uuid::Uuid::new_v4().to_string();

        self.save()?;
        tracing::info!(target: "credentials", key_id = %self.key_id, "imported key");
        Ok(())
    }

    fn save(&self) -> Result<(), SyncError> {
        let record = KeyfileRecord {
            salt: BASE64.encode(self.salt),
            encrypted_master_key: BASE64.encode(&self.encrypted_master_key),
            key_id: self.key_id.clone(),
            created_at: self.created_at,
        };
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| SyncError::Fatal(format!("failed to serialize keyfile: {e}")))?;
        std::fs::write(Self::keyfile_path(&self.config_dir), json)
            .map_err(|e| SyncError::Fatal(format!("failed to write keyfile: {e}")))?;
        Ok(())
    }
}

fn decode_fixed<const N: usize>(b64: &str, field: &str) -> Result<[u8; N], SyncError> {
    let decoded = BASE64
        .decode(b64)
        .map_err(|e| SyncError::Validation(format!("bad base64 in {field}: {e}")))?;
    decoded
        .try_into()
        .map_err(|v: Vec<u8>| {
            SyncError::Validation(format!("invalid {field}: must be {N} bytes, got {}", v.len()))
        })
}

fn to_fixed_key(data: Vec<u8>) -> Result<[u8; KEY_SIZE], SyncError> {
    let len = data.len();
    data.try_into()
        .map_err(|_| SyncError::Validation(format!("invalid key: must be 32 bytes, got {len}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_load_roundtrips_data_key() {
        let dir = tempfile::tempdir().unwrap();
        let created = CredentialStore::create(dir.path(), b"correct horse battery staple").unwrap();
        let data_key = *created.data_key();

        let loaded = CredentialStore::load(dir.path(), b"correct horse battery staple").unwrap();
        assert_eq!(*loaded.data_key(), data_key);
    }

    #[test]
    fn create_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        CredentialStore::create(dir.path(), b"password").unwrap();
        let err = CredentialStore::create(dir.path(), b"password").unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn load_with_wrong_password_fails() {
        let dir = tempfile::tempdir().unwrap();
        CredentialStore::create(dir.path(), b"right password").unwrap();
        let err = CredentialStore::load(dir.path(), b"wrong password").unwrap_err();
        assert!(matches!(err, SyncError::Integrity(_)));
    }

    #[test]
    fn import_key_uses_call_password_not_cached_master_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CredentialStore::create(dir.path(), b"original password").unwrap();
        let imported_key = crypto::generate_data_key();
        let key_b64 = BASE64.encode(imported_key);

        store.import_key(&key_b64, b"new password").unwrap();
        assert_eq!(*store.data_key(), imported_key);

        // Old password must no longer unlock the store; only the new one does.
        assert!(CredentialStore::load(dir.path(), b"original password").is_err());
        let reloaded = CredentialStore::load(dir.path(), b"new password").unwrap();
        assert_eq!(*reloaded.data_key(), imported_key);
    }
}
