use crate::error::{IntegrityError, SyncError};
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};

pub const SALT_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
pub const KEY_SIZE: usize = 32;

const ARGON2_TIME_COST: u32 = 3;
const ARGON2_MEMORY_COST_KIB: u32 = 64 * 1024;
const ARGON2_PARALLELISM: u32 = 4;

/// Derives a 32-byte key from a password and 16-byte salt via Argon2id
/// (time=3, memory=64 MiB, parallelism=4). Deterministic: same inputs
/// always yield the same key.
pub fn derive_key(password: &[u8], salt: &[u8; SALT_SIZE]) -> Result<[u8; KEY_SIZE], SyncError> {
    let params = Params::new(
        ARGON2_MEMORY_COST_KIB,
        ARGON2_TIME_COST,
        ARGON2_PARALLELISM,
        Some(KEY_SIZE),
    )
    .map_err(|e| SyncError::Fatal(format!("KdfUnavailable: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(password, salt, &mut out)
        .map_err(|e| SyncError::Fatal(format!("KdfUnavailable: {e}")))?;
    Ok(out)
}

/// Encrypts `plaintext` under `key` with a fresh random nonce. Wire format:
/// `nonce (12B) ‖ ciphertext ‖ tag (16B)`.
pub fn encrypt(plaintext: &[u8], key: &[u8; KEY_SIZE]) -> Vec<u8> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .expect("AES-256-GCM encryption over bounded plaintext cannot fail");

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    out
}

/// Inverse of [`encrypt`]. Fails with [`IntegrityError::BadKeyOrTampered`]
/// if the authentication tag does not verify or the input is too short to
/// contain a nonce and tag.
pub fn decrypt(encrypted: &[u8], key: &[u8; KEY_SIZE]) -> Result<Vec<u8>, SyncError> {
    if encrypted.len() < NONCE_SIZE + TAG_SIZE {
        return Err(IntegrityError::BadKeyOrTampered.into());
    }
    let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| IntegrityError::BadKeyOrTampered.into())
}

/// 256-bit content hash, hex-encoded.
pub fn hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// 256-bit content hash, raw bytes.
pub fn hash_raw(bytes: &[u8]) -> [u8; 32] {
    *blake3::hash(bytes).as_bytes()
}

/// Fresh random 16-byte salt.
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Fresh random 32-byte data key.
pub fn generate_data_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

/// Incremental whole-file content hash, fed one chunk at a time so callers
/// never need the full plaintext resident in memory at once.
#[derive(Default)]
pub struct ContentHasher(blake3::Hasher);

impl ContentHasher {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(bytes);
        self
    }

    pub fn finalize(&self) -> String {
        self.0.finalize().to_hex().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_succeeds_with_correct_key() {
        let key = generate_data_key();
        let plaintext = b"hello\n";
        let encrypted = encrypt(plaintext, &key);
        let decrypted = decrypt(&encrypted, &key).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn roundtrip_fails_with_wrong_key() {
        let key = generate_data_key();
        let other = generate_data_key();
        let encrypted = encrypt(b"hello\n", &key);
        let err = decrypt(&encrypted, &other).unwrap_err();
        assert!(matches!(err, SyncError::Integrity(IntegrityError::BadKeyOrTampered)));
    }

    #[test]
    fn wire_format_has_nonce_and_tag_overhead() {
        let key = generate_data_key();
        let encrypted = encrypt(b"hello\n", &key);
        assert_eq!(encrypted.len(), 6 + NONCE_SIZE + TAG_SIZE);
    }

    #[test]
    fn derive_key_is_deterministic() {
        let salt = generate_salt();
        let a = derive_key(b"correct horse battery staple", &salt).unwrap();
        let b = derive_key(b"correct horse battery staple", &salt).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn hash_is_256_bit_hex() {
        let digest = hash(b"hello\n");
        assert_eq!(digest.len(), 64);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn encryption_roundtrips(data in proptest::collection::vec(any::<u8>(), 0..8192)) {
            let key = generate_data_key();
            let encrypted = encrypt(&data, &key);
            let decrypted = decrypt(&encrypted, &key).unwrap();
            prop_assert_eq!(decrypted, data);
        }

        #[test]
        fn wrong_key_never_decrypts(data in proptest::collection::vec(any::<u8>(), 0..8192)) {
            let key = generate_data_key();
            let wrong = generate_data_key();
            prop_assume!(key != wrong);
            let encrypted = encrypt(&data, &key);
            prop_assert!(decrypt(&encrypted, &wrong).is_err());
        }
    }
}
