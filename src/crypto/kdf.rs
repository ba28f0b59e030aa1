//! Transfer code stretching
//!
//! Turns a low-entropy transfer code into a 32-byte key. Both peers run the
//! same derivation from the same code and context, so the key never has to
//! travel: the salt is itself derived from the code rather than generated.

use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::error::{CryptoError, CryptoResult};

/// Size of derived keys in bytes
pub const KEY_SIZE: usize = 32;

/// Size of the deterministic salt in bytes
pub const SALT_SIZE: usize = 32;

/// Shortest transfer code accepted for key derivation
pub const MIN_CODE_LENGTH: usize = 8;

/// PBKDF2 work factor. Changing it breaks compatibility with older peers.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Mixed into every salt so keys are specific to this application
const APP_CONSTANT: &[u8] = b"passage/v1/5f3c9a7e";

/// A symmetric key derived from a transfer code, with the salt it was derived under
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    key: [u8; KEY_SIZE],
    salt: [u8; SALT_SIZE],
}

impl DerivedKey {
    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// The salt used for this key
    pub fn salt(&self) -> &[u8; SALT_SIZE] {
        &self.salt
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("salt", &hex::encode(self.salt))
            .finish_non_exhaustive()
    }
}

/// Stretch a transfer code into a key
///
/// `salt = SHA-256(code || context || APP_CONSTANT)`
/// `key = PBKDF2-HMAC-SHA256(code || context, salt, PBKDF2_ITERATIONS)`
///
/// Codes shorter than [`MIN_CODE_LENGTH`] are rejected before any work is done.
pub fn strengthen_code(code: &str, context: &str) -> CryptoResult<DerivedKey> {
    let length = code.chars().count();
    if length < MIN_CODE_LENGTH {
        return Err(CryptoError::WeakCode {
            length,
            minimum: MIN_CODE_LENGTH,
        });
    }

    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hasher.update(context.as_bytes());
    hasher.update(APP_CONSTANT);
    let salt: [u8; SALT_SIZE] = hasher.finalize().into();

    let mut password = Vec::with_capacity(code.len() + context.len());
    password.extend_from_slice(code.as_bytes());
    password.extend_from_slice(context.as_bytes());

    let mut key = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(&password, &salt, PBKDF2_ITERATIONS, &mut key);
    password.zeroize();

    Ok(DerivedKey { key, salt })
}

/// Derive an independent sub-key from a parent key with HKDF-SHA256
pub fn derive_subkey(parent: &[u8; KEY_SIZE], label: &[u8]) -> CryptoResult<[u8; KEY_SIZE]> {
    let hk = Hkdf::<Sha256>::new(None, parent);
    let mut okm = [0u8; KEY_SIZE];
    hk.expand(label, &mut okm)
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
    Ok(okm)
}
