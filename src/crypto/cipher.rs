//! Payload encryption
//!
//! Four modes are supported. GCM and ChaCha20-Poly1305 are AEAD ciphers: the
//! tag travels inside the ciphertext and decryption fails closed. Hybrid runs
//! ChaCha20-Poly1305 and then AES-256-GCM under two independent sub-keys.
//! CBC only provides confidentiality: padding is validated, but a modified
//! ciphertext can decrypt to modified plaintext without any error.

use aes_gcm::Aes256Gcm;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use chacha20poly1305::{
    aead::{self, Aead, KeyInit, Payload},
    ChaCha20Poly1305,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use super::error::{CryptoError, CryptoResult};
use super::kdf::{derive_subkey, KEY_SIZE};

/// Size of the AEAD nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// AES block size, also the CBC IV size
pub const BLOCK_SIZE: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const HYBRID_LAYER_1: &[u8] = b"passage hybrid layer 1";
const HYBRID_LAYER_2: &[u8] = b"passage hybrid layer 2";

/// Encryption mode applied to a payload
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionMode {
    /// AES-256-CBC with PKCS#7 padding. No tamper detection.
    Cbc,
    /// AES-256-GCM
    Gcm,
    /// ChaCha20-Poly1305
    #[serde(rename = "chacha20poly1305")]
    ChaCha20Poly1305,
    /// ChaCha20-Poly1305 wrapped in AES-256-GCM, independent sub-keys
    Hybrid,
}

impl EncryptionMode {
    /// Whether decryption detects tampering
    pub fn is_authenticated(self) -> bool {
        !matches!(self, EncryptionMode::Cbc)
    }

    /// Bytes added to the plaintext, ignoring CBC padding
    pub fn overhead(self) -> usize {
        match self {
            EncryptionMode::Cbc => BLOCK_SIZE,
            EncryptionMode::Gcm | EncryptionMode::ChaCha20Poly1305 => NONCE_SIZE + TAG_SIZE,
            EncryptionMode::Hybrid => 2 * (NONCE_SIZE + TAG_SIZE),
        }
    }
}

impl std::fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EncryptionMode::Cbc => "AES-256-CBC",
            EncryptionMode::Gcm => "AES-256-GCM",
            EncryptionMode::ChaCha20Poly1305 => "ChaCha20-Poly1305",
            EncryptionMode::Hybrid => "ChaCha20-Poly1305+AES-256-GCM",
        };
        f.write_str(name)
    }
}

/// Symmetric cipher for encryption/decryption
pub struct Cipher;

impl Cipher {
    /// Encrypt `plaintext` under `mode`
    ///
    /// AEAD modes authenticate `aad` without encrypting it; CBC ignores it.
    pub fn encrypt(
        key: &[u8; KEY_SIZE],
        mode: EncryptionMode,
        plaintext: &[u8],
        aad: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        match mode {
            EncryptionMode::Cbc => Ok(cbc_encrypt(key, plaintext)),
            EncryptionMode::Gcm => {
                aead_encrypt(&Aes256Gcm::new(key.into()), plaintext, aad)
            }
            EncryptionMode::ChaCha20Poly1305 => {
                aead_encrypt(&ChaCha20Poly1305::new(key.into()), plaintext, aad)
            }
            EncryptionMode::Hybrid => {
                let (mut key1, mut key2) = hybrid_keys(key)?;
                let inner = aead_encrypt(&ChaCha20Poly1305::new((&key1).into()), plaintext, aad);
                let outer = inner.and_then(|inner| {
                    aead_encrypt(&Aes256Gcm::new((&key2).into()), &inner, aad)
                });
                key1.zeroize();
                key2.zeroize();
                outer
            }
        }
    }

    /// Decrypt a ciphertext produced by [`Cipher::encrypt`] with the same mode
    pub fn decrypt(
        key: &[u8; KEY_SIZE],
        mode: EncryptionMode,
        ciphertext: &[u8],
        aad: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        match mode {
            EncryptionMode::Cbc => cbc_decrypt(key, ciphertext),
            EncryptionMode::Gcm => {
                aead_decrypt(&Aes256Gcm::new(key.into()), ciphertext, aad)
            }
            EncryptionMode::ChaCha20Poly1305 => {
                aead_decrypt(&ChaCha20Poly1305::new(key.into()), ciphertext, aad)
            }
            EncryptionMode::Hybrid => {
                let (mut key1, mut key2) = hybrid_keys(key)?;
                // Layers come off in reverse order
                let inner = aead_decrypt(&Aes256Gcm::new((&key2).into()), ciphertext, aad);
                let plaintext = inner.and_then(|inner| {
                    aead_decrypt(&ChaCha20Poly1305::new((&key1).into()), &inner, aad)
                });
                key1.zeroize();
                key2.zeroize();
                plaintext
            }
        }
    }
}

/// `key1 = Derive(key)`, `key2 = Derive(key1)`
fn hybrid_keys(key: &[u8; KEY_SIZE]) -> CryptoResult<([u8; KEY_SIZE], [u8; KEY_SIZE])> {
    let key1 = derive_subkey(key, HYBRID_LAYER_1)?;
    let key2 = derive_subkey(&key1, HYBRID_LAYER_2)?;
    Ok((key1, key2))
}

/// Returns: nonce || ciphertext || tag
fn aead_encrypt<C: Aead>(cipher: &C, plaintext: &[u8], aad: &[u8]) -> CryptoResult<Vec<u8>> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let payload = Payload {
        msg: plaintext,
        aad,
    };
    let ciphertext = cipher
        .encrypt(<aead::Nonce<C>>::from_slice(&nonce_bytes), payload)
        .map_err(|_| CryptoError::EncryptionFailed("AEAD encryption rejected input".into()))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

fn aead_decrypt<C: Aead>(cipher: &C, ciphertext: &[u8], aad: &[u8]) -> CryptoResult<Vec<u8>> {
    // Minimum size: nonce + tag
    if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::Integrity);
    }

    let (nonce, encrypted) = ciphertext.split_at(NONCE_SIZE);
    let payload = Payload {
        msg: encrypted,
        aad,
    };
    cipher
        .decrypt(<aead::Nonce<C>>::from_slice(nonce), payload)
        .map_err(|_| CryptoError::Integrity)
}

/// Returns: iv || ciphertext
fn cbc_encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; BLOCK_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new(key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut result = Vec::with_capacity(BLOCK_SIZE + ciphertext.len());
    result.extend_from_slice(&iv);
    result.extend_from_slice(&ciphertext);
    result
}

fn cbc_decrypt(key: &[u8; KEY_SIZE], ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
    // IV plus at least one padded block
    if ciphertext.len() < 2 * BLOCK_SIZE || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidPadding);
    }

    let (iv, body) = ciphertext.split_at(BLOCK_SIZE);
    let mut iv_block = [0u8; BLOCK_SIZE];
    iv_block.copy_from_slice(iv);

    Aes256CbcDec::new(key.into(), &iv_block.into())
        .decrypt_padded_vec_mut::<Pkcs7>(body)
        .map_err(|_| CryptoError::InvalidPadding)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_MODES: [EncryptionMode; 4] = [
        EncryptionMode::Cbc,
        EncryptionMode::Gcm,
        EncryptionMode::ChaCha20Poly1305,
        EncryptionMode::Hybrid,
    ];

    const AEAD_MODES: [EncryptionMode; 3] = [
        EncryptionMode::Gcm,
        EncryptionMode::ChaCha20Poly1305,
        EncryptionMode::Hybrid,
    ];

    #[test]
    fn test_encrypt_decrypt_all_modes() {
        let key = [42u8; KEY_SIZE];
        let inputs: [&[u8]; 4] = [b"", b"x", b"exactly sixteen!", &[0xAB; 4099]];

        for mode in ALL_MODES {
            for plaintext in inputs {
                let ciphertext = Cipher::encrypt(&key, mode, plaintext, b"meta").unwrap();
                let decrypted = Cipher::decrypt(&key, mode, &ciphertext, b"meta").unwrap();
                assert_eq!(plaintext, decrypted.as_slice(), "mode {mode}");
            }
        }
    }

    #[test]
    fn test_ciphertext_different_each_time() {
        let key = [42u8; KEY_SIZE];
        for mode in ALL_MODES {
            let ct1 = Cipher::encrypt(&key, mode, b"Hello", b"").unwrap();
            let ct2 = Cipher::encrypt(&key, mode, b"Hello", b"").unwrap();
            assert_ne!(ct1, ct2);
        }
    }

    #[test]
    fn test_every_bit_flip_detected_by_aead_modes() {
        let key = [9u8; KEY_SIZE];
        for mode in AEAD_MODES {
            let ciphertext = Cipher::encrypt(&key, mode, b"attack at dawn", b"hdr").unwrap();
            for byte in 0..ciphertext.len() {
                for bit in 0..8 {
                    let mut tampered = ciphertext.clone();
                    tampered[byte] ^= 1 << bit;
                    assert_eq!(
                        Cipher::decrypt(&key, mode, &tampered, b"hdr"),
                        Err(CryptoError::Integrity),
                        "mode {mode}, byte {byte}, bit {bit}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_wrong_key_or_aad_fails() {
        for mode in AEAD_MODES {
            let ciphertext = Cipher::encrypt(&[1u8; KEY_SIZE], mode, b"Secret", b"hdr").unwrap();
            assert_eq!(
                Cipher::decrypt(&[2u8; KEY_SIZE], mode, &ciphertext, b"hdr"),
                Err(CryptoError::Integrity)
            );
            assert_eq!(
                Cipher::decrypt(&[1u8; KEY_SIZE], mode, &ciphertext, b"other"),
                Err(CryptoError::Integrity)
            );
        }
    }

    #[test]
    fn test_truncated_aead_ciphertext_fails() {
        let key = [3u8; KEY_SIZE];
        for mode in AEAD_MODES {
            assert_eq!(
                Cipher::decrypt(&key, mode, &[0u8; NONCE_SIZE + TAG_SIZE - 1], b""),
                Err(CryptoError::Integrity)
            );
        }
    }

    #[test]
    fn test_cbc_rejects_misaligned_input() {
        let key = [5u8; KEY_SIZE];
        let ciphertext = Cipher::encrypt(&key, EncryptionMode::Cbc, b"hello world", b"").unwrap();

        assert_eq!(
            Cipher::decrypt(&key, EncryptionMode::Cbc, &ciphertext[..ciphertext.len() - 1], b""),
            Err(CryptoError::InvalidPadding)
        );
        assert_eq!(
            Cipher::decrypt(&key, EncryptionMode::Cbc, &ciphertext[..BLOCK_SIZE], b""),
            Err(CryptoError::InvalidPadding)
        );
    }

    #[test]
    fn test_cbc_does_not_detect_iv_tampering() {
        // Flipping an IV bit flips the same bit of the first plaintext block
        // and decryption still succeeds. CBC gives no integrity guarantee.
        let key = [5u8; KEY_SIZE];
        let mut ciphertext =
            Cipher::encrypt(&key, EncryptionMode::Cbc, b"pay alice 100 coins", b"").unwrap();
        ciphertext[4] ^= 0x01;

        let decrypted = Cipher::decrypt(&key, EncryptionMode::Cbc, &ciphertext, b"").unwrap();
        assert_ne!(decrypted, b"pay alice 100 coins");
        assert_eq!(decrypted.len(), 19);
    }

    #[test]
    fn test_hybrid_layers_use_distinct_keys() {
        let key = [11u8; KEY_SIZE];
        let ciphertext = Cipher::encrypt(&key, EncryptionMode::Hybrid, b"layered", b"").unwrap();

        assert_eq!(ciphertext.len(), 7 + EncryptionMode::Hybrid.overhead());
        // The outer layer is not plain GCM under the parent key
        assert!(Cipher::decrypt(&key, EncryptionMode::Gcm, &ciphertext, b"").is_err());
    }

    #[test]
    fn test_mode_serde_names() {
        let json = serde_json::to_string(&EncryptionMode::ChaCha20Poly1305).unwrap();
        assert_eq!(json, "\"chacha20poly1305\"");
        let mode: EncryptionMode = serde_json::from_str("\"hybrid\"").unwrap();
        assert_eq!(mode, EncryptionMode::Hybrid);
        assert!(!EncryptionMode::Cbc.is_authenticated());
        assert!(EncryptionMode::Gcm.is_authenticated());
    }
}
