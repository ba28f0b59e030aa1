//! Cryptographic primitives for Passage
//!
//! This module provides the security engine and its building blocks:
//! - `kdf`: transfer code stretching (PBKDF2-HMAC-SHA256) and HKDF sub-keys
//! - `cipher`: AES-256-GCM, ChaCha20-Poly1305, hybrid and legacy CBC modes
//! - `hash`: BLAKE3 digests and transfer IDs
//! - `engine`: deterministic key and mode decisions for a transfer

pub mod cipher;
pub mod engine;
pub mod error;
pub mod hash;
pub mod kdf;

// Re-export commonly used types
pub use cipher::{Cipher, EncryptionMode};
pub use engine::{IntegrityLevel, SecurityEngine, SizeBracket};
pub use error::{CryptoError, CryptoResult};
pub use hash::Hash;
pub use kdf::{strengthen_code, DerivedKey, MIN_CODE_LENGTH};

#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::network::NetworkType;

    #[test]
    fn test_independent_peers_agree() {
        // Both peers only share the code and the file size
        let code = "velvet-harbor-compass";
        let sender = SecurityEngine::default();
        let receiver = SecurityEngine::default();

        let sender_key = sender.strengthen_code(code).unwrap();
        let receiver_key = receiver.strengthen_code(code).unwrap();
        assert_eq!(sender_key.as_bytes(), receiver_key.as_bytes());

        let message = b"quarterly numbers attached";
        let mode = sender.select_mode(message.len() as u64, NetworkType::Open);
        let ciphertext = sender.encrypt(message, &sender_key, mode, b"id").unwrap();

        let receiver_mode = receiver.select_mode(message.len() as u64, NetworkType::Open);
        assert_eq!(mode, receiver_mode);

        let decrypted = receiver
            .decrypt(&ciphertext, &receiver_key, receiver_mode, b"id")
            .unwrap();
        assert_eq!(message, decrypted.as_slice());
    }

    #[test]
    fn test_wrong_code_fails_closed() {
        let engine = SecurityEngine::default();
        let right = engine.strengthen_code("velvet-harbor-compass").unwrap();
        let wrong = engine.strengthen_code("velvet-harbor-compost").unwrap();

        let ciphertext = engine
            .encrypt(b"secret", &right, EncryptionMode::ChaCha20Poly1305, b"")
            .unwrap();
        assert_eq!(
            engine.decrypt(&ciphertext, &wrong, EncryptionMode::ChaCha20Poly1305, b""),
            Err(CryptoError::Integrity)
        );
    }
}
