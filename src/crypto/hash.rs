//! BLAKE3 hashing
//!
//! Content digests for transfer metadata and transfer ID derivation.

/// Size of a hash output in bytes
pub const HASH_SIZE: usize = 32;

/// A hash output
pub type HashOutput = [u8; HASH_SIZE];

const TRANSFER_ID_CONTEXT: &str = "passage 2026-01 transfer id";

/// Hashing operations
pub struct Hash;

impl Hash {
    /// Compute hash of data
    pub fn hash(data: &[u8]) -> HashOutput {
        blake3::hash(data).into()
    }

    /// Compute hash and return as hex string
    pub fn hash_hex(data: &[u8]) -> String {
        hex::encode(Self::hash(data))
    }

    /// Derive the public rendezvous identifier for a transfer code
    ///
    /// Uses BLAKE3 in key-derivation mode under its own context, so the
    /// identifier shares nothing with the encryption key derivation.
    pub fn transfer_id(code: &[u8]) -> String {
        let derived = blake3::derive_key(TRANSFER_ID_CONTEXT, code);
        hex::encode(&derived[..16])
    }

    /// Verify that data matches an expected hex digest
    pub fn verify_hex(data: &[u8], expected_hex: &str) -> bool {
        let Ok(expected) = hex::decode(expected_hex) else {
            return false;
        };
        constant_time_eq(&Self::hash(data), &expected)
    }
}

/// Constant-time comparison to prevent timing attacks
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        let data = b"quarterly-report.pdf";
        assert_eq!(Hash::hash(data), Hash::hash(data));
        assert_ne!(Hash::hash(b"input1"), Hash::hash(b"input2"));
    }

    #[test]
    fn test_transfer_id_shape() {
        let id = Hash::transfer_id(b"amber-falcon-river");
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, Hash::transfer_id(b"amber-falcon-river"));
        assert_ne!(id, Hash::transfer_id(b"amber-falcon-rivet"));
    }

    #[test]
    fn test_verify_hex() {
        let data = b"test data";
        let digest = Hash::hash_hex(data);

        assert!(Hash::verify_hex(data, &digest));
        assert!(!Hash::verify_hex(b"wrong data", &digest));
        assert!(!Hash::verify_hex(data, "not-hex"));
        assert!(!Hash::verify_hex(data, &digest[..10]));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(&[1u8; 32], &[1u8; 32]));
        assert!(!constant_time_eq(&[1u8; 32], &[2u8; 32]));
        assert!(!constant_time_eq(&[1u8; 32], &[1u8; 31]));
    }
}
