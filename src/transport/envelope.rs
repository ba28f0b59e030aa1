//! Transfer metadata and the envelope format moved by backends
//!
//! Wire layout:
//!
//! ```text
//! 0x50 | version (1) | u32 LE len | metadata JSON | u32 LE len | ciphertext
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{TransportError, TransportResult};
use crate::crypto::Hash;
use crate::network::NetworkType;

const ENVELOPE_TAG: u8 = 0x50;
const ENVELOPE_VERSION: u8 = 1;

/// Public rendezvous identifier of a transfer, derived from its code
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferId(String);

impl TransferId {
    /// Derive the identifier for a transfer code
    pub fn derive(code: &str) -> Self {
        TransferId(Hash::transfer_id(code.as_bytes()))
    }

    /// Identifier as a string, safe to use in file names and room names
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this looks like an identifier produced by [`TransferId::derive`]
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == 32 && self.0.bytes().all(|b| b.is_ascii_hexdigit())
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Description of the payload, sent in the clear ahead of the ciphertext
///
/// Immutable once a session starts. For authenticated modes it is bound to
/// the ciphertext as associated data, so altering it breaks decryption.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMetadata {
    /// Rendezvous identifier
    pub transfer_id: TransferId,
    /// Name of the transferred file
    pub file_name: String,
    /// Plaintext size in bytes
    pub file_size: u64,
    /// BLAKE3 hex digest of the plaintext
    pub digest: String,
    /// Sender's network classification, used by both sides for mode selection
    pub network_hint: NetworkType,
}

impl TransferMetadata {
    /// Build metadata for a plaintext payload
    pub fn describe(
        transfer_id: TransferId,
        file_name: impl Into<String>,
        data: &[u8],
        network_hint: NetworkType,
    ) -> Self {
        TransferMetadata {
            transfer_id,
            file_name: file_name.into(),
            file_size: data.len() as u64,
            digest: Hash::hash_hex(data),
            network_hint,
        }
    }

    /// Associated data bound to AEAD ciphertexts
    pub fn aad(&self) -> Vec<u8> {
        format!(
            "passage-v1\0{}\0{}\0{}\0{}\0{}",
            self.transfer_id, self.file_name, self.file_size, self.digest, self.network_hint
        )
        .into_bytes()
    }
}

/// Metadata plus ciphertext: the unit every backend moves
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Transfer description
    pub metadata: TransferMetadata,
    /// Encrypted payload
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Serialize envelope to bytes
    pub fn to_bytes(&self) -> TransportResult<Vec<u8>> {
        let metadata = serde_json::to_vec(&self.metadata)
            .map_err(|e| TransportError::InvalidData(e.to_string()))?;

        let mut bytes = Vec::with_capacity(2 + 8 + metadata.len() + self.ciphertext.len());
        bytes.push(ENVELOPE_TAG);
        bytes.push(ENVELOPE_VERSION);
        write_vec32(&mut bytes, &metadata)?;
        write_vec32(&mut bytes, &self.ciphertext)?;
        Ok(bytes)
    }

    /// Deserialize envelope from bytes
    pub fn from_bytes(bytes: &[u8]) -> TransportResult<Self> {
        match bytes {
            [ENVELOPE_TAG, ENVELOPE_VERSION, rest @ ..] => {
                let (metadata, rest) = read_vec32(rest)?;
                let (ciphertext, rest) = read_vec32(rest)?;
                if !rest.is_empty() {
                    return Err(TransportError::InvalidData(format!(
                        "{} trailing bytes after envelope",
                        rest.len()
                    )));
                }

                let metadata: TransferMetadata = serde_json::from_slice(&metadata)
                    .map_err(|e| TransportError::InvalidData(e.to_string()))?;
                Ok(Envelope {
                    metadata,
                    ciphertext,
                })
            }
            [ENVELOPE_TAG, version, ..] => Err(TransportError::InvalidData(format!(
                "Unsupported envelope version: {}",
                version
            ))),
            [] => Err(TransportError::InvalidData("Empty envelope".to_string())),
            _ => Err(TransportError::InvalidData("Not an envelope".to_string())),
        }
    }
}

fn write_vec32(bytes: &mut Vec<u8>, data: &[u8]) -> TransportResult<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| TransportError::InvalidData("Field larger than 4 GiB".to_string()))?;
    bytes.extend_from_slice(&len.to_le_bytes());
    bytes.extend_from_slice(data);
    Ok(())
}

/// Helper: read a length-prefixed vector (32-bit length)
fn read_vec32(bytes: &[u8]) -> TransportResult<(Vec<u8>, &[u8])> {
    if bytes.len() < 4 {
        return Err(TransportError::InvalidData("Not enough data".to_string()));
    }

    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let rest = &bytes[4..];

    if rest.len() < len {
        return Err(TransportError::InvalidData("Not enough data".to_string()));
    }

    Ok((rest[..len].to_vec(), &rest[len..]))
}
