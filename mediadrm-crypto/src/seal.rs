//! Sealing of offline key material using ChaCha20-Poly1305.
//!
//! Offline licenses store their content keys sealed under the device key so
//! the ledger never holds plaintext key material.

use crate::error::{CryptoError, CryptoResult};
use crate::key::DeviceKey;
use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Size of nonce in bytes (96 bits for ChaCha20-Poly1305).
pub const NONCE_SIZE: usize = 12;

/// Size of authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Sealed data with the nonce needed to open it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SealedData {
    /// The nonce used for sealing (unique per call).
    pub nonce: [u8; NONCE_SIZE],
    /// The ciphertext (includes auth tag).
    pub ciphertext: Vec<u8>,
}

impl SealedData {
    /// Encodes as `nonce || ciphertext`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(NONCE_SIZE + self.ciphertext.len());
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    /// Decodes from `nonce || ciphertext`.
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::Decryption("sealed data too short".to_string()));
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[..NONCE_SIZE]);
        Ok(Self {
            nonce,
            ciphertext: bytes[NONCE_SIZE..].to_vec(),
        })
    }
}

/// Seals plaintext under the device key.
pub fn seal(key: &DeviceKey, plaintext: &[u8]) -> CryptoResult<SealedData> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    Ok(SealedData {
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Opens data sealed by [`seal`] with the same device key.
pub fn open(key: &DeviceKey, sealed: &SealedData) -> CryptoResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    let nonce = Nonce::from_slice(&sealed.nonce);

    cipher
        .decrypt(nonce, sealed.ciphertext.as_ref())
        .map_err(|_| CryptoError::Decryption("wrong device key or tampered data".to_string()))
}
