//! Key material held by the manager.
//!
//! Content keys arrive in license responses and never leave the manager.
//! The device key is delivered by provisioning and seals offline key
//! material at rest.

use crate::error::{CryptoError, CryptoResult};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of a content key in bytes (AES-128).
pub const CONTENT_KEY_SIZE: usize = 16;

/// Size of the device sealing key in bytes (ChaCha20-Poly1305).
pub const DEVICE_KEY_SIZE: usize = 32;

/// A content decryption key with automatic zeroization on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ContentKey {
    bytes: [u8; CONTENT_KEY_SIZE],
}

impl ContentKey {
    /// Creates a content key from raw bytes.
    pub fn from_bytes(bytes: [u8; CONTENT_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Creates a content key from a slice, checking its length.
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; CONTENT_KEY_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: CONTENT_KEY_SIZE,
                actual: bytes.len(),
            })?;
        Ok(Self { bytes })
    }

    /// Generates a random content key.
    pub fn random() -> Self {
        let mut bytes = [0u8; CONTENT_KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Returns the key bytes.
    pub fn as_bytes(&self) -> &[u8; CONTENT_KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// The per-device sealing key issued by the provisioning server.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DeviceKey {
    bytes: [u8; DEVICE_KEY_SIZE],
}

impl DeviceKey {
    /// Creates a device key from raw bytes.
    pub fn from_bytes(bytes: [u8; DEVICE_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Creates a device key from a slice, checking its length.
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; DEVICE_KEY_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: DEVICE_KEY_SIZE,
                actual: bytes.len(),
            })?;
        Ok(Self { bytes })
    }

    /// Generates a random device key.
    pub fn random() -> Self {
        let mut bytes = [0u8; DEVICE_KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Returns the key bytes.
    pub fn as_bytes(&self) -> &[u8; DEVICE_KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}
