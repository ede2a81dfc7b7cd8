//! Crypto layer for the mediadrm session manager.
//!
//! - [`CryptoEngine`]: the seam to the decryption engine, with
//!   [`SoftwareCryptoEngine`] as the reference implementation
//! - Signed server envelopes (Ed25519 over base64url JSON)
//! - Wire payloads for key, provisioning and secure stop exchanges
//! - Content keys (AES-128-CBC, HMAC-SHA256) and the device sealing key
//!   (ChaCha20-Poly1305)

pub mod content;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod key;
pub mod message;
pub mod seal;

pub use content::{CipherAlgorithm, MacAlgorithm};
pub use engine::{CryptoEngine, SoftwareCryptoEngine};
pub use envelope::{open_envelope, sign_envelope};
pub use error::{CryptoError, CryptoResult};
pub use key::{CONTENT_KEY_SIZE, ContentKey, DEVICE_KEY_SIZE, DeviceKey};
pub use message::{
    KeyGrant, KeyRequestMessage, LicenseResponse, ProvisionRequestMessage, ProvisionResponse,
    SecureStopRelease, decode_device_key, encode_device_key,
};
