//! The crypto engine seam.
//!
//! The manager never touches key material or server signatures directly;
//! it routes every such operation through `Arc<dyn CryptoEngine>`. Hardware
//! backed implementations live outside this workspace. `SoftwareCryptoEngine`
//! is the reference implementation used for embedding and tests.

use crate::content::{
    CipherAlgorithm, MacAlgorithm, aes_cbc_decrypt, aes_cbc_encrypt, hmac_sign, hmac_verify,
};
use crate::envelope::open_envelope;
use crate::error::{CryptoError, CryptoResult};
use crate::key::{ContentKey, DeviceKey};
use crate::message::{
    KeyRequestMessage, LicenseResponse, ProvisionRequestMessage, ProvisionResponse,
    SecureStopRelease,
};
use crate::seal::{SealedData, open, seal};
use ed25519_dalek::VerifyingKey;

/// Operations the manager delegates to the decryption engine.
///
/// Implementations own signature verification and crypto primitives.
/// Calls may block; the manager holds at most one session lock while
/// calling in.
pub trait CryptoEngine: Send + Sync {
    /// Encodes a key request into opaque bytes for the license server.
    fn encode_key_request(&self, request: &KeyRequestMessage) -> CryptoResult<Vec<u8>>;

    /// Verifies and decodes a license server response.
    fn parse_key_response(&self, response: &[u8]) -> CryptoResult<LicenseResponse>;

    /// Encodes a provisioning request into opaque bytes.
    fn encode_provision_request(&self, request: &ProvisionRequestMessage) -> CryptoResult<Vec<u8>>;

    /// Verifies and decodes a provisioning server response.
    fn parse_provision_response(&self, response: &[u8]) -> CryptoResult<ProvisionResponse>;

    /// Verifies and decodes a secure stop release message.
    fn parse_secure_stop_release(&self, response: &[u8]) -> CryptoResult<SecureStopRelease>;

    /// Seals key material under the device key.
    fn seal(&self, key: &DeviceKey, plaintext: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Opens key material sealed by [`CryptoEngine::seal`].
    fn open(&self, key: &DeviceKey, sealed: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Cipher algorithms this engine implements.
    fn cipher_algorithms(&self) -> Vec<CipherAlgorithm>;

    /// MAC algorithms this engine implements.
    fn mac_algorithms(&self) -> Vec<MacAlgorithm>;

    fn encrypt(
        &self,
        algorithm: CipherAlgorithm,
        key: &ContentKey,
        input: &[u8],
        iv: &[u8],
    ) -> CryptoResult<Vec<u8>>;

    fn decrypt(
        &self,
        algorithm: CipherAlgorithm,
        key: &ContentKey,
        input: &[u8],
        iv: &[u8],
    ) -> CryptoResult<Vec<u8>>;

    fn sign(&self, algorithm: MacAlgorithm, key: &ContentKey, message: &[u8])
    -> CryptoResult<Vec<u8>>;

    fn verify(
        &self,
        algorithm: MacAlgorithm,
        key: &ContentKey,
        message: &[u8],
        signature: &[u8],
    ) -> CryptoResult<bool>;
}

/// Software engine verifying server messages against one Ed25519 key.
#[derive(Debug, Clone)]
pub struct SoftwareCryptoEngine {
    server_key: VerifyingKey,
}

impl SoftwareCryptoEngine {
    /// Creates an engine that trusts the given server public key.
    pub fn new(server_public_key: &[u8; 32]) -> CryptoResult<Self> {
        let server_key = VerifyingKey::from_bytes(server_public_key)
            .map_err(|_| CryptoError::MalformedMessage("invalid server public key".to_string()))?;
        Ok(Self { server_key })
    }
}

impl CryptoEngine for SoftwareCryptoEngine {
    fn encode_key_request(&self, request: &KeyRequestMessage) -> CryptoResult<Vec<u8>> {
        Ok(serde_json::to_vec(request)?)
    }

    fn parse_key_response(&self, response: &[u8]) -> CryptoResult<LicenseResponse> {
        open_envelope(response, &self.server_key)
    }

    fn encode_provision_request(&self, request: &ProvisionRequestMessage) -> CryptoResult<Vec<u8>> {
        Ok(serde_json::to_vec(request)?)
    }

    fn parse_provision_response(&self, response: &[u8]) -> CryptoResult<ProvisionResponse> {
        open_envelope(response, &self.server_key)
    }

    fn parse_secure_stop_release(&self, response: &[u8]) -> CryptoResult<SecureStopRelease> {
        open_envelope(response, &self.server_key)
    }

    fn seal(&self, key: &DeviceKey, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        Ok(seal(key, plaintext)?.to_bytes())
    }

    fn open(&self, key: &DeviceKey, sealed: &[u8]) -> CryptoResult<Vec<u8>> {
        open(key, &SealedData::from_bytes(sealed)?)
    }

    fn cipher_algorithms(&self) -> Vec<CipherAlgorithm> {
        vec![CipherAlgorithm::AesCbcNoPadding]
    }

    fn mac_algorithms(&self) -> Vec<MacAlgorithm> {
        vec![MacAlgorithm::HmacSha256]
    }

    fn encrypt(
        &self,
        algorithm: CipherAlgorithm,
        key: &ContentKey,
        input: &[u8],
        iv: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        match algorithm {
            CipherAlgorithm::AesCbcNoPadding => aes_cbc_encrypt(key, input, iv),
        }
    }

    fn decrypt(
        &self,
        algorithm: CipherAlgorithm,
        key: &ContentKey,
        input: &[u8],
        iv: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        match algorithm {
            CipherAlgorithm::AesCbcNoPadding => aes_cbc_decrypt(key, input, iv),
        }
    }

    fn sign(
        &self,
        algorithm: MacAlgorithm,
        key: &ContentKey,
        message: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        match algorithm {
            MacAlgorithm::HmacSha256 => hmac_sign(key, message),
        }
    }

    fn verify(
        &self,
        algorithm: MacAlgorithm,
        key: &ContentKey,
        message: &[u8],
        signature: &[u8],
    ) -> CryptoResult<bool> {
        match algorithm {
            MacAlgorithm::HmacSha256 => hmac_verify(key, message, signature),
        }
    }
}
