//! Signed server envelopes.
//!
//! Server messages use the format `base64url(payload).base64url(signature)`.
//! The payload is JSON. The Ed25519 signature covers the base64url-encoded
//! payload string, not the decoded JSON.

use crate::error::{CryptoError, CryptoResult};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Serialize, de::DeserializeOwned};

/// Serializes `payload` and signs it, producing envelope bytes.
///
/// This is the server side of the exchange. The manager only opens
/// envelopes; signing is exposed for license server tooling and tests.
pub fn sign_envelope<T: Serialize>(signing_key: &SigningKey, payload: &T) -> CryptoResult<Vec<u8>> {
    let json = serde_json::to_vec(payload)?;
    let payload_b64 = URL_SAFE_NO_PAD.encode(json);
    let signature = signing_key.sign(payload_b64.as_bytes());
    let sig_b64 = URL_SAFE_NO_PAD.encode(signature.to_bytes());
    Ok(format!("{payload_b64}.{sig_b64}").into_bytes())
}

/// Verifies an envelope against the server key and decodes its payload.
pub fn open_envelope<T: DeserializeOwned>(
    envelope: &[u8],
    verifying_key: &VerifyingKey,
) -> CryptoResult<T> {
    let text = std::str::from_utf8(envelope)
        .map_err(|_| CryptoError::MalformedMessage("envelope is not UTF-8".to_string()))?
        .trim();

    let Some((payload_b64, signature_b64)) = text.split_once('.') else {
        return Err(CryptoError::MalformedMessage(
            "envelope must have exactly two parts separated by a dot".to_string(),
        ));
    };
    if signature_b64.contains('.') {
        return Err(CryptoError::MalformedMessage(
            "envelope must have exactly two parts separated by a dot".to_string(),
        ));
    }

    let sig_bytes = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|e| CryptoError::MalformedMessage(format!("invalid signature base64: {e}")))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|_| CryptoError::MalformedMessage("invalid signature length".to_string()))?;

    verifying_key
        .verify(payload_b64.as_bytes(), &signature)
        .map_err(|_| CryptoError::InvalidSignature)?;

    let payload_json = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|e| CryptoError::MalformedMessage(format!("invalid payload base64: {e}")))?;

    serde_json::from_slice(&payload_json)
        .map_err(|e| CryptoError::MalformedMessage(format!("invalid payload JSON: {e}")))
}
