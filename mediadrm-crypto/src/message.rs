//! Wire payloads exchanged with license and provisioning servers.
//!
//! Requests leave the device as plain JSON. Responses arrive inside signed
//! envelopes (see [`crate::envelope`]). Every response echoes the request id
//! it answers so the manager can reject responses to superseded requests.

use crate::error::{CryptoError, CryptoResult};
use crate::key::{ContentKey, DeviceKey};
use base64::{Engine, engine::general_purpose::STANDARD};
use mediadrm_types::{
    KeyId, KeySetId, KeyStatus, KeyType, RequestId, RequestType, SecureStopId, SecurityLevel,
    SessionId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A key request as sent to a license server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRequestMessage {
    pub request_id: RequestId,
    pub request_type: RequestType,
    pub key_type: KeyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_set_id: Option<KeySetId>,
    pub device_id: String,
    pub security_level: SecurityLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Container-specific init data, base64 encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_data: Option<String>,
    #[serde(default)]
    pub optional_params: BTreeMap<String, String>,
    /// Ids of keys already held, for renewal and release.
    #[serde(default)]
    pub key_ids: Vec<KeyId>,
}

impl KeyRequestMessage {
    /// Decodes request bytes, as a license server would.
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// One key granted by a license response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGrant {
    pub key_id: KeyId,
    /// Raw content key, base64 encoded.
    pub key: String,
    pub status: KeyStatus,
}

impl KeyGrant {
    /// Creates a grant carrying `key`.
    pub fn new(key_id: KeyId, key: &ContentKey, status: KeyStatus) -> Self {
        Self {
            key_id,
            key: STANDARD.encode(key.as_bytes()),
            status,
        }
    }

    /// Decodes the granted content key.
    pub fn content_key(&self) -> CryptoResult<ContentKey> {
        let bytes = STANDARD
            .decode(&self.key)
            .map_err(|e| CryptoError::MalformedMessage(format!("invalid key base64: {e}")))?;
        ContentKey::from_slice(&bytes)
    }
}

/// A license server's answer to a key request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LicenseResponse {
    /// Keys were granted.
    Granted {
        request_id: RequestId,
        keys: Vec<KeyGrant>,
        /// Expiration in milliseconds since the epoch. Absent means never.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires_at_ms: Option<i64>,
    },
    /// The server confirmed release of an offline license.
    Released { request_id: RequestId },
    /// The server refused the request.
    Denied { request_id: RequestId, reason: String },
    /// The server requires the device to provision again.
    ReprovisionRequired { request_id: RequestId },
}

impl LicenseResponse {
    /// Returns the id of the request this response answers.
    pub fn request_id(&self) -> RequestId {
        match self {
            Self::Granted { request_id, .. }
            | Self::Released { request_id }
            | Self::Denied { request_id, .. }
            | Self::ReprovisionRequired { request_id } => *request_id,
        }
    }
}

/// A provisioning request as sent to a provisioning server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionRequestMessage {
    pub request_id: RequestId,
    pub scheme_id: Uuid,
    /// Random nonce, hex encoded.
    pub nonce: String,
}

impl ProvisionRequestMessage {
    /// Decodes request bytes, as a provisioning server would.
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A provisioning server's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProvisionResponse {
    /// The device was provisioned.
    Provisioned {
        request_id: RequestId,
        device_id: String,
        /// Device sealing key, base64 encoded.
        device_key: String,
    },
    /// The server refused to provision the device.
    Denied { request_id: RequestId, reason: String },
}

impl ProvisionResponse {
    /// Returns the id of the request this response answers.
    pub fn request_id(&self) -> RequestId {
        match self {
            Self::Provisioned { request_id, .. } | Self::Denied { request_id, .. } => *request_id,
        }
    }
}

/// Encodes a device key for a [`ProvisionResponse::Provisioned`] payload.
pub fn encode_device_key(key: &DeviceKey) -> String {
    STANDARD.encode(key.as_bytes())
}

/// Decodes the device key of a [`ProvisionResponse::Provisioned`] payload.
pub fn decode_device_key(encoded: &str) -> CryptoResult<DeviceKey> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| CryptoError::MalformedMessage(format!("invalid device key base64: {e}")))?;
    DeviceKey::from_slice(&bytes)
}

/// Server confirmation that secure stops were received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureStopRelease {
    pub secure_stop_ids: Vec<SecureStopId>,
}
