//! Records persisted by the ledger.

use crate::error::LedgerResult;
use chrono::{DateTime, SubsecRound, Utc};
use mediadrm_types::{KeyId, KeySetId, OfflineLicenseState, SecureStopId, SessionId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Current time at the millisecond precision the ledger stores.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Lifecycle of a secure stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecureStopState {
    /// The session that produced it is still consuming keys.
    Active,
    /// The session closed or its license was released; ready to report.
    Finalized,
}

impl fmt::Display for SecureStopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Finalized => "finalized",
        })
    }
}

impl FromStr for SecureStopState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "finalized" => Ok(Self::Finalized),
            other => Err(format!("unknown secure stop state: {other}")),
        }
    }
}

/// Proof of key consumption, reported to the license server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureStopRecord {
    pub id: SecureStopId,
    pub session_id: SessionId,
    pub key_set_id: Option<KeySetId>,
    pub key_ids: Vec<KeyId>,
    pub state: SecureStopState,
    pub started_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl SecureStopRecord {
    /// Creates an active record for keys just loaded into a session.
    pub fn new(session_id: SessionId, key_set_id: Option<KeySetId>, key_ids: Vec<KeyId>) -> Self {
        Self {
            id: SecureStopId::new(),
            session_id,
            key_set_id,
            key_ids,
            state: SecureStopState::Active,
            started_at: now(),
            finalized_at: None,
        }
    }

    /// The opaque form handed to callers for delivery to the server.
    pub fn to_bytes(&self) -> LedgerResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes the opaque form.
    pub fn from_bytes(bytes: &[u8]) -> LedgerResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A persisted offline license.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineLicenseRecord {
    pub key_set_id: KeySetId,
    pub state: OfflineLicenseState,
    pub mime_type: Option<String>,
    /// Digest of the init data the license was requested for.
    pub init_digest: Option<String>,
    /// Key material sealed under the device key.
    pub sealed_keys: Vec<u8>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OfflineLicenseRecord {
    /// Creates a usable record.
    pub fn new(
        key_set_id: KeySetId,
        mime_type: Option<String>,
        init_digest: Option<String>,
        sealed_keys: Vec<u8>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = now();
        Self {
            key_set_id,
            state: OfflineLicenseState::Usable,
            mime_type,
            init_digest,
            sealed_keys,
            expires_at,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Credentials written by a successful provisioning response.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceCredentials {
    pub scheme_id: Uuid,
    pub device_id: String,
    pub device_key: Vec<u8>,
    pub provisioned_at: DateTime<Utc>,
}

impl fmt::Debug for DeviceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCredentials")
            .field("scheme_id", &self.scheme_id)
            .field("device_id", &self.device_id)
            .field("device_key", &"[REDACTED]")
            .field("provisioned_at", &self.provisioned_at)
            .finish()
    }
}

impl DeviceCredentials {
    /// Creates credentials stamped with the current time.
    pub fn new(scheme_id: Uuid, device_id: impl Into<String>, device_key: Vec<u8>) -> Self {
        Self {
            scheme_id,
            device_id: device_id.into(),
            device_key,
            provisioned_at: now(),
        }
    }
}
