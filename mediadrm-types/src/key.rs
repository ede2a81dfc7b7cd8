//! Key, key-request and license-state types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What a key request asks the license server for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    /// Keys for streaming content, scoped to one session.
    Streaming,
    /// Keys persisted on the device and addressable by a key set id.
    Offline,
    /// Release of previously acquired offline keys.
    Release,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Streaming => "STREAMING",
            Self::Offline => "OFFLINE",
            Self::Release => "RELEASE",
        })
    }
}

/// Classification of a key request returned by the exchange engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    /// First request for the content in this session.
    Initial,
    /// Renewal of keys already loaded.
    Renewal,
    /// Release of offline keys.
    Release,
    /// Keys are already usable; no round trip is needed.
    None,
    /// Keys are usable but must still be refreshed.
    Update,
}

impl RequestType {
    /// Returns true when the request payload must be delivered to a server.
    #[must_use]
    pub fn needs_round_trip(self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initial => "INITIAL",
            Self::Renewal => "RENEWAL",
            Self::Release => "RELEASE",
            Self::None => "NONE",
            Self::Update => "UPDATE",
        })
    }
}

/// Status of a single key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// The key can be used to decrypt.
    Usable,
    /// The key's license has expired.
    Expired,
    /// The output protection requirements of the key are not met.
    OutputNotAllowed,
    /// Status is not yet known.
    Pending,
    /// The key is unusable because of an internal error.
    InternalError,
    /// The key becomes usable at a future time.
    UsableInFuture,
}

impl KeyStatus {
    /// Every status, in declaration order.
    pub const ALL: [KeyStatus; 6] = [
        Self::Usable,
        Self::Expired,
        Self::OutputNotAllowed,
        Self::Pending,
        Self::InternalError,
        Self::UsableInFuture,
    ];

    /// Returns true when the key may be used for crypto operations.
    #[must_use]
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Usable)
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Usable => "USABLE",
            Self::Expired => "EXPIRED",
            Self::OutputNotAllowed => "OUTPUT_NOT_ALLOWED",
            Self::Pending => "PENDING",
            Self::InternalError => "INTERNAL_ERROR",
            Self::UsableInFuture => "USABLE_IN_FUTURE",
        })
    }
}

/// Identifier of a key within a key set, as assigned by the license server.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(#[serde(with = "hex_bytes")] Vec<u8>);

impl KeyId {
    /// Wraps raw key id bytes.
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Parses a hex-encoded key id.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        Ok(Self(hex::decode(s)?))
    }

    /// Returns the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the lowercase hex encoding.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<&[u8]> for KeyId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// A key as observed by callers: its id and committed status.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    /// Key identifier.
    pub key_id: KeyId,
    /// Current status.
    pub status: KeyStatus,
}

impl Key {
    /// Creates a key entry.
    #[must_use]
    pub fn new(key_id: KeyId, status: KeyStatus) -> Self {
        Self { key_id, status }
    }
}

/// Durable state of an offline license.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineLicenseState {
    /// No offline license is known under the key set id.
    Unknown,
    /// Keys are available for decryption.
    Usable,
    /// The server has confirmed the release of the license.
    Released,
}

impl fmt::Display for OfflineLicenseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::Usable => "usable",
            Self::Released => "released",
        })
    }
}

impl std::str::FromStr for OfflineLicenseState {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "usable" => Ok(Self::Usable),
            "released" => Ok(Self::Released),
            other => Err(crate::Error::InvalidValue(format!(
                "unknown offline license state: {other}"
            ))),
        }
    }
}
