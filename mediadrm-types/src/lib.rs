//! Core type definitions for the mediadrm session manager.
//!
//! This crate defines the plain data types shared by every layer:
//! - Opaque session, key set, secure stop and request identifiers (UUID v7)
//! - Security and HDCP levels
//! - Key, key request and offline license state enums
//! - Scheme descriptions and the scheme registry
//! - The event union delivered to listeners
//!
//! Nothing here carries protocol semantics; the state machines live in
//! `mediadrm-core`.

mod event;
mod ids;
mod key;
mod level;
mod scheme;

pub use event::{DrmEvent, EventKind};
pub use ids::{KeySetId, RequestId, SecureStopId, SessionId};
pub use key::{Key, KeyId, KeyStatus, KeyType, OfflineLicenseState, RequestType};
pub use level::{HdcpLevel, RequestedLevel, SecurityLevel};
pub use scheme::{Scheme, SchemeRegistry};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid value: {0}")]
    InvalidValue(String),
}
