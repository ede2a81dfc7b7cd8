//! Error types for the session manager.
//!
//! Callers branch on [`DrmError::kind`]. `NotProvisioned` and `ResourceBusy`
//! are retryable after corrective action; everything else is final for the
//! call that produced it.

use mediadrm_crypto::CryptoError;
use mediadrm_ledger::LedgerError;
use mediadrm_types::SessionId;
use thiserror::Error;
use uuid::Uuid;

/// Result type for manager operations.
pub type DrmResult<T> = Result<T, DrmError>;

/// Errors surfaced by the session manager.
#[derive(Debug, Error)]
pub enum DrmError {
    /// The device must be provisioned before the operation can proceed.
    #[error("device not provisioned")]
    NotProvisioned,

    /// A device-wide resource limit was reached.
    #[error("resource busy: {0}")]
    ResourceBusy(String),

    /// The server rejected the request, or its response failed validation.
    #[error("denied by server: {0}")]
    DeniedByServer(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The call is not valid in the current state (closed session, stale
    /// response, unusable key).
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The session was invalidated by the platform.
    #[error("session lost: {0}")]
    SessionLost(SessionId),

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(Uuid),

    /// Unexpected failure. Carries a diagnostic string only.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Discriminant of a [`DrmError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotProvisioned,
    ResourceBusy,
    DeniedByServer,
    InvalidArgument,
    IllegalState,
    SessionLost,
    UnsupportedScheme,
    Internal,
}

impl DrmError {
    /// Returns the error's kind.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotProvisioned => ErrorKind::NotProvisioned,
            Self::ResourceBusy(_) => ErrorKind::ResourceBusy,
            Self::DeniedByServer(_) => ErrorKind::DeniedByServer,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::IllegalState(_) => ErrorKind::IllegalState,
            Self::SessionLost(_) => ErrorKind::SessionLost,
            Self::UnsupportedScheme(_) => ErrorKind::UnsupportedScheme,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True when retrying after corrective action (provisioning, closing
    /// sessions) can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotProvisioned | Self::ResourceBusy(_))
    }

    /// True for the illegal-state family, which includes lost sessions.
    #[must_use]
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, Self::IllegalState(_) | Self::SessionLost(_))
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn illegal(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    /// Maps a failure to validate or decode a server message.
    pub(crate) fn denied(err: CryptoError) -> Self {
        Self::DeniedByServer(err.to_string())
    }
}

impl From<LedgerError> for DrmError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(what) => Self::InvalidArgument(format!("unknown {what}")),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<CryptoError> for DrmError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidKeyLength { .. }
            | CryptoError::InvalidIvLength { .. }
            | CryptoError::UnsupportedAlgorithm(_)
            | CryptoError::Encryption(_)
            | CryptoError::Decryption(_) => Self::InvalidArgument(err.to_string()),
            CryptoError::InvalidSignature | CryptoError::MalformedMessage(_) => {
                Self::DeniedByServer(err.to_string())
            }
            CryptoError::Serialization(_) => Self::Internal(err.to_string()),
        }
    }
}
