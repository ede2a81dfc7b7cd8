//! Asynchronous notifications raised by session and key state transitions.
//!
//! Events are immutable values. They describe committed state only: a
//! listener never observes a key status that a later step of the same
//! response application could still change.

use crate::{Key, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Discriminant of a [`DrmEvent`], used as the listener registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ExpirationUpdate,
    KeyStatusChange,
    SessionLost,
    ProvisioningRequired,
    KeyRequired,
    SessionReclaimed,
    VendorDefined,
}

impl EventKind {
    /// Every event kind.
    pub const ALL: [EventKind; 7] = [
        Self::ExpirationUpdate,
        Self::KeyStatusChange,
        Self::SessionLost,
        Self::ProvisioningRequired,
        Self::KeyRequired,
        Self::SessionReclaimed,
        Self::VendorDefined,
    ];
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ExpirationUpdate => "expiration_update",
            Self::KeyStatusChange => "key_status_change",
            Self::SessionLost => "session_lost",
            Self::ProvisioningRequired => "provisioning_required",
            Self::KeyRequired => "key_required",
            Self::SessionReclaimed => "session_reclaimed",
            Self::VendorDefined => "vendor_defined",
        })
    }
}

/// A notification delivered to registered listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DrmEvent {
    /// The expiration time of a session's keys changed. `None` means never.
    ExpirationUpdate {
        session_id: SessionId,
        expires_at: Option<DateTime<Utc>>,
    },

    /// One or more keys of a session changed status.
    KeyStatusChange {
        session_id: SessionId,
        keys: Vec<Key>,
        has_new_usable_key: bool,
    },

    /// The session was invalidated by the platform and cannot be used again.
    SessionLost { session_id: SessionId },

    /// Device provisioning is required before the operation can proceed.
    ProvisioningRequired { session_id: Option<SessionId> },

    /// The session's keys are about to expire and should be requested again.
    KeyRequired { session_id: SessionId },

    /// The session was reclaimed to make room for a new one.
    SessionReclaimed { session_id: SessionId },

    /// Vendor-specific event with opaque data.
    VendorDefined {
        session_id: Option<SessionId>,
        code: i32,
        data: Vec<u8>,
    },
}

impl DrmEvent {
    /// Returns the event's kind.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ExpirationUpdate { .. } => EventKind::ExpirationUpdate,
            Self::KeyStatusChange { .. } => EventKind::KeyStatusChange,
            Self::SessionLost { .. } => EventKind::SessionLost,
            Self::ProvisioningRequired { .. } => EventKind::ProvisioningRequired,
            Self::KeyRequired { .. } => EventKind::KeyRequired,
            Self::SessionReclaimed { .. } => EventKind::SessionReclaimed,
            Self::VendorDefined { .. } => EventKind::VendorDefined,
        }
    }

    /// Returns the session the event concerns, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Self::ExpirationUpdate { session_id, .. }
            | Self::KeyStatusChange { session_id, .. }
            | Self::SessionLost { session_id }
            | Self::KeyRequired { session_id }
            | Self::SessionReclaimed { session_id } => Some(*session_id),
            Self::ProvisioningRequired { session_id }
            | Self::VendorDefined { session_id, .. } => *session_id,
        }
    }
}
