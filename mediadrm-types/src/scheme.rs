//! DRM schemes known to the device.
//!
//! A scheme is discovered at startup and never created or destroyed by the
//! manager. Its supported levels determine how session-open requests are
//! resolved.

use crate::SecurityLevel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// One DRM technology supported by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scheme {
    /// Scheme identifier (16-byte UUID).
    pub id: Uuid,
    /// Human-readable name.
    pub name: String,
    /// Container MIME types the scheme can handle.
    pub mime_types: Vec<String>,
    /// Security levels the implementation can run at.
    pub supported_levels: BTreeSet<SecurityLevel>,
}

impl Scheme {
    /// Creates a scheme description.
    #[must_use]
    pub fn new(
        id: Uuid,
        name: impl Into<String>,
        mime_types: impl IntoIterator<Item = impl Into<String>>,
        supported_levels: impl IntoIterator<Item = SecurityLevel>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            mime_types: mime_types.into_iter().map(Into::into).collect(),
            supported_levels: supported_levels
                .into_iter()
                .filter(|l| *l != SecurityLevel::Unknown)
                .collect(),
        }
    }

    /// The native (highest) level of the implementation.
    #[must_use]
    pub fn native_level(&self) -> SecurityLevel {
        self.supported_levels
            .iter()
            .next_back()
            .copied()
            .unwrap_or(SecurityLevel::Unknown)
    }

    /// The lowest level the implementation supports.
    #[must_use]
    pub fn lowest_level(&self) -> SecurityLevel {
        self.supported_levels
            .iter()
            .next()
            .copied()
            .unwrap_or(SecurityLevel::Unknown)
    }

    /// Returns true if the scheme handles the given container MIME type.
    #[must_use]
    pub fn supports_mime(&self, mime_type: &str) -> bool {
        self.mime_types
            .iter()
            .any(|m| m.eq_ignore_ascii_case(mime_type))
    }

    /// Returns true if the scheme can run at exactly this level.
    #[must_use]
    pub fn supports_level(&self, level: SecurityLevel) -> bool {
        self.supported_levels.contains(&level)
    }

    /// Returns the highest supported level that is not above `level`.
    #[must_use]
    pub fn next_lower_supported(&self, level: SecurityLevel) -> Option<SecurityLevel> {
        self.supported_levels.range(..=level).next_back().copied()
    }
}

/// The set of schemes discovered on this device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemeRegistry {
    schemes: Vec<Scheme>,
}

impl SchemeRegistry {
    /// Creates a registry from discovered schemes.
    #[must_use]
    pub fn new(schemes: Vec<Scheme>) -> Self {
        Self { schemes }
    }

    /// Looks up a scheme by id.
    #[must_use]
    pub fn find(&self, id: &Uuid) -> Option<&Scheme> {
        self.schemes.iter().find(|s| s.id == *id)
    }

    /// Returns all registered schemes.
    pub fn schemes(&self) -> impl Iterator<Item = &Scheme> {
        self.schemes.iter()
    }

    /// Reports whether a scheme is supported, optionally for a MIME type and
    /// at a specific security level.
    #[must_use]
    pub fn is_crypto_scheme_supported(
        &self,
        id: &Uuid,
        mime_type: Option<&str>,
        level: Option<SecurityLevel>,
    ) -> bool {
        let Some(scheme) = self.find(id) else {
            return false;
        };
        if let Some(mime) = mime_type {
            if !scheme.supports_mime(mime) {
                return false;
            }
        }
        match level {
            Some(level) => scheme.supports_level(level),
            None => true,
        }
    }
}
