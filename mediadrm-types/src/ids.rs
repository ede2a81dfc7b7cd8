//! Opaque identifier types handed out by the manager.
//!
//! All identifiers are UUID v7, so they sort by creation time. Callers treat
//! them as opaque: the byte form (`to_bytes`/`from_bytes`) is what crosses an
//! API boundary, the string form is what lands in the ledger.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a fresh identifier with the current timestamp.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Wraps an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }

            /// Returns the opaque 16-byte form.
            #[must_use]
            pub fn to_bytes(&self) -> [u8; 16] {
                *self.0.as_bytes()
            }

            /// Rebuilds an identifier from its opaque byte form.
            pub fn from_bytes(bytes: &[u8]) -> Result<Self, uuid::Error> {
                Ok(Self(Uuid::from_slice(bytes)?))
            }

            /// Parses an identifier from its string form.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

opaque_id!(
    /// Identifies one open cryptographic session. Valid between open and close.
    SessionId
);

opaque_id!(
    /// Identifies a durably persisted offline key set.
    KeySetId
);

opaque_id!(
    /// Identifies one secure stop record in the ledger.
    SecureStopId
);

opaque_id!(
    /// Correlates a key or provisioning request with the server's response.
    RequestId
);
