//! DRM session and license key lifecycle manager.
//!
//! [`DrmManager`] opens sessions against one DRM scheme, exchanges opaque
//! key and provisioning payloads with remote servers, tracks key state per
//! session, and keeps secure stops and offline licenses in a durable
//! ledger across restarts.
//!
//! A typical streaming flow:
//! 1. `open_session` at the desired security level
//! 2. `get_key_request`, deliver the payload to the license server
//! 3. `provide_key_response` with the server's answer
//! 4. decrypt through a [`CryptoSession`] or the host's engine
//! 5. `close_session`, which finalizes the session's secure stops
//!
//! Listeners registered with [`DrmManager::register_listener`] observe key
//! status, expiration and session-loss events on a [`DispatchQueue`] of the
//! caller's choosing.

pub mod config;
pub mod crypto_session;
pub mod dispatcher;
pub mod error;
pub mod exchange;
pub mod manager;
pub mod metrics;
pub mod properties;
pub mod provisioning;
pub mod session;

pub use config::{CapacityPolicy, DrmConfig, LevelFallback};
pub use crypto_session::CryptoSession;
pub use dispatcher::{DispatchQueue, EventDispatcher, Listener, ListenerId};
pub use error::{DrmError, DrmResult, ErrorKind};
pub use exchange::{
    KeyRequest, KeyScope, QUERY_LICENSE_DURATION_REMAINING, QUERY_LICENSE_TYPE,
    QUERY_PLAY_ALLOWED,
};
pub use manager::DrmManager;
pub use metrics::Metrics;
pub use properties::{
    PROPERTY_ALGORITHMS, PROPERTY_DESCRIPTION, PROPERTY_DEVICE_UNIQUE_ID, PROPERTY_VENDOR,
    PROPERTY_VERSION, PropertyStore,
};
pub use provisioning::ProvisionRequest;
pub use session::SessionManager;

pub use mediadrm_types::{
    DrmEvent, EventKind, HdcpLevel, Key, KeyId, KeySetId, KeyStatus, KeyType,
    OfflineLicenseState, RequestType, RequestedLevel, Scheme, SchemeRegistry, SecureStopId,
    SecurityLevel, SessionId,
};
