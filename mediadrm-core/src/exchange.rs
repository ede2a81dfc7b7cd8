//! Key request / response exchange.
//!
//! Each session has one slot per key type, and each offline key set has a
//! release slot. A slot moves `Idle -> Requested -> Applied | Failed`. A new
//! request replaces whatever was outstanding, and a response is accepted
//! only when it echoes the id of the most recent request. Responses are
//! validated and every ledger write is committed before session state
//! changes, so a rejected response leaves keys and ledger untouched.

use crate::config::DrmConfig;
use crate::dispatcher::EventDispatcher;
use crate::error::{DrmError, DrmResult};
use crate::metrics::Metrics;
use crate::provisioning::{Device, Provisioning};
use crate::session::{KeySet, LoadedKey, Session, SessionManager, SlotState, lock_session};
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use mediadrm_crypto::{CryptoEngine, KeyGrant, KeyRequestMessage, LicenseResponse};
use mediadrm_ledger::{OfflineLicenseRecord, SecureStopLedger, SecureStopRecord};
use mediadrm_types::{
    DrmEvent, KeyId, KeySetId, KeyStatus, KeyType, OfflineLicenseState, RequestId, RequestType,
    RequestedLevel, SessionId,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Vendor pair naming the loaded license types.
pub const QUERY_LICENSE_TYPE: &str = "LicenseType";
/// Vendor pair: `True` when at least one unexpired key is usable.
pub const QUERY_PLAY_ALLOWED: &str = "PlayAllowed";
/// Vendor pair: seconds until the earliest expiry, or `unlimited`.
pub const QUERY_LICENSE_DURATION_REMAINING: &str = "LicenseDurationRemaining";

/// What a key request or response is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyScope {
    /// Streaming or offline keys for an open session.
    Session(SessionId),
    /// Release of a stored offline license.
    KeySet(KeySetId),
}

impl KeyScope {
    fn session_id(self) -> Option<SessionId> {
        match self {
            Self::Session(id) => Some(id),
            Self::KeySet(_) => None,
        }
    }
}

impl fmt::Display for KeyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session(id) => write!(f, "session {id}"),
            Self::KeySet(id) => write!(f, "key set {id}"),
        }
    }
}

/// Opaque key request for the license server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRequest {
    pub data: Vec<u8>,
    pub request_type: RequestType,
    pub default_url: String,
}

/// Plaintext form of sealed offline key material.
#[derive(Serialize, Deserialize)]
struct StoredKeys {
    keys: Vec<KeyGrant>,
}

fn init_digest(init_data: &[u8]) -> String {
    hex::encode(Sha256::digest(init_data))
}

fn internal(context: &str, err: impl fmt::Display) -> DrmError {
    DrmError::Internal(format!("{context}: {err}"))
}

/// Drives key requests and applies license responses.
pub struct KeyExchangeEngine {
    sessions: Arc<SessionManager>,
    provisioning: Arc<Provisioning>,
    engine: Arc<dyn CryptoEngine>,
    ledger: SecureStopLedger,
    dispatcher: Arc<EventDispatcher>,
    metrics: Arc<Metrics>,
    config: Arc<DrmConfig>,
    release_slots: Mutex<HashMap<KeySetId, SlotState>>,
}

impl KeyExchangeEngine {
    pub(crate) fn new(
        sessions: Arc<SessionManager>,
        provisioning: Arc<Provisioning>,
        engine: Arc<dyn CryptoEngine>,
        ledger: SecureStopLedger,
        dispatcher: Arc<EventDispatcher>,
        metrics: Arc<Metrics>,
        config: Arc<DrmConfig>,
    ) -> Self {
        Self {
            sessions,
            provisioning,
            engine,
            ledger,
            dispatcher,
            metrics,
            config,
            release_slots: Mutex::new(HashMap::new()),
        }
    }

    // ── Requests ─────────────────────────────────────────────────

    /// Builds the next key request for `scope` and records it as the
    /// outstanding request of its slot.
    pub fn get_key_request(
        &self,
        scope: KeyScope,
        init_data: Option<&[u8]>,
        mime_type: Option<&str>,
        key_type: KeyType,
        optional_params: &BTreeMap<String, String>,
    ) -> DrmResult<KeyRequest> {
        let device = match self.provisioning.device() {
            Ok(device) => device,
            Err(err) => {
                self.dispatcher.emit(DrmEvent::ProvisioningRequired {
                    session_id: scope.session_id(),
                });
                return Err(err);
            }
        };

        match (scope, key_type) {
            (KeyScope::KeySet(id), KeyType::Release) => {
                self.release_request(id, &device, optional_params)
            }
            (KeyScope::Session(id), KeyType::Streaming | KeyType::Offline) => self
                .session_request(id, &device, init_data, mime_type, key_type, optional_params),
            (scope, key_type) => Err(DrmError::invalid(format!(
                "{key_type} keys cannot be requested for {scope}"
            ))),
        }
    }

    fn session_request(
        &self,
        session_id: SessionId,
        device: &Device,
        init_data: Option<&[u8]>,
        mime_type: Option<&str>,
        key_type: KeyType,
        optional_params: &BTreeMap<String, String>,
    ) -> DrmResult<KeyRequest> {
        let now = Utc::now();
        let window = self.config.renewal_window();
        let digest = init_data.map(init_digest);

        self.sessions.with_session(session_id, |session| {
            let existing = session.key_set(key_type);
            let same_content = existing.is_some_and(|ks| {
                digest.is_none() || digest.as_deref() == ks.init_digest.as_deref()
            });

            let request_type = match existing {
                Some(ks) if same_content => {
                    debug!(session = %session_id, loaded_by = %ks.request_type, "keys already loaded");
                    if digest.is_none() || !ks.all_usable() || ks.is_expired_at(now) {
                        RequestType::Renewal
                    } else if ks.expires_within(now, window) {
                        RequestType::Update
                    } else {
                        RequestType::None
                    }
                }
                _ => RequestType::Initial,
            };

            let slot = session
                .slot_mut(key_type)
                .ok_or_else(|| DrmError::invalid("release keys need a key set scope"))?;
            if request_type == RequestType::None {
                *slot = SlotState::Idle;
                debug!(session = %session_id, %key_type, "keys usable, no request needed");
                return Ok(KeyRequest {
                    data: Vec::new(),
                    request_type,
                    default_url: String::new(),
                });
            }

            let existing = session.key_set(key_type);
            let (mime_type, init_digest, key_ids, key_set_id) = match request_type {
                RequestType::Initial => {
                    let mime = mime_type.ok_or_else(|| {
                        DrmError::invalid("initial key request needs a mime type")
                    })?;
                    if init_data.is_none() {
                        return Err(DrmError::invalid("initial key request needs init data"));
                    }
                    (Some(mime.to_string()), digest.clone(), Vec::new(), None)
                }
                _ => {
                    let ks = existing.ok_or_else(|| {
                        DrmError::Internal("renewal without loaded keys".to_string())
                    })?;
                    if let Some(id) = ks.key_set_id {
                        let state = self.ledger.license_state(&id)?;
                        if state != OfflineLicenseState::Usable {
                            return Err(DrmError::illegal(format!(
                                "key set {id} is {state} and cannot be renewed"
                            )));
                        }
                    }
                    (
                        ks.mime_type.clone(),
                        ks.init_digest.clone(),
                        ks.keys.iter().map(|k| k.key_id.clone()).collect(),
                        ks.key_set_id,
                    )
                }
            };

            let request_id = RequestId::new();
            let message = KeyRequestMessage {
                request_id,
                request_type,
                key_type,
                session_id: Some(session_id),
                key_set_id,
                device_id: device.device_id.clone(),
                security_level: session.level,
                mime_type: mime_type.clone(),
                init_data: init_data.map(|d| STANDARD.encode(d)),
                optional_params: optional_params.clone(),
                key_ids,
            };
            let data = self.engine.encode_key_request(&message)?;

            if let Some(slot) = session.slot_mut(key_type) {
                *slot = SlotState::Requested {
                    request_id,
                    request_type,
                    mime_type,
                    init_digest,
                };
            }
            debug!(session = %session_id, %key_type, %request_type, request = %request_id, "key request issued");
            Ok(KeyRequest {
                data,
                request_type,
                default_url: self.config.license_url.clone(),
            })
        })
    }

    fn release_request(
        &self,
        key_set_id: KeySetId,
        device: &Device,
        optional_params: &BTreeMap<String, String>,
    ) -> DrmResult<KeyRequest> {
        let record = self
            .ledger
            .offline_license(&key_set_id)?
            .ok_or_else(|| DrmError::invalid(format!("unknown key set {key_set_id}")))?;
        if record.state != OfflineLicenseState::Usable {
            return Err(DrmError::invalid(format!(
                "key set {key_set_id} is already released"
            )));
        }
        let stored = self.open_stored(&record.sealed_keys)?;

        let request_id = RequestId::new();
        let message = KeyRequestMessage {
            request_id,
            request_type: RequestType::Release,
            key_type: KeyType::Release,
            session_id: None,
            key_set_id: Some(key_set_id),
            device_id: device.device_id.clone(),
            security_level: self.sessions.resolve_level(RequestedLevel::Native)?,
            mime_type: record.mime_type.clone(),
            init_data: None,
            optional_params: optional_params.clone(),
            key_ids: stored.into_iter().map(|g| g.key_id).collect(),
        };
        let data = self.engine.encode_key_request(&message)?;

        self.release_slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key_set_id,
                SlotState::Requested {
                    request_id,
                    request_type: RequestType::Release,
                    mime_type: record.mime_type,
                    init_digest: record.init_digest,
                },
            );
        debug!(key_set = %key_set_id, request = %request_id, "release request issued");
        Ok(KeyRequest {
            data,
            request_type: RequestType::Release,
            default_url: self.config.license_url.clone(),
        })
    }

    // ── Responses ────────────────────────────────────────────────

    /// Applies a license server response. Offline grants return the key set
    /// id of the stored license.
    pub fn provide_key_response(
        &self,
        scope: KeyScope,
        response: &[u8],
    ) -> DrmResult<Option<KeySetId>> {
        match scope {
            KeyScope::Session(id) => self.apply_session_response(id, response),
            KeyScope::KeySet(id) => self.apply_release_response(id, response).map(|()| None),
        }
    }

    fn apply_session_response(
        &self,
        session_id: SessionId,
        response: &[u8],
    ) -> DrmResult<Option<KeySetId>> {
        self.sessions.with_session(session_id, |session| {
            let outstanding: Vec<(KeyType, RequestId)> = [KeyType::Streaming, KeyType::Offline]
                .into_iter()
                .filter_map(|key_type| match session.slot_mut(key_type) {
                    Some(SlotState::Requested { request_id, .. }) => Some((key_type, *request_id)),
                    _ => None,
                })
                .collect();
            if outstanding.is_empty() {
                return Err(DrmError::illegal(format!(
                    "no key request is outstanding for session {session_id}"
                )));
            }

            let parsed = self
                .engine
                .parse_key_response(response)
                .map_err(DrmError::denied)?;
            let Some(key_type) = outstanding
                .iter()
                .find(|(_, request_id)| *request_id == parsed.request_id())
                .map(|(key_type, _)| *key_type)
            else {
                return Err(DrmError::illegal(
                    "response does not answer the most recent key request",
                ));
            };

            match parsed {
                LicenseResponse::Granted {
                    keys,
                    expires_at_ms,
                    ..
                } => self.apply_grant(session, key_type, &keys, expires_at_ms),
                LicenseResponse::Denied { reason, .. } => {
                    set_slot(session, key_type, SlotState::Failed);
                    warn!(session = %session_id, %key_type, %reason, "license denied");
                    Err(DrmError::DeniedByServer(reason))
                }
                LicenseResponse::Released { .. } => {
                    set_slot(session, key_type, SlotState::Failed);
                    Err(DrmError::DeniedByServer(
                        "release confirmation in answer to a session key request".to_string(),
                    ))
                }
                LicenseResponse::ReprovisionRequired { .. } => {
                    self.provisioning.invalidate()?;
                    self.dispatcher.emit(DrmEvent::ProvisioningRequired {
                        session_id: Some(session_id),
                    });
                    Err(DrmError::NotProvisioned)
                }
            }
        })
    }

    fn apply_grant(
        &self,
        session: &mut Session,
        key_type: KeyType,
        grants: &[KeyGrant],
        expires_at_ms: Option<i64>,
    ) -> DrmResult<Option<KeySetId>> {
        let Some(SlotState::Requested {
            request_type,
            mime_type,
            init_digest,
            ..
        }) = session.slot_mut(key_type).map(|slot| slot.clone())
        else {
            return Err(DrmError::Internal("grant for an idle slot".to_string()));
        };

        if grants.is_empty() {
            set_slot(session, key_type, SlotState::Failed);
            return Err(DrmError::DeniedByServer("license grants no keys".to_string()));
        }
        let keys = grants
            .iter()
            .map(|grant| {
                Ok(LoadedKey {
                    key_id: grant.key_id.clone(),
                    status: grant.status,
                    material: grant.content_key().map_err(DrmError::denied)?,
                })
            })
            .collect::<DrmResult<Vec<_>>>()?;
        let expires_at = expires_at_ms
            .map(|ms| {
                DateTime::from_timestamp_millis(ms)
                    .ok_or_else(|| DrmError::DeniedByServer(format!("expiry out of range: {ms}")))
            })
            .transpose()?;
        let key_ids: Vec<KeyId> = keys.iter().map(|k| k.key_id.clone()).collect();

        let previous = session.key_set(key_type);
        let renewing = request_type != RequestType::Initial && previous.is_some();
        let key_set_id = match key_type {
            KeyType::Offline => Some(
                previous
                    .filter(|_| renewing)
                    .and_then(|ks| ks.key_set_id)
                    .unwrap_or_default(),
            ),
            _ => None,
        };
        let had_usable: HashSet<KeyId> = previous
            .map(|ks| {
                ks.keys
                    .iter()
                    .filter(|k| k.status.is_usable())
                    .map(|k| k.key_id.clone())
                    .collect()
            })
            .unwrap_or_default();

        let sealed = match key_set_id {
            Some(_) => {
                let device = self.provisioning.device()?;
                let plain = serde_json::to_vec(&StoredKeys {
                    keys: grants.to_vec(),
                })
                .map_err(|e| internal("failed to encode offline keys", e))?;
                Some(self.engine.seal(&device.device_key, &plain)?)
            }
            None => None,
        };

        let session_id = session.id;
        let stored = self.ledger.write(|txn| {
            if let (Some(id), Some(sealed)) = (key_set_id, &sealed) {
                if renewing {
                    // Released or removed licenses stay that way.
                    if !txn.renew_offline_license(&id, sealed, expires_at)? {
                        return Ok(false);
                    }
                } else {
                    txn.put_offline_license(&OfflineLicenseRecord::new(
                        id,
                        mime_type.clone(),
                        init_digest.clone(),
                        sealed.clone(),
                        expires_at,
                    ))?;
                }
            }
            if !renewing {
                txn.insert_secure_stop(&SecureStopRecord::new(
                    session_id,
                    key_set_id,
                    key_ids.clone(),
                ))?;
            }
            Ok(true)
        })?;
        if !stored {
            set_slot(session, key_type, SlotState::Failed);
            let id = key_set_id.map(|id| id.to_string()).unwrap_or_default();
            warn!(session = %session_id, key_set = %id, "renewal for a license that is no longer usable");
            return Err(DrmError::illegal(format!("key set {id} is no longer usable")));
        }

        let has_new_usable_key = keys
            .iter()
            .any(|k| k.status.is_usable() && !had_usable.contains(&k.key_id));
        let key_set = KeySet {
            key_type,
            key_set_id,
            keys,
            request_type,
            expires_at,
            mime_type,
            init_digest,
            renewal_notified: false,
        };
        let public = key_set.public_keys();
        for key in &public {
            self.metrics.key_status(key.status);
        }
        if let Some(slot) = session.key_set_slot(key_type) {
            *slot = Some(key_set);
        }
        set_slot(session, key_type, SlotState::Applied);

        self.dispatcher.emit(DrmEvent::KeyStatusChange {
            session_id,
            keys: public,
            has_new_usable_key,
        });
        self.dispatcher.emit(DrmEvent::ExpirationUpdate {
            session_id,
            expires_at,
        });
        info!(session = %session_id, %key_type, %request_type, keys = key_ids.len(), "license applied");
        Ok(key_set_id)
    }

    fn apply_release_response(&self, key_set_id: KeySetId, response: &[u8]) -> DrmResult<()> {
        let mut slots = self
            .release_slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(SlotState::Requested { request_id, .. }) = slots.get(&key_set_id).cloned() else {
            return Err(DrmError::illegal(format!(
                "no release request is outstanding for key set {key_set_id}"
            )));
        };

        let parsed = self
            .engine
            .parse_key_response(response)
            .map_err(DrmError::denied)?;
        if parsed.request_id() != request_id {
            return Err(DrmError::illegal(
                "response does not answer the most recent release request",
            ));
        }

        match parsed {
            LicenseResponse::Released { .. } => {
                self.ledger.write(|txn| {
                    txn.set_offline_license_state(&key_set_id, OfflineLicenseState::Released)?;
                    txn.finalize_key_set_stops(&key_set_id)?;
                    Ok(())
                })?;
                slots.remove(&key_set_id);
                drop(slots);
                self.expire_key_set(key_set_id);
                info!(key_set = %key_set_id, "offline license released");
                Ok(())
            }
            LicenseResponse::Denied { reason, .. } => {
                slots.insert(key_set_id, SlotState::Failed);
                warn!(key_set = %key_set_id, %reason, "release denied");
                Err(DrmError::DeniedByServer(reason))
            }
            LicenseResponse::Granted { .. } => {
                slots.insert(key_set_id, SlotState::Failed);
                Err(DrmError::DeniedByServer(
                    "key grant in answer to a release request".to_string(),
                ))
            }
            LicenseResponse::ReprovisionRequired { .. } => {
                drop(slots);
                self.provisioning.invalidate()?;
                self.dispatcher
                    .emit(DrmEvent::ProvisioningRequired { session_id: None });
                Err(DrmError::NotProvisioned)
            }
        }
    }

    /// Expires a released key set in every open session holding it.
    fn expire_key_set(&self, key_set_id: KeySetId) {
        for handle in self.sessions.snapshot() {
            let mut session = lock_session(&handle);
            if session.is_lost() {
                continue;
            }
            let session_id = session.id;
            let Some(key_set) = session
                .offline
                .as_mut()
                .filter(|ks| ks.key_set_id == Some(key_set_id))
            else {
                continue;
            };
            for key in &mut key_set.keys {
                key.status = KeyStatus::Expired;
            }
            let keys = key_set.public_keys();
            for key in &keys {
                self.metrics.key_status(key.status);
            }
            self.dispatcher.emit(DrmEvent::KeyStatusChange {
                session_id,
                keys,
                has_new_usable_key: false,
            });
        }
    }

    // ── Offline restore and local key management ─────────────────

    /// Loads a stored offline license into a session.
    pub fn restore_keys(&self, session_id: SessionId, key_set_id: KeySetId) -> DrmResult<()> {
        if !self.provisioning.is_provisioned() {
            return Err(DrmError::NotProvisioned);
        }
        let record = self
            .ledger
            .offline_license(&key_set_id)?
            .ok_or_else(|| DrmError::invalid(format!("unknown key set {key_set_id}")))?;
        if record.state != OfflineLicenseState::Usable {
            return Err(DrmError::invalid(format!(
                "key set {key_set_id} has been released"
            )));
        }
        let grants = self.open_stored(&record.sealed_keys)?;
        let now = Utc::now();
        let expired = record.expires_at.is_some_and(|t| t <= now);
        let keys = grants
            .iter()
            .map(|grant| {
                Ok(LoadedKey {
                    key_id: grant.key_id.clone(),
                    status: if expired {
                        KeyStatus::Expired
                    } else {
                        grant.status
                    },
                    material: grant
                        .content_key()
                        .map_err(|e| internal("stored key is unusable", e))?,
                })
            })
            .collect::<DrmResult<Vec<_>>>()?;
        let key_ids: Vec<KeyId> = keys.iter().map(|k| k.key_id.clone()).collect();

        self.sessions.with_session(session_id, |session| {
            self.ledger.write(|txn| {
                txn.insert_secure_stop(&SecureStopRecord::new(
                    session_id,
                    Some(key_set_id),
                    key_ids.clone(),
                ))
            })?;

            let key_set = KeySet {
                key_type: KeyType::Offline,
                key_set_id: Some(key_set_id),
                keys,
                request_type: RequestType::Initial,
                expires_at: record.expires_at,
                mime_type: record.mime_type.clone(),
                init_digest: record.init_digest.clone(),
                renewal_notified: false,
            };
            let public = key_set.public_keys();
            let has_new_usable_key = public.iter().any(|k| k.status.is_usable());
            session.offline = Some(key_set);
            session.offline_slot = SlotState::Applied;

            self.dispatcher.emit(DrmEvent::KeyStatusChange {
                session_id,
                keys: public,
                has_new_usable_key,
            });
            self.dispatcher.emit(DrmEvent::ExpirationUpdate {
                session_id,
                expires_at: record.expires_at,
            });
            info!(session = %session_id, key_set = %key_set_id, "offline keys restored");
            Ok(())
        })
    }

    /// Drops every key loaded into a session. The ledger is not touched.
    pub fn remove_keys(&self, session_id: SessionId) -> DrmResult<()> {
        self.sessions.with_session(session_id, |session| {
            session.clear_keys();
            debug!(session = %session_id, "keys removed");
            Ok(())
        })
    }

    /// One `(key id hex, status)` pair per loaded key, then the vendor pairs.
    /// Empty when no keys are loaded.
    pub fn query_key_status(&self, session_id: SessionId) -> DrmResult<Vec<(String, String)>> {
        let now = Utc::now();
        self.sessions.with_session(session_id, |session| {
            let key_sets: Vec<&KeySet> = session.key_sets().collect();
            if key_sets.is_empty() {
                return Ok(Vec::new());
            }

            let mut pairs: Vec<(String, String)> = key_sets
                .iter()
                .flat_map(|ks| ks.keys.iter())
                .map(|k| (k.key_id.to_hex(), k.status.to_string()))
                .collect();

            let license_type = key_sets
                .iter()
                .map(|ks| match ks.key_type {
                    KeyType::Streaming => "Streaming",
                    KeyType::Offline => "Offline",
                    KeyType::Release => "Release",
                })
                .collect::<Vec<_>>()
                .join(",");
            let play_allowed = key_sets
                .iter()
                .any(|ks| !ks.is_expired_at(now) && ks.keys.iter().any(|k| k.status.is_usable()));
            let remaining = key_sets
                .iter()
                .filter_map(|ks| ks.expires_at)
                .min()
                .map_or_else(
                    || "unlimited".to_string(),
                    |t| (t - now).num_seconds().max(0).to_string(),
                );

            pairs.push((QUERY_LICENSE_TYPE.to_string(), license_type));
            pairs.push((
                QUERY_PLAY_ALLOWED.to_string(),
                if play_allowed { "True" } else { "False" }.to_string(),
            ));
            pairs.push((QUERY_LICENSE_DURATION_REMAINING.to_string(), remaining));
            Ok(pairs)
        })
    }

    /// Expires keys whose license ran out and announces key sets that
    /// entered the renewal window. Returns the number of events emitted.
    pub fn poll_expirations(&self, now: DateTime<Utc>) -> usize {
        let window = self.config.renewal_window();
        let mut emitted = 0;
        for handle in self.sessions.snapshot() {
            let mut session = lock_session(&handle);
            if session.is_lost() {
                continue;
            }
            let session_id = session.id;
            let mut events = Vec::new();
            for key_set in session.key_sets_mut() {
                if key_set.is_expired_at(now) {
                    if key_set.keys.iter().all(|k| k.status == KeyStatus::Expired) {
                        continue;
                    }
                    for key in &mut key_set.keys {
                        key.status = KeyStatus::Expired;
                    }
                    events.push(DrmEvent::KeyStatusChange {
                        session_id,
                        keys: key_set.public_keys(),
                        has_new_usable_key: false,
                    });
                } else if key_set.expires_within(now, window) && !key_set.renewal_notified {
                    key_set.renewal_notified = true;
                    events.push(DrmEvent::KeyRequired { session_id });
                }
            }
            emitted += events.len();
            for event in events {
                self.dispatcher.emit(event);
            }
        }
        emitted
    }

    /// Drops any outstanding release exchange for a removed key set.
    pub(crate) fn forget_release(&self, key_set_id: &KeySetId) {
        self.release_slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key_set_id);
    }

    /// Opens sealed key material with the current device key, falling back
    /// to keys retired by reprovisioning.
    fn open_stored(&self, sealed: &[u8]) -> DrmResult<Vec<KeyGrant>> {
        let mut opened = Err(DrmError::NotProvisioned);
        for key in self.provisioning.unsealing_keys() {
            opened = self
                .engine
                .open(&key, sealed)
                .map_err(|e| internal("failed to open offline keys", e));
            if opened.is_ok() {
                break;
            }
        }
        let plain = opened?;
        let stored: StoredKeys =
            serde_json::from_slice(&plain).map_err(|e| internal("corrupt offline keys", e))?;
        Ok(stored.keys)
    }
}

fn set_slot(session: &mut Session, key_type: KeyType, state: SlotState) {
    if let Some(slot) = session.slot_mut(key_type) {
        *slot = state;
    }
}
