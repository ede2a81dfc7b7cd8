//! Session table and per-session state.
//!
//! The table lock guards lookup, insertion and removal only. Each session
//! sits behind its own mutex, so work on one session never waits on
//! another. The lost flag and open time sit in the table entry, outside the
//! session mutex: counting and reclaiming never wait on a busy session.
//! Code holding the table lock never takes a session lock, and code holding
//! a session lock never touches the table.

use crate::config::{CapacityPolicy, DrmConfig, LevelFallback};
use crate::dispatcher::EventDispatcher;
use crate::error::{DrmError, DrmResult};
use crate::properties::PropertyStore;
use crate::provisioning::Provisioning;
use chrono::{DateTime, Utc};
use mediadrm_crypto::ContentKey;
use mediadrm_ledger::SecureStopLedger;
use mediadrm_types::{
    DrmEvent, Key, KeyId, KeySetId, KeyStatus, KeyType, RequestId, RequestType, RequestedLevel,
    Scheme, SecurityLevel, SessionId,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, error, info, warn};

/// A key held by a session. The material never leaves the manager.
#[derive(Debug, Clone)]
pub(crate) struct LoadedKey {
    pub key_id: KeyId,
    pub status: KeyStatus,
    pub material: ContentKey,
}

/// Keys loaded into a session by one successful response or restore.
#[derive(Debug, Clone)]
pub(crate) struct KeySet {
    pub key_type: KeyType,
    pub key_set_id: Option<KeySetId>,
    pub keys: Vec<LoadedKey>,
    pub request_type: RequestType,
    pub expires_at: Option<DateTime<Utc>>,
    pub mime_type: Option<String>,
    pub init_digest: Option<String>,
    /// Set once `KeyRequired` has been emitted for the current expiry.
    pub renewal_notified: bool,
}

impl KeySet {
    pub fn public_keys(&self) -> Vec<Key> {
        self.keys
            .iter()
            .map(|k| Key::new(k.key_id.clone(), k.status))
            .collect()
    }

    pub fn all_usable(&self) -> bool {
        self.keys.iter().all(|k| k.status.is_usable())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }

    pub fn expires_within(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        self.expires_at.is_some_and(|t| t - now <= window)
    }
}

/// Outstanding exchange of one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SlotState {
    Idle,
    Requested {
        request_id: RequestId,
        request_type: RequestType,
        mime_type: Option<String>,
        init_digest: Option<String>,
    },
    Applied,
    Failed,
}

/// One open session.
#[derive(Debug)]
pub(crate) struct Session {
    pub id: SessionId,
    pub level: SecurityLevel,
    lost: Arc<AtomicBool>,
    pub streaming: Option<KeySet>,
    pub offline: Option<KeySet>,
    pub streaming_slot: SlotState,
    pub offline_slot: SlotState,
    pub properties: PropertyStore,
}

impl Session {
    fn new(level: SecurityLevel, properties: PropertyStore) -> Self {
        Self {
            id: SessionId::new(),
            level,
            lost: Arc::new(AtomicBool::new(false)),
            streaming: None,
            offline: None,
            streaming_slot: SlotState::Idle,
            offline_slot: SlotState::Idle,
            properties,
        }
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    pub fn key_set(&self, key_type: KeyType) -> Option<&KeySet> {
        match key_type {
            KeyType::Streaming => self.streaming.as_ref(),
            KeyType::Offline => self.offline.as_ref(),
            KeyType::Release => None,
        }
    }

    pub fn key_set_slot(&mut self, key_type: KeyType) -> Option<&mut Option<KeySet>> {
        match key_type {
            KeyType::Streaming => Some(&mut self.streaming),
            KeyType::Offline => Some(&mut self.offline),
            KeyType::Release => None,
        }
    }

    pub fn slot_mut(&mut self, key_type: KeyType) -> Option<&mut SlotState> {
        match key_type {
            KeyType::Streaming => Some(&mut self.streaming_slot),
            KeyType::Offline => Some(&mut self.offline_slot),
            KeyType::Release => None,
        }
    }

    /// Loaded key sets, streaming first.
    pub fn key_sets(&self) -> impl Iterator<Item = &KeySet> {
        self.streaming.iter().chain(self.offline.iter())
    }

    pub fn key_sets_mut(&mut self) -> impl Iterator<Item = &mut KeySet> {
        self.streaming.iter_mut().chain(self.offline.iter_mut())
    }

    /// Finds a key that may be used for crypto right now.
    pub fn usable_key(&self, key_id: &KeyId, now: DateTime<Utc>) -> DrmResult<&LoadedKey> {
        for key_set in self.key_sets() {
            if let Some(key) = key_set.keys.iter().find(|k| &k.key_id == key_id) {
                if !key.status.is_usable() {
                    return Err(DrmError::illegal(format!(
                        "key {key_id} is {}",
                        key.status
                    )));
                }
                if key_set.is_expired_at(now) {
                    return Err(DrmError::illegal(format!("key {key_id} has expired")));
                }
                return Ok(key);
            }
        }
        Err(DrmError::illegal(format!("key {key_id} is not loaded")))
    }

    /// Drops every key and resets both slots.
    pub fn clear_keys(&mut self) {
        self.streaming = None;
        self.offline = None;
        self.streaming_slot = SlotState::Idle;
        self.offline_slot = SlotState::Idle;
    }
}

pub(crate) type SessionHandle = Arc<Mutex<Session>>;

pub(crate) fn lock_session(handle: &SessionHandle) -> MutexGuard<'_, Session> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A session table entry.
#[derive(Clone)]
struct SessionEntry {
    handle: SessionHandle,
    opened_at: DateTime<Utc>,
    lost: Arc<AtomicBool>,
}

impl SessionEntry {
    fn new(session: Session) -> Self {
        Self {
            lost: Arc::clone(&session.lost),
            opened_at: Utc::now(),
            handle: Arc::new(Mutex::new(session)),
        }
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Marks the session lost. Returns false if it already was.
    fn claim_lost(&self) -> bool {
        !self.lost.swap(true, Ordering::SeqCst)
    }
}

/// Opens, tracks and closes sessions.
pub struct SessionManager {
    scheme: Scheme,
    config: Arc<DrmConfig>,
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    provisioning: Arc<Provisioning>,
    dispatcher: Arc<EventDispatcher>,
    ledger: SecureStopLedger,
    properties: Arc<RwLock<PropertyStore>>,
}

impl SessionManager {
    pub(crate) fn new(
        scheme: Scheme,
        config: Arc<DrmConfig>,
        provisioning: Arc<Provisioning>,
        dispatcher: Arc<EventDispatcher>,
        ledger: SecureStopLedger,
        properties: Arc<RwLock<PropertyStore>>,
    ) -> Self {
        Self {
            scheme,
            config,
            sessions: RwLock::new(HashMap::new()),
            provisioning,
            dispatcher,
            ledger,
            properties,
        }
    }

    /// Resolves a requested level against the scheme and fallback policy.
    pub fn resolve_level(&self, requested: RequestedLevel) -> DrmResult<SecurityLevel> {
        let native = self.scheme.native_level();
        if native == SecurityLevel::Unknown {
            return Err(DrmError::Internal(format!(
                "scheme {} reports no supported levels",
                self.scheme.id
            )));
        }
        let level = match requested {
            RequestedLevel::Native | RequestedLevel::Max => return Ok(native),
            RequestedLevel::At(level) => level,
        };
        if level == SecurityLevel::Unknown {
            return Err(DrmError::invalid("security level UNKNOWN cannot be opened"));
        }
        if level > native {
            return Err(DrmError::invalid(format!(
                "security level {level} is above native level {native}"
            )));
        }
        if self.scheme.supports_level(level) {
            return Ok(level);
        }
        match self.config.level_fallback {
            LevelFallback::Strict => Err(DrmError::invalid(format!(
                "security level {level} is not supported"
            ))),
            LevelFallback::Nearest => Ok(self
                .scheme
                .next_lower_supported(level)
                .unwrap_or_else(|| self.scheme.lowest_level())),
        }
    }

    /// Opens a session at the requested level.
    pub fn open(&self, requested: RequestedLevel) -> DrmResult<SessionId> {
        if !self.provisioning.is_provisioned() {
            return Err(DrmError::NotProvisioned);
        }
        let level = self.resolve_level(requested)?;
        let properties = self
            .properties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let session = Session::new(level, properties);
        let id = session.id;
        let reclaimed = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let open = sessions.values().filter(|entry| !entry.is_lost()).count();
            let mut reclaimed = None;
            if open >= self.config.max_sessions {
                match self.config.capacity_policy {
                    CapacityPolicy::Reject => {
                        return Err(DrmError::ResourceBusy(format!(
                            "session limit of {} reached",
                            self.config.max_sessions
                        )));
                    }
                    CapacityPolicy::ReclaimOldest => reclaimed = claim_oldest(&sessions),
                }
            }
            sessions.insert(id, SessionEntry::new(session));
            reclaimed
        };
        info!(session = %id, %level, "opened session");

        if let Some((reclaimed_id, handle)) = reclaimed {
            self.invalidate(&mut lock_session(&handle));
            self.dispatcher.emit(DrmEvent::SessionReclaimed {
                session_id: reclaimed_id,
            });
            self.dispatcher.emit(DrmEvent::SessionLost {
                session_id: reclaimed_id,
            });
            warn!(session = %reclaimed_id, "reclaimed oldest session");
        }
        Ok(id)
    }

    /// Drops the keys of a session already marked lost and finalizes its
    /// secure stops.
    fn invalidate(&self, session: &mut Session) {
        session.clear_keys();
        self.finalize_stops(session.id);
    }

    fn finalize_stops(&self, id: SessionId) {
        match self.ledger.write(|txn| txn.finalize_session_stops(&id)) {
            Ok(0) => {}
            Ok(n) => debug!(session = %id, finalized = n, "finalized secure stops"),
            Err(e) => error!(session = %id, error = %e, "failed to finalize secure stops"),
        }
    }

    /// Closes a session. Closing an unknown or already closed session is a
    /// no-op.
    pub fn close(&self, id: SessionId) {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        let Some(entry) = removed else {
            debug!(session = %id, "close of unknown session ignored");
            return;
        };
        let was_live = entry.claim_lost();
        let mut session = lock_session(&entry.handle);
        session.clear_keys();
        if was_live {
            self.finalize_stops(id);
        }
        info!(session = %id, "closed session");
    }

    /// Marks a session lost at the platform's request.
    pub fn mark_lost(&self, id: SessionId) -> DrmResult<()> {
        let entry = self.entry(id)?;
        if !entry.claim_lost() {
            return Ok(());
        }
        self.invalidate(&mut lock_session(&entry.handle));
        self.dispatcher.emit(DrmEvent::SessionLost { session_id: id });
        warn!(session = %id, "session lost");
        Ok(())
    }

    /// Number of sessions that are open and not lost.
    pub fn current_open_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|entry| !entry.is_lost())
            .count()
    }

    pub fn max_session_count(&self) -> usize {
        self.config.max_sessions
    }

    /// The level a session was opened at.
    pub fn security_level(&self, id: SessionId) -> DrmResult<SecurityLevel> {
        self.with_session(id, |session| Ok(session.level))
    }

    fn entry(&self, id: SessionId) -> DrmResult<SessionEntry> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or_else(|| DrmError::illegal(format!("session {id} is not open")))
    }

    /// Runs `f` on a live session under its lock.
    pub(crate) fn with_session<T>(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut Session) -> DrmResult<T>,
    ) -> DrmResult<T> {
        let entry = self.entry(id)?;
        let mut session = lock_session(&entry.handle);
        if session.is_lost() {
            return Err(DrmError::SessionLost(id));
        }
        f(&mut session)
    }

    /// Handles of every session in the table.
    pub(crate) fn snapshot(&self) -> Vec<SessionHandle> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|entry| Arc::clone(&entry.handle))
            .collect()
    }
}

/// Marks the oldest live session lost and returns it. Runs under the table
/// lock, so it reads only entry fields.
fn claim_oldest(sessions: &HashMap<SessionId, SessionEntry>) -> Option<(SessionId, SessionHandle)> {
    let mut live: Vec<_> = sessions
        .iter()
        .filter(|(_, entry)| !entry.is_lost())
        .collect();
    live.sort_by_key(|(id, entry)| (entry.opened_at, **id));
    live.into_iter()
        .find(|(_, entry)| entry.claim_lost())
        .map(|(id, entry)| (*id, Arc::clone(&entry.handle)))
}
