//! The manager facade.
//!
//! [`DrmManager`] wires one scheme's session table, key exchange,
//! provisioning, ledger and dispatcher together and is the only type a
//! host needs to hold. It is `Send + Sync`; share it behind an `Arc`.

use crate::config::DrmConfig;
use crate::crypto_session::CryptoSession;
use crate::dispatcher::{DispatchQueue, EventDispatcher, ListenerId};
use crate::error::{DrmError, DrmResult};
use crate::exchange::{KeyExchangeEngine, KeyRequest, KeyScope};
use crate::metrics::Metrics;
use crate::properties::{
    PROPERTY_ALGORITHMS, PROPERTY_DESCRIPTION, PROPERTY_DEVICE_UNIQUE_ID, PROPERTY_VENDOR,
    PROPERTY_VERSION, PropertyStore,
};
use crate::provisioning::{ProvisionRequest, Provisioning};
use crate::session::SessionManager;
use chrono::{DateTime, Utc};
use mediadrm_crypto::CryptoEngine;
use mediadrm_ledger::SecureStopLedger;
use mediadrm_types::{
    DrmEvent, EventKind, HdcpLevel, KeySetId, KeyType, OfflineLicenseState, RequestedLevel,
    Scheme, SchemeRegistry, SecureStopId, SecurityLevel, SessionId,
};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

/// Session and license key lifecycle manager for one DRM scheme.
pub struct DrmManager {
    scheme: Scheme,
    registry: SchemeRegistry,
    config: Arc<DrmConfig>,
    engine: Arc<dyn CryptoEngine>,
    ledger: SecureStopLedger,
    metrics: Arc<Metrics>,
    dispatcher: Arc<EventDispatcher>,
    provisioning: Arc<Provisioning>,
    sessions: Arc<SessionManager>,
    exchange: KeyExchangeEngine,
    properties: Arc<RwLock<PropertyStore>>,
}

impl std::fmt::Debug for DrmManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmManager")
            .field("scheme", &self.scheme.id)
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl DrmManager {
    /// Creates a manager for `scheme_id`.
    ///
    /// Opens the ledger at `config.ledger_path` (in memory when unset) and
    /// loads any persisted device credentials.
    pub fn new(
        registry: &SchemeRegistry,
        scheme_id: Uuid,
        engine: Arc<dyn CryptoEngine>,
        config: DrmConfig,
    ) -> DrmResult<Self> {
        config.validate()?;
        let scheme = registry
            .find(&scheme_id)
            .cloned()
            .ok_or(DrmError::UnsupportedScheme(scheme_id))?;
        let ledger = match &config.ledger_path {
            Some(path) => SecureStopLedger::open(path)?,
            None => SecureStopLedger::open_in_memory()?,
        };
        let config = Arc::new(config);

        let algorithms: Vec<String> = engine
            .cipher_algorithms()
            .iter()
            .map(|a| a.as_str().to_string())
            .chain(engine.mac_algorithms().iter().map(|a| a.as_str().to_string()))
            .collect();
        let mut store = PropertyStore::new();
        store.put_string(PROPERTY_VENDOR, config.vendor.clone());
        store.put_string(PROPERTY_VERSION, config.version.clone());
        store.put_string(PROPERTY_DESCRIPTION, config.description.clone());
        store.put_string(PROPERTY_ALGORITHMS, algorithms.join(","));
        let properties = Arc::new(RwLock::new(store));

        let metrics = Arc::new(Metrics::new());
        let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(&metrics)));
        let provisioning = Arc::new(Provisioning::load(
            scheme.id,
            config.provisioning_url.clone(),
            Arc::clone(&engine),
            ledger.clone(),
        )?);
        let sessions = Arc::new(SessionManager::new(
            scheme.clone(),
            Arc::clone(&config),
            Arc::clone(&provisioning),
            Arc::clone(&dispatcher),
            ledger.clone(),
            Arc::clone(&properties),
        ));
        let exchange = KeyExchangeEngine::new(
            Arc::clone(&sessions),
            Arc::clone(&provisioning),
            Arc::clone(&engine),
            ledger.clone(),
            Arc::clone(&dispatcher),
            Arc::clone(&metrics),
            Arc::clone(&config),
        );

        info!(
            scheme = %scheme.id,
            name = %scheme.name,
            native = %scheme.native_level(),
            provisioned = provisioning.is_provisioned(),
            "drm manager started"
        );
        Ok(Self {
            scheme,
            registry: registry.clone(),
            config,
            engine,
            ledger,
            metrics,
            dispatcher,
            provisioning,
            sessions,
            exchange,
            properties,
        })
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn config(&self) -> &DrmConfig {
        &self.config
    }

    /// See [`SchemeRegistry::is_crypto_scheme_supported`].
    pub fn is_crypto_scheme_supported(
        &self,
        scheme_id: &Uuid,
        mime_type: Option<&str>,
        level: Option<SecurityLevel>,
    ) -> bool {
        self.registry
            .is_crypto_scheme_supported(scheme_id, mime_type, level)
    }

    // ── Sessions ─────────────────────────────────────────────────

    pub fn open_session(&self, level: impl Into<RequestedLevel>) -> DrmResult<SessionId> {
        let result = self.sessions.open(level.into());
        self.metrics.record("open_session", &result);
        result
    }

    /// Closes a session. Closing twice is a no-op.
    pub fn close_session(&self, id: SessionId) {
        self.sessions.close(id);
        self.metrics.incr("close_session.ok");
    }

    pub fn current_open_count(&self) -> usize {
        self.sessions.current_open_count()
    }

    pub fn max_session_count(&self) -> usize {
        self.sessions.max_session_count()
    }

    pub fn security_level(&self, id: SessionId) -> DrmResult<SecurityLevel> {
        self.sessions.security_level(id)
    }

    pub fn connected_hdcp_level(&self) -> HdcpLevel {
        self.config.connected_hdcp
    }

    pub fn max_hdcp_level(&self) -> HdcpLevel {
        self.config.max_hdcp
    }

    // ── Key exchange ─────────────────────────────────────────────

    pub fn get_key_request(
        &self,
        scope: KeyScope,
        init_data: Option<&[u8]>,
        mime_type: Option<&str>,
        key_type: KeyType,
        optional_params: &BTreeMap<String, String>,
    ) -> DrmResult<KeyRequest> {
        let result =
            self.exchange
                .get_key_request(scope, init_data, mime_type, key_type, optional_params);
        self.metrics.record("get_key_request", &result);
        result
    }

    pub fn provide_key_response(
        &self,
        scope: KeyScope,
        response: &[u8],
    ) -> DrmResult<Option<KeySetId>> {
        let result = self.exchange.provide_key_response(scope, response);
        self.metrics.record("provide_key_response", &result);
        result
    }

    pub fn restore_keys(&self, session: SessionId, key_set_id: KeySetId) -> DrmResult<()> {
        let result = self.exchange.restore_keys(session, key_set_id);
        self.metrics.record("restore_keys", &result);
        result
    }

    pub fn remove_keys(&self, session: SessionId) -> DrmResult<()> {
        self.exchange.remove_keys(session)
    }

    pub fn query_key_status(&self, session: SessionId) -> DrmResult<Vec<(String, String)>> {
        self.exchange.query_key_status(session)
    }

    /// Applies expiry at `now`. Hosts call this from a timer.
    pub fn poll_expirations(&self, now: DateTime<Utc>) -> usize {
        self.exchange.poll_expirations(now)
    }

    // ── Provisioning ─────────────────────────────────────────────

    pub fn is_provisioned(&self) -> bool {
        self.provisioning.is_provisioned()
    }

    pub fn get_provision_request(&self) -> DrmResult<ProvisionRequest> {
        let result = self.provisioning.get_provision_request();
        self.metrics.record("get_provision_request", &result);
        result
    }

    /// Applies a provisioning response and returns the device id.
    pub fn provide_provision_response(&self, response: &[u8]) -> DrmResult<String> {
        let result = self.provisioning.provide_provision_response(response);
        self.metrics.record("provide_provision_response", &result);
        result
    }

    // ── Secure stops ─────────────────────────────────────────────

    pub fn secure_stop_ids(&self) -> DrmResult<Vec<SecureStopId>> {
        Ok(self.ledger.list()?)
    }

    pub fn secure_stop(&self, id: &SecureStopId) -> DrmResult<Vec<u8>> {
        Ok(self.ledger.get(id)?)
    }

    pub fn secure_stops(&self) -> DrmResult<Vec<Vec<u8>>> {
        Ok(self.ledger.secure_stops()?)
    }

    /// Removes the secure stops a server release message confirms. All or
    /// nothing: one unknown id rejects the whole batch.
    pub fn release_secure_stops(&self, response: &[u8]) -> DrmResult<usize> {
        let result = self
            .engine
            .parse_secure_stop_release(response)
            .map_err(DrmError::denied)
            .and_then(|release| {
                self.ledger
                    .release(&release.secure_stop_ids)
                    .map_err(DrmError::from)
            });
        self.metrics.record("release_secure_stops", &result);
        result
    }

    pub fn remove_secure_stop(&self, id: &SecureStopId) -> DrmResult<()> {
        Ok(self.ledger.remove(id)?)
    }

    /// Removes every secure stop without server confirmation.
    pub fn remove_all_secure_stops(&self) -> DrmResult<usize> {
        Ok(self.ledger.remove_all()?)
    }

    #[deprecated(note = "use `remove_all_secure_stops`")]
    pub fn release_all_secure_stops(&self) -> DrmResult<usize> {
        self.remove_all_secure_stops()
    }

    // ── Offline licenses ─────────────────────────────────────────

    pub fn offline_license_key_set_ids(&self) -> DrmResult<Vec<KeySetId>> {
        Ok(self.ledger.list_offline_licenses()?)
    }

    pub fn offline_license_state(&self, key_set_id: &KeySetId) -> DrmResult<OfflineLicenseState> {
        Ok(self.ledger.license_state(key_set_id)?)
    }

    pub fn remove_offline_license(&self, key_set_id: &KeySetId) -> DrmResult<()> {
        self.ledger.remove_offline_license(key_set_id)?;
        self.exchange.forget_release(key_set_id);
        Ok(())
    }

    // ── Listeners and platform hooks ─────────────────────────────

    /// Registers `listener` for `kind`; it runs on `queue`.
    pub fn register_listener<F>(
        &self,
        kind: EventKind,
        queue: &DispatchQueue,
        listener: F,
    ) -> ListenerId
    where
        F: Fn(&DrmEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.dispatcher.register(kind, queue, listener)
    }

    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.dispatcher.unregister(id)
    }

    /// Platform hook: the session was invalidated outside the caller's control.
    pub fn report_session_lost(&self, session: SessionId) -> DrmResult<()> {
        self.sessions.mark_lost(session)
    }

    /// Platform hook: forwards a vendor event to listeners.
    pub fn report_vendor_event(
        &self,
        session: Option<SessionId>,
        code: i32,
        data: Vec<u8>,
    ) -> DrmResult<()> {
        let event = DrmEvent::VendorDefined {
            session_id: session,
            code,
            data,
        };
        match session {
            Some(id) => self.sessions.with_session(id, |_| {
                self.dispatcher.emit(event);
                Ok(())
            }),
            None => {
                self.dispatcher.emit(event);
                Ok(())
            }
        }
    }

    // ── Properties ───────────────────────────────────────────────

    pub fn property_string(&self, name: &str) -> DrmResult<String> {
        if name == PROPERTY_DEVICE_UNIQUE_ID {
            return self.device_unique_id();
        }
        self.properties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .string(name)
    }

    pub fn property_bytes(&self, name: &str) -> DrmResult<Vec<u8>> {
        if name == PROPERTY_DEVICE_UNIQUE_ID {
            return self.device_unique_id().map(String::into_bytes);
        }
        self.properties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .bytes(name)
    }

    pub fn set_property_string(&self, name: &str, value: &str) -> DrmResult<()> {
        self.properties
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_string(name, value)
    }

    pub fn set_property_bytes(&self, name: &str, value: &[u8]) -> DrmResult<()> {
        self.properties
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_bytes(name, value)
    }

    /// A session property. Sessions start with a copy of the scheme
    /// properties taken at open.
    pub fn session_property_string(&self, session: SessionId, name: &str) -> DrmResult<String> {
        if name == PROPERTY_DEVICE_UNIQUE_ID {
            self.sessions.with_session(session, |_| Ok(()))?;
            return self.device_unique_id();
        }
        self.sessions
            .with_session(session, |s| s.properties.string(name))
    }

    pub fn session_property_bytes(&self, session: SessionId, name: &str) -> DrmResult<Vec<u8>> {
        if name == PROPERTY_DEVICE_UNIQUE_ID {
            self.sessions.with_session(session, |_| Ok(()))?;
            return self.device_unique_id().map(String::into_bytes);
        }
        self.sessions
            .with_session(session, |s| s.properties.bytes(name))
    }

    pub fn set_session_property_string(
        &self,
        session: SessionId,
        name: &str,
        value: &str,
    ) -> DrmResult<()> {
        self.sessions
            .with_session(session, |s| s.properties.set_string(name, value))
    }

    pub fn set_session_property_bytes(
        &self,
        session: SessionId,
        name: &str,
        value: &[u8],
    ) -> DrmResult<()> {
        self.sessions
            .with_session(session, |s| s.properties.set_bytes(name, value))
    }

    fn device_unique_id(&self) -> DrmResult<String> {
        self.provisioning.device_id().ok_or_else(|| {
            DrmError::invalid(format!(
                "property {PROPERTY_DEVICE_UNIQUE_ID} is unset until provisioning"
            ))
        })
    }

    // ── Crypto sessions and metrics ──────────────────────────────

    /// Opens a crypto session over `session`'s keys. Both algorithms must be
    /// listed in the `algorithms` property.
    pub fn crypto_session(
        &self,
        session: SessionId,
        cipher_algorithm: &str,
        mac_algorithm: &str,
    ) -> DrmResult<CryptoSession> {
        let listed = self.property_string(PROPERTY_ALGORITHMS)?;
        for name in [cipher_algorithm, mac_algorithm] {
            if !listed.split(',').any(|a| a == name) {
                warn!(session = %session, algorithm = name, "unlisted crypto algorithm");
                return Err(DrmError::invalid(format!("algorithm {name} is not listed")));
            }
        }
        CryptoSession::new(
            session,
            cipher_algorithm,
            mac_algorithm,
            Arc::clone(&self.sessions),
            Arc::clone(&self.engine),
            Arc::clone(&self.metrics),
        )
    }

    /// Snapshot of every counter, sorted by name.
    pub fn metrics(&self) -> BTreeMap<String, u64> {
        self.metrics.snapshot()
    }
}
