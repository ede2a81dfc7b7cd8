//! Shared test helpers for manager tests.

#![allow(dead_code)]

use ed25519_dalek::SigningKey;
use mediadrm_core::{
    DispatchQueue, DrmConfig, DrmEvent, DrmManager, EventKind, KeyId, KeyStatus, Scheme,
    SchemeRegistry, SecureStopId, SecurityLevel,
};
use mediadrm_crypto::{
    CipherAlgorithm, ContentKey, CryptoEngine, CryptoResult, DeviceKey, KeyGrant,
    KeyRequestMessage, LicenseResponse, MacAlgorithm, ProvisionRequestMessage, ProvisionResponse,
    SecureStopRelease, SoftwareCryptoEngine, encode_device_key, sign_envelope,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use uuid::Uuid;

pub const SCHEME_ID: Uuid = Uuid::from_u128(0xedef8ba9_79d6_4ace_a3c8_27dcd51d21ed);
pub const HW_ONLY_SCHEME_ID: Uuid = Uuid::from_u128(0x9a04f079_9840_4286_ab92_e65be0885f95);
pub const MIME: &str = "video/mp4";

/// Supports SW_SECURE_CRYPTO, HW_SECURE_CRYPTO and HW_SECURE_DECODE (native).
pub fn scheme() -> Scheme {
    Scheme::new(
        SCHEME_ID,
        "test",
        ["video/mp4", "audio/mp4"],
        [
            SecurityLevel::SwSecureCrypto,
            SecurityLevel::HwSecureCrypto,
            SecurityLevel::HwSecureDecode,
        ],
    )
}

/// Supports HW_SECURE_CRYPTO and HW_SECURE_ALL only.
pub fn hw_only_scheme() -> Scheme {
    Scheme::new(
        HW_ONLY_SCHEME_ID,
        "hw-only",
        ["video/mp4"],
        [SecurityLevel::HwSecureCrypto, SecurityLevel::HwSecureAll],
    )
}

pub fn registry() -> SchemeRegistry {
    SchemeRegistry::new(vec![scheme(), hw_only_scheme()])
}

/// Deterministic content key for a one-byte key id.
pub fn content_key(id: u8) -> ContentKey {
    ContentKey::from_bytes([id; 16])
}

pub fn key_id(id: u8) -> KeyId {
    KeyId::new(vec![id])
}

/// A license and provisioning server signing with a fixed Ed25519 key.
pub struct TestServer {
    signing_key: SigningKey,
    public_key: [u8; 32],
    pub device_key: DeviceKey,
}

impl TestServer {
    pub fn new() -> Self {
        let seed: [u8; 32] = [
            1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23,
            24, 25, 26, 27, 28, 29, 30, 31, 32,
        ];
        let signing_key = SigningKey::from_bytes(&seed);
        let public_key = signing_key.verifying_key().to_bytes();
        Self {
            signing_key,
            public_key,
            device_key: DeviceKey::from_bytes([0x42; 32]),
        }
    }

    pub fn engine(&self) -> Arc<dyn CryptoEngine> {
        Arc::new(SoftwareCryptoEngine::new(&self.public_key).unwrap())
    }

    /// Signs `payload` with a key the manager does not trust.
    pub fn forge<T: serde::Serialize>(&self, payload: &T) -> Vec<u8> {
        sign_envelope(&SigningKey::from_bytes(&[7u8; 32]), payload).unwrap()
    }

    pub fn sign<T: serde::Serialize>(&self, payload: &T) -> Vec<u8> {
        sign_envelope(&self.signing_key, payload).unwrap()
    }

    pub fn provision(&self, request: &[u8]) -> Vec<u8> {
        self.provision_with_key(request, &self.device_key)
    }

    /// Provisions the device with a key other than the server's default.
    pub fn provision_with_key(&self, request: &[u8], device_key: &DeviceKey) -> Vec<u8> {
        let request = ProvisionRequestMessage::from_bytes(request).unwrap();
        self.sign(&ProvisionResponse::Provisioned {
            request_id: request.request_id,
            device_id: "test-device".into(),
            device_key: encode_device_key(device_key),
        })
    }

    pub fn deny_provision(&self, request: &[u8], reason: &str) -> Vec<u8> {
        let request = ProvisionRequestMessage::from_bytes(request).unwrap();
        self.sign(&ProvisionResponse::Denied {
            request_id: request.request_id,
            reason: reason.into(),
        })
    }

    /// Grants the listed `(key id, status)` pairs.
    pub fn grant(&self, request: &[u8], keys: &[(u8, KeyStatus)], expires_at_ms: Option<i64>) -> Vec<u8> {
        self.sign(&self.grant_response(request, keys, expires_at_ms))
    }

    pub fn grant_response(
        &self,
        request: &[u8],
        keys: &[(u8, KeyStatus)],
        expires_at_ms: Option<i64>,
    ) -> LicenseResponse {
        let request = KeyRequestMessage::from_bytes(request).unwrap();
        LicenseResponse::Granted {
            request_id: request.request_id,
            keys: keys
                .iter()
                .map(|(id, status)| KeyGrant::new(key_id(*id), &content_key(*id), *status))
                .collect(),
            expires_at_ms,
        }
    }

    pub fn release(&self, request: &[u8]) -> Vec<u8> {
        let request = KeyRequestMessage::from_bytes(request).unwrap();
        self.sign(&LicenseResponse::Released {
            request_id: request.request_id,
        })
    }

    pub fn deny(&self, request: &[u8], reason: &str) -> Vec<u8> {
        let request = KeyRequestMessage::from_bytes(request).unwrap();
        self.sign(&LicenseResponse::Denied {
            request_id: request.request_id,
            reason: reason.into(),
        })
    }

    pub fn reprovision(&self, request: &[u8]) -> Vec<u8> {
        let request = KeyRequestMessage::from_bytes(request).unwrap();
        self.sign(&LicenseResponse::ReprovisionRequired {
            request_id: request.request_id,
        })
    }

    pub fn release_secure_stops(&self, ids: &[SecureStopId]) -> Vec<u8> {
        self.sign(&SecureStopRelease {
            secure_stop_ids: ids.to_vec(),
        })
    }
}

/// Routes `tracing` output through the test harness. Set `RUST_LOG` to see it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// An unprovisioned manager for the test scheme.
pub fn manager(server: &TestServer, config: DrmConfig) -> DrmManager {
    init_tracing();
    DrmManager::new(&registry(), SCHEME_ID, server.engine(), config).unwrap()
}

/// Runs one provisioning round trip.
pub fn provision(server: &TestServer, manager: &DrmManager) {
    let request = manager.get_provision_request().unwrap();
    let response = server.provision(&request.data);
    manager.provide_provision_response(&response).unwrap();
}

/// A provisioned manager with default config.
pub fn provisioned(server: &TestServer) -> DrmManager {
    provisioned_with(server, DrmConfig::default())
}

pub fn provisioned_with(server: &TestServer, config: DrmConfig) -> DrmManager {
    let manager = manager(server, config);
    provision(server, &manager);
    manager
}

/// Collects events of the given kinds on a dedicated queue.
pub struct Recorder {
    queue: DispatchQueue,
    events: Arc<Mutex<Vec<DrmEvent>>>,
}

impl Recorder {
    pub fn attach(manager: &DrmManager, kinds: &[EventKind]) -> Self {
        let queue = DispatchQueue::thread("test-recorder").unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        for kind in kinds {
            let sink = Arc::clone(&events);
            manager.register_listener(*kind, &queue, move |event| {
                sink.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(event.clone());
                Ok(())
            });
        }
        Self { queue, events }
    }

    pub fn all(manager: &DrmManager) -> Self {
        Self::attach(manager, &EventKind::ALL)
    }

    /// Every event delivered so far, after draining the queue.
    pub fn events(&self) -> Vec<DrmEvent> {
        self.queue.flush();
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(DrmEvent::kind).collect()
    }
}

/// Runs `f` on another thread and panics if it does not finish in time.
pub fn within<T: Send + 'static>(limit: Duration, f: impl FnOnce() -> T + Send + 'static) -> T {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(limit)
        .unwrap_or_else(|e| panic!("operation did not finish within {limit:?}: {e}"))
}

#[derive(Default)]
struct Gate {
    blocked: bool,
    open: bool,
}

/// Wraps an engine so the next key response parse blocks until released.
pub struct BlockingEngine {
    inner: Arc<dyn CryptoEngine>,
    armed: AtomicBool,
    gate: Mutex<Gate>,
    changed: Condvar,
}

impl BlockingEngine {
    pub fn new(inner: Arc<dyn CryptoEngine>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            armed: AtomicBool::new(false),
            gate: Mutex::new(Gate::default()),
            changed: Condvar::new(),
        })
    }

    /// Makes the next `parse_key_response` call block.
    pub fn arm(&self) {
        *self.gate.lock().unwrap() = Gate::default();
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Waits until a call is blocked inside the engine.
    pub fn wait_until_blocked(&self, limit: Duration) {
        let gate = self.gate.lock().unwrap();
        let (gate, timeout) = self
            .changed
            .wait_timeout_while(gate, limit, |g| !g.blocked)
            .unwrap();
        assert!(gate.blocked && !timeout.timed_out(), "no call blocked in the engine");
    }

    /// Lets the blocked call continue.
    pub fn release(&self) {
        self.gate.lock().unwrap().open = true;
        self.changed.notify_all();
    }

    fn pause(&self) {
        if !self.armed.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut gate = self.gate.lock().unwrap();
        gate.blocked = true;
        self.changed.notify_all();
        let _gate = self.changed.wait_while(gate, |g| !g.open).unwrap();
    }
}

impl CryptoEngine for BlockingEngine {
    fn encode_key_request(&self, request: &KeyRequestMessage) -> CryptoResult<Vec<u8>> {
        self.inner.encode_key_request(request)
    }

    fn parse_key_response(&self, response: &[u8]) -> CryptoResult<LicenseResponse> {
        self.pause();
        self.inner.parse_key_response(response)
    }

    fn encode_provision_request(&self, request: &ProvisionRequestMessage) -> CryptoResult<Vec<u8>> {
        self.inner.encode_provision_request(request)
    }

    fn parse_provision_response(&self, response: &[u8]) -> CryptoResult<ProvisionResponse> {
        self.inner.parse_provision_response(response)
    }

    fn parse_secure_stop_release(&self, response: &[u8]) -> CryptoResult<SecureStopRelease> {
        self.inner.parse_secure_stop_release(response)
    }

    fn seal(&self, key: &DeviceKey, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        self.inner.seal(key, plaintext)
    }

    fn open(&self, key: &DeviceKey, sealed: &[u8]) -> CryptoResult<Vec<u8>> {
        self.inner.open(key, sealed)
    }

    fn cipher_algorithms(&self) -> Vec<CipherAlgorithm> {
        self.inner.cipher_algorithms()
    }

    fn mac_algorithms(&self) -> Vec<MacAlgorithm> {
        self.inner.mac_algorithms()
    }

    fn encrypt(
        &self,
        algorithm: CipherAlgorithm,
        key: &ContentKey,
        input: &[u8],
        iv: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        self.inner.encrypt(algorithm, key, input, iv)
    }

    fn decrypt(
        &self,
        algorithm: CipherAlgorithm,
        key: &ContentKey,
        input: &[u8],
        iv: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        self.inner.decrypt(algorithm, key, input, iv)
    }

    fn sign(&self, algorithm: MacAlgorithm, key: &ContentKey, message: &[u8]) -> CryptoResult<Vec<u8>> {
        self.inner.sign(algorithm, key, message)
    }

    fn verify(
        &self,
        algorithm: MacAlgorithm,
        key: &ContentKey,
        message: &[u8],
        signature: &[u8],
    ) -> CryptoResult<bool> {
        self.inner.verify(algorithm, key, message, signature)
    }
}

/// A provisioned manager whose engine can be made to block.
pub fn blocking_manager(server: &TestServer, config: DrmConfig) -> (Arc<BlockingEngine>, Arc<DrmManager>) {
    init_tracing();
    let engine = BlockingEngine::new(server.engine());
    let manager = DrmManager::new(
        &registry(),
        SCHEME_ID,
        Arc::clone(&engine) as Arc<dyn CryptoEngine>,
        config,
    )
    .unwrap();
    provision(server, &manager);
    (engine, Arc::new(manager))
}
