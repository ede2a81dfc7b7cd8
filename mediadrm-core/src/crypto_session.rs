//! Generic crypto operations with keys loaded into a session.

use crate::error::{DrmError, DrmResult};
use crate::metrics::Metrics;
use crate::session::SessionManager;
use chrono::Utc;
use mediadrm_crypto::{CipherAlgorithm, CryptoEngine, MacAlgorithm};
use mediadrm_types::{KeyId, SessionId};
use std::sync::Arc;

/// Encrypt, decrypt, sign and verify with a session's keys.
///
/// The algorithms are fixed when the crypto session is created. Every call
/// looks the key up again, so a key that expires or is removed becomes
/// unusable immediately.
pub struct CryptoSession {
    session_id: SessionId,
    cipher: CipherAlgorithm,
    mac: MacAlgorithm,
    sessions: Arc<SessionManager>,
    engine: Arc<dyn CryptoEngine>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for CryptoSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoSession")
            .field("session_id", &self.session_id)
            .field("cipher", &self.cipher)
            .field("mac", &self.mac)
            .finish_non_exhaustive()
    }
}

impl CryptoSession {
    pub(crate) fn new(
        session_id: SessionId,
        cipher_algorithm: &str,
        mac_algorithm: &str,
        sessions: Arc<SessionManager>,
        engine: Arc<dyn CryptoEngine>,
        metrics: Arc<Metrics>,
    ) -> DrmResult<Self> {
        let cipher = CipherAlgorithm::parse(cipher_algorithm)?;
        let mac = MacAlgorithm::parse(mac_algorithm)?;
        if !engine.cipher_algorithms().contains(&cipher) {
            return Err(DrmError::invalid(format!("cipher {cipher} is not available")));
        }
        if !engine.mac_algorithms().contains(&mac) {
            return Err(DrmError::invalid(format!("mac {mac} is not available")));
        }
        sessions.with_session(session_id, |_| Ok(()))?;
        Ok(Self {
            session_id,
            cipher,
            mac,
            sessions,
            engine,
            metrics,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn cipher_algorithm(&self) -> CipherAlgorithm {
        self.cipher
    }

    pub fn mac_algorithm(&self) -> MacAlgorithm {
        self.mac
    }

    pub fn encrypt(&self, key_id: &KeyId, input: &[u8], iv: &[u8]) -> DrmResult<Vec<u8>> {
        let result = self.with_key(key_id, |engine, key| {
            engine.encrypt(self.cipher, key, input, iv)
        });
        self.metrics.record("crypto.encrypt", &result);
        result
    }

    pub fn decrypt(&self, key_id: &KeyId, input: &[u8], iv: &[u8]) -> DrmResult<Vec<u8>> {
        let result = self.with_key(key_id, |engine, key| {
            engine.decrypt(self.cipher, key, input, iv)
        });
        self.metrics.record("crypto.decrypt", &result);
        result
    }

    pub fn sign(&self, key_id: &KeyId, message: &[u8]) -> DrmResult<Vec<u8>> {
        let result = self.with_key(key_id, |engine, key| engine.sign(self.mac, key, message));
        self.metrics.record("crypto.sign", &result);
        result
    }

    /// Returns false for a well-formed signature that does not match.
    pub fn verify(&self, key_id: &KeyId, message: &[u8], signature: &[u8]) -> DrmResult<bool> {
        let result = self.with_key(key_id, |engine, key| {
            engine.verify(self.mac, key, message, signature)
        });
        self.metrics.record("crypto.verify", &result);
        result
    }

    fn with_key<T>(
        &self,
        key_id: &KeyId,
        op: impl FnOnce(
            &dyn CryptoEngine,
            &mediadrm_crypto::ContentKey,
        ) -> mediadrm_crypto::CryptoResult<T>,
    ) -> DrmResult<T> {
        self.sessions.with_session(self.session_id, |session| {
            let key = session.usable_key(key_id, Utc::now())?;
            Ok(op(self.engine.as_ref(), &key.material)?)
        })
    }
}
