//! Device provisioning state.
//!
//! Provisioning installs the device id and the device key used to seal
//! offline key material. Credentials are persisted in the ledger, so a
//! provisioned device stays provisioned across restarts until a license
//! server demands otherwise. Keys replaced by reprovisioning are retired,
//! not dropped: offline licenses sealed under them must still open.

use crate::error::{DrmError, DrmResult};
use mediadrm_crypto::{
    CryptoEngine, DeviceKey, ProvisionRequestMessage, ProvisionResponse, decode_device_key,
};
use mediadrm_ledger::{DeviceCredentials, SecureStopLedger};
use mediadrm_types::RequestId;
use rand::RngCore;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

/// Opaque provisioning request for the provisioning server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub data: Vec<u8>,
    pub default_url: String,
}

#[derive(Clone)]
pub(crate) struct Device {
    pub device_id: String,
    pub device_key: DeviceKey,
}

/// Tracks whether the device is provisioned for one scheme.
pub struct Provisioning {
    scheme_id: Uuid,
    default_url: String,
    engine: Arc<dyn CryptoEngine>,
    ledger: SecureStopLedger,
    device: RwLock<Option<Device>>,
    /// Keys replaced by reprovisioning, newest first.
    retired: RwLock<Vec<DeviceKey>>,
    pending: Mutex<Option<RequestId>>,
}

impl Provisioning {
    /// Loads persisted credentials for the scheme, if any.
    pub(crate) fn load(
        scheme_id: Uuid,
        default_url: String,
        engine: Arc<dyn CryptoEngine>,
        ledger: SecureStopLedger,
    ) -> DrmResult<Self> {
        let device = match ledger.device_credentials(&scheme_id)? {
            Some(creds) => {
                let device_key = DeviceKey::from_slice(&creds.device_key).map_err(|e| {
                    DrmError::Internal(format!("stored device key is unusable: {e}"))
                })?;
                info!(scheme = %scheme_id, device = %creds.device_id, "loaded device credentials");
                Some(Device {
                    device_id: creds.device_id,
                    device_key,
                })
            }
            None => None,
        };
        let retired = ledger
            .retired_device_keys(&scheme_id)?
            .iter()
            .filter_map(|bytes| match DeviceKey::from_slice(bytes) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!(scheme = %scheme_id, error = %e, "skipping unusable retired device key");
                    None
                }
            })
            .collect();
        Ok(Self {
            scheme_id,
            default_url,
            engine,
            ledger,
            device: RwLock::new(device),
            retired: RwLock::new(retired),
            pending: Mutex::new(None),
        })
    }

    pub fn is_provisioned(&self) -> bool {
        self.device
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Id of the provisioned device.
    pub fn device_id(&self) -> Option<String> {
        self.device
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|d| d.device_id.clone())
    }

    /// The provisioned device, or `NotProvisioned`.
    pub(crate) fn device(&self) -> DrmResult<Device> {
        self.device
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(DrmError::NotProvisioned)
    }

    /// Keys that may open sealed offline key material: the current device
    /// key first, then retired keys.
    pub(crate) fn unsealing_keys(&self) -> Vec<DeviceKey> {
        let current = self
            .device
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|d| d.device_key.clone());
        let retired = self.retired.read().unwrap_or_else(PoisonError::into_inner);
        current
            .into_iter()
            .chain(retired.iter().cloned())
            .collect()
    }

    fn retire(&self, previous: Option<Device>) {
        let Some(previous) = previous else {
            return;
        };
        let mut retired = self.retired.write().unwrap_or_else(PoisonError::into_inner);
        if !retired.contains(&previous.device_key) {
            retired.insert(0, previous.device_key);
        }
    }

    /// Builds a provisioning request. A later request supersedes this one.
    pub fn get_provision_request(&self) -> DrmResult<ProvisionRequest> {
        let mut nonce = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let message = ProvisionRequestMessage {
            request_id: RequestId::new(),
            scheme_id: self.scheme_id,
            nonce: hex::encode(nonce),
        };
        let data = self.engine.encode_provision_request(&message)?;
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(message.request_id);
        Ok(ProvisionRequest {
            data,
            default_url: self.default_url.clone(),
        })
    }

    /// Applies a provisioning response. Returns the new device id.
    pub fn provide_provision_response(&self, response: &[u8]) -> DrmResult<String> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let parsed = self
            .engine
            .parse_provision_response(response)
            .map_err(DrmError::denied)?;

        if *pending != Some(parsed.request_id()) {
            return Err(DrmError::DeniedByServer(
                "response does not answer the outstanding provisioning request".to_string(),
            ));
        }

        match parsed {
            ProvisionResponse::Denied { reason, .. } => {
                warn!(scheme = %self.scheme_id, %reason, "provisioning denied");
                Err(DrmError::DeniedByServer(reason))
            }
            ProvisionResponse::Provisioned {
                device_id,
                device_key,
                ..
            } => {
                let device_key = decode_device_key(&device_key).map_err(DrmError::denied)?;
                let creds = DeviceCredentials::new(
                    self.scheme_id,
                    device_id.clone(),
                    device_key.as_bytes().to_vec(),
                );
                self.ledger.write(|txn| {
                    txn.retire_device_credentials(&self.scheme_id)?;
                    txn.put_device_credentials(&creds)
                })?;
                let previous = self
                    .device
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .replace(Device {
                        device_id: device_id.clone(),
                        device_key: device_key.clone(),
                    });
                self.retired
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|k| *k != device_key);
                self.retire(previous.filter(|d| d.device_key != device_key));
                *pending = None;
                info!(scheme = %self.scheme_id, device = %device_id, "device provisioned");
                Ok(device_id)
            }
        }
    }

    /// Drops the credentials after a server demanded reprovisioning. The
    /// device key is retired so existing offline licenses still open.
    pub(crate) fn invalidate(&self) -> DrmResult<()> {
        self.ledger
            .write(|txn| txn.retire_device_credentials(&self.scheme_id))?;
        let previous = self
            .device
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.retire(previous);
        warn!(scheme = %self.scheme_id, "provisioning invalidated");
        Ok(())
    }
}
