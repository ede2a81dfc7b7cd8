//! String and byte-array properties of the scheme and its sessions.

use crate::error::{DrmError, DrmResult};
use std::collections::BTreeMap;

pub const PROPERTY_VENDOR: &str = "vendor";
pub const PROPERTY_VERSION: &str = "version";
pub const PROPERTY_DESCRIPTION: &str = "description";
pub const PROPERTY_ALGORITHMS: &str = "algorithms";
pub const PROPERTY_DEVICE_UNIQUE_ID: &str = "deviceUniqueId";

const READ_ONLY: [&str; 5] = [
    PROPERTY_VENDOR,
    PROPERTY_VERSION,
    PROPERTY_DESCRIPTION,
    PROPERTY_ALGORITHMS,
    PROPERTY_DEVICE_UNIQUE_ID,
];

/// A named property bag.
///
/// The standard properties are read-only for callers; the manager updates
/// them through the `pub(crate)` setters. Any other name may be set and is
/// readable afterwards. Reading a name that was never set fails.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyStore {
    strings: BTreeMap<String, String>,
    bytes: BTreeMap<String, Vec<u8>>,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a string property.
    pub fn string(&self, name: &str) -> DrmResult<String> {
        self.strings
            .get(name)
            .cloned()
            .ok_or_else(|| DrmError::invalid(format!("unknown property: {name}")))
    }

    /// Returns a byte-array property.
    pub fn bytes(&self, name: &str) -> DrmResult<Vec<u8>> {
        self.bytes
            .get(name)
            .cloned()
            .ok_or_else(|| DrmError::invalid(format!("unknown property: {name}")))
    }

    /// Sets a caller-writable string property.
    pub fn set_string(&mut self, name: &str, value: impl Into<String>) -> DrmResult<()> {
        check_writable(name)?;
        self.strings.insert(name.to_string(), value.into());
        Ok(())
    }

    /// Sets a caller-writable byte-array property.
    pub fn set_bytes(&mut self, name: &str, value: impl Into<Vec<u8>>) -> DrmResult<()> {
        check_writable(name)?;
        self.bytes.insert(name.to_string(), value.into());
        Ok(())
    }

    pub(crate) fn put_string(&mut self, name: &str, value: impl Into<String>) {
        self.strings.insert(name.to_string(), value.into());
    }
}

fn check_writable(name: &str) -> DrmResult<()> {
    if name.is_empty() {
        return Err(DrmError::invalid("property name must not be empty"));
    }
    if READ_ONLY.contains(&name) {
        return Err(DrmError::invalid(format!("property is read-only: {name}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_property_is_invalid_argument() {
        let store = PropertyStore::new();
        assert!(matches!(store.string("nope"), Err(DrmError::InvalidArgument(_))));
        assert!(matches!(store.bytes("nope"), Err(DrmError::InvalidArgument(_))));
    }

    #[test]
    fn standard_properties_are_read_only() {
        let mut store = PropertyStore::new();
        store.put_string(PROPERTY_VENDOR, "acme");
        assert!(store.set_string(PROPERTY_VENDOR, "other").is_err());
        assert!(store.set_bytes(PROPERTY_DEVICE_UNIQUE_ID, vec![1]).is_err());
        assert_eq!(store.string(PROPERTY_VENDOR).unwrap(), "acme");
    }

    #[test]
    fn custom_properties_roundtrip() {
        let mut store = PropertyStore::new();
        store.set_string("sessionSharing", "enable").unwrap();
        store.set_bytes("serviceCertificate", vec![1, 2, 3]).unwrap();
        assert_eq!(store.string("sessionSharing").unwrap(), "enable");
        assert_eq!(store.bytes("serviceCertificate").unwrap(), vec![1, 2, 3]);
    }
}
