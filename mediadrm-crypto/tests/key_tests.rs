use mediadrm_crypto::{ContentKey, CryptoError, DeviceKey, CONTENT_KEY_SIZE, DEVICE_KEY_SIZE};

#[test]
fn content_key_from_slice_checks_length() {
    assert!(ContentKey::from_slice(&[1u8; CONTENT_KEY_SIZE]).is_ok());
    let err = ContentKey::from_slice(&[1u8; 32]).unwrap_err();
    assert!(matches!(
        err,
        CryptoError::InvalidKeyLength {
            expected: 16,
            actual: 32
        }
    ));
}

#[test]
fn device_key_from_slice_checks_length() {
    assert!(DeviceKey::from_slice(&[1u8; DEVICE_KEY_SIZE]).is_ok());
    assert!(DeviceKey::from_slice(&[1u8; 16]).is_err());
}

#[test]
fn random_keys_differ() {
    assert_ne!(ContentKey::random(), ContentKey::random());
    assert_ne!(DeviceKey::random(), DeviceKey::random());
}

#[test]
fn debug_output_is_redacted() {
    let key = ContentKey::from_bytes([0xAB; CONTENT_KEY_SIZE]);
    let debug = format!("{key:?}");
    assert!(debug.contains("REDACTED"));
    assert!(!debug.contains("171"));
    assert!(format!("{:?}", DeviceKey::random()).contains("REDACTED"));
}
