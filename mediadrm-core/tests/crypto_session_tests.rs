mod common;

use chrono::{Duration, Utc};
use common::{MIME, TestServer, key_id, provisioned};
use mediadrm_core::{
    DrmManager, ErrorKind, KeyScope, KeyStatus, KeyType, PROPERTY_ALGORITHMS, RequestedLevel,
    SessionId,
};
use mediadrm_crypto::{CipherAlgorithm, MacAlgorithm, content};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;

const CIPHER: &str = "AES/CBC/NoPadding";
const MAC: &str = "HmacSHA256";

fn session_with_keys(
    server: &TestServer,
    manager: &DrmManager,
    keys: &[(u8, KeyStatus)],
    expires_at_ms: Option<i64>,
) -> SessionId {
    let session = manager.open_session(RequestedLevel::Native).unwrap();
    let req = manager
        .get_key_request(
            KeyScope::Session(session),
            Some(&b"title"[..]),
            Some(MIME),
            KeyType::Streaming,
            &BTreeMap::new(),
        )
        .unwrap();
    manager
        .provide_key_response(
            KeyScope::Session(session),
            &server.grant(&req.data, keys, expires_at_ms),
        )
        .unwrap();
    session
}

#[test]
fn algorithms_property_lists_engine_algorithms() {
    let server = TestServer::new();
    let manager = provisioned(&server);
    assert_eq!(
        manager.property_string(PROPERTY_ALGORITHMS).unwrap(),
        "AES/CBC/NoPadding,HmacSHA256"
    );
}

#[test]
fn unlisted_algorithm_is_invalid() {
    let server = TestServer::new();
    let manager = provisioned(&server);
    let session = manager.open_session(RequestedLevel::Native).unwrap();

    let err = manager
        .crypto_session(session, "AES/CTR/NoPadding", MAC)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    let err = manager
        .crypto_session(session, CIPHER, "HmacSHA1")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn crypto_session_on_closed_session_is_illegal_state() {
    let server = TestServer::new();
    let manager = provisioned(&server);
    let session = manager.open_session(RequestedLevel::Native).unwrap();
    manager.close_session(session);
    let err = manager.crypto_session(session, CIPHER, MAC).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalState);
}

#[test]
fn encrypt_matches_the_content_key() {
    let server = TestServer::new();
    let manager = provisioned(&server);
    let session = session_with_keys(&server, &manager, &[(1, KeyStatus::Usable)], None);
    let crypto = manager.crypto_session(session, CIPHER, MAC).unwrap();
    assert_eq!(crypto.session_id(), session);
    assert_eq!(crypto.cipher_algorithm(), CipherAlgorithm::AesCbcNoPadding);
    assert_eq!(crypto.mac_algorithm(), MacAlgorithm::HmacSha256);

    let iv = [3u8; 16];
    let plaintext = [0x5au8; 48];
    let ciphertext = crypto.encrypt(&key_id(1), &plaintext, &iv).unwrap();
    let expected = content::aes_cbc_encrypt(&common::content_key(1), &plaintext, &iv).unwrap();
    assert_eq!(ciphertext, expected);
    assert_eq!(
        crypto.decrypt(&key_id(1), &ciphertext, &iv).unwrap(),
        plaintext.to_vec()
    );
}

#[test]
fn sign_and_verify() {
    let server = TestServer::new();
    let manager = provisioned(&server);
    let session = session_with_keys(&server, &manager, &[(1, KeyStatus::Usable)], None);
    let crypto = manager.crypto_session(session, CIPHER, MAC).unwrap();

    let signature = crypto.sign(&key_id(1), b"segment-7").unwrap();
    assert_eq!(signature.len(), 32);
    assert!(crypto.verify(&key_id(1), b"segment-7", &signature).unwrap());
    assert!(!crypto.verify(&key_id(1), b"segment-8", &signature).unwrap());
}

#[test]
fn unaligned_input_is_invalid() {
    let server = TestServer::new();
    let manager = provisioned(&server);
    let session = session_with_keys(&server, &manager, &[(1, KeyStatus::Usable)], None);
    let crypto = manager.crypto_session(session, CIPHER, MAC).unwrap();

    let err = crypto.encrypt(&key_id(1), &[0u8; 15], &[0u8; 16]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    let err = crypto.encrypt(&key_id(1), &[0u8; 16], &[0u8; 8]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn unusable_keys_are_illegal_state() {
    let server = TestServer::new();
    let manager = provisioned(&server);
    let session = session_with_keys(
        &server,
        &manager,
        &[(1, KeyStatus::Usable), (2, KeyStatus::OutputNotAllowed)],
        None,
    );
    let crypto = manager.crypto_session(session, CIPHER, MAC).unwrap();
    let iv = [0u8; 16];

    let err = crypto.encrypt(&key_id(2), &[0u8; 16], &iv).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalState);
    let err = crypto.sign(&key_id(9), b"msg").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalState);

    manager.remove_keys(session).unwrap();
    let err = crypto.encrypt(&key_id(1), &[0u8; 16], &iv).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalState);
}

#[test]
fn expired_license_makes_keys_unusable() {
    let server = TestServer::new();
    let manager = provisioned(&server);
    let past = (Utc::now() - Duration::seconds(5)).timestamp_millis();
    let session = session_with_keys(&server, &manager, &[(1, KeyStatus::Usable)], Some(past));
    let crypto = manager.crypto_session(session, CIPHER, MAC).unwrap();

    let err = crypto.sign(&key_id(1), b"msg").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalState);
}

#[test]
fn crypto_metrics_are_counted() {
    let server = TestServer::new();
    let manager = provisioned(&server);
    let session = session_with_keys(&server, &manager, &[(1, KeyStatus::Usable)], None);
    let crypto = manager.crypto_session(session, CIPHER, MAC).unwrap();
    crypto.sign(&key_id(1), b"a").unwrap();
    let _ = crypto.sign(&key_id(2), b"a");

    let metrics = manager.metrics();
    assert_eq!(metrics.get("crypto.sign.ok"), Some(&1));
    assert_eq!(metrics.get("crypto.sign.error"), Some(&1));
}
