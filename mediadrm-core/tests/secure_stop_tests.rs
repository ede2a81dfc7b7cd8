mod common;

use common::{MIME, TestServer, provisioned};
use mediadrm_core::{DrmManager, ErrorKind, KeyScope, KeyStatus, KeyType, RequestedLevel, SessionId};
use mediadrm_ledger::{SecureStopRecord, SecureStopState};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;

fn playback(server: &TestServer, manager: &DrmManager, init: &[u8]) -> SessionId {
    let session = manager.open_session(RequestedLevel::Native).unwrap();
    let req = manager
        .get_key_request(
            KeyScope::Session(session),
            Some(init),
            Some(MIME),
            KeyType::Streaming,
            &BTreeMap::new(),
        )
        .unwrap();
    manager
        .provide_key_response(
            KeyScope::Session(session),
            &server.grant(&req.data, &[(1, KeyStatus::Usable)], None),
        )
        .unwrap();
    session
}

fn record(manager: &DrmManager, index: usize) -> SecureStopRecord {
    let ids = manager.secure_stop_ids().unwrap();
    SecureStopRecord::from_bytes(&manager.secure_stop(&ids[index]).unwrap()).unwrap()
}

#[test]
fn close_finalizes_the_session_stop() {
    let server = TestServer::new();
    let manager = provisioned(&server);
    let session = playback(&server, &manager, b"title-1");

    let active = record(&manager, 0);
    assert_eq!(active.state, SecureStopState::Active);
    assert_eq!(active.session_id, session);
    assert_eq!(active.key_ids, vec![common::key_id(1)]);

    manager.close_session(session);
    let finalized = record(&manager, 0);
    assert_eq!(finalized.state, SecureStopState::Finalized);
    assert!(finalized.finalized_at.is_some());
}

#[test]
fn server_release_removes_listed_stops() {
    let server = TestServer::new();
    let manager = provisioned(&server);
    playback(&server, &manager, b"title-1");
    playback(&server, &manager, b"title-2");
    let ids = manager.secure_stop_ids().unwrap();
    assert_eq!(ids.len(), 2);
    assert_eq!(manager.secure_stops().unwrap().len(), 2);

    let removed = manager
        .release_secure_stops(&server.release_secure_stops(&ids[..1]))
        .unwrap();
    assert_eq!(removed, 1);
    assert_eq!(manager.secure_stop_ids().unwrap(), ids[1..].to_vec());
}

#[test]
fn release_with_an_unknown_id_removes_nothing() {
    let server = TestServer::new();
    let manager = provisioned(&server);
    playback(&server, &manager, b"title-1");
    let mut ids = manager.secure_stop_ids().unwrap();
    ids.push(mediadrm_core::SecureStopId::new());

    let err = manager
        .release_secure_stops(&server.release_secure_stops(&ids))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(manager.secure_stop_ids().unwrap().len(), 1);
}

#[test]
fn unsigned_release_is_denied() {
    let server = TestServer::new();
    let manager = provisioned(&server);
    playback(&server, &manager, b"title-1");
    let ids = manager.secure_stop_ids().unwrap();

    let forged = server.forge(&mediadrm_crypto::SecureStopRelease {
        secure_stop_ids: ids.clone(),
    });
    let err = manager.release_secure_stops(&forged).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeniedByServer);
    assert_eq!(manager.secure_stop_ids().unwrap(), ids);
}

#[test]
fn unknown_stop_lookup_is_invalid() {
    let server = TestServer::new();
    let manager = provisioned(&server);
    let id = mediadrm_core::SecureStopId::new();
    assert_eq!(
        manager.secure_stop(&id).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
    assert_eq!(
        manager.remove_secure_stop(&id).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
}

#[test]
fn forced_removal_clears_everything() {
    let server = TestServer::new();
    let manager = provisioned(&server);
    playback(&server, &manager, b"title-1");
    playback(&server, &manager, b"title-2");

    let first = manager.secure_stop_ids().unwrap()[0];
    manager.remove_secure_stop(&first).unwrap();
    assert_eq!(manager.secure_stop_ids().unwrap().len(), 1);

    assert_eq!(manager.remove_all_secure_stops().unwrap(), 1);
    assert!(manager.secure_stop_ids().unwrap().is_empty());
}

#[test]
#[allow(deprecated)]
fn deprecated_release_all_removes_everything() {
    let server = TestServer::new();
    let manager = provisioned(&server);
    playback(&server, &manager, b"title-1");
    assert_eq!(manager.release_all_secure_stops().unwrap(), 1);
    assert!(manager.secure_stops().unwrap().is_empty());
}
