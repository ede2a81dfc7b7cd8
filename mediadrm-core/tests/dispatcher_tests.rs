mod common;

use common::{MIME, TestServer, provisioned};
use mediadrm_core::{
    DispatchQueue, DrmEvent, EventDispatcher, EventKind, KeyScope, KeyStatus, KeyType, Metrics,
    RequestedLevel, SessionId,
};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

fn dispatcher() -> (Arc<Metrics>, EventDispatcher) {
    let metrics = Arc::new(Metrics::new());
    let dispatcher = EventDispatcher::new(Arc::clone(&metrics));
    (metrics, dispatcher)
}

fn lost(session_id: SessionId) -> DrmEvent {
    DrmEvent::SessionLost { session_id }
}

type Log = Arc<Mutex<Vec<String>>>;

fn push(log: &Log, entry: String) {
    log.lock().unwrap_or_else(PoisonError::into_inner).push(entry);
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

// ── Ordering ─────────────────────────────────────────────────────

#[test]
fn one_queue_sees_events_in_emit_order_and_listeners_in_registration_order() {
    let (_, dispatcher) = dispatcher();
    let queue = DispatchQueue::thread("ordered").unwrap();
    let log: Log = Arc::default();

    for name in ["first", "second"] {
        let log = Arc::clone(&log);
        dispatcher.register(EventKind::SessionLost, &queue, move |event| {
            push(&log, format!("{name}:{}", event.session_id().unwrap()));
            Ok(())
        });
    }

    let a = SessionId::new();
    let b = SessionId::new();
    dispatcher.emit(lost(a));
    dispatcher.emit(lost(b));
    queue.flush();

    assert_eq!(
        entries(&log),
        vec![
            format!("first:{a}"),
            format!("second:{a}"),
            format!("first:{b}"),
            format!("second:{b}"),
        ]
    );
}

#[test]
fn listeners_only_receive_their_kind() {
    let (metrics, dispatcher) = dispatcher();
    let queue = DispatchQueue::thread("kinds").unwrap();
    let log: Log = Arc::default();
    let sink = Arc::clone(&log);
    dispatcher.register(EventKind::KeyRequired, &queue, move |event| {
        push(&sink, event.kind().to_string());
        Ok(())
    });

    let session = SessionId::new();
    dispatcher.emit(lost(session));
    dispatcher.emit(DrmEvent::KeyRequired {
        session_id: session,
    });
    queue.flush();

    assert_eq!(entries(&log), vec!["key_required".to_string()]);
    assert_eq!(dispatcher.listener_count(EventKind::KeyRequired), 1);
    assert_eq!(dispatcher.listener_count(EventKind::SessionLost), 0);
    assert_eq!(metrics.get("event.session_lost"), 1);
    assert_eq!(metrics.get("event.key_required"), 1);
}

// ── Failure isolation ────────────────────────────────────────────

#[test]
fn listener_errors_and_panics_do_not_stop_delivery() {
    let (_, dispatcher) = dispatcher();
    let queue = DispatchQueue::thread("faulty").unwrap();
    let log: Log = Arc::default();

    dispatcher.register(EventKind::SessionLost, &queue, |_| {
        Err(anyhow::anyhow!("listener rejected the event"))
    });
    dispatcher.register(EventKind::SessionLost, &queue, |_| panic!("listener bug"));
    let sink = Arc::clone(&log);
    dispatcher.register(EventKind::SessionLost, &queue, move |_| {
        push(&sink, "delivered".into());
        Ok(())
    });

    dispatcher.emit(lost(SessionId::new()));
    dispatcher.emit(lost(SessionId::new()));
    queue.flush();

    assert_eq!(entries(&log), vec!["delivered".to_string(), "delivered".to_string()]);
}

#[test]
fn unregistered_listener_stops_receiving() {
    let (_, dispatcher) = dispatcher();
    let queue = DispatchQueue::thread("unregister").unwrap();
    let log: Log = Arc::default();
    let sink = Arc::clone(&log);
    let id = dispatcher.register(EventKind::SessionLost, &queue, move |_| {
        push(&sink, "seen".into());
        Ok(())
    });

    dispatcher.emit(lost(SessionId::new()));
    queue.flush();
    assert!(dispatcher.unregister(id));
    assert!(!dispatcher.unregister(id));
    dispatcher.emit(lost(SessionId::new()));
    queue.flush();

    assert_eq!(entries(&log), vec!["seen".to_string()]);
}

#[test]
fn runtime_queue_delivers_events() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap();
    let (_, dispatcher) = dispatcher();
    let queue = DispatchQueue::on_runtime(runtime.handle(), "runtime");
    assert_eq!(queue.name(), "runtime");

    let log: Log = Arc::default();
    let sink = Arc::clone(&log);
    dispatcher.register(EventKind::SessionLost, &queue, move |_| {
        push(&sink, std::thread::current().name().unwrap_or("").to_string());
        Ok(())
    });
    dispatcher.emit(lost(SessionId::new()));
    queue.flush();

    let seen = entries(&log);
    assert_eq!(seen.len(), 1);
    assert_ne!(
        seen[0],
        std::thread::current().name().unwrap_or("").to_string()
    );
}

#[test]
fn queues_run_independently() {
    let (_, dispatcher) = dispatcher();
    let fast = DispatchQueue::thread("fast").unwrap();
    let slow = DispatchQueue::thread("slow").unwrap();
    let log: Log = Arc::default();

    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    dispatcher.register(EventKind::SessionLost, &slow, move |_| {
        let _ = release_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv();
        Ok(())
    });
    let sink = Arc::clone(&log);
    dispatcher.register(EventKind::SessionLost, &fast, move |_| {
        push(&sink, "fast".into());
        Ok(())
    });

    dispatcher.emit(lost(SessionId::new()));
    fast.flush();
    assert_eq!(entries(&log), vec!["fast".to_string()]);

    release_tx.send(()).unwrap();
    slow.flush();
}

// ── Manager integration ──────────────────────────────────────────

#[test]
fn listeners_may_call_back_into_the_manager() {
    let server = TestServer::new();
    let manager = Arc::new(provisioned(&server));
    let queue = DispatchQueue::thread("reentrant").unwrap();
    let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::default();

    let weak = Arc::downgrade(&manager);
    let sink = Arc::clone(&seen);
    manager.register_listener(EventKind::KeyStatusChange, &queue, move |event| {
        let manager = weak.upgrade().ok_or_else(|| anyhow::anyhow!("manager dropped"))?;
        let session = event
            .session_id()
            .ok_or_else(|| anyhow::anyhow!("event without session"))?;
        let pairs = manager.query_key_status(session)?;
        sink.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(pairs.into_iter().take(1));
        Ok(())
    });

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
            &server.grant(&req.data, &[(1, KeyStatus::Usable)], None),
        )
        .unwrap();
    queue.flush();

    assert_eq!(
        seen.lock().unwrap_or_else(PoisonError::into_inner).clone(),
        vec![("01".to_string(), "USABLE".to_string())]
    );
}
