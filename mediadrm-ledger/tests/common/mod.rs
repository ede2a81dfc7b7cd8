//! Shared test helpers for ledger tests.

#![allow(dead_code)]

use mediadrm_ledger::{OfflineLicenseRecord, SecureStopLedger, SecureStopRecord};
use mediadrm_types::{KeyId, KeySetId, SessionId};
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::TempDir;

/// Opens a file-backed ledger in a fresh temp dir.
pub fn file_ledger() -> (TempDir, std::path::PathBuf, SecureStopLedger) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ledger.db");
    let ledger = SecureStopLedger::open(&path).unwrap();
    (dir, path, ledger)
}

/// An active secure stop for one streaming key.
pub fn stop_for(session_id: SessionId) -> SecureStopRecord {
    SecureStopRecord::new(session_id, None, vec![KeyId::new(vec![0x01])])
}

/// A usable offline license with placeholder sealed keys.
pub fn license(key_set_id: KeySetId) -> OfflineLicenseRecord {
    OfflineLicenseRecord::new(
        key_set_id,
        Some("video/mp4".into()),
        Some("abcd".into()),
        vec![1, 2, 3, 4],
        None,
    )
}

/// Log lines written while a closure runs.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn during<T>(f: impl FnOnce() -> T) -> (T, String) {
        let logs = Self::default();
        let sink = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || sink.clone())
            .finish();
        let value = tracing::subscriber::with_default(subscriber, f);
        let bytes = logs.0.lock().unwrap_or_else(PoisonError::into_inner).clone();
        (value, String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
