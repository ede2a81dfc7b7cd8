//! Operation and event counters.

use mediadrm_types::{EventKind, KeyStatus};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

/// Monotonic named counters.
#[derive(Debug, Default)]
pub struct Metrics {
    counters: Mutex<BTreeMap<String, u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one to `name`.
    pub fn incr(&self, name: &str) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        *counters.entry(name.to_string()).or_insert(0) += 1;
    }

    /// Counts the outcome of an operation as `<op>.ok` or `<op>.error`.
    pub fn record<T, E>(&self, op: &str, result: &Result<T, E>) {
        let suffix = if result.is_ok() { "ok" } else { "error" };
        self.incr(&format!("{op}.{suffix}"));
    }

    pub fn event(&self, kind: EventKind) {
        self.incr(&format!("event.{kind}"));
    }

    pub fn key_status(&self, status: KeyStatus) {
        self.incr(&format!("key_status.{status}"));
    }

    /// Current value of one counter.
    pub fn get(&self, name: &str) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.get(name).copied().unwrap_or(0)
    }

    /// A sorted copy of every counter.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_splits_ok_and_error() {
        let metrics = Metrics::new();
        metrics.record::<(), ()>("open_session", &Ok(()));
        metrics.record::<(), ()>("open_session", &Ok(()));
        metrics.record::<(), ()>("open_session", &Err(()));
        assert_eq!(metrics.get("open_session.ok"), 2);
        assert_eq!(metrics.get("open_session.error"), 1);
        assert_eq!(metrics.get("never"), 0);
    }

    #[test]
    fn event_and_status_names() {
        let metrics = Metrics::new();
        metrics.event(EventKind::SessionLost);
        metrics.key_status(KeyStatus::Usable);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.get("event.session_lost"), Some(&1));
        assert_eq!(snapshot.get("key_status.USABLE"), Some(&1));
    }
}
