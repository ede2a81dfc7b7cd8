//! Durable ledger for the mediadrm session manager.
//!
//! Stores secure stops (proof of key consumption), offline license state
//! with sealed key material, and device credentials from provisioning.
//! Backed by SQLite in WAL mode with full synchronous commits.

pub mod error;
pub mod ledger;
pub mod record;

pub use error::{LedgerError, LedgerResult};
pub use ledger::{LedgerTxn, SecureStopLedger};
pub use record::{DeviceCredentials, OfflineLicenseRecord, SecureStopRecord, SecureStopState};
