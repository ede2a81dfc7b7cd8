//! SQLite-backed ledger of secure stops, offline licenses and device
//! credentials.
//!
//! Every mutation runs inside one transaction. A batch either commits in
//! full or leaves no trace, including when the writer panics or the
//! process dies mid-batch.

use crate::error::{LedgerError, LedgerResult};
use crate::record::{
    DeviceCredentials, OfflineLicenseRecord, SecureStopRecord, SecureStopState, now,
};
use chrono::{DateTime, Utc};
use mediadrm_types::{KeyId, KeySetId, OfflineLicenseState, SecureStopId, SessionId};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};
use uuid::Uuid;

/// Durable store for secure stops and offline licenses.
#[derive(Clone)]
pub struct SecureStopLedger {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SecureStopLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureStopLedger").finish_non_exhaustive()
    }
}

impl SecureStopLedger {
    /// Opens (or creates) a ledger at the given path.
    pub fn open(path: impl AsRef<Path>) -> LedgerResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .map_err(|e| LedgerError::db("failed to open ledger", e))?;
        debug!(path = %path.display(), "opened secure stop ledger");
        Self::with_connection(conn)
    }

    /// Opens an in-memory ledger. Nothing survives the process.
    pub fn open_in_memory() -> LedgerResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| LedgerError::db("failed to open in-memory ledger", e))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> LedgerResult<Self> {
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })
        .map_err(|e| LedgerError::db("failed to enable WAL", e))?;
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(|e| LedgerError::db("failed to set synchronous mode", e))?;

        let ledger = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    fn init_schema(&self) -> LedgerResult<()> {
        let conn = self.lock();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS secure_stops (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                key_set_id TEXT,
                key_ids TEXT NOT NULL,
                state TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                finalized_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_secure_stops_session
                ON secure_stops(session_id);

            CREATE TABLE IF NOT EXISTS offline_licenses (
                key_set_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                mime_type TEXT,
                init_digest TEXT,
                sealed_keys BLOB NOT NULL,
                expires_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS device_credentials (
                scheme_id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL,
                device_key BLOB NOT NULL,
                provisioned_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS retired_device_keys (
                scheme_id TEXT NOT NULL,
                device_key BLOB NOT NULL,
                retired_at INTEGER NOT NULL,
                PRIMARY KEY (scheme_id, device_key)
            );
            ",
        )
        .map_err(|e| LedgerError::db("failed to init ledger schema", e))?;
        Ok(())
    }

    // A panicking writer poisons the mutex, but its transaction was rolled
    // back during unwinding, so the connection is still consistent.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` inside one transaction. Commits when `f` returns `Ok`, rolls
    /// back when it returns `Err` or panics.
    pub fn write<T>(&self, f: impl FnOnce(&LedgerTxn<'_>) -> LedgerResult<T>) -> LedgerResult<T> {
        let mut conn = self.lock();
        let tx = conn
            .transaction()
            .map_err(|e| LedgerError::db("failed to begin transaction", e))?;
        let value = f(&LedgerTxn { conn: &tx })?;
        tx.commit()
            .map_err(|e| LedgerError::db("failed to commit transaction", e))?;
        Ok(value)
    }

    fn read<T>(&self, f: impl FnOnce(&Connection) -> LedgerResult<T>) -> LedgerResult<T> {
        let conn = self.lock();
        f(&conn)
    }

    // ── Secure stops ─────────────────────────────────────────────

    /// Ids of every stored secure stop, oldest first.
    pub fn list(&self) -> LedgerResult<Vec<SecureStopId>> {
        self.read(|conn| {
            let mut stmt = conn
                .prepare("SELECT id FROM secure_stops ORDER BY started_at, id")
                .map_err(|e| LedgerError::db("failed to prepare secure stop query", e))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| LedgerError::db("failed to query secure stops", e))?;
            let mut ids = Vec::new();
            for row in rows {
                let raw = row.map_err(|e| LedgerError::db("failed to read secure stop row", e))?;
                ids.push(parse_id(&raw, SecureStopId::parse)?);
            }
            Ok(ids)
        })
    }

    /// The opaque bytes of one secure stop.
    pub fn get(&self, id: &SecureStopId) -> LedgerResult<Vec<u8>> {
        self.secure_stop(id)?
            .ok_or_else(|| LedgerError::NotFound(format!("secure stop {id}")))?
            .to_bytes()
    }

    /// One secure stop record, if present.
    pub fn secure_stop(&self, id: &SecureStopId) -> LedgerResult<Option<SecureStopRecord>> {
        self.read(|conn| select_secure_stop(conn, id))
    }

    /// Every stored secure stop record, oldest first.
    pub fn secure_stop_records(&self) -> LedgerResult<Vec<SecureStopRecord>> {
        self.read(|conn| {
            let sql = format!("SELECT {STOP_COLUMNS} FROM secure_stops ORDER BY started_at, id");
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| LedgerError::db("failed to prepare secure stop query", e))?;
            let rows = stmt
                .query_map([], read_stop_row)
                .map_err(|e| LedgerError::db("failed to query secure stops", e))?;
            let mut records = Vec::new();
            for row in rows {
                let raw = row.map_err(|e| LedgerError::db("failed to read secure stop row", e))?;
                records.push(decode_stop(raw)?);
            }
            Ok(records)
        })
    }

    /// The opaque bytes of every stored secure stop.
    pub fn secure_stops(&self) -> LedgerResult<Vec<Vec<u8>>> {
        self.secure_stop_records()?
            .iter()
            .map(SecureStopRecord::to_bytes)
            .collect()
    }

    /// Removes every listed secure stop, or none of them if any id is
    /// unknown. Returns the number removed.
    pub fn release(&self, ids: &[SecureStopId]) -> LedgerResult<usize> {
        let unique: BTreeSet<SecureStopId> = ids.iter().copied().collect();
        let removed = self.write(|txn| {
            for id in &unique {
                txn.delete_secure_stop(id)?;
            }
            Ok(unique.len())
        })?;
        debug!(removed, "released secure stops");
        Ok(removed)
    }

    /// Forcibly removes one secure stop without server confirmation.
    pub fn remove(&self, id: &SecureStopId) -> LedgerResult<()> {
        self.write(|txn| txn.delete_secure_stop(id))?;
        warn!(secure_stop = %id, "forcibly removed secure stop");
        Ok(())
    }

    /// Forcibly removes every secure stop without server confirmation.
    pub fn remove_all(&self) -> LedgerResult<usize> {
        let removed = self.write(|txn| txn.delete_all_secure_stops())?;
        warn!(removed, "forcibly removed all secure stops");
        Ok(removed)
    }

    /// Removes every secure stop.
    #[deprecated(note = "use `remove_all`")]
    pub fn release_all_secure_stops(&self) -> LedgerResult<usize> {
        self.remove_all()
    }

    // ── Offline licenses ─────────────────────────────────────────

    /// Key set ids of every stored offline license, oldest first.
    pub fn list_offline_licenses(&self) -> LedgerResult<Vec<KeySetId>> {
        self.read(|conn| {
            let mut stmt = conn
                .prepare("SELECT key_set_id FROM offline_licenses ORDER BY created_at, key_set_id")
                .map_err(|e| LedgerError::db("failed to prepare offline license query", e))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| LedgerError::db("failed to query offline licenses", e))?;
            let mut ids = Vec::new();
            for row in rows {
                let raw =
                    row.map_err(|e| LedgerError::db("failed to read offline license row", e))?;
                ids.push(parse_id(&raw, KeySetId::parse)?);
            }
            Ok(ids)
        })
    }

    /// State of an offline license. `Unknown` when nothing is stored.
    pub fn license_state(&self, id: &KeySetId) -> LedgerResult<OfflineLicenseState> {
        Ok(self
            .offline_license(id)?
            .map_or(OfflineLicenseState::Unknown, |record| record.state))
    }

    /// One offline license record, if present.
    pub fn offline_license(&self, id: &KeySetId) -> LedgerResult<Option<OfflineLicenseRecord>> {
        self.read(|conn| select_offline_license(conn, id))
    }

    /// Forcibly deletes an offline license without server confirmation.
    pub fn remove_offline_license(&self, id: &KeySetId) -> LedgerResult<()> {
        self.write(|txn| txn.delete_offline_license(id))?;
        warn!(key_set = %id, "forcibly removed offline license");
        Ok(())
    }

    // ── Device credentials ───────────────────────────────────────

    /// Credentials stored for a scheme, if provisioned.
    pub fn device_credentials(&self, scheme_id: &Uuid) -> LedgerResult<Option<DeviceCredentials>> {
        self.read(|conn| {
            conn.query_row(
                "SELECT scheme_id, device_id, device_key, provisioned_at FROM device_credentials WHERE scheme_id = ?1",
                params![scheme_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| LedgerError::db("failed to query device credentials", e))?
            .map(|(scheme, device_id, device_key, provisioned_at)| -> LedgerResult<_> {
                Ok(DeviceCredentials {
                    scheme_id: parse_id(&scheme, Uuid::parse_str)?,
                    device_id,
                    device_key,
                    provisioned_at: from_millis(provisioned_at)?,
                })
            })
            .transpose()
        })
    }

    /// Device keys retired by reprovisioning, newest first.
    pub fn retired_device_keys(&self, scheme_id: &Uuid) -> LedgerResult<Vec<Vec<u8>>> {
        self.read(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT device_key FROM retired_device_keys WHERE scheme_id = ?1
                     ORDER BY retired_at DESC, rowid DESC",
                )
                .map_err(|e| LedgerError::db("failed to prepare retired key query", e))?;
            let rows = stmt
                .query_map(params![scheme_id.to_string()], |row| row.get::<_, Vec<u8>>(0))
                .map_err(|e| LedgerError::db("failed to query retired device keys", e))?;
            let mut keys = Vec::new();
            for row in rows {
                keys.push(row.map_err(|e| LedgerError::db("failed to read retired key row", e))?);
            }
            Ok(keys)
        })
    }
}

/// Mutation handle passed to [`SecureStopLedger::write`].
pub struct LedgerTxn<'a> {
    conn: &'a Connection,
}

impl LedgerTxn<'_> {
    /// Inserts a secure stop.
    pub fn insert_secure_stop(&self, record: &SecureStopRecord) -> LedgerResult<()> {
        let key_ids = serde_json::to_string(&record.key_ids)?;
        self.conn
            .execute(
                "INSERT INTO secure_stops (id, session_id, key_set_id, key_ids, state, started_at, finalized_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.id.to_string(),
                    record.session_id.to_string(),
                    record.key_set_id.map(|id| id.to_string()),
                    key_ids,
                    record.state.to_string(),
                    record.started_at.timestamp_millis(),
                    record.finalized_at.map(|t| t.timestamp_millis()),
                ],
            )
            .map_err(|e| LedgerError::db("failed to insert secure stop", e))?;
        Ok(())
    }

    /// Finalizes the active secure stops of a session.
    pub fn finalize_session_stops(&self, session_id: &SessionId) -> LedgerResult<usize> {
        self.conn
            .execute(
                "UPDATE secure_stops SET state = ?1, finalized_at = ?2 WHERE session_id = ?3 AND state = ?4",
                params![
                    SecureStopState::Finalized.to_string(),
                    now().timestamp_millis(),
                    session_id.to_string(),
                    SecureStopState::Active.to_string(),
                ],
            )
            .map_err(|e| LedgerError::db("failed to finalize session secure stops", e))
    }

    /// Finalizes the active secure stops of an offline license.
    pub fn finalize_key_set_stops(&self, key_set_id: &KeySetId) -> LedgerResult<usize> {
        self.conn
            .execute(
                "UPDATE secure_stops SET state = ?1, finalized_at = ?2 WHERE key_set_id = ?3 AND state = ?4",
                params![
                    SecureStopState::Finalized.to_string(),
                    now().timestamp_millis(),
                    key_set_id.to_string(),
                    SecureStopState::Active.to_string(),
                ],
            )
            .map_err(|e| LedgerError::db("failed to finalize key set secure stops", e))
    }

    /// Deletes one secure stop. `NotFound` when absent.
    pub fn delete_secure_stop(&self, id: &SecureStopId) -> LedgerResult<()> {
        let deleted = self
            .conn
            .execute("DELETE FROM secure_stops WHERE id = ?1", params![id.to_string()])
            .map_err(|e| LedgerError::db("failed to delete secure stop", e))?;
        if deleted == 0 {
            return Err(LedgerError::NotFound(format!("secure stop {id}")));
        }
        Ok(())
    }

    /// Deletes every secure stop.
    pub fn delete_all_secure_stops(&self) -> LedgerResult<usize> {
        self.conn
            .execute("DELETE FROM secure_stops", [])
            .map_err(|e| LedgerError::db("failed to delete secure stops", e))
    }

    /// Reads a secure stop within the transaction.
    pub fn secure_stop(&self, id: &SecureStopId) -> LedgerResult<Option<SecureStopRecord>> {
        select_secure_stop(self.conn, id)
    }

    /// Inserts an offline license, or overwrites a stored one while keeping
    /// its creation time.
    pub fn put_offline_license(&self, record: &OfflineLicenseRecord) -> LedgerResult<()> {
        self.conn
            .execute(
                "INSERT INTO offline_licenses
                 (key_set_id, state, mime_type, init_digest, sealed_keys, expires_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(key_set_id) DO UPDATE SET
                    state = excluded.state,
                    mime_type = excluded.mime_type,
                    init_digest = excluded.init_digest,
                    sealed_keys = excluded.sealed_keys,
                    expires_at = excluded.expires_at,
                    updated_at = excluded.updated_at",
                params![
                    record.key_set_id.to_string(),
                    record.state.to_string(),
                    record.mime_type,
                    record.init_digest,
                    record.sealed_keys,
                    record.expires_at.map(|t| t.timestamp_millis()),
                    record.created_at.timestamp_millis(),
                    record.updated_at.timestamp_millis(),
                ],
            )
            .map_err(|e| LedgerError::db("failed to store offline license", e))?;
        Ok(())
    }

    /// Replaces the sealed keys and expiry of a usable offline license.
    /// Returns false, changing nothing, when the license is released or
    /// absent.
    pub fn renew_offline_license(
        &self,
        id: &KeySetId,
        sealed_keys: &[u8],
        expires_at: Option<DateTime<Utc>>,
    ) -> LedgerResult<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE offline_licenses SET sealed_keys = ?1, expires_at = ?2, updated_at = ?3
                 WHERE key_set_id = ?4 AND state = ?5",
                params![
                    sealed_keys,
                    expires_at.map(|t| t.timestamp_millis()),
                    now().timestamp_millis(),
                    id.to_string(),
                    OfflineLicenseState::Usable.to_string(),
                ],
            )
            .map_err(|e| LedgerError::db("failed to renew offline license", e))?;
        Ok(updated > 0)
    }

    /// Moves an offline license to a new state. `NotFound` when absent.
    pub fn set_offline_license_state(
        &self,
        id: &KeySetId,
        state: OfflineLicenseState,
    ) -> LedgerResult<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE offline_licenses SET state = ?1, updated_at = ?2 WHERE key_set_id = ?3",
                params![state.to_string(), now().timestamp_millis(), id.to_string()],
            )
            .map_err(|e| LedgerError::db("failed to update offline license", e))?;
        if updated == 0 {
            return Err(LedgerError::NotFound(format!("offline license {id}")));
        }
        Ok(())
    }

    /// Deletes an offline license. `NotFound` when absent.
    pub fn delete_offline_license(&self, id: &KeySetId) -> LedgerResult<()> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM offline_licenses WHERE key_set_id = ?1",
                params![id.to_string()],
            )
            .map_err(|e| LedgerError::db("failed to delete offline license", e))?;
        if deleted == 0 {
            return Err(LedgerError::NotFound(format!("offline license {id}")));
        }
        Ok(())
    }

    /// Reads an offline license within the transaction.
    pub fn offline_license(&self, id: &KeySetId) -> LedgerResult<Option<OfflineLicenseRecord>> {
        select_offline_license(self.conn, id)
    }

    /// Stores provisioning output for a scheme, replacing older credentials.
    /// Callers that need the old key afterwards retire it first with
    /// [`LedgerTxn::retire_device_credentials`].
    pub fn put_device_credentials(&self, credentials: &DeviceCredentials) -> LedgerResult<()> {
        self.conn
            .execute(
                "DELETE FROM retired_device_keys WHERE scheme_id = ?1 AND device_key = ?2",
                params![credentials.scheme_id.to_string(), credentials.device_key],
            )
            .map_err(|e| LedgerError::db("failed to unretire device key", e))?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO device_credentials (scheme_id, device_id, device_key, provisioned_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    credentials.scheme_id.to_string(),
                    credentials.device_id,
                    credentials.device_key,
                    credentials.provisioned_at.timestamp_millis(),
                ],
            )
            .map_err(|e| LedgerError::db("failed to store device credentials", e))?;
        Ok(())
    }

    /// Moves the current device key of a scheme to the retired keys and drops
    /// its credentials. Returns whether any existed.
    pub fn retire_device_credentials(&self, scheme_id: &Uuid) -> LedgerResult<bool> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO retired_device_keys (scheme_id, device_key, retired_at)
                 SELECT scheme_id, device_key, ?2 FROM device_credentials WHERE scheme_id = ?1",
                params![scheme_id.to_string(), now().timestamp_millis()],
            )
            .map_err(|e| LedgerError::db("failed to retire device key", e))?;
        self.delete_device_credentials(scheme_id)
    }

    /// Drops the credentials of a scheme. Returns whether any existed.
    pub fn delete_device_credentials(&self, scheme_id: &Uuid) -> LedgerResult<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM device_credentials WHERE scheme_id = ?1",
                params![scheme_id.to_string()],
            )
            .map_err(|e| LedgerError::db("failed to delete device credentials", e))?;
        Ok(deleted > 0)
    }
}

// ── Row decoding ─────────────────────────────────────────────────

const STOP_COLUMNS: &str = "id, session_id, key_set_id, key_ids, state, started_at, finalized_at";

type StopRow = (String, String, Option<String>, String, String, i64, Option<i64>);

fn read_stop_row(row: &Row<'_>) -> rusqlite::Result<StopRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode_stop(raw: StopRow) -> LedgerResult<SecureStopRecord> {
    let (id, session_id, key_set_id, key_ids, state, started_at, finalized_at) = raw;
    let key_ids: Vec<KeyId> = serde_json::from_str(&key_ids)?;
    Ok(SecureStopRecord {
        id: parse_id(&id, SecureStopId::parse)?,
        session_id: parse_id(&session_id, SessionId::parse)?,
        key_set_id: key_set_id
            .map(|s| parse_id(&s, KeySetId::parse))
            .transpose()?,
        key_ids,
        state: state.parse().map_err(LedgerError::InvalidData)?,
        started_at: from_millis(started_at)?,
        finalized_at: finalized_at.map(from_millis).transpose()?,
    })
}

fn select_secure_stop(
    conn: &Connection,
    id: &SecureStopId,
) -> LedgerResult<Option<SecureStopRecord>> {
    let sql = format!("SELECT {STOP_COLUMNS} FROM secure_stops WHERE id = ?1");
    conn.query_row(&sql, params![id.to_string()], read_stop_row)
        .optional()
        .map_err(|e| LedgerError::db("failed to query secure stop", e))?
        .map(decode_stop)
        .transpose()
}

type LicenseRow = (
    String,
    String,
    Option<String>,
    Option<String>,
    Vec<u8>,
    Option<i64>,
    i64,
    i64,
);

fn select_offline_license(
    conn: &Connection,
    id: &KeySetId,
) -> LedgerResult<Option<OfflineLicenseRecord>> {
    let raw: Option<LicenseRow> = conn
        .query_row(
            "SELECT key_set_id, state, mime_type, init_digest, sealed_keys, expires_at, created_at, updated_at
             FROM offline_licenses WHERE key_set_id = ?1",
            params![id.to_string()],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                ))
            },
        )
        .optional()
        .map_err(|e| LedgerError::db("failed to query offline license", e))?;

    let Some((key_set_id, state, mime_type, init_digest, sealed_keys, expires_at, created, updated)) =
        raw
    else {
        return Ok(None);
    };

    Ok(Some(OfflineLicenseRecord {
        key_set_id: parse_id(&key_set_id, KeySetId::parse)?,
        state: state
            .parse()
            .map_err(|e: mediadrm_types::Error| LedgerError::InvalidData(e.to_string()))?,
        mime_type,
        init_digest,
        sealed_keys,
        expires_at: expires_at.map(from_millis).transpose()?,
        created_at: from_millis(created)?,
        updated_at: from_millis(updated)?,
    }))
}

fn parse_id<T, E: std::fmt::Display>(
    raw: &str,
    parse: impl FnOnce(&str) -> Result<T, E>,
) -> LedgerResult<T> {
    parse(raw).map_err(|e| LedgerError::InvalidData(format!("bad id {raw:?}: {e}")))
}

fn from_millis(ms: i64) -> LedgerResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| LedgerError::InvalidData(format!("timestamp out of range: {ms}")))
}
