//! Durable storage behind the record ledger
//!
//! The ledger writes through a [`LapStore`] before acknowledging an append,
//! and clears a session in a single transaction so a concurrent reader sees
//! either every row of the epoch or none of them.

use crate::record::{LapRecord, SessionId, SessionMeta};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by a lap store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Last persisted session and its records, used to resume after restart
#[derive(Debug, Clone)]
pub struct StoredSession {
    pub meta: SessionMeta,
    /// True when the session was cleared but no successor was started
    pub cleared: bool,
    /// Records in sequence order
    pub records: Vec<LapRecord>,
}

/// Persistence boundary of the record ledger
pub trait LapStore: Send {
    /// Load the most recent session, if any
    fn load(&mut self) -> Result<Option<StoredSession>, StoreError>;

    /// Register a freshly minted session
    fn begin(&mut self, meta: &SessionMeta) -> Result<(), StoreError>;

    /// Persist one record; must be durable when this returns
    fn insert(&mut self, record: &LapRecord) -> Result<(), StoreError>;

    /// Delete every record of `session_id` atomically
    fn clear(&mut self, session_id: &SessionId) -> Result<(), StoreError>;
}

/// Switch that makes a [`MemoryStore`] fail its writes, simulating an outage
#[derive(Debug, Clone, Default)]
pub struct FaultSwitch(Arc<AtomicBool>);

impl FaultSwitch {
    pub fn set_unavailable(&self, unavailable: bool) {
        self.0.store(unavailable, Ordering::SeqCst);
    }

    pub fn is_unavailable(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Volatile store, used when no database is configured
#[derive(Debug, Default)]
pub struct MemoryStore {
    session: Option<StoredSession>,
    fault: FaultSwitch,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for toggling simulated storage failures
    pub fn fault_switch(&self) -> FaultSwitch {
        self.fault.clone()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.fault.is_unavailable() {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

impl LapStore for MemoryStore {
    fn load(&mut self) -> Result<Option<StoredSession>, StoreError> {
        self.check()?;
        Ok(self.session.clone())
    }

    fn begin(&mut self, meta: &SessionMeta) -> Result<(), StoreError> {
        self.check()?;
        self.session = Some(StoredSession {
            meta: meta.clone(),
            cleared: false,
            records: Vec::new(),
        });
        Ok(())
    }

    fn insert(&mut self, record: &LapRecord) -> Result<(), StoreError> {
        self.check()?;
        match self.session.as_mut() {
            Some(session) if session.meta.session_id == record.session_id => {
                session.records.push(record.clone());
                Ok(())
            }
            _ => Err(StoreError::Unavailable(format!(
                "no open session {}",
                record.session_id
            ))),
        }
    }

    fn clear(&mut self, session_id: &SessionId) -> Result<(), StoreError> {
        self.check()?;
        if let Some(session) = self.session.as_mut() {
            if &session.meta.session_id == session_id {
                session.records.clear();
                session.cleared = true;
            }
        }
        Ok(())
    }
}

/// SQLite-backed store
///
/// Tables:
/// - `sessions(session_id, epoch, started_at, cleared)`
/// - `lap_records(session_id, sequence_number, elapsed_ms, captured_at,
///   committed_at, client_record_id)`
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        tracing::info!(path = %path.display(), "Opened lap database");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Initializes the database schema.
    pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                epoch INTEGER NOT NULL,
                started_at TEXT,
                cleared INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS lap_records (
                session_id TEXT NOT NULL,
                sequence_number INTEGER NOT NULL,
                elapsed_ms INTEGER NOT NULL,
                captured_at TEXT NOT NULL,
                committed_at TEXT NOT NULL,
                client_record_id TEXT NOT NULL,
                PRIMARY KEY (session_id, sequence_number)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_lap_records_client_id
                ON lap_records(session_id, client_record_id);",
        )
    }
}

impl LapStore for SqliteStore {
    fn load(&mut self) -> Result<Option<StoredSession>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT session_id, epoch, started_at, cleared FROM sessions
                 ORDER BY epoch DESC LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<chrono::DateTime<chrono::Utc>>>(2)?,
                        row.get::<_, bool>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((session_id, epoch, started_at, cleared)) = row else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT sequence_number, elapsed_ms, captured_at, committed_at, client_record_id
             FROM lap_records WHERE session_id = ?1 ORDER BY sequence_number ASC",
        )?;
        let records = stmt
            .query_map(params![session_id], |row| {
                Ok(LapRecord {
                    sequence_number: row.get::<_, i64>(0)? as u64,
                    elapsed_ms: row.get::<_, i64>(1)? as u64,
                    captured_at: row.get(2)?,
                    committed_at: row.get(3)?,
                    client_record_id: row.get(4)?,
                    session_id: SessionId::from(session_id.clone()),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(StoredSession {
            meta: SessionMeta {
                session_id: SessionId::from(session_id),
                epoch: epoch as u64,
                started_at,
            },
            cleared,
            records,
        }))
    }

    fn begin(&mut self, meta: &SessionMeta) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO sessions (session_id, epoch, started_at, cleared)
             VALUES (?1, ?2, ?3, 0)",
            params![meta.session_id.as_str(), meta.epoch as i64, meta.started_at],
        )?;
        Ok(())
    }

    fn insert(&mut self, record: &LapRecord) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO lap_records
             (session_id, sequence_number, elapsed_ms, captured_at, committed_at, client_record_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.session_id.as_str(),
                record.sequence_number as i64,
                record.elapsed_ms as i64,
                record.captured_at,
                record.committed_at,
                record.client_record_id,
            ],
        )?;
        Ok(())
    }

    fn clear(&mut self, session_id: &SessionId) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM lap_records WHERE session_id = ?1",
            params![session_id.as_str()],
        )?;
        tx.execute(
            "UPDATE sessions SET cleared = 1 WHERE session_id = ?1",
            params![session_id.as_str()],
        )?;
        tx.commit()?;
        tracing::debug!(%session_id, deleted, "Cleared session rows");
        Ok(())
    }
}
