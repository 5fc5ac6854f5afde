//! Lap records, session identity and ledger events
//!
//! Every record and every event carries the [`SessionId`] of the epoch it
//! belongs to. Observers compare that tag against the epoch they track and
//! never merge anything from a different one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of one timing run (epoch)
///
/// Only equality is meaningful. A new id is minted on every reset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Mint the id for `epoch`, made unique across restarts by the mint time
    pub fn mint(epoch: u64, now: DateTime<Utc>) -> Self {
        Self(format!("{}-{}", epoch, now.timestamp_millis()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session Controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Accepting appends for the current epoch
    Active,
    /// Reset in progress: appends are rejected, data not yet deleted
    Clearing,
    /// Old epoch deleted, new epoch not yet minted
    Cleared,
}

/// Persistent identity of a session epoch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMeta {
    pub session_id: SessionId,
    /// Monotonic counter behind the id, survives restarts through the store
    pub epoch: u64,
    pub started_at: Option<DateTime<Utc>>,
}

impl SessionMeta {
    /// Mint a new epoch starting now
    pub fn mint(epoch: u64) -> Self {
        let now = Utc::now();
        Self {
            session_id: SessionId::mint(epoch, now),
            epoch,
            started_at: Some(now),
        }
    }
}

/// A lap submitted for commit, not yet sequenced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LapCandidate {
    /// Time since session start at the moment of capture
    pub elapsed_ms: u64,
    /// Wall-clock capture time as observed by the client
    pub captured_at: DateTime<Utc>,
    /// Client-generated idempotency key
    pub client_record_id: String,
    /// Epoch the client believed current when capturing
    pub session_id: SessionId,
}

/// A committed lap, immutable once created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LapRecord {
    /// Ledger-assigned, strictly increasing within the session (gaps allowed)
    pub sequence_number: u64,
    pub elapsed_ms: u64,
    pub captured_at: DateTime<Utc>,
    /// When the ledger accepted the record
    pub committed_at: DateTime<Utc>,
    pub client_record_id: String,
    pub session_id: SessionId,
}

impl LapRecord {
    pub fn from_candidate(
        candidate: LapCandidate,
        sequence_number: u64,
        committed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            sequence_number,
            elapsed_ms: candidate.elapsed_ms,
            captured_at: candidate.captured_at,
            committed_at,
            client_record_id: candidate.client_record_id,
            session_id: candidate.session_id,
        }
    }
}

/// Mutation notifications fanned out by the broadcast hub
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    RecordAppended {
        record: LapRecord,
    },
    SessionCleared {
        session_id: SessionId,
    },
    SessionStarted {
        session_id: SessionId,
        started_at: Option<DateTime<Utc>>,
    },
}

impl LedgerEvent {
    /// Epoch this event belongs to
    pub fn session_id(&self) -> &SessionId {
        match self {
            LedgerEvent::RecordAppended { record } => &record.session_id,
            LedgerEvent::SessionCleared { session_id } => session_id,
            LedgerEvent::SessionStarted { session_id, .. } => session_id,
        }
    }
}

/// Immutable snapshot of the ledger as one observer may see it
///
/// A view is replaced wholesale on every mutation, so readers never
/// observe a half-applied reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerView {
    pub session_id: SessionId,
    pub state: SessionState,
    pub started_at: Option<DateTime<Utc>>,
    /// Records in sequence order
    pub records: Vec<LapRecord>,
}

impl LedgerView {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records of `session_id`, empty for any other epoch
    pub fn records_for(&self, session_id: &SessionId) -> &[LapRecord] {
        if &self.session_id == session_id {
            &self.records
        } else {
            &[]
        }
    }
}

/// Split time of the record at `index` relative to its predecessor
///
/// The first lap's split equals its elapsed time.
pub fn lap_time_ms(records: &[LapRecord], index: usize) -> Option<u64> {
    let current = records.get(index)?;
    let previous = match index {
        0 => 0,
        i => records[i - 1].elapsed_ms,
    };
    Some(current.elapsed_ms.saturating_sub(previous))
}
