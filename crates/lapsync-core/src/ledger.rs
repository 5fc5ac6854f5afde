//! Record ledger: the ordered, durable list of laps for the current epoch
//!
//! The ledger itself is single-threaded; the session controller owns it on
//! its dedicated thread, which is the one serialization point for appends
//! and clears. Sequence numbers therefore follow arrival order, not
//! capture time.

use crate::record::{LapCandidate, LapRecord, SessionId, SessionMeta};
use crate::store::{LapStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Errors that can occur during ledger operations
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] StoreError),
}

/// Why an append was turned away
///
/// Both reasons are expected during a reset race and are not alarming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Candidate is tagged with a superseded (or unknown) epoch
    StaleEpoch,
    /// Current epoch is being cleared and no longer takes writes
    SessionClosed,
}

/// Result of a successful call to [`Ledger::append`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// New record committed and persisted
    Committed(LapRecord),
    /// `client_record_id` was already committed in this epoch; the
    /// existing record is returned unchanged
    Duplicate(LapRecord),
    Rejected(RejectReason),
}

impl AppendOutcome {
    /// The committed record, new or pre-existing
    pub fn record(&self) -> Option<&LapRecord> {
        match self {
            AppendOutcome::Committed(record) | AppendOutcome::Duplicate(record) => Some(record),
            AppendOutcome::Rejected(_) => None,
        }
    }
}

/// Ordered lap store for one epoch at a time
pub struct Ledger {
    store: Box<dyn LapStore>,
    session_id: SessionId,
    /// False once sealed for clearing
    accepting: bool,
    /// True after the current epoch's rows were deleted
    cleared: bool,
    records: Vec<LapRecord>,
    /// client_record_id -> index into `records`
    by_client_id: HashMap<String, usize>,
    next_sequence: u64,
}

impl Ledger {
    /// Start an empty ledger for `meta`, registering it with the store
    pub fn start(mut store: Box<dyn LapStore>, meta: &SessionMeta) -> Result<Self, LedgerError> {
        store.begin(meta)?;
        Ok(Self {
            store,
            session_id: meta.session_id.clone(),
            accepting: true,
            cleared: false,
            records: Vec::new(),
            by_client_id: HashMap::new(),
            next_sequence: 1,
        })
    }

    /// Rebuild the ledger from records already in the store
    pub fn restore(store: Box<dyn LapStore>, session_id: SessionId, records: Vec<LapRecord>) -> Self {
        let next_sequence = records.last().map_or(1, |r| r.sequence_number + 1);
        let by_client_id = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.client_record_id.clone(), i))
            .collect();
        Self {
            store,
            session_id,
            accepting: true,
            cleared: false,
            records,
            by_client_id,
            next_sequence,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    pub fn is_cleared(&self) -> bool {
        self.cleared
    }

    /// Records of the current epoch in sequence order
    pub fn records(&self) -> &[LapRecord] {
        &self.records
    }

    /// Assign the next sequence number and persist the candidate
    ///
    /// A number consumed by a failed store write is never handed out again.
    pub fn append(
        &mut self,
        candidate: LapCandidate,
        committed_at: DateTime<Utc>,
    ) -> Result<AppendOutcome, LedgerError> {
        if candidate.session_id != self.session_id || self.cleared {
            tracing::debug!(
                candidate = %candidate.session_id,
                current = %self.session_id,
                "Rejected append for stale epoch"
            );
            return Ok(AppendOutcome::Rejected(RejectReason::StaleEpoch));
        }
        if !self.accepting {
            tracing::debug!(session_id = %self.session_id, "Rejected append while clearing");
            return Ok(AppendOutcome::Rejected(RejectReason::SessionClosed));
        }
        if let Some(&index) = self.by_client_id.get(&candidate.client_record_id) {
            return Ok(AppendOutcome::Duplicate(self.records[index].clone()));
        }

        let sequence_number = self.next_sequence;
        self.next_sequence += 1;

        let record = LapRecord::from_candidate(candidate, sequence_number, committed_at);
        self.store.insert(&record)?;

        self.by_client_id
            .insert(record.client_record_id.clone(), self.records.len());
        self.records.push(record.clone());
        Ok(AppendOutcome::Committed(record))
    }

    /// Ordered records for `session_id`; empty for any other epoch
    pub fn snapshot(&self, session_id: &SessionId) -> Vec<LapRecord> {
        if session_id == &self.session_id && !self.cleared {
            self.records.clone()
        } else {
            Vec::new()
        }
    }

    /// Stop accepting appends for the current epoch
    pub fn seal(&mut self) {
        self.accepting = false;
    }

    /// Delete every record of `session_id`
    ///
    /// No-op for a non-current or already-cleared session. On failure the
    /// in-memory records are kept so nothing is half-deleted.
    pub fn clear(&mut self, session_id: &SessionId) -> Result<(), LedgerError> {
        if session_id != &self.session_id || self.cleared {
            return Ok(());
        }
        self.store.clear(session_id)?;
        self.accepting = false;
        self.cleared = true;
        self.records.clear();
        self.by_client_id.clear();
        Ok(())
    }

    /// Open the ledger for a new epoch; only valid after a clear
    pub fn begin(&mut self, meta: &SessionMeta) -> Result<(), LedgerError> {
        self.store.begin(meta)?;
        self.session_id = meta.session_id.clone();
        self.accepting = true;
        self.cleared = false;
        self.records.clear();
        self.by_client_id.clear();
        self.next_sequence = 1;
        Ok(())
    }
}
