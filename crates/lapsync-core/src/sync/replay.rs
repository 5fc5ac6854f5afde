//! Replay buffer: locally captured laps the server has not yet confirmed

use crate::record::SessionId;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A lap awaiting confirmation from the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingRecord {
    pub client_record_id: String,
    pub elapsed_ms: u64,
    pub captured_at: DateTime<Utc>,
    /// Epoch the agent believed current at capture; `None` if it had never
    /// seen one
    pub session_id: Option<SessionId>,
}

/// Unconfirmed records in capture order, unique by `client_record_id`
#[derive(Debug, Default, Clone)]
pub struct ReplayBuffer {
    entries: Vec<PendingRecord>,
}

impl ReplayBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record; returns false if its id is already buffered
    pub fn push(&mut self, record: PendingRecord) -> bool {
        if self.contains(&record.client_record_id) {
            return false;
        }
        self.entries.push(record);
        true
    }

    pub fn contains(&self, client_record_id: &str) -> bool {
        self.entries
            .iter()
            .any(|r| r.client_record_id == client_record_id)
    }

    /// Remove a confirmed record
    pub fn confirm(&mut self, client_record_id: &str) -> Option<PendingRecord> {
        let index = self
            .entries
            .iter()
            .position(|r| r.client_record_id == client_record_id)?;
        Some(self.entries.remove(index))
    }

    /// Drop every record tagged with an epoch other than `current`
    ///
    /// Untagged records are adopted into `current`. Returns the dropped ones.
    pub fn discard_stale(&mut self, current: &SessionId) -> Vec<PendingRecord> {
        let (keep, stale): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|r| r.session_id.as_ref().map_or(true, |s| s == current));
        self.entries = keep;
        for entry in &mut self.entries {
            entry.session_id = Some(current.clone());
        }
        stale
    }

    /// Drop every record tagged with exactly `session_id`
    pub fn discard_session(&mut self, session_id: &SessionId) -> Vec<PendingRecord> {
        let (stale, keep): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|r| r.session_id.as_ref() == Some(session_id));
        self.entries = keep;
        stale
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingRecord> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
