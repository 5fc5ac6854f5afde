//! Client sync agent
//!
//! A synchronous, I/O-free state machine that tracks one client's view of
//! the ledger. The async driver feeds it transport events and server
//! messages and carries out the [`Effect`]s it returns, which keeps the
//! reconnect and replay rules testable without a socket.
//!
//! ```text
//! Offline -> Connecting -> Synced -> Offline -> Resyncing -> Synced
//!                  \__________________________\-> Failed (gave up)
//! ```
//!
//! Every local lap goes into the replay buffer first and leaves it only
//! when the server confirms it (receipt, broadcast or snapshot). On each
//! snapshot the buffer is either resubmitted in full, which is safe because
//! the ledger dedupes by `client_record_id`, or discarded when it belongs to
//! an epoch that has since been reset.

pub mod replay;

pub use replay::{PendingRecord, ReplayBuffer};

use crate::protocol::{ClientMessage, ReceiptStatus, ServerMessage};
use crate::record::{LapRecord, SessionId, SessionState};
use chrono::{DateTime, Utc};

/// Connection state of the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// No transport
    Offline,
    /// First connection attempt, waiting for transport and snapshot
    Connecting { attempt: u64 },
    /// Reconnecting after having been synced, waiting for a snapshot
    Resyncing { attempt: u64 },
    /// Snapshot applied; live events are merged as they arrive
    Synced,
    /// Reconnection gave up; stays offline until asked to reconnect
    Failed,
}

/// Something the observer UI should learn about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Local view replaced; `started_at` is the epoch's start on the server
    /// clock, the origin of every lap's `elapsed_ms`
    Snapshot {
        session_id: SessionId,
        state: SessionState,
        started_at: Option<DateTime<Utc>>,
        records: Vec<LapRecord>,
    },
    RecordAppended(LapRecord),
    SessionCleared(SessionId),
    SessionStarted {
        session_id: SessionId,
        started_at: Option<DateTime<Utc>>,
    },
    ConnectivityChanged(bool),
    /// A local lap is buffered and not yet confirmed
    RecordPending(PendingRecord),
    /// Offline laps dropped because their epoch was reset
    ReplayDiscarded(Vec<PendingRecord>),
    /// Storage failed on the server; the lap stays pending
    SubmissionFailed {
        client_record_id: String,
        message: String,
    },
    ServerError(String),
    /// Reconnection attempts exhausted
    GaveUp,
}

/// Work the driver must perform on the agent's behalf
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Send(ClientMessage),
    Notify(Notice),
}

/// Fresh idempotency key for a locally captured lap
pub fn new_client_record_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Per-client sync state machine
#[derive(Debug)]
pub struct SyncAgent {
    state: AgentState,
    /// Id of the newest connection attempt; older ones are superseded
    attempt: u64,
    transport_up: bool,
    /// Whether `ConnectivityChanged(true)` is the last thing reported
    connected: bool,
    ever_synced: bool,
    session_id: Option<SessionId>,
    session_state: Option<SessionState>,
    started_at: Option<DateTime<Utc>>,
    records: Vec<LapRecord>,
    replay: ReplayBuffer,
}

impl Default for SyncAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncAgent {
    pub fn new() -> Self {
        Self {
            state: AgentState::Offline,
            attempt: 0,
            transport_up: false,
            connected: false,
            ever_synced: false,
            session_id: None,
            session_state: None,
            started_at: None,
            records: Vec::new(),
            replay: ReplayBuffer::new(),
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn is_synced(&self) -> bool {
        self.state == AgentState::Synced
    }

    /// Epoch the local view belongs to
    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn session_state(&self) -> Option<SessionState> {
        self.session_state
    }

    /// Server-side start of the current epoch, if known
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Milliseconds since the current epoch started, as of `now`
    ///
    /// `None` until a session with a known start has been seen. Never
    /// negative, so a client clock running behind the server reads as 0.
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> Option<u64> {
        self.started_at
            .map(|started| (now - started).num_milliseconds().max(0) as u64)
    }

    /// Confirmed records in sequence order
    pub fn records(&self) -> &[LapRecord] {
        &self.records
    }

    /// Local laps awaiting confirmation
    pub fn pending(&self) -> &ReplayBuffer {
        &self.replay
    }

    pub fn current_attempt(&self) -> u64 {
        self.attempt
    }

    /// Capture a lap locally
    ///
    /// The lap is buffered and tagged with the last known epoch; it is sent
    /// right away only when synced to an active session.
    pub fn record(
        &mut self,
        client_record_id: String,
        elapsed_ms: u64,
        captured_at: DateTime<Utc>,
    ) -> Vec<Effect> {
        let pending = PendingRecord {
            client_record_id,
            elapsed_ms,
            captured_at,
            session_id: self.session_id.clone(),
        };
        if !self.replay.push(pending.clone()) {
            return Vec::new();
        }
        let mut effects = Vec::new();
        if self.can_submit() {
            effects.push(Effect::Send(submit_message(&pending)));
        }
        effects.insert(0, Effect::Notify(Notice::RecordPending(pending)));
        effects
    }

    /// Start a new connection attempt, superseding any earlier one
    pub fn begin_connect(&mut self) -> u64 {
        self.attempt += 1;
        self.transport_up = false;
        self.state = if self.ever_synced {
            AgentState::Resyncing {
                attempt: self.attempt,
            }
        } else {
            AgentState::Connecting {
                attempt: self.attempt,
            }
        };
        self.attempt
    }

    /// Transport for `attempt` is up
    ///
    /// The server answers a new subscription with a snapshot, which is the
    /// resync round-trip this attempt now waits for.
    pub fn on_connected(&mut self, attempt: u64) {
        if attempt == self.attempt {
            self.transport_up = true;
        }
    }

    /// Transport for `attempt` dropped or could not be established
    pub fn on_transport_lost(&mut self, attempt: u64) -> Vec<Effect> {
        if attempt != self.attempt {
            return Vec::new();
        }
        self.transport_up = false;
        self.state = AgentState::Offline;
        self.set_connected(false).into_iter().collect()
    }

    /// Reconnection is exhausted; report a persistent disconnect
    pub fn on_gave_up(&mut self) -> Vec<Effect> {
        self.transport_up = false;
        self.state = AgentState::Failed;
        let mut effects: Vec<Effect> = self.set_connected(false).into_iter().collect();
        effects.push(Effect::Notify(Notice::GaveUp));
        effects
    }

    /// Ask for a fresh snapshot; `None` while there is no transport
    ///
    /// The reply also resubmits everything still pending.
    pub fn request_snapshot(&self) -> Option<Effect> {
        self.transport_up
            .then_some(Effect::Send(ClientMessage::RequestSnapshot))
    }

    /// Ask the server for an explicit reset; `None` while there is no transport
    ///
    /// Resets are never buffered offline.
    pub fn request_reset(&self) -> Option<Effect> {
        self.transport_up
            .then_some(Effect::Send(ClientMessage::RequestReset))
    }

    /// Apply a message received on the transport of `attempt`
    pub fn on_server_message(&mut self, attempt: u64, message: ServerMessage) -> Vec<Effect> {
        if attempt != self.attempt {
            tracing::debug!(attempt, current = self.attempt, "Ignoring message from superseded attempt");
            return Vec::new();
        }
        match message {
            ServerMessage::Snapshot {
                session_id,
                state,
                started_at,
                records,
            } => self.apply_snapshot(session_id, state, started_at, records),
            ServerMessage::RecordAppended { record } => self.apply_appended(record),
            ServerMessage::SessionCleared { session_id } => self.apply_cleared(session_id),
            ServerMessage::SessionStarted {
                session_id,
                started_at,
            } => self.apply_started(session_id, started_at),
            ServerMessage::Receipt {
                client_record_id,
                status,
            } => self.apply_receipt(client_record_id, status),
            ServerMessage::Error { message } => {
                tracing::warn!(%message, "Server reported an error");
                vec![Effect::Notify(Notice::ServerError(message))]
            }
        }
    }

    fn can_submit(&self) -> bool {
        self.state == AgentState::Synced && self.session_state == Some(SessionState::Active)
    }

    fn set_connected(&mut self, connected: bool) -> Option<Effect> {
        if self.connected == connected {
            return None;
        }
        self.connected = connected;
        Some(Effect::Notify(Notice::ConnectivityChanged(connected)))
    }

    fn apply_snapshot(
        &mut self,
        session_id: SessionId,
        state: SessionState,
        started_at: Option<DateTime<Utc>>,
        records: Vec<LapRecord>,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();

        let stale = self.replay.discard_stale(&session_id);
        if !stale.is_empty() {
            tracing::warn!(
                count = stale.len(),
                %session_id,
                "Discarding offline laps recorded before a reset"
            );
            effects.push(Effect::Notify(Notice::ReplayDiscarded(stale)));
        }

        let mut records: Vec<LapRecord> = records
            .into_iter()
            .filter(|r| r.session_id == session_id)
            .collect();
        records.sort_by_key(|r| r.sequence_number);
        records.dedup_by_key(|r| r.sequence_number);
        for record in &records {
            self.replay.confirm(&record.client_record_id);
        }

        self.records = records;
        self.session_id = Some(session_id.clone());
        self.session_state = Some(state);
        self.started_at = started_at;
        self.state = AgentState::Synced;
        self.transport_up = true;
        self.ever_synced = true;

        effects.extend(self.set_connected(true));
        effects.push(Effect::Notify(Notice::Snapshot {
            session_id,
            state,
            started_at,
            records: self.records.clone(),
        }));

        if self.can_submit() {
            effects.extend(
                self.replay
                    .iter()
                    .map(|p| Effect::Send(submit_message(p))),
            );
        }
        effects
    }

    fn apply_appended(&mut self, record: LapRecord) -> Vec<Effect> {
        if self.session_id.as_ref() != Some(&record.session_id) {
            tracing::debug!(session_id = %record.session_id, "Dropping record from another epoch");
            return Vec::new();
        }
        self.replay.confirm(&record.client_record_id);
        match self
            .records
            .binary_search_by_key(&record.sequence_number, |r| r.sequence_number)
        {
            Ok(_) => Vec::new(),
            Err(pos) => {
                self.records.insert(pos, record.clone());
                vec![Effect::Notify(Notice::RecordAppended(record))]
            }
        }
    }

    fn apply_cleared(&mut self, session_id: SessionId) -> Vec<Effect> {
        if self.session_id.as_ref() != Some(&session_id) {
            return Vec::new();
        }
        self.records.clear();
        self.session_state = Some(SessionState::Cleared);

        let mut effects = vec![Effect::Notify(Notice::SessionCleared(session_id.clone()))];
        let dropped = self.replay.discard_session(&session_id);
        if !dropped.is_empty() {
            tracing::warn!(count = dropped.len(), %session_id, "Unconfirmed laps lost to reset");
            effects.push(Effect::Notify(Notice::ReplayDiscarded(dropped)));
        }
        effects
    }

    fn apply_started(
        &mut self,
        session_id: SessionId,
        started_at: Option<DateTime<Utc>>,
    ) -> Vec<Effect> {
        if self.session_id.as_ref() == Some(&session_id) {
            return Vec::new();
        }
        if self.session_state != Some(SessionState::Cleared) {
            // Epoch moved without us seeing the clear: resync from scratch
            tracing::info!(%session_id, "Unexpected epoch change, requesting snapshot");
            self.state = AgentState::Resyncing {
                attempt: self.attempt,
            };
            return vec![Effect::Send(ClientMessage::RequestSnapshot)];
        }

        self.session_id = Some(session_id.clone());
        self.session_state = Some(SessionState::Active);
        self.started_at = started_at;
        self.records.clear();

        let mut effects = vec![Effect::Notify(Notice::SessionStarted {
            session_id: session_id.clone(),
            started_at,
        })];
        let stale = self.replay.discard_stale(&session_id);
        if !stale.is_empty() {
            effects.push(Effect::Notify(Notice::ReplayDiscarded(stale)));
        }
        if self.can_submit() {
            effects.extend(
                self.replay
                    .iter()
                    .map(|p| Effect::Send(submit_message(p))),
            );
        }
        effects
    }

    fn apply_receipt(&mut self, client_record_id: String, status: ReceiptStatus) -> Vec<Effect> {
        match status {
            ReceiptStatus::Committed { .. } | ReceiptStatus::Duplicate { .. } => {
                self.replay.confirm(&client_record_id);
                Vec::new()
            }
            ReceiptStatus::Rejected { reason } => {
                if self.replay.confirm(&client_record_id).is_some() {
                    tracing::debug!(%client_record_id, ?reason, "Lap rejected by ledger");
                }
                Vec::new()
            }
            ReceiptStatus::Failed { message } => {
                tracing::warn!(%client_record_id, %message, "Lap not stored, keeping it pending");
                vec![Effect::Notify(Notice::SubmissionFailed {
                    client_record_id,
                    message,
                })]
            }
        }
    }
}

fn submit_message(pending: &PendingRecord) -> ClientMessage {
    ClientMessage::SubmitRecord {
        client_record_id: pending.client_record_id.clone(),
        elapsed_ms: pending.elapsed_ms,
        captured_at: pending.captured_at,
        session_id: pending.session_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lap(session: &str, seq: u64, id: &str) -> LapRecord {
        let now = Utc::now();
        LapRecord {
            sequence_number: seq,
            elapsed_ms: seq * 1000,
            captured_at: now,
            committed_at: now,
            client_record_id: id.to_string(),
            session_id: SessionId::from(session),
        }
    }

    fn snapshot(session: &str, records: Vec<LapRecord>) -> ServerMessage {
        ServerMessage::Snapshot {
            session_id: SessionId::from(session),
            state: SessionState::Active,
            started_at: None,
            records,
        }
    }

    fn sends(effects: &[Effect]) -> Vec<&ClientMessage> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    fn synced(session: &str) -> (SyncAgent, u64) {
        let mut agent = SyncAgent::new();
        let attempt = agent.begin_connect();
        agent.on_connected(attempt);
        agent.on_server_message(attempt, snapshot(session, vec![]));
        (agent, attempt)
    }

    #[test]
    fn test_first_snapshot_syncs_and_reports_connectivity() {
        let mut agent = SyncAgent::new();
        let attempt = agent.begin_connect();
        assert_eq!(agent.state(), AgentState::Connecting { attempt });
        agent.on_connected(attempt);

        let effects = agent.on_server_message(attempt, snapshot("s1", vec![lap("s1", 1, "a")]));
        assert!(agent.is_synced());
        assert_eq!(effects[0], Effect::Notify(Notice::ConnectivityChanged(true)));
        assert!(matches!(&effects[1], Effect::Notify(Notice::Snapshot { records, .. }) if records.len() == 1));
    }

    #[test]
    fn test_live_record_is_sent_and_kept_pending() {
        let (mut agent, _) = synced("s1");
        let effects = agent.record("x".to_string(), 1000, Utc::now());
        assert!(matches!(&effects[0], Effect::Notify(Notice::RecordPending(_))));
        assert_eq!(sends(&effects).len(), 1);
        assert_eq!(agent.pending().len(), 1);
    }

    #[test]
    fn test_broadcast_confirms_pending_and_orders_by_sequence() {
        let (mut agent, attempt) = synced("s1");
        agent.record("x".to_string(), 1000, Utc::now());

        agent.on_server_message(attempt, ServerMessage::RecordAppended { record: lap("s1", 2, "y") });
        agent.on_server_message(attempt, ServerMessage::RecordAppended { record: lap("s1", 1, "x") });
        // Redelivery is ignored
        let again =
            agent.on_server_message(attempt, ServerMessage::RecordAppended { record: lap("s1", 1, "x") });

        assert!(again.is_empty());
        assert!(agent.pending().is_empty());
        let seqs: Vec<u64> = agent.records().iter().map(|r| r.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn test_record_from_other_epoch_is_dropped() {
        let (mut agent, attempt) = synced("s1");
        let effects = agent.on_server_message(
            attempt,
            ServerMessage::RecordAppended {
                record: lap("s0", 1, "old"),
            },
        );
        assert!(effects.is_empty());
        assert!(agent.records().is_empty());
    }

    #[test]
    fn test_offline_records_replayed_on_same_epoch() {
        let (mut agent, attempt) = synced("s1");
        agent.on_transport_lost(attempt);
        assert_eq!(agent.state(), AgentState::Offline);

        let effects = agent.record("b1".to_string(), 5000, Utc::now());
        assert!(sends(&effects).is_empty());

        let attempt = agent.begin_connect();
        assert_eq!(agent.state(), AgentState::Resyncing { attempt });
        agent.on_connected(attempt);
        let effects = agent.on_server_message(attempt, snapshot("s1", vec![]));
        let sent = sends(&effects);
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], ClientMessage::SubmitRecord { client_record_id, .. } if client_record_id == "b1"));
    }

    #[test]
    fn test_offline_records_discarded_after_reset() {
        let (mut agent, attempt) = synced("s1");
        agent.on_transport_lost(attempt);
        agent.record("d1".to_string(), 5000, Utc::now());

        let attempt = agent.begin_connect();
        agent.on_connected(attempt);
        let effects = agent.on_server_message(attempt, snapshot("s2", vec![]));

        assert!(sends(&effects).is_empty());
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Notify(Notice::ReplayDiscarded(dropped)) if dropped.len() == 1
        )));
        assert!(agent.pending().is_empty());
        assert_eq!(agent.session_id(), Some(&SessionId::from("s2")));
    }

    #[test]
    fn test_already_committed_records_not_resent() {
        let (mut agent, attempt) = synced("s1");
        agent.record("c1".to_string(), 1000, Utc::now());
        agent.on_transport_lost(attempt);

        let attempt = agent.begin_connect();
        agent.on_connected(attempt);
        let effects = agent.on_server_message(attempt, snapshot("s1", vec![lap("s1", 1, "c1")]));
        assert!(sends(&effects).is_empty());
        assert!(agent.pending().is_empty());
    }

    #[test]
    fn test_superseded_attempt_is_ignored() {
        let mut agent = SyncAgent::new();
        let first = agent.begin_connect();
        let second = agent.begin_connect();
        assert!(agent
            .on_server_message(first, snapshot("s1", vec![]))
            .is_empty());
        assert!(agent.on_transport_lost(first).is_empty());
        assert_eq!(agent.state(), AgentState::Connecting { attempt: second });
    }

    #[test]
    fn test_live_reset_adopts_new_epoch() {
        let (mut agent, attempt) = synced("s1");
        agent.on_server_message(attempt, ServerMessage::RecordAppended { record: lap("s1", 1, "a") });

        let cleared = agent.on_server_message(
            attempt,
            ServerMessage::SessionCleared {
                session_id: SessionId::from("s1"),
            },
        );
        assert_eq!(cleared[0], Effect::Notify(Notice::SessionCleared(SessionId::from("s1"))));
        assert!(agent.records().is_empty());

        let started = agent.on_server_message(
            attempt,
            ServerMessage::SessionStarted {
                session_id: SessionId::from("s2"),
                started_at: None,
            },
        );
        assert_eq!(
            started[0],
            Effect::Notify(Notice::SessionStarted {
                session_id: SessionId::from("s2"),
                started_at: None,
            })
        );
        assert_eq!(agent.session_id(), Some(&SessionId::from("s2")));
    }

    #[test]
    fn test_snapshot_after_offline_reset_carries_new_start() {
        let (mut agent, attempt) = synced("s1");
        agent.on_transport_lost(attempt);

        let started_at = Utc::now() - chrono::Duration::seconds(90);
        let attempt = agent.begin_connect();
        agent.on_connected(attempt);
        let effects = agent.on_server_message(
            attempt,
            ServerMessage::Snapshot {
                session_id: SessionId::from("s2"),
                state: SessionState::Active,
                started_at: Some(started_at),
                records: vec![],
            },
        );

        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Notify(Notice::Snapshot { session_id, started_at: Some(at), .. })
                if session_id == &SessionId::from("s2") && *at == started_at
        )));
        assert_eq!(agent.started_at(), Some(started_at));
        let elapsed = agent.elapsed_ms(started_at + chrono::Duration::seconds(90));
        assert_eq!(elapsed, Some(90_000));
    }

    #[test]
    fn test_elapsed_never_negative() {
        let (mut agent, attempt) = synced("s1");
        let started_at = Utc::now();
        agent.on_server_message(
            attempt,
            ServerMessage::SessionCleared {
                session_id: SessionId::from("s1"),
            },
        );
        agent.on_server_message(
            attempt,
            ServerMessage::SessionStarted {
                session_id: SessionId::from("s2"),
                started_at: Some(started_at),
            },
        );
        assert_eq!(agent.elapsed_ms(started_at - chrono::Duration::seconds(1)), Some(0));
        assert_eq!(SyncAgent::new().elapsed_ms(started_at), None);
    }

    #[test]
    fn test_unexpected_epoch_triggers_resync() {
        let (mut agent, attempt) = synced("s1");
        let effects = agent.on_server_message(
            attempt,
            ServerMessage::SessionStarted {
                session_id: SessionId::from("s3"),
                started_at: None,
            },
        );
        assert_eq!(effects, vec![Effect::Send(ClientMessage::RequestSnapshot)]);
        assert_eq!(agent.state(), AgentState::Resyncing { attempt });
    }

    #[test]
    fn test_failed_receipt_keeps_pending() {
        let (mut agent, attempt) = synced("s1");
        agent.record("f".to_string(), 1000, Utc::now());
        let effects = agent.on_server_message(
            attempt,
            ServerMessage::Receipt {
                client_record_id: "f".to_string(),
                status: ReceiptStatus::Failed {
                    message: "disk".to_string(),
                },
            },
        );
        assert!(matches!(&effects[0], Effect::Notify(Notice::SubmissionFailed { .. })));
        assert_eq!(agent.pending().len(), 1);
    }

    #[test]
    fn test_gave_up_reports_once() {
        let (mut agent, attempt) = synced("s1");
        let lost = agent.on_transport_lost(attempt);
        assert_eq!(lost, vec![Effect::Notify(Notice::ConnectivityChanged(false))]);
        let gave_up = agent.on_gave_up();
        assert_eq!(gave_up, vec![Effect::Notify(Notice::GaveUp)]);
        assert_eq!(agent.state(), AgentState::Failed);
        assert!(agent.request_reset().is_none());
    }
}
