//! Wire messages exchanged between a client and its connection session
//!
//! JSON text frames, discriminated by a `type` field.

use crate::ledger::{AppendOutcome, RejectReason};
use crate::record::{LapRecord, LedgerEvent, LedgerView, SessionId, SessionState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Client -> server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    SubmitRecord {
        client_record_id: String,
        elapsed_ms: u64,
        captured_at: DateTime<Utc>,
        /// Epoch the record was captured in; the current one when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
    RequestSnapshot,
    RequestReset,
}

/// Server -> client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Snapshot {
        session_id: SessionId,
        state: SessionState,
        started_at: Option<DateTime<Utc>>,
        records: Vec<LapRecord>,
    },
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
    /// Sent only to the submitter; settles its pending entry
    Receipt {
        client_record_id: String,
        status: ReceiptStatus,
    },
    Error {
        message: String,
    },
}

/// How the ledger handled one submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReceiptStatus {
    Committed { sequence_number: u64 },
    Duplicate { sequence_number: u64 },
    Rejected { reason: RejectReason },
    /// Storage failure; the record stays pending on the client for retry
    Failed { message: String },
}

impl From<&AppendOutcome> for ReceiptStatus {
    fn from(outcome: &AppendOutcome) -> Self {
        match outcome {
            AppendOutcome::Committed(r) => ReceiptStatus::Committed {
                sequence_number: r.sequence_number,
            },
            AppendOutcome::Duplicate(r) => ReceiptStatus::Duplicate {
                sequence_number: r.sequence_number,
            },
            AppendOutcome::Rejected(reason) => ReceiptStatus::Rejected { reason: *reason },
        }
    }
}

impl From<&LedgerEvent> for ServerMessage {
    fn from(event: &LedgerEvent) -> Self {
        match event {
            LedgerEvent::RecordAppended { record } => ServerMessage::RecordAppended {
                record: record.clone(),
            },
            LedgerEvent::SessionCleared { session_id } => ServerMessage::SessionCleared {
                session_id: session_id.clone(),
            },
            LedgerEvent::SessionStarted {
                session_id,
                started_at,
            } => ServerMessage::SessionStarted {
                session_id: session_id.clone(),
                started_at: *started_at,
            },
        }
    }
}

impl From<&LedgerView> for ServerMessage {
    fn from(view: &LedgerView) -> Self {
        ServerMessage::Snapshot {
            session_id: view.session_id.clone(),
            state: view.state,
            started_at: view.started_at,
            records: view.records.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_without_session_deserializes() {
        let json = r#"{"type":"submit_record","client_record_id":"b1","elapsed_ms":5000,
                       "captured_at":"2024-05-01T10:00:00Z"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::SubmitRecord {
                client_record_id,
                elapsed_ms,
                session_id,
                ..
            } => {
                assert_eq!(client_record_id, "b1");
                assert_eq!(elapsed_ms, 5000);
                assert!(session_id.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unit_requests_deserialize() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"request_reset"}"#).unwrap();
        assert_eq!(msg, ClientMessage::RequestReset);
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"request_snapshot"}"#).unwrap();
        assert_eq!(msg, ClientMessage::RequestSnapshot);
    }

    #[test]
    fn test_receipt_serializes() {
        let msg = ServerMessage::Receipt {
            client_record_id: "a1".to_string(),
            status: ReceiptStatus::Rejected {
                reason: RejectReason::StaleEpoch,
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"receipt\""));
        assert!(json.contains("\"outcome\":\"rejected\""));
        assert!(json.contains("\"reason\":\"stale_epoch\""));
    }

    #[test]
    fn test_snapshot_from_view() {
        let view = LedgerView {
            session_id: SessionId::from("2-9"),
            state: SessionState::Clearing,
            started_at: None,
            records: vec![],
        };
        let json = serde_json::to_string(&ServerMessage::from(&view)).unwrap();
        assert!(json.contains("\"type\":\"snapshot\""));
        assert!(json.contains("\"state\":\"clearing\""));
    }
}
