//! Callbacks through which the sync client reports to its UI

use chrono::{DateTime, Utc};
use lapsync_core::record::{LapRecord, SessionId, SessionState};
use lapsync_core::sync::{Notice, PendingRecord};
use tokio::sync::mpsc;

/// Receives everything the local lap board needs to render
///
/// Every method has a no-op default; implement the ones you care about.
/// Callbacks run on the client task, so they should return quickly.
#[allow(unused_variables)]
pub trait SyncObserver: Send + 'static {
    /// Local view replaced by a full snapshot
    ///
    /// `started_at` is when the session began on the server; lap times
    /// count from there.
    fn on_snapshot(
        &mut self,
        session_id: &SessionId,
        state: SessionState,
        started_at: Option<DateTime<Utc>>,
        records: &[LapRecord],
    ) {
    }

    fn on_record_appended(&mut self, record: &LapRecord) {}

    fn on_session_cleared(&mut self, session_id: &SessionId) {}

    fn on_session_started(&mut self, session_id: &SessionId, started_at: Option<DateTime<Utc>>) {}

    fn on_connectivity_changed(&mut self, connected: bool) {}

    /// Lap captured locally, not yet confirmed by the server
    fn on_record_pending(&mut self, record: &PendingRecord) {}

    /// Offline laps dropped because the session was reset meanwhile
    fn on_replay_discarded(&mut self, records: &[PendingRecord]) {}

    fn on_submission_failed(&mut self, client_record_id: &str, message: &str) {}

    fn on_server_error(&mut self, message: &str) {}

    /// Reconnection gave up; call `reconnect()` to try again
    fn on_gave_up(&mut self) {}

    /// Route a notice to the matching callback
    fn on_notice(&mut self, notice: &Notice) {
        match notice {
            Notice::Snapshot {
                session_id,
                state,
                started_at,
                records,
            } => self.on_snapshot(session_id, *state, *started_at, records),
            Notice::RecordAppended(record) => self.on_record_appended(record),
            Notice::SessionCleared(session_id) => self.on_session_cleared(session_id),
            Notice::SessionStarted {
                session_id,
                started_at,
            } => self.on_session_started(session_id, *started_at),
            Notice::ConnectivityChanged(connected) => self.on_connectivity_changed(*connected),
            Notice::RecordPending(record) => self.on_record_pending(record),
            Notice::ReplayDiscarded(records) => self.on_replay_discarded(records),
            Notice::SubmissionFailed {
                client_record_id,
                message,
            } => self.on_submission_failed(client_record_id, message),
            Notice::ServerError(message) => self.on_server_error(message),
            Notice::GaveUp => self.on_gave_up(),
        }
    }
}

/// Observer that ignores everything
impl SyncObserver for () {}

/// Forwards every notice into a channel
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<Notice>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SyncObserver for ChannelObserver {
    fn on_notice(&mut self, notice: &Notice) {
        let _ = self.tx.send(notice.clone());
    }
}
