//! Session controller: owns the current epoch and the two-phase reset
//!
//! The controller and its ledger live on one dedicated thread, which is the
//! single writer for every append and clear. Other tasks talk to it through
//! a [`ControllerHandle`] (commands over mpsc, replies over oneshot).
//!
//! Reads never enter that queue: after each mutation the controller publishes
//! a fresh immutable [`LedgerView`] on a watch channel, so snapshots are
//! wait-free and a slow reader can't hold up the writer.
//!
//! Reset runs `Active -> Clearing -> Cleared -> Active(new epoch)`:
//! - `Clearing` seals the ledger so every in-flight append for the old epoch
//!   is rejected, but keeps its data visible.
//! - The old rows are deleted in one store transaction, then
//!   `SessionCleared` is broadcast and only after that a new epoch is minted
//!   and `SessionStarted` broadcast.
//! - A failing clear leaves the controller in `Clearing`; the next reset
//!   request resumes from there instead of minting over partial data.

use crate::hub::{BroadcastHub, Subscription};
use crate::ledger::{AppendOutcome, Ledger, LedgerError, RejectReason};
use crate::record::{
    LapCandidate, LapRecord, LedgerEvent, LedgerView, SessionId, SessionMeta, SessionState,
};
use crate::store::LapStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

/// Errors surfaced to callers of the controller
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("session controller thread stopped")]
    Stopped,

    #[error("failed to start session controller thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl ControllerError {
    /// Storage could not be reached; the caller may retry
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(self, ControllerError::Ledger(LedgerError::StorageUnavailable(_)))
    }
}

/// Origin of a reset request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// Deliberate operator action; runs the two-phase reset
    Explicit,
    /// Automatic signal (e.g. a client initializing); never resets
    Ambient,
}

/// Result of a reset request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetOutcome {
    Completed {
        previous: SessionId,
        current: SessionId,
        cleared_records: usize,
    },
    Ignored,
}

/// Controller tuning
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Clear attempts per reset request before reporting storage unavailable
    pub clear_retry_attempts: u32,
    /// Pause between clear attempts
    pub clear_retry_backoff: Duration,
    /// Events a subscriber may fall behind before it must resync
    pub broadcast_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            clear_retry_attempts: 3,
            clear_retry_backoff: Duration::from_millis(200),
            broadcast_capacity: crate::DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

/// Current epoch identity and state
#[derive(Debug, Clone)]
pub struct Session {
    pub meta: SessionMeta,
    pub state: SessionState,
}

/// Owner of the session and ledger; driven by the controller thread
pub struct SessionController {
    session: Session,
    ledger: Ledger,
    hub: BroadcastHub,
    view_tx: watch::Sender<Arc<LedgerView>>,
    config: EngineConfig,
}

impl SessionController {
    /// Resume the last stored session or mint the first one
    pub fn open(
        mut store: Box<dyn LapStore>,
        hub: BroadcastHub,
        config: EngineConfig,
    ) -> Result<Self, LedgerError> {
        let (session, ledger) = match store.load()? {
            Some(stored) if !stored.cleared => {
                tracing::info!(
                    session_id = %stored.meta.session_id,
                    records = stored.records.len(),
                    "Resuming stored session"
                );
                let ledger =
                    Ledger::restore(store, stored.meta.session_id.clone(), stored.records);
                (stored.meta, ledger)
            }
            Some(stored) => {
                let meta = SessionMeta::mint(stored.meta.epoch + 1);
                tracing::info!(session_id = %meta.session_id, "Previous session was cleared, starting new epoch");
                let ledger = Ledger::start(store, &meta)?;
                (meta, ledger)
            }
            None => {
                let meta = SessionMeta::mint(1);
                tracing::info!(session_id = %meta.session_id, "Starting first session");
                let ledger = Ledger::start(store, &meta)?;
                (meta, ledger)
            }
        };

        let session = Session {
            meta: session,
            state: SessionState::Active,
        };
        let (view_tx, _) = watch::channel(Arc::new(build_view(&session, &ledger)));
        Ok(Self {
            session,
            ledger,
            hub,
            view_tx,
            config,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    /// Receiver of the latest published view
    pub fn views(&self) -> watch::Receiver<Arc<LedgerView>> {
        self.view_tx.subscribe()
    }

    pub fn snapshot(&self, session_id: &SessionId) -> Vec<LapRecord> {
        self.ledger.snapshot(session_id)
    }

    /// Append a candidate; committed records are broadcast to every subscriber
    pub fn append(&mut self, candidate: LapCandidate) -> Result<AppendOutcome, LedgerError> {
        if self.session.state != SessionState::Active {
            let reason = if candidate.session_id == self.session.meta.session_id {
                RejectReason::SessionClosed
            } else {
                RejectReason::StaleEpoch
            };
            return Ok(AppendOutcome::Rejected(reason));
        }

        let outcome = self.ledger.append(candidate, Utc::now())?;
        if let AppendOutcome::Committed(record) = &outcome {
            tracing::debug!(
                session_id = %record.session_id,
                sequence_number = record.sequence_number,
                elapsed_ms = record.elapsed_ms,
                "Lap committed"
            );
            self.publish_view();
            self.hub.publish(LedgerEvent::RecordAppended {
                record: record.clone(),
            });
        }
        Ok(outcome)
    }

    /// Run (or resume) the two-phase reset
    pub fn reset(&mut self, kind: ResetKind) -> Result<ResetOutcome, LedgerError> {
        if kind == ResetKind::Ambient {
            tracing::debug!("Ignoring ambient reset signal");
            return Ok(ResetOutcome::Ignored);
        }

        let previous = self.session.meta.session_id.clone();
        let cleared_records = self.ledger.records().len();

        if self.session.state == SessionState::Active {
            self.ledger.seal();
            self.session.state = SessionState::Clearing;
            self.publish_view();
            tracing::info!(session_id = %previous, records = cleared_records, "Session clearing");
        }

        if self.session.state == SessionState::Clearing {
            self.clear_with_retry(&previous)?;
            self.session.state = SessionState::Cleared;
            self.publish_view();
            self.hub.publish(LedgerEvent::SessionCleared {
                session_id: previous.clone(),
            });
        }

        // Cleared -> Active
        let meta = SessionMeta::mint(self.session.meta.epoch + 1);
        self.retry("Starting new session", &meta.session_id, |ledger| ledger.begin(&meta))?;
        self.session = Session {
            meta,
            state: SessionState::Active,
        };
        self.publish_view();
        self.hub.publish(LedgerEvent::SessionStarted {
            session_id: self.session.meta.session_id.clone(),
            started_at: self.session.meta.started_at,
        });
        tracing::info!(
            previous = %previous,
            session_id = %self.session.meta.session_id,
            "Session reset complete"
        );

        Ok(ResetOutcome::Completed {
            previous,
            current: self.session.meta.session_id.clone(),
            cleared_records,
        })
    }

    fn clear_with_retry(&mut self, session_id: &SessionId) -> Result<(), LedgerError> {
        self.retry("Clearing session", session_id, |ledger| ledger.clear(session_id))
    }

    /// Run a store-backed step up to `clear_retry_attempts` times
    ///
    /// On final failure the session state is left as is, so the next reset
    /// request picks up from the same step.
    fn retry<F>(&mut self, step: &str, session_id: &SessionId, mut op: F) -> Result<(), LedgerError>
    where
        F: FnMut(&mut Ledger) -> Result<(), LedgerError>,
    {
        let attempts = self.config.clear_retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(&mut self.ledger) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    tracing::warn!(%session_id, attempt, error = %e, "{} failed, retrying", step);
                    std::thread::sleep(self.config.clear_retry_backoff);
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(%session_id, attempt, state = ?self.session.state, error = %e, "{} failed", step);
                    return Err(e);
                }
            }
        }
    }

    fn publish_view(&self) {
        self.view_tx
            .send_replace(Arc::new(build_view(&self.session, &self.ledger)));
    }
}

fn build_view(session: &Session, ledger: &Ledger) -> LedgerView {
    let records = match session.state {
        SessionState::Cleared => Vec::new(),
        _ => ledger.snapshot(&session.meta.session_id),
    };
    LedgerView {
        session_id: session.meta.session_id.clone(),
        state: session.state,
        started_at: session.meta.started_at,
        records,
    }
}

/// Commands sent to the controller thread
enum ControllerCommand {
    Append {
        candidate: LapCandidate,
        reply: oneshot::Sender<Result<AppendOutcome, LedgerError>>,
    },
    Reset {
        kind: ResetKind,
        reply: oneshot::Sender<Result<ResetOutcome, LedgerError>>,
    },
}

/// Handle to communicate with the controller thread
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ControllerCommand>,
    views: watch::Receiver<Arc<LedgerView>>,
    hub: BroadcastHub,
}

impl ControllerHandle {
    /// Open the controller over `store` and run it on a dedicated thread
    pub fn spawn(store: Box<dyn LapStore>, config: EngineConfig) -> Result<Self, ControllerError> {
        let hub = BroadcastHub::new(config.broadcast_capacity);
        let mut controller = SessionController::open(store, hub.clone(), config)?;
        let views = controller.views();
        let (tx, mut rx) = mpsc::channel::<ControllerCommand>(64);

        std::thread::Builder::new()
            .name("lapsync-controller".to_string())
            .spawn(move || {
                while let Some(cmd) = rx.blocking_recv() {
                    match cmd {
                        ControllerCommand::Append { candidate, reply } => {
                            let _ = reply.send(controller.append(candidate));
                        }
                        ControllerCommand::Reset { kind, reply } => {
                            let _ = reply.send(controller.reset(kind));
                        }
                    }
                }
                tracing::debug!("Session controller thread exiting");
            })
            .map_err(ControllerError::Spawn)?;

        Ok(Self { tx, views, hub })
    }

    pub async fn append(&self, candidate: LapCandidate) -> Result<AppendOutcome, ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ControllerCommand::Append { candidate, reply })
            .await
            .map_err(|_| ControllerError::Stopped)?;
        Ok(rx.await.map_err(|_| ControllerError::Stopped)??)
    }

    /// Record a lap captured now, tagged with `session_id` or the current epoch
    pub async fn submit(
        &self,
        elapsed_ms: u64,
        client_record_id: String,
        session_id: Option<SessionId>,
        captured_at: Option<DateTime<Utc>>,
    ) -> Result<AppendOutcome, ControllerError> {
        let session_id = session_id.unwrap_or_else(|| self.snapshot().session_id.clone());
        self.append(LapCandidate {
            elapsed_ms,
            captured_at: captured_at.unwrap_or_else(Utc::now),
            client_record_id,
            session_id,
        })
        .await
    }

    pub async fn reset(&self, kind: ResetKind) -> Result<ResetOutcome, ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ControllerCommand::Reset { kind, reply })
            .await
            .map_err(|_| ControllerError::Stopped)?;
        Ok(rx.await.map_err(|_| ControllerError::Stopped)??)
    }

    /// Latest published view (wait-free)
    pub fn snapshot(&self) -> Arc<LedgerView> {
        self.views.borrow().clone()
    }

    /// Records of `session_id`; empty unless it is the current epoch
    pub fn snapshot_for(&self, session_id: &SessionId) -> Vec<LapRecord> {
        self.snapshot().records_for(session_id).to_vec()
    }

    /// Current epoch and its state
    pub fn current_session(&self) -> (SessionId, SessionState) {
        let view = self.snapshot();
        (view.session_id.clone(), view.state)
    }

    /// Watch receiver that fires on every published view
    pub fn views(&self) -> watch::Receiver<Arc<LedgerView>> {
        self.views.clone()
    }

    pub fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }

    pub fn status(&self) -> ControllerStatus {
        let view = self.snapshot();
        ControllerStatus {
            session_id: view.session_id.clone(),
            state: view.state,
            started_at: view.started_at,
            record_count: view.len(),
            subscribers: self.subscriber_count(),
        }
    }
}

/// Point-in-time summary for status endpoints
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ControllerStatus {
    pub session_id: SessionId,
    pub state: SessionState,
    pub started_at: Option<DateTime<Utc>>,
    pub record_count: usize,
    pub subscribers: usize,
}
