//! Lapsync Client - keeps a local lap board in sync with a lapsync server
//!
//! [`SyncClient::spawn`] starts a background task that owns the WebSocket,
//! drives a [`SyncAgent`](lapsync_core::SyncAgent) and reports to a
//! [`SyncObserver`]. Laps recorded while offline are buffered and replayed
//! after the next successful resync.

pub mod backoff;
mod driver;
pub mod observer;

pub use observer::{ChannelObserver, SyncObserver};

use chrono::{DateTime, Utc};
use lapsync_core::record::{LapRecord, SessionId, SessionState};
use lapsync_core::sync::{new_client_record_id, AgentState};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

/// Client errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ClientError {
    #[error("sync client stopped")]
    Stopped,

    #[error("not connected to the server")]
    NotConnected,

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Connection settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://host:8920/api/v1/ws`
    pub url: String,
    /// Bound on establishing the WebSocket
    pub connect_timeout: Duration,
    /// Bound on receiving a snapshot once connected
    pub resync_timeout: Duration,
    /// Consecutive failed attempts before giving up
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8920/api/v1/ws".to_string(),
            connect_timeout: Duration::from_secs(5),
            resync_timeout: Duration::from_secs(5),
            max_attempts: 5,
            initial_backoff: backoff::INITIAL_BACKOFF,
            max_backoff: backoff::MAX_BACKOFF,
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Client state as last published by the background task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStatus {
    pub state: AgentState,
    pub session_id: Option<SessionId>,
    pub session_state: Option<SessionState>,
    /// Server-side start of the session; lap times count from here
    pub started_at: Option<DateTime<Utc>>,
    /// Confirmed laps in sequence order
    pub records: Vec<LapRecord>,
    /// Laps awaiting confirmation
    pub pending: usize,
}

impl Default for ClientStatus {
    fn default() -> Self {
        Self {
            state: AgentState::Offline,
            session_id: None,
            session_state: None,
            started_at: None,
            records: Vec::new(),
            pending: 0,
        }
    }
}

impl ClientStatus {
    pub fn is_synced(&self) -> bool {
        self.state == AgentState::Synced
    }

    /// Milliseconds since the session started, as of `now`
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> Option<u64> {
        self.started_at
            .map(|started| (now - started).num_milliseconds().max(0) as u64)
    }
}

/// Commands sent to the client task
pub(crate) enum Command {
    Record {
        client_record_id: String,
        elapsed_ms: u64,
        captured_at: DateTime<Utc>,
    },
    RequestReset {
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    RequestSnapshot {
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Reconnect,
    Shutdown,
}

/// Entry point
pub struct SyncClient;

impl SyncClient {
    /// Start the client task on the current Tokio runtime
    pub fn spawn(config: ClientConfig, observer: impl SyncObserver) -> ClientHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ClientStatus::default());
        let driver = driver::Driver::new(config, Box::new(observer), rx, status_tx);
        tokio::spawn(driver.run());
        ClientHandle { tx, status }
    }
}

/// Handle to communicate with the client task
#[derive(Clone)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ClientStatus>,
}

impl ClientHandle {
    /// Record a lap captured now; returns its client record id
    pub fn submit_record(&self, elapsed_ms: u64) -> Result<String, ClientError> {
        let client_record_id = new_client_record_id();
        self.submit_record_with_id(client_record_id.clone(), elapsed_ms, Utc::now())?;
        Ok(client_record_id)
    }

    pub fn submit_record_with_id(
        &self,
        client_record_id: String,
        elapsed_ms: u64,
        captured_at: DateTime<Utc>,
    ) -> Result<(), ClientError> {
        self.tx
            .send(Command::Record {
                client_record_id,
                elapsed_ms,
                captured_at,
            })
            .map_err(|_| ClientError::Stopped)
    }

    /// Ask the server to reset the session; fails while offline
    pub async fn request_reset(&self) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::RequestReset { reply })
            .map_err(|_| ClientError::Stopped)?;
        rx.await.map_err(|_| ClientError::Stopped)?
    }

    pub async fn request_snapshot(&self) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::RequestSnapshot { reply })
            .map_err(|_| ClientError::Stopped)?;
        rx.await.map_err(|_| ClientError::Stopped)?
    }

    /// Drop the current connection attempt and start over with a fresh budget
    pub fn reconnect(&self) -> Result<(), ClientError> {
        self.tx
            .send(Command::Reconnect)
            .map_err(|_| ClientError::Stopped)
    }

    /// Stop the client task and wait for it to finish
    pub async fn shutdown(self) {
        let _ = self.tx.send(Command::Shutdown);
        let mut status = self.status;
        while status.changed().await.is_ok() {}
    }

    pub fn status(&self) -> ClientStatus {
        self.status.borrow().clone()
    }

    /// Receiver that fires whenever the status changes
    pub fn watch_status(&self) -> watch::Receiver<ClientStatus> {
        self.status.clone()
    }

    /// Wait until `predicate` holds for the published status
    pub async fn wait_until<F>(&self, timeout: Duration, predicate: F) -> Result<ClientStatus, ClientError>
    where
        F: FnMut(&ClientStatus) -> bool,
    {
        let mut status = self.status.clone();
        let result = match tokio::time::timeout(timeout, status.wait_for(predicate)).await {
            Ok(Ok(current)) => Ok(current.clone()),
            Ok(Err(_)) => Err(ClientError::Stopped),
            Err(_) => Err(ClientError::Timeout(timeout)),
        };
        result
    }
}
