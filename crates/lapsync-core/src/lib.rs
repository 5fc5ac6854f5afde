//! Lapsync Core - lap ledger, session epochs and client synchronization
//!
//! One authoritative ledger of timed laps is shared by every connected
//! client. The [`SessionController`] owns the current epoch and runs resets
//! in two phases, the [`BroadcastHub`] fans committed changes out to
//! subscribers, and the [`SyncAgent`] keeps a client's local view converged
//! across disconnects.

pub mod controller;
pub mod format;
pub mod hub;
pub mod ledger;
pub mod protocol;
pub mod record;
pub mod store;
pub mod sync;

pub use controller::{
    ControllerError, ControllerHandle, ControllerStatus, EngineConfig, ResetKind, ResetOutcome,
    SessionController,
};
pub use hub::{BroadcastHub, Delivery, Subscription};
pub use ledger::{AppendOutcome, Ledger, LedgerError, RejectReason};
pub use protocol::{ClientMessage, ReceiptStatus, ServerMessage};
pub use record::{LapCandidate, LapRecord, LedgerEvent, LedgerView, SessionId, SessionState};
pub use store::{FaultSwitch, LapStore, MemoryStore, SqliteStore, StoreError};
pub use sync::{AgentState, Effect, Notice, PendingRecord, SyncAgent};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Events a broadcast subscriber may fall behind before it has to resync
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;
