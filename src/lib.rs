//! Lapsync - shared lap timing board
//!
//! This library re-exports the ledger, sync agent and wire protocol from
//! `lapsync-core` along with the application's configuration and logging
//! setup. The web server lives in `lapsync-server`, the sync client in
//! `lapsync-client`.

pub mod config;
pub mod logging;

pub use lapsync_core::{controller, format, hub, ledger, protocol, record, store, sync};

pub use lapsync_core::{
    ControllerHandle, EngineConfig, LapRecord, LapStore, MemoryStore, SessionId, SessionState,
    SqliteStore, SyncAgent, DEFAULT_BROADCAST_CAPACITY, VERSION,
};
