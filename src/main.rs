//! Lapsync - shared lap timing board
//!
//! Entry point: runs the ledger server, or a console client that records
//! laps against one.

use anyhow::Result;
use chrono::{DateTime, Utc};
use lapsync::config::AppConfig;
use lapsync::format::format_hms_centis;
use lapsync::sync::PendingRecord;
use lapsync::{ControllerHandle, LapRecord, LapStore, MemoryStore, SessionId, SqliteStore};
use lapsync_client::{ClientConfig, ClientStatus, SyncClient, SyncObserver};
use lapsync_server::logs::LogBuffer;
use lapsync_server::AppState;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = AppConfig::load();

    let mut client_url: Option<String> = None;
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--version" | "-v" => {
                println!("lapsync {}", lapsync::VERSION);
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--config" => {
                println!("{}", AppConfig::path().display());
                println!("{}", serde_json::to_string_pretty(&config)?);
                return Ok(());
            }
            "serve" => {}
            "client" => {
                let Some(url) = args.get(i + 1) else {
                    eprintln!("Error: client requires a server URL");
                    return Ok(());
                };
                client_url = Some(url.clone());
                i += 2;
                continue;
            }
            "--port" | "-p" => {
                let Some(port) = args.get(i + 1).and_then(|p| p.parse().ok()) else {
                    eprintln!("Error: --port requires a port number");
                    return Ok(());
                };
                config.port = port;
                i += 2;
                continue;
            }
            "--bind" | "-b" => {
                let Some(addr) = args.get(i + 1) else {
                    eprintln!("Error: --bind requires an address");
                    return Ok(());
                };
                config.bind_addr = addr.clone();
                i += 2;
                continue;
            }
            "--db" => {
                let Some(path) = args.get(i + 1) else {
                    eprintln!("Error: --db requires a file path");
                    return Ok(());
                };
                config.database = Some(PathBuf::from(path));
                i += 2;
                continue;
            }
            "--memory" => config.database = None,
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                return Ok(());
            }
        }
        i += 1;
    }

    let logs = LogBuffer::default();
    let _guard = lapsync::logging::init(&logs, config.log_dir.as_deref());
    info!("Starting Lapsync v{}", lapsync::VERSION);

    match client_url {
        Some(url) => run_client(url).await,
        None => run_server(config, logs).await,
    }
}

fn print_help() {
    println!("Usage: lapsync [serve] [OPTIONS]");
    println!("       lapsync client URL");
    println!();
    println!("Options:");
    println!("  -p, --port PORT     Listen port (default: 8920, env PORT)");
    println!("  -b, --bind ADDR     Bind address (default: 0.0.0.0)");
    println!("      --db PATH       SQLite database file (env LAPSYNC_DB)");
    println!("      --memory        Keep laps in memory only");
    println!("      --config        Show config file path and effective config");
    println!("  -v, --version       Show version");
    println!("  -h, --help          Show this help");
    println!();
    println!("Examples:");
    println!("  lapsync --db laps.db");
    println!("  lapsync client ws://192.168.1.20:8920/api/v1/ws");
}

async fn run_server(config: AppConfig, logs: LogBuffer) -> Result<()> {
    let store: Box<dyn LapStore> = match &config.database {
        Some(path) => {
            info!(path = %path.display(), "Opening lap database");
            Box::new(SqliteStore::open(path)?)
        }
        None => {
            warn!("No database configured, laps are kept in memory only");
            Box::new(MemoryStore::new())
        }
    };

    let controller = ControllerHandle::spawn(store, config.engine_config())?;
    let status = controller.status();
    info!(
        session_id = %status.session_id,
        records = status.record_count,
        "Ledger ready"
    );

    let state = AppState::new(controller, config.server_config(), logs);
    lapsync_server::start_server(state).await
}

/// Lap clock counting from the start of the session on the server
///
/// Starts at launch and is re-based whenever the client learns the real
/// start, so joining a running session or coming back after a reset still
/// yields times relative to that session.
#[derive(Debug, Clone, Copy)]
struct Stopwatch {
    origin: DateTime<Utc>,
}

impl Stopwatch {
    fn new(now: DateTime<Utc>) -> Self {
        Self { origin: now }
    }

    fn rebase(&mut self, started_at: Option<DateTime<Utc>>) {
        if let Some(started_at) = started_at {
            self.origin = started_at;
        }
    }

    fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        (now - self.origin).num_milliseconds().max(0) as u64
    }
}

/// Prints board changes and keeps the stopwatch on the current session
struct ConsoleObserver {
    stopwatch: Arc<Mutex<Stopwatch>>,
}

impl ConsoleObserver {
    fn rebase(&self, started_at: Option<DateTime<Utc>>) {
        if let Ok(mut stopwatch) = self.stopwatch.lock() {
            stopwatch.rebase(started_at);
        }
    }
}

impl SyncObserver for ConsoleObserver {
    fn on_snapshot(
        &mut self,
        session_id: &SessionId,
        _state: lapsync::SessionState,
        started_at: Option<DateTime<Utc>>,
        records: &[LapRecord],
    ) {
        self.rebase(started_at);
        println!("Session {} ({} laps)", session_id, records.len());
        for record in records {
            print_lap(record);
        }
    }

    fn on_record_appended(&mut self, record: &LapRecord) {
        print_lap(record);
    }

    fn on_session_cleared(&mut self, session_id: &SessionId) {
        println!("Session {} cleared", session_id);
    }

    fn on_session_started(&mut self, session_id: &SessionId, started_at: Option<DateTime<Utc>>) {
        self.rebase(started_at.or_else(|| Some(Utc::now())));
        println!("Session {} started", session_id);
    }

    fn on_connectivity_changed(&mut self, connected: bool) {
        println!("{}", if connected { "Connected" } else { "Offline, laps will be queued" });
    }

    fn on_replay_discarded(&mut self, records: &[PendingRecord]) {
        println!(
            "Warning: {} offline lap(s) dropped, the session was reset meanwhile",
            records.len()
        );
    }

    fn on_submission_failed(&mut self, client_record_id: &str, message: &str) {
        println!("Lap {} not stored yet ({}), will retry", client_record_id, message);
    }

    fn on_gave_up(&mut self) {
        println!("Server unreachable. Type 'c' to reconnect.");
    }
}

fn print_lap(record: &LapRecord) {
    println!(
        "  #{:<4} {}",
        record.sequence_number,
        format_hms_centis(record.elapsed_ms)
    );
}

fn print_status(status: &ClientStatus) {
    println!("State: {:?}", status.state);
    if let Some(session_id) = &status.session_id {
        println!("Session: {}", session_id);
    }
    for record in &status.records {
        print_lap(record);
    }
    if status.pending > 0 {
        println!("Pending: {}", status.pending);
    }
}

async fn run_client(url: String) -> Result<()> {
    let stopwatch = Arc::new(Mutex::new(Stopwatch::new(Utc::now())));
    let observer = ConsoleObserver {
        stopwatch: Arc::clone(&stopwatch),
    };
    let client = SyncClient::spawn(ClientConfig::new(url), observer);

    println!("Enter = lap, r = reset, s = status, c = reconnect, q = quit");
    println!("────────────────────────────────────────");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => {
                let elapsed_ms = stopwatch
                    .lock()
                    .map(|stopwatch| stopwatch.elapsed_ms(Utc::now()))
                    .unwrap_or(0);
                client.submit_record(elapsed_ms)?;
            }
            "r" | "reset" => {
                if let Err(e) = client.request_reset().await {
                    println!("Reset not sent: {}", e);
                }
            }
            "s" | "status" => print_status(&client.status()),
            "c" | "reconnect" => client.reconnect()?,
            "q" | "quit" => break,
            other => println!("Unknown command: {}", other),
        }
    }

    println!("Stopping...");
    client.shutdown().await;
    println!("Done.");
    Ok(())
}
