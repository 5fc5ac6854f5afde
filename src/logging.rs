//! Tracing setup shared by the server and client modes

use lapsync_server::logs::LogBuffer;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_DIRECTIVES: &str = "lapsync=info,lapsync_core=info,lapsync_server=info,lapsync_client=info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Install the global subscriber: console, the in-memory buffer behind
/// `/api/v1/logs`, and a daily file under `log_dir` if given
///
/// Keep the returned guard alive for the life of the process so buffered
/// file output is flushed.
pub fn init(logs: &LogBuffer, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "lapsync.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(env_filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter()))
        .with(logs.layer().with_filter(env_filter()))
        .with(file_layer)
        .init();

    guard
}
