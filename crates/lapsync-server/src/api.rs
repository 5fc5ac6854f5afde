//! REST API endpoints for lapsync
//!
//! All endpoints are under /api/v1/ and return JSON.

use crate::logs::{LogEntry, LOG_RESPONSE_LIMIT};
use crate::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use chrono::{DateTime, Utc};
use lapsync_core::format::{format_hms, format_hms_centis};
use lapsync_core::protocol::ReceiptStatus;
use lapsync_core::record::lap_time_ms;
use lapsync_core::{ControllerError, ResetKind, ResetOutcome, SessionId, SessionState};
use serde::{Deserialize, Serialize};

/// Application status response
#[derive(Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub session_id: SessionId,
    pub state: SessionState,
    pub started_at: Option<DateTime<Utc>>,
    pub record_count: usize,
    pub subscribers: usize,
}

/// One row of the lap board
#[derive(Serialize, Clone)]
pub struct LapResponse {
    pub sequence_number: u64,
    pub client_record_id: String,
    pub elapsed_ms: u64,
    /// Time since the previous lap
    pub lap_ms: u64,
    /// `HH:MM:SS.cc`
    pub elapsed: String,
    /// `HH:MM:SS`
    pub lap: String,
    pub captured_at: DateTime<Utc>,
    pub committed_at: DateTime<Utc>,
}

/// Current session and its laps
#[derive(Serialize)]
pub struct LapsResponse {
    pub session_id: SessionId,
    pub state: SessionState,
    pub started_at: Option<DateTime<Utc>>,
    pub laps: Vec<LapResponse>,
}

/// Lap submitted over HTTP
#[derive(Deserialize)]
pub struct SubmitRequest {
    pub elapsed_ms: u64,
    /// Generated when absent, which makes the request non-idempotent
    pub client_record_id: Option<String>,
    pub captured_at: Option<DateTime<Utc>>,
    pub session_id: Option<SessionId>,
}

#[derive(Serialize)]
pub struct ReceiptResponse {
    pub client_record_id: String,
    #[serde(flatten)]
    pub status: ReceiptStatus,
}

/// Reset response
#[derive(Serialize)]
pub struct ResetResponse {
    pub success: bool,
    pub message: String,
    pub previous_session: Option<SessionId>,
    pub session_id: SessionId,
    pub cleared_records: usize,
}

/// Remote URL response
#[derive(Serialize)]
pub struct RemoteUrlResponse {
    pub url: String,
}

fn controller_error(e: ControllerError) -> (StatusCode, String) {
    if e.is_storage_unavailable() {
        (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

/// GET /api/v1/status
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let status = state.controller.status();
    Json(StatusResponse {
        version: lapsync_core::VERSION.to_string(),
        session_id: status.session_id,
        state: status.state,
        started_at: status.started_at,
        record_count: status.record_count,
        subscribers: status.subscribers,
    })
}

/// GET /api/v1/laps
pub async fn get_laps(State(state): State<AppState>) -> Json<LapsResponse> {
    let view = state.controller.snapshot();
    let laps = view
        .records
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let lap_ms = lap_time_ms(&view.records, i).unwrap_or(r.elapsed_ms);
            LapResponse {
                sequence_number: r.sequence_number,
                client_record_id: r.client_record_id.clone(),
                elapsed_ms: r.elapsed_ms,
                lap_ms,
                elapsed: format_hms_centis(r.elapsed_ms),
                lap: format_hms(lap_ms),
                captured_at: r.captured_at,
                committed_at: r.committed_at,
            }
        })
        .collect();

    Json(LapsResponse {
        session_id: view.session_id.clone(),
        state: view.state,
        started_at: view.started_at,
        laps,
    })
}

/// POST /api/v1/laps
///
/// Storage failures answer 503 so the caller knows to retry with the same id.
pub async fn submit_lap(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<ReceiptResponse>, (StatusCode, String)> {
    let client_record_id = req
        .client_record_id
        .unwrap_or_else(lapsync_core::sync::new_client_record_id);
    let outcome = state
        .controller
        .submit(
            req.elapsed_ms,
            client_record_id.clone(),
            req.session_id,
            req.captured_at,
        )
        .await
        .map_err(controller_error)?;

    Ok(Json(ReceiptResponse {
        client_record_id,
        status: ReceiptStatus::from(&outcome),
    }))
}

/// POST /api/v1/reset
///
/// Clears the current session and starts a new epoch.
pub async fn reset_session(
    State(state): State<AppState>,
) -> Result<Json<ResetResponse>, (StatusCode, String)> {
    let outcome = state
        .controller
        .reset(ResetKind::Explicit)
        .await
        .map_err(controller_error)?;

    let response = match outcome {
        ResetOutcome::Completed {
            previous,
            current,
            cleared_records,
        } => ResetResponse {
            success: true,
            message: format!("Session reset, {} laps cleared", cleared_records),
            previous_session: Some(previous),
            session_id: current,
            cleared_records,
        },
        ResetOutcome::Ignored => ResetResponse {
            success: false,
            message: "Reset ignored".to_string(),
            previous_session: None,
            session_id: state.controller.snapshot().session_id.clone(),
            cleared_records: 0,
        },
    };
    Ok(Json(response))
}

/// GET /api/v1/remote-url
///
/// Returns the URL other devices on the network use to reach this server.
pub async fn get_remote_url(State(state): State<AppState>) -> Json<RemoteUrlResponse> {
    let ip = local_ip_address::local_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| "localhost".to_string());
    Json(RemoteUrlResponse {
        url: format!("ws://{}:{}/api/v1/ws", ip, state.config.port),
    })
}

/// GET /api/v1/logs
pub async fn get_logs(State(state): State<AppState>) -> Json<Vec<LogEntry>> {
    Json(state.logs.recent(LOG_RESPONSE_LIMIT))
}
