//! Web server implementation

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use triage_common::error::Error as TriageError;
use triage_common::report::report_counts;
use triage_common::{AnalysisRun, ReportCounts};
use triage_engine::{AnalysisArtifacts, AnalysisEngine};

use crate::extract::{extract_bundle, ArtifactBundle, ExtractError};
use crate::session::{SessionLookup, TraceSession, TraceSessionStore};

/// Web service configuration
#[derive(Debug, Clone)]
pub struct WebConfig {
    pub listen_addr: String,
    /// Trace sessions live this long after upload
    pub session_ttl_secs: u64,
    /// Expiry sweep cadence
    pub sweep_interval_secs: u64,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8090".to_string(),
            session_ttl_secs: 1800,
            sweep_interval_secs: 60,
        }
    }
}

impl WebConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            listen_addr: std::env::var("TRIAGE_WEB_ADDR").unwrap_or(defaults.listen_addr),
            session_ttl_secs: env_u64("TRIAGE_SESSION_TTL_SECS", defaults.session_ttl_secs),
            sweep_interval_secs: env_u64(
                "TRIAGE_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval_secs,
            ),
        }
    }

    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listen_addr.parse()?)
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Shared handler state; the engine and session store are injected, never
/// ambient
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AnalysisEngine>,
    pub sessions: Arc<TraceSessionStore>,
}

/// Build the service router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/analysis", post(analyze_handler))
        .route("/api/traces/:id", get(get_trace_handler))
        .route("/api/traces/:id/exists", get(trace_exists_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

/// One explanatory error for the whole request; there is no partial-success
/// state visible to the caller
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<TriageError> for ApiError {
    fn from(e: TriageError) -> Self {
        let status = match &e {
            TriageError::ReportParse(_) | TriageError::Trace(_) | TriageError::MissingArtifact(_) => {
                StatusCode::BAD_REQUEST
            }
            TriageError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Analysis failed: {}", e);
        } else {
            warn!("Analysis rejected: {}", e);
        }
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<ExtractError> for ApiError {
    fn from(e: ExtractError) -> Self {
        ApiError::bad_request(e.to_string())
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": triage_common::VERSION }))
}

#[derive(Serialize)]
struct AnalyzeResponse {
    analysis: AnalysisRun,
    counts: ReportCounts,
    trace_session: Option<TraceSession>,
}

/// Upload artifacts and run one analysis. The body is multipart: either a
/// single `bundle` archive to be sniffed, or individual `report` / `trace` /
/// `screenshot` / `video` / `context` parts.
async fn analyze_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    let mut bundle = ArtifactBundle::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("multipart: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("multipart field {}: {}", name, e)))?;

        match name.as_str() {
            "bundle" => bundle = extract_bundle(&data)?,
            "report" => bundle.report = data.to_vec(),
            "trace" => bundle.trace = Some(data.to_vec()),
            "screenshot" => bundle.screenshots.push(data.to_vec()),
            "video" => bundle.video = Some(data.to_vec()),
            "context" => bundle.context = Some(String::from_utf8_lossy(&data).into_owned()),
            other => {
                warn!("Ignoring unknown multipart field: {}", other);
            }
        }
    }

    if bundle.report.is_empty() {
        return Err(ApiError::bad_request(
            "upload contained no test report (expected a 'bundle' or 'report' part)",
        ));
    }

    let counts = report_counts(&bundle.report).map_err(ApiError::from)?;
    let trace_bytes = bundle.trace.clone();
    let artifacts: AnalysisArtifacts = bundle.into();

    let analysis = state.engine.run_analysis(&artifacts).await?;

    // Stash the trace for later re-viewing only once the run has succeeded
    let trace_session = trace_bytes.map(|bytes| state.sessions.put(bytes));

    info!(
        "Analysis complete: {} failure(s), {} trace session",
        analysis.failure_facts.len(),
        if trace_session.is_some() { "with" } else { "no" }
    );

    Ok(Json(AnalyzeResponse {
        analysis,
        counts,
        trace_session,
    }))
}

async fn trace_exists_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    Json(json!({ "exists": state.sessions.contains(&id) }))
}

/// Serve stored trace bytes, honoring a single `Range: bytes=a-b` header.
async fn get_trace_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_byte_range);

    let lookup = match range.clone() {
        Some(range) => state.sessions.get_range(&id, range),
        None => state.sessions.get(&id),
    };

    match lookup {
        SessionLookup::Found(bytes) => {
            let status = if range.is_some() {
                StatusCode::PARTIAL_CONTENT
            } else {
                StatusCode::OK
            };
            (
                status,
                [(header::CONTENT_TYPE, "application/zip")],
                bytes.to_vec(),
            )
                .into_response()
        }
        SessionLookup::Expired => (
            StatusCode::GONE,
            Json(json!({ "error": "trace session expired" })),
        )
            .into_response(),
        SessionLookup::NotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "trace session not found" })),
        )
            .into_response(),
    }
}

/// Parse `bytes=start-end` (inclusive end, per RFC 9110) into a half-open
/// range. Open-ended and suffix forms are not needed by the trace viewer.
fn parse_byte_range(value: &str) -> Option<std::ops::Range<usize>> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: usize = start.trim().parse().ok()?;
    let end: usize = end.trim().parse().ok()?;
    (end >= start).then(|| start..end + 1)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_range_parsing() {
        assert_eq!(parse_byte_range("bytes=0-99"), Some(0..100));
        assert_eq!(parse_byte_range("bytes=10-10"), Some(10..11));
        assert_eq!(parse_byte_range("bytes=9-2"), None);
        assert_eq!(parse_byte_range("items=0-99"), None);
        assert_eq!(parse_byte_range("bytes=-500"), None);
    }

    #[test]
    fn config_defaults() {
        let config = WebConfig::default();
        assert!(config.socket_addr().is_ok());
        assert!(config.session_ttl_secs > config.sweep_interval_secs);
    }
}
