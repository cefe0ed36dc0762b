//! Execution-trace decoding
//!
//! Deserializes a recorded trace archive (a ZIP holding one newline-delimited
//! JSON event log, `snapshots/*.html` DOM captures, and `resources/*` blobs)
//! into typed event streams. The decoded `TraceData` is built once per
//! analysis run and shared read-only across every stage that needs it.

use std::collections::HashMap;
use std::io::{Cursor, Read};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur while decoding a trace archive
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid trace archive: {0}")]
    Archive(String),

    #[error("No trace event log found in archive (entries: {})", entries.join(", "))]
    MissingEventLog { entries: Vec<String> },
}

/// Result type for trace operations
pub type Result<T> = std::result::Result<T, TraceError>;

// ============================================================================
// Decoded trace model
// ============================================================================

/// One recorded browser action (click, goto, fill, lifecycle event, ...)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionEvent {
    pub name: String,
    pub selector: Option<String>,
    /// Target URL for navigation-flavored actions
    pub url: Option<String>,
    pub start_ms: f64,
    pub end_ms: f64,
    pub error: Option<String>,
}

/// One recorded network exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkEvent {
    pub url: String,
    pub method: String,
    pub status: Option<u16>,
    /// Network-level failure text (e.g. `net::ERR_CONNECTION_REFUSED`)
    pub failure: Option<String>,
    /// Resource type as recorded ("document", "script", "xhr", ...)
    pub resource_type: Option<String>,
    /// Response `Location` header, when present
    pub location: Option<String>,
    pub timestamp: f64,
}

impl NetworkEvent {
    pub fn is_main_document(&self) -> bool {
        self.resource_type.as_deref() == Some("document")
    }

    pub fn failed(&self) -> bool {
        self.failure.is_some() || self.status.map(|s| s >= 400).unwrap_or(false)
    }
}

/// One console message emitted by the page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleEvent {
    pub level: String,
    pub text: String,
    pub timestamp: f64,
}

/// A single point-in-time DOM capture
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomSnapshot {
    pub html: String,
    pub timestamp: f64,
    pub url: String,
    pub viewport: Option<Viewport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Trace-level metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceMeta {
    pub start_time: f64,
    pub end_time: f64,
    pub viewport: Option<Viewport>,
    pub browser: Option<String>,
}

/// Decoded execution trace, read-only after construction
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TraceData {
    pub actions: Vec<ActionEvent>,
    pub network: Vec<NetworkEvent>,
    pub console: Vec<ConsoleEvent>,
    pub snapshots: Vec<DomSnapshot>,
    /// Raw resource blobs keyed by archive entry name
    pub resources: HashMap<String, Vec<u8>>,
    pub meta: Option<TraceMeta>,
}

// ============================================================================
// Event-log records
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum TraceRecord {
    Action(ActionRecord),
    #[serde(alias = "resource")]
    Network(NetworkRecord),
    Console(ConsoleRecord),
    Snapshot(SnapshotRecord),
    ContextOptions(ContextRecord),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActionRecord {
    #[serde(alias = "apiName")]
    name: String,
    #[serde(default)]
    selector: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    start_time: f64,
    #[serde(default)]
    end_time: f64,
    #[serde(default)]
    error: Option<ErrorRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorRecord {
    Message { message: String },
    Text(String),
}

impl ErrorRecord {
    fn into_message(self) -> String {
        match self {
            ErrorRecord::Message { message } => message,
            ErrorRecord::Text(text) => text,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkRecord {
    #[serde(default)]
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    status: Option<u16>,
    #[serde(default)]
    failure: Option<String>,
    #[serde(default)]
    resource_type: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    timestamp: f64,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsoleRecord {
    #[serde(default = "default_level")]
    level: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    timestamp: f64,
}

fn default_level() -> String {
    "log".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotRecord {
    #[serde(alias = "sha1")]
    snapshot_id: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    timestamp: f64,
    #[serde(default)]
    viewport: Option<Viewport>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContextRecord {
    #[serde(default)]
    browser_name: Option<String>,
    #[serde(default)]
    viewport: Option<Viewport>,
}

// ============================================================================
// Reading
// ============================================================================

/// Canonical event-log entry name
const EVENT_LOG_NAME: &str = "trace.trace";

/// How many entry names to include in a `MissingEventLog` error
const ENTRY_SAMPLE: usize = 10;

/// Decode a trace archive into typed event streams.
///
/// Fails with [`TraceError::MissingEventLog`] when no event-log entry can be
/// located; tolerates one level of archive-within-archive nesting.
pub fn read_trace(bytes: &[u8]) -> Result<TraceData> {
    read_trace_inner(bytes, true)
}

fn read_trace_inner(bytes: &[u8], allow_nested: bool) -> Result<TraceData> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| TraceError::Archive(format!("zip: {}", e)))?;

    let names: Vec<String> = archive.file_names().map(String::from).collect();

    let log_name = match find_event_log(&names) {
        Some(name) => name,
        None => {
            // Some producers wrap the event log in an inner archive
            if allow_nested {
                if let Some(inner_name) = names.iter().find(|n| n.ends_with(".zip")) {
                    debug!("Descending into nested trace archive: {}", inner_name);
                    let inner_bytes = read_entry(&mut archive, inner_name)?;
                    return read_trace_inner(&inner_bytes, false);
                }
            }
            return Err(TraceError::MissingEventLog {
                entries: names.into_iter().take(ENTRY_SAMPLE).collect(),
            });
        }
    };

    let log_bytes = read_entry(&mut archive, &log_name)?;
    let log_text = String::from_utf8_lossy(&log_bytes);

    let mut trace = TraceData::default();
    let mut snapshot_meta: Vec<SnapshotRecord> = Vec::new();
    let mut context: Option<ContextRecord> = None;

    for (lineno, line) in log_text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!("Skipping malformed trace event at line {}: {}", lineno + 1, e);
                continue;
            }
        };
        match serde_json::from_value::<TraceRecord>(value) {
            Ok(TraceRecord::Action(a)) => trace.actions.push(ActionEvent {
                name: a.name,
                selector: a.selector,
                url: a.url,
                start_ms: a.start_time,
                end_ms: a.end_time,
                error: a.error.map(ErrorRecord::into_message),
            }),
            Ok(TraceRecord::Network(n)) => trace.network.push(NetworkEvent {
                url: n.url,
                method: n.method,
                status: n.status,
                failure: n.failure,
                resource_type: n.resource_type,
                location: n.location,
                timestamp: n.timestamp,
            }),
            Ok(TraceRecord::Console(c)) => trace.console.push(ConsoleEvent {
                level: c.level,
                text: c.text,
                timestamp: c.timestamp,
            }),
            Ok(TraceRecord::Snapshot(s)) => snapshot_meta.push(s),
            Ok(TraceRecord::ContextOptions(c)) => context = Some(c),
            Err(e) => {
                // Producers record types this reader has no use for
                debug!("Ignoring trace record at line {}: {}", lineno + 1, e);
            }
        }
    }

    // Join snapshot metadata with stored HTML blobs, and collect resources
    let mut snapshot_blobs: HashMap<String, String> = HashMap::new();
    for name in &names {
        if let Some(id) = name
            .strip_prefix("snapshots/")
            .and_then(|rest| rest.strip_suffix(".html"))
        {
            let blob = read_entry(&mut archive, name)?;
            snapshot_blobs.insert(id.to_string(), String::from_utf8_lossy(&blob).into_owned());
        } else if name.starts_with("resources/") && !name.ends_with('/') {
            let blob = read_entry(&mut archive, name)?;
            trace.resources.insert(name.clone(), blob);
        }
    }

    for meta in snapshot_meta {
        if let Some(html) = snapshot_blobs.remove(&meta.snapshot_id) {
            trace.snapshots.push(DomSnapshot {
                html,
                timestamp: meta.timestamp,
                url: meta.url,
                viewport: meta.viewport,
            });
        } else {
            debug!("Snapshot metadata {} has no stored HTML", meta.snapshot_id);
        }
    }

    // A blob with no metadata record still becomes a minimal snapshot entry
    // so captured DOM is never silently dropped.
    for (id, html) in snapshot_blobs {
        debug!("Snapshot blob {} has no metadata record", id);
        trace.snapshots.push(DomSnapshot {
            html,
            timestamp: chrono::Utc::now().timestamp_millis() as f64,
            url: String::new(),
            viewport: None,
        });
    }

    trace
        .snapshots
        .sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));

    let start = trace
        .actions
        .iter()
        .map(|a| a.start_ms)
        .fold(f64::INFINITY, f64::min);
    let end = trace
        .actions
        .iter()
        .map(|a| a.end_ms)
        .fold(f64::NEG_INFINITY, f64::max);
    if start.is_finite() && end.is_finite() {
        trace.meta = Some(TraceMeta {
            start_time: start,
            end_time: end,
            viewport: context.as_ref().and_then(|c| c.viewport),
            browser: context.and_then(|c| c.browser_name),
        });
    }

    debug!(
        "Decoded trace: {} actions, {} network, {} console, {} snapshots, {} resources",
        trace.actions.len(),
        trace.network.len(),
        trace.console.len(),
        trace.snapshots.len(),
        trace.resources.len()
    );

    Ok(trace)
}

/// Event-log lookup: exact name, then extension, then substring, in that
/// priority order.
fn find_event_log(names: &[String]) -> Option<String> {
    if let Some(name) = names.iter().find(|n| *n == EVENT_LOG_NAME) {
        return Some(name.clone());
    }
    if let Some(name) = names.iter().find(|n| n.ends_with(".trace")) {
        return Some(name.clone());
    }
    names
        .iter()
        .find(|n| n.contains("trace") && !n.ends_with('/'))
        .cloned()
}

fn read_entry(archive: &mut zip::ZipArchive<Cursor<&[u8]>>, name: &str) -> Result<Vec<u8>> {
    let mut entry = archive
        .by_name(name)
        .map_err(|e| TraceError::Archive(format!("zip entry {}: {}", name, e)))?;
    let mut buf = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut buf)?;
    Ok(buf)
}

// ============================================================================
// Tests
// ============================================================================
