//! TraceTriage web service
//!
//! HTTP plumbing around the analysis pipeline: multipart upload with
//! artifact sniffing, the analysis endpoint, and the ephemeral trace-session
//! store that lets a human re-view a trace after the run.

pub mod extract;
pub mod server;
pub mod session;

pub use extract::{extract_bundle, ArtifactBundle, ExtractError};
pub use server::{router, AppState, WebConfig};
pub use session::{SessionLookup, TraceSession, TraceSessionStore};
