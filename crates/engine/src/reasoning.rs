//! Reasoning and image-understanding capability seams
//!
//! The pipeline treats "ask a reasoning backend for a structured judgment
//! following schema S" as an abstract capability. Stages depend on the
//! traits here; binaries wire in [`HttpReasoner`], tests substitute mocks.
//! Every call is a blocking request-response bounded by the configured
//! per-request timeout, and callers must treat any error as a signal to take
//! their own heuristic fallback.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use triage_common::ImageInsight;

use crate::config::ReasoningConfig;

/// Errors surfaced by the reasoning capabilities
#[derive(Error, Debug)]
pub enum ReasoningError {
    #[error("reasoning request failed: {0}")]
    Request(String),

    #[error("reasoning request timed out")]
    Timeout,

    #[error("reasoning backend error: {0}")]
    Provider(String),

    #[error("malformed reasoning response: {0}")]
    Malformed(String),
}

/// Target schema for a structured judgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    FailureCategory,
    ArtifactSignals,
    SelectorAnalysis,
    FinalDiagnosis,
    SolutionSuggestion,
}

impl SchemaKind {
    pub fn name(&self) -> &'static str {
        match self {
            SchemaKind::FailureCategory => "failure_category",
            SchemaKind::ArtifactSignals => "artifact_signals",
            SchemaKind::SelectorAnalysis => "selector_analysis",
            SchemaKind::FinalDiagnosis => "final_diagnosis",
            SchemaKind::SolutionSuggestion => "solution_suggestion",
        }
    }
}

/// One structured-judgment request
#[derive(Debug, Clone)]
pub struct ReasoningRequest {
    pub prompt: String,
    pub schema: SchemaKind,
}

/// Structured-inference capability
#[async_trait]
pub trait Reasoning: Send + Sync {
    /// Return a value conforming to the requested schema, or fail
    async fn complete(&self, request: ReasoningRequest) -> Result<Value, ReasoningError>;
}

/// Image-understanding capability
#[async_trait]
pub trait ImageUnderstanding: Send + Sync {
    async fn analyze_image(&self, image: &[u8], prompt: &str)
        -> Result<ImageInsight, ReasoningError>;
}

/// Ask for a judgment and deserialize it into the stage's typed shape.
/// A response that does not fit the schema counts as a capability failure.
pub async fn complete_as<T: DeserializeOwned>(
    reasoning: &dyn Reasoning,
    prompt: String,
    schema: SchemaKind,
) -> Result<T, ReasoningError> {
    let value = reasoning.complete(ReasoningRequest { prompt, schema }).await?;
    serde_json::from_value(value).map_err(|e| ReasoningError::Malformed(e.to_string()))
}

// ============================================================================
// HTTP-backed implementation
// ============================================================================

/// Client for an HTTP structured-inference service
pub struct HttpReasoner {
    http_client: reqwest::Client,
    config: ReasoningConfig,
    api_key: Option<String>,
}

impl HttpReasoner {
    pub fn new(config: ReasoningConfig) -> Self {
        let api_key = config
            .api_key_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|v| !v.trim().is_empty());
        Self {
            http_client: reqwest::Client::new(),
            config,
            api_key,
        }
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, ReasoningError> {
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), path);
        debug!("Reasoning call: POST {}", url);

        let mut request = self
            .http_client
            .post(&url)
            .timeout(Duration::from_secs(self.config.request_timeout_secs))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ReasoningError::Timeout
            } else {
                ReasoningError::Request(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ReasoningError::Provider(format!("{}: {}", status, text)));
        }

        response
            .json()
            .await
            .map_err(|e| ReasoningError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl Reasoning for HttpReasoner {
    async fn complete(&self, request: ReasoningRequest) -> Result<Value, ReasoningError> {
        self.post(
            "v1/structured",
            json!({
                "model": self.config.model,
                "prompt": request.prompt,
                "schema": request.schema.name(),
            }),
        )
        .await
    }
}

#[async_trait]
impl ImageUnderstanding for HttpReasoner {
    async fn analyze_image(
        &self,
        image: &[u8],
        prompt: &str,
    ) -> Result<ImageInsight, ReasoningError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(image);
        let value = self
            .post(
                "v1/vision",
                json!({
                    "model": self.config.model,
                    "prompt": prompt,
                    "image_base64": encoded,
                }),
            )
            .await?;
        serde_json::from_value(value).map_err(|e| ReasoningError::Malformed(e.to_string()))
    }
}
