//! TraceTriage web service entry point

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use triage_engine::{AnalysisEngine, EngineConfig, HttpReasoner};
use triage_web::server::{router, AppState, WebConfig};
use triage_web::session::{spawn_sweeper, TraceSessionStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let web_config = WebConfig::from_env();
    let engine_config = match std::env::var("TRIAGE_CONFIG") {
        Ok(path) => EngineConfig::load(&path)?,
        Err(_) => EngineConfig::default(),
    };

    let reasoner = Arc::new(HttpReasoner::new(engine_config.reasoning.clone()));
    let engine = Arc::new(AnalysisEngine::new(
        reasoner.clone(),
        reasoner,
        engine_config,
    ));

    let sessions = Arc::new(TraceSessionStore::new(web_config.session_ttl_secs));
    let _sweeper = spawn_sweeper(
        sessions.clone(),
        Duration::from_secs(web_config.sweep_interval_secs),
    );

    let state = AppState { engine, sessions };
    let addr = web_config.socket_addr()?;
    info!("TraceTriage web service listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}
