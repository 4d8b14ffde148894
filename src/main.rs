//! Demo binary for tokio-ai-orchestrator
//!
//! Runs a handful of analyze/generate/optimize calls through the full stack
//! against the offline echo provider, then prints the health report.
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json`: structured JSON output (production)
//! - `RUST_LOG=info`: log level filter (default: info)
//! - `ORCHESTRATOR_CONFIG=path.toml`: optional configuration file

use std::path::Path;
use std::sync::Arc;
use tokio_ai_orchestrator::config::loader;
use tokio_ai_orchestrator::orchestrator::to_contract;
use tokio_ai_orchestrator::security::RawInput;
use tokio_ai_orchestrator::{
    init_tracing, metrics, EchoProvider, GenerationProvider, Orchestrator, OrchestratorConfig,
};
use tracing::info;

const RESUME: &str = "Software engineer with six years of backend experience. Built a \
payments reconciliation service handling 2M transactions per day and led migration of \
three services to Kubernetes.";

fn input(session: &str, text: &str) -> RawInput {
    RawInput {
        text: Some(text.to_string()),
        session_id: Some(session.to_string()),
        ..RawInput::default()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = init_tracing();
    metrics::init_metrics()?;

    let config = match std::env::var("ORCHESTRATOR_CONFIG") {
        Ok(path) => loader::load_from_file(Path::new(&path))?,
        Err(_) => OrchestratorConfig::default(),
    };

    info!("Starting tokio-ai-orchestrator demo");

    let provider: Arc<dyn GenerationProvider> = Arc::new(EchoProvider::with_delay(25));
    let orchestrator = Orchestrator::new(config, provider).await?;

    let analyze = input("demo-session-1", RESUME);
    let results = vec![
        ("analyze", orchestrator.analyze(&analyze).await),
        // Identical request: served from cache.
        ("analyze (repeat)", orchestrator.analyze(&analyze).await),
        (
            "generate_section",
            orchestrator
                .generate_section(&RawInput {
                    section_type: Some("summary".into()),
                    target_role: Some("Senior Backend Engineer".into()),
                    ..input("demo-session-2", RESUME)
                })
                .await,
        ),
        (
            "optimize",
            orchestrator
                .optimize(&RawInput {
                    target_role: Some("Platform Engineer".into()),
                    ..input("demo-session-3", RESUME)
                })
                .await,
        ),
        (
            "blocked",
            orchestrator
                .analyze(&input("demo-session-4", "<script>alert('x')</script> resume"))
                .await,
        ),
    ];

    for (label, result) in &results {
        println!("── {label}");
        println!("{}", serde_json::to_string_pretty(&to_contract(result))?);
    }

    let health = orchestrator.health_report().await;
    println!("── health");
    println!("{}", serde_json::to_string_pretty(&health)?);

    let exposition = metrics::gather_metrics();
    info!(bytes = exposition.len(), "prometheus exposition rendered");
    info!("Demo complete");

    Ok(())
}
