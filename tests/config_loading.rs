//! Configuration file round trips through the public API.
//!
//! Covers:
//! - A TOML file on disk drives the orchestrator's limits
//! - Invalid files never produce an orchestrator
//! - The exported JSON schema names every section

use std::io::Write;
use std::sync::Arc;

use tokio_ai_orchestrator::config::loader::load_from_file;
use tokio_ai_orchestrator::config::validation::ConfigError;
use tokio_ai_orchestrator::config::export_schema;
use tokio_ai_orchestrator::security::RawInput;
use tokio_ai_orchestrator::{EchoProvider, Orchestrator};

const RESUME: &str = "Product designer with a decade of experience in fintech onboarding flows.";

fn write_toml(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(content.as_bytes()).expect("write");
    file
}

#[tokio::test]
async fn test_file_limits_apply_to_orchestrator() {
    let file = write_toml(
        r#"
[security]
requests_per_minute = 2
requests_per_hour = 20

[retry]
base_delay_ms = 1
max_delay_ms = 2
"#,
    );
    let config = load_from_file(file.path()).expect("load");
    assert_eq!(config.security.requests_per_minute, 2);
    // Untouched sections keep their defaults.
    assert_eq!(config.queue.max_queue_size, 100);

    let orch = Orchestrator::new(config, Arc::new(EchoProvider::with_delay(0)))
        .await
        .expect("orchestrator");
    let raw = RawInput {
        text: Some(RESUME.into()),
        session_id: Some("session-file-1".into()),
        ..RawInput::default()
    };
    orch.analyze(&raw).await.expect("first");
    orch.analyze(&raw).await.expect("second");
    let err = orch.analyze(&raw).await.expect_err("third is over the limit");
    assert_eq!(err.code(), "RATE_LIMIT_EXCEEDED");
}

#[test]
fn test_invalid_file_is_rejected_with_every_problem() {
    let file = write_toml(
        r#"
[cost]
monthly_budget_usd = 0.0

[queue]
shards = 0
"#,
    );
    match load_from_file(file.path()) {
        Err(ConfigError::Validation(msg)) => {
            assert!(msg.contains("monthly_budget_usd"), "{msg}");
            assert!(msg.contains("shards"), "{msg}");
        }
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[test]
fn test_schema_lists_all_sections() {
    let schema = export_schema().expect("schema");
    for section in ["security", "cache", "queue", "cost", "retry", "monitoring", "provider"] {
        assert!(schema.contains(section), "schema missing {section}");
    }
}
