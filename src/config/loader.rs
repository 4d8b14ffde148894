//! TOML loading for [`OrchestratorConfig`].
//!
//! Both entry points parse, then run [`validation::validate`]; nothing
//! unvalidated is ever returned. Errors name the file (or `source_name`)
//! they came from.

use std::path::Path;

use super::validation::{self, ConfigError};
use super::OrchestratorConfig;

/// Read `path` and load it with [`load_from_str`].
///
/// # Errors
///
/// [`ConfigError::Io`] when the file is unreadable, otherwise whatever
/// [`load_from_str`] returns.
///
/// # Example
///
/// ```rust,ignore
/// use tokio_ai_orchestrator::config::loader::load_from_file;
/// use std::path::Path;
///
/// let config = load_from_file(Path::new("orchestrator.toml"))?;
/// assert!(config.queue.shards >= 1);
/// ```
pub fn load_from_file(path: &Path) -> Result<OrchestratorConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Parse and validate TOML. `source_name` labels errors.
///
/// # Errors
///
/// [`ConfigError::Parse`] for malformed TOML or wrong field types;
/// [`ConfigError::Validation`] listing every violated rule, one per line.
pub fn load_from_str(content: &str, source_name: &str) -> Result<OrchestratorConfig, ConfigError> {
    let config: OrchestratorConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    validation::validate(&config).map_err(|errors| {
        ConfigError::Validation(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    })?;

    Ok(config)
}
