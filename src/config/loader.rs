//! Turning TOML text into a validated [`OrchestratorConfig`].
//!
//! Nothing leaves this module unvalidated. Every error names the file (or
//! the caller-supplied source label) it came from.

use std::path::Path;

use super::validation::{self, ConfigError};
use super::OrchestratorConfig;

/// Read, parse and validate the TOML file at `path`.
///
/// # Errors
///
/// [`ConfigError::Io`] when the file is unreadable, [`ConfigError::Parse`]
/// for malformed TOML or unknown enum values, and [`ConfigError::Validation`]
/// listing every violated constraint, one per line.
///
/// ```rust,ignore
/// let config = load_from_file(Path::new("orchestrator.toml"))?;
/// assert!(!config.canary.steps.is_empty());
/// ```
pub fn load_from_file(path: &Path) -> Result<OrchestratorConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Same as [`load_from_file`] for in-memory TOML; `source_name` labels
/// errors in place of a path.
///
/// # Errors
///
/// As for [`load_from_file`], minus [`ConfigError::Io`].
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
