use thiserror::Error;

/// Application level error type used throughout the crate.
///
/// Only configuration problems and misuse of the engine handle surface here.
/// Per-sample failures (bad reads, out-of-range decodes, formula faults) are
/// absorbed into quality tagging and never reach the caller as errors.
#[derive(Error, Debug)]
pub enum EngineError {
    /// I/O related failure
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error while parsing YAML configuration files
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Error while serializing snapshots
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Parameter is not configured for the unit
    #[error("Parameter not found: {0}")]
    UnknownParameter(String),

    /// Rejected operator input (non-finite manual value)
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Unit id does not exist in the station configuration
    #[error("Unit not found: {0}")]
    UnknownUnit(String),

    /// Engine task has stopped and no longer accepts commands
    #[error("Engine channel closed: {0}")]
    Channel(String),
}

/// Convenient alias over [`Result`] using [`EngineError`]
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_render_with_prefix() {
        let err = EngineError::Config("duplicate priority 2 for 'suction_pressure'".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: duplicate priority 2 for 'suction_pressure'"
        );
    }

    #[test]
    fn yaml_errors_convert() {
        let parse: std::result::Result<serde_yaml::Value, _> = serde_yaml::from_str("a: [1, 2");
        let err: EngineError = parse.unwrap_err().into();
        assert!(matches!(err, EngineError::Yaml(_)));
    }
}
