use thiserror::Error;

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Could not extract label '{label}': {reason}")]
    Extraction { label: String, reason: String },

    #[error("Label tuple for '{metric}' has {actual} values, live schema has {expected}")]
    SchemaMismatch {
        metric: String,
        expected: usize,
        actual: usize,
    },

    #[error("Label tuple for '{metric}' was built before the last reconfigure")]
    StaleLabels { metric: String },

    #[error("Unknown metric: {0}")]
    UnknownMetric(String),

    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Exposition server error: {0}")]
    Server(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ListenerError>;
