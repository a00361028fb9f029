use thiserror::Error;

/// Common error type for ModGate components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Zenoh error: {0}")]
    Zenoh(#[from] zenoh::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid key expression: {0}")]
    KeyExpr(String),
}

/// Result type alias using ModGate's Error.
pub type Result<T> = std::result::Result<T, Error>;
