use thiserror::Error;

#[derive(Error, Debug)]
pub enum NimbusError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Cache is busy: {0}")]
    CacheBusy(String),

    #[error("daemon already running: {0}")]
    AlreadyRunning(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NimbusError>;
