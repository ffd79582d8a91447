use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LauncherError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("Tool missing: {0}")]
    ToolMissing(String),
    #[error("Process error: {0}")]
    Process(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("State conflict: {0}")]
    StateConflict(String),
    #[error("Integrity error: {0}")]
    Integrity(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, LauncherError>;
