use crate::scheduler::LookupResult;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Homebrew error: {0}")]
    Tool(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Failed to parse data: {0}")]
    DataParsing(String),

    #[error("Aborted after {error_count} consecutive failed batches ({} results kept)", partial.len())]
    BatchAborted {
        error_count: usize,
        partial: Vec<LookupResult>,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("API request failed: {0}")]
    ApiError(#[from] reqwest::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl TrackerError {
    /// Partial results carried by an aborted batch run, if any.
    pub fn partial_results(&self) -> Option<&[LookupResult]> {
        match self {
            TrackerError::BatchAborted { partial, .. } => Some(partial),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TrackerError>;

/// Classification of a failed lookup.
///
/// Callers use this to decide whether a failure counts toward the batch
/// error threshold and whether a fuzzy search fallback makes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Network,
    Permission,
    ToolMissing,
    Tool,
    NotFound,
    Parse,
    Unknown,
}

impl ErrorKind {
    /// Timeouts, connectivity problems and Homebrew failures are worth retrying.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::Network | ErrorKind::Tool)
    }

    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::Permission => "permission denied",
            ErrorKind::ToolMissing => "homebrew not installed",
            ErrorKind::Tool => "homebrew error",
            ErrorKind::NotFound => "not found",
            ErrorKind::Parse => "malformed response",
            ErrorKind::Unknown => "unknown error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
