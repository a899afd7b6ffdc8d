/// Error taxonomy for pipeline runs
///
/// Every handler, adapter and store in the engine reports failures through
/// `PipelineError`. The variant tells the operator which collaborator broke;
/// the message is what ends up in the execution log.

use thiserror::Error;

/// Result alias used throughout the engine core
pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing or invalid node config, unknown node type, malformed graph
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Missing input or source file
    #[error("not found: {0}")]
    NotFound(String),

    /// Non-2xx HTTP response, database connect or query failure
    #[error("external call failed: {0}")]
    ExternalCall(String),

    /// Malformed JSON or transform expression
    #[error("parse error: {0}")]
    Parse(String),

    /// Unparseable cron or interval schedule
    #[error("invalid schedule: {0}")]
    ScheduleFormat(String),

    /// Execution record or pipeline store failure
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn external(msg: impl Into<String>) -> Self {
        Self::ExternalCall(msg.into())
    }

    /// Short, stable name of the variant for log details
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "ConfigurationError",
            Self::NotFound(_) => "NotFoundError",
            Self::ExternalCall(_) => "ExternalCallError",
            Self::Parse(_) => "ParseError",
            Self::ScheduleFormat(_) => "ScheduleFormatError",
            Self::Persistence(_) => "PersistenceError",
            Self::Io(_) => "IoError",
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            Self::Io(std::io::Error::other(e.to_string()))
        } else {
            Self::Parse(e.to_string())
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        Self::ExternalCall(format!("HTTP request failed: {}", e))
    }
}
