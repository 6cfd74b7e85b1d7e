//! Error types for segue-core

use crate::segment::SegmentId;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for segue-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by a generative oracle.
///
/// All three kinds are retryable; the lookahead buffer retries them with
/// backoff until the configured retry limit is reached.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OracleError {
    /// The model process or library could not be reached.
    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    /// The call did not return within the configured timeout.
    #[error("oracle timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),

    /// The oracle answered, but the melody was empty or malformed.
    #[error("oracle returned invalid output: {0}")]
    InvalidOutput(String),
}

impl OracleError {
    /// Short stable name of the failure kind, used in status reports.
    pub fn kind(&self) -> &'static str {
        match self {
            OracleError::Unavailable(_) => "OracleUnavailable",
            OracleError::Timeout(_) => "OracleTimeout",
            OracleError::InvalidOutput(_) => "OracleInvalidOutput",
        }
    }
}

/// Failures reported by a note sink. Never propagated into the pipeline.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The output device or port rejected the message
    #[error("sink send failed: {0}")]
    Send(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur in segue-core
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration file or value error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Oracle failure surfaced outside the retry loop (batch generation)
    #[error(transparent)]
    Oracle(#[from] OracleError),

    /// A slot exhausted its retry budget
    #[error("persistent generation failure for segment {segment} in slot {slot} after {attempts} attempts: {last}")]
    PersistentGenerationFailure {
        slot: usize,
        segment: SegmentId,
        attempts: u32,
        last: OracleError,
    },

    /// A pipeline thread has shut down and can no longer accept commands
    #[error("pipeline is shut down")]
    Shutdown,

    /// MIDI encoding error
    #[error("MIDI error: {0}")]
    Midi(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oracle_error_kinds() {
        assert_eq!(OracleError::Unavailable("x".into()).kind(), "OracleUnavailable");
        assert_eq!(OracleError::Timeout(Duration::from_secs(1)).kind(), "OracleTimeout");
        assert_eq!(OracleError::InvalidOutput("x".into()).kind(), "OracleInvalidOutput");
    }

    #[test]
    fn test_timeout_message_is_human_readable() {
        let err = OracleError::Timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "oracle timed out after 1s 500ms");
    }
}
