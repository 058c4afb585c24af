use std::fmt;
use std::path::PathBuf;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{JobState, TransportKind};

#[derive(Debug, Error, Diagnostic)]
pub enum PullError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("server returned status {status}: {message}")]
    ServerRejected { status: u16, message: String },

    /// `body` keeps the raw response for diagnostics and is left out of the
    /// rendered message.
    #[error("unexpected response from server: {reason}")]
    DecodeFailed { reason: String, body: String },

    #[error("no data received")]
    NoData,

    #[error("empty file received")]
    EmptyFile,

    #[error("{kind}: {message}")]
    Transport { kind: TransportKind, message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("failed to write extracted entry: {0}")]
    ExtractionIo(String),

    #[error("no media found in the archive")]
    NoMediaFound,

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("selected video not found: {0}")]
    SourceNotFound(PathBuf),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("video conversion failed: {0}")]
    Conversion(String),

    #[error("no video selected")]
    NoSource,

    #[error("no result locator available")]
    NoLocator,

    #[error("pipeline busy ({0})")]
    Busy(JobState),

    #[error("missing config file at {0}")]
    MissingConfig(PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config value: {0}")]
    ConfigValue(String),
}

impl PullError {
    pub fn transport(kind: TransportKind, message: impl Into<String>) -> Self {
        PullError::Transport {
            kind,
            message: message.into(),
        }
    }

    /// Failures worth another attempt: timeouts and dropped or missing
    /// connections.
    pub fn is_transient(&self) -> bool {
        matches!(self, PullError::Transport { kind, .. } if kind.is_transient())
    }

    pub fn kind(&self) -> JobErrorKind {
        match self {
            PullError::InvalidEndpoint(_) => JobErrorKind::InvalidEndpoint,
            PullError::ServerRejected { status, .. } => JobErrorKind::ServerRejected(*status),
            PullError::DecodeFailed { .. } => JobErrorKind::DecodeFailed,
            PullError::NoData => JobErrorKind::NoData,
            PullError::EmptyFile => JobErrorKind::EmptyFile,
            PullError::Transport { kind, .. } => JobErrorKind::Transport(*kind),
            PullError::Cancelled => JobErrorKind::Cancelled,
            PullError::CorruptArchive(_) | PullError::ExtractionIo(_) => {
                JobErrorKind::ExtractionFailed
            }
            PullError::NoMediaFound => JobErrorKind::NoMediaFound,
            PullError::SourceNotFound(_)
            | PullError::MissingTool(_)
            | PullError::Conversion(_)
            | PullError::NoSource => JobErrorKind::SourceUnavailable,
            PullError::Filesystem(_) => JobErrorKind::FileSystemError,
            PullError::NoLocator
            | PullError::Busy(_)
            | PullError::MissingConfig(_)
            | PullError::ConfigRead(_)
            | PullError::ConfigParse(_)
            | PullError::ConfigValue(_) => JobErrorKind::Rejected,
        }
    }
}

/// Error category recorded on a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum JobErrorKind {
    InvalidEndpoint,
    ServerRejected(u16),
    DecodeFailed,
    NoData,
    EmptyFile,
    Transport(TransportKind),
    Cancelled,
    ExtractionFailed,
    NoMediaFound,
    FileSystemError,
    SourceUnavailable,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&PullError> for JobError {
    fn from(err: &PullError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_failure_hides_body() {
        let err = PullError::DecodeFailed {
            reason: "missing field `download_url`".to_string(),
            body: "<html>tunnel warning</html>".to_string(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("download_url"));
        assert!(!rendered.contains("tunnel warning"));
        assert_eq!(err.kind(), JobErrorKind::DecodeFailed);
    }

    #[test]
    fn only_connection_failures_are_transient() {
        assert!(PullError::transport(TransportKind::Timeout, "slow").is_transient());
        assert!(PullError::transport(TransportKind::NotConnected, "offline").is_transient());
        assert!(!PullError::transport(TransportKind::Other, "tls").is_transient());
        assert!(
            !PullError::ServerRejected {
                status: 503,
                message: String::new()
            }
            .is_transient()
        );
        assert!(!PullError::Cancelled.is_transient());
    }
}
