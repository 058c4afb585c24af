use std::fmt;
use std::path::Path;
use std::str::FromStr;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::PullError;

/// Extensions the organizer treats as media, compared case-insensitively.
pub const MEDIA_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "tiff", "webp", "heic", "heif",
];

pub fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            MEDIA_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

/// Server-provided reference to a downloadable result archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultLocator(String);

impl ResultLocator {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolves the locator into a download URL. Absolute `http`/`https`
    /// locators are used as is, anything relative is joined onto `base`.
    pub fn resolve(&self, base: &Url) -> Result<Url, PullError> {
        match Url::parse(&self.0) {
            Ok(url) => match url.scheme() {
                "http" | "https" => Ok(url),
                other => Err(PullError::InvalidEndpoint(format!(
                    "unsupported scheme {other} in {}",
                    self.0
                ))),
            },
            Err(_) => directory_url(base)
                .join(&self.0)
                .map_err(|err| PullError::InvalidEndpoint(format!("{}: {err}", self.0))),
        }
    }
}

impl fmt::Display for ResultLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ResultLocator {
    type Err = PullError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(PullError::InvalidEndpoint("empty result locator".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Returns `base` with a trailing slash so `join` appends instead of replacing
/// the last path segment.
pub fn directory_url(base: &Url) -> Url {
    let mut url = base.clone();
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Idle,
    Uploading,
    AwaitingDownload,
    Downloading,
    Extracting,
    Organizing,
    Complete,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed | JobState::Cancelled)
    }

    /// True while a pipeline step owns the job.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            JobState::Uploading | JobState::Downloading | JobState::Extracting | JobState::Organizing
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::Uploading => "uploading",
            JobState::AwaitingDownload => "awaiting download",
            JobState::Downloading => "downloading",
            JobState::Extracting => "extracting",
            JobState::Organizing => "organizing",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Timeout,
    ConnectionLost,
    NotConnected,
    Other,
}

impl TransportKind {
    pub fn is_transient(self) -> bool {
        !matches!(self, TransportKind::Other)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Timeout => write!(f, "timed out"),
            TransportKind::ConnectionLost => write!(f, "connection lost"),
            TransportKind::NotConnected => write!(f, "not connected"),
            TransportKind::Other => write!(f, "transport error"),
        }
    }
}
