use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::{Client, Response, multipart};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::ResolvedConfig;
use crate::domain::{ResultLocator, TransportKind, directory_url};
use crate::error::PullError;
use crate::progress::{CancelToken, ProgressFn, ProgressTracker};

/// Header that stops the development tunnel from answering with an HTML
/// interstitial instead of the API response.
pub const SKIP_WARNING_HEADER: &str = "ngrok-skip-browser-warning";

const STATUS_TIMEOUT: Duration = Duration::from_secs(30);
const CHUNK_SIZE: usize = 64 * 1024;
const BODY_QUEUE: usize = 4;
const CANCEL_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub download_url: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub processing_time: String,
}

impl UploadResponse {
    pub fn locator(&self) -> Result<ResultLocator, PullError> {
        self.download_url.parse()
    }
}

#[derive(Debug, Clone)]
pub struct DownloadedArchive {
    pub path: PathBuf,
    pub bytes: u64,
}

/// Single-shot transfers against the processing server. Implementations do
/// not retry; any failure seen after `cancel` is set surfaces as
/// [`PullError::Cancelled`].
pub trait TransferClient: Send + Sync {
    fn status(&self) -> Result<String, PullError>;
    fn upload(
        &self,
        source: &Path,
        progress: ProgressFn,
        cancel: &CancelToken,
    ) -> Result<UploadResponse, PullError>;
    fn download(
        &self,
        locator: &ResultLocator,
        destination: &Path,
        progress: ProgressFn,
        cancel: &CancelToken,
    ) -> Result<DownloadedArchive, PullError>;
}

#[derive(Clone)]
pub struct TransferHttpClient {
    client: Client,
    base_url: Url,
    upload_timeout: Duration,
    download_timeout: Duration,
}

impl TransferHttpClient {
    pub fn new(config: &ResolvedConfig) -> Result<Self, PullError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("framepull/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| PullError::ConfigValue(err.to_string()))?,
        );
        headers.insert(SKIP_WARNING_HEADER, HeaderValue::from_static("true"));

        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(config.connect_timeout)
            .timeout(config.download_timeout)
            .build()
            .map_err(|err| PullError::transport(TransportKind::Other, err.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            upload_timeout: config.upload_timeout,
            download_timeout: config.download_timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn upload_url(&self) -> Result<Url, PullError> {
        directory_url(&self.base_url)
            .join("upload")
            .map_err(|err| PullError::InvalidEndpoint(err.to_string()))
    }

    fn handle_status(response: Response) -> Result<Response, PullError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .ok()
            .map(|body| body.trim().to_string())
            .filter(|body| !body.is_empty())
            .unwrap_or_else(|| format!("HTTP {status}"));
        Err(PullError::ServerRejected { status, message })
    }
}

impl TransferClient for TransferHttpClient {
    fn status(&self) -> Result<String, PullError> {
        let response = self
            .client
            .get(self.base_url.clone())
            .timeout(STATUS_TIMEOUT)
            .send()
            .map_err(classify_reqwest)?;
        let response = Self::handle_status(response)?;
        let body = response.text().map_err(classify_reqwest)?;
        parse_status_response(&body)
    }

    fn upload(
        &self,
        source: &Path,
        progress: ProgressFn,
        cancel: &CancelToken,
    ) -> Result<UploadResponse, PullError> {
        let url = self.upload_url()?;
        let file = File::open(source)
            .map_err(|err| PullError::Filesystem(format!("open {}: {err}", source.display())))?;
        let total = file
            .metadata()
            .map_err(|err| PullError::Filesystem(format!("stat {}: {err}", source.display())))?
            .len();
        let file_name = source
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "video.mp4".to_string());

        let reader = ProgressReader {
            inner: file,
            read: 0,
            total,
            tracker: ProgressTracker::new(progress, cancel.clone()),
            cancel: cancel.clone(),
        };
        let part = multipart::Part::reader_with_length(reader, total)
            .file_name(file_name.clone())
            .mime_str("video/mp4")
            .map_err(|err| PullError::transport(TransportKind::Other, err.to_string()))?;
        let form = multipart::Form::new().part("video", part);

        info!(file = %file_name, bytes = total, url = %url, "upload started");
        let request = self
            .client
            .post(url)
            .timeout(self.upload_timeout)
            .multipart(form);
        let sent = interruptible(cancel, move || request.send())?;
        let response = Self::handle_status(sent.map_err(classify_reqwest)?)?;
        debug!(status = response.status().as_u16(), "upload response");
        let body = interruptible(cancel, move || response.text())?.map_err(classify_reqwest)?;
        parse_upload_response(&body)
    }

    fn download(
        &self,
        locator: &ResultLocator,
        destination: &Path,
        progress: ProgressFn,
        cancel: &CancelToken,
    ) -> Result<DownloadedArchive, PullError> {
        let url = locator.resolve(&self.base_url)?;
        info!(url = %url, "download started");
        let request = self.client.get(url).timeout(self.download_timeout);
        let sent = interruptible(cancel, move || request.send())?;
        let response = Self::handle_status(sent.map_err(classify_reqwest)?)?;
        let total = response.content_length();

        let mut file = File::create(destination).map_err(|err| {
            PullError::Filesystem(format!("create {}: {err}", destination.display()))
        })?;
        let chunks = spawn_body_reader(response)?;
        let mut tracker = ProgressTracker::new(progress, cancel.clone());
        let mut written = 0u64;
        while let Some(chunk) = next_chunk(&chunks, cancel)? {
            file.write_all(&chunk)
                .map_err(|err| PullError::Filesystem(err.to_string()))?;
            written += chunk.len() as u64;
            if let Some(total) = total {
                tracker.report_bytes(written, total);
            }
        }
        file.flush()
            .map_err(|err| PullError::Filesystem(err.to_string()))?;

        if cancel.is_cancelled() {
            return Err(PullError::Cancelled);
        }
        if written == 0 {
            return Err(PullError::EmptyFile);
        }
        tracker.finish();
        debug!(bytes = written, path = %destination.display(), "download finished");
        Ok(DownloadedArchive {
            path: destination.to_path_buf(),
            bytes: written,
        })
    }
}

/// Runs a blocking call on a helper thread and waits for it, returning
/// [`PullError::Cancelled`] as soon as the token is set. A result that
/// arrives after that is dropped on the helper thread, closing its
/// connection.
fn interruptible<T, F>(cancel: &CancelToken, work: F) -> Result<T, PullError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    thread::Builder::new()
        .name("framepull-transfer".to_string())
        .spawn(move || {
            let _ = tx.send(work());
        })
        .map_err(|err| PullError::transport(TransportKind::Other, err.to_string()))?;
    loop {
        if cancel.is_cancelled() {
            return Err(PullError::Cancelled);
        }
        match rx.recv_timeout(CANCEL_POLL) {
            Ok(_) if cancel.is_cancelled() => return Err(PullError::Cancelled),
            Ok(value) => return Ok(value),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(PullError::transport(
                    TransportKind::ConnectionLost,
                    "transfer worker stopped",
                ));
            }
        }
    }
}

type Chunk = io::Result<Vec<u8>>;

/// Reads the response body on a helper thread. The thread stops, dropping
/// the response, once the receiving side goes away.
fn spawn_body_reader(mut response: Response) -> Result<Receiver<Chunk>, PullError> {
    let (tx, rx) = mpsc::sync_channel::<Chunk>(BODY_QUEUE);
    thread::Builder::new()
        .name("framepull-download".to_string())
        .spawn(move || {
            let mut buffer = vec![0u8; CHUNK_SIZE];
            loop {
                match response.read(&mut buffer) {
                    Ok(0) => {
                        let _ = tx.send(Ok(Vec::new()));
                        return;
                    }
                    Ok(read) => {
                        if tx.send(Ok(buffer[..read].to_vec())).is_err() {
                            return;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        return;
                    }
                }
            }
        })
        .map_err(|err| PullError::transport(TransportKind::Other, err.to_string()))?;
    Ok(rx)
}

/// Next body chunk, `None` at the end of the body.
fn next_chunk(
    chunks: &Receiver<Chunk>,
    cancel: &CancelToken,
) -> Result<Option<Vec<u8>>, PullError> {
    loop {
        if cancel.is_cancelled() {
            return Err(PullError::Cancelled);
        }
        match chunks.recv_timeout(CANCEL_POLL) {
            Ok(Ok(chunk)) if chunk.is_empty() => return Ok(None),
            Ok(Ok(chunk)) => return Ok(Some(chunk)),
            Ok(Err(err)) => return Err(classify_io(&err)),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(PullError::transport(
                    TransportKind::ConnectionLost,
                    "download reader stopped",
                ));
            }
        }
    }
}

/// Upload body reader that counts bytes for progress and aborts the request
/// once the token is cancelled.
struct ProgressReader {
    inner: File,
    read: u64,
    total: u64,
    tracker: ProgressTracker,
    cancel: CancelToken,
}

impl Read for ProgressReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::other("upload cancelled"));
        }
        let read = self.inner.read(buf)?;
        if read == 0 {
            self.tracker.finish();
        } else {
            self.read += read as u64;
            self.tracker.report_bytes(self.read, self.total);
        }
        Ok(read)
    }
}

pub fn parse_upload_response(body: &str) -> Result<UploadResponse, PullError> {
    if body.trim().is_empty() {
        return Err(PullError::NoData);
    }
    let response: UploadResponse =
        serde_json::from_str(body).map_err(|err| PullError::DecodeFailed {
            reason: err.to_string(),
            body: body.to_string(),
        })?;
    if response.download_url.trim().is_empty() {
        return Err(PullError::DecodeFailed {
            reason: "empty download_url".to_string(),
            body: body.to_string(),
        });
    }
    Ok(response)
}

pub fn parse_status_response(body: &str) -> Result<String, PullError> {
    if body.trim().is_empty() {
        return Err(PullError::NoData);
    }
    let value: Value = serde_json::from_str(body).map_err(|err| PullError::DecodeFailed {
        reason: err.to_string(),
        body: body.to_string(),
    })?;
    value
        .get("status")
        .and_then(|status| status.as_str())
        .map(|status| status.to_string())
        .ok_or_else(|| PullError::DecodeFailed {
            reason: "missing status field".to_string(),
            body: body.to_string(),
        })
}

fn classify_reqwest(err: reqwest::Error) -> PullError {
    if err.is_builder() {
        return PullError::InvalidEndpoint(err.to_string());
    }
    let kind = if err.is_timeout() {
        TransportKind::Timeout
    } else if err.is_connect() {
        TransportKind::NotConnected
    } else if err.is_body() || err.is_request() || err.is_decode() {
        TransportKind::ConnectionLost
    } else {
        TransportKind::Other
    };
    PullError::transport(kind, err.to_string())
}

fn classify_io(err: &io::Error) -> PullError {
    if let Some(inner) = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
    {
        if inner.is_timeout() {
            return PullError::transport(TransportKind::Timeout, err.to_string());
        }
    }
    let kind = match err.kind() {
        io::ErrorKind::TimedOut => TransportKind::Timeout,
        io::ErrorKind::NotConnected => TransportKind::NotConnected,
        _ => TransportKind::ConnectionLost,
    };
    PullError::transport(kind, err.to_string())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn upload_response_with_extra_fields() {
        let body = r#"{"download_url":"/download/abc.zip","message":"ok","processing_time":"1.5s","frames":12}"#;
        let response = parse_upload_response(body).unwrap();
        assert_eq!(response.download_url, "/download/abc.zip");
        assert_eq!(response.processing_time, "1.5s");
    }

    #[test]
    fn upload_response_keeps_raw_body_on_decode_failure() {
        let body = "<html>You are about to visit</html>";
        let err = parse_upload_response(body).unwrap_err();
        assert_matches!(err, PullError::DecodeFailed { body: raw, .. } if raw == body);
    }

    #[test]
    fn empty_upload_response_is_no_data() {
        assert_matches!(parse_upload_response("  \n"), Err(PullError::NoData));
    }

    #[test]
    fn status_response_reads_status_field() {
        assert_eq!(parse_status_response(r#"{"status":"ok"}"#).unwrap(), "ok");
        assert_matches!(
            parse_status_response(r#"{"state":"ok"}"#),
            Err(PullError::DecodeFailed { .. })
        );
    }
}
