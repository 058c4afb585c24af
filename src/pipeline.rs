//! Job orchestration: upload, download, extract, organize, record.
//!
//! A [`Pipeline`] owns exactly one [`Job`] at a time. Commands run the
//! matching step on the calling thread (the `spawn_*` variants move it onto a
//! worker thread) while [`Pipeline::cancel`] and the readers may be used from
//! any thread. Every change to the job is published to the registered
//! [`StatusSink`]s while the job lock is held, so a sink observes snapshots in
//! the order they were made.
//!
//! Updates produced by a running step carry the generation of the job they
//! belong to. Once a job reaches a terminal state, or a newer job replaces
//! it, late updates from that step are dropped.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tempfile::Builder;
use tracing::{debug, info, warn};

use crate::archive::{ArchiveExtractor, EntryObserver};
use crate::config::ResolvedConfig;
use crate::domain::{JobState, ResultLocator};
use crate::error::{JobError, JobErrorKind, PullError};
use crate::normalize::SourceNormalizer;
use crate::organizer::{Catalog, organize};
use crate::progress::{CancelToken, ProgressFn};
use crate::store::Store;
use crate::transfer::{DownloadedArchive, TransferClient, UploadResponse};

/// Published snapshot of the current job.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Job {
    pub source: Option<PathBuf>,
    pub locator: Option<ResultLocator>,
    pub state: JobState,
    pub upload_progress: f64,
    pub download_progress: f64,
    pub status: String,
    pub error: Option<JobError>,
    pub retries: u32,
    pub catalog: Option<Catalog>,
    pub extraction_dir: Option<Utf8PathBuf>,
}

/// Receives every published job snapshot. Called with the job lock held, so
/// implementations must not call back into the pipeline.
pub trait StatusSink: Send + Sync {
    fn update(&self, job: &Job);
}

struct ChannelSink(Sender<Job>);

impl StatusSink for ChannelSink {
    fn update(&self, job: &Job) {
        let _ = self.0.send(job.clone());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            max_retries: config.max_download_retries,
            backoff: config.retry_backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Transfer {
    Upload,
    Download,
}

struct Slot {
    job: Job,
    cancel: CancelToken,
    generation: u64,
}

impl Slot {
    /// Replaces the job with a fresh one and returns its generation.
    fn renew(&mut self, job: Job) -> u64 {
        self.generation += 1;
        self.cancel = CancelToken::new();
        self.job = job;
        self.generation
    }
}

struct Inner<T, X, N> {
    transfer: T,
    extractor: X,
    normalizer: N,
    store: Store,
    retry: RetryPolicy,
    slot: Mutex<Slot>,
    sinks: Mutex<Vec<Arc<dyn StatusSink>>>,
}

pub struct Pipeline<T, X, N> {
    inner: Arc<Inner<T, X, N>>,
}

impl<T, X, N> Clone for Pipeline<T, X, N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, X, N> Pipeline<T, X, N>
where
    T: TransferClient + 'static,
    X: ArchiveExtractor + 'static,
    N: SourceNormalizer + 'static,
{
    pub fn new(transfer: T, extractor: X, normalizer: N, store: Store, retry: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                transfer,
                extractor,
                normalizer,
                store,
                retry,
                slot: Mutex::new(Slot {
                    job: Job::default(),
                    cancel: CancelToken::new(),
                    generation: 0,
                }),
                sinks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn snapshot(&self) -> Job {
        self.lock().job.clone()
    }

    pub fn add_sink(&self, sink: Arc<dyn StatusSink>) {
        self.inner
            .sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sink);
    }

    /// Channel of every snapshot published from now on.
    pub fn subscribe(&self) -> Receiver<Job> {
        let (tx, rx) = mpsc::channel();
        self.add_sink(Arc::new(ChannelSink(tx)));
        rx
    }

    /// Starts a new job for `source`, discarding the previous one. The file
    /// is normalized first; on failure the job stays idle with the error.
    pub fn select_video(&self, source: &Path) -> Result<PathBuf, PullError> {
        let generation = {
            let mut slot = self.lock();
            if slot.job.state.is_running() {
                return Err(PullError::Busy(slot.job.state));
            }
            let generation = slot.renew(Job {
                status: "Processing video...".to_string(),
                ..Job::default()
            });
            self.publish(&slot.job);
            generation
        };

        let result = if source.exists() {
            self.inner.normalizer.normalize(source)
        } else {
            Err(PullError::SourceNotFound(source.to_path_buf()))
        };

        let mut slot = self.lock();
        if slot.generation != generation || slot.job.state.is_terminal() {
            return Err(PullError::Cancelled);
        }
        match &result {
            Ok(normalized) => {
                info!(source = %normalized.display(), "video ready");
                slot.job.source = Some(normalized.clone());
                slot.job.status = "Video ready for upload".to_string();
            }
            Err(err) => {
                warn!(source = %source.display(), %err, "video rejected");
                slot.job.error = Some(JobError::from(err));
                slot.job.status = format!("Error processing video: {err}");
            }
        }
        self.publish(&slot.job);
        result
    }

    /// Starts a job from a locator obtained earlier, ready for
    /// [`Pipeline::download_and_process`].
    pub fn adopt_locator(&self, locator: ResultLocator) -> Result<(), PullError> {
        let mut slot = self.lock();
        if slot.job.state.is_running() {
            return Err(PullError::Busy(slot.job.state));
        }
        slot.renew(Job {
            locator: Some(locator),
            state: JobState::AwaitingDownload,
            status: "Ready to download results.".to_string(),
            ..Job::default()
        });
        self.publish(&slot.job);
        Ok(())
    }

    /// Uploads the selected video. Accepted when idle, or after a finished
    /// job (which restarts with the same source). Returns the state the job
    /// ended up in.
    pub fn upload(&self) -> Result<JobState, PullError> {
        let (generation, source, cancel) = {
            let mut slot = self.lock();
            let state = slot.job.state;
            if state != JobState::Idle && !state.is_terminal() {
                return Err(PullError::Busy(state));
            }
            let Some(source) = slot.job.source.clone() else {
                slot.job.status = "Please select a video first.".to_string();
                self.publish(&slot.job);
                return Err(PullError::NoSource);
            };
            if state.is_terminal() {
                slot.renew(Job {
                    source: Some(source.clone()),
                    ..Job::default()
                });
            }
            slot.job.state = JobState::Uploading;
            slot.job.upload_progress = 0.0;
            slot.job.error = None;
            slot.job.status = "Preparing upload...".to_string();
            self.publish(&slot.job);
            (slot.generation, source, slot.cancel.clone())
        };

        info!(source = %source.display(), "uploading");
        let progress = self.progress_fn(generation, Transfer::Upload);
        let result = self.inner.transfer.upload(&source, progress, &cancel);
        Ok(self.finish_upload(generation, &cancel, result))
    }

    pub fn spawn_upload(&self) -> JoinHandle<Result<JobState, PullError>> {
        let pipeline = self.clone();
        thread::spawn(move || pipeline.upload())
    }

    /// Downloads the result archive, extracts it, organizes the media and
    /// records the extraction. Returns the state the job ended up in.
    pub fn download_and_process(&self) -> Result<JobState, PullError> {
        let (generation, locator, cancel) = {
            let mut slot = self.lock();
            let state = slot.job.state;
            if state != JobState::AwaitingDownload && !state.is_terminal() {
                return Err(PullError::Busy(state));
            }
            let Some(locator) = slot.job.locator.clone() else {
                return Err(PullError::NoLocator);
            };
            if state.is_terminal() {
                let source = slot.job.source.clone();
                slot.renew(Job {
                    source,
                    locator: Some(locator.clone()),
                    upload_progress: 1.0,
                    ..Job::default()
                });
            }
            slot.job.state = JobState::Downloading;
            slot.job.download_progress = 0.0;
            slot.job.retries = 0;
            slot.job.error = None;
            slot.job.status = "Starting download...".to_string();
            self.publish(&slot.job);
            (slot.generation, locator, slot.cancel.clone())
        };

        let staging = match Builder::new().prefix("framepull-download").tempdir() {
            Ok(staging) => staging,
            Err(err) => {
                let err = PullError::Filesystem(err.to_string());
                return Ok(self.fail_step(generation, &cancel, "Download", &err, false));
            }
        };
        let destination = staging.path().join("result.zip");
        let archive = match self.download_with_retry(generation, &locator, &destination, &cancel) {
            Ok(archive) => archive,
            Err(state) => return Ok(state),
        };
        Ok(self.process_archive(generation, &archive, &cancel))
    }

    pub fn spawn_download_and_process(&self) -> JoinHandle<Result<JobState, PullError>> {
        let pipeline = self.clone();
        thread::spawn(move || pipeline.download_and_process())
    }

    /// Cancels the current job. In-flight transfers are aborted and anything
    /// they report afterwards is ignored. Returns false when the job had
    /// already finished.
    pub fn cancel(&self) -> bool {
        let mut slot = self.lock();
        let state = slot.job.state;
        if state.is_terminal() {
            return false;
        }
        slot.cancel.cancel();
        slot.job.state = JobState::Cancelled;
        slot.job.status = match state {
            JobState::Uploading => "Upload cancelled",
            JobState::Downloading => "Download cancelled",
            _ => "Cancelled",
        }
        .to_string();
        info!(from = %state, "job cancelled");
        self.publish(&slot.job);
        true
    }

    fn download_with_retry(
        &self,
        generation: u64,
        locator: &ResultLocator,
        destination: &Path,
        cancel: &CancelToken,
    ) -> Result<DownloadedArchive, JobState> {
        let policy = self.inner.retry;
        let mut attempt = 0u32;
        loop {
            let progress = self.progress_fn(generation, Transfer::Download);
            match self
                .inner
                .transfer
                .download(locator, destination, progress, cancel)
            {
                Ok(archive) => {
                    info!(bytes = archive.bytes, "download complete");
                    return Ok(archive);
                }
                Err(err)
                    if err.is_transient()
                        && attempt < policy.max_retries
                        && !cancel.is_cancelled() =>
                {
                    attempt += 1;
                    warn!(attempt, max = policy.max_retries, %err, "download failed, retrying");
                    let retrying = self.apply(generation, |job| {
                        job.retries = attempt;
                        job.status = format!(
                            "Connection lost. Retrying ({attempt}/{})...",
                            policy.max_retries
                        );
                        true
                    });
                    if !retrying || cancel.wait(policy.backoff) {
                        return Err(self.snapshot().state);
                    }
                }
                Err(err) => {
                    let exhausted = err.is_transient() && attempt >= policy.max_retries;
                    return Err(self.fail_step(generation, cancel, "Download", &err, exhausted));
                }
            }
        }
    }

    fn process_archive(
        &self,
        generation: u64,
        archive: &DownloadedArchive,
        cancel: &CancelToken,
    ) -> JobState {
        let extracting = self.apply(generation, |job| {
            job.download_progress = 1.0;
            job.state = JobState::Extracting;
            job.status = "Extracting files...".to_string();
            true
        });
        if !extracting {
            return self.snapshot().state;
        }

        if let Err(err) = self.inner.store.prune() {
            warn!(%err, "failed to prune old extractions");
        }
        let dir = match self.inner.store.create_extraction_dir() {
            Ok(dir) => dir,
            Err(err) => return self.fail_step(generation, cancel, "Extraction", &err, false),
        };

        let observer: EntryObserver<'_> = &|done: usize, total: usize| {
            debug!(done, total, "extracting");
        };
        if let Err(err) = self
            .inner
            .extractor
            .extract(&archive.path, dir.as_std_path(), Some(observer))
        {
            warn!(%err, "extraction failed");
            discard(&dir);
            return self.conclude(generation, cancel, JobError::from(&err), "Failed to extract files");
        }

        let organizing = !cancel.is_cancelled()
            && self.apply(generation, |job| {
                job.state = JobState::Organizing;
                job.status = "Organizing images...".to_string();
                true
            });
        if !organizing {
            discard(&dir);
            return self.snapshot().state;
        }

        let catalog = organize(dir.as_std_path());
        if catalog.is_empty() {
            discard(&dir);
            return self.conclude(
                generation,
                cancel,
                JobError::from(&PullError::NoMediaFound),
                "No images found in the archive",
            );
        }

        let mut slot = self.lock();
        if slot.generation != generation || slot.job.state.is_terminal() {
            discard(&dir);
            return slot.job.state;
        }
        match self.inner.store.record(&dir) {
            Ok(_) => {
                let images = catalog.item_count();
                let folders = catalog.collections.len();
                info!(images, folders, dir = %dir, "job complete");
                slot.job.status = format!("Success! Found {images} images in {folders} folders");
                slot.job.state = JobState::Complete;
                slot.job.catalog = Some(catalog);
                slot.job.extraction_dir = Some(dir);
            }
            Err(err) => {
                discard(&dir);
                mark_failed(&mut slot.job, JobError::from(&err), format!("Saving results failed: {err}"));
            }
        }
        self.publish(&slot.job);
        slot.job.state
    }

    fn finish_upload(
        &self,
        generation: u64,
        cancel: &CancelToken,
        result: Result<UploadResponse, PullError>,
    ) -> JobState {
        let result = result.and_then(|response| {
            let locator = response.locator()?;
            Ok((response, locator))
        });
        match result {
            Ok((response, locator)) => {
                let mut slot = self.lock();
                if slot.generation != generation || slot.job.state.is_terminal() {
                    return slot.job.state;
                }
                info!(
                    locator = %locator,
                    message = %response.message,
                    processing_time = %response.processing_time,
                    "upload complete"
                );
                slot.job.locator = Some(locator);
                slot.job.upload_progress = 1.0;
                slot.job.state = JobState::AwaitingDownload;
                slot.job.status = "Upload successful! Ready to download results.".to_string();
                self.publish(&slot.job);
                slot.job.state
            }
            Err(err) => self.fail_step(generation, cancel, "Upload", &err, false),
        }
    }

    fn fail_step(
        &self,
        generation: u64,
        cancel: &CancelToken,
        phase: &str,
        err: &PullError,
        exhausted: bool,
    ) -> JobState {
        if let PullError::DecodeFailed { body, .. } = err {
            debug!(%body, "undecodable response body");
        }
        let suffix = if exhausted { " (Max retries reached)" } else { "" };
        self.conclude(
            generation,
            cancel,
            JobError::from(err),
            &format!("{phase} failed: {err}{suffix}"),
        )
    }

    /// Moves the job to `Failed`, or to `Cancelled` if cancellation was
    /// requested, unless it already left the running states.
    fn conclude(
        &self,
        generation: u64,
        cancel: &CancelToken,
        error: JobError,
        status: &str,
    ) -> JobState {
        let mut slot = self.lock();
        if slot.generation != generation || slot.job.state.is_terminal() {
            return slot.job.state;
        }
        if cancel.is_cancelled() || error.kind == JobErrorKind::Cancelled {
            slot.job.state = JobState::Cancelled;
            slot.job.status = "Cancelled".to_string();
        } else {
            warn!(kind = ?error.kind, %status, "job failed");
            mark_failed(&mut slot.job, error, status.to_string());
        }
        self.publish(&slot.job);
        slot.job.state
    }

    fn progress_fn(&self, generation: u64, transfer: Transfer) -> ProgressFn {
        let pipeline = self.clone();
        Arc::new(move |fraction: f64| {
            pipeline.apply(generation, |job| {
                let percent = (fraction * 100.0) as u32;
                match (transfer, job.state) {
                    (Transfer::Upload, JobState::Uploading) => {
                        job.upload_progress = job.upload_progress.max(fraction);
                        job.status = format!("Uploading... {percent}%");
                        true
                    }
                    (Transfer::Download, JobState::Downloading) => {
                        job.download_progress = job.download_progress.max(fraction);
                        job.status = format!("Downloading... {percent}%");
                        true
                    }
                    _ => false,
                }
            });
        })
    }

    /// Applies `update` to the job of `generation` if it is still live and
    /// publishes the result when `update` reports a change.
    fn apply(&self, generation: u64, update: impl FnOnce(&mut Job) -> bool) -> bool {
        let mut slot = self.lock();
        if slot.generation != generation || slot.job.state.is_terminal() {
            return false;
        }
        if update(&mut slot.job) {
            self.publish(&slot.job);
        }
        true
    }

    fn publish(&self, job: &Job) {
        let sinks = self
            .inner
            .sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for sink in sinks.iter() {
            sink.update(job);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn mark_failed(job: &mut Job, error: JobError, status: String) {
    job.state = JobState::Failed;
    job.error = Some(error);
    job.status = status;
}

fn discard(dir: &Utf8Path) {
    if let Err(err) = fs::remove_dir_all(dir.as_std_path()) {
        warn!(dir = %dir, %err, "failed to remove extraction directory");
    }
}
