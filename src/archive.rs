use std::fs;
use std::io;
use std::path::Path;

use tracing::debug;
use zip::ZipArchive;

use crate::error::PullError;

/// Receives `(entries_done, entries_total)` after each archive entry.
pub type EntryObserver<'a> = &'a dyn Fn(usize, usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractSummary {
    pub entries: usize,
    pub files: usize,
}

pub trait ArchiveExtractor: Send + Sync {
    /// Extracts every entry of `archive` below `destination`, creating the
    /// destination first. Existing content is left in place.
    fn extract(
        &self,
        archive: &Path,
        destination: &Path,
        observer: Option<EntryObserver<'_>>,
    ) -> Result<ExtractSummary, PullError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ZipExtractor;

impl ArchiveExtractor for ZipExtractor {
    fn extract(
        &self,
        archive: &Path,
        destination: &Path,
        observer: Option<EntryObserver<'_>>,
    ) -> Result<ExtractSummary, PullError> {
        fs::create_dir_all(destination).map_err(|err| {
            PullError::ExtractionIo(format!("create {}: {err}", destination.display()))
        })?;

        let file = fs::File::open(archive).map_err(|err| {
            PullError::ExtractionIo(format!("open zip {}: {err}", archive.display()))
        })?;
        let mut zip =
            ZipArchive::new(file).map_err(|err| PullError::CorruptArchive(err.to_string()))?;

        let total = zip.len();
        let mut files = 0usize;
        for i in 0..total {
            let mut entry = zip
                .by_index(i)
                .map_err(|err| PullError::CorruptArchive(err.to_string()))?;
            let entry_path = match entry.enclosed_name() {
                Some(path) => destination.join(path),
                None => {
                    return Err(PullError::CorruptArchive(format!(
                        "entry {} escapes the destination",
                        entry.name()
                    )));
                }
            };

            if entry.is_dir() {
                fs::create_dir_all(&entry_path)
                    .map_err(|err| PullError::ExtractionIo(err.to_string()))?;
            } else {
                if let Some(parent) = entry_path.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|err| PullError::ExtractionIo(err.to_string()))?;
                }
                let mut outfile = fs::File::create(&entry_path)
                    .map_err(|err| PullError::ExtractionIo(err.to_string()))?;
                io::copy(&mut entry, &mut outfile).map_err(|err| match err.kind() {
                    io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
                        PullError::CorruptArchive(format!("{}: {err}", entry_path.display()))
                    }
                    _ => PullError::ExtractionIo(format!("{}: {err}", entry_path.display())),
                })?;
                files += 1;
            }

            debug!(entry = i + 1, total, path = %entry_path.display(), "extracted");
            if let Some(observer) = observer {
                observer(i + 1, total);
            }
        }

        Ok(ExtractSummary {
            entries: total,
            files,
        })
    }
}
