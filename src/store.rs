use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use tempfile::Builder;
use tracing::{info, warn};

use crate::error::PullError;

pub const INDEX_FILE: &str = "extractions.json";
pub const EXTRACTION_PREFIX: &str = "ExtractedImages_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub path: Utf8PathBuf,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Index {
    #[serde(default)]
    extractions: Vec<ExtractionRecord>,
}

/// Append-only catalog of extracted result directories, pruned to the most
/// recent `retention` entries.
///
/// Only the pipeline mutates the index and it runs one job at a time, so the
/// index file is not locked.
#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
    retention: usize,
}

impl Store {
    pub fn new(retention: usize) -> Result<Self, PullError> {
        let root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.data_local_dir().join("framepull")).ok()
            })
            .ok_or_else(|| PullError::Filesystem("unable to resolve data directory".to_string()))?;
        Ok(Self::new_with_root(root, retention))
    }

    pub fn new_with_root(root: Utf8PathBuf, retention: usize) -> Self {
        Self {
            root,
            retention: retention.max(1),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn index_path(&self) -> Utf8PathBuf {
        self.root.join(INDEX_FILE)
    }

    pub fn ensure_root(&self) -> Result<(), PullError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| PullError::Filesystem(err.to_string()))
    }

    /// Creates a fresh, uniquely named directory to extract one archive into.
    pub fn create_extraction_dir(&self) -> Result<Utf8PathBuf, PullError> {
        self.ensure_root()?;
        let dir = Builder::new()
            .prefix(EXTRACTION_PREFIX)
            .rand_bytes(8)
            .tempdir_in(self.root.as_std_path())
            .map_err(|err| PullError::Filesystem(err.to_string()))?
            .keep();
        Utf8PathBuf::from_path_buf(dir)
            .map_err(|_| PullError::Filesystem("invalid extraction path".to_string()))
    }

    pub fn record(&self, path: &Utf8Path) -> Result<ExtractionRecord, PullError> {
        let mut index = self.read_index()?;
        let record = ExtractionRecord {
            path: path.to_path_buf(),
            created_at: Utc::now(),
        };
        index.extractions.push(record.clone());
        self.write_index(&index)?;
        info!(path = %path, "recorded extraction");
        Ok(record)
    }

    /// Recorded extractions that still exist on disk, newest first.
    pub fn list(&self) -> Result<Vec<ExtractionRecord>, PullError> {
        let index = self.read_index()?;
        Ok(newest_first(index.extractions)
            .into_iter()
            .filter(|record| record.path.as_std_path().exists())
            .collect())
    }

    /// Deletes every existing extraction beyond the newest `retention` and
    /// drops them, along with entries already gone from disk, from the index.
    /// Entries that could not be deleted stay in the index. Returns the
    /// removed paths.
    pub fn prune(&self) -> Result<Vec<Utf8PathBuf>, PullError> {
        let index = self.read_index()?;
        let total = index.extractions.len();
        let mut ordered: Vec<_> = newest_first(index.extractions)
            .into_iter()
            .filter(|record| record.path.as_std_path().exists())
            .collect();
        if ordered.len() <= self.retention {
            if ordered.len() < total {
                ordered.reverse();
                self.write_index(&Index {
                    extractions: ordered,
                })?;
            }
            return Ok(Vec::new());
        }
        let stale = ordered.split_off(self.retention);

        let mut removed = Vec::new();
        for record in stale {
            match fs::remove_dir_all(record.path.as_std_path()) {
                Ok(()) => removed.push(record.path),
                Err(err) => {
                    // Stays indexed so the next prune retries it.
                    warn!(path = %record.path, %err, "failed to remove old extraction");
                    ordered.push(record);
                }
            }
        }

        ordered.reverse();
        self.write_index(&Index {
            extractions: ordered,
        })?;
        info!(removed = removed.len(), kept = self.retention, "pruned extractions");
        Ok(removed)
    }

    fn read_index(&self) -> Result<Index, PullError> {
        let path = self.index_path();
        if !path.as_std_path().exists() {
            return Ok(Index::default());
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| PullError::Filesystem(format!("read {path}: {err}")))?;
        match serde_json::from_str(&content) {
            Ok(index) => Ok(index),
            Err(err) => {
                warn!(path = %path, %err, "unreadable extraction index, starting a new one");
                Ok(Index::default())
            }
        }
    }

    fn write_index(&self, index: &Index) -> Result<(), PullError> {
        let content = serde_json::to_vec_pretty(index)
            .map_err(|err| PullError::Filesystem(err.to_string()))?;
        Self::write_bytes_atomic(&self.index_path(), &content)
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), PullError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| PullError::Filesystem(err.to_string()))?;
        }
        let tmp_path = path.with_extension("tmp");
        fs::write(tmp_path.as_std_path(), content)
            .map_err(|err| PullError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| PullError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

/// Later entries win ties, matching the order they were appended in.
fn newest_first(records: Vec<ExtractionRecord>) -> Vec<ExtractionRecord> {
    let mut ordered: Vec<_> = records.into_iter().rev().collect();
    ordered.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    ordered
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn record(path: &str, secs: i64) -> ExtractionRecord {
        ExtractionRecord {
            path: Utf8PathBuf::from(path),
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn newest_first_breaks_ties_by_insertion() {
        let ordered = newest_first(vec![record("a", 10), record("b", 20), record("c", 20)]);
        let paths: Vec<_> = ordered.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["c", "b", "a"]);
    }
}
