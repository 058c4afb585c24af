//! Groups the media files of an extracted result tree into collections, one
//! per directory that directly contains at least one media file.
//!
//! The catalog is built in pre-order: a directory's own collection comes
//! before the collections of its subdirectories, and subdirectories are
//! visited in name order so repeated runs over the same tree agree. Symbolic
//! links to directories are not followed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::domain::is_media_file;

/// Collection name used for media sitting directly in the root directory.
pub const ROOT_COLLECTION: &str = "root";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Item {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Collection {
    pub name: String,
    /// Location relative to the root for display, `Root` for the root itself.
    pub path: String,
    pub directory: PathBuf,
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedDir {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Catalog {
    pub collections: Vec<Collection>,
    pub skipped: Vec<SkippedDir>,
}

impl Catalog {
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    pub fn item_count(&self) -> usize {
        self.collections
            .iter()
            .map(|collection| collection.items.len())
            .sum()
    }
}

pub fn organize(root: &Path) -> Catalog {
    let mut catalog = Catalog::default();
    // Directories in the order the walk first yields them, with their media.
    let mut dirs: Vec<(PathBuf, Vec<Item>)> = Vec::new();
    let mut index: HashMap<PathBuf, usize> = HashMap::new();

    for result in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = match result {
            Ok(entry) => entry,
            Err(err) => {
                let dir = err.path().unwrap_or(root).to_path_buf();
                skip(dir, err.to_string(), &mut catalog);
                continue;
            }
        };
        if entry.file_type().is_dir() {
            index.insert(entry.path().to_path_buf(), dirs.len());
            dirs.push((entry.into_path(), Vec::new()));
            continue;
        }
        if !is_media_file(entry.path()) {
            continue;
        }
        let slot = entry
            .path()
            .parent()
            .and_then(|parent| index.get(parent).copied());
        if let Some(slot) = slot {
            dirs[slot].1.push(Item {
                name: entry.file_name().to_string_lossy().to_string(),
                path: entry.into_path(),
            });
        }
    }

    for (dir, mut items) in dirs {
        if items.is_empty() {
            continue;
        }
        items.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
        catalog.collections.push(collection(root, dir, items));
    }

    debug!(
        root = %root.display(),
        collections = catalog.collections.len(),
        items = catalog.item_count(),
        "organized"
    );
    catalog
}

fn collection(root: &Path, dir: PathBuf, items: Vec<Item>) -> Collection {
    let relative = dir.strip_prefix(root).unwrap_or(&dir);
    let is_root = relative.as_os_str().is_empty();
    let name = if is_root {
        ROOT_COLLECTION.to_string()
    } else {
        dir.file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| dir.display().to_string())
    };
    let path = if is_root {
        "Root".to_string()
    } else {
        format!("/{}", relative.to_string_lossy().replace('\\', "/"))
    };
    Collection {
        name,
        path,
        directory: dir,
        items,
    }
}

fn skip(dir: PathBuf, reason: String, catalog: &mut Catalog) {
    warn!(dir = %dir.display(), %reason, "skipping unreadable directory");
    catalog.skipped.push(SkippedDir { path: dir, reason });
}
