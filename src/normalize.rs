use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::Builder;
use tracing::info;

use crate::error::PullError;

/// Turns a picked video into a file the server accepts (an MP4 container).
pub trait SourceNormalizer: Send + Sync {
    fn normalize(&self, source: &Path) -> Result<PathBuf, PullError>;
}

/// Passes MP4 files through and remuxes anything else with `ffmpeg` when it
/// is on `PATH`.
#[derive(Clone)]
pub struct SystemNormalizer {
    ffmpeg: Option<PathBuf>,
}

impl SystemNormalizer {
    pub fn new() -> Self {
        Self {
            ffmpeg: find_in_path("ffmpeg"),
        }
    }

    fn convert(&self, source: &Path) -> Result<PathBuf, PullError> {
        let ffmpeg = self
            .ffmpeg
            .as_ref()
            .ok_or_else(|| PullError::MissingTool("ffmpeg".to_string()))?;
        let stem = source
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "video".to_string());
        let (_, output) = Builder::new()
            .prefix(&format!("{stem}_"))
            .suffix(".mp4")
            .tempfile()
            .map_err(|err| PullError::Filesystem(err.to_string()))?
            .keep()
            .map_err(|err| PullError::Filesystem(err.to_string()))?;

        info!(source = %source.display(), output = %output.display(), "converting to mp4");
        let result = Command::new(ffmpeg)
            .arg("-y")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(source)
            .arg("-c:v")
            .arg("libx264")
            .arg("-c:a")
            .arg("aac")
            .arg("-movflags")
            .arg("+faststart")
            .arg(&output)
            .output()
            .map_err(|err| PullError::Conversion(err.to_string()));
        let output_status = match result {
            Ok(status) => status,
            Err(err) => {
                let _ = std::fs::remove_file(&output);
                return Err(err);
            }
        };
        if output_status.status.success() {
            return Ok(output);
        }
        let _ = std::fs::remove_file(&output);
        let stderr = String::from_utf8_lossy(&output_status.stderr)
            .trim()
            .to_string();
        Err(PullError::Conversion(if stderr.is_empty() {
            format!("ffmpeg exited with {}", output_status.status)
        } else {
            stderr
        }))
    }
}

impl Default for SystemNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceNormalizer for SystemNormalizer {
    fn normalize(&self, source: &Path) -> Result<PathBuf, PullError> {
        if !source.is_file() {
            return Err(PullError::SourceNotFound(source.to_path_buf()));
        }
        if is_mp4(source) {
            return Ok(source.to_path_buf());
        }
        self.convert(source)
    }
}

/// Accepts any existing file unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughNormalizer;

impl SourceNormalizer for PassthroughNormalizer {
    fn normalize(&self, source: &Path) -> Result<PathBuf, PullError> {
        if !source.is_file() {
            return Err(PullError::SourceNotFound(source.to_path_buf()));
        }
        Ok(source.to_path_buf())
    }
}

fn is_mp4(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("mp4"))
        .unwrap_or(false)
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}
