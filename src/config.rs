use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::PullError;

pub const CONFIG_FILE: &str = "framepull.json";
pub const BASE_URL_ENV: &str = "FRAMEPULL_BASE_URL";
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub upload_timeout_secs: Option<u64>,
    #[serde(default)]
    pub download_timeout_secs: Option<u64>,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_download_retries: Option<u32>,
    #[serde(default)]
    pub retry_backoff_ms: Option<u64>,
    #[serde(default)]
    pub retention: Option<usize>,
    #[serde(default)]
    pub data_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub base_url: Url,
    pub upload_timeout: Duration,
    pub download_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_download_retries: u32,
    pub retry_backoff: Duration,
    pub retention: usize,
    pub data_dir: Option<Utf8PathBuf>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `framepull.json` from the current directory when it
    /// exists, then applies the base URL override from the environment.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, PullError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(CONFIG_FILE),
        };

        let config = if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .map_err(|_| PullError::ConfigRead(config_path.clone()))?;
            serde_json::from_str(&content).map_err(|err| PullError::ConfigParse(err.to_string()))?
        } else if path.is_some() {
            return Err(PullError::MissingConfig(config_path));
        } else {
            Config::default()
        };

        let mut resolved = Self::resolve_config(config)?;
        if let Ok(value) = std::env::var(BASE_URL_ENV) {
            if !value.trim().is_empty() {
                resolved.base_url = parse_base_url(value.trim())?;
            }
        }
        Ok(resolved)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, PullError> {
        let base_url = parse_base_url(config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL))?;

        let retention = config.retention.unwrap_or(2);
        if retention == 0 {
            return Err(PullError::ConfigValue(
                "retention must keep at least one extraction".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            base_url,
            upload_timeout: Duration::from_secs(config.upload_timeout_secs.unwrap_or(600)),
            download_timeout: Duration::from_secs(config.download_timeout_secs.unwrap_or(600)),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs.unwrap_or(60)),
            max_download_retries: config.max_download_retries.unwrap_or(3),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms.unwrap_or(2000)),
            retention,
            data_dir: config.data_dir.map(Utf8PathBuf::from),
        })
    }
}

fn parse_base_url(value: &str) -> Result<Url, PullError> {
    let url = Url::parse(value)
        .map_err(|err| PullError::ConfigValue(format!("base_url {value}: {err}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(PullError::ConfigValue(format!(
            "base_url must be http or https, got {other}"
        ))),
    }
}
