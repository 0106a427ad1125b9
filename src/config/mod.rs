use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: PathBuf,
    #[serde(default = "default_cookies_file")]
    pub cookies_file: PathBuf,
    #[serde(default = "default_quality")]
    pub default_quality: String,
    #[serde(default = "default_audio_format")]
    pub default_audio_format: String,
    #[serde(default = "default_history_file")]
    pub history_file: PathBuf,
    #[serde(default = "default_sessions_file")]
    pub sessions_file: PathBuf,
    #[serde(default = "default_logging_format")]
    pub logging_format: String,
    /// Seconds to wait before deleting a served file.
    #[serde(default = "default_serve_cleanup_delay")]
    pub serve_cleanup_delay_secs: u64,
    /// Seconds a terminal session with an attached client is kept in the
    /// registry before being retired.
    #[serde(default = "default_retire_grace")]
    pub retire_grace_secs: u64,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_downloads_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_cookies_file() -> PathBuf {
    PathBuf::from("./cookies.txt")
}

fn default_quality() -> String {
    "720p".to_string()
}

fn default_audio_format() -> String {
    "mp3".to_string()
}

fn default_history_file() -> PathBuf {
    PathBuf::from("./history.json")
}

fn default_sessions_file() -> PathBuf {
    PathBuf::from("./sessions.json")
}

fn default_logging_format() -> String {
    "json".to_string()
}

fn default_serve_cleanup_delay() -> u64 {
    10
}

fn default_retire_grace() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            downloads_dir: default_downloads_dir(),
            cookies_file: default_cookies_file(),
            default_quality: default_quality(),
            default_audio_format: default_audio_format(),
            history_file: default_history_file(),
            sessions_file: default_sessions_file(),
            logging_format: default_logging_format(),
            serve_cleanup_delay_secs: default_serve_cleanup_delay(),
            retire_grace_secs: default_retire_grace(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path))?;
        Ok(config)
    }

    pub fn get_logging_format(&self) -> &str {
        &self.logging_format
    }
}
