use super::platform::PlatformQuirks;
use super::types::{FetchPlan, FetchStatus, MediaInfo, MediaMetadata, ProgressUpdate, RawFormat};
use super::MediaEngine;
use crate::engine::error::EngineError;
use async_trait::async_trait;
use serde_json::Value;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

/// Marker prefix so progress lines can be told apart from the engine's
/// other stdout chatter.
const PROGRESS_PREFIX: &str = "fetchd";

/// Line-oriented template handed to the engine; fields arrive pipe-separated
/// with "NA" for anything unknown.
const PROGRESS_TEMPLATE: &str = concat!(
    "download:fetchd|%(progress.downloaded_bytes)s|%(progress.total_bytes)s",
    "|%(progress.total_bytes_estimate)s|%(progress._percent_str)s",
    "|%(progress._total_bytes_str)s|%(progress._speed_str)s|%(progress._eta_str)s",
    "|%(progress.fragment_index)s|%(progress.fragment_count)s"
);

pub struct YtDlpEngine {
    cookies_file: Option<PathBuf>,
}

impl YtDlpEngine {
    pub fn new(cookies_file: &Path) -> Self {
        let cookies_file = if cookies_file.exists() {
            info!("Loaded cookies from {}", cookies_file.display());
            Some(cookies_file.to_path_buf())
        } else {
            warn!("No cookies file found at {}", cookies_file.display());
            None
        };
        Self { cookies_file }
    }

    fn apply_common_args(&self, cmd: &mut Command, quirks: &PlatformQuirks) {
        cmd.arg("--no-warnings").arg("--no-playlist");
        if let Some(cookies) = &self.cookies_file {
            cmd.arg("--cookies").arg(cookies);
        }
        if let Some(args) = quirks.extractor_args {
            cmd.arg("--extractor-args").arg(args);
        }
        if let Some(user_agent) = quirks.user_agent {
            cmd.arg("--user-agent").arg(user_agent);
        }
    }
}

fn parse_field(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "NA" || trimmed == "None" {
        None
    } else {
        Some(trimmed)
    }
}

fn parse_u64(raw: &str) -> Option<u64> {
    // The engine formats byte counters as floats for estimates.
    parse_field(raw).and_then(|s| s.parse::<f64>().ok().map(|v| v as u64))
}

/// Parse one progress template line, minus the marker prefix.
fn parse_progress_line(line: &str) -> Option<ProgressUpdate> {
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() != 10 || fields[0] != PROGRESS_PREFIX {
        return None;
    }

    let downloaded_bytes = parse_u64(fields[1]).unwrap_or(0);
    let total_bytes = parse_u64(fields[2]).or_else(|| parse_u64(fields[3]));

    Some(ProgressUpdate::Downloading {
        downloaded_bytes,
        total_bytes,
        percent_str: parse_field(fields[4]).map(|s| s.to_string()),
        total_str: parse_field(fields[5]).map(|s| s.to_string()),
        speed_str: parse_field(fields[6]).map(|s| s.to_string()),
        eta_str: parse_field(fields[7]).map(|s| s.to_string()),
        fragment_index: parse_u64(fields[8]).unwrap_or(0),
        fragment_count: parse_u64(fields[9]).unwrap_or(0),
    })
}

#[async_trait]
impl MediaEngine for YtDlpEngine {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn extract(&self, url: &str, quirks: &PlatformQuirks) -> Result<MediaInfo, EngineError> {
        debug!("Extracting metadata with yt-dlp for: {}", url);

        let mut cmd = tokio::process::Command::new("yt-dlp");
        cmd.arg("--dump-json").arg("--no-download");
        if let Some(cookies) = &self.cookies_file {
            cmd.arg("--cookies").arg(cookies);
        }
        cmd.arg("--no-warnings").arg("--no-playlist");
        if let Some(args) = quirks.extractor_args {
            cmd.arg("--extractor-args").arg(args);
        }
        if let Some(user_agent) = quirks.user_agent {
            cmd.arg("--user-agent").arg(user_agent);
        }
        cmd.arg(url);

        let output = tokio::time::timeout(std::time::Duration::from_secs(30), cmd.output())
            .await
            .map_err(|_| EngineError::Extraction("Metadata extraction timed out".to_string()))?
            .map_err(|e| EngineError::Extraction(e.to_string()))?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(EngineError::Extraction(error));
        }

        let json: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| EngineError::Extraction(format!("Unparseable metadata: {}", e)))?;

        let formats: Vec<RawFormat> = json
            .get("formats")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| EngineError::Extraction(format!("Unparseable format list: {}", e)))?
            .unwrap_or_default();

        Ok(MediaInfo {
            metadata: MediaMetadata {
                title: json["title"].as_str().unwrap_or("video").to_string(),
                id: json["id"].as_str().unwrap_or("video").to_string(),
                thumbnail: json["thumbnail"].as_str().map(|s| s.to_string()),
                duration: json["duration"].as_f64().map(|d| d as u64),
                uploader: json["uploader"]
                    .as_str()
                    .or_else(|| json["creator"].as_str())
                    .map(|s| s.to_string()),
                webpage_url: json["webpage_url"].as_str().map(|s| s.to_string()),
            },
            formats,
        })
    }

    /// Blocking fetch; call from a dedicated blocking thread. `on_progress`
    /// is invoked per progress line and aborts the fetch by returning false.
    fn fetch(
        &self,
        plan: &FetchPlan,
        quirks: &PlatformQuirks,
        on_progress: &mut dyn FnMut(ProgressUpdate) -> bool,
    ) -> Result<FetchStatus, EngineError> {
        info!("Fetching {} as {}", plan.url, plan.format_spec);

        let mut cmd = Command::new("yt-dlp");
        self.apply_common_args(&mut cmd, quirks);
        cmd.arg("--newline")
            .arg("--progress-template")
            .arg(PROGRESS_TEMPLATE)
            .arg("--format")
            .arg(&plan.format_spec)
            .arg("--output")
            .arg(&plan.output_template);
        if let Some(container) = &plan.merge_container {
            cmd.arg("--merge-output-format").arg(container);
        }
        cmd.arg(&plan.url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null());

        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::Download(format!("Failed to start yt-dlp: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Download("No stdout from yt-dlp".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Download("No stderr from yt-dlp".to_string()))?;

        // Drain stderr on the side so a chatty engine cannot stall the pipe.
        let stderr_reader = std::thread::spawn(move || {
            let mut buf = String::new();
            let _ = BufReader::new(stderr).read_to_string(&mut buf);
            buf
        });

        for line in BufReader::new(stdout).lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!("Lost yt-dlp output stream: {}", e);
                    break;
                }
            };
            let Some(update) = parse_progress_line(&line) else {
                continue;
            };
            if !on_progress(update) {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(FetchStatus::Cancelled);
            }
        }

        let status = child.wait()?;
        let stderr_output = stderr_reader.join().unwrap_or_default();

        if !status.success() {
            return Err(EngineError::Download(stderr_output.trim().to_string()));
        }

        on_progress(ProgressUpdate::Finished);
        Ok(FetchStatus::Completed)
    }

    async fn fetch_thumbnail(&self, thumbnail_url: &str, dest: &Path) -> Result<u64, EngineError> {
        let response = reqwest::get(thumbnail_url)
            .await
            .map_err(|e| EngineError::Download(e.to_string()))?;
        if !response.status().is_success() {
            return Err(EngineError::Download(format!(
                "Thumbnail fetch returned {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| EngineError::Download(e.to_string()))?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(bytes.len() as u64)
    }

    async fn test_availability(&self) -> bool {
        let yt_dlp_available = match tokio::process::Command::new("yt-dlp")
            .arg("--version")
            .output()
            .await
        {
            Ok(output) => {
                if output.status.success() {
                    let version = String::from_utf8_lossy(&output.stdout);
                    info!("yt-dlp is available, version: {}", version.trim());
                    true
                } else {
                    warn!("yt-dlp command failed");
                    false
                }
            }
            Err(e) => {
                warn!("yt-dlp not found: {}", e);
                false
            }
        };

        let ffmpeg_available = match tokio::process::Command::new("ffmpeg")
            .arg("-version")
            .output()
            .await
        {
            Ok(output) => output.status.success(),
            Err(e) => {
                warn!(
                    "ffmpeg not found: {} (required for merging and audio conversion)",
                    e
                );
                false
            }
        };

        if yt_dlp_available && !ffmpeg_available {
            warn!("yt-dlp will work but merging/audio conversion will fail");
        }

        yt_dlp_available
    }
}
