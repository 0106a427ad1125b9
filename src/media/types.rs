use serde::Deserialize;
use std::path::PathBuf;

/// Metadata for a resolved media resource.
#[derive(Debug, Clone)]
pub struct MediaMetadata {
    pub title: String,
    pub id: String,
    pub thumbnail: Option<String>,
    pub duration: Option<u64>,
    pub uploader: Option<String>,
    pub webpage_url: Option<String>,
}

/// One raw format entry as reported by the extraction engine's JSON dump.
/// Only the fields consumed by the catalog normalizer are deserialized.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFormat {
    pub format_id: Option<String>,
    pub ext: Option<String>,
    pub resolution: Option<String>,
    pub height: Option<u32>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub tbr: Option<f32>,
    pub abr: Option<f32>,
    pub filesize: Option<u64>,
    pub filesize_approx: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub metadata: MediaMetadata,
    pub formats: Vec<RawFormat>,
}

/// What to fetch and where to put it; handed to the extraction engine.
#[derive(Debug, Clone)]
pub struct FetchPlan {
    pub url: String,
    /// Engine-native selector, e.g. "137+140" for a video+audio pair.
    pub format_spec: String,
    /// Output template with the engine's extension placeholder.
    pub output_template: PathBuf,
    /// Container to mux merged pairs into, when applicable.
    pub merge_container: Option<String>,
}

/// One progress callback invocation from the extraction engine.
#[derive(Debug, Clone)]
pub enum ProgressUpdate {
    Downloading {
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
        percent_str: Option<String>,
        total_str: Option<String>,
        speed_str: Option<String>,
        eta_str: Option<String>,
        fragment_index: u64,
        fragment_count: u64,
    },
    /// Stream fully received, engine is muxing/post-processing.
    Finished,
}

/// How a fetch ended when it did not fail outright. Cancellation is a
/// distinguished outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Completed,
    Cancelled,
}
