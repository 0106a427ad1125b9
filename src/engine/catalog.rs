//! Normalizes the extraction engine's raw format dump into a uniform
//! catalog the selector can score.

use crate::media::types::RawFormat;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref RESOLUTION: Regex = Regex::new(r"(\d+)x(\d+)").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecFamily {
    H264,
    Hevc,
    Vp9,
    Av1,
    Other,
}

impl CodecFamily {
    pub fn from_codec(codec: &str) -> Self {
        let lower = codec.to_lowercase();
        if lower.starts_with("avc") || lower.starts_with("h264") {
            CodecFamily::H264
        } else if lower.starts_with("hev") || lower.starts_with("hvc") || lower.starts_with("h265")
        {
            CodecFamily::Hevc
        } else if lower.starts_with("vp9") || lower.starts_with("vp09") {
            CodecFamily::Vp9
        } else if lower.starts_with("av01") || lower.starts_with("av1") {
            CodecFamily::Av1
        } else {
            CodecFamily::Other
        }
    }
}

/// One candidate stream in uniform shape. Immutable, rebuilt per catalog
/// fetch.
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    /// Opaque selector token understood by the extraction engine.
    pub id: String,
    pub container: String,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub height: Option<u32>,
    /// Total bitrate in kbps.
    pub bitrate: Option<f32>,
    pub size_bytes: Option<u64>,
}

impl StreamDescriptor {
    pub fn has_video(&self) -> bool {
        self.video_codec.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio_codec.is_some()
    }

    pub fn video_family(&self) -> Option<CodecFamily> {
        self.video_codec.as_deref().map(CodecFamily::from_codec)
    }
}

/// The engine reports absent codecs as the literal string "none".
fn real_codec(codec: &Option<String>) -> Option<String> {
    codec
        .as_deref()
        .filter(|c| !c.is_empty() && *c != "none")
        .map(|c| c.to_string())
}

/// Build the catalog from a raw format dump. Entries without a selector
/// token are unusable and skipped.
pub fn normalize(formats: &[RawFormat]) -> Vec<StreamDescriptor> {
    formats
        .iter()
        .filter_map(|fmt| {
            let id = fmt.format_id.clone()?;

            let height = fmt.height.or_else(|| {
                fmt.resolution.as_deref().and_then(|res| {
                    RESOLUTION
                        .captures(res)
                        .and_then(|caps| caps.get(2)?.as_str().parse().ok())
                })
            });

            Some(StreamDescriptor {
                id,
                container: fmt.ext.clone().unwrap_or_default(),
                video_codec: real_codec(&fmt.vcodec),
                audio_codec: real_codec(&fmt.acodec),
                height,
                bitrate: fmt.tbr.or(fmt.abr),
                size_bytes: fmt.filesize.or(fmt.filesize_approx),
            })
        })
        .collect()
}
