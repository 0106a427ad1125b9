use crate::engine::catalog::CodecFamily;
use url::Url;

/// Platforms with known extraction quirks. Everything else goes through the
/// extraction engine with stock options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Youtube,
    TikTok,
    Twitter,
    Instagram,
    Facebook,
    Reddit,
    Vimeo,
    Dailymotion,
    Unknown,
}

/// Typed per-platform adjustments merged into the extraction request.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformQuirks {
    /// Extra `--extractor-args` value for the extraction engine.
    pub extractor_args: Option<&'static str>,
    /// User-Agent override for platforms that gate their public API.
    pub user_agent: Option<&'static str>,
    /// Codec family known to break downstream muxing on this platform.
    /// The selector drops these candidates unless nothing else is left.
    pub excluded_video_codec: Option<CodecFamily>,
}

impl Platform {
    pub fn detect(url: &str) -> Self {
        let domain = match Url::parse(url) {
            Ok(parsed) => match parsed.host_str() {
                Some(host) => host.to_lowercase(),
                None => return Platform::Unknown,
            },
            Err(_) => return Platform::Unknown,
        };

        if domain.contains("youtube.com") || domain.contains("youtu.be") {
            Platform::Youtube
        } else if domain.contains("tiktok.com") {
            Platform::TikTok
        } else if domain.contains("twitter.com") || domain.contains("x.com") {
            Platform::Twitter
        } else if domain.contains("instagram.com") {
            Platform::Instagram
        } else if domain.contains("facebook.com") || domain.contains("fb.watch") {
            Platform::Facebook
        } else if domain.contains("reddit.com") {
            Platform::Reddit
        } else if domain.contains("vimeo.com") {
            Platform::Vimeo
        } else if domain.contains("dailymotion.com") {
            Platform::Dailymotion
        } else {
            Platform::Unknown
        }
    }

    pub fn quirks(&self) -> PlatformQuirks {
        match self {
            Platform::TikTok => PlatformQuirks {
                extractor_args: Some("tiktok:api_hostname=api22-normal-c-useast2a.tiktokv.com"),
                user_agent: None,
                // TikTok serves HEVC variants that ffmpeg refuses to mux
                // into mp4 alongside its audio streams.
                excluded_video_codec: Some(CodecFamily::Hevc),
            },
            Platform::Instagram => PlatformQuirks {
                extractor_args: None,
                user_agent: Some(
                    "Mozilla/5.0 (iPhone; CPU iPhone OS 16_0 like Mac OS X) AppleWebKit/605.1.15",
                ),
                excluded_video_codec: None,
            },
            _ => PlatformQuirks::default(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Platform::Youtube => "youtube",
            Platform::TikTok => "tiktok",
            Platform::Twitter => "twitter",
            Platform::Instagram => "instagram",
            Platform::Facebook => "facebook",
            Platform::Reddit => "reddit",
            Platform::Vimeo => "vimeo",
            Platform::Dailymotion => "dailymotion",
            Platform::Unknown => "unknown",
        }
    }
}
