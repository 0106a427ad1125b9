use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref DIGITS: Regex = Regex::new(r"\d+").unwrap();
}

/// Canonical pixel height parsed from a user-facing quality string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityTarget {
    pub height: u32,
}

const DEFAULT_HEIGHT: u32 = 720;

impl QualityTarget {
    /// Parse "720p", "4K", a bare number, etc. Unrecognized strings without
    /// digits fall back to 720.
    pub fn parse(quality: &str) -> Self {
        let height = match quality.trim() {
            "144p" => 144,
            "240p" => 240,
            "360p" => 360,
            "480p" => 480,
            "720p" => 720,
            "1080p" => 1080,
            "1440p" | "2K" => 1440,
            "2160p" | "4K" => 2160,
            "8K" => 4320,
            other => DIGITS
                .find(other)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(DEFAULT_HEIGHT),
        };
        Self { height }
    }
}

impl Default for QualityTarget {
    fn default() -> Self {
        Self {
            height: DEFAULT_HEIGHT,
        }
    }
}
