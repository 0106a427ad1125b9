use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref UNSAFE_CHARS: Regex = Regex::new(r#"[\\/*?:"<>|｜]"#).unwrap();
    static ref ANSI_ESCAPE: Regex = Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").unwrap();
}

/// Sanitize a media title into a filesystem-safe base filename.
pub fn clean_filename(name: &str) -> String {
    let cleaned = UNSAFE_CHARS.replace_all(name, "_");
    let trimmed = cleaned.trim();
    trimmed.chars().take(200).collect()
}

/// Strip terminal control sequences from display strings (yt-dlp colors its
/// speed/eta output when it thinks it is attached to a tty).
pub fn strip_ansi(s: &str) -> String {
    ANSI_ESCAPE.replace_all(s, "").trim().to_string()
}

pub fn format_size(bytes: u64) -> String {
    let mb = bytes as f64 / 1_048_576.0;
    if mb >= 1024.0 {
        format!("{:.1} GB", mb / 1024.0)
    } else {
        format!("{:.1} MB", mb)
    }
}
