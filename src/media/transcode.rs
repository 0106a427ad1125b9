use crate::engine::error::EngineError;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info};

/// Convert a fetched audio stream into the requested output format at a
/// fixed quality. Blocking; run on a blocking thread. The target codec is
/// inferred by ffmpeg from the output extension.
pub fn convert_audio(input: &Path, output: &Path, bitrate_kbps: u32) -> Result<(), EngineError> {
    info!(
        "Converting {} -> {} at {}k",
        input.display(),
        output.display(),
        bitrate_kbps
    );

    let result = Command::new("ffmpeg")
        .arg("-i")
        .arg(input)
        .arg("-vn")
        .arg("-b:a")
        .arg(format!("{}k", bitrate_kbps))
        .arg("-y")
        .arg(output)
        .output()?;

    if !result.status.success() {
        return Err(EngineError::Transcode {
            status: result.status,
            stderr: String::from_utf8_lossy(&result.stderr).to_string(),
        });
    }

    debug!("Conversion finished for {}", output.display());
    Ok(())
}
