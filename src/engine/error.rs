use thiserror::Error;

/// Failures that terminate a download session. Each maps to a terminal
/// `error` status plus a best-effort client notification; none of them are
/// allowed to take the serving process down. Cancellation is deliberately
/// not represented here, it is a `FetchStatus` outcome.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The extraction engine could not resolve the URL (bad link, geo-block,
    /// private content).
    #[error("Extraction failed: {0}")]
    Extraction(String),

    /// The extraction engine failed mid-fetch.
    #[error("Download failed: {0}")]
    Download(String),

    /// The selector found no usable candidate in the catalog.
    #[error("No suitable format found for this request")]
    FormatNotFound,

    /// The external encoder exited non-zero.
    #[error("Transcoding failed with {status}")]
    Transcode {
        status: std::process::ExitStatus,
        stderr: String,
    },

    /// The expected output file is missing after the fetch, even after the
    /// fallback extension probe.
    #[error("Downloaded file not found for {0}")]
    OutputMissing(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
