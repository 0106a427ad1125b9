mod extractor;
pub mod platform;
pub mod transcode;
pub mod types;

pub use extractor::YtDlpEngine;

use crate::engine::error::EngineError;
use async_trait::async_trait;
use platform::PlatformQuirks;
use std::path::Path;
use types::{FetchPlan, FetchStatus, MediaInfo, ProgressUpdate};

/// Seam over the external extraction engine. The worker only talks to this
/// trait, so tests can drive it with a scripted implementation.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Human-readable name of the engine
    fn name(&self) -> &'static str;

    /// Resolve a URL into metadata plus the raw stream catalog
    async fn extract(&self, url: &str, quirks: &PlatformQuirks) -> Result<MediaInfo, EngineError>;

    /// Perform the actual network fetch. Blocking by nature; the caller
    /// runs it on a dedicated blocking thread. Returning false from
    /// `on_progress` aborts the fetch with a `Cancelled` outcome.
    fn fetch(
        &self,
        plan: &FetchPlan,
        quirks: &PlatformQuirks,
        on_progress: &mut dyn FnMut(ProgressUpdate) -> bool,
    ) -> Result<FetchStatus, EngineError>;

    /// Download a thumbnail image to `dest`, returning its byte size
    async fn fetch_thumbnail(&self, thumbnail_url: &str, dest: &Path) -> Result<u64, EngineError>;

    /// Test if the engine is available on the system
    async fn test_availability(&self) -> bool;
}
