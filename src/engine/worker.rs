//! One worker per active download session. The worker owns the blocking
//! fetch; the attached client connection is only ever an observer, so the
//! worker runs to a terminal state whether or not anyone is watching.

use super::catalog;
use super::error::EngineError;
use super::quality::QualityTarget;
use super::registry::{SessionEntry, SessionRegistry};
use super::relay::{self, ClientMessage};
use super::selector::{self, Selection, StreamKind};
use super::session::{ContentKind, SessionStatus};
use crate::config::Config;
use crate::history::{HistoryRecord, HistoryStore};
use crate::media::platform::{Platform, PlatformQuirks};
use crate::media::transcode;
use crate::media::types::{FetchPlan, FetchStatus};
use crate::media::MediaEngine;
use crate::utils::{clean_filename, format_size};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

const FALLBACK_EXTENSIONS: [&str; 6] = ["mp4", "webm", "mkv", "mp3", "m4a", "opus"];
const AUDIO_BITRATE_KBPS: u32 = 192;

/// Everything a worker needs, bundled so the server layer can spawn jobs
/// with one handle.
#[derive(Clone)]
pub struct DownloadEngine {
    pub registry: Arc<SessionRegistry>,
    pub media: Arc<dyn MediaEngine>,
    pub history: Arc<HistoryStore>,
    pub config: Arc<Config>,
}

/// How a worker run ended when it did not fail.
enum Outcome {
    Completed {
        filename: String,
        size_bytes: u64,
        quality_label: String,
        title: String,
    },
    Cancelled,
}

struct PreparedJob {
    plan: FetchPlan,
    quality_label: String,
    base_name: String,
    expected_ext: String,
    /// Convert the fetched audio into this container afterwards.
    transcode_to: Option<String>,
}

impl DownloadEngine {
    /// Start the single worker for a session. Returns false if one is
    /// already running, in which case nothing is spawned.
    pub fn spawn_worker(&self, entry: Arc<SessionEntry>) -> bool {
        if !entry.try_claim_worker() {
            warn!(
                "Refusing to start a second worker for session {}",
                entry.id()
            );
            return false;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_worker(entry.clone()).await;
            entry.release_worker();
        });
        true
    }

    /// Drive one session from initializing to a terminal state. Every
    /// failure is caught here and mapped to a terminal `error`.
    pub async fn run_worker(&self, entry: Arc<SessionEntry>) {
        match self.execute(&entry).await {
            Ok(Outcome::Completed {
                filename,
                size_bytes,
                quality_label,
                title,
            }) => {
                entry.with_session(|s| {
                    if !s.status.is_terminal() {
                        s.transition(SessionStatus::Processing);
                        s.transition(SessionStatus::Completed);
                    }
                    s.result_filename = Some(filename.clone());
                    s.progress_percent = 100.0;
                });
                self.registry.persist();

                let request = entry.snapshot().request;
                self.history.add(HistoryRecord::new(
                    &title,
                    &request.url,
                    &quality_label,
                    size_bytes,
                    &filename,
                ));

                info!(
                    "Session {} completed: {} ({})",
                    entry.id(),
                    filename,
                    format_size(size_bytes)
                );
                entry.notify(ClientMessage::Completed {
                    message: "Download completed successfully".to_string(),
                    file_url: format!("/downloads/{}", filename),
                    filename,
                    file_size: size_bytes,
                    selected_quality: quality_label,
                });
                self.retire(entry.clone());
            }
            Ok(Outcome::Cancelled) => {
                entry.with_session(|s| {
                    s.transition(SessionStatus::Cancelled);
                });
                self.registry.persist();

                info!("Session {} cancelled by user", entry.id());
                entry.notify(ClientMessage::Cancelled {
                    message: "Download cancelled by user".to_string(),
                });
                self.retire(entry.clone());
            }
            Err(e) => {
                error!("Session {} failed: {}", entry.id(), e);
                if let EngineError::Transcode { stderr, .. } = &e {
                    error!("Encoder stderr: {}", stderr.trim());
                }
                entry.with_session(|s| {
                    s.transition(SessionStatus::Error);
                });
                self.registry.persist();

                entry.notify(ClientMessage::Error {
                    message: e.to_string(),
                });
                self.retire(entry.clone());
            }
        }
    }

    async fn execute(&self, entry: &Arc<SessionEntry>) -> Result<Outcome, EngineError> {
        entry.notify(ClientMessage::Initializing {
            message: "Starting download...".to_string(),
        });

        let request = entry.snapshot().request;
        let platform = Platform::detect(&request.url);
        let quirks = platform.quirks();
        info!(
            "Session {} on {}: {}",
            entry.id(),
            platform.label(),
            request.url
        );

        if entry.cancel_requested() {
            return Ok(Outcome::Cancelled);
        }

        let media_info = self.media.extract(&request.url, &quirks).await?;
        let title = media_info.metadata.title.clone();
        let mut base_name = clean_filename(&title);
        if base_name.is_empty() {
            base_name = "video".to_string();
        }

        if entry.cancel_requested() {
            return Ok(Outcome::Cancelled);
        }

        // Thumbnails skip the fetch/relay machinery entirely.
        if request.kind == ContentKind::Thumbnail {
            let thumbnail_url = media_info
                .metadata
                .thumbnail
                .ok_or_else(|| EngineError::Extraction("No thumbnail available".to_string()))?;
            let filename = format!("{}.jpg", base_name);
            let dest = self.config.downloads_dir.join(&filename);
            let size_bytes = self.media.fetch_thumbnail(&thumbnail_url, &dest).await?;
            return Ok(Outcome::Completed {
                filename,
                size_bytes,
                quality_label: "thumbnail".to_string(),
                title,
            });
        }

        let catalog = catalog::normalize(&media_info.formats);
        let job = self.prepare_job(entry, &request, &quirks, &catalog, base_name)?;

        let fetch_status = self.run_fetch(entry, &job, &quirks).await?;
        if fetch_status == FetchStatus::Cancelled || entry.cancel_requested() {
            return Ok(Outcome::Cancelled);
        }

        let output = self.finalize_output(&job).await?;
        let size_bytes = std::fs::metadata(&output)?.len();
        let filename = output
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("{}.{}", job.base_name, job.expected_ext));

        Ok(Outcome::Completed {
            filename,
            size_bytes,
            quality_label: job.quality_label,
            title,
        })
    }

    fn prepare_job(
        &self,
        entry: &Arc<SessionEntry>,
        request: &super::session::RequestParams,
        quirks: &PlatformQuirks,
        catalog: &[catalog::StreamDescriptor],
        base_name: String,
    ) -> Result<PreparedJob, EngineError> {
        let output_template = self
            .config
            .downloads_dir
            .join(format!("{}.%(ext)s", base_name));

        match request.kind {
            ContentKind::Video => {
                let target = QualityTarget::parse(&request.quality);
                let selection =
                    selector::select(catalog, target, StreamKind::Video, quirks)
                        .ok_or(EngineError::FormatNotFound)?;

                let (format_spec, picked) = match selection {
                    Selection::Single(d) => (d.id.clone(), d),
                    Selection::Pair { video, audio } => {
                        (format!("{}+{}", video.id, audio.id), video)
                    }
                    Selection::VideoOnly(d) => {
                        warn!(
                            "Session {}: no audio stream available, output will be silent",
                            entry.id()
                        );
                        (d.id.clone(), d)
                    }
                };

                let quality_label = picked
                    .height
                    .map(|h| format!("{}p", h))
                    .unwrap_or_else(|| request.quality.clone());
                info!(
                    "Session {} selected format {} ({})",
                    entry.id(),
                    format_spec,
                    quality_label
                );

                Ok(PreparedJob {
                    plan: FetchPlan {
                        url: request.url.clone(),
                        format_spec,
                        output_template,
                        merge_container: Some("mp4".to_string()),
                    },
                    quality_label,
                    base_name,
                    expected_ext: "mp4".to_string(),
                    transcode_to: None,
                })
            }
            ContentKind::Audio => {
                let selection = selector::select(
                    catalog,
                    QualityTarget::default(),
                    StreamKind::Audio,
                    quirks,
                )
                .ok_or(EngineError::FormatNotFound)?;
                let Selection::Single(picked) = selection else {
                    return Err(EngineError::FormatNotFound);
                };

                let quality_label = picked
                    .bitrate
                    .map(|b| format!("{}kbps", b.round() as u32))
                    .unwrap_or_else(|| "audio".to_string());
                info!(
                    "Session {} selected audio format {} ({})",
                    entry.id(),
                    picked.id,
                    quality_label
                );

                Ok(PreparedJob {
                    plan: FetchPlan {
                        url: request.url.clone(),
                        format_spec: picked.id.clone(),
                        output_template,
                        merge_container: None,
                    },
                    quality_label,
                    base_name,
                    expected_ext: picked.container.clone(),
                    transcode_to: Some(request.format.clone()),
                })
            }
            ContentKind::Thumbnail => unreachable!("thumbnails are handled before job preparation"),
        }
    }

    /// Run the blocking fetch on its own thread, bridging progress into the
    /// relay channel. The cancel flag is checked before every event is
    /// forwarded.
    async fn run_fetch(
        &self,
        entry: &Arc<SessionEntry>,
        job: &PreparedJob,
        quirks: &PlatformQuirks,
    ) -> Result<FetchStatus, EngineError> {
        let (tx, rx) = relay::progress_channel();
        let relay_handle = relay::spawn(self.registry.clone(), entry.clone(), rx);

        let media = self.media.clone();
        let plan = job.plan.clone();
        let quirks = *quirks;
        let cancel_probe = entry.clone();

        let fetch_result = tokio::task::spawn_blocking(move || {
            let mut on_progress = move |update| {
                if cancel_probe.cancel_requested() {
                    return false;
                }
                // A closed relay means nobody is recording progress any
                // more; the fetch itself keeps going.
                let _ = tx.blocking_send(update);
                true
            };
            media.fetch(&plan, &quirks, &mut on_progress)
        })
        .await
        .map_err(|e| EngineError::Download(format!("Worker thread failed: {}", e)))?;

        // The producer is gone; wait for the relay to drain so terminal
        // messages can never overtake progress ones.
        if let Err(e) = relay_handle.await {
            warn!("Relay task failed: {}", e);
        }

        fetch_result
    }

    /// Locate the fetched file, probing fallback extensions when the engine
    /// wrote something unexpected, then apply the audio conversion pass.
    async fn finalize_output(&self, job: &PreparedJob) -> Result<PathBuf, EngineError> {
        let dir = &self.config.downloads_dir;
        let fetched = locate_output(dir, &job.base_name, &job.expected_ext)
            .ok_or_else(|| EngineError::OutputMissing(job.base_name.clone()))?;

        let Some(target_ext) = &job.transcode_to else {
            return Ok(fetched);
        };
        if fetched.extension().and_then(|e| e.to_str()) == Some(target_ext.as_str()) {
            return Ok(fetched);
        }

        let converted = dir.join(format!("{}.{}", job.base_name, target_ext));
        let input = fetched.clone();
        let output = converted.clone();
        tokio::task::spawn_blocking(move || {
            transcode::convert_audio(&input, &output, AUDIO_BITRATE_KBPS)
        })
        .await
        .map_err(|e| EngineError::Download(format!("Worker thread failed: {}", e)))??;

        if let Err(e) = std::fs::remove_file(&fetched) {
            warn!("Failed to remove intermediate file: {}", e);
        }
        Ok(converted)
    }

    /// Retire a terminal session. With a connection attached the entry
    /// lingers for a grace window so the completion frame can be read;
    /// otherwise there is nothing left to observe and it goes immediately.
    fn retire(&self, entry: Arc<SessionEntry>) {
        let id = entry.id();
        if entry.has_connection() {
            let registry = self.registry.clone();
            let grace = self.config.retire_grace_secs;
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(grace)).await;
                registry.remove(&id);
            });
        } else {
            self.registry.remove(&id);
        }
    }
}

fn locate_output(dir: &Path, base_name: &str, expected_ext: &str) -> Option<PathBuf> {
    if let Some(found) = probe_extension(dir, base_name, expected_ext) {
        return Some(found);
    }
    FALLBACK_EXTENSIONS
        .iter()
        .filter(|ext| **ext != expected_ext)
        .find_map(|ext| probe_extension(dir, base_name, ext))
}

fn probe_extension(dir: &Path, base_name: &str, ext: &str) -> Option<PathBuf> {
    let exact = dir.join(format!("{}.{}", base_name, ext));
    if exact.exists() {
        return Some(exact);
    }

    // The engine may append its own suffixes (e.g. a format tag) between
    // the base name and the extension.
    let entries = std::fs::read_dir(dir).ok()?;
    let suffix = format!(".{}", ext);
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(base_name) && name.ends_with(&suffix) {
            return Some(entry.path());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::registry::CancelOutcome;
    use crate::engine::session::RequestParams;
    use crate::media::types::{MediaInfo, MediaMetadata, ProgressUpdate, RawFormat};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct MockMedia {
        fetch_count: AtomicUsize,
        progress: Vec<ProgressUpdate>,
        write_ext: &'static str,
        fail_fetch: bool,
        write_output: bool,
    }

    impl MockMedia {
        fn new(write_ext: &'static str) -> Self {
            Self {
                fetch_count: AtomicUsize::new(0),
                progress: vec![
                    ProgressUpdate::Downloading {
                        downloaded_bytes: 50,
                        total_bytes: Some(100),
                        percent_str: None,
                        total_str: Some("100B".to_string()),
                        speed_str: Some("1KiB/s".to_string()),
                        eta_str: Some("00:01".to_string()),
                        fragment_index: 0,
                        fragment_count: 0,
                    },
                    ProgressUpdate::Downloading {
                        downloaded_bytes: 100,
                        total_bytes: Some(100),
                        percent_str: None,
                        total_str: Some("100B".to_string()),
                        speed_str: Some("1KiB/s".to_string()),
                        eta_str: Some("00:00".to_string()),
                        fragment_index: 0,
                        fragment_count: 0,
                    },
                ],
                write_ext,
                fail_fetch: false,
                write_output: true,
            }
        }
    }

    #[async_trait]
    impl MediaEngine for MockMedia {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn extract(
            &self,
            _url: &str,
            _quirks: &PlatformQuirks,
        ) -> Result<MediaInfo, EngineError> {
            Ok(MediaInfo {
                metadata: MediaMetadata {
                    title: "Test Video".to_string(),
                    id: "abc123".to_string(),
                    thumbnail: Some("https://example.com/t.jpg".to_string()),
                    duration: Some(60),
                    uploader: None,
                    webpage_url: None,
                },
                formats: vec![
                    RawFormat {
                        format_id: Some("22".to_string()),
                        ext: Some("mp4".to_string()),
                        height: Some(720),
                        vcodec: Some("avc1.4d401f".to_string()),
                        acodec: Some("mp4a.40.2".to_string()),
                        tbr: Some(1500.0),
                        ..Default::default()
                    },
                    RawFormat {
                        format_id: Some("140".to_string()),
                        ext: Some("mp3".to_string()),
                        vcodec: Some("none".to_string()),
                        acodec: Some("mp4a.40.2".to_string()),
                        abr: Some(128.0),
                        ..Default::default()
                    },
                ],
            })
        }

        fn fetch(
            &self,
            plan: &FetchPlan,
            _quirks: &PlatformQuirks,
            on_progress: &mut dyn FnMut(ProgressUpdate) -> bool,
        ) -> Result<FetchStatus, EngineError> {
            self.fetch_count.fetch_add(1, Ordering::SeqCst);
            if self.fail_fetch {
                return Err(EngineError::Download("simulated network failure".to_string()));
            }
            for update in &self.progress {
                if !on_progress(update.clone()) {
                    return Ok(FetchStatus::Cancelled);
                }
            }
            if self.write_output {
                let path = plan
                    .output_template
                    .to_string_lossy()
                    .replace("%(ext)s", self.write_ext);
                std::fs::write(path, b"media bytes").unwrap();
            }
            on_progress(ProgressUpdate::Finished);
            Ok(FetchStatus::Completed)
        }

        async fn fetch_thumbnail(
            &self,
            _thumbnail_url: &str,
            dest: &Path,
        ) -> Result<u64, EngineError> {
            tokio::fs::write(dest, b"jpeg").await?;
            Ok(4)
        }

        async fn test_availability(&self) -> bool {
            true
        }
    }

    struct Harness {
        engine: DownloadEngine,
        mock: Arc<MockMedia>,
        _dir: tempfile::TempDir,
    }

    fn harness(mock: MockMedia) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config {
            downloads_dir: dir.path().to_path_buf(),
            history_file: dir.path().join("history.json"),
            ..Default::default()
        });
        let mock = Arc::new(mock);
        let engine = DownloadEngine {
            registry: Arc::new(SessionRegistry::new(None)),
            media: mock.clone(),
            history: Arc::new(HistoryStore::open(config.history_file.clone()).unwrap()),
            config,
        };
        Harness {
            engine,
            mock,
            _dir: dir,
        }
    }

    fn request(kind: ContentKind) -> RequestParams {
        RequestParams {
            url: "https://www.youtube.com/watch?v=abc123".to_string(),
            kind,
            quality: "720p".to_string(),
            format: "mp3".to_string(),
        }
    }

    #[tokio::test]
    async fn test_worker_completes_video() {
        let h = harness(MockMedia::new("mp4"));
        let entry = h.engine.registry.create("s1", request(ContentKind::Video));
        let (tx, mut rx) = mpsc::unbounded_channel();
        entry.attach(tx);

        h.engine.run_worker(entry.clone()).await;

        let session = entry.snapshot();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.progress_percent, 100.0);
        assert_eq!(session.result_filename.as_deref(), Some("Test Video.mp4"));

        let history = h.engine.history.list();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].title, "Test Video");
        assert_eq!(history[0].quality, "720p");

        // Drain the frames; the last one must be the completion
        let mut last = None;
        while let Ok(msg) = rx.try_recv() {
            last = Some(msg);
        }
        match last {
            Some(ClientMessage::Completed {
                filename,
                file_url,
                selected_quality,
                ..
            }) => {
                assert_eq!(filename, "Test Video.mp4");
                assert_eq!(file_url, "/downloads/Test Video.mp4");
                assert_eq!(selected_quality, "720p");
            }
            other => panic!("expected completion frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_worker_completes_audio_without_conversion() {
        let h = harness(MockMedia::new("mp3"));
        let entry = h.engine.registry.create("s1", request(ContentKind::Audio));

        h.engine.run_worker(entry.clone()).await;

        let session = entry.snapshot();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.result_filename.as_deref(), Some("Test Video.mp3"));
        assert_eq!(h.engine.history.list()[0].quality, "128kbps");
    }

    #[tokio::test]
    async fn test_worker_fetches_thumbnail() {
        let h = harness(MockMedia::new("mp4"));
        let entry = h
            .engine
            .registry
            .create("s1", request(ContentKind::Thumbnail));

        h.engine.run_worker(entry.clone()).await;

        let session = entry.snapshot();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.result_filename.as_deref(), Some("Test Video.jpg"));
        assert_eq!(h.mock.fetch_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_before_fetch_results_in_cancelled() {
        let h = harness(MockMedia::new("mp4"));
        let entry = h.engine.registry.create("s1", request(ContentKind::Video));
        assert_eq!(h.engine.registry.cancel("s1"), CancelOutcome::Cancelled);

        h.engine.run_worker(entry.clone()).await;

        assert_eq!(entry.snapshot().status, SessionStatus::Cancelled);
        // The worker never reached the fetch
        assert_eq!(h.mock.fetch_count.load(Ordering::SeqCst), 0);
        assert!(h.engine.history.list().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_failure_marks_error() {
        let mut mock = MockMedia::new("mp4");
        mock.fail_fetch = true;
        let h = harness(mock);
        let entry = h.engine.registry.create("s1", request(ContentKind::Video));
        let (tx, mut rx) = mpsc::unbounded_channel();
        entry.attach(tx);

        h.engine.run_worker(entry.clone()).await;

        assert_eq!(entry.snapshot().status, SessionStatus::Error);
        assert!(h.engine.history.list().is_empty());

        let mut saw_error = false;
        while let Ok(msg) = rx.try_recv() {
            if matches!(msg, ClientMessage::Error { .. }) {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_missing_output_marks_error() {
        let mut mock = MockMedia::new("mp4");
        mock.write_output = false;
        let h = harness(mock);
        let entry = h.engine.registry.create("s1", request(ContentKind::Video));

        h.engine.run_worker(entry.clone()).await;

        assert_eq!(entry.snapshot().status, SessionStatus::Error);
    }

    #[tokio::test]
    async fn test_unexpected_extension_is_probed() {
        // Engine wrote webm even though mp4 was expected
        let h = harness(MockMedia::new("webm"));
        let entry = h.engine.registry.create("s1", request(ContentKind::Video));

        h.engine.run_worker(entry.clone()).await;

        let session = entry.snapshot();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.result_filename.as_deref(), Some("Test Video.webm"));
    }

    #[tokio::test]
    async fn test_second_worker_is_refused() {
        let h = harness(MockMedia::new("mp4"));
        let entry = h.engine.registry.create("s1", request(ContentKind::Video));

        assert!(entry.try_claim_worker());
        assert!(!h.engine.spawn_worker(entry.clone()));
        assert_eq!(h.mock.fetch_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_session_without_connection_is_retired_immediately() {
        let h = harness(MockMedia::new("mp4"));
        let entry = h.engine.registry.create("s1", request(ContentKind::Video));

        h.engine.run_worker(entry.clone()).await;

        assert_eq!(entry.snapshot().status, SessionStatus::Completed);
        assert!(h.engine.registry.get("s1").is_none());
    }

    #[tokio::test]
    async fn test_session_with_connection_lingers_for_grace_window() {
        let h = harness(MockMedia::new("mp4"));
        let entry = h.engine.registry.create("s1", request(ContentKind::Video));
        let (tx, _rx) = mpsc::unbounded_channel();
        entry.attach(tx);

        h.engine.run_worker(entry.clone()).await;

        assert!(h.engine.registry.get("s1").is_some());
    }
}
