//! Bridges progress callbacks from the blocking worker thread into async
//! notification delivery. The worker pushes events into a bounded channel;
//! the relay task drains them in invocation order, updates the registry
//! entry, and forwards to whichever connection currently observes the
//! session. A single producer per session keeps delivery ordered.

use super::registry::{SessionEntry, SessionRegistry};
use crate::media::types::ProgressUpdate;
use crate::utils::strip_ansi;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const RELAY_CAPACITY: usize = 256;

/// Engine-to-client notification frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ClientMessage {
    Initializing {
        message: String,
    },
    Downloading {
        percent: f64,
        total: String,
        speed: String,
        eta: String,
        fragment_index: u64,
        fragment_count: u64,
    },
    Processing {
        message: String,
    },
    /// One-shot snapshot for a connection that re-attached to a live
    /// session; the underlying status is unchanged.
    Reconnected {
        percent: f64,
        message: String,
        total: String,
        speed: String,
        eta: String,
    },
    Completed {
        message: String,
        filename: String,
        file_size: u64,
        selected_quality: String,
        file_url: String,
    },
    Cancelled {
        message: String,
    },
    Error {
        message: String,
    },
}

impl ClientMessage {
    /// Terminal frames end the client's observation of the session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClientMessage::Completed { .. }
                | ClientMessage::Cancelled { .. }
                | ClientMessage::Error { .. }
        )
    }
}

pub type ClientSender = mpsc::UnboundedSender<ClientMessage>;

/// Bounded worker-side channel; `blocking_send` from the worker thread
/// applies backpressure instead of unbounded buffering.
pub fn progress_channel() -> (mpsc::Sender<ProgressUpdate>, mpsc::Receiver<ProgressUpdate>) {
    mpsc::channel(RELAY_CAPACITY)
}

/// Compute the display percent for one progress event: prefer the engine's
/// own percent string, fall back to byte counters, and report 0 when the
/// total is unknown.
pub fn display_percent(percent_str: Option<&str>, downloaded: u64, total: Option<u64>) -> f64 {
    if let Some(raw) = percent_str {
        let cleaned = strip_ansi(raw);
        let cleaned = cleaned.trim_end_matches('%').trim();
        if let Ok(value) = cleaned.parse::<f64>() {
            return round2(value.clamp(0.0, 100.0));
        }
    }
    match total {
        Some(total) if total > 0 => round2((downloaded as f64 / total as f64) * 100.0),
        _ => 0.0,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn display_string(raw: Option<String>, fallback: &str) -> String {
    match raw {
        Some(s) => {
            let cleaned = strip_ansi(&s);
            if cleaned.is_empty() || cleaned == "NA" {
                fallback.to_string()
            } else {
                cleaned
            }
        }
        None => fallback.to_string(),
    }
}

/// Drain progress events for one session until the worker drops its sender.
pub fn spawn(
    registry: Arc<SessionRegistry>,
    entry: Arc<SessionEntry>,
    mut rx: mpsc::Receiver<ProgressUpdate>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            match update {
                ProgressUpdate::Downloading {
                    downloaded_bytes,
                    total_bytes,
                    percent_str,
                    total_str,
                    speed_str,
                    eta_str,
                    fragment_index,
                    fragment_count,
                } => {
                    let observed =
                        display_percent(percent_str.as_deref(), downloaded_bytes, total_bytes);
                    let total = display_string(total_str, "Unknown");
                    let speed = display_string(speed_str, "0MiB/s");
                    let eta = display_string(eta_str, "Unknown");

                    // Forward the clamped value, not the raw observation:
                    // the engine's counter restarts per fetch leg, and
                    // attached clients must never see percent go backwards.
                    let percent = entry.with_session(|s| {
                        s.apply_progress(observed, total.clone(), speed.clone(), eta.clone());
                        s.progress_percent
                    });
                    registry.persist();

                    entry.notify(ClientMessage::Downloading {
                        percent,
                        total,
                        speed,
                        eta,
                        fragment_index,
                        fragment_count,
                    });
                }
                ProgressUpdate::Finished => {
                    let transitioned = entry
                        .with_session(|s| s.transition(super::session::SessionStatus::Processing));
                    registry.persist();
                    if transitioned {
                        entry.notify(ClientMessage::Processing {
                            message: "Processing file...".to_string(),
                        });
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::session::{ContentKind, RequestParams, SessionStatus};

    fn request() -> RequestParams {
        RequestParams {
            url: "https://example.com/v".to_string(),
            kind: ContentKind::Video,
            quality: "720p".to_string(),
            format: "mp4".to_string(),
        }
    }

    fn downloading(percent_str: Option<&str>, downloaded: u64, total: Option<u64>) -> ProgressUpdate {
        ProgressUpdate::Downloading {
            downloaded_bytes: downloaded,
            total_bytes: total,
            percent_str: percent_str.map(|s| s.to_string()),
            total_str: Some("10.00MiB".to_string()),
            speed_str: Some("\x1b[0;32m1.5MiB/s\x1b[0m".to_string()),
            eta_str: Some("00:05".to_string()),
            fragment_index: 1,
            fragment_count: 4,
        }
    }

    #[test]
    fn test_display_percent_prefers_engine_string() {
        assert_eq!(display_percent(Some(" 42.5%"), 0, Some(100)), 42.5);
        assert_eq!(display_percent(Some("\x1b[0;94m 12.3%\x1b[0m"), 0, None), 12.3);
    }

    #[test]
    fn test_display_percent_from_byte_counters() {
        assert_eq!(display_percent(None, 50, Some(200)), 25.0);
        assert_eq!(display_percent(Some("garbage"), 1, Some(3)), 33.33);
    }

    #[test]
    fn test_display_percent_unknown_total() {
        assert_eq!(display_percent(None, 1234, None), 0.0);
        assert_eq!(display_percent(None, 1234, Some(0)), 0.0);
    }

    #[test]
    fn test_display_percent_clamps() {
        assert_eq!(display_percent(Some("140%"), 0, None), 100.0);
    }

    #[tokio::test]
    async fn test_relay_updates_session_and_forwards_in_order() {
        let registry = Arc::new(SessionRegistry::new(None));
        let entry = registry.create("s1", request());

        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
        entry.attach(conn_tx);

        let (tx, rx) = progress_channel();
        let handle = spawn(registry.clone(), entry.clone(), rx);

        tx.send(downloading(Some("10.0%"), 0, None)).await.unwrap();
        tx.send(downloading(Some("60.0%"), 0, None)).await.unwrap();
        tx.send(ProgressUpdate::Finished).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        match conn_rx.recv().await.unwrap() {
            ClientMessage::Downloading { percent, speed, .. } => {
                assert_eq!(percent, 10.0);
                // ANSI escapes are stripped before exposure
                assert_eq!(speed, "1.5MiB/s");
            }
            other => panic!("unexpected message {:?}", other),
        }
        match conn_rx.recv().await.unwrap() {
            ClientMessage::Downloading { percent, .. } => assert_eq!(percent, 60.0),
            other => panic!("unexpected message {:?}", other),
        }
        assert!(matches!(
            conn_rx.recv().await.unwrap(),
            ClientMessage::Processing { .. }
        ));

        let session = entry.snapshot();
        assert_eq!(session.status, SessionStatus::Processing);
        assert_eq!(session.progress_percent, 60.0);
    }

    #[tokio::test]
    async fn test_forwarded_percent_never_regresses() {
        let registry = Arc::new(SessionRegistry::new(None));
        let entry = registry.create("s1", request());

        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
        entry.attach(conn_tx);

        let (tx, rx) = progress_channel();
        let handle = spawn(registry.clone(), entry.clone(), rx);

        // The engine restarts its counter for the second leg of a merged
        // fetch; the clamp must hold for clients, not just the record.
        tx.send(downloading(Some("60.0%"), 0, None)).await.unwrap();
        tx.send(downloading(Some("10.0%"), 0, None)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let mut seen = Vec::new();
        while let Ok(msg) = conn_rx.try_recv() {
            if let ClientMessage::Downloading { percent, .. } = msg {
                seen.push(percent);
            }
        }
        assert_eq!(seen, vec![60.0, 60.0]);
        assert_eq!(entry.snapshot().progress_percent, 60.0);
    }

    #[tokio::test]
    async fn test_relay_without_connection_still_updates_registry() {
        let registry = Arc::new(SessionRegistry::new(None));
        let entry = registry.create("s1", request());

        let (tx, rx) = progress_channel();
        let handle = spawn(registry.clone(), entry.clone(), rx);

        tx.send(downloading(Some("45.0%"), 0, None)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let session = entry.snapshot();
        assert_eq!(session.status, SessionStatus::Downloading);
        assert_eq!(session.progress_percent, 45.0);
    }

    #[test]
    fn test_message_wire_format() {
        let msg = ClientMessage::Downloading {
            percent: 12.34,
            total: "10MiB".to_string(),
            speed: "1MiB/s".to_string(),
            eta: "00:09".to_string(),
            fragment_index: 2,
            fragment_count: 8,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["status"], "downloading");
        assert_eq!(json["percent"], 12.34);
        assert_eq!(json["fragment_count"], 8);

        let msg = ClientMessage::Reconnected {
            percent: 50.0,
            message: "Reconnected to active download".to_string(),
            total: "Unknown".to_string(),
            speed: "0MiB/s".to_string(),
            eta: "Unknown".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["status"], "reconnected");
    }

    #[test]
    fn test_terminal_messages() {
        assert!(ClientMessage::Cancelled {
            message: String::new()
        }
        .is_terminal());
        assert!(!ClientMessage::Processing {
            message: String::new()
        }
        .is_terminal());
    }
}
