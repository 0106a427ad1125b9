use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initializing,
    Downloading,
    Processing,
    Completed,
    Cancelled,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::Error
        )
    }

    /// Valid transitions of the session lifecycle. Self-transitions while
    /// downloading carry progress updates.
    pub fn can_transition(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match self {
            Initializing => matches!(next, Downloading | Processing | Cancelled | Error),
            Downloading => matches!(next, Downloading | Processing | Cancelled | Error),
            Processing => matches!(next, Completed | Cancelled | Error),
            Completed | Cancelled | Error => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Downloading => "downloading",
            SessionStatus::Processing => "processing",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Video,
    Audio,
    Thumbnail,
}

impl Default for ContentKind {
    fn default() -> Self {
        ContentKind::Video
    }
}

/// Request parameters, set once at session creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestParams {
    pub url: String,
    pub kind: ContentKind,
    pub quality: String,
    pub format: String,
}

/// The central mutable entity: one tracked download job from start to
/// terminal state. Serializable so the registry snapshot round-trips.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSession {
    pub id: String,
    pub status: SessionStatus,
    pub progress_percent: f64,
    pub total: String,
    pub speed: String,
    pub eta: String,
    pub request: RequestParams,
    pub result_filename: Option<String>,
    pub cancel_requested: bool,
}

impl DownloadSession {
    pub fn new(id: String, request: RequestParams) -> Self {
        Self {
            id,
            status: SessionStatus::Initializing,
            progress_percent: 0.0,
            total: "unknown".to_string(),
            speed: "unknown".to_string(),
            eta: "unknown".to_string(),
            request,
            result_filename: None,
            cancel_requested: false,
        }
    }

    /// Apply a status transition, rejecting invalid ones. Returns whether
    /// the transition was applied.
    pub fn transition(&mut self, next: SessionStatus) -> bool {
        if self.status == next {
            return true;
        }
        if !self.status.can_transition(next) {
            warn!(
                "Ignoring invalid session transition {} -> {} for {}",
                self.status.as_str(),
                next.as_str(),
                self.id
            );
            return false;
        }
        self.status = next;
        true
    }

    /// Record a progress observation. Percent is clamped so observers never
    /// see it go backwards within one worker run.
    pub fn apply_progress(&mut self, percent: f64, total: String, speed: String, eta: String) {
        if !self.transition(SessionStatus::Downloading) {
            return;
        }
        if percent > self.progress_percent {
            self.progress_percent = percent;
        }
        self.total = total;
        self.speed = speed;
        self.eta = eta;
    }
}
