//! Process-wide table of in-flight download sessions. The map and each
//! entry are guarded by their own mutex; internals are only reachable
//! through the operations below. Lock order is map before entry, and
//! `persist` must never be called while an entry guard is held.

use super::relay::{ClientMessage, ClientSender};
use super::session::{DownloadSession, RequestParams, SessionStatus};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug)]
struct EntryState {
    session: DownloadSession,
    conn: Option<ClientSender>,
    conn_generation: u64,
    worker_active: bool,
}

/// One registry slot. The attached connection is an observer only; the
/// worker never needs it to make progress.
#[derive(Debug)]
pub struct SessionEntry {
    state: Mutex<EntryState>,
}

impl SessionEntry {
    fn new(session: DownloadSession) -> Self {
        Self {
            state: Mutex::new(EntryState {
                session,
                conn: None,
                conn_generation: 0,
                worker_active: false,
            }),
        }
    }

    pub fn id(&self) -> String {
        self.state.lock().unwrap().session.id.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().unwrap().session.status
    }

    pub fn cancel_requested(&self) -> bool {
        self.state.lock().unwrap().session.cancel_requested
    }

    /// Run a closure against the session under the entry lock.
    pub fn with_session<R>(&self, f: impl FnOnce(&mut DownloadSession) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state.session)
    }

    pub fn snapshot(&self) -> DownloadSession {
        self.state.lock().unwrap().session.clone()
    }

    /// Swap in a new observer connection, returning its generation token.
    /// A stale previous connection is simply dropped.
    pub fn attach(&self, sender: ClientSender) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.conn = Some(sender);
        state.conn_generation += 1;
        state.conn_generation
    }

    /// Remove the observer, but only if it is still the one identified by
    /// `generation`. A reconnect that already swapped the connection wins.
    pub fn detach(&self, generation: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.conn_generation == generation {
            state.conn = None;
            true
        } else {
            false
        }
    }

    pub fn has_connection(&self) -> bool {
        self.state.lock().unwrap().conn.is_some()
    }

    /// Fire-and-forget delivery to the attached connection, if any.
    /// Delivery failures are logged, never propagated.
    pub fn notify(&self, message: ClientMessage) {
        let sender = self.state.lock().unwrap().conn.clone();
        if let Some(sender) = sender {
            if let Err(e) = sender.send(message) {
                debug!("Dropping client notification: {}", e);
            }
        }
    }

    /// Claim the single worker slot for this session. Returns false if a
    /// worker is already running, upholding the one-worker-per-id invariant.
    pub fn try_claim_worker(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.worker_active {
            return false;
        }
        state.worker_active = true;
        true
    }

    pub fn release_worker(&self) {
        self.state.lock().unwrap().worker_active = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// The session already reached the given terminal status.
    AlreadyFinished(SessionStatus),
    NotFound,
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<SessionEntry>>>,
    snapshot_path: Option<PathBuf>,
}

impl SessionRegistry {
    pub fn new(snapshot_path: Option<PathBuf>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            snapshot_path,
        }
    }

    /// Create a fresh entry under `id`, replacing a previous terminal
    /// session with stale progress. A live entry under the same id is
    /// returned instead of replaced, so racing callers converge on one
    /// entry and `try_claim_worker` keeps the worker count at one.
    pub fn create(&self, id: &str, request: RequestParams) -> Arc<SessionEntry> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(existing) = sessions.get(id) {
            if !existing.status().is_terminal() {
                return existing.clone();
            }
        }
        let entry = Arc::new(SessionEntry::new(DownloadSession::new(
            id.to_string(),
            request,
        )));
        sessions.insert(id.to_string(), entry.clone());
        drop(sessions);
        self.persist();
        entry
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.lock().unwrap().get(id).cloned()
    }

    pub fn remove(&self, id: &str) {
        self.sessions.lock().unwrap().remove(id);
        self.persist();
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Cancellation controller: flip the flag and best-effort notify the
    /// attached client. Idempotent; terminal and unknown sessions are left
    /// untouched.
    pub fn cancel(&self, id: &str) -> CancelOutcome {
        let entry = match self.get(id) {
            Some(entry) => entry,
            None => return CancelOutcome::NotFound,
        };

        {
            let mut state = entry.state.lock().unwrap();
            if state.session.status.is_terminal() {
                return CancelOutcome::AlreadyFinished(state.session.status);
            }
            state.session.cancel_requested = true;
        }
        self.persist();

        info!("Cancellation requested for session {}", id);
        entry.notify(ClientMessage::Cancelled {
            message: "Download cancellation requested".to_string(),
        });
        CancelOutcome::Cancelled
    }

    /// Write the full session table to the snapshot file. Best-effort; a
    /// failed write is logged and the engine keeps running.
    pub fn persist(&self) {
        let Some(path) = &self.snapshot_path else {
            return;
        };

        let snapshot: HashMap<String, DownloadSession> = self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.snapshot()))
            .collect();

        match serde_json::to_vec_pretty(&snapshot) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(path, bytes) {
                    warn!("Failed to persist session snapshot: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize session snapshot: {}", e),
        }
    }

    /// Restore sessions from a snapshot written by a previous process. The
    /// workers of non-terminal sessions are gone, so those are marked as
    /// errored rather than resurrected.
    pub fn load_snapshot(&self) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(_) => return,
        };
        let snapshot: HashMap<String, DownloadSession> = match serde_json::from_str(&contents) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Ignoring unreadable session snapshot: {}", e);
                return;
            }
        };

        let mut sessions = self.sessions.lock().unwrap();
        for (id, mut session) in snapshot {
            if !session.status.is_terminal() {
                session.status = SessionStatus::Error;
            }
            sessions.insert(id, Arc::new(SessionEntry::new(session)));
        }
        info!("Restored {} session(s) from snapshot", sessions.len());
    }
}
