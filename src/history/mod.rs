//! Append-only record of completed downloads, most recent first. Pure side
//! effect; nothing here feeds back into the session engine.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: Uuid,
    pub title: String,
    pub url: String,
    pub quality: String,
    pub size_bytes: u64,
    pub completed_at: DateTime<Utc>,
    pub filename: String,
}

impl HistoryRecord {
    pub fn new(title: &str, url: &str, quality: &str, size_bytes: u64, filename: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.to_string(),
            url: url.to_string(),
            quality: quality.to_string(),
            size_bytes,
            completed_at: Utc::now(),
            filename: filename.to_string(),
        }
    }
}

pub struct HistoryStore {
    path: PathBuf,
    records: Mutex<Vec<HistoryRecord>>,
}

impl HistoryStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        let records = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)
                .with_context(|| format!("Corrupt history file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read history file {}", path.display()))
            }
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn add(&self, record: HistoryRecord) {
        let mut records = self.records.lock().unwrap();
        records.insert(0, record);
        self.save(&records);
    }

    pub fn list(&self) -> Vec<HistoryRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn delete(&self, id: Uuid) -> bool {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|r| r.id != id);
        let removed = records.len() != before;
        if removed {
            self.save(&records);
        }
        removed
    }

    pub fn clear(&self) {
        let mut records = self.records.lock().unwrap();
        records.clear();
        self.save(&records);
    }

    fn save(&self, records: &[HistoryRecord]) {
        match serde_json::to_vec_pretty(records) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&self.path, bytes) {
                    warn!("Failed to write history file: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize history: {}", e),
        }
    }
}
