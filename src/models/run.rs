//! Run-level data: requests, in-flight state, outcomes, and the bounded
//! in-memory history of past runs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;

/// Maximum number of past outcomes retained in memory.
pub const MAX_HISTORY: usize = 10;

/// One backup invocation as requested by a trigger surface.
#[derive(Debug, Clone)]
pub struct BackupRequest {
    /// Collections to export; `None` means the configured default set.
    pub collections: Option<Vec<String>>,
    pub wants_thread: bool,
    pub is_manual: bool,
}

impl BackupRequest {
    pub fn manual(collections: Option<Vec<String>>) -> Self {
        Self {
            collections,
            wants_thread: true,
            is_manual: true,
        }
    }

    pub fn scheduled() -> Self {
        Self {
            collections: None,
            wants_thread: true,
            is_manual: false,
        }
    }
}

/// In-flight state owned by exactly one orchestrator invocation.
#[derive(Debug)]
pub struct BackupRun {
    /// Timestamp-derived id, also used as the thread title suffix.
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub thread_id: Option<String>,
    pub staged_artifact: Option<PathBuf>,
    pub collections_processed: Vec<String>,
    pub documents_processed: u64,
}

impl BackupRun {
    pub fn new(id: String, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            started_at,
            thread_id: None,
            staged_artifact: None,
            collections_processed: Vec::new(),
            documents_processed: 0,
        }
    }
}

/// Result of one run, as recorded in history and broadcast to listeners.
#[derive(Debug, Clone, Serialize)]
pub struct BackupOutcome {
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub collections_processed: Vec<String>,
    pub documents_processed: u64,
    pub artifact_url: Option<String>,
    pub error_message: Option<String>,
}

/// Append-only, size-bounded log of past run outcomes, oldest evicted.
#[derive(Debug, Default)]
pub struct RunHistory {
    entries: VecDeque<BackupOutcome>,
}

impl RunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, outcome: BackupOutcome) {
        self.entries.push_back(outcome);
        while self.entries.len() > MAX_HISTORY {
            self.entries.pop_front();
        }
    }

    /// Defensive copy, newest last.
    pub fn entries(&self) -> Vec<BackupOutcome> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
