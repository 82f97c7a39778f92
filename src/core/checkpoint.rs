// src/core/checkpoint.rs — CycleState persistence for crash recovery
//
// Writes the checkpoint file (default `~/.sciloop/state/cycle-state.json`)
// after every phase transition and appends each finished run to
// `run-history.jsonl` next to it. The checkpoint uses atomic write
// (temp file + rename) so a crash never leaves a torn file behind.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::types::{CycleState, Phase};
use crate::infra::errors::StoreError;

const HISTORY_FILE: &str = "run-history.jsonl";
const HISTORY_ROTATE_LINES: usize = 1000;
const HISTORY_ROTATE_BYTES: u64 = 1_048_576;
const HISTORY_KEEP_LINES: usize = 500;

/// One line of `run-history.jsonl`, appended when a run terminates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    pub run_id: String,
    pub cycles: u32,
    pub budget_total: u32,
    pub budget_consumed: u32,
    pub reason: String,
    pub fatal: bool,
    pub started_at: String,
    pub finished_at: String,
}

impl RunHistoryEntry {
    pub fn from_state(state: &CycleState) -> Self {
        let (reason, fatal) = match &state.terminal {
            Some(r) => (r.to_string(), r.is_fatal()),
            None => (state.phase.to_string(), false),
        };
        Self {
            run_id: state.run_id.clone(),
            cycles: state.cycle,
            budget_total: state.budget_total,
            budget_consumed: state.budget_consumed,
            reason,
            fatal,
            started_at: state.started_at.to_rfc3339(),
            finished_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Where the state machine commits its `CycleState`.
pub trait StateStore: Send + Sync {
    /// The last committed state, if any.
    fn load(&self) -> Result<Option<CycleState>, StoreError>;

    fn save(&self, state: &CycleState) -> Result<(), StoreError>;

    /// Drop the committed state so the next run starts fresh.
    fn clear(&self) -> Result<(), StoreError>;

    /// Record a terminated run. Default is a no-op.
    fn record_run(&self, _entry: &RunHistoryEntry) -> Result<(), StoreError> {
        Ok(())
    }
}

// -- File-backed store --

pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn history_path(&self) -> PathBuf {
        self.dir().join(HISTORY_FILE)
    }

    /// Most recent `limit` run history entries, oldest first.
    pub fn read_history(&self, limit: usize) -> Vec<RunHistoryEntry> {
        let content = match std::fs::read_to_string(self.history_path()) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };
        let lines: Vec<&str> = content.lines().collect();
        let start = lines.len().saturating_sub(limit);
        lines[start..]
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<Option<CycleState>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, state: &CycleState) -> Result<(), StoreError> {
        let dir = self.dir();
        std::fs::create_dir_all(&dir)?;

        let json = serde_json::to_string_pretty(state)?;
        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("cycle-state.json");
        let tmp = dir.join(format!(".{file_name}.tmp"));

        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(json.as_bytes())?;
        f.flush()?;
        f.sync_all()?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn record_run(&self, entry: &RunHistoryEntry) -> Result<(), StoreError> {
        std::fs::create_dir_all(self.dir())?;
        let path = self.history_path();

        if let Ok(meta) = std::fs::metadata(&path) {
            let should_rotate = meta.len() > HISTORY_ROTATE_BYTES
                || std::fs::read_to_string(&path)
                    .map(|c| c.lines().count() >= HISTORY_ROTATE_LINES)
                    .unwrap_or(false);
            if should_rotate {
                rotate_history(&path)?;
            }
        }

        let line = serde_json::to_string(entry)?;
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}

/// Keep only the last 500 lines.
fn rotate_history(path: &Path) -> Result<(), StoreError> {
    let content = std::fs::read_to_string(path)?;
    let lines: Vec<&str> = content.lines().collect();
    let keep = &lines[lines.len().saturating_sub(HISTORY_KEEP_LINES)..];
    std::fs::write(path, keep.join("\n") + "\n")?;
    Ok(())
}

// -- In-memory store --

/// Keeps every committed state; useful for tests and embedding.
#[derive(Default)]
pub struct MemoryStateStore {
    saved: Mutex<Vec<CycleState>>,
    runs: Mutex<Vec<RunHistoryEntry>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing checkpoint, as after a crash.
    pub fn with_state(state: CycleState) -> Self {
        Self {
            saved: Mutex::new(vec![state]),
            runs: Mutex::new(Vec::new()),
        }
    }

    /// Phases in commit order.
    pub fn phases(&self) -> Vec<Phase> {
        self.saved
            .lock()
            .map(|s| s.iter().map(|c| c.phase).collect())
            .unwrap_or_default()
    }

    pub fn saves(&self) -> usize {
        self.saved.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn runs(&self) -> Vec<RunHistoryEntry> {
        self.runs.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<Option<CycleState>, StoreError> {
        let saved = self.saved.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(saved.last().cloned())
    }

    fn save(&self, state: &CycleState) -> Result<(), StoreError> {
        self.saved
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .push(state.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.saved.lock().map_err(|_| StoreError::Poisoned)?.clear();
        Ok(())
    }

    fn record_run(&self, entry: &RunHistoryEntry) -> Result<(), StoreError> {
        self.runs
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .push(entry.clone());
        Ok(())
    }
}
