// src/memory/mod.rs — Objective store: append-only results, insights, fronts

pub mod in_memory;
pub mod schema;
pub mod store;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::pareto::RankedFront;
use crate::core::types::{ConfigId, ExperimentResult, ExperimentStatus, Insight};
use crate::infra::errors::StoreError;

pub use in_memory::InMemoryStore;
pub use store::SqliteStore;

/// Selects experiment results. Unset fields match everything; `limit`
/// keeps the most recent matches. Results come back in append order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultFilter {
    pub cycle: Option<u32>,
    pub config_id: Option<ConfigId>,
    pub status: Option<ExperimentStatus>,
    pub limit: Option<usize>,
}

impl ResultFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn cycle(mut self, cycle: u32) -> Self {
        self.cycle = Some(cycle);
        self
    }

    pub fn config(mut self, id: ConfigId) -> Self {
        self.config_id = Some(id);
        self
    }

    pub fn status(mut self, status: ExperimentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, r: &ExperimentResult) -> bool {
        self.cycle.map_or(true, |c| r.cycle == c)
            && self.config_id.as_ref().map_or(true, |id| r.config_id() == id)
            && self.status.map_or(true, |s| r.status == s)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsightFilter {
    pub cycle: Option<u32>,
    pub limit: Option<usize>,
}

impl InsightFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn cycle(mut self, cycle: u32) -> Self {
        self.cycle = Some(cycle);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A ranked front as committed at the end of a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontSnapshot {
    pub cycle: u32,
    pub front: RankedFront,
}

/// Durable, append-only record of what the engine has learned.
///
/// Records are write-once: appending an id that already exists fails with
/// `StoreError::Duplicate`. Reads observe every append made earlier by the
/// same process.
pub trait ObjectiveStore: Send + Sync {
    fn append_result(&self, result: &ExperimentResult) -> Result<(), StoreError>;

    fn append_insight(&self, insight: &Insight) -> Result<(), StoreError>;

    fn query_results(&self, filter: &ResultFilter) -> Result<Vec<ExperimentResult>, StoreError>;

    fn query_insights(&self, filter: &InsightFilter) -> Result<Vec<Insight>, StoreError>;

    /// Record the ranked front of one stratum for `cycle`.
    fn append_front_snapshot(&self, cycle: u32, front: &RankedFront) -> Result<(), StoreError>;

    /// Latest snapshot per stratum, optionally restricted to one stratum
    /// label (`"key=value"`, or `"global"` for the unstratified front).
    fn latest_fronts(&self, stratum: Option<&str>) -> Result<Vec<FrontSnapshot>, StoreError>;

    fn count_results(&self) -> Result<usize, StoreError> {
        Ok(self.query_results(&ResultFilter::all())?.len())
    }
}

/// Label used for a front's stratum in storage and output.
pub fn stratum_label(stratum: Option<&str>) -> &str {
    stratum.unwrap_or("global")
}

/// Open (or create) the SQLite store at `path`.
pub fn open(path: &Path) -> Result<SqliteStore, StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    schema::run_migrations(&conn)?;
    Ok(SqliteStore::new(conn))
}

/// SQLite store in memory (for testing).
pub fn open_in_memory() -> Result<SqliteStore, StoreError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    schema::run_migrations(&conn)?;
    Ok(SqliteStore::new(conn))
}

/// Most recent `limit` items of `items`, keeping their order.
pub(crate) fn keep_last<T>(mut items: Vec<T>, limit: Option<usize>) -> Vec<T> {
    if let Some(limit) = limit {
        let excess = items.len().saturating_sub(limit);
        items.drain(..excess);
    }
    items
}
