// src/memory/schema.rs — Schema + migrations

use rusqlite::{params, Connection};
use tracing::info;

use crate::infra::errors::StoreError;

/// A database migration with version, name, and SQL statements.
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub up: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        up: "
CREATE TABLE configurations (
    id          TEXT PRIMARY KEY,
    params      TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE experiments (
    id            TEXT PRIMARY KEY,
    config_id     TEXT NOT NULL REFERENCES configurations(id),
    cycle         INTEGER NOT NULL,
    status        TEXT NOT NULL,
    objectives    TEXT NOT NULL,
    error         TEXT,
    attempts      INTEGER NOT NULL DEFAULT 1,
    submitted_at  TEXT NOT NULL,
    completed_at  TEXT NOT NULL
);
CREATE INDEX idx_experiments_cycle ON experiments(cycle);
CREATE INDEX idx_experiments_config ON experiments(config_id);

CREATE TABLE insights (
    id          TEXT PRIMARY KEY,
    cycle       INTEGER NOT NULL,
    source      TEXT NOT NULL,
    summary     TEXT NOT NULL,
    stats       TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE INDEX idx_insights_cycle ON insights(cycle);
",
    },
    Migration {
        version: 2,
        name: "pareto_frontiers",
        up: "
CREATE TABLE pareto_snapshots (
    cycle       INTEGER NOT NULL,
    stratum     TEXT NOT NULL,
    rule        TEXT NOT NULL,
    dropped     INTEGER NOT NULL,
    created_at  TEXT NOT NULL,
    PRIMARY KEY (cycle, stratum)
);

CREATE TABLE pareto_frontiers (
    cycle       INTEGER NOT NULL,
    stratum     TEXT NOT NULL,
    rank        INTEGER NOT NULL,
    result_id   TEXT NOT NULL REFERENCES experiments(id),
    score       REAL NOT NULL,
    PRIMARY KEY (cycle, stratum, rank),
    FOREIGN KEY (cycle, stratum) REFERENCES pareto_snapshots(cycle, stratum)
);
CREATE INDEX idx_pareto_snapshots_stratum ON pareto_snapshots(stratum, cycle);
",
    },
];

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current_version) {
        info!(
            "Applying migration {}: {}",
            migration.version, migration.name
        );

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.up)?;
        tx.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            params![migration.version, migration.name],
        )?;
        tx.commit()?;
    }

    Ok(())
}

/// Highest applied migration version.
pub fn current_version(conn: &Connection) -> Result<u32, StoreError> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?)
}
