// src/memory/store.rs — SQLite objective store

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use super::{
    keep_last, stratum_label, FrontSnapshot, InsightFilter, ObjectiveStore, ResultFilter,
};
use crate::core::pareto::{RankedFront, RankedMember, RankingRule};
use crate::core::types::{
    Configuration, ErrorDetail, ExperimentResult, ExperimentStatus, Insight, ParamValue,
};
use crate::infra::errors::StoreError;

const RESULT_COLUMNS: &str = "e.id, e.config_id, c.params, e.cycle, e.status, e.objectives,
     e.error, e.attempts, e.submitted_at, e.completed_at";

/// Objective store backed by one SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

/// Raw experiment row before decoding the JSON columns.
struct ResultRow {
    id: String,
    config_id: String,
    params: String,
    cycle: u32,
    status: String,
    objectives: String,
    error: Option<String>,
    attempts: u32,
    submitted_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
}

impl ResultRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Self::read_offset(row, 0)
    }

    /// Like `read`, with the result columns starting at `offset`.
    fn read_offset(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(offset)?,
            config_id: row.get(offset + 1)?,
            params: row.get(offset + 2)?,
            cycle: row.get(offset + 3)?,
            status: row.get(offset + 4)?,
            objectives: row.get(offset + 5)?,
            error: row.get(offset + 6)?,
            attempts: row.get(offset + 7)?,
            submitted_at: row.get(offset + 8)?,
            completed_at: row.get(offset + 9)?,
        })
    }

    fn decode(self) -> Result<ExperimentResult, StoreError> {
        let corrupt = |message: String| StoreError::Corrupt {
            id: self.id.clone(),
            message,
        };
        let params: BTreeMap<String, ParamValue> = serde_json::from_str(&self.params)?;
        let configuration = Configuration::with_id(self.config_id.clone(), params)
            .map_err(|e| corrupt(e.to_string()))?;
        let status = ExperimentStatus::parse(&self.status)
            .ok_or_else(|| corrupt(format!("unknown status '{}'", self.status)))?;
        let error: Option<ErrorDetail> = match &self.error {
            Some(json) => Some(serde_json::from_str(json)?),
            None => None,
        };
        Ok(ExperimentResult {
            objectives: serde_json::from_str(&self.objectives)?,
            id: self.id,
            cycle: self.cycle,
            configuration,
            status,
            error,
            attempts: self.attempts,
            submitted_at: self.submitted_at,
            completed_at: self.completed_at,
        })
    }
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    // -- Configurations --

    /// Insert `config` unless already present. The same id with different
    /// parameters is a conflict.
    fn put_configuration(conn: &Connection, config: &Configuration) -> Result<(), StoreError> {
        let params_json = serde_json::to_string(config.params())?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT params FROM configurations WHERE id = ?1",
                params![config.id().as_str()],
                |r| r.get(0),
            )
            .optional()?;
        match existing {
            Some(stored) => {
                let stored: BTreeMap<String, ParamValue> = serde_json::from_str(&stored)?;
                if &stored != config.params() {
                    return Err(StoreError::Conflict {
                        id: config.id().to_string(),
                    });
                }
            }
            None => {
                conn.execute(
                    "INSERT INTO configurations (id, params, created_at) VALUES (?1, ?2, ?3)",
                    params![config.id().as_str(), params_json, Utc::now()],
                )?;
            }
        }
        Ok(())
    }

    fn exists(conn: &Connection, table: &str, id: &str) -> Result<bool, StoreError> {
        let found: Option<i64> = conn
            .query_row(
                &format!("SELECT 1 FROM {table} WHERE id = ?1"),
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn load_members(
        conn: &Connection,
        cycle: u32,
        stratum: &str,
    ) -> Result<Vec<RankedMember>, StoreError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT f.rank, f.score, {RESULT_COLUMNS}
             FROM pareto_frontiers f
             JOIN experiments e ON e.id = f.result_id
             JOIN configurations c ON c.id = e.config_id
             WHERE f.cycle = ?1 AND f.stratum = ?2
             ORDER BY f.rank"
        ))?;
        let rows = stmt
            .query_map(params![cycle, stratum], |row| {
                let rank: i64 = row.get(0)?;
                let score: f64 = row.get(1)?;
                let raw = ResultRow::read_offset(row, 2)?;
                Ok((rank, score, raw))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(rank, score, raw)| {
                Ok(RankedMember {
                    rank: rank as usize,
                    score,
                    result: raw.decode()?,
                })
            })
            .collect()
    }
}

impl ObjectiveStore for SqliteStore {
    fn append_result(&self, result: &ExperimentResult) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        if Self::exists(&tx, "experiments", &result.id)? {
            return Err(StoreError::Duplicate {
                kind: "experiment",
                id: result.id.clone(),
            });
        }
        Self::put_configuration(&tx, &result.configuration)?;

        let error = result
            .error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        tx.execute(
            "INSERT INTO experiments (id, config_id, cycle, status, objectives, error,
             attempts, submitted_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                result.id,
                result.config_id().as_str(),
                result.cycle,
                result.status.as_str(),
                serde_json::to_string(&result.objectives)?,
                error,
                result.attempts,
                result.submitted_at,
                result.completed_at,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn append_insight(&self, insight: &Insight) -> Result<(), StoreError> {
        let conn = self.conn()?;
        if Self::exists(&conn, "insights", &insight.id)? {
            return Err(StoreError::Duplicate {
                kind: "insight",
                id: insight.id.clone(),
            });
        }
        conn.execute(
            "INSERT INTO insights (id, cycle, source, summary, stats, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                insight.id,
                insight.cycle,
                insight.source,
                insight.summary,
                serde_json::to_string(&insight.stats)?,
                insight.created_at,
            ],
        )?;
        Ok(())
    }

    fn query_results(&self, filter: &ResultFilter) -> Result<Vec<ExperimentResult>, StoreError> {
        let mut clauses = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(cycle) = filter.cycle {
            values.push(Value::Integer(cycle as i64));
            clauses.push(format!("e.cycle = ?{}", values.len()));
        }
        if let Some(ref id) = filter.config_id {
            values.push(Value::Text(id.to_string()));
            clauses.push(format!("e.config_id = ?{}", values.len()));
        }
        if let Some(status) = filter.status {
            values.push(Value::Text(status.as_str().to_string()));
            clauses.push(format!("e.status = ?{}", values.len()));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RESULT_COLUMNS}
             FROM experiments e JOIN configurations c ON c.id = e.config_id
             {where_clause}
             ORDER BY e.rowid"
        ))?;
        let rows = stmt
            .query_map(params_from_iter(values), ResultRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        let rows = keep_last(rows, filter.limit);

        rows.into_iter().map(ResultRow::decode).collect()
    }

    fn query_insights(&self, filter: &InsightFilter) -> Result<Vec<Insight>, StoreError> {
        let conn = self.conn()?;
        let (sql, values): (&str, Vec<Value>) = match filter.cycle {
            Some(cycle) => (
                "SELECT id, cycle, source, summary, stats, created_at FROM insights
                 WHERE cycle = ?1 ORDER BY rowid",
                vec![Value::Integer(cycle as i64)],
            ),
            None => (
                "SELECT id, cycle, source, summary, stats, created_at FROM insights
                 ORDER BY rowid",
                Vec::new(),
            ),
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, DateTime<Utc>>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        keep_last(rows, filter.limit)
            .into_iter()
            .map(|(id, cycle, source, summary, stats, created_at)| {
                Ok(Insight {
                    id,
                    cycle,
                    source,
                    summary,
                    stats: serde_json::from_str(&stats)?,
                    created_at,
                })
            })
            .collect()
    }

    fn append_front_snapshot(&self, cycle: u32, front: &RankedFront) -> Result<(), StoreError> {
        let label = stratum_label(front.stratum.as_deref());
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM pareto_snapshots WHERE cycle = ?1 AND stratum = ?2",
                params![cycle, label],
                |r| r.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(StoreError::Duplicate {
                kind: "front snapshot",
                id: format!("{cycle}/{label}"),
            });
        }

        tx.execute(
            "INSERT INTO pareto_snapshots (cycle, stratum, rule, dropped, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                cycle,
                label,
                serde_json::to_string(&front.rule)?,
                front.dropped as i64,
                Utc::now(),
            ],
        )?;
        for member in &front.members {
            tx.execute(
                "INSERT INTO pareto_frontiers (cycle, stratum, rank, result_id, score)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![cycle, label, member.rank as i64, member.result.id, member.score],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn latest_fronts(&self, stratum: Option<&str>) -> Result<Vec<FrontSnapshot>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT s.cycle, s.stratum, s.rule, s.dropped FROM pareto_snapshots s
             WHERE s.cycle = (SELECT MAX(cycle) FROM pareto_snapshots WHERE stratum = s.stratum)
               AND (?1 IS NULL OR s.stratum = ?1)
             ORDER BY s.stratum",
        )?;
        let heads = stmt
            .query_map(params![stratum], |row| {
                Ok((
                    row.get::<_, u32>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        heads
            .into_iter()
            .map(|(cycle, label, rule, dropped)| {
                let rule: RankingRule = serde_json::from_str(&rule)?;
                let members = Self::load_members(&conn, cycle, &label)?;
                Ok(FrontSnapshot {
                    cycle,
                    front: RankedFront {
                        stratum: (label != "global").then_some(label),
                        rule,
                        members,
                        dropped: dropped as usize,
                    },
                })
            })
            .collect()
    }

    fn count_results(&self) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM experiments", [], |r| r.get(0))?;
        Ok(n as usize)
    }
}
