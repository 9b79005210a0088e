//! SQLite audit log of runs and their steps.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::step::{ExecutionStep, RunOutcome, SessionId};
use crate::{Error, Result};

/// SQLite-backed step store.
pub struct StepStore {
    conn: Connection,
}

/// Summary of one persisted run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub id: SessionId,
    pub query: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
    pub step_count: usize,
}

impl StepStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            conn: Connection::open(path)?,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                session_id TEXT PRIMARY KEY,
                query TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                outcome TEXT
            );
            CREATE TABLE IF NOT EXISTS steps (
                session_id TEXT NOT NULL,
                step_number INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                step_type TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (session_id, step_number)
            );
            "#,
        )?;
        Ok(())
    }

    /// Register a new run.
    pub fn begin_run(&self, session_id: SessionId, query: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO runs (session_id, query, started_at) VALUES (?1, ?2, ?3)",
            params![session_id.to_string(), query, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Append a step. Step numbers are unique per run.
    pub fn append(&self, session_id: SessionId, step: &ExecutionStep) -> Result<()> {
        self.conn.execute(
            "INSERT INTO steps (session_id, step_number, timestamp, step_type, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session_id.to_string(),
                step.step_number as i64,
                step.timestamp.to_rfc3339(),
                step.payload.step_type(),
                serde_json::to_string(step)?,
            ],
        )?;
        Ok(())
    }

    /// Mark a run as finished.
    pub fn finish_run(&self, session_id: SessionId, outcome: RunOutcome) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE runs SET finished_at = ?2, outcome = ?3 WHERE session_id = ?1",
            params![
                session_id.to_string(),
                Utc::now().to_rfc3339(),
                outcome.as_str()
            ],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(session_id.to_string()));
        }
        Ok(())
    }

    /// All runs, most recent first.
    pub fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.session_id, r.query, r.started_at, r.finished_at, r.outcome,
                    (SELECT COUNT(*) FROM steps s WHERE s.session_id = r.session_id)
             FROM runs r ORDER BY r.started_at DESC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut runs = Vec::new();
        for row in rows {
            let (id, query, started_at, finished_at, outcome, count) = row?;
            runs.push(RunSummary {
                id: parse_session_id(&id)?,
                query,
                started_at: parse_time(&started_at)?,
                finished_at: finished_at.as_deref().map(parse_time).transpose()?,
                outcome: outcome
                    .as_deref()
                    .map(|o| o.parse::<RunOutcome>().map_err(Error::Corrupt))
                    .transpose()?,
                step_count: count as usize,
            });
        }
        Ok(runs)
    }

    /// Query text of a run.
    pub fn run_query(&self, session_id: SessionId) -> Result<Option<String>> {
        let query = self
            .conn
            .query_row(
                "SELECT query FROM runs WHERE session_id = ?1",
                [session_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(query)
    }

    /// Load every step of a run in step order, optionally filtered by `step_type`.
    pub fn load_steps(
        &self,
        session_id: SessionId,
        step_type: Option<&str>,
    ) -> Result<Vec<ExecutionStep>> {
        let mut stmt = self.conn.prepare(
            "SELECT data FROM steps
             WHERE session_id = ?1 AND (?2 IS NULL OR step_type = ?2)
             ORDER BY step_number",
        )?;

        let rows = stmt.query_map(params![session_id.to_string(), step_type], |row| {
            row.get::<_, String>(0)
        })?;

        let mut steps = Vec::new();
        for data in rows {
            steps.push(serde_json::from_str(&data?)?);
        }
        Ok(steps)
    }
}

fn parse_session_id(s: &str) -> Result<SessionId> {
    s.parse()
        .map_err(|e| Error::Corrupt(format!("session id {s}: {e}")))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Corrupt(format!("timestamp {s}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExecutionHistory, StepPayload};

    #[test]
    fn history_mirrors_steps_into_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");
        let id = SessionId::new();

        let mut history = ExecutionHistory::new(id, "add 1 and 2")
            .with_store(StepStore::open(&path).unwrap())
            .unwrap();
        history.append(StepPayload::Confirmation).unwrap();
        history
            .append(StepPayload::FinalAnswer {
                result: "3".into(),
                summary: Some("done".into()),
            })
            .unwrap();
        history.finish(RunOutcome::Completed).unwrap();
        drop(history);

        let store = StepStore::open(&path).unwrap();
        let runs = store.list_runs().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, id);
        assert_eq!(runs[0].step_count, 2);
        assert_eq!(runs[0].outcome, Some(RunOutcome::Completed));
        assert!(runs[0].finished_at.is_some());

        let steps = store.load_steps(id, None).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].step_number, 2);

        let finals = store.load_steps(id, Some("final_answer")).unwrap();
        assert_eq!(finals.len(), 1);
        assert_eq!(store.run_query(id).unwrap().as_deref(), Some("add 1 and 2"));
    }

    #[test]
    fn duplicate_step_number_is_rejected() {
        let store = StepStore::in_memory().unwrap();
        let id = SessionId::new();
        store.begin_run(id, "q").unwrap();
        let step = ExecutionStep {
            step_number: 1,
            timestamp: Utc::now(),
            payload: StepPayload::Confirmation,
        };
        store.append(id, &step).unwrap();
        assert!(store.append(id, &step).is_err());
    }

    #[test]
    fn finishing_unknown_run_is_not_found() {
        let store = StepStore::in_memory().unwrap();
        let err = store
            .finish_run(SessionId::new(), RunOutcome::Aborted)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
