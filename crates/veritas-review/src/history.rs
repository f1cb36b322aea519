//! SQLite record of finished verification runs.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use veritas_core::{RunStatus, Verdict, VerificationRun, VeritasError};

use crate::ports::ReviewHistory;

/// One finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// `owner/name`.
    pub repo: String,
    /// Pull request number.
    pub pr_number: u64,
    /// Ref the evidence was read at.
    pub head_ref: String,
    /// Terminal status.
    pub status: RunStatus,
    /// Refinement passes.
    pub iterations: u32,
    /// Chargeable calls spent.
    pub calls_spent: u32,
    /// Confirmed claims in the final pass.
    pub confirmed: u32,
    /// Unverifiable claims in the final pass.
    pub unverifiable: u32,
    /// Refuted claims across the run.
    pub refuted: u32,
    /// Failure reason for FAILED runs.
    pub failure: Option<String>,
    /// Every claim of the run, as JSON.
    pub claims_json: String,
    /// Published review text.
    pub final_text: String,
    /// Model that wrote the review.
    pub model: String,
    /// When the run finished.
    pub created_at: DateTime<Utc>,
}

impl HistoryEntry {
    /// Summarise a finished run.
    ///
    /// # Errors
    ///
    /// Returns [`VeritasError::Serialization`] if the claims cannot be encoded.
    pub fn from_run(run: &VerificationRun, model: &str) -> Result<Self, VeritasError> {
        let refuted = run
            .claims
            .iter()
            .filter(|c| c.verdict == Verdict::Refuted)
            .count();
        Ok(Self {
            repo: run.pr.repo.to_string(),
            pr_number: run.pr.number,
            head_ref: run.head_ref.clone(),
            status: run.status,
            iterations: run.iteration,
            calls_spent: run.budget.spent(),
            confirmed: run.count(Verdict::Confirmed) as u32,
            unverifiable: run.count(Verdict::Unverifiable) as u32,
            refuted: refuted as u32,
            failure: run.failure.clone(),
            claims_json: serde_json::to_string(&run.claims)?,
            final_text: run.final_text.clone().unwrap_or_default(),
            model: model.to_string(),
            created_at: Utc::now(),
        })
    }
}

/// [`ReviewHistory`] backed by a SQLite file.
///
/// # Examples
///
/// ```
/// use veritas_review::history::SqliteHistory;
///
/// let history = SqliteHistory::in_memory().unwrap();
/// assert!(history.recent(10).unwrap().is_empty());
/// ```
pub struct SqliteHistory {
    conn: Mutex<Connection>,
}

impl SqliteHistory {
    /// Open or create the history database at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`VeritasError::Database`] if the database cannot be opened.
    pub fn open(path: &Path) -> Result<Self, VeritasError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                VeritasError::Database(format!("failed to create history directory: {e}"))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| VeritasError::Database(format!("failed to open database: {e}")))?;
        Self::with_connection(conn)
    }

    /// In-memory database, for tests and dry runs.
    ///
    /// # Errors
    ///
    /// Returns [`VeritasError::Database`] if schema creation fails.
    pub fn in_memory() -> Result<Self, VeritasError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            VeritasError::Database(format!("failed to create in-memory database: {e}"))
        })?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, VeritasError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                repo TEXT NOT NULL,
                pr_number INTEGER NOT NULL,
                head_ref TEXT NOT NULL,
                status TEXT NOT NULL,
                iterations INTEGER NOT NULL,
                calls_spent INTEGER NOT NULL,
                confirmed INTEGER NOT NULL,
                unverifiable INTEGER NOT NULL,
                refuted INTEGER NOT NULL,
                failure TEXT,
                claims_json TEXT NOT NULL,
                final_text TEXT NOT NULL,
                model TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS runs_by_pr ON runs(repo, pr_number);
            ",
        )
        .map_err(|e| VeritasError::Database(format!("failed to create schema: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, VeritasError> {
        self.conn
            .lock()
            .map_err(|_| VeritasError::Database("history connection poisoned".into()))
    }

    /// Insert one entry.
    ///
    /// # Errors
    ///
    /// Returns [`VeritasError::Database`] on insert failure.
    pub fn insert(&self, entry: &HistoryEntry) -> Result<(), VeritasError> {
        self.lock()?
            .execute(
                "INSERT INTO runs (repo, pr_number, head_ref, status, iterations, calls_spent,
                    confirmed, unverifiable, refuted, failure, claims_json, final_text, model, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    entry.repo,
                    entry.pr_number as i64,
                    entry.head_ref,
                    entry.status.to_string(),
                    entry.iterations,
                    entry.calls_spent,
                    entry.confirmed,
                    entry.unverifiable,
                    entry.refuted,
                    entry.failure,
                    entry.claims_json,
                    entry.final_text,
                    entry.model,
                    entry.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| VeritasError::Database(format!("failed to record run: {e}")))?;
        Ok(())
    }

    /// The newest `limit` entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`VeritasError::Database`] on query failure.
    pub fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>, VeritasError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT repo, pr_number, head_ref, status, iterations, calls_spent, confirmed,
                        unverifiable, refuted, failure, claims_json, final_text, model, created_at
                 FROM runs ORDER BY id DESC LIMIT ?1",
            )
            .map_err(|e| VeritasError::Database(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let status: String = row.get(3)?;
                let created_at: String = row.get(13)?;
                let pr_number: i64 = row.get(1)?;
                Ok(HistoryEntry {
                    repo: row.get(0)?,
                    pr_number: pr_number as u64,
                    head_ref: row.get(2)?,
                    status: parse_status(&status),
                    iterations: row.get(4)?,
                    calls_spent: row.get(5)?,
                    confirmed: row.get(6)?,
                    unverifiable: row.get(7)?,
                    refuted: row.get(8)?,
                    failure: row.get(9)?,
                    claims_json: row.get(10)?,
                    final_text: row.get(11)?,
                    model: row.get(12)?,
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_default(),
                })
            })
            .map_err(|e| VeritasError::Database(format!("failed to query history: {e}")))?;

        let entries = rows
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| VeritasError::Database(format!("failed to read history row: {e}")))?;
        Ok(entries)
    }
}

#[async_trait]
impl ReviewHistory for SqliteHistory {
    async fn record(&self, entry: &HistoryEntry) -> Result<(), VeritasError> {
        self.insert(entry)
    }
}

fn parse_status(raw: &str) -> RunStatus {
    match raw {
        "CONVERGED" => RunStatus::Converged,
        "BUDGET_EXCEEDED" => RunStatus::BudgetExceeded,
        "FAILED" => RunStatus::Failed,
        _ => RunStatus::InProgress,
    }
}

#[cfg(test)]
mod tests {
    use veritas_core::{Budget, Claim, ClaimKind, CommentRef, PullRequestId};

    use super::*;

    fn finished_run(number: u64, status: RunStatus) -> VerificationRun {
        let mut run = VerificationRun::new(
            PullRequestId::new("octo", "app", number),
            "abc123",
            CommentRef(1),
            Budget::limited(5),
        );
        let mut claim = Claim::new(1, "missing import `os`", ClaimKind::MissingCode).with_file("a.py");
        claim.decide(Verdict::Refuted, Some("L1: import os".into()));
        run.begin_pass(vec![claim, Claim::new(2, "style nit", ClaimKind::Style)]);
        run.budget.try_spend();
        run.finish(status, "Summary.".into());
        run
    }

    #[test]
    fn entry_summarises_run() {
        let entry = HistoryEntry::from_run(&finished_run(7, RunStatus::Converged), "gpt-4o").unwrap();
        assert_eq!(entry.repo, "octo/app");
        assert_eq!(entry.pr_number, 7);
        assert_eq!(entry.refuted, 1);
        assert_eq!(entry.unverifiable, 1);
        assert_eq!(entry.calls_spent, 1);
        assert!(entry.claims_json.contains("missing import"));
    }

    #[test]
    fn recent_returns_newest_first() {
        let history = SqliteHistory::in_memory().unwrap();
        for (n, status) in [(1, RunStatus::Converged), (2, RunStatus::BudgetExceeded), (3, RunStatus::Failed)] {
            history
                .insert(&HistoryEntry::from_run(&finished_run(n, status), "gpt-4o").unwrap())
                .unwrap();
        }
        let recent = history.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].pr_number, 3);
        assert_eq!(recent[0].status, RunStatus::Failed);
        assert_eq!(recent[1].status, RunStatus::BudgetExceeded);
        assert_eq!(recent[1].final_text, "Summary.");
    }

    #[tokio::test]
    async fn record_through_the_port() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.db");
        let history = SqliteHistory::open(&path).unwrap();
        let entry = HistoryEntry::from_run(&finished_run(4, RunStatus::Converged), "gpt-4o").unwrap();
        ReviewHistory::record(&history, &entry).await.unwrap();
        assert!(path.exists());

        let reopened = SqliteHistory::open(&path).unwrap();
        let rows = reopened.recent(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].model, "gpt-4o");
        assert_eq!(rows[0].created_at.timestamp(), entry.created_at.timestamp());
    }
}
