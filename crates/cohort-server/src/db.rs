//! SQLite implementation of the storage port.
//!
//! Timestamps are stored as RFC 3339 text and maps as JSON text. The
//! conditional `UPDATE ... WHERE completed = 0 AND failed = 0` is what keeps
//! terminal rows immutable under concurrent writers.

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use cohort_pipeline::SessionStore;
use cohort_types::{CohortError, FailureReason, Result, Session, Submission};

/// Session and submission store backed by a SQLite pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

type SessionRow = (
    String,
    String,
    String,
    String,
    i64,
    bool,
    bool,
    Option<String>,
    Option<String>,
    String,
    String,
    Option<i64>,
);

type SubmissionRow = (
    i64,
    String,
    String,
    String,
    String,
    String,
    String,
    bool,
    String,
    Option<i64>,
    Option<i64>,
    String,
);

const SESSION_COLUMNS: &str = "pipeline_code, participant_id, conditions, stage_variants, \
     current_stage_index, completed, failed, failed_stage_id, failed_reason, \
     started_at, updated_at, total_seconds";

const SUBMISSION_COLUMNS: &str = "id, pipeline_code, participant_id, stage_id, variant_id, \
     conditions, answers, passed, verdict, stage_seconds, total_seconds, submitted_at";

impl SqliteStore {
    /// Open (creating if needed) the database at `url` and ensure the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(storage)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(storage)?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and ensure the schema.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create tables (idempotent).
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                pipeline_code       TEXT    NOT NULL,
                participant_id      TEXT    NOT NULL,
                conditions          TEXT    NOT NULL DEFAULT '{}',
                stage_variants      TEXT    NOT NULL DEFAULT '{}',
                current_stage_index INTEGER NOT NULL DEFAULT 0,
                completed           INTEGER NOT NULL DEFAULT 0,
                failed              INTEGER NOT NULL DEFAULT 0,
                failed_stage_id     TEXT,
                failed_reason       TEXT,
                started_at          TEXT    NOT NULL,
                updated_at          TEXT    NOT NULL,
                total_seconds       INTEGER,
                PRIMARY KEY (pipeline_code, participant_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS submissions (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                pipeline_code  TEXT    NOT NULL,
                participant_id TEXT    NOT NULL,
                stage_id       TEXT    NOT NULL,
                variant_id     TEXT    NOT NULL,
                conditions     TEXT    NOT NULL DEFAULT '{}',
                answers        TEXT    NOT NULL,
                passed         INTEGER NOT NULL,
                verdict        TEXT    NOT NULL,
                stage_seconds  INTEGER,
                total_seconds  INTEGER,
                submitted_at   TEXT    NOT NULL,
                UNIQUE (pipeline_code, stage_id, participant_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(())
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn get_session(&self, pipeline: &str, participant: &str) -> Result<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE pipeline_code = ? AND participant_id = ?"
        ))
        .bind(pipeline)
        .bind(participant)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        row.map(session_from_row).transpose()
    }

    async fn create_session(&self, session: Session) -> Result<(Session, bool)> {
        let done = sqlx::query(&format!(
            "INSERT OR IGNORE INTO sessions ({SESSION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&session.pipeline_code)
        .bind(&session.participant_id)
        .bind(to_json(&session.conditions)?)
        .bind(to_json(&session.stage_variants)?)
        .bind(session.current_stage_index as i64)
        .bind(session.completed)
        .bind(session.failed)
        .bind(&session.failed_stage_id)
        .bind(session.failed_reason.as_ref().map(to_json).transpose()?)
        .bind(timestamp(&session.started_at))
        .bind(timestamp(&session.updated_at))
        .bind(session.total_seconds)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        let inserted = done.rows_affected() == 1;

        let stored = self
            .get_session(&session.pipeline_code, &session.participant_id)
            .await?
            .ok_or_else(|| {
                CohortError::Storage(format!(
                    "session '{}' vanished after insert",
                    session.participant_id
                ))
            })?;
        Ok((stored, inserted))
    }

    async fn update_session(&self, session: &Session) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE sessions
            SET conditions = json_patch(?, conditions),
                stage_variants = json_patch(?, stage_variants),
                current_stage_index = ?,
                completed = ?, failed = ?, failed_stage_id = ?, failed_reason = ?,
                updated_at = ?, total_seconds = ?
            WHERE pipeline_code = ? AND participant_id = ?
              AND completed = 0 AND failed = 0
              AND current_stage_index <= ?
            "#,
        )
        .bind(to_json(&session.conditions)?)
        .bind(to_json(&session.stage_variants)?)
        .bind(session.current_stage_index as i64)
        .bind(session.completed)
        .bind(session.failed)
        .bind(&session.failed_stage_id)
        .bind(session.failed_reason.as_ref().map(to_json).transpose()?)
        .bind(timestamp(&session.updated_at))
        .bind(session.total_seconds)
        .bind(&session.pipeline_code)
        .bind(&session.participant_id)
        .bind(session.current_stage_index as i64)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(updated.rows_affected() == 1)
    }

    async fn list_sessions(&self, pipeline: &str) -> Result<Vec<Session>> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE pipeline_code = ? ORDER BY started_at"
        ))
        .bind(pipeline)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.into_iter().map(session_from_row).collect()
    }

    async fn get_submission(
        &self,
        pipeline: &str,
        stage: &str,
        participant: &str,
    ) -> Result<Option<Submission>> {
        let row = sqlx::query_as::<_, SubmissionRow>(&format!(
            "SELECT {SUBMISSION_COLUMNS} FROM submissions \
             WHERE pipeline_code = ? AND stage_id = ? AND participant_id = ?"
        ))
        .bind(pipeline)
        .bind(stage)
        .bind(participant)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        row.map(submission_from_row).transpose()
    }

    async fn insert_submission(&self, mut submission: Submission) -> Result<Submission> {
        let result = sqlx::query(
            r#"
            INSERT INTO submissions (
                pipeline_code, participant_id, stage_id, variant_id, conditions,
                answers, passed, verdict, stage_seconds, total_seconds, submitted_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&submission.pipeline_code)
        .bind(&submission.participant_id)
        .bind(&submission.stage_id)
        .bind(&submission.variant_id)
        .bind(to_json(&submission.conditions)?)
        .bind(to_json(&submission.answers)?)
        .bind(submission.passed)
        .bind(to_json(&submission.verdict)?)
        .bind(submission.stage_seconds)
        .bind(submission.total_seconds)
        .bind(timestamp(&submission.submitted_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => {
                submission.id = Some(done.last_insert_rowid());
                Ok(submission)
            }
            Err(e) if is_unique_violation(&e) => Err(CohortError::DuplicateSubmission {
                stage: submission.stage_id,
            }),
            Err(e) => Err(storage(e)),
        }
    }

    async fn list_submissions(&self, pipeline: &str) -> Result<Vec<Submission>> {
        let rows = sqlx::query_as::<_, SubmissionRow>(&format!(
            "SELECT {SUBMISSION_COLUMNS} FROM submissions WHERE pipeline_code = ? ORDER BY id"
        ))
        .bind(pipeline)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.into_iter().map(submission_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn session_from_row(row: SessionRow) -> Result<Session> {
    let (
        pipeline_code,
        participant_id,
        conditions,
        stage_variants,
        current_stage_index,
        completed,
        failed,
        failed_stage_id,
        failed_reason,
        started_at,
        updated_at,
        total_seconds,
    ) = row;
    Ok(Session {
        pipeline_code,
        participant_id,
        conditions: serde_json::from_str::<BTreeMap<String, String>>(&conditions)?,
        stage_variants: serde_json::from_str::<BTreeMap<String, String>>(&stage_variants)?,
        current_stage_index: usize::try_from(current_stage_index).unwrap_or(0),
        completed,
        failed,
        failed_stage_id,
        failed_reason: failed_reason
            .as_deref()
            .map(serde_json::from_str::<FailureReason>)
            .transpose()?,
        started_at: parse_timestamp(&started_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        total_seconds,
    })
}

fn submission_from_row(row: SubmissionRow) -> Result<Submission> {
    let (
        id,
        pipeline_code,
        participant_id,
        stage_id,
        variant_id,
        conditions,
        answers,
        passed,
        verdict,
        stage_seconds,
        total_seconds,
        submitted_at,
    ) = row;
    Ok(Submission {
        id: Some(id),
        pipeline_code,
        participant_id,
        stage_id,
        variant_id,
        conditions: serde_json::from_str(&conditions)?,
        answers: serde_json::from_str(&answers)?,
        passed,
        verdict: serde_json::from_str(&verdict)?,
        stage_seconds,
        total_seconds,
        submitted_at: parse_timestamp(&submitted_at)?,
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CohortError::Storage(format!("bad timestamp '{raw}': {e}")))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

/// Classify a driver error. Pool exhaustion and I/O are reported as unavailable.
fn storage(e: sqlx::Error) -> CohortError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            CohortError::StorageUnavailable(e.to_string())
        }
        other => CohortError::Storage(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    async fn memory_store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteStore::from_pool(pool).await.unwrap()
    }

    fn submission(stage: &str) -> Submission {
        Submission {
            id: None,
            pipeline_code: "study".into(),
            participant_id: "p1".into(),
            stage_id: stage.into(),
            variant_id: "a".into(),
            conditions: BTreeMap::from([("iv1".to_string(), "x".to_string())]),
            answers: json!({"q": 1}),
            passed: true,
            verdict: json!({"kind": "attention_checks", "results": []}),
            stage_seconds: Some(12),
            total_seconds: Some(30),
            submitted_at: t0() + Duration::seconds(30),
        }
    }

    #[tokio::test]
    async fn create_is_insert_or_get() {
        let store = memory_store().await;
        let mut first = Session::new("study", "p1", t0());
        first.assign_condition("iv1", "x");
        let (stored, created) = store.create_session(first.clone()).await.unwrap();
        assert!(created);
        assert_eq!(stored, first);

        let mut second = Session::new("study", "p1", t0() + Duration::seconds(5));
        second.assign_condition("iv1", "y");
        let (stored, created) = store.create_session(second).await.unwrap();
        assert!(!created);
        assert_eq!(stored.conditions["iv1"], "x", "existing row is never overwritten");
    }

    #[tokio::test]
    async fn terminal_rows_are_immutable() {
        let store = memory_store().await;
        let (mut s, _) = store
            .create_session(Session::new("study", "p1", t0()))
            .await
            .unwrap();

        s.lock_variant("s1", "a");
        assert!(store.update_session(&s).await.unwrap());

        s.fail(
            Some("s1".into()),
            FailureReason::Timeout { elapsed_seconds: 1300 },
            t0() + Duration::seconds(1300),
        )
        .unwrap();
        assert!(store.update_session(&s).await.unwrap());

        let mut resurrect = s.clone();
        resurrect.failed = false;
        resurrect.current_stage_index = 1;
        assert!(!store.update_session(&resurrect).await.unwrap());

        let stored = store.get_session("study", "p1").await.unwrap().unwrap();
        assert!(stored.failed);
        assert_eq!(stored.stage_variants["s1"], "a");
        assert_eq!(stored.failed_reason, Some(FailureReason::Timeout { elapsed_seconds: 1300 }));
        assert_eq!(stored.updated_at, t0() + Duration::seconds(1300));
    }

    #[tokio::test]
    async fn stale_write_cannot_rewind_index_or_relock() {
        let store = memory_store().await;
        let (mut s, _) = store
            .create_session(Session::new("study", "p1", t0()))
            .await
            .unwrap();
        s.assign_condition("iv1", "x");
        s.lock_variant("s1", "a");
        let mut stale = s.clone();

        s.advance(2, t0() + Duration::seconds(40)).unwrap();
        assert!(store.update_session(&s).await.unwrap());

        assert!(!store.update_session(&stale).await.unwrap());
        let stored = store.get_session("study", "p1").await.unwrap().unwrap();
        assert_eq!(stored.current_stage_index, 1);

        // same index: written, but stored locks stay put
        stale.current_stage_index = 1;
        stale.conditions.insert("iv1".into(), "y".into());
        stale.lock_variant("s2", "b");
        assert!(store.update_session(&stale).await.unwrap());
        let stored = store.get_session("study", "p1").await.unwrap().unwrap();
        assert_eq!(stored.conditions["iv1"], "x");
        assert_eq!(stored.stage_variants["s1"], "a");
        assert_eq!(stored.stage_variants["s2"], "b");
    }

    #[tokio::test]
    async fn update_of_missing_row_reports_false() {
        let store = memory_store().await;
        let ghost = Session::new("study", "ghost", t0());
        assert!(!store.update_session(&ghost).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_submission_hits_unique_constraint() {
        let store = memory_store().await;
        let saved = store.insert_submission(submission("s1")).await.unwrap();
        assert!(saved.id.is_some());

        let err = store.insert_submission(submission("s1")).await.unwrap_err();
        assert!(matches!(err, CohortError::DuplicateSubmission { ref stage } if stage == "s1"));

        store.insert_submission(submission("s2")).await.unwrap();
        let all = store.list_submissions("study").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].verdict["kind"], "attention_checks");
        assert_eq!(all[0].conditions["iv1"], "x");

        let one = store.get_submission("study", "s2", "p1").await.unwrap().unwrap();
        assert_eq!(one.stage_seconds, Some(12));
        assert!(store.get_submission("study", "s3", "p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sessions_are_scoped_by_pipeline() {
        let store = memory_store().await;
        store.create_session(Session::new("a", "p1", t0())).await.unwrap();
        store.create_session(Session::new("b", "p1", t0())).await.unwrap();
        store.create_session(Session::new("a", "p2", t0())).await.unwrap();

        assert_eq!(store.list_sessions("a").await.unwrap().len(), 2);
        assert_eq!(store.list_sessions("b").await.unwrap().len(), 1);
        assert!(store.get_session("c", "p1").await.unwrap().is_none());
    }
}
