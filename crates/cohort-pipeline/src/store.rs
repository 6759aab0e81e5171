//! Storage port for sessions and submissions.
//!
//! The orchestration core only talks to [`SessionStore`]. [`MemoryStore`]
//! backs tests and single-process runs; the server crate provides a SQLite
//! implementation with the same contract.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use cohort_types::{CohortError, Result, Session, Submission};

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_session(&self, pipeline: &str, participant: &str) -> Result<Option<Session>>;

    /// Insert `session` unless a row for (pipeline, participant) exists.
    /// Returns the stored row and whether this call created it.
    async fn create_session(&self, session: Session) -> Result<(Session, bool)>;

    /// Write `session` only while the stored row is still non-terminal and
    /// its stage index is not ahead of `session`'s. Locks already stored win
    /// over the ones carried by `session`. Returns `false` when the write was
    /// refused (terminal, advanced past `session`, or missing).
    async fn update_session(&self, session: &Session) -> Result<bool>;

    async fn list_sessions(&self, pipeline: &str) -> Result<Vec<Session>>;

    async fn get_submission(
        &self,
        pipeline: &str,
        stage: &str,
        participant: &str,
    ) -> Result<Option<Submission>>;

    /// Append a submission. Fails with [`CohortError::DuplicateSubmission`]
    /// when one already exists for (pipeline, stage, participant).
    async fn insert_submission(&self, submission: Submission) -> Result<Submission>;

    async fn list_submissions(&self, pipeline: &str) -> Result<Vec<Submission>>;
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<(String, String), Session>,
    submissions: Vec<Submission>,
    next_id: i64,
}

/// In-process store guarded by a tokio `RwLock`.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(pipeline: &str, participant: &str) -> (String, String) {
    (pipeline.to_owned(), participant.to_owned())
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get_session(&self, pipeline: &str, participant: &str) -> Result<Option<Session>> {
        let inner = self.inner.read().await;
        Ok(inner.sessions.get(&key(pipeline, participant)).cloned())
    }

    async fn create_session(&self, session: Session) -> Result<(Session, bool)> {
        let mut inner = self.inner.write().await;
        let k = key(&session.pipeline_code, &session.participant_id);
        if let Some(existing) = inner.sessions.get(&k) {
            return Ok((existing.clone(), false));
        }
        inner.sessions.insert(k, session.clone());
        Ok((session, true))
    }

    async fn update_session(&self, session: &Session) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner
            .sessions
            .get_mut(&key(&session.pipeline_code, &session.participant_id))
        {
            Some(stored)
                if !stored.is_terminal() && stored.current_stage_index <= session.current_stage_index =>
            {
                let mut next = session.clone();
                next.conditions
                    .extend(stored.conditions.iter().map(|(k, v)| (k.clone(), v.clone())));
                next.stage_variants
                    .extend(stored.stage_variants.iter().map(|(k, v)| (k.clone(), v.clone())));
                *stored = next;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_sessions(&self, pipeline: &str) -> Result<Vec<Session>> {
        let inner = self.inner.read().await;
        Ok(inner
            .sessions
            .values()
            .filter(|s| s.pipeline_code == pipeline)
            .cloned()
            .collect())
    }

    async fn get_submission(
        &self,
        pipeline: &str,
        stage: &str,
        participant: &str,
    ) -> Result<Option<Submission>> {
        let inner = self.inner.read().await;
        Ok(inner
            .submissions
            .iter()
            .find(|s| s.pipeline_code == pipeline && s.stage_id == stage && s.participant_id == participant)
            .cloned())
    }

    async fn insert_submission(&self, mut submission: Submission) -> Result<Submission> {
        let mut inner = self.inner.write().await;
        let exists = inner.submissions.iter().any(|s| {
            s.pipeline_code == submission.pipeline_code
                && s.stage_id == submission.stage_id
                && s.participant_id == submission.participant_id
        });
        if exists {
            return Err(CohortError::DuplicateSubmission {
                stage: submission.stage_id,
            });
        }
        inner.next_id += 1;
        submission.id = Some(inner.next_id);
        inner.submissions.push(submission.clone());
        Ok(submission)
    }

    async fn list_submissions(&self, pipeline: &str) -> Result<Vec<Submission>> {
        let inner = self.inner.read().await;
        Ok(inner
            .submissions
            .iter()
            .filter(|s| s.pipeline_code == pipeline)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use cohort_types::FailureReason;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn submission(stage: &str, participant: &str) -> Submission {
        Submission {
            id: None,
            pipeline_code: "study".into(),
            participant_id: participant.into(),
            stage_id: stage.into(),
            variant_id: "a".into(),
            conditions: BTreeMap::new(),
            answers: json!({}),
            passed: true,
            verdict: json!({"kind": "attention_checks"}),
            stage_seconds: Some(10),
            total_seconds: None,
            submitted_at: now(),
        }
    }

    #[tokio::test]
    async fn create_is_insert_or_get() {
        let store = MemoryStore::new();
        let mut first = Session::new("study", "p1", now());
        first.assign_condition("iv1", "x");
        let (stored, created) = store.create_session(first.clone()).await.unwrap();
        assert!(created);
        assert_eq!(stored, first);

        let (again, created) = store
            .create_session(Session::new("study", "p1", now()))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(again.conditions["iv1"], "x");

        // same participant in another pipeline is a different session
        let (_, created) = store
            .create_session(Session::new("other", "p1", now()))
            .await
            .unwrap();
        assert!(created);
        assert_eq!(store.list_sessions("study").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn terminal_rows_are_immutable() {
        let store = MemoryStore::new();
        let (mut s, _) = store
            .create_session(Session::new("study", "p1", now()))
            .await
            .unwrap();
        s.fail(None, FailureReason::Timeout { elapsed_seconds: 1300 }, now())
            .unwrap();
        assert!(store.update_session(&s).await.unwrap());

        let mut stale = Session::new("study", "p1", now());
        stale.current_stage_index = 1;
        assert!(!store.update_session(&stale).await.unwrap());
        let stored = store.get_session("study", "p1").await.unwrap().unwrap();
        assert!(stored.failed);
        assert_eq!(stored.current_stage_index, 0);
    }

    #[tokio::test]
    async fn stale_index_never_rewinds_stored_row() {
        let store = MemoryStore::new();
        let (mut s, _) = store
            .create_session(Session::new("study", "p1", now()))
            .await
            .unwrap();
        s.lock_variant("s1", "a");
        let stale = s.clone();

        s.advance(2, now()).unwrap();
        assert!(store.update_session(&s).await.unwrap());

        assert!(!store.update_session(&stale).await.unwrap());
        let stored = store.get_session("study", "p1").await.unwrap().unwrap();
        assert_eq!(stored.current_stage_index, 1);
    }

    #[tokio::test]
    async fn stored_locks_win_over_written_ones() {
        let store = MemoryStore::new();
        let (mut s, _) = store
            .create_session(Session::new("study", "p1", now()))
            .await
            .unwrap();
        s.assign_condition("iv1", "x");
        assert!(store.update_session(&s).await.unwrap());

        let mut other = Session::new("study", "p1", now());
        other.assign_condition("iv1", "y");
        other.lock_variant("s1", "b");
        assert!(store.update_session(&other).await.unwrap());

        let stored = store.get_session("study", "p1").await.unwrap().unwrap();
        assert_eq!(stored.conditions["iv1"], "x");
        assert_eq!(stored.stage_variants["s1"], "b");
    }

    #[tokio::test]
    async fn update_of_missing_row_is_rejected() {
        let store = MemoryStore::new();
        let s = Session::new("study", "ghost", now());
        assert!(!store.update_session(&s).await.unwrap());
        assert!(store.get_session("study", "ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_submission_is_rejected() {
        let store = MemoryStore::new();
        let first = store.insert_submission(submission("s1", "p1")).await.unwrap();
        assert_eq!(first.id, Some(1));

        let err = store.insert_submission(submission("s1", "p1")).await.unwrap_err();
        assert!(matches!(err, CohortError::DuplicateSubmission { ref stage } if stage == "s1"));

        let second = store.insert_submission(submission("s2", "p1")).await.unwrap();
        assert_eq!(second.id, Some(2));
        assert!(store.get_submission("study", "s1", "p1").await.unwrap().is_some());
        assert!(store.get_submission("study", "s1", "p2").await.unwrap().is_none());
        assert_eq!(store.list_submissions("study").await.unwrap().len(), 2);
    }
}
