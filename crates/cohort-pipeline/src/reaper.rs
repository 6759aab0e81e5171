//! Abandonment reaper.
//!
//! Converts non-terminal sessions that have been idle longer than the
//! inactivity ceiling into `FAILED` with a timeout reason, so they stop
//! counting toward balance. Runs opportunistically before every balance
//! computation and on demand from the CLI.

use chrono::{DateTime, Utc};
use serde::Serialize;

use cohort_types::{FailureReason, Result, Session};

use crate::pipeline::Pipeline;
use crate::store::SessionStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    /// Non-terminal sessions inspected.
    pub scanned: usize,
    /// Participants whose sessions this pass moved to `FAILED`.
    pub failed: Vec<String>,
}

/// True when a non-terminal session has been idle past `inactivity_seconds`.
pub fn is_abandoned(session: &Session, now: DateTime<Utc>, inactivity_seconds: i64) -> bool {
    !session.is_terminal() && session.idle_seconds(now) > inactivity_seconds
}

/// Mark `session` failed with a timeout at its current stage.
///
/// The caller persists the result. An already terminal session is left
/// untouched and reported through [`Session::fail`]'s error.
pub fn expire(session: &mut Session, pipeline: &Pipeline, now: DateTime<Utc>) -> Result<()> {
    let stage_id = pipeline
        .stage_at(session.current_stage_index)
        .map(|s| s.id.clone());
    let elapsed_seconds = session.elapsed_seconds(now);
    session.fail(stage_id, FailureReason::Timeout { elapsed_seconds }, now)
}

/// One reaper pass over every session of `pipeline`.
///
/// Safe to run concurrently with itself: the store only writes rows that are
/// still non-terminal, so a session already failed by another pass is skipped.
pub async fn reap_abandoned(
    store: &dyn SessionStore,
    pipeline: &Pipeline,
    now: DateTime<Utc>,
    inactivity_seconds: i64,
) -> Result<ReapReport> {
    let mut report = ReapReport::default();
    for mut session in store.list_sessions(pipeline.code()).await? {
        if session.is_terminal() {
            continue;
        }
        report.scanned += 1;
        if !is_abandoned(&session, now, inactivity_seconds) {
            continue;
        }
        let idle = session.idle_seconds(now);
        expire(&mut session, pipeline, now)?;
        if store.update_session(&session).await? {
            tracing::warn!(
                participant = %session.participant_id,
                pipeline = %pipeline.code(),
                idle_seconds = idle,
                "Session abandoned; marked failed (timeout)"
            );
            report.failed.push(session.participant_id);
        }
    }
    if !report.failed.is_empty() {
        tracing::info!(pipeline = %pipeline.code(), count = report.failed.len(), "Reaper pass complete");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::PipelineDefinition;
    use crate::store::MemoryStore;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn pipeline() -> Pipeline {
        let def = PipelineDefinition::from_yaml_str(
            r#"
code: study
stages:
  - id: s1
    variants: [a]
    validators: { a: { kind: attention_checks, checks: [{ key: q, expected: 1 }] } }
  - id: s2
    variants: [b]
    validators: { b: { kind: attention_checks, checks: [{ key: q, expected: 1 }] } }
"#,
        )
        .unwrap();
        Pipeline::from_definition(def).unwrap()
    }

    #[test]
    fn abandonment_uses_updated_at() {
        let mut s = Session::new("study", "p1", t0());
        assert!(!is_abandoned(&s, t0() + Duration::seconds(1200), 1200));
        assert!(is_abandoned(&s, t0() + Duration::seconds(1201), 1200));
        s.touch(t0() + Duration::seconds(1000));
        assert!(!is_abandoned(&s, t0() + Duration::seconds(1201), 1200));

        s.completed = true;
        assert!(!is_abandoned(&s, t0() + Duration::days(3), 1200));
    }

    #[tokio::test]
    async fn stale_sessions_fail_with_timeout_at_current_stage() {
        let store = MemoryStore::new();
        let p = pipeline();

        let mut stale = Session::new("study", "stale", t0());
        stale.current_stage_index = 1;
        store.create_session(stale).await.unwrap();

        let mut active = Session::new("study", "active", t0());
        active.touch(t0() + Duration::seconds(1500));
        store.create_session(active).await.unwrap();

        let now = t0() + Duration::seconds(1600);
        let report = reap_abandoned(&store, &p, now, 1200).await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.failed, vec!["stale".to_string()]);

        let s = store.get_session("study", "stale").await.unwrap().unwrap();
        assert!(s.failed);
        assert!(!s.completed);
        assert_eq!(s.failed_stage_id.as_deref(), Some("s2"));
        assert_eq!(s.failed_reason, Some(FailureReason::Timeout { elapsed_seconds: 1600 }));

        let a = store.get_session("study", "active").await.unwrap().unwrap();
        assert!(!a.failed);
    }

    #[tokio::test]
    async fn second_pass_is_a_no_op() {
        let store = MemoryStore::new();
        let p = pipeline();
        store
            .create_session(Session::new("study", "stale", t0()))
            .await
            .unwrap();

        let now = t0() + Duration::seconds(5000);
        let first = reap_abandoned(&store, &p, now, 1200).await.unwrap();
        assert_eq!(first.failed.len(), 1);
        let before = store.get_session("study", "stale").await.unwrap();

        let second = reap_abandoned(&store, &p, now + Duration::seconds(60), 1200)
            .await
            .unwrap();
        assert_eq!(second, ReapReport::default());
        assert_eq!(store.get_session("study", "stale").await.unwrap(), before);
    }

    #[tokio::test]
    async fn concurrent_passes_fail_each_session_once() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let p = std::sync::Arc::new(pipeline());
        for i in 0..5 {
            store
                .create_session(Session::new("study", format!("p{i}"), t0()))
                .await
                .unwrap();
        }
        let now = t0() + Duration::seconds(3000);
        let (a, b) = tokio::join!(
            reap_abandoned(store.as_ref(), &p, now, 1200),
            reap_abandoned(store.as_ref(), &p, now, 1200)
        );
        let total = a.unwrap().failed.len() + b.unwrap().failed.len();
        assert_eq!(total, 5);
    }
}
