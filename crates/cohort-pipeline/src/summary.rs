//! Read-only admin summary: one denormalised row per participant.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use cohort_types::{FailureReason, Session, SessionStatus, Submission};

use crate::pipeline::Pipeline;
use crate::session::state;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage_id: String,
    pub variant_id: String,
    pub passed: bool,
    pub verdict: Value,
    pub stage_seconds: Option<i64>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub participant_id: String,
    pub status: SessionStatus,
    pub conditions: BTreeMap<String, String>,
    pub stage_variants: BTreeMap<String, String>,
    pub current_stage_index: usize,
    pub stages: Vec<StageSummary>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total_seconds: Option<i64>,
    pub failed_stage_id: Option<String>,
    pub failed_reason: Option<FailureReason>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_progress: usize,
    /// factor -> value -> sessions
    pub by_condition: BTreeMap<String, BTreeMap<String, usize>>,
    /// Mean over completed sessions; `None` when nobody completed.
    pub mean_total_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub stats: SummaryStats,
    pub data: Vec<ParticipantSummary>,
}

/// Row filter. `conditions` entries must all match exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SummaryFilter {
    pub status: Option<SessionStatus>,
    #[serde(default)]
    pub conditions: BTreeMap<String, String>,
}

impl SummaryFilter {
    fn matches(&self, row: &ParticipantSummary) -> bool {
        if let Some(status) = self.status {
            let row_status = if row.status.is_terminal() {
                row.status
            } else {
                SessionStatus::InStage
            };
            let want = if status.is_terminal() { status } else { SessionStatus::InStage };
            if row_status != want {
                return false;
            }
        }
        self.conditions
            .iter()
            .all(|(factor, value)| row.conditions.get(factor) == Some(value))
    }
}

/// Join sessions with their submissions, filter, and aggregate.
///
/// Stats are computed over the filtered rows. `resolving` and `inStage`
/// both count as in progress.
pub fn build_summary(
    pipeline: &Pipeline,
    sessions: Vec<Session>,
    submissions: Vec<Submission>,
    filter: &SummaryFilter,
) -> Summary {
    let mut by_participant: HashMap<String, Vec<Submission>> = HashMap::new();
    for sub in submissions {
        by_participant
            .entry(sub.participant_id.clone())
            .or_default()
            .push(sub);
    }

    let stage_order = |id: &str| pipeline.stage_index(id).unwrap_or(usize::MAX);

    let mut data: Vec<ParticipantSummary> = sessions
        .into_iter()
        .map(|session| {
            let mut subs = by_participant.remove(&session.participant_id).unwrap_or_default();
            subs.sort_by_key(|s| (stage_order(&s.stage_id), s.submitted_at));
            let stages = subs
                .into_iter()
                .map(|s| StageSummary {
                    stage_id: s.stage_id,
                    variant_id: s.variant_id,
                    passed: s.passed,
                    verdict: s.verdict,
                    stage_seconds: s.stage_seconds,
                    submitted_at: s.submitted_at,
                })
                .collect();
            ParticipantSummary {
                status: state(&session, pipeline).status(),
                participant_id: session.participant_id,
                conditions: session.conditions,
                stage_variants: session.stage_variants,
                current_stage_index: session.current_stage_index,
                stages,
                started_at: session.started_at,
                updated_at: session.updated_at,
                total_seconds: session.total_seconds,
                failed_stage_id: session.failed_stage_id,
                failed_reason: session.failed_reason,
            }
        })
        .filter(|row| filter.matches(row))
        .collect();

    data.sort_by(|a, b| {
        b.started_at
            .cmp(&a.started_at)
            .then_with(|| a.participant_id.cmp(&b.participant_id))
    });

    Summary {
        stats: stats(&data),
        data,
    }
}

fn stats(rows: &[ParticipantSummary]) -> SummaryStats {
    let mut out = SummaryStats {
        total: rows.len(),
        ..Default::default()
    };
    let mut total_seconds = Vec::new();
    for row in rows {
        match row.status {
            SessionStatus::Completed => {
                out.completed += 1;
                if let Some(t) = row.total_seconds {
                    total_seconds.push(t);
                }
            }
            SessionStatus::Failed => out.failed += 1,
            SessionStatus::Resolving | SessionStatus::InStage => out.in_progress += 1,
        }
        for (factor, value) in &row.conditions {
            *out.by_condition
                .entry(factor.clone())
                .or_default()
                .entry(value.clone())
                .or_insert(0) += 1;
        }
    }
    if !total_seconds.is_empty() {
        let sum: i64 = total_seconds.iter().sum();
        out.mean_total_seconds = Some(sum as f64 / total_seconds.len() as f64);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::PipelineDefinition;
    use chrono::Duration;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn pipeline() -> Pipeline {
        let def = PipelineDefinition::from_yaml_str(
            r#"
code: study
factors:
  - name: iv1
    values: [x, y]
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

    fn session(id: &str, iv1: &str, offset: i64) -> Session {
        let mut s = Session::new("study", id, t0() + Duration::seconds(offset));
        s.assign_condition("iv1", iv1);
        s.lock_variant("s1", "a");
        s.lock_variant("s2", "b");
        s
    }

    fn submission(participant: &str, stage: &str, at: i64) -> Submission {
        Submission {
            id: None,
            pipeline_code: "study".into(),
            participant_id: participant.into(),
            stage_id: stage.into(),
            variant_id: if stage == "s1" { "a".into() } else { "b".into() },
            conditions: BTreeMap::new(),
            answers: json!({"q": 1}),
            passed: true,
            verdict: json!({"kind": "attention_checks"}),
            stage_seconds: Some(30),
            total_seconds: None,
            submitted_at: t0() + Duration::seconds(at),
        }
    }

    fn fixture() -> (Vec<Session>, Vec<Submission>) {
        let mut done = session("done", "x", 0);
        done.advance(2, t0() + Duration::seconds(100)).unwrap();
        done.advance(2, t0() + Duration::seconds(300)).unwrap();

        let mut failed = session("failed", "y", 10);
        failed
            .fail(Some("s1".into()), FailureReason::Timeout { elapsed_seconds: 2000 }, t0())
            .unwrap();

        let active = session("active", "x", 20);

        let subs = vec![
            submission("done", "s2", 300),
            submission("done", "s1", 100),
            submission("failed", "s1", 50),
        ];
        (vec![done, failed, active], subs)
    }

    #[test]
    fn rows_sorted_newest_first_with_stages_in_pipeline_order() {
        let (sessions, subs) = fixture();
        let summary = build_summary(&pipeline(), sessions, subs, &SummaryFilter::default());

        let ids: Vec<_> = summary.data.iter().map(|r| r.participant_id.as_str()).collect();
        assert_eq!(ids, vec!["active", "failed", "done"]);

        let done = &summary.data[2];
        assert_eq!(done.status, SessionStatus::Completed);
        let stage_ids: Vec<_> = done.stages.iter().map(|s| s.stage_id.as_str()).collect();
        assert_eq!(stage_ids, vec!["s1", "s2"]);
        assert_eq!(done.total_seconds, Some(300));
    }

    #[test]
    fn stats_count_statuses_and_conditions() {
        let (sessions, subs) = fixture();
        let stats = build_summary(&pipeline(), sessions, subs, &SummaryFilter::default()).stats;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.in_progress, 1);
        assert_eq!(stats.by_condition["iv1"]["x"], 2);
        assert_eq!(stats.by_condition["iv1"]["y"], 1);
        assert_eq!(stats.mean_total_seconds, Some(300.0));
    }

    #[test]
    fn filter_by_status_and_condition() {
        let (sessions, subs) = fixture();
        let filter = SummaryFilter {
            status: Some(SessionStatus::Failed),
            conditions: BTreeMap::new(),
        };
        let summary = build_summary(&pipeline(), sessions.clone(), subs.clone(), &filter);
        assert_eq!(summary.data.len(), 1);
        assert_eq!(summary.data[0].participant_id, "failed");
        assert_eq!(summary.data[0].stages.len(), 1);

        let filter = SummaryFilter {
            status: None,
            conditions: BTreeMap::from([("iv1".to_string(), "x".to_string())]),
        };
        let summary = build_summary(&pipeline(), sessions.clone(), subs.clone(), &filter);
        assert_eq!(summary.stats.total, 2);

        // resolving and inStage are both "in progress"
        let filter = SummaryFilter {
            status: Some(SessionStatus::Resolving),
            conditions: BTreeMap::new(),
        };
        let summary = build_summary(&pipeline(), sessions, subs, &filter);
        assert_eq!(summary.data.len(), 1);
        assert_eq!(summary.data[0].participant_id, "active");
    }

    #[test]
    fn empty_summary_has_no_mean() {
        let summary = build_summary(&pipeline(), vec![], vec![], &SummaryFilter::default());
        assert_eq!(summary.stats.total, 0);
        assert!(summary.stats.mean_total_seconds.is_none());
    }
}
