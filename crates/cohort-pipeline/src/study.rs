//! The orchestration core: `init`, `current_stage`, `submit`.
//!
//! A [`Study`] ties an immutable [`Pipeline`], a [`SessionStore`], the
//! [`AssignmentEngine`] and explicit [`StudySettings`] together. It holds no
//! per-participant state of its own; every call is request-response over the
//! store.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use cohort_types::{clamp_stage_seconds, CohortError, FailureReason, Result, Session, Submission};

use crate::assignment::{AssignmentEngine, Resolution};
use crate::definition::StratumKey;
use crate::events::{EventEmitter, StudyEvent};
use crate::pipeline::Pipeline;
use crate::reaper::{expire, reap_abandoned, ReapReport};
use crate::session::{needs_resolution, project, Redirects, SessionView};
use crate::store::SessionStore;
use crate::summary::{build_summary, Summary, SummaryFilter};
use crate::validators::ScoreContext;

/// Twenty minutes, for both ceilings.
pub const DEFAULT_TIMEOUT_SECONDS: i64 = 1200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudySettings {
    /// Ceiling on wall-clock time from session start to a submit.
    pub max_session_seconds: i64,
    /// Ceiling on time since the session was last written.
    pub inactivity_seconds: i64,
    /// Mint a UUID when `init` is called without a participant id.
    pub generate_missing_ids: bool,
    pub redirects: Redirects,
}

impl Default for StudySettings {
    fn default() -> Self {
        Self {
            max_session_seconds: DEFAULT_TIMEOUT_SECONDS,
            inactivity_seconds: DEFAULT_TIMEOUT_SECONDS,
            generate_missing_ids: true,
            redirects: Redirects::default(),
        }
    }
}

/// Business outcome of an accepted submission. Not an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Advanced { next_stage_id: String, verdict: Value },
    Completed { total_seconds: i64, verdict: Value },
    /// The validator said no; the session is now failed.
    Rejected { verdict: Value },
    /// The session ran past a ceiling; the validator's verdict is kept for audit only.
    TimedOut { elapsed_seconds: i64, verdict: Value },
}

impl SubmitOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, SubmitOutcome::Advanced { .. } | SubmitOutcome::Completed { .. })
    }

    pub fn completed(&self) -> bool {
        matches!(self, SubmitOutcome::Completed { .. })
    }

    pub fn locked_out(&self) -> bool {
        !self.passed()
    }

    pub fn verdict(&self) -> &Value {
        match self {
            SubmitOutcome::Advanced { verdict, .. }
            | SubmitOutcome::Completed { verdict, .. }
            | SubmitOutcome::Rejected { verdict }
            | SubmitOutcome::TimedOut { verdict, .. } => verdict,
        }
    }

    pub fn next_stage_id(&self) -> Option<&str> {
        match self {
            SubmitOutcome::Advanced { next_stage_id, .. } => Some(next_stage_id),
            _ => None,
        }
    }
}

pub struct Study {
    pipeline: Arc<Pipeline>,
    store: Arc<dyn SessionStore>,
    engine: AssignmentEngine,
    settings: StudySettings,
    events: EventEmitter,
}

impl Study {
    pub fn new(pipeline: Arc<Pipeline>, store: Arc<dyn SessionStore>, settings: StudySettings) -> Self {
        Self {
            pipeline,
            store,
            engine: AssignmentEngine::new(),
            settings,
            events: EventEmitter::default(),
        }
    }

    pub fn with_engine(mut self, engine: AssignmentEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn settings(&self) -> &StudySettings {
        &self.settings
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn decline_url(&self) -> Option<&str> {
        self.settings.redirects.decline.as_deref()
    }

    // -----------------------------------------------------------------------
    // init
    // -----------------------------------------------------------------------

    pub async fn init(
        &self,
        participant: Option<&str>,
        overrides: &BTreeMap<String, String>,
    ) -> Result<SessionView> {
        self.init_at(participant, overrides, Utc::now()).await
    }

    /// Load or create the session, lock anything unresolved, and project it.
    ///
    /// Safe to repeat: locks are write-once, so a second call returns the
    /// same stage and variant.
    pub async fn init_at(
        &self,
        participant: Option<&str>,
        overrides: &BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<SessionView> {
        let participant_id = match participant.map(str::trim).filter(|p| !p.is_empty()) {
            Some(p) => p.to_owned(),
            None if self.settings.generate_missing_ids => uuid::Uuid::new_v4().to_string(),
            None => return Err(CohortError::MissingParticipantId),
        };
        let code = self.pipeline.code();

        let (mut session, created) = self
            .store
            .create_session(Session::new(code, &participant_id, now))
            .await?;
        if created {
            tracing::info!(participant = %participant_id, pipeline = %code, "Session created");
            self.events.emit(StudyEvent::SessionCreated {
                participant_id: participant_id.clone(),
            });
        }

        if session.is_terminal() {
            return Ok(self.view(&session));
        }
        if let Some(elapsed) = self.timed_out(&session, now) {
            return self.fail_timed_out(session, elapsed, now).await;
        }

        if needs_resolution(&session, &self.pipeline) {
            self.reap_at(now).await?;
            let population = self.store.list_sessions(code).await?;
            let resolutions = self
                .engine
                .resolve_all(&self.pipeline, &mut session, &population, overrides)
                .inspect_err(|e| {
                    tracing::error!(participant = %participant_id, error = %e, "Assignment failed");
                })?;

            // Another init for the same participant may have locked first.
            if let Some(stored) = self.store.get_session(code, &participant_id).await? {
                if stored.is_terminal() {
                    return Ok(self.view(&stored));
                }
                adopt_stored_locks(&mut session, stored);
            }
            self.announce(&session, &resolutions);
        }

        session.touch(now);
        if session.current_stage_index >= self.pipeline.stage_count() {
            session.complete(now)?;
        }
        if !self.store.update_session(&session).await? {
            session = self.load(&participant_id).await?;
        }
        Ok(self.view(&session))
    }

    // -----------------------------------------------------------------------
    // current_stage
    // -----------------------------------------------------------------------

    /// Pure read: never assigns, never writes.
    pub async fn current_stage(&self, participant: &str) -> Result<SessionView> {
        let participant = required_participant(participant)?;
        let session = self.load(participant).await?;
        Ok(self.view(&session))
    }

    // -----------------------------------------------------------------------
    // submit
    // -----------------------------------------------------------------------

    pub async fn submit(
        &self,
        participant: &str,
        stage_id: &str,
        answers: &Value,
        stage_seconds: Option<f64>,
    ) -> Result<SubmitOutcome> {
        self.submit_at(participant, stage_id, answers, stage_seconds, Utc::now())
            .await
    }

    pub async fn submit_at(
        &self,
        participant: &str,
        stage_id: &str,
        answers: &Value,
        stage_seconds: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome> {
        let participant = required_participant(participant)?;
        let stage_id = stage_id.trim();
        if stage_id.is_empty() {
            return Err(CohortError::MissingField("stageId"));
        }
        let mut session = self.load(participant).await?;

        session.ensure_active().inspect_err(|e| {
            tracing::warn!(participant, stage = stage_id, error = %e, "Submit to terminal session");
        })?;

        let stage = self
            .pipeline
            .stage_at(session.current_stage_index)
            .ok_or(CohortError::AlreadyCompleted)?;
        if stage.id != stage_id {
            tracing::warn!(participant, submitted = stage_id, current = %stage.id, "Stage mismatch");
            return Err(CohortError::StageMismatch {
                submitted: stage_id.to_owned(),
                current: stage.id.clone(),
            });
        }

        let code = self.pipeline.code();
        if self
            .store
            .get_submission(code, stage_id, participant)
            .await?
            .is_some()
        {
            tracing::warn!(participant, stage = stage_id, "Duplicate submission");
            return Err(CohortError::DuplicateSubmission {
                stage: stage_id.to_owned(),
            });
        }

        if let Some(elapsed_seconds) = self.timed_out(&session, now) {
            return self
                .submit_timed_out(session, stage_id, answers, stage_seconds, elapsed_seconds, now)
                .await;
        }

        let variant = session
            .stage_variants
            .get(stage_id)
            .cloned()
            .ok_or_else(|| CohortError::MissingVariantLock {
                stage: stage_id.to_owned(),
            })?;
        let ctx = ScoreContext {
            stage_id,
            variant: &variant,
            conditions: &session.conditions,
        };
        let scored = stage
            .validator(&variant)
            .and_then(|v| v.score(&ctx, answers))
            .inspect_err(|e| {
                tracing::error!(participant, stage = stage_id, variant = %variant, error = %e, "Scoring failed");
            })?;
        let verdict = scored.verdict.to_json();
        let total_seconds = session.elapsed_seconds(now);

        self.record(Submission {
            passed: scored.passed,
            verdict: verdict.clone(),
            ..draft_submission(&session, stage_id, answers, stage_seconds, now)
        })
        .await?;

        if !scored.passed {
            session.fail(
                Some(stage_id.to_owned()),
                FailureReason::Rejected {
                    verdict: verdict.clone(),
                },
                now,
            )?;
            self.commit(&session).await?;
            tracing::info!(participant, stage = stage_id, variant = %variant, "Submission failed validation; session failed");
            self.events.emit(StudyEvent::SessionFailed {
                participant_id: participant.to_owned(),
                stage_id: Some(stage_id.to_owned()),
                timeout: false,
            });
            return Ok(SubmitOutcome::Rejected { verdict });
        }

        let from_index = session.current_stage_index;
        let completed = session.advance(self.pipeline.stage_count(), now)?;
        self.commit(&session).await?;
        self.events.emit(StudyEvent::StageAdvanced {
            participant_id: participant.to_owned(),
            from_stage: stage_id.to_owned(),
            to_index: session.current_stage_index,
        });

        if completed {
            tracing::info!(participant, total_seconds, "Session completed");
            self.events.emit(StudyEvent::SessionCompleted {
                participant_id: participant.to_owned(),
                total_seconds,
            });
            return Ok(SubmitOutcome::Completed {
                total_seconds,
                verdict,
            });
        }

        let next = self
            .pipeline
            .stage_at(from_index + 1)
            .map(|s| s.id.clone())
            .unwrap_or_default();
        tracing::info!(participant, stage = stage_id, next = %next, "Stage passed");
        Ok(SubmitOutcome::Advanced {
            next_stage_id: next,
            verdict,
        })
    }

    // -----------------------------------------------------------------------
    // Maintenance and monitoring
    // -----------------------------------------------------------------------

    pub async fn reap(&self) -> Result<ReapReport> {
        self.reap_at(Utc::now()).await
    }

    pub async fn reap_at(&self, now: DateTime<Utc>) -> Result<ReapReport> {
        let report = reap_abandoned(
            self.store.as_ref(),
            &self.pipeline,
            now,
            self.settings.inactivity_seconds,
        )
        .await?;
        if !report.failed.is_empty() {
            self.events.emit(StudyEvent::SessionsReaped {
                count: report.failed.len(),
            });
        }
        Ok(report)
    }

    /// Read-only summary for the monitoring collaborator.
    pub async fn summary(&self, filter: &SummaryFilter) -> Result<Summary> {
        let code = self.pipeline.code();
        let sessions = self.store.list_sessions(code).await?;
        let submissions = self.store.list_submissions(code).await?;
        Ok(build_summary(&self.pipeline, sessions, submissions, filter))
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn view(&self, session: &Session) -> SessionView {
        project(session, &self.pipeline, &self.settings.redirects)
    }

    async fn load(&self, participant: &str) -> Result<Session> {
        self.store
            .get_session(self.pipeline.code(), participant)
            .await?
            .ok_or_else(|| CohortError::SessionNotFound {
                participant: participant.to_owned(),
            })
    }

    /// Elapsed seconds when either ceiling is exceeded.
    fn timed_out(&self, session: &Session, now: DateTime<Utc>) -> Option<i64> {
        let elapsed = session.elapsed_seconds(now);
        let over_session = elapsed > self.settings.max_session_seconds;
        let idle = session.idle_seconds(now) > self.settings.inactivity_seconds;
        (over_session || idle).then_some(elapsed)
    }

    async fn fail_timed_out(
        &self,
        mut session: Session,
        elapsed_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<SessionView> {
        expire(&mut session, &self.pipeline, now)?;
        tracing::warn!(
            participant = %session.participant_id,
            stage = session.failed_stage_id.as_deref().unwrap_or(""),
            elapsed_seconds,
            "Session timed out"
        );
        if self.store.update_session(&session).await? {
            self.events.emit(StudyEvent::SessionFailed {
                participant_id: session.participant_id.clone(),
                stage_id: session.failed_stage_id.clone(),
                timeout: true,
            });
        } else {
            session = self.load(&session.participant_id).await?;
        }
        Ok(self.view(&session))
    }

    /// Append the submission and announce it.
    async fn record(&self, submission: Submission) -> Result<Submission> {
        let participant_id = submission.participant_id.clone();
        let stage_id = submission.stage_id.clone();
        let passed = submission.passed;
        let saved = self
            .store
            .insert_submission(submission)
            .await
            .inspect_err(|e| {
                if matches!(e, CohortError::DuplicateSubmission { .. }) {
                    tracing::warn!(participant = %participant_id, stage = %stage_id, "Concurrent duplicate submission rejected");
                }
            })?;
        self.events.emit(StudyEvent::SubmissionRecorded {
            participant_id,
            stage_id,
            passed,
        });
        Ok(saved)
    }

    /// A submit past either ceiling fails the session whatever the answers
    /// hold. Scoring still runs for the audit row, but its errors only end
    /// up in the stored verdict.
    async fn submit_timed_out(
        &self,
        session: Session,
        stage_id: &str,
        answers: &Value,
        stage_seconds: Option<f64>,
        elapsed_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome> {
        let scored = session
            .stage_variants
            .get(stage_id)
            .ok_or_else(|| CohortError::MissingVariantLock {
                stage: stage_id.to_owned(),
            })
            .and_then(|variant| {
                let stage = self.pipeline.stage(stage_id).ok_or_else(|| {
                    CohortError::Configuration(format!("unknown stage '{stage_id}'"))
                })?;
                let ctx = ScoreContext {
                    stage_id,
                    variant,
                    conditions: &session.conditions,
                };
                stage.validator(variant)?.score(&ctx, answers)
            });
        let (passed, verdict) = match scored {
            Ok(scored) => (scored.passed, scored.verdict.to_json()),
            Err(e) => (
                false,
                json!({ "kind": "unscored", "error": e.code(), "message": e.to_string() }),
            ),
        };

        let recorded = self
            .record(Submission {
                passed,
                verdict: verdict.clone(),
                ..draft_submission(&session, stage_id, answers, stage_seconds, now)
            })
            .await;
        self.fail_timed_out(session, elapsed_seconds, now).await?;
        match recorded {
            Err(e) if !matches!(e, CohortError::DuplicateSubmission { .. }) => Err(e),
            _ => Ok(SubmitOutcome::TimedOut {
                elapsed_seconds,
                verdict,
            }),
        }
    }

    /// Persist a transition. When the stored row turned terminal underneath
    /// us (reaper, concurrent submit) report that state instead.
    async fn commit(&self, session: &Session) -> Result<()> {
        if self.store.update_session(session).await? {
            return Ok(());
        }
        let stored = self.load(&session.participant_id).await?;
        stored.ensure_active()?;
        Err(CohortError::Storage(format!(
            "session '{}' could not be updated",
            session.participant_id
        )))
    }

    fn announce(&self, session: &Session, resolutions: &[Resolution]) {
        for r in resolutions.iter().filter(|r| r.newly_locked()) {
            match &r.dimension {
                StratumKey::Condition(factor) if session.conditions.get(factor) == Some(&r.value) => {
                    tracing::info!(
                        participant = %session.participant_id,
                        factor = %factor,
                        value = %r.value,
                        source = ?r.source,
                        "Condition assigned"
                    );
                    self.events.emit(StudyEvent::ConditionAssigned {
                        participant_id: session.participant_id.clone(),
                        factor: factor.clone(),
                        value: r.value.clone(),
                    });
                }
                StratumKey::Stage(stage) if session.stage_variants.get(stage) == Some(&r.value) => {
                    tracing::info!(
                        participant = %session.participant_id,
                        stage = %stage,
                        variant = %r.value,
                        source = ?r.source,
                        "Variant locked"
                    );
                    self.events.emit(StudyEvent::VariantLocked {
                        participant_id: session.participant_id.clone(),
                        stage_id: stage.clone(),
                        variant: r.value.clone(),
                    });
                }
                _ => {}
            }
        }
    }
}

fn required_participant(participant: &str) -> Result<&str> {
    let trimmed = participant.trim();
    if trimmed.is_empty() {
        Err(CohortError::MissingParticipantId)
    } else {
        Ok(trimmed)
    }
}

/// Audit row for a submit against `session`'s current lock; callers fill in
/// the verdict.
fn draft_submission(
    session: &Session,
    stage_id: &str,
    answers: &Value,
    stage_seconds: Option<f64>,
    now: DateTime<Utc>,
) -> Submission {
    Submission {
        id: None,
        pipeline_code: session.pipeline_code.clone(),
        participant_id: session.participant_id.clone(),
        stage_id: stage_id.to_owned(),
        variant_id: session.stage_variants.get(stage_id).cloned().unwrap_or_default(),
        conditions: session.conditions.clone(),
        answers: answers.clone(),
        passed: false,
        verdict: Value::Null,
        stage_seconds: clamp_stage_seconds(stage_seconds),
        total_seconds: Some(session.elapsed_seconds(now)),
        submitted_at: now,
    }
}

/// Locks already in the store win over freshly resolved ones.
fn adopt_stored_locks(session: &mut Session, stored: Session) {
    session.conditions.extend(stored.conditions);
    session.stage_variants.extend(stored.stage_variants);
    session.current_stage_index = session.current_stage_index.max(stored.current_stage_index);
}
