//! Session state machine: pure projections over a [`Session`] record.
//!
//! Resumption never re-runs assignment. [`project`] derives everything a
//! client needs (status, current stage, locked variant, UI descriptor,
//! redirect) from the persisted record alone, so reads are side-effect free
//! and trivially repeatable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use cohort_types::{FailureReason, Session, SessionStatus};

use crate::pipeline::Pipeline;

/// `UNASSIGNED` has no record, so it never appears here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Some condition or stage variant is still unlocked.
    Resolving,
    InStage(usize),
    Completed,
    Failed,
}

impl SessionState {
    pub fn status(self) -> SessionStatus {
        match self {
            SessionState::Resolving => SessionStatus::Resolving,
            SessionState::InStage(_) => SessionStatus::InStage,
            SessionState::Completed => SessionStatus::Completed,
            SessionState::Failed => SessionStatus::Failed,
        }
    }
}

/// True when some factor or stage of `pipeline` has no lock on `session`.
pub fn needs_resolution(session: &Session, pipeline: &Pipeline) -> bool {
    pipeline
        .factors()
        .iter()
        .any(|f| !session.conditions.contains_key(&f.name))
        || pipeline
            .stages()
            .iter()
            .any(|s| !session.stage_variants.contains_key(&s.id))
}

pub fn state(session: &Session, pipeline: &Pipeline) -> SessionState {
    if session.failed {
        SessionState::Failed
    } else if session.completed || session.current_stage_index >= pipeline.stage_count() {
        SessionState::Completed
    } else if needs_resolution(session, pipeline) {
        SessionState::Resolving
    } else {
        SessionState::InStage(session.current_stage_index)
    }
}

/// Where the client should send the participant once the study ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirects {
    pub completion: Option<String>,
    pub failure: Option<String>,
    pub decline: Option<String>,
}

impl Redirects {
    pub fn for_status(&self, status: SessionStatus) -> Option<&str> {
        match status {
            SessionStatus::Completed => self.completion.as_deref(),
            SessionStatus::Failed => self.failure.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDescriptor {
    pub id: String,
    pub index: usize,
    pub count: usize,
    pub variant: String,
    pub ui: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub status: SessionStatus,
    pub participant_id: String,
    pub pipeline: String,
    pub conditions: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

/// Read-only projection of `session` against `pipeline`.
pub fn project(session: &Session, pipeline: &Pipeline, redirects: &Redirects) -> SessionView {
    let state = state(session, pipeline);
    let stage = match state {
        SessionState::InStage(index) => pipeline.stage_at(index).and_then(|stage| {
            let variant = session.stage_variants.get(&stage.id)?;
            Some(StageDescriptor {
                id: stage.id.clone(),
                index,
                count: pipeline.stage_count(),
                variant: variant.clone(),
                ui: stage.ui(variant),
            })
        }),
        _ => None,
    };
    let status = state.status();

    SessionView {
        status,
        participant_id: session.participant_id.clone(),
        pipeline: session.pipeline_code.clone(),
        conditions: session.conditions.clone(),
        stage,
        failed_stage_id: session.failed_stage_id.clone(),
        failed_reason: session.failed_reason.clone(),
        redirect_url: redirects.for_status(status).map(str::to_owned),
    }
}
