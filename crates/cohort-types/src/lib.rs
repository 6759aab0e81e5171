//! Shared records, statuses, and errors for the Cohort study orchestrator.
//!
//! This crate provides the foundational types used across all other Cohort crates:
//! - `CohortError`: unified error taxonomy (configuration / protocol / storage)
//! - `Session`: the authoritative per-participant progress record
//! - `Submission`: append-only audit record of one stage submission
//! - `SessionStatus`: the externally visible state of a session

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unified error type for all Cohort subsystems.
#[derive(Debug, thiserror::Error)]
pub enum CohortError {
    // === Configuration Errors ===
    #[error("Pipeline configuration error: {0}")]
    Configuration(String),

    #[error("Pipeline validation failed: {0}")]
    ValidationError(String),

    #[error("Stage '{stage}' has an empty variant set")]
    EmptyVariantSet { stage: String },

    #[error("Stage '{stage}' cannot resolve stratification key '{key}'")]
    UnresolvableStratum { stage: String, key: String },

    #[error("No validator configured for stage '{stage}' variant '{variant}'")]
    MissingValidator { stage: String, variant: String },

    #[error("variant not initialized for stage '{stage}', call init first")]
    MissingVariantLock { stage: String },

    #[error("Validator '{validator}' cannot score answers: {message}")]
    InvalidAnswers { validator: String, message: String },

    // === Protocol Errors ===
    #[error("participantId required")]
    MissingParticipantId,

    #[error("{0} required")]
    MissingField(&'static str),

    #[error("No session for participant '{participant}', call init first")]
    SessionNotFound { participant: String },

    #[error("stage locked: submitted '{submitted}' but current stage is '{current}'")]
    StageMismatch { submitted: String, current: String },

    #[error("already submitted stage '{stage}'")]
    DuplicateSubmission { stage: String },

    #[error("already completed")]
    AlreadyCompleted,

    #[error("locked out (failed)")]
    LockedOut,

    #[error("Admin authentication failed")]
    Unauthorized,

    // === Storage Errors ===
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Which part of the error taxonomy an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Broken pipeline definition or malformed answer shape. Fatal; fix, then retry.
    Configuration,
    /// The client asked for something the protocol forbids. Never retry as-is.
    Protocol,
    /// The storage collaborator failed.
    Storage,
}

impl CohortError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CohortError::Configuration(_)
            | CohortError::ValidationError(_)
            | CohortError::EmptyVariantSet { .. }
            | CohortError::UnresolvableStratum { .. }
            | CohortError::MissingValidator { .. }
            | CohortError::MissingVariantLock { .. }
            | CohortError::InvalidAnswers { .. } => ErrorClass::Configuration,
            CohortError::MissingParticipantId
            | CohortError::MissingField(_)
            | CohortError::SessionNotFound { .. }
            | CohortError::StageMismatch { .. }
            | CohortError::DuplicateSubmission { .. }
            | CohortError::AlreadyCompleted
            | CohortError::LockedOut
            | CohortError::Unauthorized => ErrorClass::Protocol,
            CohortError::Storage(_)
            | CohortError::StorageUnavailable(_)
            | CohortError::Io(_)
            | CohortError::Json(_)
            | CohortError::Yaml(_) => ErrorClass::Storage,
        }
    }

    /// Returns `true` if the same request may succeed when simply sent again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CohortError::Storage(_) | CohortError::StorageUnavailable(_) | CohortError::Io(_)
        )
    }

    /// Maps the error to an HTTP status code for server mode.
    pub fn http_status(&self) -> u16 {
        match self {
            CohortError::MissingParticipantId | CohortError::MissingField(_) => 400,
            CohortError::Unauthorized => 401,
            CohortError::StageMismatch { .. } | CohortError::LockedOut => 403,
            CohortError::SessionNotFound { .. } => 404,
            CohortError::DuplicateSubmission { .. } | CohortError::AlreadyCompleted => 409,
            CohortError::StorageUnavailable(_) => 503,
            _ => 500,
        }
    }

    /// Stable snake_case identifier used in error response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            CohortError::Configuration(_) => "configuration",
            CohortError::ValidationError(_) => "invalid_pipeline",
            CohortError::EmptyVariantSet { .. } => "empty_variant_set",
            CohortError::UnresolvableStratum { .. } => "unresolvable_stratum",
            CohortError::MissingValidator { .. } => "missing_validator",
            CohortError::MissingVariantLock { .. } => "missing_variant_lock",
            CohortError::InvalidAnswers { .. } => "invalid_answers",
            CohortError::MissingParticipantId => "missing_participant_id",
            CohortError::MissingField(_) => "missing_field",
            CohortError::SessionNotFound { .. } => "session_not_found",
            CohortError::StageMismatch { .. } => "stage_mismatch",
            CohortError::DuplicateSubmission { .. } => "duplicate_submission",
            CohortError::AlreadyCompleted => "already_completed",
            CohortError::LockedOut => "locked_out",
            CohortError::Unauthorized => "unauthorized",
            CohortError::Storage(_) | CohortError::Io(_) => "storage",
            CohortError::StorageUnavailable(_) => "storage_unavailable",
            CohortError::Json(_) | CohortError::Yaml(_) => "serialization",
        }
    }
}

/// A convenience alias for `Result<T, CohortError>`.
pub type Result<T> = std::result::Result<T, CohortError>;

// ---------------------------------------------------------------------------
// SessionStatus: externally visible session state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    /// Created, but some condition or stage variant is not locked yet.
    Resolving,
    InStage,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

// ---------------------------------------------------------------------------
// FailureReason: why a session reached FAILED
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// The session ran past the session ceiling or sat idle past the inactivity ceiling.
    Timeout { elapsed_seconds: i64 },
    /// A validator returned `passed = false`; carries its verdict.
    Rejected { verdict: serde_json::Value },
}

impl FailureReason {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FailureReason::Timeout { .. })
    }
}

// ---------------------------------------------------------------------------
// Session: per-participant progress record
// ---------------------------------------------------------------------------

/// One participant's run through one pipeline. Never deleted.
///
/// The mutating methods enforce the record's invariants: locks are write-once,
/// the stage index only moves forward, and a terminal session rejects every
/// further transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub pipeline_code: String,
    pub participant_id: String,
    pub conditions: BTreeMap<String, String>,
    pub stage_variants: BTreeMap<String, String>,
    pub current_stage_index: usize,
    pub completed: bool,
    pub failed: bool,
    pub failed_stage_id: Option<String>,
    pub failed_reason: Option<FailureReason>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total_seconds: Option<i64>,
}

impl Session {
    pub fn new(
        pipeline_code: impl Into<String>,
        participant_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            pipeline_code: pipeline_code.into(),
            participant_id: participant_id.into(),
            conditions: BTreeMap::new(),
            stage_variants: BTreeMap::new(),
            current_stage_index: 0,
            completed: false,
            failed: false,
            failed_stage_id: None,
            failed_reason: None,
            started_at: now,
            updated_at: now,
            total_seconds: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.completed || self.failed
    }

    /// Error describing why a terminal session rejects a transition.
    pub fn ensure_active(&self) -> Result<()> {
        if self.completed {
            Err(CohortError::AlreadyCompleted)
        } else if self.failed {
            Err(CohortError::LockedOut)
        } else {
            Ok(())
        }
    }

    /// Write a condition value unless the factor is already assigned.
    /// Returns `true` when the value was written.
    pub fn assign_condition(&mut self, factor: &str, value: &str) -> bool {
        if self.conditions.contains_key(factor) {
            return false;
        }
        self.conditions.insert(factor.to_owned(), value.to_owned());
        true
    }

    /// Lock a stage variant unless the stage is already locked.
    /// Returns `true` when the lock was written.
    pub fn lock_variant(&mut self, stage_id: &str, variant: &str) -> bool {
        if self.stage_variants.contains_key(stage_id) {
            return false;
        }
        self.stage_variants
            .insert(stage_id.to_owned(), variant.to_owned());
        true
    }

    /// Whole seconds since the session started, never negative.
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.started_at).num_seconds().max(0)
    }

    /// Whole seconds since the last write to this session, never negative.
    pub fn idle_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.updated_at).num_seconds().max(0)
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /// Move past the current stage. Returns `true` if that completed the session.
    pub fn advance(&mut self, stage_count: usize, now: DateTime<Utc>) -> Result<bool> {
        self.ensure_active()?;
        let next = (self.current_stage_index + 1).min(stage_count);
        self.current_stage_index = next;
        self.touch(now);
        if next >= stage_count {
            self.completed = true;
            self.total_seconds = Some(self.elapsed_seconds(now));
        }
        Ok(self.completed)
    }

    /// Mark the session completed without advancing (index already at the end).
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ensure_active()?;
        self.completed = true;
        self.total_seconds = Some(self.elapsed_seconds(now));
        self.touch(now);
        Ok(())
    }

    pub fn fail(
        &mut self,
        stage_id: Option<String>,
        reason: FailureReason,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_active()?;
        self.failed = true;
        self.failed_stage_id = stage_id;
        self.failed_reason = Some(reason);
        self.touch(now);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Submission: append-only audit record
// ---------------------------------------------------------------------------

/// Upper bound for a client-reported stage duration (one day).
pub const MAX_STAGE_SECONDS: i64 = 86_400;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    /// Internal id assigned by the store on insert.
    pub id: Option<i64>,
    pub pipeline_code: String,
    pub participant_id: String,
    pub stage_id: String,
    pub variant_id: String,
    pub conditions: BTreeMap<String, String>,
    pub answers: serde_json::Value,
    pub passed: bool,
    pub verdict: serde_json::Value,
    pub stage_seconds: Option<i64>,
    pub total_seconds: Option<i64>,
    pub submitted_at: DateTime<Utc>,
}

/// Round and clamp a client-reported stage duration. Non-finite input is dropped.
pub fn clamp_stage_seconds(raw: Option<f64>) -> Option<i64> {
    let secs = raw.filter(|s| s.is_finite())?;
    Some((secs.round() as i64).clamp(0, MAX_STAGE_SECONDS))
}
