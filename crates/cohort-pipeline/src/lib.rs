//! Study orchestration core: pipeline definitions, assignment, session state
//! machine, validator dispatch, and the abandonment reaper.
//!
//! This crate implements everything between "a participant shows up" and "a
//! participant is routed to completion or disqualification": balanced
//! condition assignment, stratified stage-variant locking, the stage
//! transition state machine, typed validator dispatch, timeout handling, and
//! the read-only admin summary.

pub mod assignment;
pub mod definition;
pub mod events;
pub mod pipeline;
pub mod reaper;
pub mod session;
pub mod store;
pub mod study;
pub mod summary;
pub mod validation;
pub mod validators;

pub use assignment::{AssignmentEngine, Resolution, ResolutionSource};
pub use definition::{ConditionFactor, PipelineDefinition, SelectionMode, StageDefinition, StratumKey};
pub use events::{EventEmitter, StudyEvent};
pub use pipeline::{Pipeline, Stage};
pub use reaper::{is_abandoned, reap_abandoned, ReapReport};
pub use session::{needs_resolution, project, state, Redirects, SessionState, SessionView, StageDescriptor};
pub use store::{MemoryStore, SessionStore};
pub use study::{Study, StudySettings, SubmitOutcome, DEFAULT_TIMEOUT_SECONDS};
pub use summary::{build_summary, ParticipantSummary, StageSummary, Summary, SummaryFilter, SummaryStats};
pub use validation::{severity_counts, validate, validate_or_raise, Diagnostic, LintRule, Severity};
pub use validators::{ScoreContext, Scored, Validator, ValidatorSpec, Verdict};
