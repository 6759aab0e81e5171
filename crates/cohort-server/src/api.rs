//! HTTP routes for the participant client and the admin summary.
//!
//! Handlers are thin: they pull identifiers out of the request, call the
//! [`Study`], and wrap the result in an `{ "ok": true, ... }` envelope.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tower_http::trace::TraceLayer;

use cohort_pipeline::{SessionView, Study, SubmitOutcome, Summary, SummaryFilter};
use cohort_types::{CohortError, SessionStatus};

use crate::error::ApiError;

pub const ADMIN_PASSWORD_HEADER: &str = "x-admin-password";

/// Shared application state accessible from Axum routes.
#[derive(Clone)]
pub struct AppState {
    pub study: Arc<Study>,
    /// `None` disables the admin summary.
    pub admin_password: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/init", post(init))
        .route("/api/current-stage", get(current_stage))
        .route("/api/submit", post(submit))
        .route("/api/decline-url", get(decline_url))
        .route("/api/admin/summary", get(admin_summary))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct Envelope<T> {
    ok: bool,
    #[serde(flatten)]
    body: T,
}

fn envelope<T: Serialize>(body: T) -> Json<Envelope<T>> {
    Json(Envelope { ok: true, body })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitRequest {
    #[serde(default, alias = "prolificId")]
    participant_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParticipantQuery {
    #[serde(default, alias = "prolificId")]
    participant_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest {
    #[serde(default, alias = "prolificId")]
    participant_id: Option<String>,
    #[serde(default)]
    stage_id: Option<String>,
    #[serde(default)]
    answers: Option<Value>,
    #[serde(default)]
    meta: Option<SubmitMeta>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitMeta {
    /// Number or numeric string; anything else is ignored.
    #[serde(default)]
    stage_seconds: Option<Value>,
}

impl SubmitMeta {
    fn stage_seconds(&self) -> Option<f64> {
        match self.stage_seconds.as_ref()? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    ok: bool,
    passed: bool,
    completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_stage_id: Option<String>,
    verdict: Value,
    locked_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    redirect_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

/// `POST /api/init`: the query string carries variant override parameters.
/// An empty body is allowed; a body that is present must be valid JSON.
async fn init(
    State(state): State<AppState>,
    Query(overrides): Query<BTreeMap<String, String>>,
    body: Bytes,
) -> Result<Json<Envelope<SessionView>>, ApiError> {
    let request: InitRequest = if body.iter().all(u8::is_ascii_whitespace) {
        InitRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid init body: {e}")))?
    };
    let view = state
        .study
        .init(request.participant_id.as_deref(), &overrides)
        .await?;
    Ok(envelope(view))
}

async fn current_stage(
    State(state): State<AppState>,
    Query(query): Query<ParticipantQuery>,
) -> Result<Json<Envelope<SessionView>>, ApiError> {
    let participant = query.participant_id.unwrap_or_default();
    let view = state.study.current_stage(&participant).await?;
    Ok(envelope(view))
}

async fn submit(
    State(state): State<AppState>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let participant = request.participant_id.unwrap_or_default();
    let stage_id = request.stage_id.unwrap_or_default();
    let answers = request.answers.ok_or(CohortError::MissingField("answers"))?;
    let stage_seconds = request.meta.as_ref().and_then(SubmitMeta::stage_seconds);

    let outcome = state
        .study
        .submit(&participant, &stage_id, &answers, stage_seconds)
        .await?;

    let redirects = &state.study.settings().redirects;
    let redirect_url = match &outcome {
        SubmitOutcome::Advanced { .. } => None,
        SubmitOutcome::Completed { .. } => redirects.for_status(SessionStatus::Completed),
        SubmitOutcome::Rejected { .. } | SubmitOutcome::TimedOut { .. } => {
            redirects.for_status(SessionStatus::Failed)
        }
    }
    .map(str::to_owned);

    if let SubmitOutcome::TimedOut { elapsed_seconds, .. } = &outcome {
        let body = json!({
            "ok": false,
            "code": "session_timed_out",
            "message": "session timed out",
            "elapsedSeconds": elapsed_seconds,
            "lockedOut": true,
            "redirectUrl": redirect_url,
        });
        return Ok((StatusCode::FORBIDDEN, Json(body)).into_response());
    }

    let response = SubmitResponse {
        ok: true,
        passed: outcome.passed(),
        completed: outcome.completed(),
        next_stage_id: outcome.next_stage_id().map(str::to_owned),
        verdict: outcome.verdict().clone(),
        locked_out: outcome.locked_out(),
        redirect_url,
    };
    Ok(Json(response).into_response())
}

async fn decline_url(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "ok": true, "redirectUrl": state.study.decline_url() }))
}

/// `GET /api/admin/summary?status=&<factor>=`: read-only.
async fn admin_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(mut params): Query<BTreeMap<String, String>>,
) -> Result<Json<Envelope<Summary>>, ApiError> {
    let Some(expected) = state.admin_password.as_deref() else {
        return Err(ApiError::AdminDisabled);
    };
    let given = headers
        .get(ADMIN_PASSWORD_HEADER)
        .and_then(|v| v.to_str().ok());
    if !given.is_some_and(|g| password_matches(g, expected)) {
        return Err(CohortError::Unauthorized.into());
    }

    let status = params
        .remove("status")
        .filter(|s| !s.trim().is_empty())
        .map(|raw| parse_status(&raw))
        .transpose()?;
    let pipeline = state.study.pipeline();
    let conditions = params
        .into_iter()
        .filter(|(factor, _)| pipeline.factor(factor).is_some())
        .collect();

    let summary = state
        .study
        .summary(&SummaryFilter { status, conditions })
        .await?;
    Ok(envelope(summary))
}

/// Compares SHA-256 digests without short-circuiting, so timing does not
/// leak how much of the password matched.
fn password_matches(given: &str, expected: &str) -> bool {
    let given = Sha256::digest(given.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    given
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

fn parse_status(raw: &str) -> Result<SessionStatus, ApiError> {
    match raw.trim().to_lowercase().as_str() {
        "resolving" => Ok(SessionStatus::Resolving),
        "instage" | "in_stage" | "in_progress" | "active" => Ok(SessionStatus::InStage),
        "completed" => Ok(SessionStatus::Completed),
        "failed" => Ok(SessionStatus::Failed),
        other => Err(ApiError::BadRequest(format!("unknown status '{other}'"))),
    }
}
