//! HTTP route handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use custody_storage::{Assignment, Checkpoint};
use custody_workflow::{AcceptTarget, Actor, ActorUser, EligibilityFilter};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::state::AppState;
use super::{json_error, workflow_error};

/// Decode a JSON body into `T`, answering 400 on a shape mismatch.
fn parse_body<T: DeserializeOwned>(body: serde_json::Value) -> Result<T, Response> {
    serde_json::from_value(body)
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, &format!("invalid request body: {}", e)))
}

fn ok<T: serde::Serialize>(value: T) -> Response {
    (StatusCode::OK, Json(value)).into_response()
}

#[derive(Deserialize)]
struct ActorBody {
    actor: ActorUser,
}

#[derive(Deserialize)]
struct HandoverBody {
    actor: ActorUser,
    refs: Vec<String>,
    target: Checkpoint,
    #[serde(default)]
    assignment: Option<Assignment>,
}

#[derive(Deserialize)]
struct AcceptBody {
    actor: ActorUser,
    checkpoint: Checkpoint,
    target: AcceptTarget,
}

#[derive(Deserialize)]
struct DocumentBody {
    attachment_ref: String,
}

/// Query of `GET /shipments/eligible`. List values are comma separated;
/// any given value replaces the configured default for that field.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct EligibleQuery {
    status: Option<String>,
    category: Option<String>,
    date_from: Option<String>,
    date_to: Option<String>,
}

fn split_list(value: &str) -> std::collections::BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl EligibleQuery {
    fn apply(&self, defaults: &EligibilityFilter) -> Result<EligibilityFilter, Response> {
        let parse = |value: &str| {
            EligibilityFilter::parse_date(value)
                .map_err(|e| json_error(StatusCode::BAD_REQUEST, &e.to_string()))
        };
        let mut filter = defaults.clone();
        if let Some(status) = &self.status {
            filter.statuses = split_list(status);
        }
        if let Some(category) = &self.category {
            filter.categories = split_list(category);
        }
        if let Some(from) = &self.date_from {
            filter.date_from = Some(parse(from)?);
        }
        if let Some(to) = &self.date_to {
            filter.date_to = Some(parse(to)?);
        }
        Ok(filter)
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct BundleQuery {
    checkpoint: Option<Checkpoint>,
    alt_checkpoint: Option<Checkpoint>,
}

/// Fallback handler for unmatched routes.
pub(crate) async fn handle_not_found() -> impl IntoResponse {
    json_error(StatusCode::NOT_FOUND, "not found")
}

/// GET /health
pub(crate) async fn handle_health() -> impl IntoResponse {
    let response = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(response))
}

/// GET /stages
pub(crate) async fn handle_stages(State(state): State<Arc<AppState>>) -> Response {
    let table = state.workflow.stages();
    ok(serde_json::json!({
        "entry_checkpoint": table.entry_checkpoint(),
        "reentry_checkpoint": table.reentry_checkpoint(),
        "stages": table.stages().collect::<Vec<_>>(),
    }))
}

/// GET /shipments/eligible
pub(crate) async fn handle_eligible(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EligibleQuery>,
) -> Response {
    let filter = match query.apply(&state.default_filter) {
        Ok(f) => f,
        Err(resp) => return resp,
    };
    match state.workflow.list_eligible_for_entry(&filter).await {
        Ok(shipments) => ok(serde_json::json!({ "shipments": shipments })),
        Err(e) => workflow_error(e),
    }
}

/// GET /shipments/outstanding/{role}
pub(crate) async fn handle_outstanding(
    State(state): State<Arc<AppState>>,
    Path(role): Path<String>,
) -> Response {
    let role: Actor = match role.parse() {
        Ok(r) => r,
        Err(msg) => return json_error(StatusCode::BAD_REQUEST, &msg),
    };
    match state.workflow.list_by_checkpoint_range(role).await {
        Ok(rows) => ok(serde_json::json!({ "role": role, "shipments": rows })),
        Err(e) => workflow_error(e),
    }
}

/// GET /shipments/{tracking_id}/progress
pub(crate) async fn handle_progress(
    State(state): State<Arc<AppState>>,
    Path(tracking_id): Path<String>,
) -> Response {
    match state.workflow.progress(&tracking_id).await {
        Ok(events) => ok(serde_json::json!({
            "tracking_id": tracking_id,
            "progress": events,
        })),
        Err(e) => workflow_error(e),
    }
}

/// GET /bundles
pub(crate) async fn handle_list_bundles(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BundleQuery>,
) -> Response {
    let result = match (query.checkpoint, query.alt_checkpoint) {
        (Some(cp), alt) => {
            state
                .workflow
                .list_bundles_by_checkpoint(cp, alt)
                .await
        }
        (None, Some(_)) => {
            return json_error(
                StatusCode::BAD_REQUEST,
                "'alt_checkpoint' requires 'checkpoint'",
            )
        }
        (None, None) => state.workflow.list_bundles().await,
    };
    match result {
        Ok(bundles) => ok(serde_json::json!({ "bundles": bundles })),
        Err(e) => workflow_error(e),
    }
}

/// GET /bundles/{id}
pub(crate) async fn handle_get_bundle(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.workflow.expand_bundle(&id).await {
        Ok(view) => ok(view),
        Err(e) => workflow_error(e),
    }
}

/// POST /handover
pub(crate) async fn handle_handover(
    State(state): State<Arc<AppState>>,
    Json(parsed): Json<serde_json::Value>,
) -> Response {
    let body: HandoverBody = match parse_body(parsed) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    match state
        .workflow
        .handover(&body.refs, &body.actor, body.target, body.assignment)
        .await
    {
        Ok(outcome) => ok(outcome),
        Err(e) => workflow_error(e),
    }
}

/// POST /accept
pub(crate) async fn handle_accept(
    State(state): State<Arc<AppState>>,
    Json(parsed): Json<serde_json::Value>,
) -> Response {
    let body: AcceptBody = match parse_body(parsed) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    match state
        .workflow
        .accept(&body.target, &body.actor, body.checkpoint)
        .await
    {
        Ok(outcome) => ok(outcome),
        Err(e) => workflow_error(e),
    }
}

/// POST /shipments/{tracking_id}/cancel
pub(crate) async fn handle_request_cancel(
    State(state): State<Arc<AppState>>,
    Path(tracking_id): Path<String>,
    Json(parsed): Json<serde_json::Value>,
) -> Response {
    let body: ActorBody = match parse_body(parsed) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    match state.workflow.request_cancel(&tracking_id, &body.actor).await {
        Ok(row) => ok(row),
        Err(e) => workflow_error(e),
    }
}

/// POST /shipments/{tracking_id}/cancel/confirm
pub(crate) async fn handle_confirm_cancel(
    State(state): State<Arc<AppState>>,
    Path(tracking_id): Path<String>,
    Json(parsed): Json<serde_json::Value>,
) -> Response {
    let body: ActorBody = match parse_body(parsed) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    match state.workflow.confirm_cancel(&tracking_id, &body.actor).await {
        Ok(outcome) => ok(outcome),
        Err(e) => workflow_error(e),
    }
}

/// POST /bundles/{id}/document
pub(crate) async fn handle_document_generated(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(parsed): Json<serde_json::Value>,
) -> Response {
    let body: DocumentBody = match parse_body(parsed) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    if body.attachment_ref.trim().is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "'attachment_ref' must not be empty");
    }
    match state
        .workflow
        .on_document_generated(&id, &body.attachment_ref)
        .await
    {
        Ok(attached) => ok(serde_json::json!({ "bundle_id": id, "attached": attached })),
        Err(e) => workflow_error(e),
    }
}

/// POST /attachments/retry
pub(crate) async fn handle_retry_attachments(State(state): State<Arc<AppState>>) -> Response {
    match state.workflow.retry_attachments().await {
        Ok(report) => ok(report),
        Err(e) => workflow_error(e),
    }
}
