//! `custody serve` -- HTTP JSON API over the custody workflow.
//!
//! Endpoints:
//! - GET  /health                                   - Server status
//! - GET  /stages                                   - The stage table
//! - GET  /shipments/eligible                       - Master shipments that may enter
//! - GET  /shipments/outstanding/{role}             - Rows waiting on a role
//! - GET  /shipments/{tracking_id}/progress         - Latest event per actor pair
//! - GET  /bundles                                  - Bundles, optionally by checkpoint
//! - GET  /bundles/{id}                             - Bundle with its members
//! - POST /handover                                 - Hand a batch over
//! - POST /accept                                   - Accept shipments or bundles
//! - POST /shipments/{tracking_id}/cancel           - Request cancellation
//! - POST /shipments/{tracking_id}/cancel/confirm   - Confirm cancellation
//! - POST /bundles/{id}/document                    - Document generated callback
//! - POST /attachments/retry                        - Retry missing documents
//!
//! Mutating requests carry the acting user as `"actor": {"user_id", "role"}`;
//! authentication happens upstream. All responses are JSON.

mod handlers;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use custody_storage::MemoryStorage;
use custody_workflow::document::http::HttpDocumentGenerator;
use custody_workflow::{spawn_attachment_worker, AttachmentService, Workflow, WorkflowError};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use self::handlers::{
    handle_accept, handle_confirm_cancel, handle_document_generated, handle_eligible,
    handle_get_bundle, handle_handover, handle_health, handle_list_bundles, handle_not_found,
    handle_outstanding, handle_progress, handle_request_cancel, handle_retry_attachments,
    handle_stages,
};
use self::state::AppState;
use crate::config::Config;

/// Maximum request body size: 1 MB.
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Construct a JSON error response with the given status code and message.
fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({"error": message}))).into_response()
}

fn status_for(error: &WorkflowError) -> StatusCode {
    match error {
        WorkflowError::InvalidCheckpoint { .. }
        | WorkflowError::InconsistentBatch { .. }
        | WorkflowError::AssignmentRequired { .. }
        | WorkflowError::EmptyBatch => StatusCode::BAD_REQUEST,
        WorkflowError::ActorNotPermitted { .. } => StatusCode::FORBIDDEN,
        WorkflowError::TrackingNotFound { .. } | WorkflowError::BundleNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        WorkflowError::StaleState { .. } | WorkflowError::InvalidCancelState { .. } => {
            StatusCode::CONFLICT
        }
        WorkflowError::DocumentGenerationFailed { .. }
        | WorkflowError::Master(_)
        | WorkflowError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Map a workflow error onto a status code and `{"error": ...}` body.
fn workflow_error(error: WorkflowError) -> Response {
    let status = status_for(&error);
    if status.is_server_error() {
        tracing::error!(error = %error, "request failed");
    } else {
        tracing::debug!(error = %error, status = status.as_u16(), "request rejected");
    }
    json_error(status, &error.to_string())
}

/// Build the workflow described by `config` over an in-memory store.
///
/// Must run inside the tokio runtime when a document queue is configured.
pub(crate) fn build_workflow(
    config: &Config,
) -> Result<Workflow<MemoryStorage>, Box<dyn std::error::Error>> {
    config.check_documents()?;
    let storage = Arc::new(MemoryStorage::new());
    let mut workflow = Workflow::new(storage.clone(), config.stage_table()?)
        .with_master(config.master_source()?);

    if let Some(documents) = &config.documents {
        let generator = Arc::new(HttpDocumentGenerator::new(
            &documents.endpoint,
            documents.auth_token.clone(),
        ));
        workflow = match documents.queue_capacity {
            Some(capacity) => {
                let service = AttachmentService::new(storage, generator);
                let (queue, _worker) = spawn_attachment_worker(service, capacity);
                tracing::info!(
                    endpoint = %documents.endpoint,
                    capacity,
                    "attachment worker started"
                );
                workflow.with_attachment_queue(queue)
            }
            None => workflow.with_document_generator(generator),
        };
    }
    Ok(workflow)
}

pub(crate) fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/stages", get(handle_stages))
        .route("/shipments/eligible", get(handle_eligible))
        .route("/shipments/outstanding/{role}", get(handle_outstanding))
        .route("/shipments/{tracking_id}/progress", get(handle_progress))
        .route("/shipments/{tracking_id}/cancel", post(handle_request_cancel))
        .route(
            "/shipments/{tracking_id}/cancel/confirm",
            post(handle_confirm_cancel),
        )
        .route("/bundles", get(handle_list_bundles))
        .route("/bundles/{id}", get(handle_get_bundle))
        .route("/bundles/{id}/document", post(handle_document_generated))
        .route("/handover", post(handle_handover))
        .route("/accept", post(handle_accept))
        .route("/attachments/retry", post(handle_retry_attachments))
        .fallback(handle_not_found)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// Start the HTTP server on `port` and run until Ctrl+C.
pub(crate) async fn start_server(
    config: Config,
    port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    let workflow = build_workflow(&config)?;
    let default_filter = config.eligibility_filter()?;
    tracing::info!(
        stages = workflow.stages().stages().count(),
        entry = workflow.stages().entry_checkpoint(),
        reentry = ?workflow.stages().reentry_checkpoint(),
        master = workflow.master().source_id(),
        "workflow ready"
    );

    let state = Arc::new(AppState {
        workflow,
        default_filter,
    });
    let app = router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("custody listening on http://{}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("server shut down");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("received shutdown signal");
}
