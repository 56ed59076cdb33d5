//! HTTP document generator.
//!
//! POSTs the bundle as JSON to the rendering service and expects
//! `{"attachment_ref": "..."}` back. `ureq` runs inside
//! `tokio::task::spawn_blocking`.

use async_trait::async_trait;
use serde::Deserialize;

use super::{DocumentError, DocumentGenerator, DocumentRequest};

pub const AUTH_TOKEN_ENV: &str = "CUSTODY_DOCUMENTS_AUTH_TOKEN";

pub struct HttpDocumentGenerator {
    endpoint: String,
    auth_token: Option<String>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    attachment_ref: String,
}

impl HttpDocumentGenerator {
    /// The bearer token falls back to `CUSTODY_DOCUMENTS_AUTH_TOKEN`.
    pub fn new(endpoint: &str, auth_token: Option<String>) -> Self {
        HttpDocumentGenerator {
            endpoint: endpoint.to_string(),
            auth_token: auth_token.or_else(|| std::env::var(AUTH_TOKEN_ENV).ok()),
        }
    }
}

#[async_trait]
impl DocumentGenerator for HttpDocumentGenerator {
    async fn generate(&self, request: &DocumentRequest) -> Result<String, DocumentError> {
        let url = self.endpoint.clone();
        let auth_token = self.auth_token.clone();
        let document_number = request.bundle.document_number.clone();
        let body = serde_json::to_value(request)
            .map_err(|e| DocumentError::Transport(format!("failed to encode request: {}", e)))?;

        tokio::task::spawn_blocking(move || {
            let agent = ureq::Agent::new_with_defaults();
            let mut post = agent.post(&url);
            if let Some(ref token) = auth_token {
                post = post.header("Authorization", &format!("Bearer {}", token));
            }

            let response = post.send_json(&body).map_err(|e| match e {
                ureq::Error::StatusCode(code) => DocumentError::Rejected {
                    document_number: document_number.clone(),
                    message: format!("HTTP {}", code),
                },
                other => DocumentError::Transport(other.to_string()),
            })?;

            let parsed: GenerateResponse =
                response.into_body().read_json().map_err(|e| DocumentError::Rejected {
                    document_number,
                    message: format!("unexpected response: {}", e),
                })?;
            Ok(parsed.attachment_ref)
        })
        .await
        .map_err(|e| DocumentError::Transport(format!("task join error: {}", e)))?
    }
}
