//! HTTP master source.
//!
//! Uses `ureq` (sync) wrapped in `tokio::task::spawn_blocking` so the async
//! runtime is never blocked. The master exposes `GET {base_url}/shipments`
//! returning a JSON array of [`MasterShipment`]; eligibility filtering is
//! applied locally.

use async_trait::async_trait;

use super::{EligibilityFilter, MasterError, MasterShipment, MasterSource};

pub const AUTH_TOKEN_ENV: &str = "CUSTODY_MASTER_AUTH_TOKEN";

pub struct HttpMaster {
    base_url: String,
    auth_token: Option<String>,
}

impl HttpMaster {
    /// Create a source for `base_url`. The bearer token falls back to the
    /// `CUSTODY_MASTER_AUTH_TOKEN` env var when not configured.
    pub fn new(base_url: &str, auth_token: Option<String>) -> Result<Self, MasterError> {
        let base_url = base_url.trim_end_matches('/');
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(MasterError::Config(format!(
                "master base_url must be http(s), got '{}'",
                base_url
            )));
        }
        Ok(HttpMaster {
            base_url: base_url.to_string(),
            auth_token: auth_token.or_else(|| std::env::var(AUTH_TOKEN_ENV).ok()),
        })
    }

    pub fn shipments_url(&self) -> String {
        format!("{}/shipments", self.base_url)
    }

    async fn fetch_all(&self) -> Result<Vec<MasterShipment>, MasterError> {
        let url = self.shipments_url();
        let auth_token = self.auth_token.clone();
        let source_id = self.source_id().to_string();

        tokio::task::spawn_blocking(move || {
            let agent = ureq::Agent::new_with_defaults();
            let mut request = agent.get(&url);
            if let Some(ref token) = auth_token {
                request = request.header("Authorization", &format!("Bearer {}", token));
            }

            let response = request.call().map_err(|e| MasterError::Unavailable {
                source_id: source_id.clone(),
                message: e.to_string(),
            })?;

            response
                .into_body()
                .read_json::<Vec<MasterShipment>>()
                .map_err(|e| MasterError::Unavailable {
                    source_id,
                    message: format!("failed to parse response as JSON: {}", e),
                })
        })
        .await
        .map_err(|e| MasterError::Unavailable {
            source_id: self.source_id().to_string(),
            message: format!("task join error: {}", e),
        })?
    }
}

#[async_trait]
impl MasterSource for HttpMaster {
    async fn list_shipments(
        &self,
        filter: &EligibilityFilter,
    ) -> Result<Vec<MasterShipment>, MasterError> {
        let mut shipments = self.fetch_all().await?;
        shipments.retain(|s| filter.matches(s));
        Ok(shipments)
    }

    async fn get_shipments(&self, refs: &[String]) -> Result<Vec<MasterShipment>, MasterError> {
        let mut shipments = self.fetch_all().await?;
        shipments.retain(|s| refs.contains(&s.external_ref));
        Ok(shipments)
    }

    fn source_id(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_trailing_slash() {
        let master = HttpMaster::new("http://master.local/api/", Some("t".into())).unwrap();
        assert_eq!(master.shipments_url(), "http://master.local/api/shipments");
    }

    #[test]
    fn rejects_non_http_url() {
        assert!(matches!(
            HttpMaster::new("ftp://master.local", None),
            Err(MasterError::Config(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_master_is_unavailable() {
        // Port 9 (discard) on localhost is not expected to serve HTTP.
        let master = HttpMaster::new("http://127.0.0.1:9", None).unwrap();
        let result = master.list_shipments(&EligibilityFilter::default()).await;
        assert!(matches!(result, Err(MasterError::Unavailable { .. })));
    }
}
