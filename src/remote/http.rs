use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::{JobStatus, RemoteError, RemoteRunner};

/// HTTP client for the remote job-execution API.
///
/// Dispatch is `POST {base}/jobs` with an `{"env": {...}}` body; status is
/// `GET {base}/jobs/{id}`. Both carry a bearer service token.
pub struct HttpRunner {
    base_url: String,
    service_token: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct DispatchResponse {
    id: u64,
}

impl HttpRunner {
    pub fn new(
        base_url: impl Into<String>,
        service_token: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_token: service_token.into(),
            client,
        })
    }
}

#[async_trait]
impl RemoteRunner for HttpRunner {
    async fn dispatch(
        &self,
        service: &str,
        context: &BTreeMap<String, String>,
    ) -> Result<u64, RemoteError> {
        info!(service = %service, "Dispatching remote job");
        debug!(?context, "Dispatch context");

        let response = self
            .client
            .post(format!("{}/jobs", self.base_url))
            .bearer_auth(&self.service_token)
            .json(&serde_json::json!({ "service": service, "env": context }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Dispatch {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: DispatchResponse = response.json().await?;
        info!(job_id = parsed.id, "Remote job accepted");
        Ok(parsed.id)
    }

    async fn poll(&self, job_id: u64) -> Result<JobStatus, RemoteError> {
        let response = self
            .client
            .get(format!("{}/jobs/{}", self.base_url, job_id))
            .bearer_auth(&self.service_token)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(RemoteError::NotFound(job_id));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Http {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }
}
