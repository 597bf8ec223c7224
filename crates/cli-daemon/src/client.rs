//! HTTP client for a running mediaq daemon.

use anyhow::{bail, Context, Result};
use mediaq::server::{CancelResponse, ClearResponse, ErrorBody, PauseResponse, SubmitResponse};
use mediaq::{Job, JobId, JobSpec, JobStatus};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;

pub struct ApiClient {
    base_url: String,
    client: Client,
}

impl ApiClient {
    /// Create a new API client
    ///
    /// # Arguments
    /// * `base_url` - Daemon address, e.g. `http://127.0.0.1:7878`
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn submit(&self, spec: &JobSpec) -> Result<JobId> {
        let response = self
            .client
            .post(self.url("/jobs"))
            .json(spec)
            .send()
            .await
            .context("Failed to send submit request")?;
        let body: SubmitResponse = handle_response(response).await?;
        Ok(body.id)
    }

    pub async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let mut request = self.client.get(self.url("/jobs"));
        if let Some(status) = status {
            request = request.query(&[("status", status.as_str())]);
        }
        let response = request.send().await.context("Failed to send list request")?;
        handle_response(response).await
    }

    pub async fn status(&self, id: &str) -> Result<Job> {
        let response = self
            .client
            .get(self.url(&format!("/jobs/{}", id)))
            .send()
            .await
            .context("Failed to send status request")?;
        handle_response(response).await
    }

    pub async fn cancel(&self, id: &str) -> Result<CancelResponse> {
        let response = self
            .client
            .post(self.url(&format!("/jobs/{}/cancel", id)))
            .send()
            .await
            .context("Failed to send cancel request")?;
        handle_response(response).await
    }

    pub async fn set_paused(&self, paused: bool) -> Result<PauseResponse> {
        let path = if paused { "/queue/pause" } else { "/queue/resume" };
        let response = self
            .client
            .post(self.url(path))
            .send()
            .await
            .context("Failed to send pause request")?;
        handle_response(response).await
    }

    pub async fn clear_completed(&self) -> Result<ClearResponse> {
        let response = self
            .client
            .delete(self.url("/jobs/completed"))
            .send()
            .await
            .context("Failed to send clear request")?;
        handle_response(response).await
    }

    pub async fn stats(&self) -> Result<serde_json::Value> {
        let response = self
            .client
            .get(self.url("/stats"))
            .send()
            .await
            .context("Failed to send stats request")?;
        handle_response(response).await
    }
}

async fn handle_response<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response.json().await.context("Failed to parse response body");
    }
    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.canonical_reason().unwrap_or("request failed").to_string(),
    };
    bail!("{} ({})", message, status.as_u16())
}
