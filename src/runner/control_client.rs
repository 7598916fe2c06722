//! HTTP client for the control plane's runner RPC surface.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;

use super::{ResponseHandler, WorkSource};
use crate::protocol::{InferenceRequest, ModelInstanceState, TaskResponse};
use crate::session::SessionFilter;

/// Client for pulling work from and pushing frames to the control
/// plane.
#[derive(Debug, Clone)]
pub struct ControlClient {
    client: reqwest::Client,
    base_url: String,
}

impl ControlClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// Ask for the next piece of work matching the filter. `None` when
    /// the queue has nothing for us.
    pub async fn next(&self, filter: &SessionFilter) -> Result<Option<InferenceRequest>> {
        let url = format!("{}/api/v1/runner/next", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(filter)
            .send()
            .await
            .context("requesting next work item")?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => {
                let request = response
                    .json::<InferenceRequest>()
                    .await
                    .context("parsing inference request")?;
                Ok(Some(request))
            }
            status => anyhow::bail!("control plane returned {} from {}", status, url),
        }
    }

    /// Push one response frame to the control plane.
    pub async fn post_response(&self, response: &TaskResponse) -> Result<()> {
        let url = format!("{}/api/v1/runner/response", self.base_url);
        let res = self
            .client
            .post(&url)
            .json(response)
            .send()
            .await
            .context("posting response frame")?;

        if !res.status().is_success() {
            anyhow::bail!("control plane returned {} from {}", res.status(), url);
        }
        Ok(())
    }

    /// Report an instance snapshot for observability.
    pub async fn report_state(&self, state: &ModelInstanceState) -> Result<()> {
        let url = format!("{}/api/v1/runner/state", self.base_url);
        let res = self
            .client
            .post(&url)
            .json(state)
            .send()
            .await
            .context("reporting instance state")?;

        if !res.status().is_success() {
            anyhow::bail!("control plane returned {} from {}", res.status(), url);
        }
        Ok(())
    }
}

#[async_trait]
impl WorkSource for ControlClient {
    async fn next_request(&self, filter: &SessionFilter) -> Result<Option<InferenceRequest>> {
        self.next(filter).await
    }
}

#[async_trait]
impl ResponseHandler for ControlClient {
    async fn handle(&self, response: TaskResponse) -> Result<()> {
        self.post_response(&response).await
    }
}
