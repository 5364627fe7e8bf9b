//! Controller link over the admission HTTP API
//!
//! `deactivate` posts to `/chargers/{id}/deactivate/` and `ping` reads
//! `/hello/`. A request that never gets an answer, or a 503, is
//! [`LinkError::Unreachable`]; any other error status is a refusal.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use evc_core::{ChargerId, ControllerLink, ErrorKind, LinkError};

/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Deserialize)]
struct ErrorBody {
    detail: String,
}

/// HTTP client for a remote admission controller
#[derive(Debug, Clone)]
pub struct HttpControllerLink {
    client: Client,
    base_url: String,
}

impl HttpControllerLink {
    /// Link to the API at `base_url`, e.g. `http://127.0.0.1:8000`
    pub fn new(base_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn check(response: reqwest::Response) -> Result<(), LinkError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let reason = match response.json::<ErrorBody>().await {
            Ok(body) => body.detail,
            Err(_) => status.to_string(),
        };

        match status {
            StatusCode::SERVICE_UNAVAILABLE => Err(LinkError::Unreachable(reason)),
            status => Err(LinkError::Rejected {
                kind: kind_for(status),
                reason,
            }),
        }
    }
}

fn kind_for(status: StatusCode) -> ErrorKind {
    match status {
        StatusCode::NOT_FOUND => ErrorKind::NotFound,
        StatusCode::CONFLICT => ErrorKind::Conflict,
        s if s.is_client_error() => ErrorKind::Validation,
        _ => ErrorKind::Internal,
    }
}

fn unreachable(e: reqwest::Error) -> LinkError {
    LinkError::Unreachable(e.to_string())
}

impl ControllerLink for HttpControllerLink {
    async fn deactivate(&self, charger_id: ChargerId) -> Result<(), LinkError> {
        let url = format!("{}/chargers/{}/deactivate/", self.base_url, charger_id);
        debug!("Link: POST {}", url);
        let response = self.client.post(url).send().await.map_err(unreachable)?;
        Self::check(response).await
    }

    async fn ping(&self) -> Result<(), LinkError> {
        let url = format!("{}/hello/", self.base_url);
        let response = self.client.get(url).send().await.map_err(unreachable)?;
        Self::check(response).await
    }
}
