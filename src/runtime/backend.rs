/// Deployment backend collaborators
///
/// The backend installs and tears down workflow program artifacts. The state
/// machine only sees the `DeploymentBackend` trait; the HTTP client talks to a
/// remote installer and the local backend accepts everything (for single-node
/// setups and development).

use crate::workflow::types::{SourceCode, WorkflowName};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Backend failure with the diagnostic text the backend reported
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// External installer for workflow artifacts
///
/// Calls may take arbitrarily long; the caller imposes no timeout and relies on
/// the backend to report failure.
#[async_trait]
pub trait DeploymentBackend: Send + Sync {
    /// Install `source` for `name`, running as `service_account`
    async fn deploy(
        &self,
        name: &WorkflowName,
        source: &SourceCode,
        service_account: &str,
    ) -> Result<(), BackendError>;

    /// Remove whatever was installed for `name`
    async fn teardown(&self, name: &WorkflowName) -> Result<(), BackendError>;
}

/// Accept-all backend used when no remote backend is configured
#[derive(Debug, Default, Clone)]
pub struct LocalBackend;

#[async_trait]
impl DeploymentBackend for LocalBackend {
    async fn deploy(
        &self,
        name: &WorkflowName,
        source: &SourceCode,
        service_account: &str,
    ) -> Result<(), BackendError> {
        tracing::info!(
            "Local deploy of {} ({} bytes) as {}",
            name,
            source.len(),
            service_account
        );
        Ok(())
    }

    async fn teardown(&self, name: &WorkflowName) -> Result<(), BackendError> {
        tracing::info!("Local teardown of {}", name);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeployRequest<'a> {
    name: String,
    #[serde(flatten)]
    source: &'a SourceCode,
    service_account: &'a str,
}

#[derive(Debug, Serialize)]
struct TeardownRequest {
    name: String,
}

/// HTTP client for a remote deployment backend
///
/// POSTs JSON to `{base_url}/deploy` and `{base_url}/teardown`. Any non-2xx
/// response is a failure whose body becomes the diagnostic text.
#[derive(Debug, Clone)]
pub struct HttpDeploymentBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDeploymentBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<(), BackendError> {
        let url = format!("{}/{}", self.base_url, path);
        tracing::debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| BackendError::new(format!("backend unreachable at {}: {}", url, e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let detail = response
            .text()
            .await
            .unwrap_or_else(|e| format!("<unreadable body: {}>", e));
        tracing::warn!("Backend {} returned {}: {}", url, status, detail);
        Err(BackendError::new(format!("backend returned {}: {}", status, detail)))
    }
}

#[async_trait]
impl DeploymentBackend for HttpDeploymentBackend {
    async fn deploy(
        &self,
        name: &WorkflowName,
        source: &SourceCode,
        service_account: &str,
    ) -> Result<(), BackendError> {
        let request = DeployRequest {
            name: name.to_string(),
            source,
            service_account,
        };
        self.post("deploy", &request).await
    }

    async fn teardown(&self, name: &WorkflowName) -> Result<(), BackendError> {
        let request = TeardownRequest {
            name: name.to_string(),
        };
        self.post("teardown", &request).await
    }
}
