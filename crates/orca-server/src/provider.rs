//! HTTP-backed analysis providers.
//!
//! Each configured provider is a remote endpoint that accepts the subject
//! snapshot as a JSON POST body and answers with a JSON payload.

use anyhow::Context;
use async_trait::async_trait;
use orca_core::{AnalysisProvider, ProviderError, SubjectSnapshot};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ProviderSpec;

/// Provider adapter for one remote endpoint.
pub struct HttpProvider {
    name: String,
    endpoint: String,
    permissions: Vec<String>,
    timeout: Option<Duration>,
    bearer_token: Option<String>,
    client: Client,
}

impl HttpProvider {
    pub fn from_spec(spec: &ProviderSpec, client: Client) -> Self {
        let bearer_token = spec.bearer_token_env.as_ref().and_then(|var| {
            let token = std::env::var(var).ok();
            if token.is_none() {
                warn!(provider = %spec.name, env = %var, "Bearer token variable not set");
            }
            token
        });

        Self {
            name: spec.name.clone(),
            endpoint: spec.endpoint.clone(),
            permissions: spec.permissions.clone(),
            timeout: spec.timeout_ms.map(Duration::from_millis),
            bearer_token,
            client,
        }
    }

    async fn call(&self, snapshot: &SubjectSnapshot) -> Result<Value, ProviderError> {
        let mut request = self.client.post(&self.endpoint).json(snapshot);
        if let Some(ref token) = self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        if let Some(err) = status_error(&self.name, response.status()) {
            return Err(err);
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| ProviderError::Internal(format!("invalid response body: {}", e)))
    }
}

#[async_trait]
impl AnalysisProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn required_permissions(&self) -> Vec<String> {
        self.permissions.clone()
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn invoke(
        &self,
        snapshot: &SubjectSnapshot,
        cancel: CancellationToken,
    ) -> Result<Value, ProviderError> {
        debug!(provider = %self.name, endpoint = %self.endpoint, "Invoking provider");
        tokio::select! {
            result = self.call(snapshot) => result,
            _ = cancel.cancelled() => Err(ProviderError::Cancelled(self.name.clone())),
        }
    }
}

/// Map a non-success HTTP status to a provider error.
///
/// Client errors mean the provider refused this input; anything else is
/// treated as the provider being unavailable.
fn status_error(name: &str, status: StatusCode) -> Option<ProviderError> {
    if status.is_success() {
        return None;
    }
    let message = format!("{} returned {}", name, status);
    if status.is_client_error() {
        Some(ProviderError::Rejected(message))
    } else {
        Some(ProviderError::Unavailable(message))
    }
}

/// Build one provider per configured endpoint, sharing a single client.
pub fn build_providers(specs: &[ProviderSpec]) -> anyhow::Result<Vec<Arc<dyn AnalysisProvider>>> {
    let client = Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .build()
        .context("Failed to create HTTP client")?;

    Ok(specs
        .iter()
        .map(|spec| Arc::new(HttpProvider::from_spec(spec, client.clone())) as Arc<dyn AnalysisProvider>)
        .collect())
}
