//! Model-inference collaborator interface.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Execution constraints passed with every model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxPolicy {
    /// Whether the execution scope may reach the network.
    pub network_isolated: bool,
    /// Cap on generated output length.
    pub max_output_chars: usize,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            network_isolated: true,
            max_output_chars: 100_000,
        }
    }
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model unavailable: {0}")]
    Unavailable(String),

    #[error("model call timed out")]
    Timeout,

    #[error("model returned an invalid response: {0}")]
    BadResponse(String),
}

/// The backing model client. Retried by the worker with exponential
/// backoff; exhaustion routes the request to escalation as
/// `MODEL_UNAVAILABLE`.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, text: &str, sandbox: &SandboxPolicy) -> Result<String, ModelError>;
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    input: &'a str,
    sandbox: &'a SandboxPolicy,
}

#[derive(Deserialize)]
struct CompletionResponse {
    output: String,
}

/// HTTP client for the model endpoint at `MODEL_API_URL`.
pub struct HttpModelClient {
    client: reqwest::Client,
    api_url: String,
}

impl HttpModelClient {
    pub fn new(api_url: String, timeout: Duration) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ModelError::Unavailable(e.to_string()))?;
        Ok(Self { client, api_url })
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn complete(&self, text: &str, sandbox: &SandboxPolicy) -> Result<String, ModelError> {
        let response = self
            .client
            .post(&self.api_url)
            .json(&CompletionRequest {
                input: text,
                sandbox,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout
                } else {
                    ModelError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ModelError::Unavailable(format!("model returned {status}")));
        }

        let body: CompletionResponse = response
            .json()
            .await
            .map_err(|e| ModelError::BadResponse(e.to_string()))?;

        let mut output = body.output;
        if output.chars().count() > sandbox.max_output_chars {
            output = output.chars().take(sandbox.max_output_chars).collect();
        }
        Ok(output)
    }
}
