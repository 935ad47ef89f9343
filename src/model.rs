//! External language-model collaborator boundary.
//!
//! The planner, executor, and finding extractor all consult the model
//! through [`ModelClient`]; the engine never constructs prompts anywhere
//! else. [`HttpModelClient`] speaks an OpenAI-compatible chat endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::config::ModelConfig;

/// Failure of a single model call.
#[derive(Error, Debug, Clone)]
#[error("model request failed: {0}")]
pub struct ModelError(pub String);

/// A language-model collaborator.
///
/// Implementations must be individually time-bounded: a call may block for
/// seconds to minutes but never indefinitely.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Sends a system + user prompt pair and returns the completion text.
    async fn complete(&self, system: &str, user: &str) -> Result<String, ModelError>;

    /// Returns the name of the backing model.
    fn name(&self) -> &str;
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

/// Model client speaking the OpenAI-compatible `/chat/completions` protocol.
pub struct HttpModelClient {
    config: ModelConfig,
    client: reqwest::Client,
}

impl HttpModelClient {
    /// Builds a client from the given configuration.
    pub fn new(config: ModelConfig) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ModelError(e.to_string()))?;

        Ok(Self { config, client })
    }

    fn completions_url(&self) -> String {
        let base = self.config.endpoint.trim_end_matches('/');
        format!("{}/chat/completions", base)
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String, ModelError> {
        let body = json!({
            "model": self.config.model,
            "temperature": 0.1,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });

        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ModelError(format!("{}: {}", status, detail)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ModelError(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ModelError("empty choices in response".to_string()))
    }

    fn name(&self) -> &str {
        &self.config.model
    }
}

/// Extracts JSON from model output that may wrap it in markdown code blocks.
pub(crate) fn extract_json(output: &str) -> Option<&str> {
    if let Some(start) = output.find("```json") {
        let json_start = start + 7;
        if let Some(end) = output[json_start..].find("```") {
            return Some(output[json_start..json_start + end].trim());
        }
    }

    let open = output.find(['{', '['])?;
    let close = match output.as_bytes()[open] {
        b'{' => output.rfind('}')?,
        _ => output.rfind(']')?,
    };
    if open < close {
        Some(&output[open..=close])
    } else {
        None
    }
}
