//! HTTP provider client for OpenAI-compatible endpoints
//!
//! Implements [`ProviderClient`] over `reqwest`, mapping transport and
//! status errors into the gateway error taxonomy so the breaker and retry
//! handler can classify them. Health checks probe `{base_url}/models`
//! with a HEAD request.

use crate::error::{GatewayError, GatewayResult};
use crate::provider::{ChatRequest, Completion, ProviderClient, Usage};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for one OpenAI-compatible upstream
pub struct HttpProviderClient {
    name: String,
    base_url: String,
    default_model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct UsagePayload {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

impl HttpProviderClient {
    /// Create a client for the named provider
    ///
    /// `base_url` should already include the version prefix, e.g.
    /// `http://localhost:8000/v1`.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        default_model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            name: name.into(),
            base_url: base_url.into(),
            default_model: default_model.into(),
            api_key,
            client,
        })
    }

    fn body_for(&self, request: &ChatRequest, stream: bool) -> serde_json::Value {
        serde_json::json!({
            "model": request.model.as_deref().unwrap_or(&self.default_model),
            "messages": request.messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": stream,
        })
    }

    async fn send(&self, request: &ChatRequest, stream: bool) -> GatewayResult<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self.client.post(&url).json(&self.body_for(request, stream));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            // Timeouts and connection failures are transient by definition
            GatewayError::ProviderTransient {
                provider: self.name.clone(),
                reason: e.to_string(),
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let reason = format!("{status}: {}", response.text().await.unwrap_or_default());
        if status.as_u16() == 429 {
            Err(GatewayError::UpstreamRateLimited {
                provider: self.name.clone(),
                reason,
            })
        } else if status.is_server_error() {
            Err(GatewayError::ProviderTransient {
                provider: self.name.clone(),
                reason,
            })
        } else {
            Err(GatewayError::ProviderFatal {
                provider: self.name.clone(),
                reason,
            })
        }
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &ChatRequest) -> GatewayResult<Completion> {
        let response = self.send(request, false).await?;
        let payload: CompletionResponse =
            response
                .json()
                .await
                .map_err(|e| GatewayError::ProviderTransient {
                    provider: self.name.clone(),
                    reason: format!("malformed completion body: {e}"),
                })?;

        let content = payload
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| GatewayError::ProviderTransient {
                provider: self.name.clone(),
                reason: "completion contained no choices".to_string(),
            })?;

        let usage = payload
            .usage
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        Ok(Completion { content, usage })
    }

    async fn stream(&self, request: &ChatRequest) -> GatewayResult<Vec<String>> {
        let response = self.send(request, true).await?;
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::ProviderTransient {
                provider: self.name.clone(),
                reason: format!("stream interrupted: {e}"),
            })?;

        // SSE framing: one "data: {json}" line per chunk, terminated by
        // "data: [DONE]"
        let mut deltas = Vec::new();
        for line in body.lines() {
            let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                continue;
            };
            if data == "[DONE]" {
                break;
            }
            match serde_json::from_str::<StreamChunk>(data) {
                Ok(chunk) => {
                    if let Some(delta) = chunk
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.delta.content)
                        && !delta.is_empty()
                    {
                        deltas.push(delta);
                    }
                }
                Err(e) => {
                    tracing::debug!(
                        provider = %self.name,
                        error = %e,
                        "Skipping unparseable stream chunk"
                    );
                }
            }
        }
        Ok(deltas)
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/models", self.base_url);
        let mut builder = self.client.head(&url).timeout(HEALTH_CHECK_TIMEOUT);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        match builder.send().await {
            Ok(response) => {
                let healthy = response.status().is_success();
                tracing::debug!(
                    provider = %self.name,
                    status = %response.status(),
                    healthy,
                    "Health check completed"
                );
                healthy
            }
            Err(e) => {
                tracing::debug!(provider = %self.name, error = %e, "Health check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChatMessage;

    #[test]
    fn test_body_uses_default_model_when_unpinned() {
        let client = HttpProviderClient::new(
            "openai",
            "http://localhost:9001/v1",
            "gpt-4o-mini",
            None,
            Duration::from_secs(30),
        )
        .unwrap();

        let request = ChatRequest {
            messages: vec![ChatMessage::user("hi")],
            model: None,
            temperature: Some(0.2),
            max_tokens: Some(64),
            stream: false,
            tenant_id: "acme".to_string(),
        };
        let body = client.body_for(&request, false);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn test_body_respects_pinned_model() {
        let client = HttpProviderClient::new(
            "openai",
            "http://localhost:9001/v1",
            "gpt-4o-mini",
            None,
            Duration::from_secs(30),
        )
        .unwrap();

        let request = ChatRequest {
            messages: vec![ChatMessage::user("hi")],
            model: Some("gpt-4o".to_string()),
            temperature: None,
            max_tokens: None,
            stream: true,
            tenant_id: "acme".to_string(),
        };
        let body = client.body_for(&request, true);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
    }
}
