//! Provider boundary contract
//!
//! Defines the normalized request/response schema the orchestration core
//! works with, and the `ProviderClient` trait every upstream adapter
//! implements. The core never sees provider-specific response shapes.

use crate::error::{GatewayError, GatewayResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A single chat message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

/// Normalized chat request
///
/// Arrives already authenticated and tenant-scoped; the core performs no
/// auth of its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Requested model, if the caller pinned one. Routing may override.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    pub tenant_id: String,
}

impl ChatRequest {
    /// Validate the request shape before any routing work happens
    ///
    /// Malformed requests are programming/validation errors: they must not
    /// count against any provider's health.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.messages.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "messages must not be empty".to_string(),
            ));
        }
        if self.messages.iter().any(|m| m.content.trim().is_empty()) {
            return Err(GatewayError::InvalidRequest(
                "message content must not be empty or whitespace-only".to_string(),
            ));
        }
        if self.tenant_id.trim().is_empty() {
            return Err(GatewayError::InvalidRequest(
                "tenant_id must not be empty".to_string(),
            ));
        }
        if let Some(t) = self.temperature
            && !(0.0..=2.0).contains(&t)
        {
            return Err(GatewayError::InvalidRequest(format!(
                "temperature must be in [0.0, 2.0], got {t}"
            )));
        }
        Ok(())
    }
}

/// Token usage reported by a provider
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Raw completion returned by a provider client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub usage: Usage,
}

/// Normalized response returned to the caller
///
/// Never leaks provider-specific shapes; `provider` and `model` identify
/// who actually served the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub content: String,
    pub usage: Usage,
    pub provider: String,
    pub model: String,
    pub latency_ms: u64,
    pub cached: bool,
}

/// Asynchronous client for one upstream provider
///
/// Any error returned from `complete` or `stream` is treated as a failure
/// signal by the orchestration layer; adapters are responsible for mapping
/// transport errors into the `GatewayError` taxonomy so the breaker and
/// retry handler can classify them.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Provider identifier, e.g. "openai" or "anthropic"
    fn name(&self) -> &str;

    /// Execute a chat completion
    async fn complete(&self, request: &ChatRequest) -> GatewayResult<Completion>;

    /// Execute a streaming chat completion, returning the text deltas
    async fn stream(&self, request: &ChatRequest) -> GatewayResult<Vec<String>>;

    /// Probe provider health; true means the provider looks reachable
    async fn health_check(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_request() -> ChatRequest {
        ChatRequest {
            messages: vec![ChatMessage::user("hello")],
            model: None,
            temperature: Some(0.7),
            max_tokens: Some(256),
            stream: false,
            tenant_id: "acme".to_string(),
        }
    }

    #[test]
    fn test_valid_request_passes_validation() {
        assert!(valid_request().validate().is_ok());
    }

    #[test]
    fn test_empty_messages_rejected() {
        let mut req = valid_request();
        req.messages.clear();
        let err = req.validate().unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }

    #[test]
    fn test_whitespace_only_content_rejected() {
        let mut req = valid_request();
        req.messages.push(ChatMessage::user("   "));
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_empty_tenant_rejected() {
        let mut req = valid_request();
        req.tenant_id = String::new();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_out_of_range_temperature_rejected() {
        let mut req = valid_request();
        req.temperature = Some(3.5);
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let json = r#"{
            "messages": [{"role": "user", "content": "hi"}],
            "tenant_id": "acme"
        }"#;
        let req: ChatRequest = serde_json::from_str(json).expect("should deserialize");
        assert!(req.model.is_none());
        assert!(!req.stream);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_response_round_trips_through_json() {
        let resp = GatewayResponse {
            content: "hello".to_string(),
            usage: Usage {
                prompt_tokens: 3,
                completion_tokens: 5,
                total_tokens: 8,
            },
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            latency_ms: 120,
            cached: false,
        };
        let json = serde_json::to_string(&resp).unwrap();
        let back: GatewayResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.provider, "openai");
        assert_eq!(back.usage.total_tokens, 8);
    }
}
