// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Anthropic Claude provider implementation.
//!
//! Talks to the [Messages API](https://docs.anthropic.com/en/api/messages).
//! Streaming uses the trait default (one delta per response).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ProviderError;
use crate::types::{
    Message, ModelInfo, Provider, ProviderConfig, ProviderResponse, Role, StopReason, TokenUsage,
    ToolCall, ToolDefinition,
};

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Default max tokens if not specified.
const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Anthropic Claude provider.
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
    temperature: Option<f32>,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider.
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
        config: &ProviderConfig,
    ) -> Result<Self, ProviderError> {
        let timeout = config
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS));

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_tokens: config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: config.temperature,
        })
    }

    /// Build the request body for the Messages API.
    fn build_request(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        system_prompt: Option<&str>,
    ) -> AnthropicRequest {
        AnthropicRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            messages: messages.iter().map(ApiMessage::from).collect(),
            system: system_prompt.map(String::from),
            tools: tools.map(|t| t.iter().map(ApiTool::from).collect()),
            temperature: self.temperature,
        }
    }

    /// Map an error response from the API.
    fn handle_error_response(status_code: u16, body: &str) -> ProviderError {
        let Ok(error) = serde_json::from_str::<ApiError>(body) else {
            return ProviderError::api(body.to_string(), status_code);
        };
        let message = error.error.message;
        match error.error.error_type.as_str() {
            "authentication_error" | "permission_error" => ProviderError::AuthError(message),
            "rate_limit_error" => ProviderError::RateLimited(message),
            "overloaded_error" => ProviderError::RateLimited("API overloaded".to_string()),
            "not_found_error" => ProviderError::ModelNotFound(message),
            "invalid_request_error" if message.contains("model") => {
                ProviderError::ModelNotFound(message)
            }
            _ => ProviderError::api(message, status_code),
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn chat(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        system_prompt: Option<&str>,
    ) -> Result<ProviderResponse, ProviderError> {
        let request = self.build_request(messages, tools, system_prompt);
        debug!(model = %self.model, messages = messages.len(), "Sending chat request");

        let response = self
            .request(self.client.post(format!("{}/v1/messages", self.base_url)))
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(Self::handle_error_response(status.as_u16(), &error_text));
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        Ok(api_response.into())
    }

    fn name(&self) -> &str {
        "Anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        let response = self
            .request(self.client.get(format!("{}/v1/models", self.base_url)))
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(Self::handle_error_response(status.as_u16(), &error_text));
        }

        let list: ApiModelList = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        Ok(list
            .data
            .into_iter()
            .map(|m| ModelInfo {
                name: m.display_name.unwrap_or_else(|| m.id.clone()),
                id: m.id,
                provider: "Anthropic".to_string(),
                context_window: Some(200_000),
            })
            .collect())
    }
}

// ============================================================================
// API Types
// ============================================================================

/// Request body for the Messages API.
#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ApiTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ApiContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
struct ApiContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ApiModelList {
    data: Vec<ApiModel>,
}

#[derive(Debug, Deserialize)]
struct ApiModel {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
}

// ============================================================================
// Type Conversions
// ============================================================================

impl From<&Message> for ApiMessage {
    fn from(msg: &Message) -> Self {
        let role = match msg.role {
            Role::Assistant => "assistant",
            // System text travels in the top-level `system` field; stray
            // system messages are sent as user turns.
            Role::User | Role::System => "user",
        };
        Self {
            role,
            content: msg.content.clone(),
        }
    }
}

impl From<&ToolDefinition> for ApiTool {
    fn from(tool: &ToolDefinition) -> Self {
        Self {
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: tool.input_schema.clone(),
        }
    }
}

impl From<ApiResponse> for ProviderResponse {
    fn from(response: ApiResponse) -> Self {
        let mut content = String::new();
        let mut tool_calls = Vec::new();

        for block in response.content {
            match block.block_type.as_str() {
                "text" => {
                    if let Some(text) = block.text {
                        content.push_str(&text);
                    }
                }
                "tool_use" => tool_calls.push(ToolCall {
                    id: block.id.unwrap_or_default(),
                    name: block.name.unwrap_or_default(),
                    input: block.input.unwrap_or(serde_json::Value::Null),
                }),
                _ => {}
            }
        }

        let stop_reason = match response.stop_reason.as_deref() {
            Some("tool_use") => StopReason::ToolUse,
            Some("max_tokens") => StopReason::MaxTokens,
            _ => StopReason::EndTurn,
        };

        Self {
            content,
            tool_calls,
            stop_reason,
            usage: Some(TokenUsage {
                input_tokens: response.usage.input_tokens,
                output_tokens: response.usage.output_tokens,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(config: ProviderConfig) -> AnthropicProvider {
        AnthropicProvider::new("key", "claude-sonnet-4-20250514", "https://api.anthropic.com/", &config)
            .unwrap()
    }

    #[test]
    fn test_build_request() {
        let p = provider(ProviderConfig::default().with_max_tokens(50));
        let request = p.build_request(
            &[Message::user("hi"), Message::assistant("hello")],
            None,
            Some("route it"),
        );
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["max_tokens"], 50);
        assert_eq!(json["system"], "route it");
        assert_eq!(json["messages"][1]["role"], "assistant");
        assert!(json.get("tools").is_none());
        assert_eq!(p.base_url, "https://api.anthropic.com");
    }

    #[test]
    fn test_response_conversion() {
        let raw = r#"{
            "content": [
                {"type": "text", "text": "coder"},
                {"type": "tool_use", "id": "t1", "name": "bash", "input": {"cmd": "ls"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 12, "output_tokens": 3}
        }"#;
        let api: ApiResponse = serde_json::from_str(raw).unwrap();
        let response: ProviderResponse = api.into();

        assert_eq!(response.content, "coder");
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.tool_calls[0].name, "bash");
        assert_eq!(response.usage.unwrap().total(), 15);
    }

    #[test]
    fn test_error_mapping() {
        let auth = r#"{"type":"error","error":{"type":"authentication_error","message":"bad key"}}"#;
        assert!(matches!(
            AnthropicProvider::handle_error_response(401, auth),
            ProviderError::AuthError(_)
        ));

        let limited = r#"{"type":"error","error":{"type":"rate_limit_error","message":"slow down"}}"#;
        assert!(matches!(
            AnthropicProvider::handle_error_response(429, limited),
            ProviderError::RateLimited(_)
        ));

        match AnthropicProvider::handle_error_response(502, "bad gateway") {
            ProviderError::ApiError { status_code, .. } => assert_eq!(status_code, Some(502)),
            other => panic!("unexpected {:?}", other),
        }
    }
}
