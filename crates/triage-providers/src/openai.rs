use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use triage_types::{
    ChatMessage, ChatRole, ModelChoice, ModelInfo, ModelResponse, ProviderInfo, TokenUsage,
    ToolInvocation,
};

use crate::{GenerateOptions, ModelClient, ProviderError, ToolChoice};

/// Chat-completions client for any endpoint speaking the OpenAI wire format.
pub struct OpenAICompatibleProvider {
    id: String,
    name: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: Client,
}

impl OpenAICompatibleProvider {
    pub fn new(
        id: &str,
        name: &str,
        base_url: &str,
        api_key: Option<String>,
        default_model: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            base_url: normalize_base(base_url),
            api_key,
            default_model: default_model.to_string(),
            client: Client::new(),
        }
    }

    fn request_body(&self, messages: &[ChatMessage], options: &GenerateOptions) -> Value {
        let model = options
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str());
        let wire_messages = messages.iter().map(wire_message).collect::<Vec<_>>();
        let mut body = json!({
            "model": model,
            "messages": wire_messages,
            "stream": false,
        });
        if let Some(temperature) = options.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = options.max_output_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if !options.tools.is_empty() && options.tool_choice == ToolChoice::Auto {
            let wire_tools = options
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.input_schema,
                        }
                    })
                })
                .collect::<Vec<_>>();
            body["tools"] = Value::Array(wire_tools);
            body["tool_choice"] = json!("auto");
        }
        body
    }
}

#[async_trait]
impl ModelClient for OpenAICompatibleProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            models: vec![ModelInfo {
                id: self.default_model.clone(),
                provider_id: self.id.clone(),
                display_name: self.default_model.clone(),
                context_window: 128_000,
            }],
        }
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: &GenerateOptions,
    ) -> Result<ModelResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self
            .client
            .post(url)
            .json(&self.request_body(messages, options));
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        let response = req.send().await.map_err(classify_transport_error)?;
        let status = response.status();
        let header_retry_after = parse_retry_after_header(response.headers());
        let text = response
            .text()
            .await
            .map_err(|err| ProviderError::transient(format!("failed to read response: {err}")))?;
        let value = serde_json::from_str::<Value>(&text).unwrap_or(Value::Null);

        if !status.is_success() {
            let detail = extract_openai_error(&value).unwrap_or_else(|| {
                format!(
                    "provider request failed with status {}: {}",
                    status,
                    truncate_for_error(&text, 500)
                )
            });
            let retry_after = header_retry_after.or_else(|| parse_retry_after_body(&detail));
            tracing::debug!(
                provider = %self.id,
                status = status.as_u16(),
                retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
                "provider returned an error status"
            );
            return Err(classify_status(status, detail, retry_after));
        }

        if let Some(detail) = extract_openai_error(&value) {
            return Err(ProviderError::transient(detail));
        }

        parse_completion(&value).ok_or_else(|| {
            ProviderError::transient(format!(
                "provider returned an unparseable completion (response: {})",
                truncate_for_error(&text, 500)
            ))
        })
    }
}

fn wire_message(message: &ChatMessage) -> Value {
    let mut wire = json!({
        "role": message.role.as_str(),
        "content": message.content,
    });
    if message.role == ChatRole::Assistant && !message.tool_calls.is_empty() {
        wire["tool_calls"] = Value::Array(
            message
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {"name": call.name, "arguments": call.raw_arguments}
                    })
                })
                .collect(),
        );
    }
    if let Some(call_id) = &message.tool_call_id {
        wire["tool_call_id"] = json!(call_id);
    }
    wire
}

fn parse_completion(value: &Value) -> Option<ModelResponse> {
    let choices = value.get("choices")?.as_array()?;
    let choices = choices
        .iter()
        .map(|choice| {
            let message = choice.get("message").cloned().unwrap_or_default();
            let content = message
                .get("content")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            let tool_calls = message
                .get("tool_calls")
                .and_then(|v| v.as_array())
                .map(|calls| calls.iter().filter_map(parse_tool_call).collect())
                .unwrap_or_default();
            ModelChoice {
                content,
                tool_calls,
            }
        })
        .collect();
    Some(ModelResponse {
        choices,
        usage: extract_usage(value),
    })
}

fn parse_tool_call(call: &Value) -> Option<ToolInvocation> {
    let function = call.get("function")?;
    let name = function.get("name")?.as_str()?.to_string();
    let raw_arguments = match function.get("arguments") {
        Some(Value::String(raw)) => raw.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    let id = call
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    Some(ToolInvocation {
        id,
        name,
        raw_arguments,
    })
}

fn classify_transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        return ProviderError::transient(format!("provider request failed: {err}"));
    }
    ProviderError::fatal(format!("provider request failed: {err}"))
}

fn classify_status(
    status: StatusCode,
    detail: String,
    retry_after: Option<Duration>,
) -> ProviderError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ProviderError::RateLimited {
            message: detail,
            retry_after,
        };
    }
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return ProviderError::Transient {
            message: detail,
            retry_after,
        };
    }
    ProviderError::Fatal(detail)
}

/// Hints at or above this are ignored and the caller falls back to its own backoff.
const MAX_RETRY_AFTER_SECS: f64 = 300.0;

fn retry_after_hint(secs: f64) -> Option<Duration> {
    if !(secs > 0.0 && secs < MAX_RETRY_AFTER_SECS) {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}

pub fn parse_retry_after_header(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok())
        .and_then(retry_after_hint)
}

/// Extracts hints like "Please try again in 1.5s" or "retry after 20 seconds".
pub fn parse_retry_after_body(text: &str) -> Option<Duration> {
    let lower = text.to_ascii_lowercase();
    let start = ["try again in", "retry after", "retry in"]
        .iter()
        .find_map(|marker| lower.find(marker).map(|idx| idx + marker.len()))?;
    let rest = lower[start..].trim_start();
    let number_len = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    let value = rest[..number_len].parse::<f64>().ok()?;
    let unit = rest[number_len..].trim_start();
    let secs = if unit.starts_with("ms") {
        value / 1000.0
    } else if unit.starts_with("min") {
        value * 60.0
    } else {
        value
    };
    retry_after_hint(secs)
}

fn normalize_base(input: &str) -> String {
    if input.ends_with("/v1") {
        input.trim_end_matches('/').to_string()
    } else {
        format!("{}/v1", input.trim_end_matches('/'))
    }
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut end = max_len;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &input[..end])
}

fn extract_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    let prompt_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

fn extract_openai_error(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}
