//! Responses API client - the model turn provider.
//!
//! Speaks the OpenAI-compatible `/v1/responses` protocol: the first turn sends
//! the instruction as plain input, later turns send `function_call_output`
//! items against `previous_response_id` so the server holds the conversation.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::actors::agent::{ToolCallRequest, ToolDeclaration, TurnProvider, TurnRequest, TurnResult};
use crate::durable::ActivityError;

use super::{status_error, transport_error};

pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 4096;
pub const POLL_REQUEST_TOOL: &str = "json_response";
pub const MAX_POLL_USERNAMES: usize = 5;

#[derive(Debug, Clone)]
pub struct ResponsesClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_output_tokens: u32,
}

impl ResponsesClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, ActivityError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| ActivityError::non_retryable("HttpClientError", e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
        })
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = tokens;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// JSON body for one turn.
    pub fn request_body(&self, request: &TurnRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "store": true,
            "max_output_tokens": self.max_output_tokens,
        });

        match &request.previous_response_id {
            Some(previous) => {
                body["previous_response_id"] = json!(previous);
                let mut inputs: Vec<Value> = request
                    .tool_outputs
                    .iter()
                    .map(|(call_id, output)| {
                        json!({
                            "type": "function_call_output",
                            "call_id": call_id,
                            "output": output,
                        })
                    })
                    .collect();
                if let Some(text) = &request.input_text {
                    inputs.push(json!({ "role": "user", "content": text }));
                }
                body["input"] = Value::Array(inputs);
            }
            None => {
                body["input"] = json!(request.input_text.clone().unwrap_or_default());
            }
        }

        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.iter().map(function_tool).collect());
            if let Some(choice) = &request.tool_choice {
                body["tool_choice"] = json!(choice);
            }
        }
        body
    }
}

fn function_tool(tool: &ToolDeclaration) -> Value {
    json!({
        "type": "function",
        "name": tool.name,
        "description": tool.description,
        "parameters": tool.parameters,
        "strict": true,
    })
}

#[async_trait]
impl TurnProvider for ResponsesClient {
    async fn generate_turn(&self, request: &TurnRequest) -> Result<TurnResult, ActivityError> {
        let url = format!("{}/v1/responses", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| transport_error("responses", e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error("responses", e))?;
        if !status.is_success() {
            return Err(status_error("responses api", status, &body));
        }

        let result = parse_responses_output(&body)?;
        tracing::debug!(
            model = %self.model,
            response_id = %result.response_id,
            tool_calls = result.tool_calls.len(),
            "Responses turn completed"
        );
        Ok(result)
    }
}

/// Extract assistant text, tool calls and the response id from a Responses body.
///
/// `output` is normally an array of items but a single object is accepted too.
/// Text parts are joined with newlines and trimmed; calls without an id or
/// name are dropped.
pub fn parse_responses_output(body: &str) -> Result<TurnResult, ActivityError> {
    let root: Value = serde_json::from_str(body).map_err(|e| {
        ActivityError::non_retryable(
            "ResponseDecodeError",
            format!("failed to decode responses body: {e}"),
        )
    })?;
    let response_id = root
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let items: Vec<&Value> = match root.get("output") {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(item @ Value::Object(_)) => vec![item],
        Some(Value::Null) | None => Vec::new(),
        Some(other) => {
            return Err(ActivityError::non_retryable(
                "ResponseDecodeError",
                format!("unexpected responses output format: {other}"),
            ))
        }
    };

    let mut texts = Vec::new();
    let mut tool_calls = Vec::new();
    for item in items {
        match item.get("type").and_then(Value::as_str) {
            Some("message") => {
                if let Some(content) = item.get("content").and_then(Value::as_array) {
                    for part in content {
                        if part.get("type").and_then(Value::as_str) == Some("output_text") {
                            if let Some(text) = part.get("text").and_then(Value::as_str) {
                                if !text.is_empty() {
                                    texts.push(text.to_string());
                                }
                            }
                        }
                    }
                }
                if let Some(calls) = item.get("tool_calls").and_then(Value::as_array) {
                    for raw in calls {
                        let id = str_field(raw, "id");
                        let function = raw.get("function");
                        let name = function.map(|f| str_field(f, "name")).unwrap_or_default();
                        let arguments = function
                            .map(|f| str_field(f, "arguments"))
                            .unwrap_or_default();
                        push_call(&mut tool_calls, id, name, arguments);
                    }
                }
            }
            Some("function_call") => {
                let arguments = match item.get("arguments") {
                    Some(Value::String(s)) => s.clone(),
                    Some(obj @ Value::Object(_)) => obj.to_string(),
                    _ => String::new(),
                };
                push_call(
                    &mut tool_calls,
                    str_field(item, "call_id"),
                    str_field(item, "name"),
                    arguments,
                );
            }
            _ => {}
        }
    }

    Ok(TurnResult {
        response_id,
        assistant_text: texts.join("\n").trim().to_string(),
        tool_calls,
    })
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn push_call(calls: &mut Vec<ToolCallRequest>, id: String, name: String, arguments: String) {
    if !id.is_empty() && !name.is_empty() {
        calls.push(ToolCallRequest {
            id,
            name,
            arguments,
        });
    }
}

// ============================================================================
// Poll request parsing
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedPollRequest {
    pub question: String,
    pub usernames: Vec<String>,
}

pub fn poll_request_tool() -> ToolDeclaration {
    ToolDeclaration {
        name: POLL_REQUEST_TOOL.to_string(),
        description: "A tool to provide a JSON response.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "question": {"type": "string"},
                "usernames": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["question", "usernames"],
            "additionalProperties": false
        }),
    }
}

/// Turn a free-text poll request into a question and at most five usernames.
pub async fn parse_poll_request<P: TurnProvider + ?Sized>(
    provider: &P,
    system_prompt: &str,
    poll_request: &str,
) -> Result<ParsedPollRequest, ActivityError> {
    let input = if system_prompt.trim().is_empty() {
        poll_request.to_string()
    } else {
        format!("{system_prompt}\n\n{poll_request}")
    };
    let request = TurnRequest {
        input_text: Some(input),
        tools: vec![poll_request_tool()],
        tool_choice: Some("required".to_string()),
        ..Default::default()
    };

    let turn = provider.generate_turn(&request).await?;
    let call = turn.tool_calls.first().ok_or_else(|| {
        ActivityError::non_retryable(
            "MissingToolCall",
            "LLM did not return the expected tool call",
        )
    })?;

    let mut parsed: ParsedPollRequest = serde_json::from_str(&call.arguments).map_err(|e| {
        ActivityError::non_retryable(
            "ResponseDecodeError",
            format!("failed to unmarshal LLM response: {e}"),
        )
    })?;
    parsed.usernames = parsed
        .usernames
        .into_iter()
        .map(|u| u.strip_prefix('@').unwrap_or(&u).to_string())
        .take(MAX_POLL_USERNAMES)
        .collect();
    Ok(parsed)
}
