//! Reasoning backend contract and the Anthropic-style HTTP implementation.
//!
//! The orchestration loop only ever sees [`ReasoningBackend`]: given the
//! transcript and the tool catalog it returns an assistant message carrying
//! either final text or requested tool calls. Backend unavailability and
//! unparsable responses surface as [`BackendError`], fatal to the current
//! turn only.

use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::{
    env_optional, env_required, env_u64, jitter_ratio, parse_retry_after, AgentMessage,
    AgentToolCall,
};

#[derive(Debug, Error)]
pub(crate) enum BackendError {
    #[error("reasoning backend unavailable: {0}")]
    Unavailable(String),
    #[error("reasoning backend returned an unparsable response: {0}")]
    BadResponse(String),
    #[error("reasoning backend misconfigured: {0}")]
    Config(String),
}

pub(crate) trait ReasoningBackend: Send + Sync {
    fn complete(
        &self,
        system: &str,
        messages: &[AgentMessage],
        tools: &[serde_json::Value],
    ) -> Result<AgentMessage, BackendError>;
}

// ── HTTP implementation ──────────────────────────────────────────────────

const ANTHROPIC_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT_SECS: u64 = 120;
const RETRY_BASE_SECS: f64 = 0.5;
const RETRY_MAX_SECS: f64 = 4.0;

pub(crate) struct HttpBackend {
    base_url: String,
    model: String,
    api_key: String,
    max_retries: u64,
    max_tokens: u64,
}

impl HttpBackend {
    pub(crate) fn from_env(base_url: &str, model: &str) -> Result<Self, BackendError> {
        let api_key = env_required("LODESTAR_API_KEY")
            .or_else(|_| env_required("ANTHROPIC_API_KEY"))
            .map_err(|e| BackendError::Config(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            max_retries: env_u64("LODESTAR_BACKEND_RETRIES", 3),
            max_tokens: env_u64("LODESTAR_BACKEND_MAX_TOKENS", 4096),
        })
    }
}

impl ReasoningBackend for HttpBackend {
    fn complete(
        &self,
        system: &str,
        messages: &[AgentMessage],
        tools: &[serde_json::Value],
    ) -> Result<AgentMessage, BackendError> {
        let mut system_blocks = vec![system.to_string()];
        system_blocks.extend(collect_system_blocks(messages));
        let mut payload = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": system_blocks.join("\n\n"),
            "messages": to_wire_messages(messages),
        });
        if !tools.is_empty() {
            payload["tools"] = serde_json::json!(tools);
        }
        if let Some(model) = env_optional("LODESTAR_MODEL_OVERRIDE") {
            payload["model"] = serde_json::json!(model);
        }

        let endpoint = format!("{}/v1/messages", self.base_url);
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build();
        let retryable = |status: u16| matches!(status, 429 | 500 | 502 | 503 | 504 | 529);

        let mut body = None;
        for attempt in 0..=self.max_retries {
            let request = agent
                .post(&endpoint)
                .set("content-type", "application/json")
                .set("x-api-key", &self.api_key)
                .set("anthropic-version", ANTHROPIC_VERSION);
            match request.send_json(payload.clone()) {
                Ok(resp) => {
                    body = Some(resp.into_string().map_err(|e| {
                        BackendError::Unavailable(format!("read response: {e}"))
                    })?);
                    break;
                }
                Err(ureq::Error::Status(code, resp)) => {
                    let retry_after = parse_retry_after(&resp);
                    let text = resp.into_string().unwrap_or_default();
                    if attempt < self.max_retries && retryable(code) {
                        let mut delay =
                            (RETRY_BASE_SECS * 2.0_f64.powi(attempt as i32)).min(RETRY_MAX_SECS);
                        if let Some(retry_after) = retry_after {
                            delay = delay.max(retry_after);
                        }
                        delay *= 1.0 + jitter_ratio() * 0.2;
                        thread::sleep(Duration::from_secs_f64(delay));
                        continue;
                    }
                    return Err(BackendError::Unavailable(format!("HTTP {code}: {text}")));
                }
                Err(ureq::Error::Transport(err)) => {
                    if attempt < self.max_retries {
                        let delay =
                            (RETRY_BASE_SECS * 2.0_f64.powi(attempt as i32)).min(RETRY_MAX_SECS);
                        thread::sleep(Duration::from_secs_f64(delay));
                        continue;
                    }
                    return Err(BackendError::Unavailable(err.to_string()));
                }
            }
        }

        let body = body.ok_or_else(|| BackendError::Unavailable("no response".to_string()))?;
        let payload: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| BackendError::BadResponse(e.to_string()))?;
        parse_backend_response(&payload)
    }
}

// ── Wire conversion ──────────────────────────────────────────────────────

/// Mid-transcript system reminders ride along in the system parameter, not
/// the message list.
pub(crate) fn collect_system_blocks(messages: &[AgentMessage]) -> Vec<String> {
    let mut blocks = Vec::new();
    for msg in messages {
        if msg.role == "system" {
            if let Some(content) = &msg.content {
                if !content.trim().is_empty() {
                    blocks.push(content.trim().to_string());
                }
            }
        }
    }
    blocks
}

/// Transcript → Anthropic content-block messages. System and reminder rows
/// are carried separately; tool results reference their originating call id.
pub(crate) fn to_wire_messages(messages: &[AgentMessage]) -> Vec<serde_json::Value> {
    let mut out = Vec::new();
    for msg in messages {
        match msg.role.as_str() {
            "system" => continue,
            "user" => {
                let content = msg.content.clone().unwrap_or_default();
                out.push(serde_json::json!({
                    "role": "user",
                    "content": [{"type": "text", "text": content}],
                }));
            }
            "assistant" => {
                let mut blocks = Vec::new();
                if let Some(content) = &msg.content {
                    if !content.is_empty() {
                        blocks.push(serde_json::json!({"type": "text", "text": content}));
                    }
                }
                for call in &msg.tool_calls {
                    blocks.push(serde_json::json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.args,
                    }));
                }
                if blocks.is_empty() {
                    blocks.push(serde_json::json!({"type": "text", "text": ""}));
                }
                out.push(serde_json::json!({"role": "assistant", "content": blocks}));
            }
            "tool" => {
                let Some(tool_id) = msg.tool_call_id.clone() else {
                    continue;
                };
                out.push(serde_json::json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": tool_id,
                        "content": msg.content.clone().unwrap_or_default(),
                        "is_error": msg.is_error.unwrap_or(false),
                    }],
                }));
            }
            _ => {}
        }
    }
    out
}

/// Anthropic response payload → assistant transcript message.
pub(crate) fn parse_backend_response(
    payload: &serde_json::Value,
) -> Result<AgentMessage, BackendError> {
    let content = payload
        .get("content")
        .and_then(|v| v.as_array())
        .ok_or_else(|| BackendError::BadResponse("missing content array".to_string()))?;

    let mut text_parts = Vec::new();
    let mut tool_calls = Vec::new();
    for block in content {
        match block.get("type").and_then(|v| v.as_str()) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                    if !text.is_empty() {
                        text_parts.push(text.to_string());
                    }
                }
            }
            Some("tool_use") => {
                let id = block
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| BackendError::BadResponse("tool_use without id".to_string()))?;
                let name = block
                    .get("name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| BackendError::BadResponse("tool_use without name".to_string()))?;
                tool_calls.push(AgentToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    args: block.get("input").cloned().unwrap_or(serde_json::json!({})),
                });
            }
            _ => {}
        }
    }

    let text = text_parts.join("\n");
    Ok(AgentMessage {
        role: "assistant".to_string(),
        content: if text.is_empty() { None } else { Some(text) },
        tool_calls,
        tool_call_id: None,
        is_error: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_response() {
        let payload = serde_json::json!({
            "content": [{"type": "text", "text": "hello"}],
            "stop_reason": "end_turn",
        });
        let msg = parse_backend_response(&payload).unwrap();
        assert_eq!(msg.content.as_deref(), Some("hello"));
        assert!(msg.tool_calls.is_empty());
    }

    #[test]
    fn parses_tool_use_blocks() {
        let payload = serde_json::json!({
            "content": [
                {"type": "text", "text": "let me check"},
                {"type": "tool_use", "id": "tu_1", "name": "arxiv_search",
                 "input": {"query": "skyrmions"}},
            ],
        });
        let msg = parse_backend_response(&payload).unwrap();
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(msg.tool_calls[0].name, "arxiv_search");
        assert_eq!(msg.tool_calls[0].args["query"], "skyrmions");
    }

    #[test]
    fn rejects_malformed_payload() {
        let payload = serde_json::json!({ "oops": true });
        assert!(matches!(
            parse_backend_response(&payload),
            Err(BackendError::BadResponse(_))
        ));
        let missing_name = serde_json::json!({
            "content": [{"type": "tool_use", "id": "tu_1"}],
        });
        assert!(matches!(
            parse_backend_response(&missing_name),
            Err(BackendError::BadResponse(_))
        ));
    }

    #[test]
    fn wire_messages_carry_tool_results() {
        let messages = vec![
            AgentMessage::text("user", "check the queue"),
            AgentMessage {
                role: "assistant".to_string(),
                content: None,
                tool_calls: vec![AgentToolCall {
                    id: "tu_1".to_string(),
                    name: "hpc_queue".to_string(),
                    args: serde_json::json!({}),
                }],
                tool_call_id: None,
                is_error: None,
            },
            AgentMessage::tool_result("tu_1", "2 jobs running", false),
            AgentMessage::text("system", "reminder text"),
        ];
        let wire = to_wire_messages(&messages);
        assert_eq!(wire.len(), 3); // system rows never hit the wire
        assert_eq!(wire[1]["content"][0]["type"], "tool_use");
        assert_eq!(wire[2]["content"][0]["tool_use_id"], "tu_1");
        assert_eq!(wire[2]["content"][0]["is_error"], false);
    }
}
