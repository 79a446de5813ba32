use memory_worker_config::ProviderProtocol;
use memory_worker_protocol::ProviderReply;
use serde_json::Value;
use tracing::{debug, warn};

use crate::ModelError;

const DONE_SENTINEL: &str = "[DONE]";

/// Splits an SSE body into parsed `data:` events. Multi-line `data:` fields
/// are joined with `\n`; `[DONE]` and unparsable events are dropped.
pub fn decode_sse_events(raw: &str) -> Vec<Value> {
    let mut events = Vec::new();
    let mut fragments: Vec<&str> = Vec::new();

    for line in raw.lines() {
        if line.trim().is_empty() {
            flush_event(&mut fragments, &mut events);
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            fragments.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    flush_event(&mut fragments, &mut events);
    events
}

fn flush_event(fragments: &mut Vec<&str>, events: &mut Vec<Value>) {
    if fragments.is_empty() {
        return;
    }
    let data = fragments.join("\n");
    fragments.clear();

    let data = data.trim();
    if data.is_empty() || data == DONE_SENTINEL {
        return;
    }
    match serde_json::from_str::<Value>(data) {
        Ok(event) => events.push(event),
        Err(error) => debug!(error = %error, "skipping unparsable sse event"),
    }
}

/// Turns a successful HTTP body (SSE or plain JSON) into one reply.
pub fn normalize_response(
    protocol: ProviderProtocol,
    status: u16,
    body: &str,
) -> Result<ProviderReply, ModelError> {
    let mut documents = decode_sse_events(body);
    if documents.is_empty() {
        let document = serde_json::from_str::<Value>(body.trim()).map_err(|error| {
            ModelError::MalformedResponse {
                status,
                detail: error.to_string(),
            }
        })?;
        match document {
            Value::Array(items) => documents = items,
            other => documents.push(other),
        }
    }

    let mut reply = ProviderReply::default();
    for document in &documents {
        if let Some(message) = embedded_error_message(document) {
            return Err(ModelError::Provider { message });
        }
        match protocol {
            ProviderProtocol::OpenAi => absorb_openai(document, &mut reply),
            ProviderProtocol::Gemini => absorb_gemini(document, &mut reply),
        }
    }
    Ok(reply)
}

fn absorb_openai(document: &Value, reply: &mut ProviderReply) {
    if let Some(total) = document
        .pointer("/usage/total_tokens")
        .and_then(Value::as_u64)
    {
        reply.tokens_used = Some(total);
    }
    let Some(choice) = document.pointer("/choices/0") else {
        return;
    };
    let text = choice
        .pointer("/message/content")
        .and_then(Value::as_str)
        .or_else(|| choice.pointer("/delta/content").and_then(Value::as_str));
    if let Some(text) = text {
        reply.content.push_str(text);
    }
}

fn absorb_gemini(document: &Value, reply: &mut ProviderReply) {
    if let Some(total) = document
        .pointer("/usageMetadata/totalTokenCount")
        .and_then(Value::as_u64)
    {
        reply.tokens_used = Some(total);
    }
    match document
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
    {
        Some(parts) => {
            for part in parts.iter().filter(|part| !is_thought_part(part)) {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    reply.content.push_str(text);
                }
            }
        }
        None => {
            if let Some(reason) = document
                .pointer("/promptFeedback/blockReason")
                .and_then(Value::as_str)
            {
                warn!(block_reason = reason, "gemini blocked the prompt");
            }
        }
    }
}

fn is_thought_part(part: &Value) -> bool {
    part.get("thought").and_then(Value::as_bool).unwrap_or(false)
        || part.get("thoughtSignature").is_some()
}

fn embedded_error_message(document: &Value) -> Option<String> {
    let error = document.get("error")?;
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .or_else(|| error.as_str().map(ToString::to_string))
        .unwrap_or_else(|| error.to_string());
    let code = match error.get("code") {
        Some(Value::String(code)) if !code.trim().is_empty() => Some(code.trim().to_string()),
        Some(Value::Number(code)) => Some(code.to_string()),
        _ => None,
    };
    Some(match code {
        Some(code) => format!("{code} - {message}"),
        None => message,
    })
}

/// Shortens a non-2xx body to something fit for an error message.
pub(crate) fn summarize_error_body(body: &str) -> String {
    if let Ok(document) = serde_json::from_str::<Value>(body) {
        if let Some(message) = embedded_error_message(&document) {
            return message;
        }
    }
    let trimmed = body.trim();
    if trimmed.chars().count() > 500 {
        let mut short = trimmed.chars().take(500).collect::<String>();
        short.push_str("...");
        return short;
    }
    trimmed.to_string()
}
