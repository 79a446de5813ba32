use memory_worker_protocol::{ConversationMessage, MessageRole};
use serde_json::{json, Value};

const TEMPERATURE: f64 = 0.3;
const MAX_OUTPUT_TOKENS: u32 = 4096;

pub(crate) fn build_openai_payload(
    model: &str,
    history: &[ConversationMessage],
    streaming: bool,
) -> Value {
    let messages = history
        .iter()
        .map(|message| {
            json!({
                "role": message.role.as_str(),
                "content": message.content,
            })
        })
        .collect::<Vec<_>>();

    let mut payload = json!({
        "model": model,
        "messages": messages,
        "temperature": TEMPERATURE,
        "max_tokens": MAX_OUTPUT_TOKENS,
        "response_format": { "type": "json_object" },
    });
    if streaming {
        payload["stream"] = Value::Bool(true);
        payload["stream_options"] = json!({ "include_usage": true });
    }
    payload
}

pub(crate) fn build_gemini_payload(
    history: &[ConversationMessage],
    thinking_budget: Option<i64>,
) -> Value {
    let contents = history
        .iter()
        .map(|message| {
            let role = match message.role {
                MessageRole::User => "user",
                MessageRole::Assistant => "model",
            };
            json!({
                "role": role,
                "parts": [{ "text": message.content }],
            })
        })
        .collect::<Vec<_>>();

    let mut generation_config = json!({
        "temperature": TEMPERATURE,
        "maxOutputTokens": MAX_OUTPUT_TOKENS,
        "responseMimeType": "application/json",
    });
    if let Some(budget) = thinking_budget {
        generation_config["thinkingConfig"] = json!({ "thinkingBudget": budget });
    }

    json!({
        "contents": contents,
        "generationConfig": generation_config,
    })
}
