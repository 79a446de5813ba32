use memory_worker_protocol::{ObservationMode, SummarizeRequest, ToolUseEvent};
use serde_json::Value;

use crate::{PromptBuilder, SessionState};

const MAX_TOOL_FIELD_CHARS: usize = 12_000;

/// Renders plain-text prompts that ask for JSON in the shapes the parser accepts.
#[derive(Debug, Clone, Default)]
pub struct DefaultPromptBuilder;

impl PromptBuilder for DefaultPromptBuilder {
    fn init_prompt(&self, session: &SessionState, mode: &ObservationMode) -> String {
        format!(
            "You are a memory observer for a coding session in project \"{project}\".\n\
             The user asked:\n{request}\n\n\
             You will receive tool executions one at a time. For each one, record what was \
             learned, built, fixed, or decided.\n\n{instructions}",
            project = session.project,
            request = session.user_prompt.trim(),
            instructions = observation_instructions(mode),
        )
    }

    fn continuation_prompt(&self, session: &SessionState, mode: &ObservationMode) -> String {
        format!(
            "The user sent prompt #{number} in project \"{project}\":\n{request}\n\n\
             Continue observing with the same rules.\n\n{instructions}",
            number = session.prompt_number,
            project = session.project,
            request = session.user_prompt.trim(),
            instructions = observation_instructions(mode),
        )
    }

    fn observation_prompt(&self, event: &ToolUseEvent, mode: &ObservationMode) -> String {
        let mut prompt = format!("Tool executed: {}\n", event.tool_name);
        if let Some(cwd) = event.cwd.as_deref().filter(|cwd| !cwd.trim().is_empty()) {
            prompt.push_str(&format!("Working directory: {cwd}\n"));
        }
        prompt.push_str(&format!(
            "Input:\n{}\n\nResponse:\n{}\n\nValid types: {}. Reply with JSON only, or {{\"skip\": true}} when nothing is worth remembering.",
            render_tool_field(&event.tool_input),
            render_tool_field(&event.tool_response),
            mode.type_ids().join(", "),
        ));
        prompt
    }

    fn summary_prompt(
        &self,
        session: &SessionState,
        request: &SummarizeRequest,
        _mode: &ObservationMode,
    ) -> String {
        let mut prompt = format!(
            "Summarize progress on the user's request in project \"{}\":\n{}\n\n",
            session.project,
            session.user_prompt.trim()
        );
        if let Some(last) = request
            .last_assistant_message
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
        {
            prompt.push_str(&format!(
                "The assistant's last message was:\n{}\n\n",
                truncate_chars(last, MAX_TOOL_FIELD_CHARS)
            ));
        }
        prompt.push_str(
            "Reply with a single JSON object with string fields \"request\", \"investigated\", \
             \"learned\", \"completed\", \"next_steps\", \"notes\" (use null for anything unknown), \
             or {\"skip\": true} when there is nothing to summarize.",
        );
        prompt
    }
}

fn observation_instructions(mode: &ObservationMode) -> String {
    let types = mode
        .types
        .iter()
        .map(|spec| {
            if spec.description.is_empty() {
                format!("- {}", spec.id)
            } else {
                format!("- {}: {}", spec.id, spec.description)
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    let mut text = format!(
        "Respond with JSON only: {{\"observations\": [{{\"type\", \"title\", \"subtitle\", \
         \"narrative\", \"facts\": [], \"concepts\": [], \"files_read\": [], \"files_modified\": []}}]}}.\n\
         Observation types:\n{types}\n"
    );
    if !mode.concepts.is_empty() {
        text.push_str(&format!(
            "Concepts (never repeat the type here): {}\n",
            mode.concepts.join(", ")
        ));
    }
    text.push_str("When nothing is worth recording, respond with {\"skip\": true}.");
    text
}

fn render_tool_field(value: &Value) -> String {
    let rendered = match value {
        Value::Null => "(none)".to_string(),
        Value::String(text) => text.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    };
    truncate_chars(&rendered, MAX_TOOL_FIELD_CHARS)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out = text.chars().take(max_chars).collect::<String>();
    out.push_str("\n...[truncated]");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn observation_prompt_lists_whitelist_and_truncates_large_payloads() {
        let event = ToolUseEvent {
            tool_name: "Read".to_string(),
            tool_input: json!({"file_path": "src/main.rs"}),
            tool_response: Value::String("x".repeat(MAX_TOOL_FIELD_CHARS + 50)),
            cwd: Some("/repo".to_string()),
            ..ToolUseEvent::default()
        };
        let prompt = DefaultPromptBuilder.observation_prompt(&event, &ObservationMode::default());

        assert!(prompt.contains("Tool executed: Read"));
        assert!(prompt.contains("Working directory: /repo"));
        assert!(prompt.contains("bugfix, feature, refactor"));
        assert!(prompt.contains("[truncated]"));
    }

    #[test]
    fn init_prompt_describes_types_and_skip_sentinel() {
        let session = SessionState::new("s1", "demo", "add retries", 1);
        let prompt = DefaultPromptBuilder.init_prompt(&session, &ObservationMode::default());
        assert!(prompt.contains("project \"demo\""));
        assert!(prompt.contains("- decision: Architectural"));
        assert!(prompt.contains("{\"skip\": true}"));
    }
}
