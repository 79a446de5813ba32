use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    pub fn is_user(&self) -> bool {
        self.role == MessageRole::User
    }
}

/// One unit of work pulled from the session's pending queue.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PendingMessage {
    Observation(ToolUseEvent),
    Summarize(SummarizeRequest),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ToolUseEvent {
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    #[serde(default)]
    pub tool_response: Value,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub prompt_number: Option<u32>,
    #[serde(default, rename = "_persistentId", skip_serializing_if = "Option::is_none")]
    pub persistent_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct SummarizeRequest {
    #[serde(default)]
    pub last_assistant_message: Option<String>,
    #[serde(default, rename = "_persistentId", skip_serializing_if = "Option::is_none")]
    pub persistent_id: Option<i64>,
}

impl PendingMessage {
    pub fn persistent_id(&self) -> Option<i64> {
        match self {
            PendingMessage::Observation(event) => event.persistent_id,
            PendingMessage::Summarize(request) => request.persistent_id,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ObservationTypeSpec {
    pub id: String,
    #[serde(default)]
    pub description: String,
}

/// Read-only view of the active mode: which observation types the model may
/// emit and which concept tags it should use. The first type is the fallback.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ObservationMode {
    pub name: String,
    pub types: Vec<ObservationTypeSpec>,
    #[serde(default)]
    pub concepts: Vec<String>,
}

impl ObservationMode {
    pub fn new(name: impl Into<String>, types: Vec<ObservationTypeSpec>) -> Self {
        Self {
            name: name.into(),
            types,
            concepts: Vec::new(),
        }
    }

    pub fn type_ids(&self) -> Vec<&str> {
        self.types.iter().map(|spec| spec.id.as_str()).collect()
    }

    pub fn is_valid_type(&self, candidate: &str) -> bool {
        self.types.iter().any(|spec| spec.id == candidate)
    }

    pub fn fallback_type(&self) -> Option<&str> {
        self.types.first().map(|spec| spec.id.as_str())
    }
}

impl Default for ObservationMode {
    fn default() -> Self {
        let types = [
            ("bugfix", "Something was broken and is now fixed"),
            ("feature", "New capability or functionality added"),
            ("refactor", "Code restructured without changing behavior"),
            ("change", "Generic modification (docs, config, misc)"),
            ("discovery", "Learning about existing system behavior"),
            ("decision", "Architectural or design choice with rationale"),
        ]
        .into_iter()
        .map(|(id, description)| ObservationTypeSpec {
            id: id.to_string(),
            description: description.to_string(),
        })
        .collect();

        Self {
            name: "code".to_string(),
            types,
            concepts: [
                "how-it-works",
                "why-it-exists",
                "what-changed",
                "problem-solution",
                "gotcha",
                "pattern",
                "trade-off",
            ]
            .into_iter()
            .map(ToString::to_string)
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ParsedObservation {
    #[serde(rename = "type")]
    pub observation_type: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub narrative: Option<String>,
    #[serde(default)]
    pub facts: Vec<String>,
    #[serde(default)]
    pub concepts: Vec<String>,
    #[serde(default)]
    pub files_read: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ParsedSummary {
    #[serde(default)]
    pub request: Option<String>,
    #[serde(default)]
    pub investigated: Option<String>,
    #[serde(default)]
    pub learned: Option<String>,
    #[serde(default)]
    pub completed: Option<String>,
    #[serde(default)]
    pub next_steps: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl ParsedSummary {
    pub fn is_empty(&self) -> bool {
        self.request.is_none()
            && self.investigated.is_none()
            && self.learned.is_none()
            && self.completed.is_none()
            && self.next_steps.is_none()
            && self.notes.is_none()
    }
}

/// Normalized provider answer: the assembled text plus reported usage.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProviderReply {
    pub content: String,
    #[serde(default)]
    pub tokens_used: Option<u64>,
}

impl ProviderReply {
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_message_reads_tagged_tool_event_with_persistent_id() {
        let raw = r#"{
            "type": "observation",
            "tool_name": "Edit",
            "tool_input": {"file_path": "src/lib.rs"},
            "tool_response": "ok",
            "cwd": "/repo",
            "prompt_number": 3,
            "_persistentId": 42
        }"#;

        let decoded: PendingMessage = serde_json::from_str(raw).expect("decode pending message");
        let PendingMessage::Observation(event) = &decoded else {
            panic!("expected observation variant");
        };
        assert_eq!(event.tool_name, "Edit");
        assert_eq!(event.prompt_number, Some(3));
        assert_eq!(decoded.persistent_id(), Some(42));
        assert_eq!(event.tool_input["file_path"], "src/lib.rs");
    }

    #[test]
    fn summarize_request_tolerates_missing_fields() {
        let decoded: PendingMessage =
            serde_json::from_str(r#"{"type":"summarize"}"#).expect("decode summarize");
        assert!(matches!(
            decoded,
            PendingMessage::Summarize(SummarizeRequest {
                last_assistant_message: None,
                persistent_id: None,
            })
        ));
    }

    #[test]
    fn observation_serializes_type_field_name() {
        let observation = ParsedObservation {
            observation_type: "bugfix".to_string(),
            title: Some("Fix off-by-one".to_string()),
            ..ParsedObservation::default()
        };
        let json = serde_json::to_value(&observation).expect("serialize observation");
        assert_eq!(json["type"], "bugfix");
        assert!(json.get("observation_type").is_none());
    }

    #[test]
    fn default_mode_falls_back_to_first_type() {
        let mode = ObservationMode::default();
        assert_eq!(mode.fallback_type(), Some("bugfix"));
        assert!(mode.is_valid_type("discovery"));
        assert!(!mode.is_valid_type("how-it-works"));
    }

    #[test]
    fn empty_summary_is_still_a_value() {
        let summary = ParsedSummary::default();
        assert!(summary.is_empty());
        let json = serde_json::to_string(&summary).expect("serialize summary");
        assert!(json.contains("\"next_steps\":null"));
    }
}
