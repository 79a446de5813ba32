use memory_worker_protocol::ParsedSummary;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::extract::preprocess_json_text;
use crate::observation::json_kind;
use crate::{coerce_optional_string, is_skip_sentinel, ParseFailure};

/// Parses a session summary. Absence, the skip sentinel, and malformed
/// output all return `None`; the raw text is always logged on that path.
pub fn parse_summary_json(text: &str, correlation_id: &str) -> Option<ParsedSummary> {
    match try_parse_summary(text) {
        Ok(Some(summary)) => {
            debug!(
                correlation_id,
                empty = summary.is_empty(),
                "parsed summary from model output"
            );
            Some(summary)
        }
        Ok(None) => {
            info!(
                correlation_id,
                raw = text,
                preprocessed = preprocess_json_text(text, false),
                "model output contained no summary"
            );
            None
        }
        Err(error) => {
            warn!(
                correlation_id,
                raw = text,
                preprocessed = preprocess_json_text(text, false),
                error = %error,
                "failed to parse summary json"
            );
            None
        }
    }
}

pub fn try_parse_summary(text: &str) -> Result<Option<ParsedSummary>, ParseFailure> {
    let preprocessed = preprocess_json_text(text, false);
    if !preprocessed.contains('{') {
        return Ok(None);
    }

    let document = serde_json::from_str::<Value>(preprocessed)?;
    if is_skip_sentinel(&document) || document.get("skip_summary").is_some() {
        return Ok(None);
    }
    let kind = json_kind(&document);
    let Value::Object(mut object) = document else {
        return Err(ParseFailure::Shape(format!(
            "summary must be an object, got {kind}"
        )));
    };

    if let Some(Value::Object(inner)) = object.remove("summary") {
        object = inner;
    }

    Ok(Some(ParsedSummary {
        request: coerce_summary_field(object.get("request")),
        investigated: coerce_summary_field(object.get("investigated")),
        learned: coerce_summary_field(object.get("learned")),
        completed: coerce_summary_field(object.get("completed")),
        next_steps: coerce_summary_field(object.get("next_steps")),
        notes: coerce_summary_field(object.get("notes")),
    }))
}

/// Strings pass through; lists of strings are joined one per line.
fn coerce_summary_field(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::Array(items)) => {
            let lines = items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .collect::<Vec<_>>();
            if lines.is_empty() {
                None
            } else {
                Some(lines.join("\n"))
            }
        }
        other => coerce_optional_string(other),
    }
}
