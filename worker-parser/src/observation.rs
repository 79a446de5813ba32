use memory_worker_protocol::{ObservationMode, ParsedObservation};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::extract::preprocess_json_text;
use crate::{coerce_optional_string, is_skip_sentinel, ParseFailure};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservationsOutcome {
    /// The model deliberately produced nothing this turn.
    Skipped(SkipReason),
    Parsed(Vec<ParsedObservation>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoJson,
    Sentinel,
    /// A bare `{}`, the usual reply to the init prompt.
    EmptyObject,
}

/// Parses model output into observations. Never fails: every problem is
/// logged with the untouched raw text and degrades to an empty list.
pub fn parse_observations_json(
    text: &str,
    correlation_id: &str,
    mode: &ObservationMode,
) -> Vec<ParsedObservation> {
    match try_parse_observations(text, correlation_id, mode) {
        Ok(ObservationsOutcome::Parsed(observations)) => {
            debug!(
                correlation_id,
                count = observations.len(),
                "parsed observations from model output"
            );
            observations
        }
        Ok(ObservationsOutcome::Skipped(reason)) => {
            info!(correlation_id, ?reason, raw = text, "model skipped observations");
            Vec::new()
        }
        Err(error) => {
            warn!(
                correlation_id,
                raw = text,
                preprocessed = preprocess_json_text(text, true),
                error = %error,
                "failed to parse observations json"
            );
            Vec::new()
        }
    }
}

pub fn try_parse_observations(
    text: &str,
    correlation_id: &str,
    mode: &ObservationMode,
) -> Result<ObservationsOutcome, ParseFailure> {
    let preprocessed = preprocess_json_text(text, true);
    if !preprocessed.contains('{') && !preprocessed.contains('[') {
        return Ok(ObservationsOutcome::Skipped(SkipReason::NoJson));
    }

    let document = serde_json::from_str::<Value>(preprocessed)?;
    if is_skip_sentinel(&document) {
        return Ok(ObservationsOutcome::Skipped(SkipReason::Sentinel));
    }

    let fallback_type = mode
        .fallback_type()
        .ok_or(ParseFailure::EmptyTypeWhitelist)?;

    let raw_items = match document {
        Value::Array(items) => items,
        Value::Object(mut object) => match object.remove("observations") {
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(ParseFailure::Shape(format!(
                    "`observations` must be an array, got {}",
                    json_kind(&other)
                )))
            }
            None if object.contains_key("type") => vec![Value::Object(object)],
            None if object.is_empty() => {
                return Ok(ObservationsOutcome::Skipped(SkipReason::EmptyObject))
            }
            None => {
                return Err(ParseFailure::Shape(
                    "object has neither `observations` nor `type`".to_string(),
                ))
            }
        },
        other => {
            return Err(ParseFailure::Shape(format!(
                "expected an object or array, got {}",
                json_kind(&other)
            )))
        }
    };

    let observations = raw_items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| match item.as_object() {
            Some(object) => Some(coerce_observation(object, mode, fallback_type, correlation_id)),
            None => {
                warn!(
                    correlation_id,
                    index,
                    kind = json_kind(item),
                    "ignoring non-object observation entry"
                );
                None
            }
        })
        .collect();

    Ok(ObservationsOutcome::Parsed(observations))
}

fn coerce_observation(
    object: &Map<String, Value>,
    mode: &ObservationMode,
    fallback_type: &str,
    correlation_id: &str,
) -> ParsedObservation {
    let raw_type = object
        .get("type")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let observation_type = match raw_type {
        Some(candidate) if mode.is_valid_type(candidate) => candidate.to_string(),
        Some(candidate) => {
            warn!(
                correlation_id,
                raw_type = candidate,
                fallback = fallback_type,
                valid_types = ?mode.type_ids(),
                "invalid observation type, using fallback"
            );
            fallback_type.to_string()
        }
        None => {
            warn!(
                correlation_id,
                fallback = fallback_type,
                "observation is missing a type, using fallback"
            );
            fallback_type.to_string()
        }
    };

    let mut concepts = coerce_string_list(object.get("concepts"));
    let concepts_before = concepts.len();
    concepts.retain(|concept| !concept.eq_ignore_ascii_case(&observation_type));
    if concepts.len() != concepts_before {
        debug!(
            correlation_id,
            observation_type = observation_type.as_str(),
            "removed observation type from concepts"
        );
    }

    ParsedObservation {
        title: coerce_optional_string(object.get("title")),
        subtitle: coerce_optional_string(object.get("subtitle")),
        narrative: coerce_optional_string(object.get("narrative")),
        facts: coerce_string_list(object.get("facts")),
        concepts,
        files_read: coerce_string_list(object.get("files_read")),
        files_modified: coerce_string_list(object.get("files_modified")),
        observation_type,
    }
}

/// Keeps string entries only; a lone string becomes a one-element list.
fn coerce_string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(ToString::to_string)
            .collect(),
        Some(Value::String(item)) if !item.trim().is_empty() => vec![item.trim().to_string()],
        _ => Vec::new(),
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory_worker_protocol::ObservationTypeSpec;

    fn mode() -> ObservationMode {
        ObservationMode::new(
            "test",
            ["discovery", "bugfix", "feature"]
                .into_iter()
                .map(|id| ObservationTypeSpec {
                    id: id.to_string(),
                    description: String::new(),
                })
                .collect(),
        )
    }

    #[test]
    fn skip_sentinel_and_prose_yield_no_observations() {
        assert!(parse_observations_json(r#"{"skip":true}"#, "t", &mode()).is_empty());
        assert!(parse_observations_json("Nothing notable happened here.", "t", &mode()).is_empty());
        assert_eq!(
            try_parse_observations("Only prose.", "t", &mode()).expect("outcome"),
            ObservationsOutcome::Skipped(SkipReason::NoJson)
        );
        assert_eq!(
            try_parse_observations("```json\n{\"skip\": true}\n```", "t", &mode()).expect("outcome"),
            ObservationsOutcome::Skipped(SkipReason::Sentinel)
        );
    }

    #[test]
    fn accepts_array_wrapper_and_single_object_shapes() {
        let bare = r#"[{"type":"bugfix","title":"a"},{"type":"feature","title":"b"}]"#;
        let wrapped = r#"{"observations":[{"type":"bugfix","title":"a"},{"type":"feature","title":"b"}]}"#;
        for text in [bare, wrapped] {
            let parsed = parse_observations_json(text, "t", &mode());
            assert_eq!(parsed.len(), 2, "input: {text}");
            assert_eq!(parsed[0].observation_type, "bugfix");
            assert_eq!(parsed[1].title.as_deref(), Some("b"));
        }

        let single = parse_observations_json(
            "Here you go:\n```json\n{\"type\":\"discovery\",\"narrative\":\"found it\"}\n```",
            "t",
            &mode(),
        );
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].narrative.as_deref(), Some("found it"));
    }

    #[test]
    fn invalid_or_missing_type_falls_back_to_first_whitelist_entry() {
        let parsed = parse_observations_json(
            r#"[{"type":"how-it-works","title":"x"},{"title":"y"},{"type":"  "}]"#,
            "t",
            &mode(),
        );
        assert_eq!(parsed.len(), 3);
        assert!(parsed
            .iter()
            .all(|observation| observation.observation_type == "discovery"));
    }

    #[test]
    fn concepts_never_contain_the_resolved_type() {
        let parsed = parse_observations_json(
            r#"{"type":"bugfix","concepts":["bugfix","gotcha","BugFix"]}"#,
            "t",
            &mode(),
        );
        assert_eq!(parsed[0].concepts, vec!["gotcha".to_string()]);

        let fallback = parse_observations_json(
            r#"{"type":"nonsense","concepts":["discovery","pattern"]}"#,
            "t",
            &mode(),
        );
        assert_eq!(fallback[0].observation_type, "discovery");
        assert_eq!(fallback[0].concepts, vec!["pattern".to_string()]);
    }

    #[test]
    fn coerces_lists_by_dropping_non_strings() {
        let parsed = parse_observations_json(
            r#"{"type":"feature","facts":["one",2,null,{"x":1}," two "],"files_read":"src/a.rs","files_modified":[true],"title":42}"#,
            "t",
            &mode(),
        );
        let observation = &parsed[0];
        assert_eq!(observation.facts, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(observation.files_read, vec!["src/a.rs".to_string()]);
        assert!(observation.files_modified.is_empty());
        assert_eq!(observation.title, None);
    }

    #[test]
    fn lone_object_needs_a_type_to_count_as_an_observation() {
        assert_eq!(
            try_parse_observations("{}", "t", &mode()).expect("outcome"),
            ObservationsOutcome::Skipped(SkipReason::EmptyObject)
        );
        assert!(parse_observations_json("  {}  ", "t", &mode()).is_empty());
        assert!(matches!(
            try_parse_observations(r#"{"title":"untyped"}"#, "t", &mode()),
            Err(ParseFailure::Shape(_))
        ));
        assert!(parse_observations_json(r#"{"title":"untyped"}"#, "t", &mode()).is_empty());

        let typed = parse_observations_json(r#"{"type":"","title":"typed"}"#, "t", &mode());
        assert_eq!(typed.len(), 1);
        assert_eq!(typed[0].observation_type, "discovery");
    }

    #[test]
    fn malformed_json_degrades_to_empty_list() {
        assert!(parse_observations_json(r#"{"type":"bugfix","title":"#, "t", &mode()).is_empty());
        assert!(parse_observations_json(r#"{"observations":"nope"}"#, "t", &mode()).is_empty());
        assert!(matches!(
            try_parse_observations(r#"{"observations":"nope"}"#, "t", &mode()),
            Err(ParseFailure::Shape(_))
        ));
    }

    #[test]
    fn empty_whitelist_is_reported_not_invented() {
        let empty = ObservationMode::new("empty", Vec::new());
        assert!(matches!(
            try_parse_observations(r#"{"type":"bugfix"}"#, "t", &empty),
            Err(ParseFailure::EmptyTypeWhitelist)
        ));
        assert!(parse_observations_json(r#"{"type":"bugfix"}"#, "t", &empty).is_empty());
    }
}
