use serde_json::Value;
use thiserror::Error;

pub mod extract;
mod observation;
mod summary;

pub use extract::{find_balanced_json, preprocess_json_text, strip_code_fence};
pub use observation::{
    parse_observations_json, try_parse_observations, ObservationsOutcome, SkipReason,
};
pub use summary::{parse_summary_json, try_parse_summary};

/// Recoverable parse problem. Public entry points log it and degrade.
#[derive(Debug, Error)]
pub enum ParseFailure {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected json shape: {0}")]
    Shape(String),
    #[error("observation type whitelist is empty")]
    EmptyTypeWhitelist,
}

pub(crate) fn is_skip_sentinel(document: &Value) -> bool {
    document
        .get("skip")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

pub(crate) fn coerce_optional_string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
}
