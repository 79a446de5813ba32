use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use memory_worker_config::{ConfigError, ENV_PREFIX};
use memory_worker_store::ObservationStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub session_id: String,
    pub project: String,
    pub user_prompt: String,
    pub prompt_number: u32,
    pub store_dir: PathBuf,
}

pub fn load_session_settings(
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<SessionSettings, ConfigError> {
    let read = |name: &str| {
        lookup(&format!("{ENV_PREFIX}{name}"))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    let prompt_number = match read("PROMPT_NUMBER") {
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}PROMPT_NUMBER"),
                value: raw,
                expected: "a non-negative integer",
            })?,
        None => 1,
    };

    Ok(SessionSettings {
        session_id: read("SESSION_ID").unwrap_or_else(generated_session_id),
        project: read("PROJECT").unwrap_or_else(|| "default".to_string()),
        user_prompt: read("USER_PROMPT").unwrap_or_default(),
        prompt_number,
        store_dir: read("STORE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(ObservationStore::default_root_dir),
    })
}

fn generated_session_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("session-{millis}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<_, _>>();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn reads_session_identity_from_prefixed_variables() {
        let lookup = lookup_from(&[
            ("MEMORY_WORKER_SESSION_ID", "abc"),
            ("MEMORY_WORKER_PROJECT", "demo"),
            ("MEMORY_WORKER_USER_PROMPT", "  add retries  "),
            ("MEMORY_WORKER_PROMPT_NUMBER", "4"),
            ("MEMORY_WORKER_STORE_DIR", "/tmp/memory"),
        ]);
        let settings = load_session_settings(&lookup).expect("settings");
        assert_eq!(settings.session_id, "abc");
        assert_eq!(settings.project, "demo");
        assert_eq!(settings.user_prompt, "add retries");
        assert_eq!(settings.prompt_number, 4);
        assert_eq!(settings.store_dir, PathBuf::from("/tmp/memory"));
    }

    #[test]
    fn defaults_apply_and_bad_prompt_number_is_rejected() {
        let settings = load_session_settings(&lookup_from(&[])).expect("settings");
        assert!(settings.session_id.starts_with("session-"));
        assert_eq!(settings.project, "default");
        assert_eq!(settings.prompt_number, 1);

        let error = load_session_settings(&lookup_from(&[("MEMORY_WORKER_PROMPT_NUMBER", "two")]))
            .expect_err("invalid");
        assert!(matches!(error, ConfigError::InvalidValue { ref value, .. } if value == "two"));
    }
}
