use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_PREFIX: &str = "MEMORY_WORKER_";
pub const FALLBACK_ENV_PREFIX: &str = "MEMORY_WORKER_FALLBACK_";
pub const SHARED_API_KEY_ENV: &str = "MEMORY_WORKER_API_KEY";

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_OPENAI_ENV_KEY: &str = "OPENAI_API_KEY";
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_GEMINI_ENV_KEY: &str = "GEMINI_API_KEY";

pub const DEFAULT_MAX_CONTEXT_MESSAGES: usize = 20;
pub const DEFAULT_MAX_TOKENS: u64 = 100_000;
pub const DEFAULT_FIRST_TOKEN_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_TOTAL_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderProtocol {
    OpenAi,
    Gemini,
}

impl ProviderProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderProtocol::OpenAi => "openai",
            ProviderProtocol::Gemini => "gemini",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            ProviderProtocol::OpenAi => DEFAULT_OPENAI_BASE_URL,
            ProviderProtocol::Gemini => DEFAULT_GEMINI_BASE_URL,
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            ProviderProtocol::OpenAi => DEFAULT_OPENAI_MODEL,
            ProviderProtocol::Gemini => DEFAULT_GEMINI_MODEL,
        }
    }

    pub fn default_env_key(self) -> &'static str {
        match self {
            ProviderProtocol::OpenAi => DEFAULT_OPENAI_ENV_KEY,
            ProviderProtocol::Gemini => DEFAULT_GEMINI_ENV_KEY,
        }
    }
}

impl fmt::Display for ProviderProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderProtocol {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openai" | "openrouter" | "chat_completions" => Ok(ProviderProtocol::OpenAi),
            "gemini" | "google" => Ok(ProviderProtocol::Gemini),
            other => Err(ConfigError::UnknownProtocol(other.to_string())),
        }
    }
}

/// Immutable per-call provider settings. Zero disables a budget or timer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProviderConfig {
    pub provider_name: String,
    pub protocol: ProviderProtocol,
    pub base_url: String,
    pub env_key: String,
    #[serde(skip_serializing, default)]
    pub api_key: String,
    pub model: String,
    pub streaming: bool,
    pub max_context_messages: usize,
    pub max_tokens: u64,
    pub first_token_timeout_secs: u64,
    pub total_timeout_secs: u64,
    pub max_retries: u32,
    pub requests_per_minute: u32,
    #[serde(default)]
    pub thinking_budget: Option<i64>,
}

impl ProviderConfig {
    pub fn new(protocol: ProviderProtocol, base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            provider_name: protocol.as_str().to_string(),
            protocol,
            base_url: base_url.to_string(),
            env_key: protocol.default_env_key().to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            streaming: false,
            max_context_messages: DEFAULT_MAX_CONTEXT_MESSAGES,
            max_tokens: DEFAULT_MAX_TOKENS,
            first_token_timeout_secs: DEFAULT_FIRST_TOKEN_TIMEOUT_SECS,
            total_timeout_secs: DEFAULT_TOTAL_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            requests_per_minute: 0,
            thinking_budget: None,
        }
    }

    pub fn first_token_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.first_token_timeout_secs)
    }

    pub fn total_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.total_timeout_secs)
    }

    pub fn min_request_interval(&self) -> Option<Duration> {
        if self.requests_per_minute == 0 {
            return None;
        }
        Some(Duration::from_millis(
            60_000 / u64::from(self.requests_per_minute),
        ))
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProviderOverrides {
    pub protocol: Option<ProviderProtocol>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub env_key: Option<String>,
    pub streaming: Option<bool>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no api key found; tried environment variables: {}", tried.join(", "))]
    MissingApiKey { tried: Vec<String> },
    #[error("environment variable '{key}' has invalid value '{value}': expected {expected}")]
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },
    #[error("unknown provider protocol '{0}' (expected 'openai' or 'gemini')")]
    UnknownProtocol(String),
}

pub fn load_provider_config() -> Result<ProviderConfig, ConfigError> {
    load_provider_config_with(ProviderOverrides::default())
}

pub fn load_provider_config_with(
    overrides: ProviderOverrides,
) -> Result<ProviderConfig, ConfigError> {
    load_provider_config_from(&process_env, ENV_PREFIX, overrides)
}

/// Loads the optional secondary provider; `None` when no fallback protocol is set.
pub fn load_fallback_provider_config() -> Result<Option<ProviderConfig>, ConfigError> {
    load_fallback_provider_config_from(&process_env)
}

pub fn load_fallback_provider_config_from(
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<Option<ProviderConfig>, ConfigError> {
    let key = format!("{FALLBACK_ENV_PREFIX}PROVIDER");
    if non_empty(lookup(&key)).is_none() {
        return Ok(None);
    }
    load_provider_config_from(lookup, FALLBACK_ENV_PREFIX, ProviderOverrides::default()).map(Some)
}

pub fn load_provider_config_from(
    lookup: &dyn Fn(&str) -> Option<String>,
    prefix: &str,
    overrides: ProviderOverrides,
) -> Result<ProviderConfig, ConfigError> {
    let vars = PrefixedVars { lookup, prefix };

    let protocol = match overrides.protocol {
        Some(protocol) => protocol,
        None => vars
            .own("PROVIDER")
            .map(|raw| raw.parse::<ProviderProtocol>())
            .transpose()?
            .unwrap_or(ProviderProtocol::OpenAi),
    };

    let env_key = overrides
        .env_key
        .or_else(|| vars.own("API_KEY_ENV"))
        .unwrap_or_else(|| protocol.default_env_key().to_string());
    let api_key = resolve_api_key(lookup, &env_key)?;

    let streaming = match overrides.streaming {
        Some(value) => value,
        None => vars.parse_bool("STREAM")?.unwrap_or(false),
    };

    Ok(ProviderConfig {
        provider_name: vars
            .own("PROVIDER_NAME")
            .unwrap_or_else(|| protocol.as_str().to_string()),
        protocol,
        base_url: overrides
            .base_url
            .or_else(|| vars.own("BASE_URL"))
            .unwrap_or_else(|| protocol.default_base_url().to_string()),
        env_key,
        api_key,
        model: overrides
            .model
            .or_else(|| vars.own("MODEL"))
            .unwrap_or_else(|| protocol.default_model().to_string()),
        streaming,
        max_context_messages: vars
            .parse_number::<usize>("MAX_CONTEXT_MESSAGES")?
            .unwrap_or(DEFAULT_MAX_CONTEXT_MESSAGES),
        max_tokens: vars
            .parse_number::<u64>("MAX_TOKENS")?
            .unwrap_or(DEFAULT_MAX_TOKENS),
        first_token_timeout_secs: vars
            .parse_number::<u64>("FIRST_TOKEN_TIMEOUT_SECS")?
            .unwrap_or(DEFAULT_FIRST_TOKEN_TIMEOUT_SECS),
        total_timeout_secs: vars
            .parse_number::<u64>("TOTAL_TIMEOUT_SECS")?
            .unwrap_or(DEFAULT_TOTAL_TIMEOUT_SECS),
        max_retries: vars
            .parse_number::<u32>("MAX_RETRIES")?
            .unwrap_or(DEFAULT_MAX_RETRIES)
            .max(1),
        requests_per_minute: vars
            .parse_number::<u32>("REQUESTS_PER_MINUTE")?
            .unwrap_or(0),
        thinking_budget: vars.parse_number::<i64>("THINKING_BUDGET")?,
    })
}

fn resolve_api_key(
    lookup: &dyn Fn(&str) -> Option<String>,
    env_key: &str,
) -> Result<String, ConfigError> {
    let mut tried = vec![env_key.to_string()];
    if let Some(key) = non_empty(lookup(env_key)) {
        return Ok(key);
    }
    if env_key != SHARED_API_KEY_ENV {
        tried.push(SHARED_API_KEY_ENV.to_string());
        if let Some(key) = non_empty(lookup(SHARED_API_KEY_ENV)) {
            return Ok(key);
        }
    }
    Err(ConfigError::MissingApiKey { tried })
}

struct PrefixedVars<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
    prefix: &'a str,
}

impl PrefixedVars<'_> {
    fn own(&self, name: &str) -> Option<String> {
        non_empty((self.lookup)(&format!("{}{name}", self.prefix)))
    }

    /// Tunables fall back to the primary prefix so a fallback provider
    /// inherits budgets and timeouts unless it overrides them.
    fn shared(&self, name: &str) -> Option<(String, String)> {
        let own_key = format!("{}{name}", self.prefix);
        if let Some(value) = non_empty((self.lookup)(&own_key)) {
            return Some((own_key, value));
        }
        if self.prefix == ENV_PREFIX {
            return None;
        }
        let shared_key = format!("{ENV_PREFIX}{name}");
        non_empty((self.lookup)(&shared_key)).map(|value| (shared_key, value))
    }

    fn parse_number<T: FromStr>(&self, name: &str) -> Result<Option<T>, ConfigError> {
        let Some((key, value)) = self.shared(name) else {
            return Ok(None);
        };
        value
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key,
                value,
                expected: "a non-negative integer",
            })
    }

    fn parse_bool(&self, name: &str) -> Result<Option<bool>, ConfigError> {
        let Some((key, value)) = self.shared(name) else {
            return Ok(None);
        };
        match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue {
                key,
                value,
                expected: "a boolean",
            }),
        }
    }
}

fn process_env(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}
