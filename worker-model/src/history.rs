use memory_worker_config::ProviderConfig;
use memory_worker_protocol::ConversationMessage;
use tracing::warn;

/// Context budgets for one provider call. Zero disables a limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryLimits {
    pub max_messages: usize,
    pub max_tokens: u64,
}

impl From<&ProviderConfig> for HistoryLimits {
    fn from(config: &ProviderConfig) -> Self {
        Self {
            max_messages: config.max_context_messages,
            max_tokens: config.max_tokens,
        }
    }
}

/// Rough token count: four characters per token, rounded up.
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    chars.div_ceil(4)
}

/// Returns the newest suffix of `history` that fits both limits and starts
/// with a user message. When nothing fits, the latest user message alone is
/// returned even if it exceeds the token budget.
pub fn truncate_history(
    history: &[ConversationMessage],
    limits: HistoryLimits,
) -> &[ConversationMessage] {
    if limits.max_messages == 0 && limits.max_tokens == 0 {
        return history;
    }

    let total_tokens = history
        .iter()
        .map(|message| estimate_tokens(&message.content))
        .sum::<u64>();
    let fits_messages = limits.max_messages == 0 || history.len() <= limits.max_messages;
    let fits_tokens = limits.max_tokens == 0 || total_tokens <= limits.max_tokens;
    if fits_messages && fits_tokens {
        return history;
    }

    let mut start = history.len();
    let mut kept_tokens = 0_u64;
    for (index, message) in history.iter().enumerate().rev() {
        let tokens = estimate_tokens(&message.content);
        let kept = history.len() - index;
        if limits.max_messages > 0 && kept > limits.max_messages {
            break;
        }
        if limits.max_tokens > 0 && kept_tokens + tokens > limits.max_tokens {
            break;
        }
        kept_tokens += tokens;
        start = index;
    }

    let window = &history[start..];
    match window.iter().position(ConversationMessage::is_user) {
        Some(first_user) => &window[first_user..],
        None => latest_user_message(history),
    }
}

fn latest_user_message(history: &[ConversationMessage]) -> &[ConversationMessage] {
    match history.iter().rposition(ConversationMessage::is_user) {
        Some(index) => std::slice::from_ref(&history[index]),
        None => {
            warn!(
                messages = history.len(),
                "history has no user message, nothing to send"
            );
            &[]
        }
    }
}
