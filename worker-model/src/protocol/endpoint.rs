//! Endpoint construction. Every builder is idempotent: feeding a URL it
//! produced back in yields the same URL.

const OPENAI_CHAT_PATH: &str = "/chat/completions";
const GEMINI_API_VERSION: &str = "/v1beta";

pub fn build_openai_chat_url(base_url: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    if base.ends_with(OPENAI_CHAT_PATH) {
        return base.to_string();
    }
    if base.ends_with("/v1") {
        return format!("{base}{OPENAI_CHAT_PATH}");
    }
    format!("{base}/v1{OPENAI_CHAT_PATH}")
}

/// Accepts a bare host, `/v1beta`, `/v1beta/models`, or a full endpoint.
pub fn build_gemini_url(base_url: &str, model: &str, streaming: bool) -> String {
    let without_query = base_url
        .trim()
        .split('?')
        .next()
        .unwrap_or_default()
        .trim_end_matches('/');
    let root = match without_query.find(GEMINI_API_VERSION) {
        Some(index) => &without_query[..index],
        None => without_query,
    };
    let method = if streaming {
        "streamGenerateContent"
    } else {
        "generateContent"
    };
    let mut url = format!("{root}{GEMINI_API_VERSION}/models/{model}:{method}");
    if streaming {
        url.push_str("?alt=sse");
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_url_accepts_host_v1_and_full_endpoint() {
        let expected = "https://api.example.com/v1/chat/completions";
        for base in [
            "https://api.example.com",
            "https://api.example.com/",
            "https://api.example.com/v1",
            "https://api.example.com/v1/",
            expected,
        ] {
            assert_eq!(build_openai_chat_url(base), expected, "base: {base}");
        }
        assert_eq!(build_openai_chat_url(expected), build_openai_chat_url(&build_openai_chat_url(expected)));
        assert_eq!(
            build_openai_chat_url("https://openrouter.ai/api/v1"),
            "https://openrouter.ai/api/v1/chat/completions"
        );
    }

    #[test]
    fn gemini_url_is_idempotent_for_every_base_shape() {
        let host = "https://generativelanguage.googleapis.com";
        for streaming in [false, true] {
            let expected = build_gemini_url(host, "gemini-2.5-flash", streaming);
            for base in [
                host.to_string(),
                format!("{host}/"),
                format!("{host}/v1beta"),
                format!("{host}/v1beta/models"),
                format!("{host}/v1beta/models/"),
                expected.clone(),
            ] {
                assert_eq!(
                    build_gemini_url(&base, "gemini-2.5-flash", streaming),
                    expected,
                    "base: {base}"
                );
            }
        }
    }

    #[test]
    fn gemini_url_only_streams_with_alt_sse() {
        let host = "https://generativelanguage.googleapis.com";
        assert_eq!(
            build_gemini_url(host, "m", false),
            format!("{host}/v1beta/models/m:generateContent")
        );
        assert_eq!(
            build_gemini_url(host, "m", true),
            format!("{host}/v1beta/models/m:streamGenerateContent?alt=sse")
        );
        let streamed = build_gemini_url(host, "m", true);
        assert_eq!(
            build_gemini_url(&streamed, "m", false),
            format!("{host}/v1beta/models/m:generateContent")
        );
    }
}
