//! OpenAI 兼容协议适配器
//!
//! 适用于 openai / ollama / custom 渠道。Ollama 通过其 `/v1` 兼容接口访问。

use super::adapter::join_url;
use super::{AuthInfo, AuthStrategy, ProviderAdapter};
use crate::proxy::types::ApiFormat;
use reqwest::RequestBuilder;

pub struct OpenAIAdapter;

impl ProviderAdapter for OpenAIAdapter {
    fn name(&self) -> &'static str {
        "OpenAI"
    }

    fn format(&self) -> ApiFormat {
        ApiFormat::OpenAI
    }

    fn extract_auth(&self, api_key: &str) -> Option<AuthInfo> {
        let key = api_key.trim();
        (!key.is_empty()).then(|| AuthInfo::new(key, AuthStrategy::Bearer))
    }

    fn build_chat_url(&self, base_url: &str, _model: &str, _is_stream: bool) -> String {
        join_url(base_url, "/v1/chat/completions")
    }

    fn models_url(&self, base_url: &str) -> String {
        join_url(base_url, "/v1/models")
    }

    fn add_auth_headers(&self, request: RequestBuilder, auth: &AuthInfo) -> RequestBuilder {
        request.header("Authorization", format!("Bearer {}", auth.api_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_url_with_and_without_version() {
        let adapter = OpenAIAdapter;
        assert_eq!(
            adapter.build_chat_url("https://api.openai.com/v1", "gpt-4", false),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            adapter.build_chat_url("http://localhost:11434/", "llama3", true),
            "http://localhost:11434/v1/chat/completions"
        );
    }

    #[test]
    fn test_empty_key_has_no_auth() {
        assert!(OpenAIAdapter.extract_auth("  ").is_none());
        let auth = OpenAIAdapter.extract_auth("sk-abc").unwrap();
        assert_eq!(auth.strategy, AuthStrategy::Bearer);
    }
}
