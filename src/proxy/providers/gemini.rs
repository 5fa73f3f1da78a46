//! Gemini (Google) Provider Adapter
//!
//! 模型与流式方式编码在 URL 中：
//! `{base}/v1beta/models/{model}:generateContent`
//! `{base}/v1beta/models/{model}:streamGenerateContent?alt=sse`
//! API Key 以查询参数 `key=` 传递。

use super::adapter::join_url;
use super::{AuthInfo, AuthStrategy, ProviderAdapter};
use crate::proxy::types::ApiFormat;
use reqwest::RequestBuilder;
use serde_json::Value;

/// Gemini 适配器
pub struct GeminiAdapter;

impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "Gemini"
    }

    fn format(&self) -> ApiFormat {
        ApiFormat::Gemini
    }

    fn extract_auth(&self, api_key: &str) -> Option<AuthInfo> {
        let key = api_key.trim();
        (!key.is_empty()).then(|| AuthInfo::new(key, AuthStrategy::GoogleQuery))
    }

    fn build_chat_url(&self, base_url: &str, model: &str, is_stream: bool) -> String {
        let model = model.strip_prefix("models/").unwrap_or(model);
        let method = if is_stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        join_url(base_url, &format!("/v1beta/models/{model}:{method}"))
    }

    fn models_url(&self, base_url: &str) -> String {
        join_url(base_url, "/v1beta/models")
    }

    fn add_auth_headers(&self, request: RequestBuilder, auth: &AuthInfo) -> RequestBuilder {
        match auth.strategy {
            AuthStrategy::GoogleQuery => request.query(&[("key", auth.api_key.as_str())]),
            AuthStrategy::Bearer => {
                request.header("Authorization", format!("Bearer {}", auth.api_key))
            }
            AuthStrategy::Anthropic => request.header("x-goog-api-key", &auth.api_key),
        }
    }

    /// `model` 与 `stream` 已编码在 URL 中，发送前移除
    fn prepare_body(&self, mut body: Value) -> Value {
        if let Some(obj) = body.as_object_mut() {
            obj.remove("model");
            obj.remove("stream");
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_chat_url() {
        let adapter = GeminiAdapter;
        assert_eq!(
            adapter.build_chat_url("https://generativelanguage.googleapis.com", "gemini-pro", false),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-pro:generateContent"
        );
        assert_eq!(
            adapter.build_chat_url("https://g.example.com/v1beta/", "models/gemini-pro", true),
            "https://g.example.com/v1beta/models/gemini-pro:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn test_prepare_body_strips_url_fields() {
        let body = json!({"model": "gemini-pro", "stream": true, "contents": []});
        let prepared = GeminiAdapter.prepare_body(body);
        assert!(prepared.get("model").is_none());
        assert!(prepared.get("stream").is_none());
        assert!(prepared.get("contents").is_some());
    }
}
