//! Provider Adapter Trait
//!
//! 定义上游协议适配器的统一接口：URL 构建、认证注入与请求体整理。

use super::auth::AuthInfo;
use crate::proxy::types::ApiFormat;
use axum::http::HeaderMap;
use reqwest::RequestBuilder;
use serde_json::Value;

/// 上游协议适配器
///
/// 每种上游协议（OpenAI 兼容 / Anthropic / Gemini）一个实现。
pub trait ProviderAdapter: Send + Sync {
    /// 适配器名称（用于日志）
    fn name(&self) -> &'static str;

    /// 上游协议格式
    fn format(&self) -> ApiFormat;

    /// 由渠道凭证构建认证信息；凭证为空时返回 None
    fn extract_auth(&self, api_key: &str) -> Option<AuthInfo>;

    /// 构建对话请求 URL
    fn build_chat_url(&self, base_url: &str, model: &str, is_stream: bool) -> String;

    /// 构建任意相对路径的 URL（用于非对话端点透传）
    fn build_url(&self, base_url: &str, endpoint: &str) -> String {
        join_url(base_url, endpoint)
    }

    /// 可用性探测地址
    fn models_url(&self, base_url: &str) -> String;

    /// 注入认证信息
    fn add_auth_headers(&self, request: RequestBuilder, auth: &AuthInfo) -> RequestBuilder;

    /// 协议相关的附加请求头（可参考客户端原始请求头）
    fn add_protocol_headers(
        &self,
        request: RequestBuilder,
        _client_headers: &HeaderMap,
    ) -> RequestBuilder {
        request
    }

    /// 发送前整理请求体，默认原样返回
    fn prepare_body(&self, body: Value) -> Value {
        body
    }
}

/// 拼接 base_url 与端点，并去掉重复的版本前缀
pub fn join_url(base_url: &str, endpoint: &str) -> String {
    let base_trimmed = base_url.trim_end_matches('/');
    let endpoint_trimmed = endpoint.trim_start_matches('/');

    let mut url = format!("{base_trimmed}/{endpoint_trimmed}");
    for pattern in ["/v1beta", "/v1"] {
        let duplicate = format!("{pattern}{pattern}");
        if url.contains(&duplicate) {
            url = url.replace(&duplicate, pattern);
        }
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url_dedups_version() {
        assert_eq!(
            join_url("https://api.openai.com/v1/", "/v1/chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            join_url("https://example.com/v1beta", "/v1beta/models/x:generateContent"),
            "https://example.com/v1beta/models/x:generateContent"
        );
        assert_eq!(
            join_url("http://localhost:11434", "v1/embeddings"),
            "http://localhost:11434/v1/embeddings"
        );
    }
}
