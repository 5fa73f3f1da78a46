//! Claude (Anthropic) Provider Adapter
//!
//! - Header: `x-api-key` + `anthropic-version`
//! - `anthropic-version` / `anthropic-beta` 优先使用客户端传入的值

use super::adapter::join_url;
use super::{AuthInfo, AuthStrategy, ProviderAdapter};
use crate::proxy::types::ApiFormat;
use axum::http::HeaderMap;
use reqwest::RequestBuilder;

/// 默认的 Anthropic API 版本
pub const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

/// Claude 适配器
pub struct ClaudeAdapter;

impl ProviderAdapter for ClaudeAdapter {
    fn name(&self) -> &'static str {
        "Claude"
    }

    fn format(&self) -> ApiFormat {
        ApiFormat::Anthropic
    }

    fn extract_auth(&self, api_key: &str) -> Option<AuthInfo> {
        let key = api_key.trim();
        (!key.is_empty()).then(|| AuthInfo::new(key, AuthStrategy::Anthropic))
    }

    fn build_chat_url(&self, base_url: &str, _model: &str, _is_stream: bool) -> String {
        join_url(base_url, "/v1/messages")
    }

    fn models_url(&self, base_url: &str) -> String {
        join_url(base_url, "/v1/models")
    }

    fn add_auth_headers(&self, request: RequestBuilder, auth: &AuthInfo) -> RequestBuilder {
        match auth.strategy {
            AuthStrategy::Anthropic => request.header("x-api-key", &auth.api_key),
            AuthStrategy::Bearer => {
                request.header("Authorization", format!("Bearer {}", auth.api_key))
            }
            AuthStrategy::GoogleQuery => request,
        }
    }

    fn add_protocol_headers(
        &self,
        request: RequestBuilder,
        client_headers: &HeaderMap,
    ) -> RequestBuilder {
        // anthropic-version 只设置一次
        let version = client_headers
            .get("anthropic-version")
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_ANTHROPIC_VERSION);
        let request = request.header("anthropic-version", version);

        match client_headers
            .get("anthropic-beta")
            .and_then(|v| v.to_str().ok())
        {
            Some(beta) => request.header("anthropic-beta", beta),
            None => request,
        }
    }
}
