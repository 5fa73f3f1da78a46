//! 请求上下文模块
//!
//! 提供请求生命周期的上下文管理：凭证提取、计时、日志标签。

use crate::proxy::types::ApiFormat;
use axum::http::{HeaderMap, Uri};
use std::time::Instant;

/// 请求上下文
///
/// 贯穿整个请求生命周期，包含：
/// - 计时信息
/// - 调用方凭证（已从各 SDK 惯用的位置提取）
/// - 调用方格式与请求模型名称
/// - 日志标签
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// 请求开始时间
    pub start_time: Instant,
    /// 调用方提交的访问令牌
    pub credential: Option<String>,
    /// 调用方使用的协议格式
    pub source: ApiFormat,
    /// 请求中的模型名称
    pub request_model: String,
    /// 日志标签（如 "OpenAI"、"Claude"、"Gemini"）
    pub tag: &'static str,
}

impl RequestContext {
    pub fn new(headers: &HeaderMap, uri: &Uri, source: ApiFormat) -> Self {
        let tag = match source {
            ApiFormat::OpenAI => "OpenAI",
            ApiFormat::Anthropic => "Claude",
            ApiFormat::Gemini => "Gemini",
        };
        Self {
            start_time: Instant::now(),
            credential: extract_credential(headers, uri.query()),
            source,
            request_model: String::new(),
            tag,
        }
    }

    /// 从请求体提取模型名称
    pub fn with_model_from_body(mut self, body: &serde_json::Value) -> Self {
        self.request_model = body
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.request_model = model.into();
        self
    }

    /// 计算请求延迟（毫秒）
    #[inline]
    pub fn latency_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }
}

/// 提取调用方凭证
///
/// 依次查找 `Authorization: Bearer`、`x-api-key`、`x-goog-api-key` 与查询参数 `key`。
/// `Authorization` 不带 `Bearer ` 前缀时整体视为令牌。
pub fn extract_credential(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(auth) = header("authorization") {
        let token = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("bearer "))
            .unwrap_or(auth)
            .trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }

    if let Some(key) = header("x-api-key").or_else(|| header("x-goog-api-key")) {
        return Some(key.to_string());
    }

    query.and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(k, _)| k == "key")
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.is_empty())
    })
}

/// 去掉查询串中的 `key` 参数，避免把网关令牌转发给上游
pub fn strip_key_param(query: Option<&str>) -> Option<String> {
    let query = query?;
    let kept: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .filter(|(k, _)| k != "key")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        return None;
    }
    Some(
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(kept)
            .finish(),
    )
}
