//! Channel Providers Module
//!
//! 渠道提供者：把一次请求送到具体的上游，并以调用方格式返回结果。
//!
//! ## 模块结构
//! - `adapter`: 定义 `ProviderAdapter` trait
//! - `auth`: 认证类型和策略
//! - `openai` / `claude` / `gemini`: 三种上游协议的适配器
//! - `http`: 通过 HTTP 访问的渠道
//! - `builtin`: 进程内注册的内置客户端
//! - `sse`: SSE 行解码与帧编码

mod adapter;
mod auth;
mod builtin;
mod claude;
mod gemini;
mod http;
mod openai;
pub mod sse;

use crate::config::{ChannelConfig, ChannelType};
use crate::proxy::error::ProxyError;
use crate::proxy::http_client::ClientPool;
use crate::proxy::types::{ApiFormat, EndpointKind};
use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use futures::stream::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;

// 公开导出
pub use adapter::{join_url, ProviderAdapter};
pub use auth::{mask_secret, AuthInfo, AuthStrategy};
pub use builtin::{
    BuiltinChannelProvider, BuiltinChunkStream, BuiltinClient, BuiltinRegistry, BuiltinReply,
};
pub use claude::ClaudeAdapter;
pub use gemini::GeminiAdapter;
pub use http::HttpChannelProvider;
pub use openai::OpenAIAdapter;

/// 调用方格式的流式分片
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// 已转换的 JSON 分片，由响应层编码为 SSE 帧
    Json(Value),
    /// 同格式透传的原始 SSE 行（含换行符）
    Raw(Bytes),
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProxyError>> + Send>>;
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProxyError>> + Send>>;

/// 对话请求的结果（已是调用方格式）
pub enum ChatOutput {
    Json(Value),
    Stream(ChunkStream),
}

impl ChatOutput {
    pub fn is_stream(&self) -> bool {
        matches!(self, ChatOutput::Stream(_))
    }
}

impl std::fmt::Debug for ChatOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatOutput::Json(v) => f.debug_tuple("Json").field(v).finish(),
            ChatOutput::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// 请求附加信息
#[derive(Debug, Clone, Default)]
pub struct RequestExtras {
    /// 客户端原始请求头
    pub headers: HeaderMap,
}

/// 非对话端点的原样转发请求
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub method: Method,
    pub endpoint: EndpointKind,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// 原样转发的上游响应
pub struct RawResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: ByteStream,
}

/// 根据上游协议获取适配器
pub fn get_adapter(format: ApiFormat) -> Box<dyn ProviderAdapter> {
    match format {
        ApiFormat::OpenAI => Box::new(OpenAIAdapter),
        ApiFormat::Anthropic => Box::new(ClaudeAdapter),
        ApiFormat::Gemini => Box::new(GeminiAdapter),
    }
}

/// 渠道提供者（封闭的变体集合）
pub enum ChannelProvider {
    Http(HttpChannelProvider),
    Builtin(BuiltinChannelProvider),
}

impl ChannelProvider {
    /// 由渠道配置构建，完全由配置决定变体
    pub fn from_channel(
        channel: Arc<ChannelConfig>,
        clients: &ClientPool,
        builtins: &BuiltinRegistry,
    ) -> Result<Self, ProxyError> {
        match channel.channel_type {
            ChannelType::Builtin => {
                let name = channel.builtin_provider.as_deref().unwrap_or_default();
                let client = builtins.get(name).ok_or_else(|| {
                    ProxyError::ConfigError(format!(
                        "渠道 {} 的内置客户端 '{}' 未注册",
                        channel.name, name
                    ))
                })?;
                Ok(ChannelProvider::Builtin(BuiltinChannelProvider::new(
                    channel, client,
                )))
            }
            _ => {
                let client = clients.get(channel.proxy_url.as_deref())?;
                Ok(ChannelProvider::Http(HttpChannelProvider::new(
                    channel, client,
                )))
            }
        }
    }

    /// 类型标识，如 `http:openai`、`builtin:glm`
    pub fn channel_type(&self) -> String {
        match self {
            ChannelProvider::Http(p) => p.channel_type(),
            ChannelProvider::Builtin(p) => p.channel_type(),
        }
    }

    /// 尽力而为的可用性检查，从不返回错误
    pub async fn is_available(&self) -> bool {
        match self {
            ChannelProvider::Http(p) => p.is_available().await,
            ChannelProvider::Builtin(p) => p.is_available().await,
        }
    }

    /// 对话补全；`request` 为 `source` 格式，返回结果同样为 `source` 格式
    pub async fn chat_completion(
        &self,
        request: Value,
        credential: &str,
        source: ApiFormat,
        extras: &RequestExtras,
    ) -> Result<ChatOutput, ProxyError> {
        match self {
            ChannelProvider::Http(p) => p.chat_completion(request, credential, source, extras).await,
            ChannelProvider::Builtin(p) => {
                p.chat_completion(request, credential, source, extras).await
            }
        }
    }

    /// 非对话端点原样转发，仅 OpenAI 兼容的 HTTP 渠道支持
    pub async fn forward_raw(
        &self,
        request: &RawRequest,
        credential: &str,
    ) -> Result<RawResponse, ProxyError> {
        match self {
            ChannelProvider::Http(p) => p.forward_raw(request, credential).await,
            ChannelProvider::Builtin(p) => Err(ProxyError::ConfigError(format!(
                "{} 不支持端点 {}",
                p.channel_type(),
                request.endpoint.openai_path()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_variant_follows_channel_type() {
        let clients = ClientPool::new().unwrap();
        let builtins = BuiltinRegistry::new();

        let http = Arc::new(ChannelConfig::new(
            1,
            "ollama",
            ChannelType::Ollama,
            "http://localhost:11434",
        ));
        let provider = ChannelProvider::from_channel(http, &clients, &builtins).unwrap();
        assert_eq!(provider.channel_type(), "http:ollama");

        let mut builtin = ChannelConfig::new(2, "glm", ChannelType::Builtin, "");
        builtin.builtin_provider = Some("glm".to_string());
        let result = ChannelProvider::from_channel(Arc::new(builtin), &clients, &builtins);
        assert!(matches!(result, Err(ProxyError::ConfigError(_))));
    }

    #[test]
    fn test_get_adapter() {
        assert_eq!(get_adapter(ApiFormat::OpenAI).name(), "OpenAI");
        assert_eq!(get_adapter(ApiFormat::Anthropic).format(), ApiFormat::Anthropic);
        assert_eq!(get_adapter(ApiFormat::Gemini).name(), "Gemini");
    }
}
