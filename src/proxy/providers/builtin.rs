//! 内置渠道提供者
//!
//! 内置客户端在进程内实现对话能力，统一返回 OpenAI 形状的结果；
//! 本模块负责把调用方格式转换为 OpenAI 消息，再把结果转换回调用方格式。

use super::{ChatOutput, RequestExtras, StreamChunk};
use crate::config::ChannelConfig;
use crate::proxy::error::ProxyError;
use crate::proxy::transform::{self, common::unix_timestamp, StreamTranslator};
use crate::proxy::types::ApiFormat;
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

pub type BuiltinChunkStream = Pin<Box<dyn Stream<Item = Result<Value, ProxyError>> + Send>>;

/// 内置客户端的返回值
pub enum BuiltinReply {
    /// 完整响应（OpenAI chat.completion 形状）
    Response(Value),
    /// 流式分片（OpenAI chat.completion.chunk 形状，或纯文本字符串）
    Stream(BuiltinChunkStream),
}

/// 内置对话客户端
///
/// 负责自身的凭证刷新与会话管理。
#[async_trait]
pub trait BuiltinClient: Send + Sync {
    /// 客户端名称，如 `glm`
    fn name(&self) -> &str;

    async fn chat_completion(
        &self,
        messages: Vec<Value>,
        model: &str,
        stream: bool,
        credential: &str,
    ) -> Result<BuiltinReply, ProxyError>;

    /// 默认：配置了凭证即视为可用
    async fn is_available(&self, credential: &str) -> bool {
        !credential.trim().is_empty()
    }
}

/// 内置客户端注册表（名称不区分大小写）
#[derive(Clone, Default)]
pub struct BuiltinRegistry {
    clients: HashMap<String, Arc<dyn BuiltinClient>>,
}

impl BuiltinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, client: Arc<dyn BuiltinClient>) {
        let name = client.name().to_lowercase();
        log::debug!("[Builtin] 注册内置客户端: {name}");
        self.clients.insert(name, client);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BuiltinClient>> {
        self.clients.get(&name.to_lowercase()).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.keys().cloned().collect();
        names.sort();
        names
    }
}

pub struct BuiltinChannelProvider {
    channel: Arc<ChannelConfig>,
    client: Arc<dyn BuiltinClient>,
}

impl BuiltinChannelProvider {
    pub fn new(channel: Arc<ChannelConfig>, client: Arc<dyn BuiltinClient>) -> Self {
        Self { channel, client }
    }

    pub fn channel_type(&self) -> String {
        format!("builtin:{}", self.client.name())
    }

    pub async fn is_available(&self) -> bool {
        self.client.is_available(&self.channel.api_key).await
    }

    pub async fn chat_completion(
        &self,
        request: Value,
        credential: &str,
        source: ApiFormat,
        _extras: &RequestExtras,
    ) -> Result<ChatOutput, ProxyError> {
        let (openai_body, model, extras) =
            transform::transform_request(request, source, ApiFormat::OpenAI)?;
        let messages = openai_body
            .get("messages")
            .and_then(|m| m.as_array())
            .cloned()
            .unwrap_or_default();

        log::info!(
            "[Builtin] 调用 {} (渠道: {}, model: {}, stream: {})",
            self.client.name(),
            self.channel.name,
            model,
            extras.is_stream
        );

        let reply = self
            .client
            .chat_completion(messages, &model, extras.is_stream, credential)
            .await?;

        match reply {
            BuiltinReply::Response(value) => {
                let normalized = normalize_response(value, &model);
                let converted =
                    transform::transform_response(normalized, ApiFormat::OpenAI, source, &model)?;
                Ok(ChatOutput::Json(converted))
            }
            BuiltinReply::Stream(chunks) => {
                let translator = StreamTranslator::new(ApiFormat::OpenAI, source, &model);
                Ok(ChatOutput::Stream(Box::pin(translate_chunks(
                    chunks, translator, model,
                ))))
            }
        }
    }
}

/// 非对象的完整响应包装为 chat.completion
fn normalize_response(value: Value, model: &str) -> Value {
    if value.is_object() {
        return value;
    }
    let text = match value {
        Value::String(s) => s,
        other => other.to_string(),
    };
    json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        "object": "chat.completion",
        "created": unix_timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop",
        }],
    })
}

/// 非对象的流式分片包装为 chat.completion.chunk
fn normalize_chunk(value: Value, model: &str) -> Value {
    if value.is_object() {
        return value;
    }
    let text = match value {
        Value::String(s) => s,
        other => other.to_string(),
    };
    json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        "object": "chat.completion.chunk",
        "created": unix_timestamp(),
        "model": model,
        "choices": [{"index": 0, "delta": {"content": text}, "finish_reason": null}],
    })
}

fn translate_chunks(
    chunks: BuiltinChunkStream,
    mut translator: StreamTranslator,
    model: String,
) -> impl Stream<Item = Result<StreamChunk, ProxyError>> + Send {
    async_stream::stream! {
        let mut chunks = chunks;
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(value) => {
                    for out in translator.translate(normalize_chunk(value, &model)) {
                        yield Ok(StreamChunk::Json(out));
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
        for out in translator.finish() {
            yield Ok(StreamChunk::Json(out));
        }
    }
}
