//! HTTP 渠道提供者
//!
//! 处理所有通过 HTTP 访问的上游（OpenAI 兼容 / Anthropic / Gemini）。

use super::sse::{self, SseData};
use super::{
    get_adapter, ChatOutput, ProviderAdapter, RawRequest, RawResponse, RequestExtras,
    StreamChunk,
};
use crate::config::ChannelConfig;
use crate::proxy::error::{from_reqwest, ProxyError};
use crate::proxy::log_codes::{fwd as log_fwd, rsp as log_rsp};
use crate::proxy::transform::{self, StreamTranslator};
use crate::proxy::types::ApiFormat;
use axum::http::HeaderMap;
use bytes::{Bytes, BytesMut};
use futures::stream::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// 可用性探测超时（秒）
const AVAILABILITY_TIMEOUT_SECS: u64 = 5;

/// Headers 黑名单 - 不透传到上游的 Headers
const HEADER_BLACKLIST: &[&str] = &[
    // 认证类（会被渠道凭证覆盖）
    "authorization",
    "x-api-key",
    "x-goog-api-key",
    "proxy-authorization",
    "cookie",
    // 连接类（由 HTTP 客户端管理）
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "upgrade",
    // 编码类（会被覆盖为 identity）
    "accept-encoding",
    // 代理转发类
    "x-forwarded-host",
    "x-forwarded-port",
    "x-forwarded-proto",
    "forwarded",
    // anthropic 特定头由适配器单独处理，避免重复
    "anthropic-version",
    "anthropic-beta",
];

pub struct HttpChannelProvider {
    channel: Arc<ChannelConfig>,
    client: Client,
    adapter: Box<dyn ProviderAdapter>,
}

impl HttpChannelProvider {
    pub fn new(channel: Arc<ChannelConfig>, client: Client) -> Self {
        let adapter = get_adapter(channel.channel_type.api_format());
        Self {
            channel,
            client,
            adapter,
        }
    }

    pub fn channel_type(&self) -> String {
        format!("http:{}", self.channel.channel_type)
    }

    /// 上游协议格式
    pub fn target_format(&self) -> ApiFormat {
        self.adapter.format()
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.channel.timeout.max(1))
    }

    /// GET 模型列表，5 秒内返回 2xx 即视为可用
    pub async fn is_available(&self) -> bool {
        let url = self.adapter.models_url(self.channel.base_url());
        let mut request = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(AVAILABILITY_TIMEOUT_SECS));
        if let Some(auth) = self.adapter.extract_auth(&self.channel.api_key) {
            request = self.adapter.add_auth_headers(request, &auth);
        }
        match request.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                log::debug!("[{}] 渠道 {} 可用性检查失败: {e}", self.adapter.name(), self.channel.name);
                false
            }
        }
    }

    /// 复制客户端请求头（排除黑名单），再注入渠道凭证与协议头
    fn apply_headers(
        &self,
        mut request: RequestBuilder,
        client_headers: &HeaderMap,
        credential: &str,
    ) -> RequestBuilder {
        for (key, value) in client_headers {
            if HEADER_BLACKLIST.contains(&key.as_str()) {
                continue;
            }
            request = request.header(key, value);
        }

        request = request.header("accept-encoding", "identity");

        match self.adapter.extract_auth(credential) {
            Some(auth) => {
                log::debug!(
                    "[{}] 使用认证: {:?} (key: {})",
                    self.adapter.name(),
                    auth.strategy,
                    auth.masked_key()
                );
                request = self.adapter.add_auth_headers(request, &auth);
            }
            None => {
                log::warn!(
                    "[{}] 渠道 {} 未配置 API Key",
                    self.adapter.name(),
                    self.channel.name
                );
            }
        }

        self.adapter.add_protocol_headers(request, client_headers)
    }

    /// 发送请求；连接失败时按渠道配置在同一渠道上退避重试
    async fn send(&self, request: RequestBuilder) -> Result<Response, ProxyError> {
        let mut attempt: u32 = 0;
        loop {
            let current = request
                .try_clone()
                .ok_or_else(|| ProxyError::Internal("请求体无法重放".to_string()))?;
            match current.send().await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_connect() && attempt < self.channel.max_retries => {
                    let backoff = self
                        .channel
                        .retry_backoff_ms
                        .saturating_mul(1u64 << attempt.min(16));
                    attempt += 1;
                    log::warn!(
                        "[{}] 渠道 {} 连接失败，{}ms 后第 {} 次重试: {}",
                        log_fwd::CONNECT_RETRY,
                        self.channel.name,
                        backoff,
                        attempt,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => {
                    log::error!("[{}] 请求失败: {}", self.adapter.name(), e);
                    return Err(from_reqwest(e));
                }
            }
        }
    }

    /// 非 2xx 响应转为上游错误（读取错误体）
    async fn check_status(&self, response: Response) -> Result<Response, ProxyError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.ok().filter(|b| !b.is_empty());
        log::warn!(
            "[{}] 渠道 {} 上游错误 ({}): {:?}",
            self.adapter.name(),
            self.channel.name,
            status.as_u16(),
            body
        );
        Err(ProxyError::UpstreamError {
            status: status.as_u16(),
            body,
        })
    }

    pub async fn chat_completion(
        &self,
        request: Value,
        credential: &str,
        source: ApiFormat,
        extras: &RequestExtras,
    ) -> Result<ChatOutput, ProxyError> {
        let target = self.target_format();
        let (upstream_body, model, transform_extras) =
            transform::transform_request(request, source, target)?;
        let is_stream = transform_extras.is_stream;

        let url = self
            .adapter
            .build_chat_url(self.channel.base_url(), &model, is_stream);
        let body = self.adapter.prepare_body(upstream_body);

        log::info!(
            "[{}] 转发请求: {} -> {} ({} → {}, stream: {})",
            self.adapter.name(),
            self.channel.name,
            url,
            source,
            target,
            is_stream
        );

        let mut request = self.client.post(&url);
        request = self.apply_headers(request, &extras.headers, credential);
        request = request.json(&body);

        if !is_stream {
            let response = self.send(request.timeout(self.timeout())).await?;
            let response = self.check_status(response).await?;
            let data: Value = response.json().await.map_err(|e| {
                ProxyError::ForwardFailed(format!("上游响应不是有效的 JSON: {e}"))
            })?;
            let converted = transform::transform_response(data, target, source, &model)?;
            return Ok(ChatOutput::Json(converted));
        }

        // 流式：只限制到拿到响应头为止，正文不设整体超时
        let response = tokio::time::timeout(self.timeout(), self.send(request))
            .await
            .map_err(|_| {
                ProxyError::Timeout(format!("渠道 {} 流式响应超时", self.channel.name))
            })??;
        let response = self.check_status(response).await?;
        let lines = sse::lines(response.bytes_stream());

        if source == target {
            return Ok(ChatOutput::Stream(Box::pin(passthrough(lines))));
        }

        let translator = StreamTranslator::new(target, source, &model);
        Ok(ChatOutput::Stream(Box::pin(translate(lines, translator))))
    }

    pub async fn forward_raw(
        &self,
        raw: &RawRequest,
        credential: &str,
    ) -> Result<RawResponse, ProxyError> {
        if !self.channel.channel_type.is_openai_compatible() {
            return Err(ProxyError::ConfigError(format!(
                "{} 不支持端点 {}",
                self.channel_type(),
                raw.endpoint.openai_path()
            )));
        }

        let mut url = self.adapter.build_url(
            self.channel.base_url(),
            &format!("/v1{}", raw.endpoint.openai_path()),
        );
        if let Some(query) = raw.query.as_deref().filter(|q| !q.is_empty()) {
            url = format!("{url}?{query}");
        }

        log::info!(
            "[{}] 透传 {} {} -> {}",
            self.adapter.name(),
            raw.method,
            self.channel.name,
            url
        );

        let mut request = self.client.request(raw.method.clone(), &url);
        request = self.apply_headers(request, &raw.headers, credential);
        request = request.body(raw.body.clone());

        let response = tokio::time::timeout(self.timeout(), self.send(request))
            .await
            .map_err(|_| ProxyError::Timeout(format!("渠道 {} 响应超时", self.channel.name)))??;
        let response = self.check_status(response).await?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ProxyError::StreamError(e.to_string())));

        Ok(RawResponse {
            status,
            content_type,
            body: Box::pin(body),
        })
    }
}

/// 同格式透传：逐行原样输出，`data: [DONE]` 由响应层统一追加
fn passthrough(
    lines: impl futures::Stream<Item = Result<Bytes, ProxyError>> + Send + 'static,
) -> impl futures::Stream<Item = Result<StreamChunk, ProxyError>> + Send {
    async_stream::stream! {
        tokio::pin!(lines);
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => {
                    if sse::is_done_line(&line) {
                        continue;
                    }
                    let mut framed = BytesMut::with_capacity(line.len() + 1);
                    framed.extend_from_slice(&line);
                    framed.extend_from_slice(b"\n");
                    yield Ok(StreamChunk::Raw(framed.freeze()));
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
    }
}

/// 跨格式转换：逐行解码 `data:`，转换后以 JSON 分片输出
fn translate(
    lines: impl futures::Stream<Item = Result<Bytes, ProxyError>> + Send + 'static,
    mut translator: StreamTranslator,
) -> impl futures::Stream<Item = Result<StreamChunk, ProxyError>> + Send {
    async_stream::stream! {
        tokio::pin!(lines);
        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            match sse::parse_data_line(&line) {
                Some(SseData::Json(value)) => {
                    for chunk in translator.translate(value) {
                        yield Ok(StreamChunk::Json(chunk));
                    }
                }
                Some(SseData::Invalid(data)) => {
                    log::debug!("[{}] 跳过无法解析的 SSE 数据: {}", log_rsp::DECODE_SKIPPED, data);
                }
                Some(SseData::Done) | None => {}
            }
        }
        for chunk in translator.finish() {
            yield Ok(StreamChunk::Json(chunk));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelType;
    use serde_json::json;

    fn line_stream(
        lines: Vec<&'static str>,
    ) -> impl futures::Stream<Item = Result<Bytes, ProxyError>> + Send + 'static {
        futures::stream::iter(
            lines
                .into_iter()
                .map(|l| Ok(Bytes::from_static(l.as_bytes()))),
        )
    }

    #[tokio::test]
    async fn test_passthrough_drops_done_keeps_bytes() {
        let out: Vec<_> = passthrough(line_stream(vec![
            "event: message_start",
            "data: {\"type\":\"message_start\"}",
            "",
            "data: [DONE]",
        ]))
        .collect()
        .await;
        let out: Vec<StreamChunk> = out.into_iter().map(|c| c.unwrap()).collect();
        assert_eq!(
            out,
            vec![
                StreamChunk::Raw(Bytes::from_static(b"event: message_start\n")),
                StreamChunk::Raw(Bytes::from_static(b"data: {\"type\":\"message_start\"}\n")),
                StreamChunk::Raw(Bytes::from_static(b"\n")),
            ]
        );
    }

    #[tokio::test]
    async fn test_translate_gemini_to_openai_synthesizes_terminal() {
        let translator = StreamTranslator::new(ApiFormat::Gemini, ApiFormat::OpenAI, "gemini-pro");
        let out: Vec<_> = translate(
            line_stream(vec![
                "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Hi\"}]}}]}",
                "",
                "data: not-json",
            ]),
            translator,
        )
        .collect()
        .await;
        let chunks: Vec<Value> = out
            .into_iter()
            .map(|c| match c.unwrap() {
                StreamChunk::Json(v) => v,
                StreamChunk::Raw(_) => panic!("unexpected raw chunk"),
            })
            .collect();

        assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
        let text: String = chunks
            .iter()
            .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
            .collect();
        assert_eq!(text, "Hi");
        let last = chunks.last().unwrap();
        assert_eq!(last["choices"][0]["finish_reason"], "stop");
    }

    #[tokio::test]
    async fn test_raw_forward_rejected_for_non_openai_channels() {
        let channel = Arc::new(ChannelConfig::new(
            1,
            "claude",
            ChannelType::Anthropic,
            "http://127.0.0.1:9",
        ));
        let provider = HttpChannelProvider::new(channel, Client::new());
        let raw = RawRequest {
            method: axum::http::Method::POST,
            endpoint: crate::proxy::types::EndpointKind::Embeddings,
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::from(json!({"input": "x"}).to_string()),
        };
        assert!(matches!(
            provider.forward_raw(&raw, "k").await,
            Err(ProxyError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_channel_is_unavailable() {
        let channel = Arc::new(ChannelConfig::new(
            1,
            "dead",
            ChannelType::Openai,
            "http://127.0.0.1:9",
        ));
        let provider = HttpChannelProvider::new(channel, Client::new());
        assert!(!provider.is_available().await);
    }
}
