//! 代理引擎
//!
//! 一次请求的完整流程：鉴权 → 路由 → 选择渠道 → 转发 → 故障转移 → 响应。
//! 每个并发槽位只归还一次：非流式请求在返回前归还，流式请求由 [`CompletionGuard`]
//! 在流结束或被丢弃时记录结果并归还。

use super::{
    error::{ErrorCategory, ProxyError},
    error_mapper::{get_error_message, map_proxy_error_to_status},
    handler_context::RequestContext,
    http_client::ClientPool,
    limiter::{AdaptiveLimiter, LimiterPermit, LimiterStats, RateLimiterManager},
    log_codes::fwd as log_fwd,
    provider_router::{resolve_candidates, Candidate, ChannelRouter, Selected},
    providers::{
        BuiltinRegistry, ChannelProvider, ChatOutput, RawRequest, RawResponse, RequestExtras,
    },
    types::ProxyStatus,
};
use crate::config::{AppConfig, ChannelConfig, TokenConfig};
use axum::http::HeaderMap;
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

pub type SharedStatus = Arc<RwLock<ProxyStatus>>;

fn update_status(status: &SharedStatus, f: impl FnOnce(&mut ProxyStatus)) {
    match status.write() {
        Ok(mut guard) => f(&mut guard),
        Err(e) => f(&mut e.into_inner()),
    }
}

/// `/status` 返回的完整快照
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    #[serde(flatten)]
    pub status: ProxyStatus,
    pub channels: usize,
    pub high_availability_mode: bool,
    pub limiters: Vec<LimiterStats>,
}

/// 请求结果记账
///
/// Drop 时向限制器写入一条记录、归还槽位，并更新全局状态计数。
pub struct CompletionGuard {
    limiter: Arc<AdaptiveLimiter>,
    permit: Option<LimiterPermit>,
    start: Instant,
    channel: Arc<ChannelConfig>,
    status: SharedStatus,
    failure: Option<(u16, String)>,
}

impl CompletionGuard {
    fn new(selected: Selected, start: Instant, status: SharedStatus) -> Self {
        Self {
            limiter: selected.limiter,
            permit: Some(selected.permit),
            start,
            channel: selected.channel,
            status,
            failure: None,
        }
    }

    /// 标记本次请求失败（流中途出错）
    pub fn fail(&mut self, error: &ProxyError) {
        if self.failure.is_none() {
            self.failure = Some((map_proxy_error_to_status(error), get_error_message(error)));
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed().as_secs_f64();
        let (is_error, code) = match &self.failure {
            Some((code, _)) => (true, *code),
            None => (false, 200),
        };
        self.limiter.record_request(elapsed, is_error, code);
        if let Some(permit) = self.permit.take() {
            permit.release();
        }

        let failure = self.failure.take();
        update_status(&self.status, |s| {
            s.record_result(!is_error);
            if let Some((_, message)) = failure {
                s.last_error = Some(format!("渠道 {} 流式响应中断: {}", self.channel.name, message));
            }
        });

        log::debug!(
            "[Engine] 渠道 {} 请求结束 ({:.3}s, error: {})",
            self.channel.name,
            elapsed,
            is_error
        );
    }
}

/// 给流挂上记账守卫；流结束或被丢弃时守卫随之释放
fn guard_stream<T>(
    stream: Pin<Box<dyn Stream<Item = Result<T, ProxyError>> + Send>>,
    mut guard: CompletionGuard,
) -> Pin<Box<dyn Stream<Item = Result<T, ProxyError>> + Send>>
where
    T: Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut stream = stream;
        while let Some(item) = stream.next().await {
            if let Err(e) = &item {
                guard.fail(e);
            }
            yield item;
        }
        drop(guard);
    })
}

enum AttemptFailure {
    /// 可重试：排除当前渠道后继续
    Retry(ProxyError),
    /// 终止故障转移，直接返回给调用方
    Abort(ProxyError),
}

/// 代理引擎
///
/// 由配置快照构建；重载配置时整体替换，限制器与状态计数沿用，HTTP 客户端重新构建。
pub struct ProxyEngine {
    config: Arc<AppConfig>,
    /// 已启用且成功构建提供者的渠道，按优先级排序
    channels: Vec<Arc<ChannelConfig>>,
    providers: HashMap<u32, Arc<ChannelProvider>>,
    clients: Arc<ClientPool>,
    builtins: BuiltinRegistry,
    limiters: Arc<RateLimiterManager>,
    router: ChannelRouter,
    status: SharedStatus,
}

impl ProxyEngine {
    pub fn new(config: AppConfig, builtins: BuiltinRegistry) -> Result<Self, ProxyError> {
        let clients = Arc::new(ClientPool::new()?);
        Ok(Self::build(
            config,
            builtins,
            clients,
            Arc::new(RateLimiterManager::new()),
            Arc::new(RwLock::new(ProxyStatus::default())),
        ))
    }

    /// 以新配置构建引擎，沿用限制器与状态计数
    ///
    /// 客户端池随新配置重建，已移除的出口代理不再保留连接。
    pub fn reload(&self, config: AppConfig) -> Result<Self, ProxyError> {
        let engine = Self::build(
            config,
            self.builtins.clone(),
            Arc::new(ClientPool::new()?),
            self.limiters.clone(),
            self.status.clone(),
        );
        let ids: HashSet<u32> = engine.channels.iter().map(|c| c.id).collect();
        self.limiters.retain(&ids);
        Ok(engine)
    }

    fn build(
        config: AppConfig,
        builtins: BuiltinRegistry,
        clients: Arc<ClientPool>,
        limiters: Arc<RateLimiterManager>,
        status: SharedStatus,
    ) -> Self {
        let mut channels = Vec::new();
        let mut providers = HashMap::new();

        for channel in config.enabled_channels() {
            let channel = Arc::new(channel.clone());
            match ChannelProvider::from_channel(channel.clone(), &clients, &builtins) {
                Ok(provider) => {
                    limiters.get_or_create(&channel);
                    log::debug!(
                        "[Engine] 渠道 {} ({}) 已就绪",
                        channel.name,
                        provider.channel_type()
                    );
                    providers.insert(channel.id, Arc::new(provider));
                    channels.push(channel);
                }
                Err(e) => log::warn!("[Engine] 渠道 {} 已跳过: {e}", channel.name),
            }
        }

        let router = ChannelRouter::new(
            limiters.clone(),
            Duration::from_secs(config.settings.default_timeout.max(1)),
        );

        Self {
            config: Arc::new(config),
            channels,
            providers,
            clients,
            builtins,
            limiters,
            router,
            status,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn channels(&self) -> &[Arc<ChannelConfig>] {
        &self.channels
    }

    pub fn clients(&self) -> &Arc<ClientPool> {
        &self.clients
    }

    pub fn limiters(&self) -> &Arc<RateLimiterManager> {
        &self.limiters
    }

    pub fn status_handle(&self) -> SharedStatus {
        self.status.clone()
    }

    /// 校验调用方令牌
    ///
    /// 未开启鉴权时返回 `None`（不做任何令牌限制）。
    pub fn authenticate(&self, credential: Option<&str>) -> Result<Option<&TokenConfig>, ProxyError> {
        if !self.config.settings.require_auth {
            return Ok(None);
        }
        let Some(key) = credential.filter(|k| !k.is_empty()) else {
            return Err(ProxyError::AuthError("缺少访问令牌".to_string()));
        };
        match self.config.validate_token(key) {
            Some(token) => Ok(Some(token)),
            None => Err(ProxyError::AuthError("令牌无效或已禁用".to_string())),
        }
    }

    fn route(&self, model: &str, token: Option<&TokenConfig>) -> Result<Vec<Candidate>, ProxyError> {
        resolve_candidates(
            &self.channels,
            model,
            token,
            self.config.settings.high_availability_mode,
        )
    }

    fn provider(&self, channel_id: u32) -> Result<Arc<ChannelProvider>, ProxyError> {
        self.providers
            .get(&channel_id)
            .cloned()
            .ok_or_else(|| ProxyError::Internal(format!("渠道 {channel_id} 没有对应的提供者")))
    }

    fn record_failure(&self, error: &ProxyError) {
        let message = get_error_message(error);
        update_status(&self.status, |s| {
            s.record_result(false);
            s.last_error = Some(message);
        });
    }

    fn mark_selected(&self, channel: &ChannelConfig, attempt: usize) {
        update_status(&self.status, |s| {
            s.current_channel = Some(channel.name.clone());
            s.current_channel_id = Some(channel.id);
            if attempt > 1 {
                s.failover_count += 1;
            }
        });
    }

    /// 对话补全
    ///
    /// `body` 为调用方格式（`ctx.source`），返回结果同样为调用方格式。
    pub async fn chat(
        &self,
        ctx: &RequestContext,
        body: Value,
        headers: HeaderMap,
    ) -> Result<ChatOutput, ProxyError> {
        let result = self.chat_inner(ctx, body, headers).await;
        if let Err(e) = &result {
            self.record_failure(e);
        }
        result
    }

    async fn chat_inner(
        &self,
        ctx: &RequestContext,
        body: Value,
        headers: HeaderMap,
    ) -> Result<ChatOutput, ProxyError> {
        let token = self.authenticate(ctx.credential.as_deref())?;
        let candidates = self.route(&ctx.request_model, token)?;
        let extras = RequestExtras { headers };

        log::info!(
            "[{}] model: {}, 候选渠道: {}",
            ctx.tag,
            ctx.request_model,
            candidates.len()
        );

        let fallback = self.config.settings.enable_fallback;
        let mut excluded = HashSet::new();
        let mut last_error: Option<ProxyError> = None;
        let mut attempt = 0usize;

        loop {
            let selected = match self.router.select(&candidates, &excluded).await {
                Ok(selected) => selected,
                Err(e) => return Err(self.exhausted(ctx, last_error, e, attempt)),
            };
            attempt += 1;

            let channel = selected.channel.clone();
            let provider = self.provider(channel.id)?;
            let request = with_model(body.clone(), &selected.model);
            let start = Instant::now();

            log::info!(
                "[{}] 尝试 {} - 渠道: {} ({}), model: {}",
                ctx.tag,
                attempt,
                channel.name,
                provider.channel_type(),
                selected.model
            );

            match provider
                .chat_completion(request, &channel.api_key, ctx.source, &extras)
                .await
            {
                Ok(ChatOutput::Json(value)) => {
                    selected
                        .limiter
                        .record_request(start.elapsed().as_secs_f64(), false, 200);
                    selected.permit.release();
                    self.mark_selected(&channel, attempt);
                    update_status(&self.status, |s| {
                        s.record_result(true);
                        s.last_error = None;
                    });
                    log::info!(
                        "[{}] 请求成功 - 渠道: {} - {}ms",
                        ctx.tag,
                        channel.name,
                        ctx.latency_ms()
                    );
                    return Ok(ChatOutput::Json(value));
                }
                Ok(ChatOutput::Stream(stream)) => {
                    self.mark_selected(&channel, attempt);
                    log::info!(
                        "[{}] 流式响应开始 - 渠道: {} - {}ms",
                        ctx.tag,
                        channel.name,
                        ctx.latency_ms()
                    );
                    let guard = CompletionGuard::new(selected, start, self.status.clone());
                    return Ok(ChatOutput::Stream(guard_stream(stream, guard)));
                }
                Err(e) => match self.handle_attempt_error(ctx, selected, start, e, fallback) {
                    AttemptFailure::Abort(e) => return Err(e),
                    AttemptFailure::Retry(e) => {
                        excluded.insert(channel.id);
                        last_error = Some(e);
                    }
                },
            }
        }
    }

    /// 非对话端点原样转发
    pub async fn forward_raw(
        &self,
        ctx: &RequestContext,
        request: RawRequest,
    ) -> Result<RawResponse, ProxyError> {
        let result = self.forward_raw_inner(ctx, request).await;
        if let Err(e) = &result {
            self.record_failure(e);
        }
        result
    }

    async fn forward_raw_inner(
        &self,
        ctx: &RequestContext,
        request: RawRequest,
    ) -> Result<RawResponse, ProxyError> {
        let token = self.authenticate(ctx.credential.as_deref())?;
        let candidates = self.route(&ctx.request_model, token)?;
        let parsed_body: Option<Value> = serde_json::from_slice(&request.body)
            .ok()
            .filter(Value::is_object);

        let fallback = self.config.settings.enable_fallback;
        let mut excluded = HashSet::new();
        let mut last_error: Option<ProxyError> = None;
        let mut attempt = 0usize;

        loop {
            let selected = match self.router.select(&candidates, &excluded).await {
                Ok(selected) => selected,
                Err(e) => return Err(self.exhausted(ctx, last_error, e, attempt)),
            };
            attempt += 1;

            let channel = selected.channel.clone();
            let provider = self.provider(channel.id)?;

            let mut outgoing = request.clone();
            if let Some(body) = &parsed_body {
                let current = body.get("model").and_then(|m| m.as_str());
                if current.is_some_and(|m| m != selected.model) {
                    let rewritten = with_model(body.clone(), &selected.model);
                    outgoing.body = serde_json::to_vec(&rewritten)
                        .map_err(|e| ProxyError::Internal(format!("序列化请求体失败: {e}")))?
                        .into();
                }
            }

            let start = Instant::now();
            log::info!(
                "[{}] 尝试 {} - 透传 {} 到渠道 {}",
                ctx.tag,
                attempt,
                request.endpoint.openai_path(),
                channel.name
            );

            match provider.forward_raw(&outgoing, &channel.api_key).await {
                Ok(response) => {
                    self.mark_selected(&channel, attempt);
                    let guard = CompletionGuard::new(selected, start, self.status.clone());
                    return Ok(RawResponse {
                        status: response.status,
                        content_type: response.content_type,
                        body: guard_stream(response.body, guard),
                    });
                }
                Err(e) => match self.handle_attempt_error(ctx, selected, start, e, fallback) {
                    AttemptFailure::Abort(e) => return Err(e),
                    AttemptFailure::Retry(e) => {
                        excluded.insert(channel.id);
                        last_error = Some(e);
                    }
                },
            }
        }
    }

    /// 处理一次失败的尝试：记录结果、归还槽位，并决定是否继续故障转移
    fn handle_attempt_error(
        &self,
        ctx: &RequestContext,
        selected: Selected,
        start: Instant,
        error: ProxyError,
        fallback: bool,
    ) -> AttemptFailure {
        let Selected {
            channel,
            limiter,
            permit,
            ..
        } = selected;

        let category = error.category();

        // 调用方请求有误，或渠道不支持该端点时，请求未到达上游，不计入渠道统计
        let reached_upstream = category != ErrorCategory::ClientError
            && !matches!(error, ProxyError::ConfigError(_));
        if reached_upstream {
            limiter.record_request(
                start.elapsed().as_secs_f64(),
                true,
                map_proxy_error_to_status(&error),
            );
        }
        permit.release();

        match category {
            ErrorCategory::ClientError => {
                log::warn!(
                    "[{}] 请求无效，不再尝试其他渠道 (渠道: {}): {}",
                    ctx.tag,
                    channel.name,
                    error
                );
                return AttemptFailure::Abort(error);
            }
            ErrorCategory::NonRetryable => {
                log::warn!(
                    "[{}] 渠道 {} 认证被拒绝，不再重试: {}",
                    log_fwd::AUTH_REJECTED,
                    channel.name,
                    error
                );
                return AttemptFailure::Abort(error);
            }
            ErrorCategory::Retryable => {}
        }

        if !fallback {
            log::warn!("[{}] 渠道 {} 失败（未开启故障转移）: {}", ctx.tag, channel.name, error);
            return AttemptFailure::Abort(error);
        }

        log::warn!(
            "[{}] 渠道 {} 失败，尝试下一个渠道: {} - {}ms",
            log_fwd::CHANNEL_FAILED_RETRY,
            channel.name,
            error,
            ctx.latency_ms()
        );
        update_status(&self.status, |s| {
            s.last_error = Some(format!("渠道 {} 失败: {}", channel.name, error));
        });
        AttemptFailure::Retry(error)
    }

    /// 候选耗尽（或全部满载）时决定返回哪个错误：优先返回最后一个渠道错误
    fn exhausted(
        &self,
        ctx: &RequestContext,
        last_error: Option<ProxyError>,
        select_error: ProxyError,
        attempts: usize,
    ) -> ProxyError {
        match last_error {
            Some(error) => {
                log::error!(
                    "[{}] [{}] 所有 {} 个渠道都失败了",
                    log_fwd::ALL_CHANNELS_FAILED,
                    ctx.tag,
                    attempts
                );
                error
            }
            None => select_error,
        }
    }

    /// 模型列表
    ///
    /// 开启鉴权时仅拒绝无效令牌；未携带令牌也可以列出模型。
    pub fn list_models(&self, credential: Option<&str>) -> Result<Value, ProxyError> {
        let token = match credential.filter(|k| !k.is_empty()) {
            Some(key) if self.config.settings.require_auth => Some(
                self.config
                    .validate_token(key)
                    .ok_or_else(|| ProxyError::AuthError("令牌无效".to_string()))?,
            ),
            _ => None,
        };

        let data: Vec<Value> = self
            .config
            .all_models()
            .into_iter()
            .filter(|m| token.is_none_or(|t| t.allows_model(m)))
            .map(|id| {
                json!({
                    "id": id,
                    "object": "model",
                    "created": 0,
                    "owned_by": "ai-gateway",
                })
            })
            .collect();

        Ok(json!({"object": "list", "data": data}))
    }

    /// 健康检查信息
    pub fn health(&self) -> Value {
        json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "channels": self.channels.len(),
        })
    }

    /// 并发检查各渠道可用性，结果按渠道顺序返回
    pub async fn check_channels(&self) -> Vec<Value> {
        let checks = self.channels.iter().map(|channel| async move {
            let available = match self.providers.get(&channel.id) {
                Some(provider) => provider.is_available().await,
                None => false,
            };
            json!({
                "id": channel.id,
                "name": channel.name,
                "available": available,
            })
        });
        futures::future::join_all(checks).await
    }

    /// 状态快照（含各渠道限制器统计）
    pub fn status(&self) -> EngineStatus {
        let status = match self.status.read() {
            Ok(guard) => guard.clone(),
            Err(e) => e.into_inner().clone(),
        };
        EngineStatus {
            status,
            channels: self.channels.len(),
            high_availability_mode: self.config.settings.high_availability_mode,
            limiters: self.limiters.get_all_stats(),
        }
    }
}

/// 替换请求体中的模型名（高可用模式下渠道可能使用替换模型）
fn with_model(mut body: Value, model: &str) -> Value {
    if model.is_empty() {
        return body;
    }
    if let Some(obj) = body.as_object_mut() {
        let same = obj.get("model").and_then(|m| m.as_str()) == Some(model);
        if !same {
            obj.insert("model".to_string(), Value::String(model.to_string()));
        }
    }
    body
}
