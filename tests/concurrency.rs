use ai_gateway_lib::config::{AppConfig, ChannelConfig, ChannelType};
use ai_gateway_lib::proxy::handler_context::RequestContext;
use ai_gateway_lib::proxy::providers::ChatOutput;
use ai_gateway_lib::proxy::{
    ApiFormat, BuiltinClient, BuiltinRegistry, BuiltinReply, ProxyEngine, ProxyError,
};
use async_trait::async_trait;
use axum::http::{HeaderMap, Uri};
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 每 10 个请求中有 3 个失败的进程内客户端
struct FlakyClient {
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl FlakyClient {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BuiltinClient for FlakyClient {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn chat_completion(
        &self,
        _messages: Vec<Value>,
        model: &str,
        stream: bool,
        _credential: &str,
    ) -> Result<BuiltinReply, ProxyError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1 + (n % 3) as u64)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        let failing = n % 10 < 3;

        if stream {
            // 失败的流在第一片之后中断
            let chunks = if failing {
                vec![
                    Ok(json!("part-1")),
                    Err(ProxyError::StreamError("connection reset".to_string())),
                ]
            } else {
                vec![Ok(json!("part-1")), Ok(json!("part-2")), Ok(json!("part-3"))]
            };
            return Ok(BuiltinReply::Stream(Box::pin(futures::stream::iter(chunks))));
        }

        if failing {
            return Err(ProxyError::UpstreamError {
                status: 500,
                body: Some("flaky".to_string()),
            });
        }

        Ok(BuiltinReply::Response(json!({
            "id": format!("chatcmpl-{n}"),
            "object": "chat.completion",
            "created": 1,
            "model": model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "ok"},
                "finish_reason": "stop"
            }]
        })))
    }
}

fn engine(client: Arc<FlakyClient>, limit: u32) -> Arc<ProxyEngine> {
    let mut channel = ChannelConfig::new(1, "flaky", ChannelType::Builtin, "");
    channel.builtin_provider = Some("flaky".to_string());
    channel.api_key = "cred".to_string();
    channel.max_concurrency = Some(limit);

    let mut config = AppConfig::default();
    config.settings.require_auth = false;
    config.settings.enable_fallback = false;
    config.channels.push(channel);

    let mut builtins = BuiltinRegistry::new();
    builtins.register(client);
    Arc::new(ProxyEngine::new(config, builtins).unwrap())
}

fn context(format: ApiFormat) -> RequestContext {
    let uri: Uri = "/v1/chat/completions".parse().unwrap();
    RequestContext::new(&HeaderMap::new(), &uri, format).with_model("flaky-model")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn thousand_requests_leave_no_slot_behind() {
    let client = Arc::new(FlakyClient::new());
    let engine = engine(client.clone(), 10);

    let mut tasks = Vec::with_capacity(1000);
    for i in 0..1000usize {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            let stream = i % 4 == 0;
            let body = json!({
                "model": "flaky-model",
                "stream": stream,
                "messages": [{"role": "user", "content": format!("req {i}")}]
            });
            match engine.chat(&context(ApiFormat::OpenAI), body, HeaderMap::new()).await {
                Ok(ChatOutput::Stream(mut chunks)) => {
                    let mut clean = true;
                    while let Some(chunk) = chunks.next().await {
                        clean &= chunk.is_ok();
                    }
                    clean
                }
                Ok(ChatOutput::Json(_)) => true,
                Err(_) => false,
            }
        }));
    }

    let mut ok = 0usize;
    for task in tasks {
        if task.await.unwrap() {
            ok += 1;
        }
    }

    assert_eq!(client.calls.load(Ordering::SeqCst), 1000);
    assert_eq!(ok, 700);
    assert!(client.peak.load(Ordering::SeqCst) <= 10);

    let limiter = engine.limiters().get(1).unwrap();
    assert_eq!(limiter.in_flight(), 0);
    assert_eq!(limiter.available_permits(), 10);

    // 统计为滑动窗口（默认 100 条）
    let stats = limiter.get_stats();
    assert_eq!(stats.sample_count, 100);
    assert_eq!(stats.total_requests, 100);
    assert_eq!(stats.in_flight, 0);

    let status = engine.status().status;
    assert_eq!(status.total_requests, 1000);
    assert_eq!(status.success_requests, 700);
    assert_eq!(status.failed_requests, 300);
}

#[tokio::test]
async fn dropped_stream_releases_its_slot() {
    let client = Arc::new(FlakyClient::new());
    // 跳过前 3 次失败调用
    client.calls.store(3, Ordering::SeqCst);
    let engine = engine(client, 1);
    let limiter = engine.limiters().get(1).unwrap();

    let body = json!({"model": "flaky-model", "stream": true, "messages": []});
    let output = engine
        .chat(&context(ApiFormat::Anthropic), body.clone(), HeaderMap::new())
        .await
        .unwrap();
    assert_eq!(limiter.in_flight(), 1);
    assert_eq!(limiter.available_permits(), 0);

    drop(output);
    assert_eq!(limiter.in_flight(), 0);
    assert_eq!(limiter.available_permits(), 1);
    assert_eq!(limiter.get_stats().total_requests, 1);

    // 槽位归还后下一个请求可以立即获得许可
    let output = engine
        .chat(&context(ApiFormat::Anthropic), body, HeaderMap::new())
        .await
        .unwrap();
    let ChatOutput::Stream(chunks) = output else {
        panic!("expected stream");
    };
    let frames: Vec<Value> = chunks
        .map(|c| match c.unwrap() {
            ai_gateway_lib::proxy::providers::StreamChunk::Json(v) => v,
            other => panic!("unexpected chunk: {other:?}"),
        })
        .collect()
        .await;
    assert_eq!(frames.first().unwrap()["type"], "message_start");
    assert_eq!(frames.last().unwrap()["type"], "message_stop");
    assert_eq!(limiter.in_flight(), 0);
}

#[tokio::test]
async fn saturated_channel_waits_for_a_free_slot() {
    let client = Arc::new(FlakyClient::new());
    client.calls.store(3, Ordering::SeqCst);
    let engine = engine(client, 1);
    let limiter = engine.limiters().get(1).unwrap();

    let body = json!({"model": "flaky-model", "stream": true, "messages": []});
    let held = engine
        .chat(&context(ApiFormat::OpenAI), body.clone(), HeaderMap::new())
        .await
        .unwrap();
    assert_eq!(limiter.available_permits(), 0);

    let waiter = {
        let engine = engine.clone();
        let body = json!({"model": "flaky-model", "messages": []});
        tokio::spawn(async move {
            engine
                .chat(&context(ApiFormat::OpenAI), body, HeaderMap::new())
                .await
                .map(|o| o.is_stream())
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    drop(held);
    let result = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.unwrap(), false);
    assert_eq!(limiter.in_flight(), 0);
}
