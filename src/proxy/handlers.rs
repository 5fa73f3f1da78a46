//! 请求处理器
//!
//! 处理各 API 端点的 HTTP 请求：解析请求、构建上下文、交给引擎，再编码响应。

use super::{
    engine::EngineStatus,
    handler_context::{strip_key_param, RequestContext},
    providers::RawRequest,
    response_processor::{chat_response, raw_response},
    server::ProxyState,
    types::{ApiFormat, EndpointKind},
    ProxyError,
};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, Method, Uri},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Default, Deserialize)]
pub struct HealthQuery {
    /// 为 true 时逐个探测渠道可用性
    #[serde(default)]
    pub check: bool,
}

/// 健康检查
pub async fn health_check(
    State(state): State<ProxyState>,
    Query(query): Query<HealthQuery>,
) -> Json<Value> {
    let engine = state.engine();
    let mut health = engine.health();
    if query.check {
        health["channel_checks"] = Value::Array(engine.check_channels().await);
    }
    Json(health)
}

/// 运行状态与各渠道限制器统计
pub async fn get_status(State(state): State<ProxyState>) -> Json<EngineStatus> {
    Json(state.status())
}

/// 模型列表
pub async fn list_models(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Json<Value>, ProxyError> {
    let ctx = RequestContext::new(&headers, &uri, ApiFormat::OpenAI);
    state
        .engine()
        .list_models(ctx.credential.as_deref())
        .map(Json)
}

/// 解析 JSON 请求体；空请求体视为 `{}`
fn parse_json_body(body: &Bytes) -> Result<Value, ProxyError> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(json!({}));
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ProxyError::InvalidRequest(format!("无效的 JSON 请求体: {e}")))?;
    if !value.is_object() {
        return Err(ProxyError::InvalidRequest("请求体必须是 JSON 对象".to_string()));
    }
    Ok(value)
}

async fn dispatch_chat(
    state: ProxyState,
    ctx: RequestContext,
    body: Value,
    headers: HeaderMap,
) -> Response {
    let engine = state.engine();
    match engine.chat(&ctx, body, headers).await {
        Ok(output) => chat_response(output, ctx.source, ctx.tag),
        Err(e) => {
            log::warn!(
                "[{}] 请求失败 (model: {}, {}ms, {}): {}",
                ctx.tag,
                ctx.request_model,
                ctx.latency_ms(),
                e.category().as_str(),
                e
            );
            e.into_response()
        }
    }
}

/// 处理 /v1/chat/completions 请求（OpenAI 格式）
pub async fn handle_chat_completions(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let body = match parse_json_body(&body) {
        Ok(body) => body,
        Err(e) => return e.into_response(),
    };
    let ctx = RequestContext::new(&headers, &uri, ApiFormat::OpenAI).with_model_from_body(&body);
    dispatch_chat(state, ctx, body, headers).await
}

/// 处理 /v1/messages 请求（Anthropic 格式）
pub async fn handle_messages(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let body = match parse_json_body(&body) {
        Ok(body) => body,
        Err(e) => return e.into_response(),
    };
    let ctx =
        RequestContext::new(&headers, &uri, ApiFormat::Anthropic).with_model_from_body(&body);
    dispatch_chat(state, ctx, body, headers).await
}

/// 解析 Gemini 路径 `{model}:{method}`，返回 (模型, 是否流式)
fn parse_gemini_target(rest: &str) -> Result<(String, bool), ProxyError> {
    let (model, method) = rest
        .rsplit_once(':')
        .ok_or_else(|| ProxyError::InvalidRequest(format!("无效的 Gemini 路径: {rest}")))?;
    let model = model.trim_start_matches("models/");
    if model.is_empty() {
        return Err(ProxyError::InvalidRequest("Gemini 路径缺少模型名".to_string()));
    }
    match method {
        "generateContent" => Ok((model.to_string(), false)),
        "streamGenerateContent" => Ok((model.to_string(), true)),
        other => Err(ProxyError::InvalidRequest(format!(
            "不支持的 Gemini 方法: {other}"
        ))),
    }
}

/// 处理 /v1beta/models/{model}:generateContent 与 :streamGenerateContent 请求
///
/// Gemini 把模型和流式标志放在 URL 中，这里注入请求体后按统一流程处理。
pub async fn handle_gemini(
    State(state): State<ProxyState>,
    Path(rest): Path<String>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let (model, is_stream) = match parse_gemini_target(&rest) {
        Ok(target) => target,
        Err(e) => return e.into_response(),
    };
    let mut body = match parse_json_body(&body) {
        Ok(body) => body,
        Err(e) => return e.into_response(),
    };
    if let Some(obj) = body.as_object_mut() {
        obj.insert("model".to_string(), Value::String(model.clone()));
        obj.insert("stream".to_string(), Value::Bool(is_stream));
    }

    let ctx = RequestContext::new(&headers, &uri, ApiFormat::Gemini).with_model(model);
    log::debug!("[{}] 从 URI 提取模型: {}", ctx.tag, ctx.request_model);
    dispatch_chat(state, ctx, body, headers).await
}

/// 处理其余 OpenAI 端点：completions / embeddings / images / audio 以及 `/v1/*` 兜底
///
/// 请求体原样转发给 OpenAI 兼容渠道，响应同样原样返回。
pub async fn handle_passthrough(
    State(state): State<ProxyState>,
    method: Method,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let endpoint = EndpointKind::from_path(uri.path());
    let model = serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|v| v.get("model").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_default();
    let ctx = RequestContext::new(&headers, &uri, ApiFormat::OpenAI).with_model(model);

    let request = RawRequest {
        method,
        endpoint,
        query: strip_key_param(uri.query()),
        headers,
        body,
    };

    let engine = state.engine();
    match engine.forward_raw(&ctx, request).await {
        Ok(raw) => raw_response(raw, ctx.tag),
        Err(e) => {
            log::warn!(
                "[{}] 透传 {} 失败 ({}ms): {}",
                ctx.tag,
                uri.path(),
                ctx.latency_ms(),
                e
            );
            e.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gemini_target() {
        assert_eq!(
            parse_gemini_target("gemini-pro:generateContent").unwrap(),
            ("gemini-pro".to_string(), false)
        );
        assert_eq!(
            parse_gemini_target("gemini-1.5-flash:streamGenerateContent").unwrap(),
            ("gemini-1.5-flash".to_string(), true)
        );
        assert!(parse_gemini_target("gemini-pro").is_err());
        assert!(parse_gemini_target("gemini-pro:countTokens").is_err());
        assert!(parse_gemini_target(":generateContent").is_err());
    }

    #[test]
    fn test_parse_json_body() {
        assert_eq!(parse_json_body(&Bytes::new()).unwrap(), json!({}));
        assert_eq!(
            parse_json_body(&Bytes::from_static(b"{\"model\":\"m\"}")).unwrap()["model"],
            "m"
        );
        assert!(matches!(
            parse_json_body(&Bytes::from_static(b"not json")),
            Err(ProxyError::InvalidRequest(_))
        ));
        assert!(parse_json_body(&Bytes::from_static(b"[1]")).is_err());
    }
}
