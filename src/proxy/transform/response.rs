//! 非流式响应转换
//!
//! 上游错误体（OpenAI/Gemini 的 `error` 字段、Anthropic 的 `type: error`）
//! 按目标格式的错误外形原样透传。

use super::common::{unix_timestamp, FinishReason, Usage};
use crate::proxy::error::ProxyError;
use serde_json::{json, Value};

fn ensure_object(body: &Value) -> Result<(), ProxyError> {
    if body.is_object() {
        Ok(())
    } else {
        Err(ProxyError::ForwardFailed("上游响应体不是 JSON 对象".to_string()))
    }
}

fn new_completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

/// 上游错误对象（若有）
fn openai_or_gemini_error(body: &Value) -> Option<&Value> {
    body.get("error").filter(|e| !e.is_null())
}

fn anthropic_error(body: &Value) -> Option<Value> {
    if body.get("type").and_then(|t| t.as_str()) == Some("error") {
        Some(body.get("error").cloned().unwrap_or_else(|| json!({})))
    } else {
        None
    }
}

// ─── → OpenAI ────────────────────────────────────────────────────────────────

/// Anthropic 响应 → OpenAI 响应
pub fn anthropic_to_openai(body: &Value, model: &str) -> Result<Value, ProxyError> {
    ensure_object(body)?;
    if let Some(error) = anthropic_error(body) {
        return Ok(json!({"error": error}));
    }

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    if let Some(blocks) = body.get("content").and_then(|c| c.as_array()) {
        for block in blocks {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    text.push_str(block.get("text").and_then(|t| t.as_str()).unwrap_or(""));
                }
                Some("tool_use") => {
                    let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
                    tool_calls.push(json!({
                        "id": block.get("id").and_then(|i| i.as_str()).unwrap_or(""),
                        "type": "function",
                        "function": {
                            "name": block.get("name").and_then(|n| n.as_str()).unwrap_or(""),
                            "arguments": serde_json::to_string(&input).unwrap_or_default(),
                        }
                    }));
                }
                _ => {}
            }
        }
    }

    let finish_reason = body
        .get("stop_reason")
        .and_then(|r| r.as_str())
        .map(FinishReason::from_anthropic)
        .unwrap_or(FinishReason::Stop);
    let usage = Usage::from_anthropic(body.get("usage").unwrap_or(&Value::Null));

    let mut message = json!({"role": "assistant", "content": text});
    if !tool_calls.is_empty() {
        message["tool_calls"] = json!(tool_calls);
    }

    Ok(json!({
        "id": body.get("id").and_then(|i| i.as_str()).map(String::from).unwrap_or_else(new_completion_id),
        "object": "chat.completion",
        "created": unix_timestamp(),
        "model": body.get("model").and_then(|m| m.as_str()).unwrap_or(model),
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason.as_openai(),
        }],
        "usage": usage.to_openai(),
    }))
}

/// Gemini 响应 → OpenAI 响应
pub fn gemini_to_openai(body: &Value, model: &str) -> Result<Value, ProxyError> {
    ensure_object(body)?;
    if let Some(error) = openai_or_gemini_error(body) {
        return Ok(json!({"error": error}));
    }

    let candidate = body
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first());
    let text = candidate
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<String>()
        })
        .unwrap_or_default();
    let finish_reason = candidate
        .and_then(|c| c.get("finishReason"))
        .and_then(|r| r.as_str())
        .map(FinishReason::from_gemini)
        .unwrap_or(FinishReason::Stop);
    let usage = Usage::from_gemini(body.get("usageMetadata").unwrap_or(&Value::Null));

    Ok(json!({
        "id": body.get("responseId").and_then(|i| i.as_str()).map(String::from).unwrap_or_else(new_completion_id),
        "object": "chat.completion",
        "created": unix_timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": finish_reason.as_openai(),
        }],
        "usage": usage.to_openai(),
    }))
}

// ─── OpenAI → ────────────────────────────────────────────────────────────────

/// OpenAI 响应 → Anthropic 响应
pub fn openai_to_anthropic(body: &Value, model: &str) -> Result<Value, ProxyError> {
    ensure_object(body)?;
    if let Some(error) = openai_or_gemini_error(body) {
        return Ok(json!({"type": "error", "error": error}));
    }

    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first());
    let message = choice.and_then(|c| c.get("message"));

    let mut content = Vec::new();
    if let Some(text) = message.and_then(|m| m.get("content")).and_then(|c| c.as_str()) {
        content.push(json!({"type": "text", "text": text}));
    }
    if let Some(tool_calls) = message
        .and_then(|m| m.get("tool_calls"))
        .and_then(|t| t.as_array())
    {
        for tc in tool_calls {
            let func = tc.get("function").cloned().unwrap_or_else(|| json!({}));
            let args = func.get("arguments").and_then(|a| a.as_str()).unwrap_or("{}");
            let input: Value = serde_json::from_str(args).unwrap_or_else(|_| json!({}));
            content.push(json!({
                "type": "tool_use",
                "id": tc.get("id").and_then(|i| i.as_str()).unwrap_or(""),
                "name": func.get("name").and_then(|n| n.as_str()).unwrap_or(""),
                "input": input,
            }));
        }
    }
    if content.is_empty() {
        content.push(json!({"type": "text", "text": ""}));
    }

    let stop_reason = choice
        .and_then(|c| c.get("finish_reason"))
        .and_then(|r| r.as_str())
        .map(FinishReason::from_openai)
        .unwrap_or(FinishReason::Stop);
    let usage = Usage::from_openai(body.get("usage").unwrap_or(&Value::Null));

    Ok(json!({
        "id": body.get("id").and_then(|i| i.as_str()).unwrap_or(""),
        "type": "message",
        "role": "assistant",
        "model": body.get("model").and_then(|m| m.as_str()).unwrap_or(model),
        "content": content,
        "stop_reason": stop_reason.as_anthropic(),
        "stop_sequence": null,
        "usage": usage.to_anthropic(),
    }))
}

/// OpenAI 响应 → Gemini 响应
pub fn openai_to_gemini(body: &Value, _model: &str) -> Result<Value, ProxyError> {
    ensure_object(body)?;
    if let Some(error) = openai_or_gemini_error(body) {
        return Ok(json!({"error": error}));
    }

    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first());
    let text = choice
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("");
    let finish_reason = choice
        .and_then(|c| c.get("finish_reason"))
        .and_then(|r| r.as_str())
        .map(FinishReason::from_openai)
        .unwrap_or(FinishReason::Stop);
    let usage = Usage::from_openai(body.get("usage").unwrap_or(&Value::Null));

    let mut result = json!({
        "candidates": [{
            "content": {"role": "model", "parts": [{"text": text}]},
            "finishReason": finish_reason.as_gemini(),
            "index": 0,
        }],
        "usageMetadata": usage.to_gemini(),
    });
    if let Some(id) = body.get("id").and_then(|i| i.as_str()) {
        result["responseId"] = json!(id);
    }
    Ok(result)
}

// ─── Anthropic ↔ Gemini（经由 OpenAI 中间格式）─────────────────────────────

/// Anthropic 响应 → Gemini 响应
pub fn anthropic_to_gemini(body: &Value, model: &str) -> Result<Value, ProxyError> {
    let openai = anthropic_to_openai(body, model)?;
    openai_to_gemini(&openai, model)
}

/// Gemini 响应 → Anthropic 响应
pub fn gemini_to_anthropic(body: &Value, model: &str) -> Result<Value, ProxyError> {
    let openai = gemini_to_openai(body, model)?;
    let mut result = openai_to_anthropic(&openai, model)?;
    // Anthropic 的 id 直接沿用 Gemini responseId
    if let Some(id) = body.get("responseId").and_then(|i| i.as_str()) {
        result["id"] = json!(id);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gemini_to_openai() {
        let body = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Hel"}, {"text": "lo"}]},
                "finishReason": "MAX_TOKENS"
            }],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6},
            "responseId": "resp-1"
        });
        let result = gemini_to_openai(&body, "gemini-pro").unwrap();
        assert_eq!(result["id"], "resp-1");
        assert_eq!(result["object"], "chat.completion");
        assert_eq!(result["model"], "gemini-pro");
        assert_eq!(result["choices"][0]["message"]["content"], "Hello");
        assert_eq!(result["choices"][0]["finish_reason"], "length");
        assert_eq!(result["usage"]["total_tokens"], 6);
    }

    #[test]
    fn test_anthropic_to_openai_with_tool_use() {
        let body = json!({
            "id": "msg_1",
            "model": "claude-3-5-sonnet",
            "content": [
                {"type": "text", "text": "Let me check"},
                {"type": "tool_use", "id": "tu_1", "name": "weather", "input": {"city": "Paris"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        });
        let result = anthropic_to_openai(&body, "").unwrap();
        assert_eq!(result["id"], "msg_1");
        assert_eq!(result["choices"][0]["message"]["content"], "Let me check");
        assert_eq!(
            result["choices"][0]["message"]["tool_calls"][0]["function"]["name"],
            "weather"
        );
        assert_eq!(result["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(result["usage"]["total_tokens"], 15);
    }

    #[test]
    fn test_openai_to_anthropic() {
        let body = json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hi"},
                "finish_reason": "content_filter"
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
        });
        let result = openai_to_anthropic(&body, "gpt-4o").unwrap();
        assert_eq!(result["type"], "message");
        assert_eq!(result["content"][0]["text"], "Hi");
        assert_eq!(result["stop_reason"], "stop_sequence");
        assert_eq!(result["usage"]["input_tokens"], 3);
        assert_eq!(result["usage"]["output_tokens"], 1);
    }

    #[test]
    fn test_openai_to_gemini() {
        let body = json!({
            "choices": [{"message": {"content": "Yo"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
        });
        let result = openai_to_gemini(&body, "m").unwrap();
        assert_eq!(result["candidates"][0]["content"]["parts"][0]["text"], "Yo");
        assert_eq!(result["candidates"][0]["finishReason"], "STOP");
        assert_eq!(result["usageMetadata"]["totalTokenCount"], 2);
    }

    #[test]
    fn test_anthropic_gemini_pivot() {
        let body = json!({
            "id": "msg_2",
            "content": [{"type": "text", "text": "ok"}],
            "stop_reason": "max_tokens",
            "usage": {"input_tokens": 1, "output_tokens": 2}
        });
        let gemini = anthropic_to_gemini(&body, "gemini-pro").unwrap();
        assert_eq!(gemini["candidates"][0]["finishReason"], "MAX_TOKENS");
        assert_eq!(gemini["usageMetadata"]["totalTokenCount"], 3);

        let back = gemini_to_anthropic(&gemini, "claude").unwrap();
        assert_eq!(back["id"], "msg_2");
        assert_eq!(back["content"][0]["text"], "ok");
        assert_eq!(back["stop_reason"], "max_tokens");
    }

    #[test]
    fn test_error_passthrough() {
        let anthropic_err = json!({"type": "error", "error": {"type": "overloaded_error", "message": "busy"}});
        let result = anthropic_to_openai(&anthropic_err, "").unwrap();
        assert_eq!(result["error"]["message"], "busy");

        let openai_err = json!({"error": {"message": "bad key"}});
        let result = openai_to_anthropic(&openai_err, "").unwrap();
        assert_eq!(result["type"], "error");
        assert_eq!(result["error"]["message"], "bad key");

        let gemini_err = json!({"error": {"code": 400, "message": "nope"}});
        let result = gemini_to_openai(&gemini_err, "").unwrap();
        assert_eq!(result["error"]["code"], 400);
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(gemini_to_openai(&json!([1, 2]), "m").is_err());
    }
}
