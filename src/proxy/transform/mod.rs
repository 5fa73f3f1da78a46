//! 格式转换模块
//!
//! 实现 OpenAI / Anthropic / Gemini 三种格式之间的请求、响应与流式分片转换。
//! 所有函数的 `body` 都处于 `source` 格式，输出为 `target` 格式；
//! 源格式与目标格式相同时原样返回。

pub mod common;
pub mod request;
pub mod response;
pub mod stream;

pub use stream::StreamTranslator;

use crate::proxy::error::ProxyError;
use crate::proxy::types::ApiFormat;
use serde_json::Value;

/// 请求转换的附加信息
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformExtras {
    /// 请求是否要求流式输出
    pub is_stream: bool,
}

/// 请求转换，返回 (转换后的请求体, 模型名, 附加信息)
pub fn transform_request(
    body: Value,
    source: ApiFormat,
    target: ApiFormat,
) -> Result<(Value, String, TransformExtras), ProxyError> {
    if !body.is_object() {
        return Err(ProxyError::TransformError("请求体不是 JSON 对象".to_string()));
    }
    // 同格式直通也要校验消息列表，避免把畸形请求发往上游
    let messages_key = match source {
        ApiFormat::Gemini => "contents",
        _ => "messages",
    };
    request::messages_of(&body, messages_key)?;

    let extras = TransformExtras {
        is_stream: body
            .get("stream")
            .and_then(|s| s.as_bool())
            .unwrap_or(false),
    };

    let converted = if source == target {
        body
    } else {
        match (source, target) {
            (ApiFormat::OpenAI, ApiFormat::Anthropic) => request::openai_to_anthropic(&body)?,
            (ApiFormat::OpenAI, ApiFormat::Gemini) => request::openai_to_gemini(&body)?,
            (ApiFormat::Anthropic, ApiFormat::OpenAI) => request::anthropic_to_openai(&body)?,
            (ApiFormat::Anthropic, ApiFormat::Gemini) => request::anthropic_to_gemini(&body)?,
            (ApiFormat::Gemini, ApiFormat::OpenAI) => request::gemini_to_openai(&body)?,
            (ApiFormat::Gemini, ApiFormat::Anthropic) => request::gemini_to_anthropic(&body)?,
            (a, b) => {
                return Err(ProxyError::TransformError(format!(
                    "不支持的转换: {a} → {b}"
                )))
            }
        }
    };

    let model = converted
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string();

    log::debug!("[Transform] 请求转换 {source} → {target}, model: {model}");
    Ok((converted, model, extras))
}

/// 非流式响应转换
pub fn transform_response(
    body: Value,
    source: ApiFormat,
    target: ApiFormat,
    model: &str,
) -> Result<Value, ProxyError> {
    if source == target {
        return Ok(body);
    }
    match (source, target) {
        (ApiFormat::OpenAI, ApiFormat::Anthropic) => response::openai_to_anthropic(&body, model),
        (ApiFormat::OpenAI, ApiFormat::Gemini) => response::openai_to_gemini(&body, model),
        (ApiFormat::Anthropic, ApiFormat::OpenAI) => response::anthropic_to_openai(&body, model),
        (ApiFormat::Anthropic, ApiFormat::Gemini) => response::anthropic_to_gemini(&body, model),
        (ApiFormat::Gemini, ApiFormat::OpenAI) => response::gemini_to_openai(&body, model),
        (ApiFormat::Gemini, ApiFormat::Anthropic) => response::gemini_to_anthropic(&body, model),
        (a, b) => Err(ProxyError::TransformError(format!(
            "不支持的转换: {a} → {b}"
        ))),
    }
}

/// 单个流式分片转换；返回 `None` 表示该分片应跳过
pub fn transform_stream_chunk(
    chunk: Value,
    source: ApiFormat,
    target: ApiFormat,
    model: &str,
) -> Option<Value> {
    if source == target {
        return Some(chunk);
    }
    match (source, target) {
        (ApiFormat::Anthropic, ApiFormat::OpenAI) => stream::anthropic_to_openai(&chunk, model),
        (ApiFormat::Gemini, ApiFormat::OpenAI) => stream::gemini_to_openai(&chunk, model),
        (ApiFormat::OpenAI, ApiFormat::Anthropic) => stream::openai_to_anthropic(&chunk, model),
        (ApiFormat::OpenAI, ApiFormat::Gemini) => stream::openai_to_gemini(&chunk, model),
        (ApiFormat::Anthropic, ApiFormat::Gemini) => stream::anthropic_to_gemini(&chunk, model),
        (ApiFormat::Gemini, ApiFormat::Anthropic) => stream::gemini_to_anthropic(&chunk, model),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const FORMATS: [ApiFormat; 3] = [ApiFormat::OpenAI, ApiFormat::Anthropic, ApiFormat::Gemini];

    fn sample_request(format: ApiFormat) -> Value {
        match format {
            ApiFormat::OpenAI => json!({
                "model": "m-1",
                "messages": [
                    {"role": "user", "content": "Hello"},
                    {"role": "assistant", "content": "Hi there"},
                    {"role": "user", "content": "How are you?"}
                ],
                "max_tokens": 64
            }),
            ApiFormat::Anthropic => json!({
                "model": "m-1",
                "max_tokens": 64,
                "messages": [
                    {"role": "user", "content": "Hello"},
                    {"role": "assistant", "content": "Hi there"},
                    {"role": "user", "content": "How are you?"}
                ]
            }),
            ApiFormat::Gemini => json!({
                "model": "m-1",
                "contents": [
                    {"role": "user", "parts": [{"text": "Hello"}]},
                    {"role": "model", "parts": [{"text": "Hi there"}]},
                    {"role": "user", "parts": [{"text": "How are you?"}]}
                ],
                "generationConfig": {"maxOutputTokens": 64}
            }),
        }
    }

    #[test]
    fn test_identity_short_circuit() {
        for format in FORMATS {
            let body = sample_request(format);
            let (out, model, _) = transform_request(body.clone(), format, format).unwrap();
            assert_eq!(out, body);
            assert_eq!(model, "m-1");

            let resp = json!({"anything": [1, 2, 3]});
            assert_eq!(
                transform_response(resp.clone(), format, format, "m").unwrap(),
                resp
            );
            assert_eq!(
                transform_stream_chunk(resp.clone(), format, format, "m"),
                Some(resp)
            );
        }
    }

    #[test]
    fn test_request_round_trip_preserves_model_roles_text() {
        for x in FORMATS {
            for y in FORMATS {
                if x == y {
                    continue;
                }
                let original = sample_request(x);
                let (there, _, _) = transform_request(original.clone(), x, y).unwrap();
                let (back, model, _) = transform_request(there, y, x).unwrap();

                assert_eq!(model, "m-1", "{x} → {y} → {x}");
                // 角色与文本在往返后保持一致
                let key = if x == ApiFormat::Gemini { "contents" } else { "messages" };
                let before = original[key].as_array().unwrap();
                let after = back[key].as_array().unwrap();
                assert_eq!(before.len(), after.len(), "{x} → {y} → {x}");
                for (a, b) in before.iter().zip(after) {
                    assert_eq!(a["role"], b["role"], "{x} → {y} → {x}");
                    if x == ApiFormat::Gemini {
                        assert_eq!(a["parts"][0]["text"], b["parts"][0]["text"]);
                    } else {
                        assert_eq!(a["content"], b["content"], "{x} → {y} → {x}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_extras_stream_flag() {
        let body = json!({"model": "m", "messages": [], "stream": true});
        let (_, _, extras) =
            transform_request(body, ApiFormat::OpenAI, ApiFormat::Gemini).unwrap();
        assert!(extras.is_stream);
    }

    #[test]
    fn test_malformed_messages_rejected_for_every_target() {
        for source in FORMATS {
            let key = if source == ApiFormat::Gemini { "contents" } else { "messages" };
            let mut body = json!({"model": "m"});
            body[key] = json!("oops");
            for target in FORMATS {
                assert!(
                    matches!(
                        transform_request(body.clone(), source, target),
                        Err(ProxyError::TransformError(_))
                    ),
                    "{source} → {target}"
                );
            }
        }
    }

    #[test]
    fn test_non_object_body_fails_loudly() {
        assert!(matches!(
            transform_request(json!("hello"), ApiFormat::OpenAI, ApiFormat::OpenAI),
            Err(ProxyError::TransformError(_))
        ));
    }
}
