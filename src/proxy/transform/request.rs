//! 请求体转换
//!
//! 六个方向的请求转换，每个函数接收源格式请求体，返回目标格式请求体。
//! Gemini 请求体额外保留 `model` / `stream` 字段，由 Gemini 适配器在发送前移除。

use super::common::{
    extract_text, gemini_parts_text, parse_data_url, stop_from_vec, stop_to_vec, to_data_url,
};
use crate::proxy::error::ProxyError;
use serde_json::{json, Map, Value};

const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-sonnet-20241022";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4";
const DEFAULT_GEMINI_MODEL: &str = "gemini-pro";
const DEFAULT_MAX_TOKENS: u64 = 4096;

pub(super) fn messages_of<'a>(body: &'a Value, key: &str) -> Result<&'a [Value], ProxyError> {
    match body.get(key) {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(items)) => Ok(items.as_slice()),
        Some(_) => Err(ProxyError::TransformError(format!("`{key}` 必须是数组"))),
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(|v| v.as_str())
}

fn copy_field(from: &Value, from_key: &str, to: &mut Map<String, Value>, to_key: &str) {
    if let Some(v) = from.get(from_key) {
        if !v.is_null() {
            to.insert(to_key.to_string(), v.clone());
        }
    }
}

// ─── OpenAI → Anthropic ──────────────────────────────────────────────────────

/// OpenAI 请求 → Anthropic 请求
pub fn openai_to_anthropic(body: &Value) -> Result<Value, ProxyError> {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    for msg in messages_of(body, "messages")? {
        let role = str_field(msg, "role").unwrap_or("user");
        match role {
            "system" | "developer" => {
                let text = extract_text(msg.get("content"));
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            "tool" => {
                // tool 结果变成 user 消息里的 tool_result 块，连续结果合并
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": str_field(msg, "tool_call_id").unwrap_or(""),
                    "content": extract_text(msg.get("content")),
                });
                push_anthropic_block(&mut messages, "user", block);
            }
            "assistant" => {
                let mut blocks = openai_content_to_anthropic_blocks(msg.get("content"));
                if let Some(tool_calls) = msg.get("tool_calls").and_then(|t| t.as_array()) {
                    for tc in tool_calls {
                        let func = tc.get("function").cloned().unwrap_or_else(|| json!({}));
                        let args = str_field(&func, "arguments").unwrap_or("{}");
                        let input: Value = serde_json::from_str(args).unwrap_or_else(|_| json!({}));
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": str_field(tc, "id").unwrap_or(""),
                            "name": str_field(&func, "name").unwrap_or(""),
                            "input": input,
                        }));
                    }
                }
                messages.push(json!({
                    "role": "assistant",
                    "content": collapse_anthropic_blocks(blocks),
                }));
            }
            _ => {
                let blocks = openai_content_to_anthropic_blocks(msg.get("content"));
                messages.push(json!({
                    "role": "user",
                    "content": collapse_anthropic_blocks(blocks),
                }));
            }
        }
    }

    let mut result = Map::new();
    result.insert(
        "model".into(),
        json!(str_field(body, "model").unwrap_or(DEFAULT_ANTHROPIC_MODEL)),
    );
    result.insert("messages".into(), json!(messages));
    let max_tokens = body
        .get("max_tokens")
        .or_else(|| body.get("max_completion_tokens"))
        .cloned()
        .unwrap_or_else(|| json!(DEFAULT_MAX_TOKENS));
    result.insert("max_tokens".into(), max_tokens);

    if !system_parts.is_empty() {
        result.insert("system".into(), json!(system_parts.join("\n")));
    }
    copy_field(body, "temperature", &mut result, "temperature");
    copy_field(body, "top_p", &mut result, "top_p");
    copy_field(body, "stream", &mut result, "stream");
    if let Some(stop) = body.get("stop").and_then(stop_to_vec) {
        result.insert("stop_sequences".into(), stop);
    }

    if let Some(tools) = body.get("tools").and_then(|t| t.as_array()) {
        let anthropic_tools: Vec<Value> = tools
            .iter()
            .filter_map(|t| t.get("function"))
            .map(|f| {
                json!({
                    "name": str_field(f, "name").unwrap_or(""),
                    "description": f.get("description").cloned().unwrap_or(Value::Null),
                    "input_schema": f.get("parameters").cloned().unwrap_or_else(|| json!({"type": "object"})),
                })
            })
            .collect();
        if !anthropic_tools.is_empty() {
            result.insert("tools".into(), json!(anthropic_tools));
        }
    }
    if let Some(choice) = body.get("tool_choice") {
        let converted = match choice {
            Value::String(s) if s == "auto" => Some(json!({"type": "auto"})),
            Value::String(s) if s == "required" => Some(json!({"type": "any"})),
            Value::String(s) if s == "none" => Some(json!({"type": "none"})),
            Value::Object(_) => choice
                .get("function")
                .and_then(|f| str_field(f, "name"))
                .map(|name| json!({"type": "tool", "name": name})),
            _ => None,
        };
        if let Some(c) = converted {
            result.insert("tool_choice".into(), c);
        }
    }

    Ok(Value::Object(result))
}

fn openai_content_to_anthropic_blocks(content: Option<&Value>) -> Vec<Value> {
    match content {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(s)) => vec![json!({"type": "text", "text": s})],
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| match str_field(part, "type") {
                Some("text") => Some(json!({"type": "text", "text": str_field(part, "text").unwrap_or("")})),
                Some("image_url") => {
                    let url = part
                        .get("image_url")
                        .and_then(|i| str_field(i, "url"))
                        .unwrap_or("");
                    Some(match parse_data_url(url) {
                        Some((media_type, data)) => json!({
                            "type": "image",
                            "source": {"type": "base64", "media_type": media_type, "data": data}
                        }),
                        None => json!({
                            "type": "image",
                            "source": {"type": "url", "url": url}
                        }),
                    })
                }
                _ => None,
            })
            .collect(),
        Some(other) => vec![json!({"type": "text", "text": other.to_string()})],
    }
}

/// 仅有单个文本块时还原为字符串
fn collapse_anthropic_blocks(blocks: Vec<Value>) -> Value {
    if blocks.len() == 1 && str_field(&blocks[0], "type") == Some("text") {
        return blocks[0].get("text").cloned().unwrap_or_else(|| json!(""));
    }
    if blocks.is_empty() {
        return json!("");
    }
    json!(blocks)
}

fn push_anthropic_block(messages: &mut Vec<Value>, role: &str, block: Value) {
    if let Some(last) = messages.last_mut() {
        if str_field(last, "role") == Some(role) {
            if let Some(Value::Array(existing)) = last.get_mut("content") {
                existing.push(block);
                return;
            }
        }
    }
    messages.push(json!({"role": role, "content": [block]}));
}

// ─── OpenAI → Gemini ─────────────────────────────────────────────────────────

/// OpenAI 请求 → Gemini 请求
pub fn openai_to_gemini(body: &Value) -> Result<Value, ProxyError> {
    let mut system_instruction: Option<String> = body
        .get("system")
        .map(|s| extract_text(Some(s)))
        .filter(|s| !s.is_empty());
    let mut contents = Vec::new();

    for msg in messages_of(body, "messages")? {
        let role = str_field(msg, "role").unwrap_or("user");
        match role {
            "system" | "developer" => {
                let text = extract_text(msg.get("content"));
                if !text.is_empty() {
                    system_instruction = Some(text);
                }
            }
            "assistant" => {
                let mut parts = openai_content_to_gemini_parts(msg.get("content"));
                if let Some(tool_calls) = msg.get("tool_calls").and_then(|t| t.as_array()) {
                    for tc in tool_calls {
                        let name = tc
                            .get("function")
                            .and_then(|f| str_field(f, "name"))
                            .unwrap_or("unknown");
                        parts.push(json!({"text": format!("[Tool use: {name}]")}));
                    }
                }
                contents.push(json!({"role": "model", "parts": parts}));
            }
            "tool" => {
                contents.push(json!({
                    "role": "user",
                    "parts": [{"text": extract_text(msg.get("content"))}]
                }));
            }
            _ => {
                contents.push(json!({
                    "role": "user",
                    "parts": openai_content_to_gemini_parts(msg.get("content"))
                }));
            }
        }
    }

    let mut generation_config = Map::new();
    copy_field(body, "temperature", &mut generation_config, "temperature");
    copy_field(body, "top_p", &mut generation_config, "topP");
    if body.get("max_tokens").is_some() {
        copy_field(body, "max_tokens", &mut generation_config, "maxOutputTokens");
    } else {
        copy_field(body, "max_completion_tokens", &mut generation_config, "maxOutputTokens");
    }
    if let Some(stop) = body.get("stop").and_then(stop_to_vec) {
        generation_config.insert("stopSequences".into(), stop);
    }

    let mut result = Map::new();
    result.insert("contents".into(), json!(contents));
    if let Some(system) = system_instruction {
        result.insert("systemInstruction".into(), json!({"parts": [{"text": system}]}));
    }
    if !generation_config.is_empty() {
        result.insert("generationConfig".into(), Value::Object(generation_config));
    }
    result.insert(
        "model".into(),
        json!(str_field(body, "model").unwrap_or(DEFAULT_GEMINI_MODEL)),
    );
    copy_field(body, "stream", &mut result, "stream");

    Ok(Value::Object(result))
}

fn openai_content_to_gemini_parts(content: Option<&Value>) -> Vec<Value> {
    match content {
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| match str_field(part, "type") {
                Some("text") => Some(json!({"text": str_field(part, "text").unwrap_or("")})),
                Some("image_url") => {
                    let url = part
                        .get("image_url")
                        .and_then(|i| str_field(i, "url"))
                        .unwrap_or("");
                    Some(match parse_data_url(url) {
                        Some((mime_type, data)) => {
                            json!({"inlineData": {"mimeType": mime_type, "data": data}})
                        }
                        None => json!({"text": url}),
                    })
                }
                _ => None,
            })
            .collect(),
        other => vec![json!({"text": extract_text(other)})],
    }
}

// ─── Anthropic → OpenAI ──────────────────────────────────────────────────────

/// Anthropic 请求 → OpenAI 请求
pub fn anthropic_to_openai(body: &Value) -> Result<Value, ProxyError> {
    let mut messages = Vec::new();

    // 处理 system prompt
    if let Some(system) = body.get("system") {
        if let Some(text) = system.as_str() {
            if !text.is_empty() {
                messages.push(json!({"role": "system", "content": text}));
            }
        } else if let Some(arr) = system.as_array() {
            let text = arr
                .iter()
                .filter_map(|block| str_field(block, "text"))
                .collect::<Vec<_>>()
                .join("\n");
            if !text.is_empty() {
                messages.push(json!({"role": "system", "content": text}));
            }
        }
    }

    for msg in messages_of(body, "messages")? {
        let role = str_field(msg, "role").unwrap_or("user");
        messages.extend(anthropic_message_to_openai(role, msg.get("content")));
    }

    let mut result = Map::new();
    result.insert(
        "model".into(),
        json!(str_field(body, "model").unwrap_or(DEFAULT_OPENAI_MODEL)),
    );
    result.insert("messages".into(), json!(messages));
    copy_field(body, "max_tokens", &mut result, "max_tokens");
    copy_field(body, "temperature", &mut result, "temperature");
    copy_field(body, "top_p", &mut result, "top_p");
    copy_field(body, "stream", &mut result, "stream");
    if let Some(stop) = body.get("stop_sequences") {
        result.insert("stop".into(), stop_from_vec(stop));
    }

    if let Some(tools) = body.get("tools").and_then(|t| t.as_array()) {
        let openai_tools: Vec<Value> = tools
            .iter()
            .filter(|t| str_field(t, "name").is_some())
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": str_field(t, "name").unwrap_or(""),
                        "description": t.get("description").cloned().unwrap_or(Value::Null),
                        "parameters": t.get("input_schema").cloned().unwrap_or_else(|| json!({}))
                    }
                })
            })
            .collect();
        if !openai_tools.is_empty() {
            result.insert("tools".into(), json!(openai_tools));
        }
    }
    if let Some(choice) = body.get("tool_choice") {
        let converted = match str_field(choice, "type") {
            Some("auto") => Some(json!("auto")),
            Some("any") => Some(json!("required")),
            Some("none") => Some(json!("none")),
            Some("tool") => str_field(choice, "name")
                .map(|name| json!({"type": "function", "function": {"name": name}})),
            _ => None,
        };
        if let Some(c) = converted {
            result.insert("tool_choice".into(), c);
        }
    }

    Ok(Value::Object(result))
}

/// 转换单条 Anthropic 消息（tool_result 会拆成独立的 tool 消息）
fn anthropic_message_to_openai(role: &str, content: Option<&Value>) -> Vec<Value> {
    let blocks = match content {
        None | Some(Value::Null) => return vec![json!({"role": role, "content": ""})],
        Some(Value::String(text)) => return vec![json!({"role": role, "content": text})],
        Some(Value::Array(blocks)) => blocks,
        Some(other) => return vec![json!({"role": role, "content": other.to_string()})],
    };

    let mut result = Vec::new();
    let mut content_parts = Vec::new();
    let mut tool_calls = Vec::new();

    for block in blocks {
        match str_field(block, "type").unwrap_or("") {
            "text" => {
                content_parts.push(json!({"type": "text", "text": str_field(block, "text").unwrap_or("")}));
            }
            "image" => {
                if let Some(source) = block.get("source") {
                    let url = match str_field(source, "type") {
                        Some("url") => str_field(source, "url").unwrap_or("").to_string(),
                        _ => to_data_url(
                            str_field(source, "media_type").unwrap_or("image/png"),
                            str_field(source, "data").unwrap_or(""),
                        ),
                    };
                    content_parts.push(json!({"type": "image_url", "image_url": {"url": url}}));
                }
            }
            "tool_use" => {
                let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
                tool_calls.push(json!({
                    "id": str_field(block, "id").unwrap_or(""),
                    "type": "function",
                    "function": {
                        "name": str_field(block, "name").unwrap_or(""),
                        "arguments": serde_json::to_string(&input).unwrap_or_default()
                    }
                }));
            }
            "tool_result" => {
                result.push(json!({
                    "role": "tool",
                    "tool_call_id": str_field(block, "tool_use_id").unwrap_or(""),
                    "content": extract_text(block.get("content")),
                }));
            }
            // thinking 等块跳过
            _ => {}
        }
    }

    if !content_parts.is_empty() || !tool_calls.is_empty() {
        let mut msg = json!({"role": role});
        msg["content"] = match content_parts.len() {
            0 => Value::Null,
            1 if str_field(&content_parts[0], "type") == Some("text") => {
                content_parts[0]["text"].clone()
            }
            _ => json!(content_parts),
        };
        if !tool_calls.is_empty() {
            msg["tool_calls"] = json!(tool_calls);
        }
        result.push(msg);
    }

    result
}

// ─── Anthropic → Gemini ──────────────────────────────────────────────────────

/// Anthropic 请求 → Gemini 请求
pub fn anthropic_to_gemini(body: &Value) -> Result<Value, ProxyError> {
    let mut contents = Vec::new();

    for msg in messages_of(body, "messages")? {
        let role = match str_field(msg, "role") {
            Some("assistant") => "model",
            _ => "user",
        };
        contents.push(json!({"role": role, "parts": anthropic_content_to_gemini_parts(msg.get("content"))}));
    }

    let mut generation_config = Map::new();
    copy_field(body, "max_tokens", &mut generation_config, "maxOutputTokens");
    copy_field(body, "temperature", &mut generation_config, "temperature");
    copy_field(body, "top_p", &mut generation_config, "topP");
    copy_field(body, "stop_sequences", &mut generation_config, "stopSequences");

    let mut result = Map::new();
    result.insert("contents".into(), json!(contents));
    let system_text = extract_text(body.get("system"));
    if !system_text.is_empty() {
        result.insert("systemInstruction".into(), json!({"parts": [{"text": system_text}]}));
    }
    if !generation_config.is_empty() {
        result.insert("generationConfig".into(), Value::Object(generation_config));
    }
    result.insert(
        "model".into(),
        json!(str_field(body, "model").unwrap_or(DEFAULT_GEMINI_MODEL)),
    );
    copy_field(body, "stream", &mut result, "stream");

    Ok(Value::Object(result))
}

fn anthropic_content_to_gemini_parts(content: Option<&Value>) -> Vec<Value> {
    let Some(Value::Array(blocks)) = content else {
        return vec![json!({"text": extract_text(content)})];
    };

    blocks
        .iter()
        .filter_map(|block| match str_field(block, "type") {
            Some("text") => Some(json!({"text": str_field(block, "text").unwrap_or("")})),
            Some("image") => {
                let source = block.get("source")?;
                match str_field(source, "type") {
                    Some("url") => Some(json!({"text": str_field(source, "url").unwrap_or("")})),
                    _ => Some(json!({"inlineData": {
                        "mimeType": str_field(source, "media_type").unwrap_or("image/png"),
                        "data": str_field(source, "data").unwrap_or(""),
                    }})),
                }
            }
            Some("tool_use") => Some(json!({
                "text": format!("[Tool use: {}]", str_field(block, "name").unwrap_or("unknown"))
            })),
            Some("tool_result") => Some(json!({"text": extract_text(block.get("content"))})),
            _ => None,
        })
        .collect()
}

// ─── Gemini → OpenAI ─────────────────────────────────────────────────────────

fn gemini_system_text(body: &Value) -> String {
    let instruction = body
        .get("systemInstruction")
        .or_else(|| body.get("system_instruction"));
    instruction
        .map(|i| gemini_parts_text(i.get("parts")))
        .unwrap_or_default()
}

fn gemini_contents(body: &Value) -> Result<&[Value], ProxyError> {
    messages_of(body, "contents")
}

fn gemini_generation_config(body: &Value) -> Value {
    body.get("generationConfig")
        .or_else(|| body.get("generation_config"))
        .cloned()
        .unwrap_or_else(|| json!({}))
}

/// Gemini parts → OpenAI content（含图片时使用多段内容）
fn gemini_parts_to_openai_content(parts: Option<&Value>) -> Value {
    let Some(parts) = parts.and_then(|p| p.as_array()) else {
        return json!("");
    };
    let has_media = parts.iter().any(|p| p.get("inlineData").is_some());
    if !has_media {
        return json!(gemini_parts_to_plain_text(parts));
    }

    let converted: Vec<Value> = parts
        .iter()
        .filter_map(|p| {
            if let Some(text) = str_field(p, "text") {
                Some(json!({"type": "text", "text": text}))
            } else {
                p.get("inlineData").map(|inline| {
                    json!({"type": "image_url", "image_url": {"url": to_data_url(
                        str_field(inline, "mimeType").unwrap_or("image/png"),
                        str_field(inline, "data").unwrap_or(""),
                    )}})
                })
            }
        })
        .collect();
    json!(converted)
}

/// 文本、函数调用与函数结果统一折叠为文本
fn gemini_parts_to_plain_text(parts: &[Value]) -> String {
    parts
        .iter()
        .filter_map(|p| {
            if let Some(text) = str_field(p, "text") {
                Some(text.to_string())
            } else if let Some(call) = p.get("functionCall") {
                Some(format!(
                    "[Tool use: {}]",
                    str_field(call, "name").unwrap_or("unknown")
                ))
            } else {
                p.get("functionResponse")
                    .and_then(|r| r.get("response"))
                    .map(|r| r.to_string())
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Gemini 请求 → OpenAI 请求
pub fn gemini_to_openai(body: &Value) -> Result<Value, ProxyError> {
    let mut messages = Vec::new();
    let system_text = gemini_system_text(body);
    if !system_text.is_empty() {
        messages.push(json!({"role": "system", "content": system_text}));
    }

    for content in gemini_contents(body)? {
        let role = match str_field(content, "role") {
            Some("model") => "assistant",
            _ => "user",
        };
        messages.push(json!({
            "role": role,
            "content": gemini_parts_to_openai_content(content.get("parts"))
        }));
    }

    let config = gemini_generation_config(body);
    let mut result = Map::new();
    result.insert(
        "model".into(),
        json!(str_field(body, "model").unwrap_or(DEFAULT_OPENAI_MODEL)),
    );
    result.insert("messages".into(), json!(messages));
    copy_field(&config, "maxOutputTokens", &mut result, "max_tokens");
    copy_field(&config, "temperature", &mut result, "temperature");
    copy_field(&config, "topP", &mut result, "top_p");
    if let Some(stop) = config.get("stopSequences") {
        result.insert("stop".into(), stop_from_vec(stop));
    }
    copy_field(body, "stream", &mut result, "stream");

    Ok(Value::Object(result))
}

// ─── Gemini → Anthropic ──────────────────────────────────────────────────────

/// Gemini 请求 → Anthropic 请求
pub fn gemini_to_anthropic(body: &Value) -> Result<Value, ProxyError> {
    let mut messages = Vec::new();
    for content in gemini_contents(body)? {
        let role = match str_field(content, "role") {
            Some("model") => "assistant",
            _ => "user",
        };
        let parts = content
            .get("parts")
            .and_then(|p| p.as_array())
            .map(|p| p.as_slice())
            .unwrap_or(&[]);
        let has_media = parts.iter().any(|p| p.get("inlineData").is_some());
        let message_content = if has_media {
            let blocks: Vec<Value> = parts
                .iter()
                .filter_map(|p| {
                    if let Some(text) = str_field(p, "text") {
                        Some(json!({"type": "text", "text": text}))
                    } else {
                        p.get("inlineData").map(|inline| {
                            json!({"type": "image", "source": {
                                "type": "base64",
                                "media_type": str_field(inline, "mimeType").unwrap_or("image/png"),
                                "data": str_field(inline, "data").unwrap_or(""),
                            }})
                        })
                    }
                })
                .collect();
            json!(blocks)
        } else {
            json!(gemini_parts_to_plain_text(parts))
        };
        messages.push(json!({"role": role, "content": message_content}));
    }

    let config = gemini_generation_config(body);
    let mut result = Map::new();
    result.insert(
        "model".into(),
        json!(str_field(body, "model").unwrap_or(DEFAULT_ANTHROPIC_MODEL)),
    );
    result.insert("messages".into(), json!(messages));
    result.insert(
        "max_tokens".into(),
        config
            .get("maxOutputTokens")
            .cloned()
            .unwrap_or_else(|| json!(DEFAULT_MAX_TOKENS)),
    );
    let system_text = gemini_system_text(body);
    if !system_text.is_empty() {
        result.insert("system".into(), json!(system_text));
    }
    copy_field(&config, "temperature", &mut result, "temperature");
    copy_field(&config, "topP", &mut result, "top_p");
    copy_field(&config, "stopSequences", &mut result, "stop_sequences");
    copy_field(body, "stream", &mut result, "stream");

    Ok(Value::Object(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_to_anthropic_system_and_defaults() {
        let input = json!({
            "messages": [
                {"role": "system", "content": "You are helpful"},
                {"role": "user", "content": "Hello"}
            ],
            "stop": "END"
        });
        let result = openai_to_anthropic(&input).unwrap();
        assert_eq!(result["model"], DEFAULT_ANTHROPIC_MODEL);
        assert_eq!(result["max_tokens"], 4096);
        assert_eq!(result["system"], "You are helpful");
        assert_eq!(result["messages"].as_array().unwrap().len(), 1);
        assert_eq!(result["messages"][0]["content"], "Hello");
        assert_eq!(result["stop_sequences"], json!(["END"]));
    }

    #[test]
    fn test_openai_to_anthropic_image_and_tools() {
        let input = json!({
            "model": "claude-3-haiku",
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "What is this?"},
                    {"type": "image_url", "image_url": {"url": "data:image/jpeg;base64,QUJD"}}
                ]},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_1", "type": "function", "function": {"name": "lookup", "arguments": "{\"q\":\"cat\"}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1", "content": "a cat"}
            ],
            "tools": [{"type": "function", "function": {"name": "lookup", "parameters": {"type": "object"}}}],
            "tool_choice": "required"
        });
        let result = openai_to_anthropic(&input).unwrap();
        let msgs = result["messages"].as_array().unwrap();
        assert_eq!(msgs[0]["content"][1]["source"]["media_type"], "image/jpeg");
        assert_eq!(msgs[0]["content"][1]["source"]["data"], "QUJD");
        assert_eq!(msgs[1]["content"][0]["type"], "tool_use");
        assert_eq!(msgs[1]["content"][0]["input"]["q"], "cat");
        assert_eq!(msgs[2]["role"], "user");
        assert_eq!(msgs[2]["content"][0]["type"], "tool_result");
        assert_eq!(msgs[2]["content"][0]["tool_use_id"], "call_1");
        assert_eq!(result["tools"][0]["name"], "lookup");
        assert_eq!(result["tool_choice"]["type"], "any");
    }

    #[test]
    fn test_openai_to_gemini() {
        let input = json!({
            "model": "gemini-1.5-pro",
            "messages": [
                {"role": "system", "content": "Be brief"},
                {"role": "user", "content": "Hi"},
                {"role": "assistant", "content": "Hello!"}
            ],
            "temperature": 0.5,
            "top_p": 0.9,
            "max_tokens": 100,
            "stop": ["x"],
            "stream": true
        });
        let result = openai_to_gemini(&input).unwrap();
        assert_eq!(result["systemInstruction"]["parts"][0]["text"], "Be brief");
        assert_eq!(result["contents"][0]["role"], "user");
        assert_eq!(result["contents"][1]["role"], "model");
        assert_eq!(result["contents"][1]["parts"][0]["text"], "Hello!");
        assert_eq!(result["generationConfig"]["temperature"], 0.5);
        assert_eq!(result["generationConfig"]["topP"], 0.9);
        assert_eq!(result["generationConfig"]["maxOutputTokens"], 100);
        assert_eq!(result["generationConfig"]["stopSequences"], json!(["x"]));
        assert_eq!(result["model"], "gemini-1.5-pro");
        assert_eq!(result["stream"], true);
    }

    #[test]
    fn test_openai_to_gemini_inline_image() {
        let input = json!({
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "look"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}}
            ]}]
        });
        let result = openai_to_gemini(&input).unwrap();
        let parts = result["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/png");
        assert_eq!(parts[1]["inlineData"]["data"], "AAAA");
    }

    #[test]
    fn test_anthropic_to_openai_blocks() {
        let input = json!({
            "model": "claude-3-opus",
            "max_tokens": 1024,
            "system": [{"type": "text", "text": "sys"}],
            "messages": [
                {"role": "user", "content": [
                    {"type": "text", "text": "see"},
                    {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "Zm9v"}}
                ]},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "tu_1", "name": "search", "input": {"q": "x"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tu_1", "content": "found"}
                ]}
            ],
            "stop_sequences": ["STOP"]
        });
        let result = anthropic_to_openai(&input).unwrap();
        let msgs = result["messages"].as_array().unwrap();
        assert_eq!(msgs[0]["role"], "system");
        assert_eq!(msgs[0]["content"], "sys");
        assert_eq!(
            msgs[1]["content"][1]["image_url"]["url"],
            "data:image/png;base64,Zm9v"
        );
        assert_eq!(msgs[2]["tool_calls"][0]["function"]["name"], "search");
        assert_eq!(msgs[3]["role"], "tool");
        assert_eq!(msgs[3]["content"], "found");
        assert_eq!(result["stop"], "STOP");
        assert_eq!(result["max_tokens"], 1024);
    }

    #[test]
    fn test_anthropic_to_gemini() {
        let input = json!({
            "model": "gemini-pro",
            "system": "sys",
            "max_tokens": 50,
            "stop_sequences": ["a", "b"],
            "messages": [
                {"role": "user", "content": "Hi"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "ok"},
                    {"type": "tool_use", "id": "t", "name": "calc", "input": {}}
                ]}
            ]
        });
        let result = anthropic_to_gemini(&input).unwrap();
        assert_eq!(result["systemInstruction"]["parts"][0]["text"], "sys");
        assert_eq!(result["contents"][1]["role"], "model");
        assert_eq!(result["contents"][1]["parts"][1]["text"], "[Tool use: calc]");
        assert_eq!(result["generationConfig"]["maxOutputTokens"], 50);
        assert_eq!(result["generationConfig"]["stopSequences"], json!(["a", "b"]));
    }

    #[test]
    fn test_gemini_to_openai() {
        let input = json!({
            "model": "gemini-pro",
            "system_instruction": {"parts": [{"text": "be"}, {"text": "nice"}]},
            "contents": [
                {"role": "user", "parts": [{"text": "Hello"}, {"text": "there"}]},
                {"role": "model", "parts": [{"text": "Hi"}]}
            ],
            "generationConfig": {"maxOutputTokens": 10, "topP": 0.3, "stopSequences": ["z"]}
        });
        let result = gemini_to_openai(&input).unwrap();
        let msgs = result["messages"].as_array().unwrap();
        assert_eq!(msgs[0]["content"], "be nice");
        assert_eq!(msgs[1]["content"], "Hello there");
        assert_eq!(msgs[2]["role"], "assistant");
        assert_eq!(result["max_tokens"], 10);
        assert_eq!(result["top_p"], 0.3);
        assert_eq!(result["stop"], "z");
    }

    #[test]
    fn test_gemini_to_anthropic_defaults() {
        let input = json!({
            "contents": [{"role": "user", "parts": [{"text": "Hi"}]}],
            "systemInstruction": {"parts": [{"text": "sys"}]}
        });
        let result = gemini_to_anthropic(&input).unwrap();
        assert_eq!(result["model"], DEFAULT_ANTHROPIC_MODEL);
        assert_eq!(result["max_tokens"], 4096);
        assert_eq!(result["system"], "sys");
        assert_eq!(result["messages"][0]["content"], "Hi");
    }

    #[test]
    fn test_non_array_messages_rejected() {
        let input = json!({"messages": "hello"});
        assert!(matches!(
            openai_to_anthropic(&input),
            Err(ProxyError::TransformError(_))
        ));
    }
}
