//! 流式分片转换
//!
//! `*_to_*` 函数是无状态的单分片转换（一进至多一出）；
//! [`StreamTranslator`] 在其之上维护单条流的状态：角色标记只发一次、
//! Anthropic 事件序列补全、重复结束分片去重、无终止事件的上游补发结束分片。

use super::common::{unix_timestamp, FinishReason, Usage};
use super::transform_stream_chunk;
use crate::proxy::types::ApiFormat;
use serde_json::{json, Value};
use std::collections::HashMap;

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(|v| v.as_str())
}

fn openai_chunk(id: &str, model: &str, delta: Value, finish_reason: Option<&str>) -> Value {
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": unix_timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }]
    })
}

fn anthropic_message_start(id: &str, model: &str) -> Value {
    json!({
        "type": "message_start",
        "message": {
            "id": id,
            "type": "message",
            "role": "assistant",
            "model": model,
            "content": [],
            "stop_reason": null,
            "stop_sequence": null,
            "usage": {"input_tokens": 0, "output_tokens": 0}
        }
    })
}

fn anthropic_message_delta(stop_reason: &str, output_tokens: u64) -> Value {
    json!({
        "type": "message_delta",
        "delta": {"stop_reason": stop_reason, "stop_sequence": null},
        "usage": {"output_tokens": output_tokens}
    })
}

fn anthropic_tool_start(index: u64, id: &str, name: &str) -> Value {
    json!({
        "type": "content_block_start",
        "index": index,
        "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}}
    })
}

fn anthropic_input_delta(index: u64, partial_json: &str) -> Value {
    json!({
        "type": "content_block_delta",
        "index": index,
        "delta": {"type": "input_json_delta", "partial_json": partial_json}
    })
}

fn gemini_chunk(text: &str, finish_reason: Option<&str>) -> Value {
    let mut candidate = json!({
        "content": {"role": "model", "parts": [{"text": text}]},
        "index": 0,
    });
    if let Some(reason) = finish_reason {
        candidate["finishReason"] = json!(reason);
    }
    json!({"candidates": [candidate]})
}

// ─── 无状态转换 ──────────────────────────────────────────────────────────────

/// Anthropic 事件 → OpenAI 分片
pub fn anthropic_to_openai(chunk: &Value, model: &str) -> Option<Value> {
    let fallback_id = format!("chatcmpl-{model}");
    match chunk.get("type").and_then(|t| t.as_str())? {
        "message_start" => {
            let id = str_at(chunk, "/message/id").unwrap_or(&fallback_id);
            let model = str_at(chunk, "/message/model").unwrap_or(model);
            Some(openai_chunk(
                id,
                model,
                json!({"role": "assistant", "content": ""}),
                None,
            ))
        }
        "content_block_start" => {
            let block = chunk.get("content_block")?;
            if block.get("type").and_then(|t| t.as_str()) != Some("tool_use") {
                return None;
            }
            let index = chunk.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
            Some(openai_chunk(
                &fallback_id,
                model,
                json!({"tool_calls": [{
                    "index": index,
                    "id": block.get("id").and_then(|i| i.as_str()).unwrap_or(""),
                    "type": "function",
                    "function": {
                        "name": block.get("name").and_then(|n| n.as_str()).unwrap_or(""),
                        "arguments": ""
                    }
                }]}),
                None,
            ))
        }
        "content_block_delta" => {
            let delta = chunk.get("delta")?;
            match delta.get("type").and_then(|t| t.as_str()) {
                Some("text_delta") => {
                    let text = delta.get("text").and_then(|t| t.as_str()).unwrap_or("");
                    Some(openai_chunk(&fallback_id, model, json!({"content": text}), None))
                }
                Some("input_json_delta") => {
                    let index = chunk.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                    let partial = delta
                        .get("partial_json")
                        .and_then(|p| p.as_str())
                        .unwrap_or("");
                    Some(openai_chunk(
                        &fallback_id,
                        model,
                        json!({"tool_calls": [{"index": index, "function": {"arguments": partial}}]}),
                        None,
                    ))
                }
                _ => None,
            }
        }
        "message_delta" => {
            let reason = str_at(chunk, "/delta/stop_reason")?;
            let mut out = openai_chunk(
                &fallback_id,
                model,
                json!({}),
                Some(FinishReason::from_anthropic(reason).as_openai()),
            );
            if let Some(usage) = chunk.get("usage") {
                out["usage"] = Usage::from_anthropic(usage).to_openai();
            }
            Some(out)
        }
        "message_stop" => Some(openai_chunk(&fallback_id, model, json!({}), Some("stop"))),
        _ => None,
    }
}

/// Gemini 分片 → OpenAI 分片
pub fn gemini_to_openai(chunk: &Value, model: &str) -> Option<Value> {
    let candidate = chunk
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first());
    let text: String = candidate
        .and_then(|c| c.pointer("/content/parts"))
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect()
        })
        .unwrap_or_default();
    let finish = candidate
        .and_then(|c| c.get("finishReason"))
        .and_then(|r| r.as_str())
        .map(|r| FinishReason::from_gemini(r).as_openai());

    if text.is_empty() && finish.is_none() {
        return None;
    }

    let id = chunk
        .get("responseId")
        .and_then(|i| i.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("chatcmpl-{model}"));
    let delta = if text.is_empty() {
        json!({})
    } else {
        json!({"content": text})
    };
    let mut out = openai_chunk(&id, model, delta, finish);
    if let Some(usage) = chunk.get("usageMetadata") {
        out["usage"] = Usage::from_gemini(usage).to_openai();
    }
    Some(out)
}

/// OpenAI 分片 → Anthropic 事件
pub fn openai_to_anthropic(chunk: &Value, model: &str) -> Option<Value> {
    let choice = chunk
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())?;

    if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
        let output_tokens = chunk
            .get("usage")
            .map(|u| Usage::from_openai(u).output_tokens)
            .unwrap_or(0);
        return Some(anthropic_message_delta(
            FinishReason::from_openai(reason).as_anthropic(),
            output_tokens,
        ));
    }

    let delta = choice.get("delta")?;
    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            return Some(json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "text_delta", "text": text}
            }));
        }
    }

    if let Some(call) = delta
        .get("tool_calls")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
    {
        let index = call.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
        if let Some(name) = str_at(call, "/function/name") {
            return Some(anthropic_tool_start(
                index,
                call.get("id").and_then(|i| i.as_str()).unwrap_or(""),
                name,
            ));
        }
        let partial = str_at(call, "/function/arguments").filter(|a| !a.is_empty())?;
        return Some(anthropic_input_delta(index, partial));
    }

    if delta.get("role").is_some() {
        let id = chunk
            .get("id")
            .and_then(|i| i.as_str())
            .unwrap_or("msg_gateway");
        let model = chunk.get("model").and_then(|m| m.as_str()).unwrap_or(model);
        return Some(anthropic_message_start(id, model));
    }

    None
}

/// OpenAI 分片 → Gemini 分片
pub fn openai_to_gemini(chunk: &Value, _model: &str) -> Option<Value> {
    let choice = chunk
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())?;
    let text = choice
        .pointer("/delta/content")
        .and_then(|c| c.as_str())
        .unwrap_or("");
    let finish = choice
        .get("finish_reason")
        .and_then(|r| r.as_str())
        .map(|r| FinishReason::from_openai(r).as_gemini());

    if text.is_empty() && finish.is_none() {
        return None;
    }

    let mut out = gemini_chunk(text, finish);
    if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
        out["usageMetadata"] = Usage::from_openai(usage).to_gemini();
    }
    Some(out)
}

/// Anthropic 事件 → Gemini 分片（经由 OpenAI）
pub fn anthropic_to_gemini(chunk: &Value, model: &str) -> Option<Value> {
    anthropic_to_openai(chunk, model).and_then(|c| openai_to_gemini(&c, model))
}

/// Gemini 分片 → Anthropic 事件（经由 OpenAI）
pub fn gemini_to_anthropic(chunk: &Value, model: &str) -> Option<Value> {
    gemini_to_openai(chunk, model).and_then(|c| openai_to_anthropic(&c, model))
}

// ─── 有状态的流转换器 ────────────────────────────────────────────────────────

/// 单条流的转换状态
pub struct StreamTranslator {
    source: ApiFormat,
    target: ApiFormat,
    model: String,
    stream_id: String,
    role_sent: bool,
    /// 当前打开的 Anthropic 内容块序号
    open_block: Option<u64>,
    next_block: u64,
    text_block: Option<u64>,
    /// OpenAI 工具调用序号 → Anthropic 内容块序号
    tool_blocks: HashMap<u64, u64>,
    finished: bool,
}

impl StreamTranslator {
    /// `source` 为上游格式，`target` 为调用方格式
    pub fn new(source: ApiFormat, target: ApiFormat, model: &str) -> Self {
        let stream_id = match target {
            ApiFormat::Anthropic => format!("msg_{}", uuid::Uuid::new_v4().simple()),
            _ => format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        };
        Self {
            source,
            target,
            model: model.to_string(),
            stream_id,
            role_sent: false,
            open_block: None,
            next_block: 0,
            text_block: None,
            tool_blocks: HashMap::new(),
            finished: false,
        }
    }

    /// 是否已输出结束分片
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// 转换一个上游分片，返回零个或多个目标格式分片
    pub fn translate(&mut self, chunk: Value) -> Vec<Value> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        for piece in split_terminal(chunk, self.source) {
            let (piece, tool_calls) = self.take_tool_calls(piece);
            if let Some(converted) =
                transform_stream_chunk(piece, self.source, self.target, &self.model)
            {
                self.emit(converted, &mut out);
            }
            if !tool_calls.is_empty() && !self.finished {
                self.emit_tool_calls(&tool_calls, &mut out);
            }
            if self.finished {
                break;
            }
        }
        out
    }

    /// 上游流结束：若尚未输出结束分片则补发
    pub fn finish(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        let terminal = match self.target {
            ApiFormat::OpenAI => openai_chunk(&self.stream_id, &self.model, json!({}), Some("stop")),
            ApiFormat::Anthropic => json!({"type": "message_stop"}),
            ApiFormat::Gemini => gemini_chunk("", Some("STOP")),
        };
        self.emit(terminal, &mut out);
        out
    }

    fn emit(&mut self, chunk: Value, out: &mut Vec<Value>) {
        match self.target {
            ApiFormat::OpenAI => self.emit_openai(chunk, out),
            ApiFormat::Anthropic => self.emit_anthropic(chunk, out),
            ApiFormat::Gemini => {
                if chunk
                    .pointer("/candidates/0/finishReason")
                    .and_then(|r| r.as_str())
                    .is_some()
                {
                    self.finished = true;
                }
                out.push(chunk);
            }
        }
    }

    fn emit_openai(&mut self, mut chunk: Value, out: &mut Vec<Value>) {
        chunk["id"] = json!(self.stream_id);
        let is_role = chunk.pointer("/choices/0/delta/role").is_some();
        if !self.role_sent {
            self.role_sent = true;
            if !is_role {
                out.push(openai_chunk(
                    &self.stream_id,
                    &self.model,
                    json!({"role": "assistant", "content": ""}),
                    None,
                ));
            }
        } else if is_role {
            // 角色标记只发一次
            let has_content = chunk
                .pointer("/choices/0/delta/content")
                .and_then(|c| c.as_str())
                .is_some_and(|c| !c.is_empty());
            if !has_content {
                return;
            }
        }
        if chunk
            .pointer("/choices/0/finish_reason")
            .is_some_and(|r| !r.is_null())
        {
            self.finished = true;
        }
        out.push(chunk);
    }

    fn ensure_message_start(&mut self, out: &mut Vec<Value>) {
        if !self.role_sent {
            self.role_sent = true;
            out.push(anthropic_message_start(&self.stream_id, &self.model));
        }
    }

    fn close_block(&mut self, out: &mut Vec<Value>) {
        if let Some(index) = self.open_block.take() {
            out.push(json!({"type": "content_block_stop", "index": index}));
        }
    }

    fn open_new_block(&mut self) -> u64 {
        let index = self.next_block;
        self.next_block += 1;
        self.open_block = Some(index);
        index
    }

    /// OpenAI → Anthropic 时取出分片中的工具调用，交给有状态的内容块编排
    fn take_tool_calls(&self, mut piece: Value) -> (Value, Vec<Value>) {
        if self.source != ApiFormat::OpenAI || self.target != ApiFormat::Anthropic {
            return (piece, Vec::new());
        }
        let calls = piece
            .pointer_mut("/choices/0/delta")
            .and_then(|d| d.as_object_mut())
            .and_then(|d| d.remove("tool_calls"));
        match calls {
            Some(Value::Array(calls)) => (piece, calls),
            _ => (piece, Vec::new()),
        }
    }

    /// 新工具调用开启 `tool_use` 内容块，参数片段转为 `input_json_delta`
    fn emit_tool_calls(&mut self, calls: &[Value], out: &mut Vec<Value>) {
        self.ensure_message_start(out);
        for call in calls {
            let tool_index = call.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
            let block = match self.tool_blocks.get(&tool_index).copied() {
                Some(block) => block,
                None => {
                    self.close_block(out);
                    let block = self.open_new_block();
                    self.tool_blocks.insert(tool_index, block);
                    out.push(anthropic_tool_start(
                        block,
                        call.get("id").and_then(|i| i.as_str()).unwrap_or(""),
                        str_at(call, "/function/name").unwrap_or(""),
                    ));
                    block
                }
            };
            if let Some(partial) = str_at(call, "/function/arguments").filter(|a| !a.is_empty()) {
                out.push(anthropic_input_delta(block, partial));
            }
        }
    }

    fn emit_anthropic(&mut self, mut chunk: Value, out: &mut Vec<Value>) {
        match chunk.get("type").and_then(|t| t.as_str()).unwrap_or("") {
            "message_start" => {
                if !self.role_sent {
                    self.role_sent = true;
                    let mut start = chunk;
                    start["message"]["id"] = json!(self.stream_id);
                    out.push(start);
                }
            }
            "content_block_delta" => {
                self.ensure_message_start(out);
                let index = match self.open_block.filter(|b| Some(*b) == self.text_block) {
                    Some(index) => index,
                    None => {
                        self.close_block(out);
                        let index = self.open_new_block();
                        self.text_block = Some(index);
                        out.push(json!({
                            "type": "content_block_start",
                            "index": index,
                            "content_block": {"type": "text", "text": ""}
                        }));
                        index
                    }
                };
                chunk["index"] = json!(index);
                out.push(chunk);
            }
            "message_delta" => {
                self.ensure_message_start(out);
                self.close_block(out);
                out.push(chunk);
                out.push(json!({"type": "message_stop"}));
                self.finished = true;
            }
            "message_stop" => {
                self.ensure_message_start(out);
                self.close_block(out);
                out.push(anthropic_message_delta(FinishReason::Stop.as_anthropic(), 0));
                out.push(chunk);
                self.finished = true;
            }
            _ => {
                self.ensure_message_start(out);
                out.push(chunk);
            }
        }
    }
}

/// 同时携带内容与结束原因的分片拆成两个，保证无状态转换不丢内容
fn split_terminal(chunk: Value, source: ApiFormat) -> Vec<Value> {
    match source {
        ApiFormat::OpenAI => {
            let has_content = chunk
                .pointer("/choices/0/delta/content")
                .and_then(|c| c.as_str())
                .is_some_and(|c| !c.is_empty())
                || chunk
                    .pointer("/choices/0/delta/tool_calls")
                    .and_then(|c| c.as_array())
                    .is_some_and(|c| !c.is_empty());
            let has_finish = chunk
                .pointer("/choices/0/finish_reason")
                .is_some_and(|r| !r.is_null());
            if !(has_content && has_finish) {
                return vec![chunk];
            }
            let mut content = chunk.clone();
            content["choices"][0]["finish_reason"] = Value::Null;
            if let Some(obj) = content.as_object_mut() {
                obj.remove("usage");
            }
            let mut terminal = chunk;
            terminal["choices"][0]["delta"] = json!({});
            vec![content, terminal]
        }
        ApiFormat::Gemini => {
            let has_text = chunk
                .pointer("/candidates/0/content/parts")
                .and_then(|p| p.as_array())
                .is_some_and(|parts| {
                    parts
                        .iter()
                        .any(|p| p.get("text").and_then(|t| t.as_str()).is_some_and(|t| !t.is_empty()))
                });
            let has_finish = chunk.pointer("/candidates/0/finishReason").is_some();
            if !(has_text && has_finish) {
                return vec![chunk];
            }
            let mut content = chunk.clone();
            if let Some(candidate) = content
                .pointer_mut("/candidates/0")
                .and_then(|c| c.as_object_mut())
            {
                candidate.remove("finishReason");
            }
            if let Some(obj) = content.as_object_mut() {
                obj.remove("usageMetadata");
            }
            let mut terminal = chunk;
            terminal["candidates"][0]["content"]["parts"] = json!([]);
            vec![content, terminal]
        }
        ApiFormat::Anthropic => vec![chunk],
    }
}
