//! 三种格式共用的映射表与内容辅助函数

use serde_json::{json, Value};

/// 结束原因（三种格式间的统一表示）
///
/// `stop↔end_turn↔STOP`、`length↔max_tokens↔MAX_TOKENS`、
/// `content_filter↔stop_sequence↔SAFETY`、`tool_calls↔tool_use`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
}

impl FinishReason {
    pub fn from_openai(reason: &str) -> Self {
        match reason {
            "length" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            "tool_calls" | "function_call" => FinishReason::ToolCalls,
            _ => FinishReason::Stop,
        }
    }

    pub fn from_anthropic(reason: &str) -> Self {
        match reason {
            "max_tokens" => FinishReason::Length,
            "stop_sequence" | "refusal" => FinishReason::ContentFilter,
            "tool_use" => FinishReason::ToolCalls,
            _ => FinishReason::Stop,
        }
    }

    pub fn from_gemini(reason: &str) -> Self {
        match reason {
            "MAX_TOKENS" => FinishReason::Length,
            "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
                FinishReason::ContentFilter
            }
            _ => FinishReason::Stop,
        }
    }

    pub fn as_openai(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::ToolCalls => "tool_calls",
        }
    }

    pub fn as_anthropic(&self) -> &'static str {
        match self {
            FinishReason::Stop => "end_turn",
            FinishReason::Length => "max_tokens",
            FinishReason::ContentFilter => "stop_sequence",
            FinishReason::ToolCalls => "tool_use",
        }
    }

    pub fn as_gemini(&self) -> &'static str {
        match self {
            FinishReason::Stop | FinishReason::ToolCalls => "STOP",
            FinishReason::Length => "MAX_TOKENS",
            FinishReason::ContentFilter => "SAFETY",
        }
    }
}

/// token 用量，缺失的计数按 0 处理
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: Option<u64>,
}

fn count(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(|v| v.as_u64()).unwrap_or(0)
}

impl Usage {
    pub fn from_openai(usage: &Value) -> Self {
        Self {
            input_tokens: count(usage, "prompt_tokens"),
            output_tokens: count(usage, "completion_tokens"),
            total_tokens: usage.get("total_tokens").and_then(|v| v.as_u64()),
        }
    }

    pub fn from_anthropic(usage: &Value) -> Self {
        Self {
            input_tokens: count(usage, "input_tokens"),
            output_tokens: count(usage, "output_tokens"),
            total_tokens: None,
        }
    }

    pub fn from_gemini(usage: &Value) -> Self {
        Self {
            input_tokens: count(usage, "promptTokenCount"),
            output_tokens: count(usage, "candidatesTokenCount"),
            total_tokens: usage.get("totalTokenCount").and_then(|v| v.as_u64()),
        }
    }

    pub fn total(&self) -> u64 {
        self.total_tokens
            .unwrap_or_else(|| self.input_tokens.saturating_add(self.output_tokens))
    }

    pub fn to_openai(self) -> Value {
        json!({
            "prompt_tokens": self.input_tokens,
            "completion_tokens": self.output_tokens,
            "total_tokens": self.total(),
        })
    }

    pub fn to_anthropic(self) -> Value {
        json!({
            "input_tokens": self.input_tokens,
            "output_tokens": self.output_tokens,
        })
    }

    pub fn to_gemini(self) -> Value {
        json!({
            "promptTokenCount": self.input_tokens,
            "candidatesTokenCount": self.output_tokens,
            "totalTokenCount": self.total(),
        })
    }
}

/// 生成 data URL
pub fn to_data_url(media_type: &str, data: &str) -> String {
    format!("data:{media_type};base64,{data}")
}

/// 解析 `data:<media_type>;base64,<data>`
pub fn parse_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let media_type = meta.strip_suffix(";base64")?;
    Some((media_type, data))
}

/// 提取文本：字符串直接返回，数组中的文本片段用空格拼接
pub fn extract_text(content: Option<&Value>) -> String {
    match content {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(s) => Some(s.as_str()),
                Value::Object(_) if part.get("type").and_then(|t| t.as_str()) == Some("text") => {
                    part.get("text").and_then(|t| t.as_str())
                }
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(" "),
        Some(other) => other.to_string(),
    }
}

/// Gemini parts 中的文本，空格拼接
pub fn gemini_parts_text(parts: Option<&Value>) -> String {
    parts
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}

/// stop 可能为字符串或数组，统一成数组
pub fn stop_to_vec(stop: &Value) -> Option<Value> {
    match stop {
        Value::String(s) => Some(json!([s])),
        Value::Array(_) => Some(stop.clone()),
        _ => None,
    }
}

/// 单个停止序列还原为字符串
pub fn stop_from_vec(stop: &Value) -> Value {
    match stop.as_array() {
        Some(items) if items.len() == 1 => items[0].clone(),
        _ => stop.clone(),
    }
}

/// 当前 Unix 时间戳（秒）
pub fn unix_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_reason_tables() {
        assert_eq!(FinishReason::from_gemini("STOP").as_openai(), "stop");
        assert_eq!(FinishReason::from_gemini("MAX_TOKENS").as_openai(), "length");
        assert_eq!(
            FinishReason::from_gemini("RECITATION").as_openai(),
            "content_filter"
        );
        assert_eq!(FinishReason::from_gemini("OTHER").as_openai(), "stop");
        assert_eq!(FinishReason::from_openai("stop").as_anthropic(), "end_turn");
        assert_eq!(
            FinishReason::from_openai("content_filter").as_anthropic(),
            "stop_sequence"
        );
        assert_eq!(FinishReason::from_openai("tool_calls").as_anthropic(), "tool_use");
        assert_eq!(FinishReason::from_anthropic("max_tokens").as_gemini(), "MAX_TOKENS");
        assert_eq!(FinishReason::from_anthropic("stop_sequence").as_gemini(), "SAFETY");
        assert_eq!(FinishReason::from_anthropic("tool_use").as_openai(), "tool_calls");
    }

    #[test]
    fn test_usage_renames() {
        let usage = Usage::from_gemini(&json!({
            "promptTokenCount": 3,
            "candidatesTokenCount": 5,
            "totalTokenCount": 9
        }));
        let openai = usage.to_openai();
        assert_eq!(openai["prompt_tokens"], 3);
        assert_eq!(openai["completion_tokens"], 5);
        assert_eq!(openai["total_tokens"], 9);

        let anthropic = Usage::from_openai(&json!({"prompt_tokens": 1})).to_anthropic();
        assert_eq!(anthropic["input_tokens"], 1);
        assert_eq!(anthropic["output_tokens"], 0);
    }

    #[test]
    fn test_usage_total_computed_when_missing() {
        let usage = Usage::from_anthropic(&json!({"input_tokens": 2, "output_tokens": 4}));
        assert_eq!(usage.to_gemini()["totalTokenCount"], 6);
    }

    #[test]
    fn test_usage_total_saturates() {
        let usage = Usage::from_openai(&json!({
            "prompt_tokens": u64::MAX,
            "completion_tokens": 5
        }));
        assert_eq!(usage.total(), u64::MAX);
    }

    #[test]
    fn test_data_url() {
        let url = to_data_url("image/png", "AAAA");
        assert_eq!(url, "data:image/png;base64,AAAA");
        assert_eq!(parse_data_url(&url), Some(("image/png", "AAAA")));
        assert_eq!(parse_data_url("https://example.com/cat.png"), None);
    }

    #[test]
    fn test_extract_text() {
        assert_eq!(extract_text(Some(&json!("hi"))), "hi");
        assert_eq!(
            extract_text(Some(&json!([
                {"type": "text", "text": "a"},
                {"type": "image_url", "image_url": {"url": "x"}},
                {"type": "text", "text": "b"}
            ]))),
            "a b"
        );
        assert_eq!(extract_text(None), "");
    }

    #[test]
    fn test_stop_helpers() {
        assert_eq!(stop_to_vec(&json!("END")), Some(json!(["END"])));
        assert_eq!(stop_from_vec(&json!(["END"])), json!("END"));
        assert_eq!(stop_from_vec(&json!(["A", "B"])), json!(["A", "B"]));
    }
}
