//! SSE 行解码与帧编码

use crate::proxy::error::{from_reqwest, ProxyError};
use crate::proxy::types::ApiFormat;
use bytes::{Bytes, BytesMut};
use futures::stream::{Stream, StreamExt};
use serde_json::Value;

/// 流结束标记帧
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// 一行 `data:` 的解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum SseData {
    /// `data: [DONE]`
    Done,
    Json(Value),
    /// 无法解析的数据行
    Invalid(String),
}

/// 把上游字节流切分为行
///
/// 每个元素是一行的原始字节（不含 `\n`）。缓冲区最多保留一行未完成的数据，
/// 流结束时残留的半行也会输出。
pub fn lines<S>(upstream: S) -> impl Stream<Item = Result<Bytes, ProxyError>> + Send
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    async_stream::stream! {
        let mut buffer = BytesMut::new();
        tokio::pin!(upstream);

        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => {
                    buffer.extend_from_slice(&bytes);
                    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                        let line = buffer.split_to(pos + 1);
                        yield Ok(line.freeze().slice(..pos));
                    }
                }
                Err(e) => {
                    yield Err(ProxyError::StreamError(from_reqwest(e).to_string()));
                    return;
                }
            }
        }

        if !buffer.is_empty() {
            yield Ok(buffer.freeze());
        }
    }
}

/// 解析一行；非 `data:` 行（`event:`、注释、空行）返回 None
pub fn parse_data_line(line: &[u8]) -> Option<SseData> {
    let text = std::str::from_utf8(line).ok()?.trim_end_matches('\r');
    let data = text.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(SseData::Done);
    }
    Some(match serde_json::from_str::<Value>(data) {
        Ok(value) => SseData::Json(value),
        Err(_) => SseData::Invalid(data.to_string()),
    })
}

/// 判断一行是否为 `data: [DONE]`
pub fn is_done_line(line: &[u8]) -> bool {
    matches!(parse_data_line(line), Some(SseData::Done))
}

/// 编码一个 JSON 分片为 SSE 帧
///
/// Anthropic 客户端的帧前带 `event: <type>` 行。
pub fn encode_frame(chunk: &Value, client_format: ApiFormat) -> String {
    let data = serde_json::to_string(chunk).unwrap_or_else(|_| chunk.to_string());
    match (client_format, chunk.get("type").and_then(|t| t.as_str())) {
        (ApiFormat::Anthropic, Some(event)) => format!("event: {event}\ndata: {data}\n\n"),
        _ => format!("data: {data}\n\n"),
    }
}

/// 流中途出错时发送的错误帧
pub fn error_frame(error: &ProxyError) -> String {
    format!("data: {}\n\n", error.to_error_body())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collect_lines(parts: Vec<&'static str>) -> Vec<String> {
        let upstream = futures::stream::iter(
            parts
                .into_iter()
                .map(|p| Ok::<Bytes, reqwest::Error>(Bytes::from_static(p.as_bytes()))),
        );
        let out: Vec<_> = futures::executor::block_on(lines(upstream).collect::<Vec<_>>());
        out.into_iter()
            .map(|r| String::from_utf8(r.unwrap().to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn test_lines_across_chunk_boundaries() {
        let out = collect_lines(vec!["data: {\"a\"", ":1}\n\nda", "ta: [DONE]\n", "tail"]);
        assert_eq!(out, vec!["data: {\"a\":1}", "", "data: [DONE]", "tail"]);
    }

    #[test]
    fn test_parse_data_line() {
        assert_eq!(parse_data_line(b"data: [DONE]"), Some(SseData::Done));
        assert_eq!(
            parse_data_line(b"data:{\"x\":1}\r"),
            Some(SseData::Json(json!({"x": 1})))
        );
        assert!(matches!(
            parse_data_line(b"data: not-json"),
            Some(SseData::Invalid(_))
        ));
        assert_eq!(parse_data_line(b"event: message_start"), None);
        assert_eq!(parse_data_line(b""), None);
        assert!(is_done_line(b"data: [DONE]"));
    }

    #[test]
    fn test_encode_frame() {
        let chunk = json!({"type": "message_stop"});
        assert_eq!(
            encode_frame(&chunk, ApiFormat::Anthropic),
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"
        );
        assert_eq!(
            encode_frame(&json!({"id": "x"}), ApiFormat::OpenAI),
            "data: {\"id\":\"x\"}\n\n"
        );
    }
}
