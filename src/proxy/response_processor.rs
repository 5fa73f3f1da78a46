//! 响应处理器模块
//!
//! 把引擎输出编码为 HTTP 响应：JSON、SSE 流以及原样透传的字节流。

use super::{
    log_codes::rsp as log_rsp,
    providers::{sse, ChatOutput, ChunkStream, RawResponse, StreamChunk},
    types::ApiFormat,
    ProxyError,
};
use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;

/// 对话结果转为响应
pub fn chat_response(output: ChatOutput, client_format: ApiFormat, tag: &'static str) -> Response {
    match output {
        ChatOutput::Json(value) => Json(value).into_response(),
        ChatOutput::Stream(stream) => sse_response(stream, client_format, tag),
    }
}

/// 把分片流编码为 SSE 帧
///
/// 无论正常结束还是中途出错，最后一帧总是 `data: [DONE]`；
/// 出错时先发送一帧 `{"error": ...}`。
pub fn encode_sse(
    chunks: ChunkStream,
    client_format: ApiFormat,
    tag: &'static str,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
    async_stream::stream! {
        let mut chunks = chunks;
        let mut count: usize = 0;
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(StreamChunk::Json(value)) => {
                    count += 1;
                    yield Ok(Bytes::from(sse::encode_frame(&value, client_format)));
                }
                Ok(StreamChunk::Raw(line)) => {
                    count += 1;
                    yield Ok(line);
                }
                Err(e) => {
                    log::error!("[{}] [{tag}] 流错误: {e}", log_rsp::STREAM_ERROR);
                    yield Ok(Bytes::from(sse::error_frame(&e)));
                    break;
                }
            }
        }
        log::debug!("[{tag}] 流式响应结束，共 {count} 个分片");
        yield Ok(Bytes::from_static(sse::DONE_FRAME.as_bytes()));
    }
}

/// 构建 SSE 响应
pub fn sse_response(chunks: ChunkStream, client_format: ApiFormat, tag: &'static str) -> Response {
    let body = Body::from_stream(encode_sse(chunks, client_format, tag));
    let built = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no")
        .body(body);
    match built {
        Ok(resp) => resp,
        Err(e) => {
            log::error!("[{}] [{tag}] 构建流式响应失败: {e}", log_rsp::BUILD_STREAM_ERROR);
            ProxyError::Internal(format!("构建流式响应失败: {e}")).into_response()
        }
    }
}

/// 原样透传上游响应（保留状态码与 content-type）
pub fn raw_response(raw: RawResponse, tag: &'static str) -> Response {
    let status = StatusCode::from_u16(raw.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let body = raw.body.map(move |chunk| {
        chunk.map_err(|e| {
            log::error!("[{}] [{tag}] 读取上游响应失败: {e}", log_rsp::READ_BODY_ERROR);
            std::io::Error::other(e.to_string())
        })
    });

    let mut builder = Response::builder().status(status);
    if let Some(content_type) = raw.content_type.as_deref() {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    match builder.body(Body::from_stream(body)) {
        Ok(resp) => resp,
        Err(e) => {
            log::error!("[{}] [{tag}] 构建响应失败: {e}", log_rsp::BUILD_RESPONSE_ERROR);
            ProxyError::Internal(format!("构建响应失败: {e}")).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collect(chunks: Vec<Result<StreamChunk, ProxyError>>, format: ApiFormat) -> String {
        let stream: ChunkStream = Box::pin(futures::stream::iter(chunks));
        let frames: Vec<_> =
            futures::executor::block_on(encode_sse(stream, format, "Test").collect::<Vec<_>>());
        frames
            .into_iter()
            .map(|f| String::from_utf8(f.unwrap().to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn test_sse_always_ends_with_done() {
        let out = collect(
            vec![Ok(StreamChunk::Json(json!({"choices": []})))],
            ApiFormat::OpenAI,
        );
        assert!(out.starts_with("data: {\"choices\":[]}\n\n"));
        assert!(out.ends_with("data: [DONE]\n\n"));

        let empty = collect(vec![], ApiFormat::OpenAI);
        assert_eq!(empty, "data: [DONE]\n\n");
    }

    #[test]
    fn test_raw_lines_pass_untouched() {
        let out = collect(
            vec![
                Ok(StreamChunk::Raw(Bytes::from_static(b"data: {\"x\":1}\n"))),
                Ok(StreamChunk::Raw(Bytes::from_static(b"\n"))),
            ],
            ApiFormat::OpenAI,
        );
        assert_eq!(out, "data: {\"x\":1}\n\ndata: [DONE]\n\n");
    }

    #[test]
    fn test_anthropic_frames_have_event_line() {
        let out = collect(
            vec![Ok(StreamChunk::Json(json!({"type": "message_stop"})))],
            ApiFormat::Anthropic,
        );
        assert!(out.starts_with("event: message_stop\ndata: "));
    }

    #[test]
    fn test_error_frame_then_done() {
        let out = collect(
            vec![
                Ok(StreamChunk::Json(json!({"n": 1}))),
                Err(ProxyError::StreamError("boom".into())),
                Ok(StreamChunk::Json(json!({"n": 2}))),
            ],
            ApiFormat::OpenAI,
        );
        let frames: Vec<&str> = out.split("\n\n").filter(|f| !f.is_empty()).collect();
        assert_eq!(frames.len(), 3);
        assert!(frames[1].contains("\"error\""));
        assert!(frames[1].contains("boom"));
        assert_eq!(frames[2], "data: [DONE]");
    }

    #[tokio::test]
    async fn test_sse_response_headers() {
        let stream: ChunkStream = Box::pin(futures::stream::empty());
        let resp = sse_response(stream, ApiFormat::OpenAI, "Test");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        assert_eq!(resp.headers().get(header::CACHE_CONTROL).unwrap(), "no-cache");
    }
}
