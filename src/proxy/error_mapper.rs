//! 错误类型到 HTTP 状态码的映射
//!
//! 供限流统计与状态记录使用，与返回给调用方的状态码保持一致。

use super::ProxyError;

/// 将 ProxyError 映射到 HTTP 状态码
///
/// 上游错误直接使用上游状态码，其余与 [`ProxyError::status_code`] 相同。
pub fn map_proxy_error_to_status(error: &ProxyError) -> u16 {
    error.status_code().as_u16()
}

/// 记录到状态与日志中的错误摘要；上游错误体最多保留 200 个字符
pub fn get_error_message(error: &ProxyError) -> String {
    match error {
        ProxyError::UpstreamError {
            status,
            body: Some(body),
        } => {
            let preview: String = body.chars().take(200).collect();
            format!("上游错误 ({status}): {preview}")
        }
        ProxyError::UpstreamError { status, body: None } => format!("上游错误 ({status})"),
        ProxyError::Timeout(msg) => format!("请求超时: {msg}"),
        ProxyError::ForwardFailed(msg) => format!("转发失败: {msg}"),
        ProxyError::TransformError(msg) => format!("请求/响应转换错误: {msg}"),
        _ => error.to_string(),
    }
}
