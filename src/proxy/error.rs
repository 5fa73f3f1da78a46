use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("服务器已在运行")]
    AlreadyRunning,

    #[error("服务器未运行")]
    NotRunning,

    #[error("地址绑定失败: {0}")]
    BindFailed(String),

    #[error("请求转发失败: {0}")]
    ForwardFailed(String),

    #[error("没有可用的渠道: {0}")]
    NoAvailableChannel(String),

    #[error("所有渠道并发已满: {0}")]
    ChannelsSaturated(String),

    #[error("上游错误 (状态码 {status}): {body:?}")]
    UpstreamError { status: u16, body: Option<String> },

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("格式转换错误: {0}")]
    TransformError(String),

    #[error("无效的请求: {0}")]
    InvalidRequest(String),

    #[error("超时: {0}")]
    Timeout(String),

    #[error("流式响应错误: {0}")]
    StreamError(String),

    /// 认证错误
    #[error("认证失败: {0}")]
    AuthError(String),

    /// 令牌无权访问
    #[error("权限不足: {0}")]
    Forbidden(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl ProxyError {
    /// 认证类错误（本地或上游 401/403），不参与故障转移
    pub fn is_auth_error(&self) -> bool {
        match self {
            ProxyError::AuthError(_) | ProxyError::Forbidden(_) => true,
            ProxyError::UpstreamError { status, .. } => *status == 401 || *status == 403,
            _ => false,
        }
    }

    /// 决定故障转移行为与是否计入渠道统计
    pub fn category(&self) -> ErrorCategory {
        match self {
            _ if self.is_auth_error() => ErrorCategory::NonRetryable,
            ProxyError::InvalidRequest(_) | ProxyError::TransformError(_) => {
                ErrorCategory::ClientError
            }
            _ => ErrorCategory::Retryable,
        }
    }

    /// 错误体中的 `type` 字段
    fn error_type(&self) -> &'static str {
        match self {
            ProxyError::AuthError(_) => "authentication_error",
            ProxyError::Forbidden(_) => "permission_error",
            ProxyError::InvalidRequest(_) | ProxyError::TransformError(_) => {
                "invalid_request_error"
            }
            ProxyError::NoAvailableChannel(_) | ProxyError::ChannelsSaturated(_) => {
                "service_unavailable"
            }
            ProxyError::ForwardFailed(_)
            | ProxyError::Timeout(_)
            | ProxyError::StreamError(_)
            | ProxyError::UpstreamError { .. } => "upstream_error",
            ProxyError::Internal(_) => "internal_error",
            _ => "proxy_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::UpstreamError { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyError::AlreadyRunning => StatusCode::CONFLICT,
            ProxyError::NotRunning => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::BindFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::ForwardFailed(_) => StatusCode::BAD_GATEWAY,
            ProxyError::NoAvailableChannel(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::ChannelsSaturated(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::TransformError(_) => StatusCode::BAD_REQUEST,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::StreamError(_) => StatusCode::BAD_GATEWAY,
            ProxyError::AuthError(_) => StatusCode::UNAUTHORIZED,
            ProxyError::Forbidden(_) => StatusCode::FORBIDDEN,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 构造统一的错误体 `{"error": {"message", "type"}}`
    ///
    /// 上游返回 JSON 错误体时直接透传。
    pub fn to_error_body(&self) -> Value {
        if let ProxyError::UpstreamError {
            status,
            body: upstream_body,
        } = self
        {
            return match upstream_body {
                Some(body_str) => match serde_json::from_str::<Value>(body_str) {
                    // 上游返回的是 JSON，直接透传
                    Ok(json_body) => json_body,
                    Err(_) => json!({
                        "error": {
                            "message": body_str,
                            "type": "upstream_error",
                        }
                    }),
                },
                None => json!({
                    "error": {
                        "message": format!("Upstream error (status {status})"),
                        "type": "upstream_error",
                    }
                }),
            };
        }

        json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
            }
        })
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.to_error_body())).into_response()
    }
}

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 可重试错误：释放槽位、排除当前渠道后尝试下一个
    Retryable,
    /// 不可重试错误（认证失败）
    NonRetryable,
    /// 调用方请求本身有误：直接返回，不重试也不计入渠道统计
    ClientError,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Retryable => "retryable",
            ErrorCategory::NonRetryable => "non_retryable",
            ErrorCategory::ClientError => "client_error",
        }
    }
}

/// 将 reqwest 错误转换为 ProxyError
pub fn from_reqwest(error: reqwest::Error) -> ProxyError {
    if error.is_timeout() {
        ProxyError::Timeout(format!("请求超时: {error}"))
    } else if error.is_connect() {
        ProxyError::ForwardFailed(format!("连接失败: {error}"))
    } else {
        ProxyError::ForwardFailed(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_errors_not_retryable() {
        assert!(ProxyError::AuthError("x".into()).is_auth_error());
        assert!(ProxyError::Forbidden("x".into()).is_auth_error());
        assert!(ProxyError::UpstreamError {
            status: 403,
            body: None
        }
        .is_auth_error());
        assert_eq!(
            ProxyError::UpstreamError {
                status: 401,
                body: None
            }
            .category(),
            ErrorCategory::NonRetryable
        );
    }

    #[test]
    fn test_other_errors_retryable() {
        assert_eq!(
            ProxyError::UpstreamError {
                status: 500,
                body: None
            }
            .category(),
            ErrorCategory::Retryable
        );
        assert_eq!(
            ProxyError::Timeout("t".into()).category(),
            ErrorCategory::Retryable
        );
        assert_eq!(
            ProxyError::UpstreamError {
                status: 429,
                body: None
            }
            .category(),
            ErrorCategory::Retryable
        );
    }

    #[test]
    fn test_malformed_request_is_client_error() {
        assert_eq!(
            ProxyError::TransformError("messages 必须是数组".into()).category(),
            ErrorCategory::ClientError
        );
        assert_eq!(
            ProxyError::InvalidRequest("x".into()).category(),
            ErrorCategory::ClientError
        );
        assert_eq!(ErrorCategory::ClientError.as_str(), "client_error");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ProxyError::AuthError("x".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ProxyError::InvalidRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::NoAvailableChannel("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyError::UpstreamError {
                status: 418,
                body: None
            }
            .status_code(),
            StatusCode::IM_A_TEAPOT
        );
    }

    #[test]
    fn test_upstream_json_body_passthrough() {
        let err = ProxyError::UpstreamError {
            status: 400,
            body: Some(r#"{"error":{"message":"bad","type":"invalid_request_error"}}"#.into()),
        };
        let body = err.to_error_body();
        assert_eq!(body["error"]["message"], "bad");
    }

    #[test]
    fn test_upstream_text_body_wrapped() {
        let err = ProxyError::UpstreamError {
            status: 502,
            body: Some("gateway down".into()),
        };
        let body = err.to_error_body();
        assert_eq!(body["error"]["message"], "gateway down");
        assert_eq!(body["error"]["type"], "upstream_error");
    }

    #[test]
    fn test_local_error_body() {
        let body = ProxyError::AuthError("无效的令牌".into()).to_error_body();
        assert_eq!(body["error"]["type"], "authentication_error");
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("无效的令牌"));
    }
}
