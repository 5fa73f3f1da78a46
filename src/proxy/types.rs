use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::ProxyError;

/// API 格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiFormat {
    #[serde(rename = "openai")]
    OpenAI,
    Anthropic,
    Gemini,
}

impl ApiFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiFormat::OpenAI => "openai",
            ApiFormat::Anthropic => "anthropic",
            ApiFormat::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for ApiFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ApiFormat {
    type Err = ProxyError;

    /// `ollama` / `custom` 属于 OpenAI 兼容格式
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" | "ollama" | "custom" => Ok(ApiFormat::OpenAI),
            "anthropic" | "claude" => Ok(ApiFormat::Anthropic),
            "gemini" | "google" => Ok(ApiFormat::Gemini),
            other => Err(ProxyError::TransformError(format!("不支持的格式: {other}"))),
        }
    }
}

/// 请求端点类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointKind {
    /// 对话补全（可跨格式转换）
    Chat,
    Completions,
    Embeddings,
    ImagesGenerations,
    AudioSpeech,
    AudioTranscriptions,
    /// 其他 `/v1/...` 路径（去掉 `/v1` 前缀后的部分）
    Other(String),
}

impl EndpointKind {
    /// 根据 `/v1/...` 请求路径识别端点
    pub fn from_path(path: &str) -> Self {
        let trimmed = path.trim_end_matches('/');
        let rest = trimmed.strip_prefix("/v1").unwrap_or(trimmed);
        match rest {
            "/chat/completions" => EndpointKind::Chat,
            "/completions" => EndpointKind::Completions,
            "/embeddings" => EndpointKind::Embeddings,
            "/images/generations" => EndpointKind::ImagesGenerations,
            "/audio/speech" => EndpointKind::AudioSpeech,
            "/audio/transcriptions" => EndpointKind::AudioTranscriptions,
            other => EndpointKind::Other(other.to_string()),
        }
    }

    /// OpenAI 兼容上游的相对路径（不含版本前缀）
    pub fn openai_path(&self) -> &str {
        match self {
            EndpointKind::Chat => "/chat/completions",
            EndpointKind::Completions => "/completions",
            EndpointKind::Embeddings => "/embeddings",
            EndpointKind::ImagesGenerations => "/images/generations",
            EndpointKind::AudioSpeech => "/audio/speech",
            EndpointKind::AudioTranscriptions => "/audio/transcriptions",
            EndpointKind::Other(path) => path.as_str(),
        }
    }

    pub fn is_chat(&self) -> bool {
        matches!(self, EndpointKind::Chat)
    }
}

/// 代理服务器状态
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProxyStatus {
    /// 是否运行中
    pub running: bool,
    /// 监听地址
    pub address: String,
    /// 监听端口
    pub port: u16,
    /// 总请求数
    pub total_requests: u64,
    /// 成功请求数
    pub success_requests: u64,
    /// 失败请求数
    pub failed_requests: u64,
    /// 成功率 (0-100)
    pub success_rate: f32,
    /// 运行时间（秒）
    pub uptime_seconds: u64,
    /// 最近一次承接请求的渠道
    pub current_channel: Option<String>,
    pub current_channel_id: Option<u32>,
    /// 最后一次请求时间
    pub last_request_at: Option<String>,
    /// 最后一次错误信息
    pub last_error: Option<String>,
    /// 渠道故障转移次数
    pub failover_count: u64,
}

impl ProxyStatus {
    pub fn record_result(&mut self, success: bool) {
        self.total_requests += 1;
        if success {
            self.success_requests += 1;
        } else {
            self.failed_requests += 1;
        }
        self.success_rate =
            (self.success_requests as f64 / self.total_requests as f64 * 100.0) as f32;
        self.last_request_at = Some(chrono::Utc::now().to_rfc3339());
    }
}

/// 代理服务器信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyServerInfo {
    pub address: String,
    pub port: u16,
    pub started_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_format_from_str() {
        assert_eq!("OpenAI".parse::<ApiFormat>().unwrap(), ApiFormat::OpenAI);
        assert_eq!("ollama".parse::<ApiFormat>().unwrap(), ApiFormat::OpenAI);
        assert_eq!("claude".parse::<ApiFormat>().unwrap(), ApiFormat::Anthropic);
        assert_eq!("gemini".parse::<ApiFormat>().unwrap(), ApiFormat::Gemini);
        assert!("cohere".parse::<ApiFormat>().is_err());
    }

    #[test]
    fn test_api_format_serde() {
        let json = serde_json::to_string(&ApiFormat::OpenAI).unwrap();
        assert_eq!(json, "\"openai\"");
        let parsed: ApiFormat = serde_json::from_str("\"anthropic\"").unwrap();
        assert_eq!(parsed, ApiFormat::Anthropic);
    }

    #[test]
    fn test_endpoint_from_path() {
        assert_eq!(
            EndpointKind::from_path("/v1/chat/completions"),
            EndpointKind::Chat
        );
        assert_eq!(
            EndpointKind::from_path("/v1/embeddings/"),
            EndpointKind::Embeddings
        );
        assert_eq!(
            EndpointKind::from_path("/v1/moderations"),
            EndpointKind::Other("/moderations".to_string())
        );
        assert_eq!(
            EndpointKind::from_path("/v1/moderations").openai_path(),
            "/moderations"
        );
    }

    #[test]
    fn test_status_success_rate() {
        let mut status = ProxyStatus::default();
        status.record_result(true);
        status.record_result(false);
        assert_eq!(status.total_requests, 2);
        assert!((status.success_rate - 50.0).abs() < f32::EPSILON);
        assert!(status.last_request_at.is_some());
    }
}
