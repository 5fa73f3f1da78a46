//! 网关配置
//!
//! 渠道、令牌与全局设置均为只读快照，由配置文件加载后交给 ProxyEngine 使用。
//! 支持 JSON（默认）与 TOML 两种格式，按文件扩展名区分。

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::AppError;
use crate::proxy::types::ApiFormat;

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_gateway_timeout() -> u64 {
    120
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_priority() -> i32 {
    1
}

fn default_channel_timeout() -> u64 {
    60
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_min_concurrency() -> u32 {
    1
}

fn default_max_adaptive_concurrency() -> u32 {
    100
}

fn default_response_time_low() -> f64 {
    1.0
}

fn default_response_time_high() -> f64 {
    5.0
}

fn default_error_rate_threshold() -> f64 {
    0.1
}

/// 渠道类型
///
/// `ollama` 与 `custom` 均按 OpenAI 兼容协议处理；
/// `builtin` 表示进程内的内置客户端。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Openai,
    Anthropic,
    Gemini,
    Ollama,
    Custom,
    Builtin,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Openai => "openai",
            ChannelType::Anthropic => "anthropic",
            ChannelType::Gemini => "gemini",
            ChannelType::Ollama => "ollama",
            ChannelType::Custom => "custom",
            ChannelType::Builtin => "builtin",
        }
    }

    /// 上游使用的协议格式
    pub fn api_format(&self) -> ApiFormat {
        match self {
            ChannelType::Anthropic => ApiFormat::Anthropic,
            ChannelType::Gemini => ApiFormat::Gemini,
            ChannelType::Openai | ChannelType::Ollama | ChannelType::Custom | ChannelType::Builtin => {
                ApiFormat::OpenAI
            }
        }
    }

    /// 是否为 OpenAI 兼容的 HTTP 渠道（可透传非对话端点）
    pub fn is_openai_compatible(&self) -> bool {
        matches!(
            self,
            ChannelType::Openai | ChannelType::Ollama | ChannelType::Custom
        )
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 上游渠道配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: u32,
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    /// 支持的模型列表，为空表示支持全部模型
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 数值越小优先级越高
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// 请求超时（秒）
    #[serde(default = "default_channel_timeout")]
    pub timeout: u64,
    /// 连接失败时在本渠道上的重试次数（0 表示直接交给故障转移）
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// 出站代理，如 `http://127.0.0.1:7890` 或 `socks5://127.0.0.1:1080`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    /// 内置客户端名称（glm / kimi / deepseek / qwen / minimax）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builtin_provider: Option<String>,

    /// 固定并发上限；为空或 0 时启用自适应模式
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,
    #[serde(default = "default_min_concurrency")]
    pub min_concurrency: u32,
    #[serde(default = "default_max_adaptive_concurrency")]
    pub max_adaptive_concurrency: u32,
    /// 低于该平均响应时间（秒）时尝试提升并发
    #[serde(default = "default_response_time_low")]
    pub response_time_low: f64,
    /// 高于该平均响应时间（秒）时降低并发
    #[serde(default = "default_response_time_high")]
    pub response_time_high: f64,
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
}

impl ChannelConfig {
    /// 创建一个使用默认调优参数的渠道
    pub fn new(id: u32, name: &str, channel_type: ChannelType, base_url: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            channel_type,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: String::new(),
            models: Vec::new(),
            enabled: true,
            priority: default_priority(),
            timeout: default_channel_timeout(),
            max_retries: 0,
            retry_backoff_ms: default_retry_backoff_ms(),
            proxy_url: None,
            builtin_provider: None,
            max_concurrency: None,
            min_concurrency: default_min_concurrency(),
            max_adaptive_concurrency: default_max_adaptive_concurrency(),
            response_time_low: default_response_time_low(),
            response_time_high: default_response_time_high(),
            error_rate_threshold: default_error_rate_threshold(),
        }
    }

    /// 去掉末尾斜杠后的 base_url
    pub fn base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// 是否支持指定模型（大小写不敏感）
    pub fn supports_model(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m.eq_ignore_ascii_case(model))
    }

    /// 高可用模式下的替换模型：渠道模型列表的第一项
    pub fn substitute_model(&self) -> Option<&str> {
        self.models.first().map(|s| s.as_str())
    }
}

/// 访问令牌
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub id: u32,
    pub name: String,
    pub key: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 允许使用的渠道 ID，为空表示不限制
    #[serde(default)]
    pub allowed_channels: Vec<u32>,
    /// 允许使用的模型，为空表示不限制
    #[serde(default)]
    pub allowed_models: Vec<String>,
}

impl TokenConfig {
    pub fn allows_channel(&self, channel_id: u32) -> bool {
        self.allowed_channels.is_empty() || self.allowed_channels.contains(&channel_id)
    }

    pub fn allows_model(&self, model: &str) -> bool {
        self.allowed_models.is_empty()
            || self
                .allowed_models
                .iter()
                .any(|m| m.eq_ignore_ascii_case(model))
    }
}

/// 网关全局设置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_true")]
    pub require_auth: bool,
    /// 默认超时（秒），用作阻塞获取并发槽位的等待上限
    #[serde(default = "default_gateway_timeout")]
    pub default_timeout: u64,
    #[serde(default = "default_true")]
    pub enable_fallback: bool,
    #[serde(default = "default_true")]
    pub enable_cors: bool,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
    /// 高可用模式：任何已启用渠道都可承接请求，模型替换为渠道的首个模型
    #[serde(default)]
    pub high_availability_mode: bool,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            require_auth: true,
            default_timeout: default_gateway_timeout(),
            enable_fallback: true,
            enable_cors: true,
            cors_origins: default_cors_origins(),
            high_availability_mode: false,
        }
    }
}

/// 完整配置快照
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub settings: GatewaySettings,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

impl AppConfig {
    /// 默认配置文件路径：`~/.ai-gateway/config.json`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ai-gateway")
            .join("config.json")
    }

    /// 从文件加载配置；文件不存在时返回默认配置
    pub fn load(path: &Path) -> Result<Self, AppError> {
        if !path.exists() {
            log::warn!("配置文件不存在，使用默认配置: {}", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| AppError::io(path, e))?;
        let mut config: AppConfig = if is_toml(path) {
            toml::from_str(&content).map_err(|e| AppError::toml(path, e))?
        } else {
            serde_json::from_str(&content).map_err(|e| AppError::json(path, e))?
        };

        config.normalize();
        config.validate()?;

        log::info!(
            "已加载配置: {} ({} 个渠道, {} 个令牌)",
            path.display(),
            config.channels.len(),
            config.tokens.len()
        );
        Ok(config)
    }

    /// 以格式化 JSON 写回文件
    pub fn save(&self, path: &Path) -> Result<(), AppError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| AppError::io(parent, e))?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| AppError::json(path, e))?;
        fs::write(path, content).map_err(|e| AppError::io(path, e))
    }

    fn normalize(&mut self) {
        for channel in &mut self.channels {
            let trimmed = channel.base_url.trim_end_matches('/').to_string();
            channel.base_url = trimmed;
        }
    }

    /// 校验配置的一致性
    pub fn validate(&self) -> Result<(), AppError> {
        let mut seen = HashSet::new();
        for channel in &self.channels {
            if !seen.insert(channel.id) {
                return Err(AppError::Config(format!("渠道 ID 重复: {}", channel.id)));
            }
            match channel.channel_type {
                ChannelType::Builtin => {
                    if channel.builtin_provider.as_deref().unwrap_or("").is_empty() {
                        return Err(AppError::Config(format!(
                            "内置渠道 {} 缺少 builtin_provider",
                            channel.name
                        )));
                    }
                }
                _ => {
                    if channel.base_url.is_empty() {
                        return Err(AppError::Config(format!(
                            "渠道 {} 缺少 base_url",
                            channel.name
                        )));
                    }
                }
            }
            if channel.min_concurrency == 0 {
                return Err(AppError::Config(format!(
                    "渠道 {} 的 min_concurrency 必须大于 0",
                    channel.name
                )));
            }
            if channel.max_adaptive_concurrency < channel.min_concurrency {
                return Err(AppError::Config(format!(
                    "渠道 {} 的 max_adaptive_concurrency 小于 min_concurrency",
                    channel.name
                )));
            }
        }

        let mut token_keys = HashSet::new();
        for token in &self.tokens {
            if !token_keys.insert(token.key.as_str()) {
                return Err(AppError::Config(format!("令牌重复: {}", token.name)));
            }
        }
        Ok(())
    }

    /// 已启用渠道，按优先级升序
    pub fn enabled_channels(&self) -> Vec<&ChannelConfig> {
        let mut channels: Vec<&ChannelConfig> =
            self.channels.iter().filter(|c| c.enabled).collect();
        channels.sort_by_key(|c| c.priority);
        channels
    }

    /// 支持指定模型的已启用渠道
    pub fn channels_for_model(&self, model: &str) -> Vec<&ChannelConfig> {
        self.enabled_channels()
            .into_iter()
            .filter(|c| c.supports_model(model))
            .collect()
    }

    pub fn channel(&self, id: u32) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.id == id)
    }

    /// 校验令牌，返回匹配且已启用的令牌
    pub fn validate_token(&self, key: &str) -> Option<&TokenConfig> {
        self.tokens.iter().find(|t| t.enabled && t.key == key)
    }

    /// 已启用渠道声明的全部模型（去重、排序）
    pub fn all_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self
            .enabled_channels()
            .iter()
            .flat_map(|c| c.models.iter().cloned())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        models.sort();
        models
    }

    pub fn next_channel_id(&self) -> u32 {
        self.channels.iter().map(|c| c.id).max().unwrap_or(0) + 1
    }

    pub fn next_token_id(&self) -> u32 {
        self.tokens.iter().map(|t| t.id).max().unwrap_or(0) + 1
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("toml"))
        .unwrap_or(false)
}
