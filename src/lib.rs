//! AI API 网关
//!
//! 接收 OpenAI / Anthropic / Gemini 三种格式的请求，转发到配置的上游渠道，
//! 并以调用方的原始格式返回（含流式响应）。

pub mod config;
pub mod error;
pub mod proxy;

pub use config::{AppConfig, ChannelConfig, ChannelType, GatewaySettings, TokenConfig};
pub use error::AppError;
