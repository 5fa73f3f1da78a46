//! 代理服务器模块
//!
//! 提供本地 HTTP 网关服务：三种协议格式互转、多渠道自适应限流与故障转移。

pub mod engine;
pub mod error;
pub mod error_mapper;
pub mod handler_context;
mod handlers;
pub mod http_client;
pub mod limiter;
pub mod log_codes;
pub mod provider_router;
pub mod providers;
pub mod response_processor;
pub mod server;
pub mod transform;
pub mod types;

// 公开导出给外部使用
pub use engine::{EngineStatus, ProxyEngine};
pub use error::ProxyError;
pub use limiter::{AdaptiveLimiter, LimitMode, LimiterStats, RateLimitConfig, RateLimiterManager};
pub use providers::{BuiltinClient, BuiltinRegistry, BuiltinReply, ChannelProvider};
pub use server::{build_router, ProxyServer, ProxyState};
pub use types::{ApiFormat, EndpointKind, ProxyServerInfo, ProxyStatus};
