//! 代理模块日志错误码定义
//!
//! 格式: [模块-编号] 消息
//! - LIM: Limiter (并发限制器)
//! - SEL: Selection (渠道选择)
//! - SRV: Server (服务器)
//! - FWD: Forwarder (转发)
//! - RSP: Response (响应处理)

/// 并发限制器日志码
pub mod lim {
    pub const LIMIT_DECREASED_ERRORS: &str = "LIM-001";
    pub const LIMIT_DECREASED_SLOW: &str = "LIM-002";
    pub const LIMIT_INCREASED: &str = "LIM-003";
    pub const MODE_CHANGED: &str = "LIM-004";
    pub const STATS_RESET: &str = "LIM-005";
}

/// 渠道选择日志码
pub mod sel {
    pub const NO_CANDIDATES: &str = "SEL-001";
    pub const ALL_SATURATED: &str = "SEL-002";
    pub const UNHEALTHY: &str = "SEL-003";
}

/// 服务器日志码
pub mod srv {
    pub const STARTED: &str = "SRV-001";
    pub const STOPPED: &str = "SRV-002";
    pub const RELOADED: &str = "SRV-003";
    pub const TASK_ERROR: &str = "SRV-004";
}

/// 转发日志码
pub mod fwd {
    pub const CHANNEL_FAILED_RETRY: &str = "FWD-001";
    pub const ALL_CHANNELS_FAILED: &str = "FWD-002";
    pub const AUTH_REJECTED: &str = "FWD-003";
    pub const CONNECT_RETRY: &str = "FWD-004";
}

/// 响应处理日志码
pub mod rsp {
    pub const BUILD_STREAM_ERROR: &str = "RSP-001";
    pub const READ_BODY_ERROR: &str = "RSP-002";
    pub const BUILD_RESPONSE_ERROR: &str = "RSP-003";
    pub const STREAM_ERROR: &str = "RSP-004";
    pub const DECODE_SKIPPED: &str = "RSP-005";
}
