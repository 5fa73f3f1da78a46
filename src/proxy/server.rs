//! HTTP代理服务器
//!
//! 基于Axum的HTTP服务器，负责路由注册与生命周期（启动 / 停止 / 热重载）。

use super::{
    engine::{EngineStatus, ProxyEngine},
    handlers,
    log_codes::srv as log_srv,
    types::{ProxyServerInfo, ProxyStatus},
    ProxyError,
};
use crate::config::{AppConfig, GatewaySettings};
use axum::{
    http::HeaderValue,
    routing::{any, get, post},
    Router,
};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};

/// 代理服务器状态（共享）
///
/// 引擎在重载时整体替换；处理器在请求开始时取一份引用，
/// 进行中的请求继续使用旧引擎直到结束。
#[derive(Clone)]
pub struct ProxyState {
    engine: Arc<RwLock<Arc<ProxyEngine>>>,
    start_time: Arc<RwLock<Option<Instant>>>,
}

impl ProxyState {
    pub fn new(engine: ProxyEngine) -> Self {
        Self {
            engine: Arc::new(RwLock::new(Arc::new(engine))),
            start_time: Arc::new(RwLock::new(None)),
        }
    }

    /// 当前生效的引擎
    pub fn engine(&self) -> Arc<ProxyEngine> {
        match self.engine.read() {
            Ok(guard) => guard.clone(),
            Err(e) => e.into_inner().clone(),
        }
    }

    fn replace_engine(&self, engine: ProxyEngine) {
        let engine = Arc::new(engine);
        match self.engine.write() {
            Ok(mut guard) => *guard = engine,
            Err(e) => *e.into_inner() = engine,
        }
    }

    fn set_start_time(&self, value: Option<Instant>) {
        match self.start_time.write() {
            Ok(mut guard) => *guard = value,
            Err(e) => *e.into_inner() = value,
        }
    }

    fn uptime_seconds(&self) -> u64 {
        let start = match self.start_time.read() {
            Ok(guard) => *guard,
            Err(e) => *e.into_inner(),
        };
        start.map(|s| s.elapsed().as_secs()).unwrap_or(0)
    }

    /// 状态快照（含运行时间）
    pub fn status(&self) -> EngineStatus {
        let mut status = self.engine().status();
        status.status.uptime_seconds = self.uptime_seconds();
        status
    }

    fn update_status(&self, f: impl FnOnce(&mut ProxyStatus)) {
        let handle = self.engine().status_handle();
        match handle.write() {
            Ok(mut guard) => f(&mut guard),
            Err(e) => f(&mut e.into_inner()),
        };
    }
}

/// 构建 CORS 层；`*` 表示允许任意来源
fn build_cors(settings: &GatewaySettings) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if settings.cors_origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = settings
        .cors_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(e) => {
                log::warn!("忽略无效的 CORS 来源 '{o}': {e}");
                None
            }
        })
        .collect();
    layer.allow_origin(origins)
}

/// 构建路由
pub fn build_router(state: ProxyState) -> Router {
    let settings = state.engine().config().settings.clone();

    let router = Router::new()
        // 健康检查
        .route("/health", get(handlers::health_check))
        .route("/status", get(handlers::get_status))
        // OpenAI API
        .route("/v1/models", get(handlers::list_models))
        .route(
            "/v1/chat/completions",
            post(handlers::handle_chat_completions),
        )
        .route("/v1/completions", post(handlers::handle_passthrough))
        .route("/v1/embeddings", post(handlers::handle_passthrough))
        .route("/v1/images/generations", post(handlers::handle_passthrough))
        .route("/v1/audio/speech", post(handlers::handle_passthrough))
        .route(
            "/v1/audio/transcriptions",
            post(handlers::handle_passthrough),
        )
        // Claude API
        .route("/v1/messages", post(handlers::handle_messages))
        // Gemini API
        .route("/v1beta/models/*rest", post(handlers::handle_gemini))
        // 其余 /v1 路径原样透传
        .route("/v1/*path", any(handlers::handle_passthrough));

    let router = if settings.enable_cors {
        router.layer(build_cors(&settings))
    } else {
        router
    };
    router.with_state(state)
}

/// 代理HTTP服务器
pub struct ProxyServer {
    state: ProxyState,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyServer {
    pub fn new(engine: ProxyEngine) -> Self {
        Self {
            state: ProxyState::new(engine),
            shutdown_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &ProxyState {
        &self.state
    }

    pub async fn is_running(&self) -> bool {
        self.shutdown_tx.lock().await.is_some()
    }

    pub async fn start(&self) -> Result<ProxyServerInfo, ProxyError> {
        let mut shutdown_slot = self.shutdown_tx.lock().await;
        // 检查是否已在运行
        if shutdown_slot.is_some() {
            return Err(ProxyError::AlreadyRunning);
        }

        let settings = self.state.engine().config().settings.clone();

        // 绑定监听器
        let listener = tokio::net::TcpListener::bind((settings.host.as_str(), settings.port))
            .await
            .map_err(|e| {
                ProxyError::BindFailed(format!("{}:{} ({e})", settings.host, settings.port))
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ProxyError::BindFailed(e.to_string()))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let app = build_router(self.state.clone());

        log::info!(
            "[{}] 网关启动于 {} ({} 个渠道)",
            log_srv::STARTED,
            local_addr,
            self.state.engine().channels().len()
        );

        *shutdown_slot = Some(shutdown_tx);
        self.state.set_start_time(Some(Instant::now()));
        self.state.update_status(|s| {
            s.running = true;
            s.address = local_addr.ip().to_string();
            s.port = local_addr.port();
        });

        // 启动服务器
        let state = self.state.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
            {
                log::error!("[{}] 服务器异常退出: {e}", log_srv::TASK_ERROR);
            }

            // 服务器停止后更新状态
            state.update_status(|s| s.running = false);
            state.set_start_time(None);
        });
        *self.task.lock().await = Some(handle);

        Ok(ProxyServerInfo {
            address: local_addr.ip().to_string(),
            port: local_addr.port(),
            started_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// 停止服务并等待进行中的连接结束
    pub async fn stop(&self) -> Result<(), ProxyError> {
        let Some(tx) = self.shutdown_tx.lock().await.take() else {
            return Err(ProxyError::NotRunning);
        };
        let _ = tx.send(());

        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                log::error!("[{}] 等待服务器任务结束失败: {e}", log_srv::TASK_ERROR);
            }
        }
        log::info!("[{}] 网关已停止", log_srv::STOPPED);
        Ok(())
    }

    /// 用新配置替换引擎，不中断监听
    ///
    /// 限制器状态与统计计数沿用；监听地址与 CORS 设置需重启后生效。
    pub fn reload(&self, config: AppConfig) -> Result<(), ProxyError> {
        let engine = self.state.engine().reload(config)?;
        let channels = engine.channels().len();
        self.state.replace_engine(engine);
        log::info!("[{}] 配置已重载 ({} 个渠道)", log_srv::RELOADED, channels);
        Ok(())
    }

    pub fn get_status(&self) -> EngineStatus {
        self.state.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelConfig, ChannelType};
    use crate::proxy::providers::BuiltinRegistry;

    fn config(port: u16) -> AppConfig {
        let mut config = AppConfig::default();
        config.settings.host = "127.0.0.1".to_string();
        config.settings.port = port;
        config.channels.push(ChannelConfig::new(
            1,
            "local",
            ChannelType::Openai,
            "http://127.0.0.1:9",
        ));
        config
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let engine = ProxyEngine::new(config(0), BuiltinRegistry::new()).unwrap();
        let server = ProxyServer::new(engine);

        let info = server.start().await.unwrap();
        assert_ne!(info.port, 0);
        assert!(server.is_running().await);
        assert!(server.get_status().status.running);
        assert!(matches!(server.start().await, Err(ProxyError::AlreadyRunning)));

        server.stop().await.unwrap();
        assert!(!server.is_running().await);
        assert!(!server.get_status().status.running);
        assert!(matches!(server.stop().await, Err(ProxyError::NotRunning)));
    }

    #[tokio::test]
    async fn test_reload_keeps_limiters_for_remaining_channels() {
        let engine = ProxyEngine::new(config(0), BuiltinRegistry::new()).unwrap();
        let server = ProxyServer::new(engine);
        assert_eq!(server.get_status().limiters.len(), 1);

        let mut next = config(0);
        next.channels.push(ChannelConfig::new(
            2,
            "second",
            ChannelType::Custom,
            "http://127.0.0.1:9",
        ));
        server.reload(next).unwrap();
        assert_eq!(server.state().engine().channels().len(), 2);
        assert_eq!(server.get_status().limiters.len(), 2);

        server.reload(AppConfig::default()).unwrap();
        assert_eq!(server.get_status().limiters.len(), 0);
    }

    #[tokio::test]
    async fn test_reload_rebuilds_proxied_clients() {
        let mut proxied = config(0);
        proxied.channels[0].proxy_url = Some("http://127.0.0.1:7890".to_string());
        let engine = ProxyEngine::new(proxied, BuiltinRegistry::new()).unwrap();
        let server = ProxyServer::new(engine);
        let before = server.state().engine().clients().clone();
        assert_eq!(before.proxied_count(), 1);

        server.reload(config(0)).unwrap();
        let after = server.state().engine().clients().clone();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.proxied_count(), 0);
    }
}
