use ai_gateway_lib::config::AppConfig;
use ai_gateway_lib::proxy::{BuiltinRegistry, ProxyEngine, ProxyServer};
use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};

/// 个人 AI API 网关
#[derive(Debug, Parser)]
#[command(name = "ai-gateway", version, about)]
struct Cli {
    /// 配置文件路径（默认 ~/.ai-gateway/config.json）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 监听地址，覆盖配置文件
    #[arg(long)]
    host: Option<String>,

    /// 监听端口，覆盖配置文件
    #[arg(short, long)]
    port: Option<u16>,

    /// 日志级别（trace / debug / info / warn / error），覆盖配置文件
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(AppConfig::default_path)
    }

    fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(host) = &self.host {
            config.settings.host = host.clone();
        }
        if let Some(port) = self.port {
            config.settings.port = port;
        }
        if let Some(level) = &self.log_level {
            config.settings.log_level = level.clone();
        }
    }

    fn load_config(&self, path: &Path) -> anyhow::Result<AppConfig> {
        let mut config = AppConfig::load(path)
            .with_context(|| format!("加载配置失败: {}", path.display()))?;
        self.apply_overrides(&mut config);
        Ok(config)
    }
}

/// RUST_LOG 优先，否则使用配置中的日志级别
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init()
        .ok();

    // 把 log 记录桥接到 tracing
    tracing_log::LogTracer::init().ok();
}

#[cfg(unix)]
async fn wait_for_shutdown(server: &ProxyServer, cli: &Cli, path: &Path) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            log::warn!("无法监听 SIGHUP，配置热重载不可用: {e}");
            tokio::signal::ctrl_c().await.ok();
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = hangup.recv() => {
                log::info!("收到 SIGHUP，重新加载配置: {}", path.display());
                match cli.load_config(path) {
                    Ok(config) => {
                        if let Err(e) = server.reload(config) {
                            log::error!("配置重载失败: {e}");
                        }
                    }
                    Err(e) => log::error!("{e:#}"),
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_server: &ProxyServer, _cli: &Cli, _path: &Path) {
    tokio::signal::ctrl_c().await.ok();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let path = cli.config_path();
    let config = cli.load_config(&path)?;

    init_logging(&config.settings.log_level);
    log::info!(
        "ai-gateway v{} (配置: {}, 渠道: {}, 令牌: {})",
        env!("CARGO_PKG_VERSION"),
        path.display(),
        config.channels.len(),
        config.tokens.len()
    );

    let engine = ProxyEngine::new(config, BuiltinRegistry::new()).context("初始化代理引擎失败")?;
    let server = ProxyServer::new(engine);
    let info = server.start().await.context("启动网关失败")?;
    log::info!("监听 http://{}:{}", info.address, info.port);

    let engine = server.state().engine();
    tokio::spawn(async move {
        for check in engine.check_channels().await {
            let name = check["name"].as_str().unwrap_or_default();
            if check["available"].as_bool() == Some(true) {
                log::info!("渠道 {name} 可用");
            } else {
                log::warn!("渠道 {name} 当前不可用");
            }
        }
    });

    wait_for_shutdown(&server, &cli, &path).await;

    log::info!("正在关闭网关...");
    server.stop().await.context("停止网关失败")?;
    Ok(())
}
