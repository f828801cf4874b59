//! lexgate HTTP 服务
//!
//! 启动: cargo run --bin lexgate
//! 端口取 [server].port，环境变量 LEXGATE_PORT 优先

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use lexgate::config::load_config;
use lexgate::core::ShutdownManager;
use lexgate::web::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    lexgate::observability::init();

    // 可选：第一个参数为额外的配置文件
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path.clone()).context("Failed to load configuration")?;

    let components =
        lexgate::create_gateway_components(&cfg).context("Failed to build gateway components")?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let state = Arc::new(AppState::new(&components, config_path, shutdown.token()));
    let app = router(state);

    let port = std::env::var("LEXGATE_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(cfg.server.port);
    let addr: SocketAddr = format!("{}:{}", cfg.server.host, port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", cfg.server.host, port))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("lexgate listening on http://{}", addr);

    let signal = Arc::clone(&shutdown);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.wait_for_shutdown().await })
        .await
        .context("server error")?;

    tracing::info!("lexgate stopped");
    Ok(())
}
