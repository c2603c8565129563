//! Ridecast - Telegram → WhatsApp 群发中继
//!
//! 入口：初始化日志与配置、打开注册表、启动连接监管器与状态机，
//! 最后把适配器与探针路由合并进一个 HTTP 服务。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;

use ridecast::adapter::{self, AdapterState, WebhookAdapter};
use ridecast::bot::{RelayEngine, SessionPolicy};
use ridecast::config::load_config;
use ridecast::probe::{self, ProbeState};
use ridecast::registry::SqliteRegistry;
use ridecast::supervisor::{ConnectionSupervisor, LinkEvent};
use ridecast::observability;
use ridecast::transport::LoopbackTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config = load_config(None).context("Failed to load config")?;
    config.validate().context("Invalid configuration")?;

    let registry = Arc::new(
        SqliteRegistry::open(&config.database.path, config.app.default_send_rate_ms)
            .context("Failed to open registry database")?,
    );

    // 传输层通过这条通道上报生命周期事件，监管器单循环消费
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(LoopbackTransport::new(event_tx));
    let supervisor = ConnectionSupervisor::spawn(transport, event_rx, &config.link);

    // 配对凭证等链路事件记入日志，供操作员查看
    let mut link_events = supervisor.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = link_events.recv().await {
            match event {
                LinkEvent::Challenge(challenge) => {
                    tracing::info!(%challenge, "pairing challenge issued, confirm downstream");
                }
                LinkEvent::RetriesExhausted => {
                    tracing::error!("automatic reconnects exhausted, trigger reset manually");
                }
                _ => {}
            }
        }
    });

    supervisor
        .connect()
        .await
        .context("Initial downstream connect failed")?;

    let adapter_out = Arc::new(WebhookAdapter::new(config.adapter.reply_url.clone()));
    let engine = Arc::new(RelayEngine::new(
        registry.clone(),
        Arc::clone(&supervisor),
        adapter_out,
        SessionPolicy {
            capacity: config.sessions.capacity,
            idle_timeout: Duration::from_secs(config.sessions.idle_timeout_secs),
        },
        config.app.allowed_operators.clone(),
    ));

    // 定期清理空闲会话
    let cleaner = Arc::clone(&engine);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let removed = cleaner.cleanup_sessions().await;
            if removed > 0 {
                tracing::debug!(removed, "expired sessions cleaned");
            }
        }
    });

    let app = adapter::create_router(AdapterState { engine })
        .merge(probe::create_router(ProbeState::new(supervisor, registry)));

    let addr = format!("0.0.0.0:{}", config.app.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(%addr, "ridecast listening");
    axum::serve(listener, app).await.context("Server failed")?;

    Ok(())
}
