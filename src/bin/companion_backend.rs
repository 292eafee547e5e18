use std::sync::Arc;

use anyhow::{Context, Result};
use companion_backend::config::CompanionConfig;
use companion_backend::runtime::CompanionRuntime;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,companion_backend=debug")),
        )
        .init();

    let config = CompanionConfig::load();
    let runtime = Arc::new(
        CompanionRuntime::bootstrap(config).context("failed to bootstrap companion runtime")?,
    );

    let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    rt.block_on(async move {
        if runtime.spawn_telegram_notifier()?.is_none() {
            tracing::info!("Telegram notifier disabled (set TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID)");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = tokio::spawn(runtime.build_scheduler().run(shutdown_rx));

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?;
        tracing::info!("Shutdown requested");
        let _ = shutdown_tx.send(true);
        scheduler.await.context("scheduler task panicked")?;

        runtime.log_monitoring_report()
    })
}
