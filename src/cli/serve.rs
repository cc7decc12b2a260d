use anyhow::Result;
use console::style;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

use super::runtime::build_runtime;
use crate::core::config::AppConfig;
use crate::core::lifecycle::LifecycleManager;
use crate::core::orchestrator::OutboundRouter;
use crate::core::scheduler::SystemClock;
use crate::core::scheduler::heartbeat::install_heartbeat;
use crate::core::terminal;
use crate::interfaces::tcp::{TcpClients, TcpServer, TcpTransport};
use crate::logging;

pub(crate) async fn run_serve(config: AppConfig) -> Result<()> {
    let log_tx = logging::init_logging(&config.log_level, false);
    terminal::print_banner();

    let clients = TcpClients::new();
    let mut router = OutboundRouter::new();
    router.add(Arc::new(TcpTransport::new(clients.clone())));

    let runtime = build_runtime(config, router).await?;
    let config = runtime.config.clone();

    let mut lifecycle = LifecycleManager::new().await?;
    let server = TcpServer::new(
        config.server.host.clone(),
        config.server.port,
        runtime.orchestrator.clone(),
        clients,
        log_tx,
        lifecycle.cancel_token(),
    );
    lifecycle.attach(Arc::new(Mutex::new(server)));

    let sink = runtime.orchestrator.sink();
    install_heartbeat(
        &lifecycle,
        Arc::new(SystemClock),
        sink.clone(),
        Duration::from_secs(config.scheduler.heartbeat_minutes.saturating_mul(60)),
        &config.scheduler.heartbeat_conversation,
    )
    .await?;

    lifecycle.start().await?;
    let scheduler_task = tokio::spawn(runtime.scheduler.clone().run(sink, lifecycle.cancel_token()));

    terminal::print_status("Data", &config.data_dir.display().to_string());
    terminal::print_status("Model", &config.llm.model);
    terminal::print_status(
        "Listening",
        &format!(
            "{}",
            style(format!("{}:{}", config.server.host, config.server.port)).underlined().cyan()
        ),
    );
    terminal::print_status("Tools", &runtime.orchestrator.tools().names().join(", "));
    println!(
        "\n  Press {} to stop.\n",
        style("Ctrl+C").bold().yellow()
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    lifecycle.shutdown().await?;
    let _ = scheduler_task.await;
    terminal::print_goodbye();
    Ok(())
}
