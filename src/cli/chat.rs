use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use super::runtime::{build_runtime, open_scheduler};
use crate::core::config::AppConfig;
use crate::core::memory::MemorySystem;
use crate::core::orchestrator::{Event, HandleOutcome, OutboundMessage, OutboundRouter, Transport};
use crate::core::terminal;
use crate::logging;

pub(crate) const CLI_CONVERSATION: &str = "cli:local";

/// Prints replies to the terminal.
struct ConsoleTransport;

#[async_trait]
impl Transport for ConsoleTransport {
    fn id(&self) -> &str {
        "cli"
    }

    async fn deliver(&self, message: &OutboundMessage) -> Result<()> {
        terminal::print_reply(&message.text);
        Ok(())
    }
}

/// One in-process turn on the local CLI conversation.
pub(crate) async fn run_chat(config: AppConfig, message: String) -> Result<()> {
    logging::init_logging(&config.log_level, true);

    let mut router = OutboundRouter::new();
    router.add(Arc::new(ConsoleTransport));
    let runtime = build_runtime(config, router).await?;

    let event = Event::new("cli", CLI_CONVERSATION, whoami(), message);
    match runtime.orchestrator.handle_event(event).await {
        HandleOutcome::Delivered(_) => {}
        HandleOutcome::NoOp => terminal::print_info("Nothing to say."),
        HandleOutcome::Blocked { reason } => terminal::print_warn(&format!("Blocked: {}", reason)),
        HandleOutcome::DeliveryFailed { error, .. } => terminal::print_error(&error),
        HandleOutcome::Failed { error, .. } => terminal::print_error(&error),
    }
    Ok(())
}

pub(crate) async fn run_jobs(config: AppConfig) -> Result<()> {
    logging::init_logging(&config.log_level, true);
    let db = Arc::new(MemorySystem::new(&config.data_dir).await?);
    let scheduler = open_scheduler(&config, db);

    let jobs = scheduler.list_jobs(None).await?;
    if jobs.is_empty() {
        terminal::print_info("No scheduled jobs.");
        return Ok(());
    }
    terminal::print_info(&format!("Scheduled jobs ({}):", jobs.len()));
    for job in jobs {
        let next = if job.enabled {
            job.next_fire_at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
        } else {
            "never (disabled)".to_string()
        };
        terminal::print_job(
            &job.id,
            &format!("{} [{}]", job.trigger.describe(), job.conversation_id),
            &next,
            &job.payload,
        );
    }
    Ok(())
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "local".to_string())
}
