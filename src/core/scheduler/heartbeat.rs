use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{Clock, EventSink};
use crate::core::lifecycle::LifecycleManager;
use crate::core::orchestrator::types::{Event, HEARTBEAT_SOURCE};

pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";

pub const HEARTBEAT_PROMPT: &str = "This is a periodic heartbeat check. If there's anything \
important to proactively share with the user (e.g., completed background tasks, reminders, or \
relevant updates), please say it. Otherwise, respond with just 'HEARTBEAT_OK' and nothing else.";

pub fn heartbeat_event(clock: &dyn Clock, conversation_id: &str) -> Event {
    Event::new(HEARTBEAT_SOURCE, conversation_id, HEARTBEAT_SOURCE, HEARTBEAT_PROMPT).at(clock.now())
}

/// Register the fixed-interval heartbeat on the lifecycle's job scheduler.
/// It runs regardless of any persisted jobs. A zero interval disables it.
pub async fn install_heartbeat(
    lifecycle: &LifecycleManager,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    every: Duration,
    conversation_id: &str,
) -> Result<()> {
    if every.is_zero() {
        info!("Heartbeat disabled");
        return Ok(());
    }

    let conversation_id = conversation_id.to_string();
    let job = tokio_cron_scheduler::Job::new_repeated_async(
        every,
        move |_uuid, _l| {
            let clock = clock.clone();
            let sink = sink.clone();
            let conversation_id = conversation_id.clone();
            Box::pin(async move {
                info!("Heartbeat firing for {}", conversation_id);
                let event = heartbeat_event(clock.as_ref(), &conversation_id);
                if let Err(e) = sink.submit(event).await {
                    warn!("Heartbeat submit failed: {:#}", e);
                }
            })
        },
    )?;
    lifecycle.scheduler.add(job).await?;
    info!("Heartbeat scheduled every {}s", every.as_secs());
    Ok(())
}
