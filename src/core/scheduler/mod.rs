pub mod clock;
pub mod heartbeat;
pub mod job;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::Duration;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::memory::MemorySystem;
use crate::core::orchestrator::types::{Event, SCHEDULER_SOURCE};
pub use clock::{Clock, ManualClock, SystemClock};
pub use job::{Job, Trigger};

/// Where synthesized events go. The orchestrator is the production sink.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn submit(&self, event: Event) -> Result<()>;
}

/// Smallest pause between wakes, so a failing tick cannot spin.
const MIN_WAKE: std::time::Duration = std::time::Duration::from_millis(50);

pub struct Scheduler {
    db: Arc<MemorySystem>,
    clock: Arc<dyn Clock>,
    check_interval: std::time::Duration,
    wake: Notify,
}

impl Scheduler {
    pub fn new(db: Arc<MemorySystem>, clock: Arc<dyn Clock>, check_interval: std::time::Duration) -> Self {
        Self {
            db,
            clock,
            check_interval,
            wake: Notify::new(),
        }
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Persist a new job. It is on disk before this returns.
    pub async fn create_job(
        &self,
        conversation_id: &str,
        trigger: Trigger,
        payload: &str,
    ) -> Result<Job> {
        let now = self.clock.now();
        let next_fire_at = trigger
            .next_after(now)?
            .ok_or_else(|| anyhow!("fire time must be in the future"))?;
        if next_fire_at <= now {
            bail!("fire time {} is not after {}", next_fire_at, now);
        }

        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            trigger,
            payload: payload.to_string(),
            next_fire_at,
            last_fired_at: None,
            enabled: true,
            created_at: now,
        };
        self.db.insert_job(&job).await?;
        info!(
            job_id = %job.id,
            conversation = conversation_id,
            "Scheduled job {} (next fire {})",
            job.trigger.describe(),
            job.next_fire_at
        );
        self.wake.notify_one();
        Ok(job)
    }

    pub async fn schedule_delay(&self, conversation_id: &str, minutes: i64, payload: &str) -> Result<Job> {
        if minutes <= 0 {
            bail!("delay must be at least one minute");
        }
        let fire_at = Duration::try_minutes(minutes)
            .and_then(|delay| self.clock.now().checked_add_signed(delay))
            .ok_or_else(|| anyhow!("delay of {} minutes is too large", minutes))?;
        self.create_job(conversation_id, Trigger::Delay { fire_at }, payload).await
    }

    pub async fn list_jobs(&self, conversation_id: Option<&str>) -> Result<Vec<Job>> {
        self.db.list_jobs(conversation_id).await
    }

    /// Cancel a job, optionally only if it belongs to `conversation_id`.
    pub async fn cancel_job(&self, id: &str, conversation_id: Option<&str>) -> Result<bool> {
        if let Some(conv) = conversation_id {
            match self.db.get_job(id).await? {
                Some(job) if job.conversation_id == conv => {}
                _ => return Ok(false),
            }
        }
        let removed = self.db.delete_job(id).await?;
        if removed {
            info!(job_id = id, "Cancelled job");
        }
        Ok(removed)
    }

    pub async fn clear_jobs(&self, conversation_id: Option<&str>) -> Result<usize> {
        let n = self.db.delete_jobs(conversation_id).await?;
        info!("Cleared {} job(s)", n);
        Ok(n)
    }

    /// After a restart, recurring jobs resume from their last persisted fire
    /// (or creation) time. A slot missed while down fires once on the next
    /// tick; one-shot jobs keep their stored time.
    pub async fn recover(&self) -> Result<usize> {
        let mut adjusted = 0;
        for job in self.db.list_jobs(None).await? {
            if !job.trigger.is_recurring() {
                continue;
            }
            match job.trigger.next_after(job.anchor()) {
                Ok(Some(next)) if next != job.next_fire_at => {
                    self.db.reschedule_job(&job.id, next).await?;
                    adjusted += 1;
                }
                Ok(_) => {}
                Err(e) => warn!(job_id = %job.id, "Cannot recompute next fire: {}", e),
            }
        }
        if adjusted > 0 {
            info!("Recovered {} recurring job(s)", adjusted);
        }
        Ok(adjusted)
    }

    fn job_event(job: &Job, now: chrono::DateTime<chrono::Utc>) -> Event {
        Event::new(SCHEDULER_SOURCE, &job.conversation_id, SCHEDULER_SOURCE, &job.payload)
            .with_data(json!({
                "job_id": job.id,
                "label": job.trigger.label(),
                "recurring": job.trigger.is_recurring(),
            }))
            .at(now)
    }

    /// Fire every due job once. Each job's post-fire state is persisted
    /// before its event is submitted, so a crash in between can lose that
    /// fire but never repeat it.
    pub async fn tick(&self, sink: &dyn EventSink) -> Result<Vec<Event>> {
        let now = self.clock.now();
        let due = self.db.due_jobs(now).await?;
        let mut fired = Vec::with_capacity(due.len());

        for job in due {
            let next = if job.trigger.is_recurring() {
                match job.trigger.next_after(now) {
                    Ok(Some(next)) if next <= now => {
                        warn!(job_id = %job.id, "Retiring job whose next fire {} is not after {}", next, now);
                        None
                    }
                    Ok(next) => next,
                    Err(e) => {
                        warn!(job_id = %job.id, "Retiring job with unusable trigger: {}", e);
                        None
                    }
                }
            } else {
                None
            };

            match next {
                Some(next) => {
                    self.db.record_job_fire(&job.id, now, next).await?;
                }
                None => {
                    self.db.delete_job(&job.id).await?;
                }
            }

            info!(
                job_id = %job.id,
                conversation = %job.conversation_id,
                retired = next.is_none(),
                "Job fired"
            );
            let event = Self::job_event(&job, now);
            if let Err(e) = sink.submit(event.clone()).await {
                error!(job_id = %job.id, "Failed to submit scheduled event: {:#}", e);
            }
            fired.push(event);
        }
        Ok(fired)
    }

    async fn next_wake_delay(&self) -> std::time::Duration {
        let earliest = match self.db.earliest_fire_time().await {
            Ok(t) => t,
            Err(e) => {
                warn!("Could not read next fire time: {}", e);
                None
            }
        };
        match earliest {
            Some(t) => (t - self.clock.now())
                .to_std()
                .unwrap_or_default()
                .clamp(MIN_WAKE, self.check_interval.max(MIN_WAKE)),
            None => self.check_interval,
        }
    }

    /// Background timer: wakes at the earliest fire time, after the check
    /// interval, or when a job is created.
    pub async fn run(self: Arc<Self>, sink: Arc<dyn EventSink>, cancel: CancellationToken) {
        info!("Scheduler loop started");
        if let Err(e) = self.recover().await {
            error!("Scheduler recovery failed: {:#}", e);
        }
        loop {
            if let Err(e) = self.tick(sink.as_ref()).await {
                error!("Scheduler tick failed: {:#}", e);
            }
            let delay = self.next_wake_delay().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                _ = self.wake.notified() => {}
            }
        }
        info!("Scheduler loop stopped");
    }
}
