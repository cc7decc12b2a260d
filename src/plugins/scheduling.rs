use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

use super::{Plugin, PluginContext, PluginManifest};
use crate::core::scheduler::{Job, Scheduler, Trigger};
use crate::core::tools::{Tool, ToolContext};

/// Lets the model schedule work for its own conversation.
pub struct SchedulerPlugin {
    manifest: PluginManifest,
}

impl SchedulerPlugin {
    pub fn new() -> Self {
        Self {
            manifest: PluginManifest::builtin(
                "scheduler",
                "Scheduler",
                "Reminders, interval tasks and cron jobs",
            ),
        }
    }
}

impl Plugin for SchedulerPlugin {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    fn tools(&self, ctx: &PluginContext) -> Result<Vec<Arc<dyn Tool>>> {
        let s = ctx.scheduler.clone();
        Ok(vec![
            Arc::new(CronCreate(s.clone())),
            Arc::new(CronList(s.clone())),
            Arc::new(CronDelete(s.clone())),
            Arc::new(CronClear(s)),
        ])
    }
}

/// One year, the longest reminder or repeat period the tools accept.
const MAX_DELAY_MINUTES: i64 = 525_600;
const MAX_INTERVAL_SECONDS: i64 = 31_536_000;

/// Reads an integer argument. Models often send whole numbers as `1.0`.
fn whole_number(args: &Value, key: &str) -> Result<Option<i64>> {
    let Some(value) = args.get(key).filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    if let Some(n) = value.as_i64() {
        return Ok(Some(n));
    }
    match value.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(Some(f as i64)),
        _ => bail!("{} must be a whole number", key),
    }
}

struct CronCreate(Arc<Scheduler>);

#[async_trait]
impl Tool for CronCreate {
    fn name(&self) -> &str {
        "cron_create"
    }
    fn description(&self) -> &str {
        "Create a scheduled task. When it triggers, you will be asked to carry out the message \
         (using tools if needed) and your answer is sent to the user. Give exactly one of \
         delay_minutes, interval_seconds or cron_expression."
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "Task or reminder to act on when triggered (e.g. 'drink water')"
                },
                "delay_minutes": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": MAX_DELAY_MINUTES,
                    "description": "Minutes from now, for one-time reminders"
                },
                "interval_seconds": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": MAX_INTERVAL_SECONDS,
                    "description": "Repeat every N seconds"
                },
                "cron_expression": {
                    "type": "string",
                    "description": "Cron expression in UTC, e.g. '0 9 * * *' for daily at 9am"
                }
            },
            "required": ["message"]
        })
    }
    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value> {
        let message = args["message"].as_str().unwrap_or_default().trim();
        if message.is_empty() {
            bail!("message must not be empty");
        }
        let delay = whole_number(&args, "delay_minutes")?;
        let interval = whole_number(&args, "interval_seconds")?
            .map(|n| u64::try_from(n).map_err(|_| anyhow!("interval_seconds must be positive")))
            .transpose()?;
        let cron = args.get("cron_expression").and_then(Value::as_str);

        let reply = match (delay, interval, cron) {
            (Some(minutes), None, None) => {
                let job = self.0.schedule_delay(&ctx.conversation_id, minutes, message).await?;
                format!("Reminder set for {} minutes from now (id={}): {}", minutes, job.id, message)
            }
            (None, Some(seconds), None) => {
                let job = self
                    .0
                    .create_job(&ctx.conversation_id, Trigger::Interval { seconds }, message)
                    .await?;
                format!("Interval task scheduled every {} seconds (id={}): {}", seconds, job.id, message)
            }
            (None, None, Some(expression)) => {
                let job = self
                    .0
                    .create_job(&ctx.conversation_id, Trigger::cron(expression)?, message)
                    .await?;
                format!(
                    "Recurring task scheduled with cron '{}' (id={}): {}",
                    expression.trim(),
                    job.id,
                    message
                )
            }
            (None, None, None) => bail!("must specify delay_minutes, interval_seconds, or cron_expression"),
            _ => bail!("specify only one of delay_minutes, interval_seconds, cron_expression"),
        };
        Ok(json!(reply))
    }
}

fn describe_job(job: &Job) -> String {
    let when = match &job.trigger {
        Trigger::Delay { fire_at } => format!("At {}", fire_at.format("%Y-%m-%d %H:%M UTC")),
        Trigger::Interval { seconds } => format!("Every {}s", seconds),
        Trigger::Cron { expression } => format!("Cron {}", expression),
    };
    let status = if job.enabled { "enabled" } else { "disabled" };
    format!("- [{}] {} | {}: {}", job.id, status, when, job.payload)
}

struct CronList(Arc<Scheduler>);

#[async_trait]
impl Tool for CronList {
    fn name(&self) -> &str {
        "cron_list"
    }
    fn description(&self) -> &str {
        "List the scheduled reminders and tasks of this conversation."
    }
    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }
    async fn call(&self, _args: Value, ctx: &ToolContext) -> Result<Value> {
        let jobs = self.0.list_jobs(Some(&ctx.conversation_id)).await?;
        if jobs.is_empty() {
            return Ok(json!("No scheduled tasks."));
        }
        let mut lines = vec![format!("Scheduled tasks ({}):", jobs.len())];
        lines.extend(jobs.iter().map(describe_job));
        Ok(json!(lines.join("\n")))
    }
}

struct CronDelete(Arc<Scheduler>);

#[async_trait]
impl Tool for CronDelete {
    fn name(&self) -> &str {
        "cron_delete"
    }
    fn description(&self) -> &str {
        "Delete a scheduled task by ID. Use cron_list first to see job IDs. Use cron_clear to delete all of them."
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "job_id": { "type": "string", "description": "ID of the job to delete" }
            },
            "required": ["job_id"]
        })
    }
    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value> {
        let id = args["job_id"]
            .as_str()
            .ok_or_else(|| anyhow!("job_id must be a string"))?;
        if self.0.cancel_job(id, Some(&ctx.conversation_id)).await? {
            Ok(json!(format!("Deleted job id={}", id)))
        } else {
            Ok(json!(format!("No job found with id={}", id)))
        }
    }
}

struct CronClear(Arc<Scheduler>);

#[async_trait]
impl Tool for CronClear {
    fn name(&self) -> &str {
        "cron_clear"
    }
    fn description(&self) -> &str {
        "Delete all scheduled tasks of this conversation."
    }
    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }
    async fn call(&self, _args: Value, ctx: &ToolContext) -> Result<Value> {
        match self.0.clear_jobs(Some(&ctx.conversation_id)).await? {
            0 => Ok(json!("No scheduled tasks to clear.")),
            n => Ok(json!(format!("Cleared all {} scheduled task(s).", n))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tools::{ToolErrorKind, ToolRegistry, ToolRegistryBuilder};
    use crate::plugins::test_context;
    use std::time::Duration;

    fn registry() -> Arc<ToolRegistry> {
        let mut builder = ToolRegistryBuilder::new();
        builder
            .register_all(SchedulerPlugin::new().tools(&test_context()).unwrap())
            .unwrap();
        builder.freeze()
    }

    fn conv(id: &str) -> ToolContext {
        ToolContext {
            conversation_id: id.into(),
            ..ToolContext::default()
        }
    }

    const T: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn create_list_delete_in_one_conversation() {
        let tools = registry();
        let reply = tools
            .invoke("cron_create", json!({"message": "drink water", "delay_minutes": 1}), &conv("c1"), T)
            .await
            .unwrap();
        let reply = reply.as_str().unwrap();
        assert!(reply.starts_with("Reminder set for 1 minutes from now (id="), "{}", reply);
        assert!(reply.ends_with(": drink water"));

        tools
            .invoke("cron_create", json!({"message": "stretch", "cron_expression": "0 9 * * *"}), &conv("c1"), T)
            .await
            .unwrap();
        tools
            .invoke("cron_create", json!({"message": "other", "interval_seconds": 60}), &conv("c2"), T)
            .await
            .unwrap();

        let listed = tools.invoke("cron_list", json!({}), &conv("c1"), T).await.unwrap();
        let listed = listed.as_str().unwrap();
        assert!(listed.starts_with("Scheduled tasks (2):"), "{}", listed);
        assert!(listed.contains("Cron 0 9 * * *: stretch"));
        assert!(!listed.contains("other"));

        let cleared = tools.invoke("cron_clear", json!({}), &conv("c1"), T).await.unwrap();
        assert_eq!(cleared, json!("Cleared all 2 scheduled task(s)."));
        let listed = tools.invoke("cron_list", json!({}), &conv("c2"), T).await.unwrap();
        assert!(listed.as_str().unwrap().contains("Every 60s: other"));
    }

    #[tokio::test]
    async fn delete_is_scoped_to_the_caller() {
        let tools = registry();
        tools
            .invoke("cron_create", json!({"message": "x", "interval_seconds": 30}), &conv("c2"), T)
            .await
            .unwrap();
        let listed = tools.invoke("cron_list", json!({}), &conv("c2"), T).await.unwrap();
        let id = listed
            .as_str()
            .unwrap()
            .lines()
            .nth(1)
            .and_then(|l| l.strip_prefix("- ["))
            .and_then(|l| l.split(']').next())
            .unwrap()
            .to_string();

        let denied = tools.invoke("cron_delete", json!({"job_id": id}), &conv("c1"), T).await.unwrap();
        assert_eq!(denied, json!(format!("No job found with id={}", id)));
        let deleted = tools.invoke("cron_delete", json!({"job_id": id}), &conv("c2"), T).await.unwrap();
        assert_eq!(deleted, json!(format!("Deleted job id={}", id)));
    }

    #[tokio::test]
    async fn bad_requests_are_rejected() {
        let tools = registry();
        let none = tools.invoke("cron_create", json!({"message": "x"}), &conv("c1"), T).await;
        assert_eq!(none.unwrap_err().kind, ToolErrorKind::Fault);

        let both = tools
            .invoke("cron_create", json!({"message": "x", "delay_minutes": 1, "interval_seconds": 5}), &conv("c1"), T)
            .await;
        assert!(both.is_err());

        let bad_cron = tools
            .invoke("cron_create", json!({"message": "x", "cron_expression": "every tuesday"}), &conv("c1"), T)
            .await;
        assert!(bad_cron.unwrap_err().message.contains("invalid cron expression"));

        let zero = tools
            .invoke("cron_create", json!({"message": "x", "delay_minutes": 0}), &conv("c1"), T)
            .await;
        assert_eq!(zero.unwrap_err().kind, ToolErrorKind::ValidationError);

        let fractional = tools
            .invoke("cron_create", json!({"message": "x", "delay_minutes": 1.5}), &conv("c1"), T)
            .await;
        assert_eq!(fractional.unwrap_err().kind, ToolErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn whole_floats_are_accepted_as_integers() {
        let tools = registry();
        let reply = tools
            .invoke("cron_create", json!({"message": "drink water", "delay_minutes": 1.0}), &conv("c1"), T)
            .await
            .unwrap();
        assert!(reply.as_str().unwrap().starts_with("Reminder set for 1 minutes"), "{}", reply);

        let reply = tools
            .invoke("cron_create", json!({"message": "ping", "interval_seconds": 30.0}), &conv("c1"), T)
            .await
            .unwrap();
        assert!(reply.as_str().unwrap().starts_with("Interval task scheduled every 30 seconds"));
    }

    #[tokio::test]
    async fn periods_beyond_a_year_are_rejected() {
        let tools = registry();
        for args in [
            json!({"message": "x", "interval_seconds": u64::MAX}),
            json!({"message": "x", "interval_seconds": 9_223_372_036_854_775_808u64}),
            json!({"message": "x", "delay_minutes": MAX_DELAY_MINUTES + 1}),
        ] {
            let err = tools.invoke("cron_create", args, &conv("c1"), T).await.unwrap_err();
            assert_eq!(err.kind, ToolErrorKind::ValidationError);
        }
        let listed = tools.invoke("cron_list", json!({}), &conv("c1"), T).await.unwrap();
        assert_eq!(listed, json!("No scheduled tasks."));
    }

    #[test]
    fn whole_number_reads_ints_and_whole_floats() {
        let args = json!({"a": 3, "b": 2.0, "c": 2.5, "d": null});
        assert_eq!(whole_number(&args, "a").unwrap(), Some(3));
        assert_eq!(whole_number(&args, "b").unwrap(), Some(2));
        assert!(whole_number(&args, "c").is_err());
        assert_eq!(whole_number(&args, "d").unwrap(), None);
        assert_eq!(whole_number(&args, "missing").unwrap(), None);
    }
}
