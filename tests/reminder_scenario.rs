use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use std::sync::{Arc, Mutex};

use squidbot::core::config::AppConfig;
use squidbot::core::llm::embedding::HashEmbedder;
use squidbot::core::llm::{ChatRole, Completion, CompletionRequest, LlmProvider, ModelToolCall};
use squidbot::core::memory::{MemoryStore, MemorySystem};
use squidbot::core::orchestrator::{
    Event, HandleOutcome, Orchestrator, OrchestratorSettings, OutboundMessage, OutboundRouter, Role,
    Transport,
};
use squidbot::core::scheduler::{ManualClock, Scheduler, Trigger};
use squidbot::plugins::{self, PluginContext};

/// Schedules a reminder when asked, acknowledges the tool result, and
/// nudges the user when the reminder comes back.
struct ReminderModel;

#[async_trait]
impl LlmProvider for ReminderModel {
    fn name(&self) -> &str {
        "reminder-model"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let last = request.messages.last().map(|m| (m.role, m.content.clone()));
        Ok(match last {
            Some((ChatRole::Tool, result)) => {
                assert!(result.starts_with("Reminder set for 1 minutes"), "{}", result);
                Completion::text("Okay, I'll remind you in a minute.")
            }
            Some((ChatRole::User, text)) if text.starts_with("[Reminder]") => {
                Completion::text("Time to drink some water!")
            }
            _ => Completion::tools(vec![ModelToolCall {
                id: "call_1".into(),
                name: "cron_create".into(),
                arguments: json!({"message": "drink water", "delay_minutes": 1}),
            }]),
        })
    }
}

#[derive(Default)]
struct Outbox(Mutex<Vec<OutboundMessage>>);

#[async_trait]
impl Transport for Outbox {
    fn id(&self) -> &str {
        "outbox"
    }

    async fn deliver(&self, message: &OutboundMessage) -> Result<()> {
        self.0.lock().unwrap().push(message.clone());
        Ok(())
    }
}

#[tokio::test]
async fn remind_me_in_one_minute() {
    let dir = tempfile::tempdir().unwrap();
    let start = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(start));

    let db = Arc::new(MemorySystem::new(dir.path()).await.unwrap());
    let memory = Arc::new(MemoryStore::new(db.clone(), Arc::new(HashEmbedder::new(64))));
    let scheduler = Arc::new(Scheduler::new(db.clone(), clock.clone(), std::time::Duration::from_secs(1)));
    let config = AppConfig {
        data_dir: dir.path().to_path_buf(),
        ..AppConfig::default()
    };
    let ctx = PluginContext {
        memory: memory.clone(),
        scheduler: scheduler.clone(),
        config: Arc::new(config),
    };
    let candidates = ["scheduler", "memory", "audit"]
        .iter()
        .map(|name| Ok(plugins::builtin(name).unwrap()))
        .collect();
    let loaded = plugins::load_plugins(candidates, &ctx);
    assert!(loaded.failures.is_empty());
    assert!(loaded.tools.contains("cron_create"));

    let outbox = Arc::new(Outbox::default());
    let mut router = OutboundRouter::new();
    router.add(outbox.clone());
    let orchestrator = Arc::new(Orchestrator::new(
        OrchestratorSettings::default(),
        Arc::new(ReminderModel),
        loaded.tools,
        loaded.hooks,
        db.clone(),
        memory,
        router,
    ));

    let outcome = orchestrator
        .handle_event(Event::new("test", "c1", "alice", "remind me in 1 minute to drink water").at(start))
        .await;
    match outcome {
        HandleOutcome::Delivered(message) => assert_eq!(message.text, "Okay, I'll remind you in a minute."),
        other => panic!("unexpected outcome {:?}", other),
    }

    let jobs = scheduler.list_jobs(Some("c1")).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].payload, "drink water");
    assert_eq!(
        jobs[0].trigger,
        Trigger::Delay {
            fire_at: start + Duration::minutes(1)
        }
    );

    // Not due yet.
    clock.advance(Duration::seconds(30));
    let sink = orchestrator.sink();
    assert!(scheduler.tick(sink.as_ref()).await.unwrap().is_empty());

    clock.advance(Duration::seconds(31));
    let fired = scheduler.tick(sink.as_ref()).await.unwrap();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].prompt_text(), "[Reminder] drink water");

    let mut reminder = None;
    for _ in 0..200 {
        if let Some(m) = outbox.0.lock().unwrap().get(1).cloned() {
            reminder = Some(m);
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let reminder = reminder.expect("reminder was never delivered");
    assert_eq!(reminder.conversation_id, "c1");
    assert_eq!(reminder.text, "Time to drink some water!");
    assert!(reminder.proactive);

    // One-shot jobs retire after firing, and do not fire again.
    assert!(scheduler.list_jobs(Some("c1")).await.unwrap().is_empty());
    clock.advance(Duration::minutes(5));
    assert!(scheduler.tick(sink.as_ref()).await.unwrap().is_empty());

    // The reminder exchange is appended after the original one. Wait for
    // the lane to finish writing it.
    let mut turns = Vec::new();
    for _ in 0..200 {
        turns = db.session_turns("c1").await.unwrap();
        if turns.len() >= 6 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let roles: Vec<Role> = turns.iter().map(|t| t.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant, Role::User, Role::Assistant]
    );
    assert_eq!(turns[4].content, "[Reminder] drink water");
    assert_eq!(turns[5].content, "Time to drink some water!");
}
