use std::time::Duration;

use super::fixtures::*;
use crate::core::hooks::HookPipeline;
use crate::core::llm::Completion;
use crate::core::orchestrator::types::Event;
use crate::core::orchestrator::{HandleOutcome, Role};

#[tokio::test]
async fn concurrent_events_in_one_conversation_are_serialized() {
    let llm = ScriptedLlm::new(|req, _| Ok(Completion::text(format!("ack {}", last_user_text(req)))))
        .with_delay(Duration::from_millis(15));
    let h = harness(llm, no_tools(), HookPipeline::empty(), settings());

    let handles: Vec<_> = (0..5)
        .map(|i| h.orchestrator.spawn_event(Event::new("test", "c1", "u", format!("msg {}", i))))
        .collect();
    for handle in handles {
        assert!(matches!(handle.await.unwrap(), HandleOutcome::Delivered(_)));
    }

    let turns = h.db.session_turns("c1").await.unwrap();
    assert_eq!(turns.len(), 10);
    assert!(turns.windows(2).all(|w| w[0].seq < w[1].seq));
    // Each user turn is immediately followed by its own answer.
    for pair in turns.chunks(2) {
        assert_eq!(pair[0].role, Role::User);
        assert_eq!(pair[1].role, Role::Assistant);
        assert_eq!(pair[1].content, format!("ack {}", pair[0].content));
    }
}

#[tokio::test]
async fn distinct_conversations_run_in_parallel() {
    let llm = ScriptedLlm::replying("ok").with_delay(Duration::from_millis(200));
    let h = harness(llm, no_tools(), HookPipeline::empty(), settings());

    let started = std::time::Instant::now();
    let handles: Vec<_> = (0..4)
        .map(|i| h.orchestrator.spawn_event(Event::new("test", format!("c{}", i), "u", "hi")))
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }
    assert!(started.elapsed() < Duration::from_millis(700), "{:?}", started.elapsed());
}
