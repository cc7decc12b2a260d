use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

/// Per-conversation FIFO lanes. Holding the guard means owning the
/// conversation; tokio's mutex queues waiters fairly, so events for one
/// conversation run in arrival order.
#[derive(Default)]
pub struct ConversationLanes {
    lanes: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConversationLanes {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, conversation_id: &str) -> OwnedMutexGuard<()> {
        let lane = {
            let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
            // Idle lanes are only referenced by the map.
            lanes.retain(|id, lane| id == conversation_id || Arc::strong_count(lane) > 1);
            lanes
                .entry(conversation_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lane.lock_owned().await
    }

    pub fn active(&self) -> usize {
        self.lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_conversation_is_exclusive() {
        let lanes = Arc::new(ConversationLanes::new());
        let guard = lanes.acquire("c1").await;

        let lanes2 = lanes.clone();
        let waiter = tokio::spawn(async move {
            let _g = lanes2.acquire("c1").await;
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        // Another conversation is not held up.
        let _other = lanes.acquire("c2").await;

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn idle_lanes_are_pruned() {
        let lanes = ConversationLanes::new();
        drop(lanes.acquire("a").await);
        drop(lanes.acquire("b").await);
        let _c = lanes.acquire("c").await;
        assert_eq!(lanes.active(), 1);
    }
}
