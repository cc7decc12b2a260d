use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::types::OutboundMessage;

const BACKOFF_STEP: Duration = Duration::from_millis(200);

#[async_trait]
pub trait Transport: Send + Sync {
    /// Conversation ids of the form `<id>:...` are routed here.
    fn id(&self) -> &str;
    async fn deliver(&self, message: &OutboundMessage) -> Result<()>;
}

/// Picks a transport by the `conversation_id` prefix, falling back to the
/// default one.
#[derive(Default, Clone)]
pub struct OutboundRouter {
    transports: HashMap<String, Arc<dyn Transport>>,
    default: Option<Arc<dyn Transport>>,
}

impl OutboundRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first transport added also becomes the default.
    pub fn add(&mut self, transport: Arc<dyn Transport>) {
        if self.default.is_none() {
            self.default = Some(transport.clone());
        }
        info!("Registered transport '{}'", transport.id());
        self.transports.insert(transport.id().to_string(), transport);
    }

    pub fn route(&self, conversation_id: &str) -> Option<Arc<dyn Transport>> {
        conversation_id
            .split_once(':')
            .and_then(|(prefix, _)| self.transports.get(prefix))
            .or(self.default.as_ref())
            .cloned()
    }

    /// Deliver with up to `attempts` tries and a linear backoff between them.
    pub async fn deliver(&self, message: &OutboundMessage, attempts: usize) -> Result<()> {
        let transport = self
            .route(&message.conversation_id)
            .ok_or_else(|| anyhow!("no transport for conversation {}", message.conversation_id))?;

        let attempts = attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match transport.deliver(message).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        transport = transport.id(),
                        conversation = %message.conversation_id,
                        attempt,
                        "Delivery failed: {:#}",
                        e
                    );
                    last_err = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(BACKOFF_STEP * attempt as u32).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("delivery failed")))
    }
}
