pub mod types;

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use types::{
    AfterToolCall, AgentEnd, BeforeAgentStart, BeforeToolCall, DispatchKind, HookAction,
    HookName, HookOutcome, HookPayload, MessageSending, MessageSent, SessionInfo,
};

pub const DEFAULT_PRIORITY: i32 = 0;

#[async_trait]
pub trait HookHandler: Send + Sync {
    fn name(&self) -> &str;
    async fn handle(&self, payload: &HookPayload) -> anyhow::Result<HookAction>;
}

#[derive(Clone)]
pub struct HookRegistration {
    pub hook: HookName,
    pub priority: i32,
    pub kind: DispatchKind,
    pub plugin_id: String,
    pub handler: Arc<dyn HookHandler>,
}

/// Collects registrations during startup.
#[derive(Default)]
pub struct HookPipelineBuilder {
    registrations: Vec<HookRegistration>,
}

impl HookPipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: HookName, handler: Arc<dyn HookHandler>, priority: i32) {
        self.register_for("core", hook, handler, priority);
    }

    pub fn register_for(
        &mut self,
        plugin_id: &str,
        hook: HookName,
        handler: Arc<dyn HookHandler>,
        priority: i32,
    ) {
        debug!(
            hook = hook.as_str(),
            priority,
            plugin = plugin_id,
            "Registered hook handler {}",
            handler.name()
        );
        self.registrations.push(HookRegistration {
            hook,
            priority,
            kind: hook.kind(),
            plugin_id: plugin_id.to_string(),
            handler,
        });
    }

    pub fn extend(&mut self, registrations: Vec<HookRegistration>) {
        for reg in registrations {
            self.register_for(&reg.plugin_id, reg.hook, reg.handler, reg.priority);
        }
    }

    /// Orders every hook's handlers by priority (stable, so equal priorities
    /// keep registration order) and seals the pipeline.
    pub fn freeze(self) -> Arc<HookPipeline> {
        let mut by_hook: HashMap<HookName, Vec<HookRegistration>> = HashMap::new();
        for reg in self.registrations {
            by_hook.entry(reg.hook).or_default().push(reg);
        }
        for regs in by_hook.values_mut() {
            regs.sort_by(|a, b| b.priority.cmp(&a.priority));
        }
        let total: usize = by_hook.values().map(Vec::len).sum();
        info!("Hook pipeline frozen with {} handler(s)", total);
        Arc::new(HookPipeline { by_hook })
    }
}

/// Staging area handed to a plugin. Nothing reaches the pipeline unless the
/// plugin finishes loading.
pub struct HookRegistrar {
    plugin_id: String,
    staged: Vec<HookRegistration>,
}

impl HookRegistrar {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            staged: Vec::new(),
        }
    }

    pub fn register(&mut self, hook: HookName, handler: Arc<dyn HookHandler>, priority: i32) {
        self.staged.push(HookRegistration {
            hook,
            priority,
            kind: hook.kind(),
            plugin_id: self.plugin_id.clone(),
            handler,
        });
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    pub fn into_registrations(self) -> Vec<HookRegistration> {
        self.staged
    }
}

/// Handles of detached void handlers; awaiting them is optional.
pub struct VoidDispatch {
    handles: Vec<JoinHandle<()>>,
}

impl VoidDispatch {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Immutable after `freeze`; shared by every conversation.
pub struct HookPipeline {
    by_hook: HashMap<HookName, Vec<HookRegistration>>,
}

impl HookPipeline {
    pub fn empty() -> Arc<Self> {
        HookPipelineBuilder::new().freeze()
    }

    pub fn handlers(&self, hook: HookName) -> &[HookRegistration] {
        self.by_hook.get(&hook).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Dispatch by the payload's hook kind. Void hooks are scheduled and the
    /// original payload is returned immediately.
    pub async fn dispatch(&self, payload: HookPayload) -> HookOutcome {
        match payload.hook_name().kind() {
            DispatchKind::Modifying => self.dispatch_modifying(payload).await,
            DispatchKind::Void => {
                self.dispatch_void(payload.clone());
                HookOutcome::Continue(payload)
            }
        }
    }

    pub async fn dispatch_modifying(&self, payload: HookPayload) -> HookOutcome {
        let hook = payload.hook_name();
        let mut current = payload;

        for reg in self.handlers(hook) {
            let result = AssertUnwindSafe(reg.handler.handle(&current))
                .catch_unwind()
                .await;
            match result {
                Ok(Ok(HookAction::Continue)) => {}
                Ok(Ok(HookAction::Replace(next))) => {
                    if next.hook_name() == hook {
                        current = next;
                    } else {
                        warn!(
                            hook = hook.as_str(),
                            "Handler {} returned a {} payload; ignoring rewrite",
                            reg.handler.name(),
                            next.hook_name()
                        );
                    }
                }
                Ok(Ok(HookAction::Block { reason, substitute })) => {
                    info!(
                        hook = hook.as_str(),
                        priority = reg.priority,
                        "Blocked by {}: {}",
                        reg.handler.name(),
                        reason
                    );
                    return HookOutcome::Block { reason, substitute };
                }
                Ok(Ok(HookAction::Cancel)) => {
                    info!(hook = hook.as_str(), "Cancelled by {}", reg.handler.name());
                    return HookOutcome::Cancel;
                }
                Ok(Err(e)) => {
                    warn!(
                        hook = hook.as_str(),
                        "Handler {} failed, skipping: {:#}",
                        reg.handler.name(),
                        e
                    );
                }
                Err(_) => {
                    warn!(
                        hook = hook.as_str(),
                        "Handler {} panicked, skipping",
                        reg.handler.name()
                    );
                }
            }
        }

        HookOutcome::Continue(current)
    }

    /// Spawns every handler for the hook in priority order and returns
    /// without waiting. Failures are logged, never propagated.
    pub fn dispatch_void(&self, payload: HookPayload) -> VoidDispatch {
        let hook = payload.hook_name();
        let handlers = self.handlers(hook);
        if handlers.is_empty() {
            return VoidDispatch { handles: Vec::new() };
        }

        let payload = Arc::new(payload);
        let handles = handlers
            .iter()
            .map(|reg| {
                let handler = reg.handler.clone();
                let payload = payload.clone();
                tokio::spawn(async move {
                    let result = AssertUnwindSafe(handler.handle(&payload))
                        .catch_unwind()
                        .await;
                    match result {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!(
                            hook = hook.as_str(),
                            "Handler {} failed: {:#}",
                            handler.name(),
                            e
                        ),
                        Err(_) => warn!(hook = hook.as_str(), "Handler {} panicked", handler.name()),
                    }
                })
            })
            .collect();
        VoidDispatch { handles }
    }
}
