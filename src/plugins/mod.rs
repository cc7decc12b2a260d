mod audit;
mod consolidation;
mod heartbeat;
mod memory;
mod safety;
mod scheduling;
pub mod script;

use anyhow::Result;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::config::AppConfig;
use crate::core::hooks::{HookPipeline, HookPipelineBuilder, HookRegistrar};
use crate::core::memory::MemoryStore;
use crate::core::scheduler::Scheduler;
use crate::core::tools::{RegistryError, Tool, ToolRegistry, ToolRegistryBuilder};

pub use audit::AuditPlugin;
pub use consolidation::ConsolidationPlugin;
pub use heartbeat::HeartbeatPlugin;
pub use memory::MemoryPlugin;
pub use safety::{POLICY_VIOLATION, SafetyPlugin};
pub use scheduling::SchedulerPlugin;
pub use script::ScriptPlugin;

pub const MANIFEST_FILE: &str = "manifest.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PluginManifest {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub author: String,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

impl PluginManifest {
    pub fn builtin(id: &str, name: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            author: "squidbot".to_string(),
        }
    }
}

/// Services a plugin may capture while loading.
#[derive(Clone)]
pub struct PluginContext {
    pub memory: Arc<MemoryStore>,
    pub scheduler: Arc<Scheduler>,
    pub config: Arc<AppConfig>,
}

/// Static capability interface. Plugins are listed by name in config; there
/// is no runtime discovery beyond script manifests.
pub trait Plugin: Send + Sync {
    fn manifest(&self) -> &PluginManifest;

    fn tools(&self, _ctx: &PluginContext) -> Result<Vec<Arc<dyn Tool>>> {
        Ok(Vec::new())
    }

    fn register_hooks(&self, _ctx: &PluginContext, _registrar: &mut HookRegistrar) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PluginLoadError {
    #[error("unknown plugin '{0}'")]
    Unknown(String),
    #[error("duplicate plugin id '{0}'")]
    Duplicate(String),
    #[error("plugin '{id}' failed to load: {message}")]
    Failed { id: String, message: String },
    #[error("plugin '{id}' rejected: {source}")]
    Conflict {
        id: String,
        #[source]
        source: RegistryError,
    },
    #[error("bad manifest {path}: {message}")]
    Manifest { path: String, message: String },
}

pub fn builtin(name: &str) -> Option<Box<dyn Plugin>> {
    let plugin: Box<dyn Plugin> = match name {
        "memory" => Box::new(MemoryPlugin::new()),
        "scheduler" => Box::new(SchedulerPlugin::new()),
        "safety" => Box::new(SafetyPlugin::new()),
        "audit" => Box::new(AuditPlugin::new()),
        "heartbeat" => Box::new(HeartbeatPlugin::new()),
        "consolidation" => Box::new(ConsolidationPlugin::new()),
        _ => return None,
    };
    Some(plugin)
}

/// Frozen registries plus a record of what did not make it.
pub struct LoadedPlugins {
    pub tools: Arc<ToolRegistry>,
    pub hooks: Arc<HookPipeline>,
    pub manifests: Vec<PluginManifest>,
    pub failures: Vec<PluginLoadError>,
}

/// Register every candidate in order. A plugin either contributes all of
/// its tools and hooks or nothing.
pub fn load_plugins(
    candidates: Vec<Result<Box<dyn Plugin>, PluginLoadError>>,
    ctx: &PluginContext,
) -> LoadedPlugins {
    let mut tools = ToolRegistryBuilder::new();
    let mut hooks = HookPipelineBuilder::new();
    let mut manifests = Vec::new();
    let mut failures = Vec::new();
    let mut seen = HashSet::new();

    for candidate in candidates {
        let plugin = match candidate {
            Ok(plugin) => plugin,
            Err(e) => {
                warn!("Skipping plugin: {}", e);
                failures.push(e);
                continue;
            }
        };
        let manifest = plugin.manifest().clone();
        if !seen.insert(manifest.id.clone()) {
            let e = PluginLoadError::Duplicate(manifest.id);
            warn!("Skipping plugin: {}", e);
            failures.push(e);
            continue;
        }

        match stage(plugin.as_ref(), ctx, &mut tools) {
            Ok(registrar) => {
                let hook_count = registrar.len();
                hooks.extend(registrar.into_registrations());
                info!(
                    plugin = %manifest.id,
                    version = %manifest.version,
                    hooks = hook_count,
                    "Loaded plugin {}",
                    manifest.name
                );
                manifests.push(manifest);
            }
            Err(e) => {
                warn!("Skipping plugin: {}", e);
                failures.push(e);
            }
        }
    }

    let tools = tools.freeze();
    info!(
        "Plugins ready: {} loaded, {} skipped, {} tool(s)",
        manifests.len(),
        failures.len(),
        tools.len()
    );
    LoadedPlugins {
        tools,
        hooks: hooks.freeze(),
        manifests,
        failures,
    }
}

fn stage(
    plugin: &dyn Plugin,
    ctx: &PluginContext,
    tools: &mut ToolRegistryBuilder,
) -> Result<HookRegistrar, PluginLoadError> {
    let id = plugin.manifest().id.clone();
    let failed = |e: anyhow::Error| PluginLoadError::Failed {
        id: id.clone(),
        message: format!("{:#}", e),
    };

    let plugin_tools = plugin.tools(ctx).map_err(failed)?;
    let mut registrar = HookRegistrar::new(id.clone());
    plugin.register_hooks(ctx, &mut registrar).map_err(failed)?;
    tools
        .register_all(plugin_tools)
        .map_err(|source| PluginLoadError::Conflict { id: id.clone(), source })?;
    Ok(registrar)
}

/// Builtins named in config, then script plugins found on disk.
pub async fn load_configured(ctx: &PluginContext) -> LoadedPlugins {
    let mut candidates: Vec<Result<Box<dyn Plugin>, PluginLoadError>> = ctx
        .config
        .plugins
        .enabled
        .iter()
        .map(|name| builtin(name).ok_or_else(|| PluginLoadError::Unknown(name.clone())))
        .collect();
    candidates.extend(discover_script_plugins(&ctx.config.plugins_dir()).await);
    load_plugins(candidates, ctx)
}

/// Every `<dir>/*/manifest.toml`, in directory-name order.
pub async fn discover_script_plugins(dir: &Path) -> Vec<Result<Box<dyn Plugin>, PluginLoadError>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut dirs = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.join(MANIFEST_FILE).is_file() {
            dirs.push(path);
        }
    }
    dirs.sort();

    let mut found = Vec::with_capacity(dirs.len());
    for plugin_dir in dirs {
        found.push(
            ScriptPlugin::load(&plugin_dir)
                .await
                .map(|p| Box::new(p) as Box<dyn Plugin>),
        );
    }
    found
}

#[cfg(test)]
pub(crate) fn test_context() -> PluginContext {
    use crate::core::llm::embedding::HashEmbedder;
    use crate::core::memory::test_memory_system;
    use crate::core::scheduler::SystemClock;

    let db = test_memory_system();
    PluginContext {
        memory: Arc::new(MemoryStore::new(db.clone(), Arc::new(HashEmbedder::new(64)))),
        scheduler: Arc::new(Scheduler::new(
            db,
            Arc::new(SystemClock),
            std::time::Duration::from_secs(30),
        )),
        config: Arc::new(AppConfig {
            data_dir: std::path::PathBuf::from("/nonexistent/squidbot-test"),
            ..AppConfig::default()
        }),
    }
}
