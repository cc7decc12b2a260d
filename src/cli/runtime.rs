use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::config::{AppConfig, EmbedderKind};
use crate::core::llm::LlmProvider;
use crate::core::llm::embedding::{Embedder, HashEmbedder, OpenAiEmbedder};
use crate::core::llm::generic_provider::GenericProvider;
use crate::core::memory::{MemoryStore, MemorySystem};
use crate::core::orchestrator::{Orchestrator, OrchestratorSettings, OutboundRouter};
use crate::core::scheduler::{Scheduler, SystemClock};
use crate::plugins::{self, PluginContext};

/// Everything a command needs once storage, plugins and the model are up.
pub(crate) struct Runtime {
    pub config: Arc<AppConfig>,
    pub scheduler: Arc<Scheduler>,
    pub orchestrator: Arc<Orchestrator>,
}

pub(crate) fn build_embedder(config: &AppConfig) -> Result<Arc<dyn Embedder>> {
    let embedder: Arc<dyn Embedder> = match config.memory.embedder {
        EmbedderKind::Hash => Arc::new(HashEmbedder::new(config.memory.embedding_dim)),
        EmbedderKind::OpenAi => Arc::new(OpenAiEmbedder::new(&config.llm)?),
    };
    Ok(embedder)
}

pub(crate) fn open_scheduler(config: &AppConfig, db: Arc<MemorySystem>) -> Arc<Scheduler> {
    Arc::new(Scheduler::new(
        db,
        Arc::new(SystemClock),
        std::time::Duration::from_secs(config.scheduler.check_interval_secs.max(1)),
    ))
}

pub(crate) async fn build_runtime(config: AppConfig, router: OutboundRouter) -> Result<Runtime> {
    let config = Arc::new(config);
    let db = Arc::new(MemorySystem::new(&config.data_dir).await?);
    let memory = Arc::new(MemoryStore::new(db.clone(), build_embedder(&config)?));
    let scheduler = open_scheduler(&config, db.clone());

    let ctx = PluginContext {
        memory: memory.clone(),
        scheduler: scheduler.clone(),
        config: config.clone(),
    };
    let loaded = plugins::load_configured(&ctx).await;
    for failure in &loaded.failures {
        warn!("{}", failure);
    }
    info!(
        plugins = loaded.manifests.len(),
        tools = loaded.tools.len(),
        "Plugins loaded"
    );

    if config.llm.api_key.trim().is_empty() {
        warn!("No API key configured; set OPENAI_API_KEY or llm.api_key in config.toml");
    }
    let llm: Arc<dyn LlmProvider> = Arc::new(GenericProvider::new(&config.llm)?);
    let settings = OrchestratorSettings::from_config(&config).await;

    let orchestrator = Arc::new(Orchestrator::new(
        settings,
        llm,
        loaded.tools,
        loaded.hooks,
        db,
        memory,
        router,
    ));

    Ok(Runtime {
        config,
        scheduler,
        orchestrator,
    })
}
