use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{MANIFEST_FILE, Plugin, PluginContext, PluginLoadError, PluginManifest};
use crate::core::tools::{Tool, ToolContext};
use crate::platform::{NativePlatform, Platform};

#[derive(Debug, Clone, Deserialize)]
struct ScriptManifest {
    #[serde(flatten)]
    plugin: PluginManifest,
    #[serde(default)]
    tools: Vec<ScriptToolSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptToolSpec {
    pub name: String,
    pub description: String,
    #[serde(default = "default_parameters")]
    pub parameters: Value,
    /// Script path relative to the plugin directory.
    pub command: String,
    /// Defaults to the platform shell.
    #[serde(default)]
    pub interpreter: Option<String>,
}

fn default_parameters() -> Value {
    json!({ "type": "object", "properties": {} })
}

/// A plugin directory with a `manifest.toml` whose tools are external
/// scripts. Arguments are written to stdin as JSON; stdout is the result.
pub struct ScriptPlugin {
    manifest: PluginManifest,
    dir: PathBuf,
    specs: Vec<ScriptToolSpec>,
}

impl ScriptPlugin {
    pub async fn load(dir: &Path) -> Result<Self, PluginLoadError> {
        let path = dir.join(MANIFEST_FILE);
        let bad = |message: String| PluginLoadError::Manifest {
            path: path.display().to_string(),
            message,
        };
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| bad(e.to_string()))?;
        let parsed: ScriptManifest = toml::from_str(&content).map_err(|e| bad(e.to_string()))?;
        if parsed.plugin.id.trim().is_empty() {
            return Err(bad("id must not be empty".to_string()));
        }
        for spec in &parsed.tools {
            if !dir.join(&spec.command).is_file() {
                return Err(bad(format!("tool '{}': command '{}' not found", spec.name, spec.command)));
            }
        }
        debug!("Parsed script plugin {} with {} tool(s)", parsed.plugin.id, parsed.tools.len());
        Ok(Self {
            manifest: parsed.plugin,
            dir: dir.to_path_buf(),
            specs: parsed.tools,
        })
    }
}

impl Plugin for ScriptPlugin {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    fn tools(&self, _ctx: &PluginContext) -> Result<Vec<Arc<dyn Tool>>> {
        Ok(self
            .specs
            .iter()
            .map(|spec| {
                Arc::new(ScriptTool {
                    plugin_id: self.manifest.id.clone(),
                    dir: self.dir.clone(),
                    spec: spec.clone(),
                }) as Arc<dyn Tool>
            })
            .collect())
    }
}

pub struct ScriptTool {
    plugin_id: String,
    dir: PathBuf,
    spec: ScriptToolSpec,
}

#[async_trait]
impl Tool for ScriptTool {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn description(&self) -> &str {
        &self.spec.description
    }

    fn parameters(&self) -> Value {
        self.spec.parameters.clone()
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value> {
        info!(plugin = %self.plugin_id, tool = %self.spec.name, "Running script tool");
        let script = self.dir.join(&self.spec.command);
        let mut cmd = NativePlatform::script_command(self.spec.interpreter.as_deref(), &script);
        cmd.current_dir(&self.dir)
            .env("SQUID_CONVERSATION_ID", &ctx.conversation_id)
            .env("SQUID_CALL_ID", &ctx.call_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(args.to_string().as_bytes()).await?;
            drop(stdin);
        }
        let output = child.wait_with_output().await?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "'{}' exited with {}: {} {}",
                self.spec.name,
                output.status,
                stderr.trim(),
                stdout
            ));
        }

        Ok(serde_json::from_str(&stdout).unwrap_or(Value::String(stdout)))
    }
}
