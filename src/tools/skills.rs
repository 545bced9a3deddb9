use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::{Tool, ToolContext, ToolResult};
use crate::error::ToolError;
use crate::workspace::Workspace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillDescriptor {
    pub name: String,
    pub script: PathBuf,
    pub interpreter: &'static str,
}

/// Maps a snapshot of some source (normally a directory) to tool descriptors.
pub trait CapabilityLoader: Send + Sync {
    fn scan(&self) -> Result<Vec<SkillDescriptor>>;
}

pub struct SkillLoader {
    dir: PathBuf,
}

impl SkillLoader {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

fn interpreter_for(path: &Path) -> Option<&'static str> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("sh") => Some("sh"),
        Some("py") => Some("python3"),
        _ => None,
    }
}

impl CapabilityLoader for SkillLoader {
    fn scan(&self) -> Result<Vec<SkillDescriptor>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read skills directory {:?}", self.dir))?;

        let mut skills = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(interpreter) = interpreter_for(&path) else {
                debug!("Ignoring non-skill file {:?}", path);
                continue;
            };
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if name.is_empty() || name.starts_with('.') {
                continue;
            }
            skills.push(SkillDescriptor {
                name: name.to_string(),
                script: path.clone(),
                interpreter,
            });
        }

        skills.sort_by(|a, b| a.name.cmp(&b.name));
        skills.dedup_by(|a, b| a.name == b.name);
        Ok(skills)
    }
}

#[derive(Debug, Deserialize)]
pub struct SkillArgs {
    #[serde(default)]
    pub args: String,
}

pub struct SkillTool {
    descriptor: SkillDescriptor,
    workspace: Arc<Workspace>,
}

impl SkillTool {
    pub fn new(descriptor: SkillDescriptor, workspace: Arc<Workspace>) -> Self {
        Self {
            descriptor,
            workspace,
        }
    }
}

#[async_trait]
impl Tool for SkillTool {
    type Args = SkillArgs;

    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn description(&self) -> String {
        let file = self
            .descriptor
            .script
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_default();
        format!("Dynamic skill script: {}", file)
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "args": {"type": "string", "description": "Space-separated arguments passed to the script"}
            }
        })
    }

    async fn call(&self, args: SkillArgs, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let argv: Vec<String> = args.args.split_whitespace().map(String::from).collect();
        let output = self
            .workspace
            .run_script(
                self.descriptor.interpreter,
                &self.descriptor.script,
                &argv,
                &ctx.cancel,
            )
            .await
            .map_err(|e| ToolError::Failed(format!("Skill failed: {}", e)))?;

        if output.success {
            Ok(ToolResult::new(output.text_or_placeholder()))
        } else {
            Ok(ToolResult::new(format!(
                "Skill failed: {}\nOutput: {}",
                output.status,
                output.text_or_placeholder()
            )))
        }
    }
}
