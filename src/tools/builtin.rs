use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use super::{Tool, ToolContext, ToolRegistry, ToolResult};
use crate::error::ToolError;
use crate::workspace::Workspace;

pub const SEND_FILE_TOOL: &str = "send_file";

#[derive(Debug, Deserialize)]
pub struct PathArgs {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct WriteArgs {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct SendFileArgs {
    pub path: String,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExecArgs {
    pub command: String,
}

#[derive(Debug, Deserialize)]
pub struct NoArgs {}

fn path_schema(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "path": {"type": "string", "description": description}
        },
        "required": ["path"]
    })
}

fn io_error(action: &str, path: &str, e: std::io::Error) -> ToolError {
    ToolError::Failed(format!("failed to {} {}: {}", action, path, e))
}

pub struct ReadFileTool {
    workspace: Arc<Workspace>,
}

impl ReadFileTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    type Args = PathArgs;

    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> String {
        "Read the contents of a file in the workspace".to_string()
    }

    fn parameters(&self) -> Value {
        path_schema("Path relative to the workspace")
    }

    async fn call(&self, args: PathArgs, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let path = self.workspace.resolve(&args.path)?;
        if path.is_dir() {
            return Err(ToolError::Failed(format!(
                "{} is a directory, not a file",
                args.path
            )));
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| io_error("read", &args.path, e))?;
        if content.is_empty() {
            return Ok(ToolResult::new("(file is empty)"));
        }
        Ok(ToolResult::new(content))
    }
}

pub struct WriteFileTool {
    workspace: Arc<Workspace>,
}

impl WriteFileTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    type Args = WriteArgs;

    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> String {
        "Write content to a file in the workspace, replacing it. Parent directories are created."
            .to_string()
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path relative to the workspace"},
                "content": {"type": "string", "description": "Full file content"}
            },
            "required": ["path", "content"]
        })
    }

    async fn call(&self, args: WriteArgs, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let path = self.workspace.resolve(&args.path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("create parent of", &args.path, e))?;
        }
        tokio::fs::write(&path, &args.content)
            .await
            .map_err(|e| io_error("write", &args.path, e))?;
        Ok(ToolResult::new(format!("Successfully wrote to {}", args.path)))
    }
}

pub struct AppendFileTool {
    workspace: Arc<Workspace>,
}

impl AppendFileTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for AppendFileTool {
    type Args = WriteArgs;

    fn name(&self) -> &str {
        "append_file"
    }

    fn description(&self) -> String {
        "Append content to the end of a file in the workspace, creating it if needed".to_string()
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path relative to the workspace"},
                "content": {"type": "string", "description": "Text to append"}
            },
            "required": ["path", "content"]
        })
    }

    async fn call(&self, args: WriteArgs, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let path = self.workspace.resolve(&args.path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("create parent of", &args.path, e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| io_error("open", &args.path, e))?;
        file.write_all(args.content.as_bytes())
            .await
            .map_err(|e| io_error("append to", &args.path, e))?;
        Ok(ToolResult::new(format!(
            "Successfully appended to {}",
            args.path
        )))
    }
}

pub struct SendFileTool {
    workspace: Arc<Workspace>,
}

impl SendFileTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for SendFileTool {
    type Args = SendFileArgs;

    fn name(&self) -> &str {
        SEND_FILE_TOOL
    }

    fn description(&self) -> String {
        "Send a file from the workspace to the user, with an optional caption".to_string()
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path relative to the workspace"},
                "caption": {"type": "string", "description": "Optional message to accompany the file"}
            },
            "required": ["path"]
        })
    }

    async fn call(&self, args: SendFileArgs, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let path = self.workspace.resolve(&args.path)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_error("access", &args.path, e))?;
        if meta.is_dir() {
            return Err(ToolError::Failed(format!(
                "{} is a directory; only files can be sent",
                args.path
            )));
        }

        info!("Queued {:?} for sending", path);
        let result = ToolResult::new(format!(
            "Successfully queued {} for sending to the user.",
            args.path
        ))
        .with_files(vec![path]);
        Ok(match args.caption {
            Some(caption) => result.with_user(caption),
            None => result,
        })
    }
}

pub struct ExecTool {
    workspace: Arc<Workspace>,
}

impl ExecTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ExecTool {
    type Args = ExecArgs;

    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> String {
        format!(
            "Run a shell command inside the workspace directory (timeout {}s). \
             Use this for network access (curl) and system inspection.",
            self.workspace.exec_timeout().as_secs()
        )
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Shell command to run with sh -c"}
            },
            "required": ["command"]
        })
    }

    async fn call(&self, args: ExecArgs, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        if let Err(e) = self.workspace.check_command(&args.command) {
            warn!("Blocked command: {}", args.command);
            return Err(e.into());
        }

        let output = self
            .workspace
            .run_shell(&args.command, &ctx.cancel)
            .await
            .map_err(|e| ToolError::Failed(format!("Command failed: {}", e)))?;

        if output.success {
            Ok(ToolResult::new(output.text_or_placeholder()))
        } else {
            Ok(ToolResult::new(format!(
                "Command failed: {}\nOutput: {}",
                output.status,
                output.text_or_placeholder()
            )))
        }
    }
}

pub struct ReloadSkillsTool {
    registry: Weak<ToolRegistry>,
}

impl ReloadSkillsTool {
    pub fn new(registry: Weak<ToolRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Tool for ReloadSkillsTool {
    type Args = NoArgs;

    fn name(&self) -> &str {
        "reload_skills"
    }

    fn description(&self) -> String {
        "Re-scan the skills/ directory and register every .sh or .py script as a tool. \
         Call this after writing a new skill script."
            .to_string()
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn call(&self, _args: NoArgs, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| ToolError::Failed("tool registry is shutting down".to_string()))?;
        let loaded = registry.load_skills();
        if loaded.is_empty() {
            Ok(ToolResult::new(
                "Dynamic skills reloaded. No skills found in skills/.",
            ))
        } else {
            Ok(ToolResult::new(format!(
                "Dynamic skills reloaded: {}",
                loaded.join(", ")
            )))
        }
    }
}
