//! Tool registry: the set of capabilities exposed to the model.
//!
//! Tools declare a typed argument struct; the registry deserializes the
//! model's JSON arguments into it and turns every failure (bad arguments,
//! sandbox violations, I/O errors, even panics) into text for the model.

mod builtin;
mod skills;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ToolError;
use crate::provider::ToolDefinition;
use crate::workspace::Workspace;

pub use builtin::{
    AppendFileTool, ExecTool, NoArgs, ReadFileTool, ReloadSkillsTool, SendFileTool, WriteFileTool,
    SEND_FILE_TOOL,
};
pub use skills::{CapabilityLoader, SkillDescriptor, SkillLoader, SkillTool};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    /// Always non-empty.
    pub for_llm: String,
    pub for_user: Option<String>,
    pub files: Vec<PathBuf>,
}

impl ToolResult {
    pub fn new(for_llm: impl Into<String>) -> Self {
        let mut for_llm = for_llm.into();
        if for_llm.trim().is_empty() {
            for_llm = "(no output)".to_string();
        }
        Self {
            for_llm,
            for_user: None,
            files: Vec::new(),
        }
    }

    pub fn error(err: impl Display) -> Self {
        Self::new(format!("Error: {}", err))
    }

    pub fn with_user(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        if !text.is_empty() {
            self.for_user = Some(text);
        }
        self
    }

    pub fn with_files(mut self, files: Vec<PathBuf>) -> Self {
        self.files = files;
        self
    }

    pub fn has_user_output(&self) -> bool {
        self.for_user.is_some() || !self.files.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub channel: String,
    pub chat_id: String,
}

#[derive(Debug, Clone)]
pub struct ToolContext {
    /// The live conversation of this turn; `None` for internal turns.
    pub conversation: Option<Conversation>,
    /// Last real user conversation seen before this turn started.
    pub fallback: Option<Conversation>,
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn detached() -> Self {
        Self {
            conversation: None,
            fallback: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn reply_target(&self) -> Option<&Conversation> {
        self.conversation.as_ref().or(self.fallback.as_ref())
    }
}

#[async_trait]
pub trait Tool: Send + Sync + 'static {
    type Args: DeserializeOwned + Send;

    fn name(&self) -> &str;
    fn description(&self) -> String;
    fn parameters(&self) -> Value;
    async fn call(&self, args: Self::Args, ctx: &ToolContext) -> Result<ToolResult, ToolError>;
}

/// Object-safe face of [`Tool`], stored by the registry.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn definition(&self) -> ToolDefinition;
    async fn invoke(&self, args: Value, ctx: &ToolContext) -> ToolResult;
}

#[async_trait]
impl<T: Tool> ToolHandler for T {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description(),
            parameters: self.parameters(),
        }
    }

    async fn invoke(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let parsed: T::Args = match serde_json::from_value(args) {
            Ok(parsed) => parsed,
            Err(e) => {
                return ToolResult::error(ToolError::InvalidArguments {
                    tool: self.name().to_string(),
                    reason: e.to_string(),
                })
            }
        };
        match self.call(parsed, ctx).await {
            Ok(result) => result,
            Err(e) => ToolResult::error(e),
        }
    }
}

pub struct ToolRegistry {
    workspace: Arc<Workspace>,
    loader: Box<dyn CapabilityLoader>,
    tools: RwLock<BTreeMap<String, Arc<dyn ToolHandler>>>,
    skills: RwLock<BTreeSet<String>>,
}

impl ToolRegistry {
    /// Registry with the sandbox built-ins and the skills found in
    /// `<workspace>/skills`.
    pub fn new(workspace: Arc<Workspace>) -> Arc<Self> {
        let loader = Box::new(SkillLoader::new(workspace.skills_dir()));
        Self::with_loader(workspace, loader)
    }

    pub fn with_loader(workspace: Arc<Workspace>, loader: Box<dyn CapabilityLoader>) -> Arc<Self> {
        let registry = Arc::new_cyclic(|weak| {
            let registry = Self {
                workspace: workspace.clone(),
                loader,
                tools: RwLock::new(BTreeMap::new()),
                skills: RwLock::new(BTreeSet::new()),
            };
            registry.register(ReadFileTool::new(workspace.clone()));
            registry.register(WriteFileTool::new(workspace.clone()));
            registry.register(AppendFileTool::new(workspace.clone()));
            registry.register(SendFileTool::new(workspace.clone()));
            registry.register(ExecTool::new(workspace.clone()));
            registry.register(ReloadSkillsTool::new(weak.clone()));
            registry
        });
        registry.load_skills();
        registry
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    pub fn register<T: Tool>(&self, tool: T) {
        self.register_handler(Arc::new(tool));
    }

    /// Adds a handler under its definition's name, replacing any previous
    /// handler with that name.
    pub fn register_handler(&self, handler: Arc<dyn ToolHandler>) {
        let name = handler.definition().name;
        match self.skills.write() {
            Ok(mut skills) => skills.remove(&name),
            Err(poisoned) => poisoned.into_inner().remove(&name),
        };
        if self.tools_mut().insert(name.clone(), handler).is_some() {
            debug!("Replaced tool: {}", name);
        } else {
            debug!("Registered tool: {}", name);
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.tools_mut().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools().keys().cloned().collect()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools().values().map(|h| h.definition()).collect()
    }

    /// Runs a tool. Unknown names, bad arguments, handler errors and handler
    /// panics all come back as a `ToolResult`.
    pub async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> ToolResult {
        let handler = match self.tools().get(name) {
            Some(handler) => handler.clone(),
            None => {
                warn!("Model requested unknown tool '{}'", name);
                return ToolResult::error(format!("Tool '{}' not found", name));
            }
        };

        info!("Executing tool: {}", name);
        let task_ctx = ctx.clone();
        let joined = tokio::spawn(async move { handler.invoke(args, &task_ctx).await }).await;
        match joined {
            Ok(result) => result,
            Err(e) => {
                error!("Tool '{}' crashed: {}", name, e);
                ToolResult::error(format!("Tool '{}' failed unexpectedly", name))
            }
        }
    }

    /// Re-scans the skills directory. Skills whose script vanished are
    /// dropped; names taken by other tools are skipped.
    pub fn load_skills(&self) -> Vec<String> {
        let descriptors = match self.loader.scan() {
            Ok(descriptors) => descriptors,
            Err(e) => {
                warn!("Failed to scan skills: {}", e);
                return Vec::new();
            }
        };

        let mut skills = match self.skills.write() {
            Ok(skills) => skills,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut tools = self.tools_mut();

        for stale in skills.iter() {
            if !descriptors.iter().any(|d| &d.name == stale) {
                tools.remove(stale);
                info!("Removed dynamic skill: {}", stale);
            }
        }
        skills.retain(|name| descriptors.iter().any(|d| &d.name == name));

        let mut loaded = Vec::new();
        for descriptor in descriptors {
            if tools.contains_key(&descriptor.name) && !skills.contains(&descriptor.name) {
                warn!(
                    "Skill '{}' would shadow a built-in tool, skipping",
                    descriptor.name
                );
                continue;
            }
            let name = descriptor.name.clone();
            let tool = SkillTool::new(descriptor, self.workspace.clone());
            tools.insert(name.clone(), Arc::new(tool));
            skills.insert(name.clone());
            info!("Registered dynamic skill: {}", name);
            loaded.push(name);
        }
        loaded
    }

    fn tools(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<dyn ToolHandler>>> {
        match self.tools.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn tools_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<dyn ToolHandler>>> {
        match self.tools.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
