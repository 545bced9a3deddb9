use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::bus::{InboundMessage, MessageBus};
use crate::error::{SchedulerError, ToolError};
use crate::memory::MemoryStore;
use crate::scheduler::{CronJob, JobScheduler};
use crate::tools::{NoArgs, Tool, ToolContext, ToolRegistry, ToolResult};
use crate::workspace::Workspace;

pub fn register_memory_tools(registry: &ToolRegistry, memory: Arc<MemoryStore>) {
    registry.register(ListEntitiesTool {
        memory: memory.clone(),
    });
    registry.register(ReadEntityTool {
        memory: memory.clone(),
    });
    registry.register(WriteEntityTool {
        memory: memory.clone(),
    });
    registry.register(UpdateCoreMemoryTool { memory });
}

pub fn register_job_tools(
    registry: &ToolRegistry,
    scheduler: Arc<JobScheduler>,
    workspace: Arc<Workspace>,
) {
    registry.register(AddCronJobTool {
        scheduler: scheduler.clone(),
        workspace,
    });
    registry.register(RemoveCronJobTool {
        scheduler: scheduler.clone(),
    });
    registry.register(ListCronJobsTool { scheduler });
}

#[derive(Debug, Deserialize)]
pub struct EntityArgs {
    pub entity_name: String,
}

#[derive(Debug, Deserialize)]
pub struct WriteEntityArgs {
    pub entity_name: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ContentArgs {
    pub content: String,
}

pub struct ListEntitiesTool {
    memory: Arc<MemoryStore>,
}

#[async_trait]
impl Tool for ListEntitiesTool {
    type Args = NoArgs;

    fn name(&self) -> &str {
        "list_entities"
    }

    fn description(&self) -> String {
        "Lists all currently known entity topics in the memory system. \
         Use this to avoid creating duplicate entities."
            .to_string()
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn call(&self, _args: NoArgs, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let entities = self.memory.list_entities().await?;
        if entities.is_empty() {
            return Ok(ToolResult::new("No entities found in memory."));
        }
        Ok(ToolResult::new(format!(
            "Known entities: {}",
            entities.join(", ")
        )))
    }
}

pub struct ReadEntityTool {
    memory: Arc<MemoryStore>,
}

#[async_trait]
impl Tool for ReadEntityTool {
    type Args = EntityArgs;

    fn name(&self) -> &str {
        "read_entity"
    }

    fn description(&self) -> String {
        "Reads the deep contextual file for a specific entity (a person, place, project, or topic)."
            .to_string()
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "entity_name": {
                    "type": "string",
                    "description": "The name of the entity to look up (e.g. 'Alice Smith', 'Project Phoenix')."
                }
            },
            "required": ["entity_name"]
        })
    }

    async fn call(&self, args: EntityArgs, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        match self.memory.read_entity(&args.entity_name).await? {
            Some(content) if !content.trim().is_empty() => Ok(ToolResult::new(content)),
            _ => Ok(ToolResult::new(format!(
                "No existing record found for entity: {}",
                args.entity_name
            ))),
        }
    }
}

pub struct WriteEntityTool {
    memory: Arc<MemoryStore>,
}

#[async_trait]
impl Tool for WriteEntityTool {
    type Args = WriteEntityArgs;

    fn name(&self) -> &str {
        "write_entity"
    }

    fn description(&self) -> String {
        "Creates or replaces the knowledge record for a specific entity. \
         The content fully overwrites the previous record, so include everything worth keeping."
            .to_string()
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "entity_name": {"type": "string", "description": "The name of the entity."},
                "content": {"type": "string", "description": "Everything known about the entity."}
            },
            "required": ["entity_name", "content"]
        })
    }

    async fn call(
        &self,
        args: WriteEntityArgs,
        _ctx: &ToolContext,
    ) -> Result<ToolResult, ToolError> {
        self.memory
            .write_entity(&args.entity_name, &args.content)
            .await?;
        Ok(ToolResult::new(format!(
            "Successfully saved record for entity: {}",
            args.entity_name
        )))
    }
}

pub struct UpdateCoreMemoryTool {
    memory: Arc<MemoryStore>,
}

#[async_trait]
impl Tool for UpdateCoreMemoryTool {
    type Args = ContentArgs;

    fn name(&self) -> &str {
        "update_core_memory"
    }

    fn description(&self) -> String {
        "Updates the long-term core memory profile (MEMORY.md). This permanently overrides \
         the user's profile and preferences, so provide the complete consolidated text."
            .to_string()
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The full textual content representing the user's core memory facts."
                }
            },
            "required": ["content"]
        })
    }

    async fn call(&self, args: ContentArgs, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        self.memory.write_long_term(&args.content).await?;
        Ok(ToolResult::new(
            "Successfully updated core memory (MEMORY.md).",
        ))
    }
}

#[derive(Debug, Deserialize)]
pub struct SpawnArgs {
    pub task: String,
}

/// Hands a task to the same bus entry point chat messages use. Each spawned
/// task gets its own `task-N` sender id.
pub struct SpawnTool {
    bus: MessageBus,
    next_id: AtomicU64,
}

impl SpawnTool {
    pub fn new(bus: MessageBus) -> Self {
        Self {
            bus,
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl Tool for SpawnTool {
    type Args = SpawnArgs;

    fn name(&self) -> &str {
        "spawn"
    }

    fn description(&self) -> String {
        "Spawns a detached, asynchronous sub-agent to handle a long-running task in the \
         background. Does not block the main conversation."
            .to_string()
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {"type": "string", "description": "A highly detailed instruction for the sub-agent."}
            },
            "required": ["task"]
        })
    }

    async fn call(&self, args: SpawnArgs, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let target = ctx
            .reply_target()
            .ok_or(SchedulerError::NoReplyTarget)?
            .clone();

        let task_id = format!("task-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let content = format!(
            "[Background task {}]\n{}\n\nWork through this on your own and report the result to the user when finished.",
            task_id, args.task
        );
        let msg = InboundMessage::new(&target.channel, &task_id, &target.chat_id, &content);
        self.bus.send_inbound(msg).await;
        info!("Spawned {} for chat {}", task_id, target.chat_id);

        Ok(ToolResult::new(format!(
            "Sub-agent successfully spawned in the background as {}. It will message the user when complete.",
            task_id
        ))
        .with_user("Spawned a background agent to handle that task! It will report back shortly."))
    }
}

#[derive(Debug, Deserialize)]
pub struct AddJobArgs {
    pub label: String,
    pub schedule: String,
    pub command: String,
}

#[derive(Debug, Deserialize)]
pub struct RemoveJobArgs {
    pub id: String,
}

pub struct AddCronJobTool {
    scheduler: Arc<JobScheduler>,
    workspace: Arc<Workspace>,
}

#[async_trait]
impl Tool for AddCronJobTool {
    type Args = AddJobArgs;

    fn name(&self) -> &str {
        "add_cron_job"
    }

    fn description(&self) -> String {
        "Schedules a recurring shell command whose output is sent to the user. \
         Re-using a label replaces that job."
            .to_string()
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "label": {"type": "string", "description": "Short human-readable name, also used to derive the job id."},
                "schedule": {
                    "type": "string",
                    "description": "Cron expression ('*/5 * * * *', '0 0 9 * * *'), shorthand ('@daily') or interval ('@every 10m')."
                },
                "command": {"type": "string", "description": "Shell command to run in the workspace."}
            },
            "required": ["label", "schedule", "command"]
        })
    }

    async fn call(&self, args: AddJobArgs, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        self.workspace.check_command(&args.command)?;
        let target = ctx.reply_target().ok_or(SchedulerError::NoReplyTarget)?;

        let job = CronJob::new(
            &args.label,
            &args.schedule,
            &args.command,
            &target.channel,
            &target.chat_id,
        )?;
        let id = job.id.clone();
        self.scheduler.add(job).await?;

        Ok(ToolResult::new(format!(
            "Successfully scheduled job '{}' (id: {}) on '{}'.",
            args.label, id, args.schedule
        )))
    }
}

pub struct RemoveCronJobTool {
    scheduler: Arc<JobScheduler>,
}

#[async_trait]
impl Tool for RemoveCronJobTool {
    type Args = RemoveJobArgs;

    fn name(&self) -> &str {
        "remove_cron_job"
    }

    fn description(&self) -> String {
        "Removes a scheduled job by its id or label".to_string()
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": {"type": "string", "description": "Job id or label"}
            },
            "required": ["id"]
        })
    }

    async fn call(&self, args: RemoveJobArgs, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let removed = self.scheduler.remove(&args.id).await?;
        Ok(ToolResult::new(format!(
            "Removed job '{}' ({}).",
            removed.label, removed.id
        )))
    }
}

pub struct ListCronJobsTool {
    scheduler: Arc<JobScheduler>,
}

#[async_trait]
impl Tool for ListCronJobsTool {
    type Args = NoArgs;

    fn name(&self) -> &str {
        "list_cron_jobs"
    }

    fn description(&self) -> String {
        "Lists all scheduled jobs".to_string()
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn call(&self, _args: NoArgs, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let jobs = self.scheduler.list().await;
        if jobs.is_empty() {
            return Ok(ToolResult::new("No scheduled jobs."));
        }
        let lines: Vec<String> = jobs
            .iter()
            .map(|j| format!("- {} [{}] {}: {}", j.id, j.schedule, j.label, j.command))
            .collect();
        Ok(ToolResult::new(lines.join("\n")))
    }
}
