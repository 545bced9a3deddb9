mod heartbeat;
mod tools;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{InboundHandler, InboundMessage, MessageBus, OutboundMessage};
use crate::config::Config;
use crate::memory::MemoryStore;
use crate::provider::{ChatMessage, ChatRequest, Provider, ToolCall};
use crate::scheduler::JobScheduler;
use crate::tools::{Conversation, ToolContext, ToolRegistry, ToolResult, SEND_FILE_TOOL};

pub use heartbeat::{ConsolidationGate, Heartbeat, CONSOLIDATION_CHAT, CONSOLIDATION_REQUEST};
pub use tools::{register_job_tools, register_memory_tools, SpawnTool};

pub const REFLECTION_PROMPT: &str =
    "[System] Tool execution finished. Analyze the results and proceed or respond to the user.";
pub const ITERATION_LIMIT_MESSAGE: &str = "⚠️ Reached maximum reasoning iterations.";

const OPERATING_RULES: &str = "## Operating Rules\n\
- Memory files (MEMORY.md, HISTORY.md, INTERNAL.md, ENTITIES/) cannot be touched with file tools. \
Use update_core_memory, write_entity, read_entity and list_entities instead.\n\
- For network access (web pages, APIs) use exec with curl.\n\
- Deliver files to the user with send_file.\n\
- Save reusable scripts under skills/ (.sh or .py) and call reload_skills to turn them into tools.\n\
- Use add_cron_job for anything recurring and spawn for long-running work.";

/// Last real user conversation, shared with every turn as a reply-target
/// fallback for work that runs without a user attached.
#[derive(Debug, Clone, Default)]
pub struct RecentConversation {
    inner: Arc<Mutex<Option<Conversation>>>,
}

impl RecentConversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, conversation: Conversation) {
        match self.inner.lock() {
            Ok(mut slot) => *slot = Some(conversation),
            Err(poisoned) => *poisoned.into_inner() = Some(conversation),
        }
    }

    pub fn get(&self) -> Option<Conversation> {
        match self.inner.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEnd {
    Answered,
    /// The model finished without any text.
    Silent,
    IterationLimit,
    BackendError,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnOutcome {
    pub model_calls: usize,
    pub end: TurnEnd,
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub model: String,
    pub temperature: f32,
    pub max_iterations: usize,
    pub history_bytes: u64,
    pub persona: String,
}

impl AgentSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.provider.model.clone(),
            temperature: config.provider.temperature,
            max_iterations: config.agent.max_iterations,
            history_bytes: config.agent.history_bytes,
            persona: config.agent.persona.clone(),
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct Agent {
    provider: Arc<dyn Provider>,
    registry: Arc<ToolRegistry>,
    memory: Arc<MemoryStore>,
    bus: MessageBus,
    recent: RecentConversation,
    consolidation: ConsolidationGate,
    settings: AgentSettings,
}

impl Agent {
    /// Builds the agent and registers its memory, spawn and (when a scheduler
    /// is given) job tools into `registry`.
    pub fn new(
        provider: Arc<dyn Provider>,
        registry: Arc<ToolRegistry>,
        memory: Arc<MemoryStore>,
        scheduler: Option<Arc<JobScheduler>>,
        bus: MessageBus,
        settings: AgentSettings,
    ) -> Self {
        register_memory_tools(&registry, memory.clone());
        registry.register(SpawnTool::new(bus.clone()));
        if let Some(scheduler) = scheduler {
            register_job_tools(&registry, scheduler, registry.workspace().clone());
        }

        info!(
            "Agent ready: {} via {} with {} tool(s)",
            settings.model,
            provider.name(),
            registry.names().len()
        );

        Self {
            provider,
            registry,
            memory,
            bus,
            recent: RecentConversation::new(),
            consolidation: ConsolidationGate::default(),
            settings,
        }
    }

    pub fn recent(&self) -> &RecentConversation {
        &self.recent
    }

    /// Hand this to the heartbeat so it waits for consolidation turns.
    pub fn consolidation(&self) -> &ConsolidationGate {
        &self.consolidation
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub async fn build_system_prompt(&self) -> String {
        let mut prompt = String::new();
        prompt.push_str(self.settings.persona.trim_end());
        prompt.push_str("\n\n");
        prompt.push_str(OPERATING_RULES);
        prompt.push_str("\n\n");
        prompt.push_str(&self.memory.build_context().await);

        let recent = self
            .memory
            .read_recent_history(self.settings.history_bytes)
            .await;
        if !recent.is_empty() {
            prompt.push_str("\n\n## Recent Conversational History\n\n");
            prompt.push_str(&recent);
            prompt.push_str(
                "\n\n(Note: The above is the recent conversation log. Use it to understand \
                 references like 'that file' or 'send it again'.)\n",
            );
        }
        prompt
    }

    /// Answers one inbound message. Every model call and tool call of the
    /// turn happens sequentially here.
    pub async fn process(&self, msg: InboundMessage, cancel: CancellationToken) -> TurnOutcome {
        let internal = msg.is_internal();
        let _consolidating = (internal && msg.chat_id == CONSOLIDATION_CHAT)
            .then(|| self.consolidation.finish_on_drop());
        let conversation = if internal {
            None
        } else {
            let conversation = Conversation {
                channel: msg.channel.clone(),
                chat_id: msg.chat_id.clone(),
            };
            self.recent.record(conversation.clone());
            Some(conversation)
        };
        let ctx = ToolContext {
            conversation,
            fallback: self.recent.get(),
            cancel: cancel.clone(),
        };
        let turn = Turn {
            agent: self,
            msg: &msg,
            internal,
        };

        let user_content = match &msg.reply_to {
            Some(quoted) if !quoted.is_empty() => format!(
                "Context (User is replying to this previous message):\n\"{}\"\n\nUser's message: {}",
                quoted, msg.content
            ),
            _ => msg.content.clone(),
        };

        let mut messages = vec![
            ChatMessage::system(self.build_system_prompt().await),
            ChatMessage::user(user_content.clone()),
        ];
        turn.log(if internal { "SYSTEM" } else { "USER" }, &user_content)
            .await;

        let mut model_calls = 0;
        while model_calls < self.settings.max_iterations {
            if cancel.is_cancelled() {
                return turn.cancelled(model_calls);
            }

            let request = ChatRequest {
                model: self.settings.model.clone(),
                messages: messages.clone(),
                tools: self.registry.definitions(),
                temperature: self.settings.temperature,
                max_tokens: None,
            };
            model_calls += 1;

            let response = tokio::select! {
                result = self.provider.chat(request) => result,
                _ = cancel.cancelled() => return turn.cancelled(model_calls),
            };
            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    error!("Model backend error: {}", e);
                    turn.reply(
                        &format!(
                            "Sorry, I had trouble thinking about that: {}. Please try again in a moment.",
                            e.summary()
                        ),
                        Vec::new(),
                    )
                    .await;
                    return TurnOutcome {
                        model_calls,
                        end: TurnEnd::BackendError,
                    };
                }
            };
            debug!(
                "Model call {} used {} tokens ({} prompt, {} completion)",
                model_calls,
                response.usage.total_tokens,
                response.usage.prompt_tokens,
                response.usage.completion_tokens
            );

            if response.tool_calls.is_empty() {
                let answer = strip_reasoning(&response.content);
                if answer.is_empty() {
                    debug!("Model finished without a reply");
                    return TurnOutcome {
                        model_calls,
                        end: TurnEnd::Silent,
                    };
                }
                turn.reply(&answer, Vec::new()).await;
                turn.log("ASSISTANT", &answer).await;
                return TurnOutcome {
                    model_calls,
                    end: TurnEnd::Answered,
                };
            }

            messages.push(ChatMessage::assistant(
                response.content.clone(),
                response.tool_calls.clone(),
            ));
            for call in &response.tool_calls {
                let result = self
                    .registry
                    .execute(&call.name, parse_arguments(call), &ctx)
                    .await;
                messages.push(ChatMessage::tool(&call.id, result.for_llm.clone()));
                if result.has_user_output() {
                    turn.tool_output(&call.name, result).await;
                }
            }
            messages.push(ChatMessage::user(REFLECTION_PROMPT));
        }

        warn!(
            "Turn for chat {} hit the iteration limit ({})",
            msg.chat_id, self.settings.max_iterations
        );
        turn.reply(ITERATION_LIMIT_MESSAGE, Vec::new()).await;
        TurnOutcome {
            model_calls,
            end: TurnEnd::IterationLimit,
        }
    }
}

#[async_trait]
impl InboundHandler for Agent {
    async fn handle(&self, msg: InboundMessage, cancel: CancellationToken) {
        let chat_id = msg.chat_id.clone();
        let outcome = self.process(msg, cancel).await;
        info!(
            "Turn for chat {} ended: {:?} after {} model call(s)",
            chat_id, outcome.end, outcome.model_calls
        );
    }
}

/// Per-message view used by the loop for replies and logging.
struct Turn<'a> {
    agent: &'a Agent,
    msg: &'a InboundMessage,
    internal: bool,
}

impl Turn<'_> {
    async fn reply(&self, content: &str, files: Vec<PathBuf>) {
        if self.internal {
            debug!("Internal turn reply suppressed: {}", content);
            return;
        }
        self.agent
            .bus
            .send_outbound(OutboundMessage {
                channel: self.msg.channel.clone(),
                chat_id: self.msg.chat_id.clone(),
                reply_to_message_id: self.msg.message_id,
                content: content.to_string(),
                files,
            })
            .await;
    }

    async fn log(&self, role: &str, content: &str) {
        let result = if self.internal {
            self.agent.memory.append_internal(role, content).await
        } else {
            self.agent.memory.append_history(role, content).await
        };
        if let Err(e) = result {
            warn!("Failed to log {} message: {}", role, e);
        }
    }

    async fn tool_output(&self, tool: &str, result: ToolResult) {
        let text = match result.for_user {
            Some(text) if tool != SEND_FILE_TOOL => format!("🛠 Tool `{}`: {}", tool, text),
            Some(text) => text,
            None => String::new(),
        };

        let mut logged = text.clone();
        if !result.files.is_empty() {
            let names: Vec<String> = result
                .files
                .iter()
                .map(|f| f.display().to_string())
                .collect();
            if !logged.is_empty() {
                logged.push(' ');
            }
            logged.push_str(&format!("[Attached files: {}]", names.join(", ")));
        }

        self.reply(&text, result.files).await;
        self.log("ASSISTANT", &logged).await;
    }

    fn cancelled(&self, model_calls: usize) -> TurnOutcome {
        info!("Turn for chat {} cancelled", self.msg.chat_id);
        TurnOutcome {
            model_calls,
            end: TurnEnd::Cancelled,
        }
    }
}

/// Malformed or non-object arguments become `{}`; the tool's own argument
/// check then tells the model what was missing.
fn parse_arguments(call: &ToolCall) -> Value {
    if call.arguments.trim().is_empty() {
        return Value::Object(Default::default());
    }
    match serde_json::from_str::<Value>(&call.arguments) {
        Ok(value @ Value::Object(_)) => value,
        Ok(other) => {
            warn!("Tool '{}' got non-object arguments: {}", call.name, other);
            Value::Object(Default::default())
        }
        Err(e) => {
            warn!("Tool '{}' got malformed arguments ({}): {}", call.name, e, call.arguments);
            Value::Object(Default::default())
        }
    }
}

fn reasoning_block() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").ok())
        .as_ref()
}

/// Drops `<think>` blocks some reasoning models put in front of the answer.
fn strip_reasoning(content: &str) -> String {
    match reasoning_block() {
        Some(re) => re.replace_all(content, "").trim().to_string(),
        None => content.trim().to_string(),
    }
}
