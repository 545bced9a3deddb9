use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use littleclaw::agent::{
    Agent, AgentSettings, Heartbeat, TurnEnd, CONSOLIDATION_CHAT, CONSOLIDATION_REQUEST,
    ITERATION_LIMIT_MESSAGE, REFLECTION_PROMPT,
};
use littleclaw::bus::{BusReceiver, InboundMessage, MessageBus, OutboundMessage, INTERNAL_CHANNEL};
use littleclaw::config::{default_blocked_commands, DEFAULT_PERSONA};
use littleclaw::error::ProviderError;
use littleclaw::memory::MemoryStore;
use littleclaw::provider::{ChatRequest, ChatResponse, Provider, Role, ToolCall, Usage};
use littleclaw::scheduler::JobScheduler;
use littleclaw::tools::ToolRegistry;
use littleclaw::workspace::Workspace;

#[derive(Clone)]
enum Reply {
    Text(&'static str),
    Calls(Vec<(&'static str, String)>),
    Fail,
}

/// Plays back canned replies; the last one repeats once the script runs out.
struct ScriptedProvider {
    script: Mutex<VecDeque<Reply>>,
    last: Mutex<Option<Reply>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    fn new(script: Vec<Reply>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let call_no = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request);
            requests.len()
        };

        let next = self.script.lock().unwrap().pop_front();
        let reply = match next {
            Some(reply) => {
                *self.last.lock().unwrap() = Some(reply.clone());
                reply
            }
            None => self
                .last
                .lock()
                .unwrap()
                .clone()
                .unwrap_or(Reply::Text("")),
        };

        let usage = Usage {
            prompt_tokens: 10,
            completion_tokens: 2,
            total_tokens: 12,
        };
        match reply {
            Reply::Text(text) => Ok(ChatResponse {
                content: text.to_string(),
                tool_calls: Vec::new(),
                usage,
            }),
            Reply::Calls(calls) => Ok(ChatResponse {
                content: String::new(),
                tool_calls: calls
                    .into_iter()
                    .enumerate()
                    .map(|(i, (name, arguments))| ToolCall {
                        id: format!("call_{}_{}", call_no, i),
                        name: name.to_string(),
                        arguments,
                    })
                    .collect(),
                usage,
            }),
            Reply::Fail => Err(ProviderError::Status {
                status: 429,
                body: r#"{"error":{"message":"Rate limit reached","code":"rate_limit_exceeded"}}"#
                    .to_string(),
            }),
        }
    }
}

struct Harness {
    dir: TempDir,
    agent: Agent,
    provider: Arc<ScriptedProvider>,
    bus: MessageBus,
    receiver: BusReceiver,
    scheduler: Arc<JobScheduler>,
}

async fn harness(script: Vec<Reply>) -> Harness {
    let dir = TempDir::new().unwrap();
    let workspace = Arc::new(
        Workspace::new(dir.path(), default_blocked_commands(), Duration::from_secs(10)).unwrap(),
    );
    let memory = Arc::new(MemoryStore::open(workspace.path(), 1024 * 1024).await.unwrap());
    let registry = ToolRegistry::new(workspace.clone());
    let (bus, receiver) = MessageBus::new(32);
    let scheduler = Arc::new(JobScheduler::new(
        workspace.clone(),
        memory.clone(),
        bus.clone(),
    ));
    let provider = Arc::new(ScriptedProvider::new(script));

    let settings = AgentSettings {
        model: "test-model".to_string(),
        temperature: 0.7,
        max_iterations: 10,
        history_bytes: 4000,
        persona: DEFAULT_PERSONA.to_string(),
    };
    let agent = Agent::new(
        provider.clone(),
        registry,
        memory,
        Some(scheduler.clone()),
        bus.clone(),
        settings,
    );

    Harness {
        dir,
        agent,
        provider,
        bus,
        receiver,
        scheduler,
    }
}

impl Harness {
    fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.path(rel)).unwrap_or_default()
    }

    async fn drain_outbound(&mut self) -> Vec<OutboundMessage> {
        let mut out = Vec::new();
        while let Ok(Some(msg)) =
            tokio::time::timeout(Duration::from_millis(50), self.receiver.recv_outbound()).await
        {
            out.push(msg);
        }
        out
    }

    fn tool_messages(&self, request_index: usize) -> Vec<String> {
        self.provider.requests()[request_index]
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.content.clone())
            .collect()
    }
}

fn chat(content: &str) -> InboundMessage {
    let mut msg = InboundMessage::new("chat", "user-1", "42", content);
    msg.message_id = Some(7);
    msg
}

fn call(name: &'static str, args: serde_json::Value) -> Reply {
    Reply::Calls(vec![(name, args.to_string())])
}

#[tokio::test]
async fn plain_answer_is_sent_once_and_logged() {
    let mut h = harness(vec![Reply::Text("4")]).await;

    let outcome = h
        .agent
        .process(chat("What's 2+2?"), CancellationToken::new())
        .await;
    assert_eq!(outcome.end, TurnEnd::Answered);
    assert_eq!(outcome.model_calls, 1);

    let out = h.drain_outbound().await;
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].chat_id, "42");
    assert_eq!(out[0].channel, "chat");
    assert_eq!(out[0].content, "4");
    assert_eq!(out[0].reply_to_message_id, Some(7));

    let history = h.read("memory/HISTORY.md");
    assert!(history.contains("USER: What's 2+2?"));
    assert_eq!(history.matches("ASSISTANT: 4").count(), 1);

    let request = &h.provider.requests()[0];
    assert_eq!(request.model, "test-model");
    assert_eq!(request.messages[0].role, Role::System);
    assert!(request.messages[0].content.starts_with("You are Littleclaw"));
    assert!(request.messages[0]
        .content
        .contains("No deeply personalized memory found yet."));
    let names: Vec<_> = request.tools.iter().map(|t| t.name.as_str()).collect();
    for expected in ["exec", "read_entity", "add_cron_job", "spawn", "reload_skills"] {
        assert!(names.contains(&expected), "missing tool {expected}");
    }
}

#[tokio::test]
async fn endless_tool_calls_stop_at_the_iteration_cap() {
    let mut h = harness(vec![call("exec", json!({"command": "echo again"}))]).await;

    let outcome = h.agent.process(chat("loop forever"), CancellationToken::new()).await;
    assert_eq!(outcome.end, TurnEnd::IterationLimit);
    assert_eq!(outcome.model_calls, 10);
    assert_eq!(h.provider.requests().len(), 10);

    let out = h.drain_outbound().await;
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].content, ITERATION_LIMIT_MESSAGE);

    let last = h.provider.requests().pop().unwrap();
    let tail = last.messages.last().unwrap();
    assert_eq!(tail.role, Role::User);
    assert_eq!(tail.content, REFLECTION_PROMPT);
}

#[tokio::test]
async fn blocked_exec_runs_nothing_and_sends_nothing() {
    let mut h = harness(vec![
        call("exec", json!({"command": "touch pwned && rm -rf ./stuff"})),
        Reply::Text("I can't do that."),
    ])
    .await;

    h.agent.process(chat("wipe it"), CancellationToken::new()).await;

    let tool_output = h.tool_messages(1);
    assert_eq!(tool_output.len(), 1);
    assert!(tool_output[0].contains("blocked"));
    assert!(!h.path("pwned").exists());

    let out = h.drain_outbound().await;
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].content, "I can't do that.");
}

#[tokio::test]
async fn malformed_arguments_are_reported_to_the_model() {
    let mut h = harness(vec![
        Reply::Calls(vec![("write_file", "{not json".to_string())]),
        Reply::Text("retrying later"),
    ])
    .await;

    let outcome = h.agent.process(chat("save a note"), CancellationToken::new()).await;
    assert_eq!(outcome.end, TurnEnd::Answered);

    let tool_output = h.tool_messages(1);
    assert!(tool_output[0].starts_with("Error: invalid arguments for write_file"));
    assert_eq!(h.drain_outbound().await.len(), 1);
}

#[tokio::test]
async fn unknown_tool_does_not_abort_the_turn() {
    let mut h = harness(vec![
        call("teleport", json!({"to": "mars"})),
        Reply::Text("No teleporter, sorry."),
    ])
    .await;

    let outcome = h.agent.process(chat("beam me up"), CancellationToken::new()).await;
    assert_eq!(outcome.end, TurnEnd::Answered);
    assert_eq!(outcome.model_calls, 2);
    assert!(h.tool_messages(1)[0].contains("Tool 'teleport' not found"));
    assert_eq!(h.drain_outbound().await[0].content, "No teleporter, sorry.");
}

#[tokio::test]
async fn memory_tools_feed_the_next_prompt() {
    let mut h = harness(vec![
        Reply::Calls(vec![
            (
                "update_core_memory",
                json!({"content": "Name: Sam\nLikes: climbing"}).to_string(),
            ),
            (
                "write_entity",
                json!({"entity_name": "Project Phoenix", "content": "Rust rewrite"}).to_string(),
            ),
        ]),
        Reply::Text("Noted."),
        Reply::Text("Hi Sam"),
    ])
    .await;

    h.agent
        .process(chat("I'm Sam, I climb. Working on Phoenix."), CancellationToken::new())
        .await;
    assert_eq!(h.read("memory/MEMORY.md"), "Name: Sam\nLikes: climbing");
    assert_eq!(h.read("memory/ENTITIES/Project_Phoenix.md"), "Rust rewrite");

    h.agent.process(chat("hello again"), CancellationToken::new()).await;
    let requests = h.provider.requests();
    let prompt = &requests[2].messages[0].content;
    assert!(prompt.contains("Name: Sam"));
    assert!(prompt.contains("Project Phoenix"));
    assert!(prompt.contains("## Recent Conversational History"));
    assert!(prompt.contains("Noted."));

    let out = h.drain_outbound().await;
    let texts: Vec<_> = out.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(texts, vec!["Noted.", "Hi Sam"]);
}

#[tokio::test]
async fn internal_turns_stay_out_of_history_and_chat() {
    let mut h = harness(vec![
        Reply::Text("hey!"),
        call(
            "add_cron_job",
            json!({"label": "joke", "schedule": "0 9 * * *", "command": "echo knock knock"}),
        ),
        Reply::Text("Consolidated."),
    ])
    .await;

    h.agent.process(chat("hi"), CancellationToken::new()).await;
    let internal = InboundMessage::new(
        INTERNAL_CHANNEL,
        "system",
        CONSOLIDATION_CHAT,
        CONSOLIDATION_REQUEST,
    );
    let outcome = h.agent.process(internal, CancellationToken::new()).await;
    assert_eq!(outcome.end, TurnEnd::Answered);

    let out = h.drain_outbound().await;
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].content, "hey!");

    let jobs = h.scheduler.list().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].chat_id, "42");
    assert_eq!(jobs[0].channel, "chat");

    let history = h.read("memory/HISTORY.md");
    assert!(!history.contains("CONSOLIDATION"));
    assert!(!history.contains("Consolidated."));
    let internal_log = h.read("memory/INTERNAL.md");
    assert!(internal_log.contains("SYSTEM: [SYSTEM CONSOLIDATION REQUEST]"));
    assert!(internal_log.contains("ASSISTANT: Consolidated."));
}

#[tokio::test]
async fn heartbeat_waits_for_the_running_consolidation() {
    let mut h = harness(vec![Reply::Text("Consolidated.")]).await;
    let heartbeat = Heartbeat::new(
        h.bus.clone(),
        Duration::from_secs(3600),
        h.agent.consolidation().clone(),
    );

    assert!(heartbeat.beat().await);
    let request = h.receiver.recv_inbound().await.unwrap();
    assert!(!heartbeat.beat().await, "tick during consolidation must be skipped");

    h.agent.process(request, CancellationToken::new()).await;
    assert!(!h.agent.consolidation().in_flight());
    assert!(heartbeat.beat().await);
}

#[tokio::test]
async fn jobs_without_any_known_conversation_fail_loudly() {
    let h = harness(vec![
        call(
            "add_cron_job",
            json!({"label": "joke", "schedule": "@daily", "command": "echo ha"}),
        ),
        Reply::Text("Could not schedule."),
    ])
    .await;

    let internal = InboundMessage::new(INTERNAL_CHANNEL, "system", CONSOLIDATION_CHAT, "tidy up");
    h.agent.process(internal, CancellationToken::new()).await;

    assert!(h.tool_messages(1)[0].starts_with("Error: no conversation"));
    assert!(h.scheduler.list().await.is_empty());
}

#[tokio::test]
async fn tool_output_for_the_user_is_forwarded() {
    let mut h = harness(vec![
        Reply::Calls(vec![
            (
                "write_file",
                json!({"path": "out/report.txt", "content": "all good"}).to_string(),
            ),
            (
                "send_file",
                json!({"path": "out/report.txt", "caption": "Your report"}).to_string(),
            ),
            ("spawn", json!({"task": "watch the logs"}).to_string()),
        ]),
        Reply::Text("Done."),
    ])
    .await;

    h.agent.process(chat("report please"), CancellationToken::new()).await;

    let out = h.drain_outbound().await;
    assert_eq!(out.len(), 3);
    assert_eq!(out[0].content, "Your report");
    assert_eq!(out[0].files.len(), 1);
    assert!(out[0].files[0].ends_with("out/report.txt"));
    assert!(out[1].content.starts_with("🛠 Tool `spawn`: "));
    assert_eq!(out[2].content, "Done.");

    let spawned = h.receiver.recv_inbound().await.unwrap();
    assert_eq!(spawned.sender_id, "task-1");
    assert_eq!(spawned.chat_id, "42");

    let history = h.read("memory/HISTORY.md");
    assert!(history.contains("Your report [Attached files: "));
}

#[tokio::test]
async fn backend_failure_apologises_once() {
    let mut h = harness(vec![Reply::Fail]).await;

    let outcome = h.agent.process(chat("hello?"), CancellationToken::new()).await;
    assert_eq!(outcome.end, TurnEnd::BackendError);

    let out = h.drain_outbound().await;
    assert_eq!(out.len(), 1);
    assert_eq!(
        out[0].content,
        "Sorry, I had trouble thinking about that: the model is rate limited. \
         Please try again in a moment."
    );
    assert!(!out[0].content.contains("429"));
    assert!(!out[0].content.contains("rate_limit_exceeded"));
}

#[tokio::test]
async fn quoted_reply_is_included_in_the_user_message() {
    let h = harness(vec![Reply::Text("sure")]).await;
    let mut msg = chat("send it again");
    msg.reply_to = Some("Here is notes.txt".to_string());

    h.agent.process(msg, CancellationToken::new()).await;
    let user = &h.provider.requests()[0].messages[1];
    assert_eq!(
        user.content,
        "Context (User is replying to this previous message):\n\"Here is notes.txt\"\n\nUser's message: send it again"
    );
}

#[tokio::test]
async fn cancelled_turn_makes_no_model_calls() {
    let mut h = harness(vec![Reply::Text("never")]).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = h.agent.process(chat("hi"), cancel).await;
    assert_eq!(outcome.end, TurnEnd::Cancelled);
    assert_eq!(outcome.model_calls, 0);
    assert!(h.drain_outbound().await.is_empty());
}
