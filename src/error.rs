use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Path {0} escapes workspace boundaries")]
    OutsideWorkspace(String),

    #[error(
        "Direct file access to memory files is prohibited ({0}). You MUST use \
         'update_core_memory', 'write_entity', 'list_entities', or 'read_entity' instead."
    )]
    MemoryFile(String),

    #[error("Command blocked by safety guard (dangerous pattern '{0}' detected)")]
    BlockedCommand(String),
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("invalid entity name '{0}'")]
    InvalidEntityName(String),

    #[error("memory I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid schedule '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },

    #[error("label '{0}' does not contain any alphanumeric characters")]
    EmptyJobId(String),

    #[error("job '{0}' not found")]
    NotFound(String),

    #[error("no conversation to reply to; the user has to message me first")]
    NoReplyTarget,

    #[error("failed to persist jobs to {path}: {reason}")]
    Persist { path: PathBuf, reason: String },
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request to model backend failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("model backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("model backend returned an unusable response: {0}")]
    Malformed(String),

    #[error("request cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Short plain-language cause, safe to show in a chat.
    pub fn summary(&self) -> &'static str {
        match self {
            ProviderError::Transport(e) if e.is_timeout() => "the model took too long to answer",
            ProviderError::Transport(_) => "I could not reach the model",
            ProviderError::Status { status: 429, .. } => "the model is rate limited",
            ProviderError::Status { status: 401 | 403, .. } => "the model rejected my credentials",
            ProviderError::Status { status, .. } if *status >= 500 => "the model service is down",
            ProviderError::Status { .. } => "the model refused the request",
            ProviderError::Malformed(_) => "the model sent a reply I could not read",
            ProviderError::Cancelled => "the request was cancelled",
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("{0}")]
    Failed(String),
}
