use anyhow::{Context, Result};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::SandboxError;

pub const MEMORY_DIR: &str = "memory";
pub const ENTITIES_DIR: &str = "ENTITIES";
pub const LONG_TERM_FILE: &str = "MEMORY.md";
pub const HISTORY_FILE: &str = "HISTORY.md";
pub const INTERNAL_FILE: &str = "INTERNAL.md";
pub const HISTORY_ARCHIVE_PREFIX: &str = "HISTORY_ARCHIVE_";
pub const SKILLS_DIR: &str = "skills";
pub const CRON_FILE: &str = "CRON.json";

#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub success: bool,
    pub status: String,
    pub output: String,
}

impl ShellOutput {
    pub fn text_or_placeholder(&self) -> String {
        if self.output.trim().is_empty() {
            "(no output)".to_string()
        } else {
            self.output.clone()
        }
    }
}

#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    blocked_commands: Vec<String>,
    exec_timeout: Duration,
}

impl Workspace {
    pub fn new(path: &Path, blocked_commands: Vec<String>, exec_timeout: Duration) -> Result<Self> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create workspace: {}", path.display()))?;
        let root = path
            .canonicalize()
            .with_context(|| format!("Unreadable workspace: {}", path.display()))?;
        std::fs::create_dir_all(root.join(SKILLS_DIR))
            .with_context(|| "Failed to create skills directory")?;

        info!("Workspace: {:?}", root);
        Ok(Self {
            root,
            blocked_commands,
            exec_timeout,
        })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.root.join(SKILLS_DIR)
    }

    pub fn exec_timeout(&self) -> Duration {
        self.exec_timeout
    }

    pub fn resolve(&self, requested: &str) -> Result<PathBuf, SandboxError> {
        resolve_path(&self.root, requested)
    }

    pub fn check_command(&self, command: &str) -> Result<(), SandboxError> {
        match self
            .blocked_commands
            .iter()
            .find(|pattern| command.contains(pattern.as_str()))
        {
            Some(pattern) => Err(SandboxError::BlockedCommand(pattern.clone())),
            None => Ok(()),
        }
    }

    /// Runs `sh -c <command>` inside the workspace. The blocklist is not
    /// consulted here; callers exposing this to the model must check first.
    pub async fn run_shell(&self, command: &str, cancel: &CancellationToken) -> Result<ShellOutput> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        self.run(cmd, cancel).await
    }

    pub async fn run_script(
        &self,
        interpreter: &str,
        script: &Path,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<ShellOutput> {
        let mut cmd = Command::new(interpreter);
        cmd.arg(script).args(args);
        self.run(cmd, cancel).await
    }

    async fn run(&self, mut cmd: Command, cancel: &CancellationToken) -> Result<ShellOutput> {
        cmd.current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().context("failed to spawn process")?;
        debug!("Spawned process in {:?}", self.root);

        let output = tokio::select! {
            result = tokio::time::timeout(self.exec_timeout, child.wait_with_output()) => {
                match result {
                    Ok(output) => output.context("failed to collect process output")?,
                    Err(_) => anyhow::bail!("timed out after {}s", self.exec_timeout.as_secs()),
                }
            }
            _ = cancel.cancelled() => anyhow::bail!("cancelled"),
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }

        Ok(ShellOutput {
            success: output.status.success(),
            status: output.status.to_string(),
            output: combined,
        })
    }
}

/// Lexically resolves `requested` against `root` without touching the
/// filesystem. Absolute paths are accepted only when they already point inside
/// the root.
pub fn resolve_path(root: &Path, requested: &str) -> Result<PathBuf, SandboxError> {
    let requested_path = Path::new(requested.trim());

    let relative = if requested_path.is_absolute() {
        let cleaned = normalize(requested_path)
            .ok_or_else(|| SandboxError::OutsideWorkspace(requested.to_string()))?;
        match cleaned.strip_prefix(root) {
            Ok(rest) => rest.to_path_buf(),
            Err(_) => return Err(SandboxError::OutsideWorkspace(requested.to_string())),
        }
    } else {
        requested_path.to_path_buf()
    };

    let resolved = normalize(&root.join(relative))
        .ok_or_else(|| SandboxError::OutsideWorkspace(requested.to_string()))?;
    if !resolved.starts_with(root) {
        return Err(SandboxError::OutsideWorkspace(requested.to_string()));
    }

    if let Ok(inside) = resolved.strip_prefix(root) {
        if touches_memory(inside) {
            return Err(SandboxError::MemoryFile(requested.to_string()));
        }
    }

    Ok(resolved)
}

fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Some(out)
}

fn touches_memory(inside: &Path) -> bool {
    let base = inside
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let owned_file = [LONG_TERM_FILE, HISTORY_FILE, INTERNAL_FILE]
        .iter()
        .any(|f| base.eq_ignore_ascii_case(f))
        || base.starts_with(HISTORY_ARCHIVE_PREFIX);

    let entity_dir = inside.components().any(|c| match c {
        Component::Normal(part) => part
            .to_str()
            .map(|p| p.eq_ignore_ascii_case(ENTITIES_DIR))
            .unwrap_or(false),
        _ => false,
    });

    owned_file || entity_dir
}
