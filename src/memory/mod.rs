use chrono::Local;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::MemoryError;
use crate::workspace::{
    ENTITIES_DIR, HISTORY_ARCHIVE_PREFIX, HISTORY_FILE, INTERNAL_FILE, LONG_TERM_FILE, MEMORY_DIR,
};

pub const NO_MEMORY_SENTINEL: &str = "No deeply personalized memory found yet.";

type Result<T> = std::result::Result<T, MemoryError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> MemoryError + '_ {
    move |source| MemoryError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// File-backed, two-tier memory: a long-term profile plus per-entity
/// records, and the append-only history/internal logs.
///
/// Every file has its own lock, so writes to one file are serialized while
/// unrelated files never contend.
#[derive(Debug)]
pub struct MemoryStore {
    memory_dir: PathBuf,
    entities_dir: PathBuf,
    long_term_file: PathBuf,
    history_file: PathBuf,
    internal_file: PathBuf,
    rotate_bytes: u64,
    long_term_lock: RwLock<()>,
    history_lock: RwLock<()>,
    internal_lock: RwLock<()>,
    entity_locks: StdMutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl MemoryStore {
    pub async fn open(workspace: &Path, rotate_bytes: u64) -> Result<Self> {
        let memory_dir = workspace.join(MEMORY_DIR);
        let entities_dir = memory_dir.join(ENTITIES_DIR);
        fs::create_dir_all(&entities_dir)
            .await
            .map_err(io_err(&entities_dir))?;

        Ok(Self {
            long_term_file: memory_dir.join(LONG_TERM_FILE),
            history_file: memory_dir.join(HISTORY_FILE),
            internal_file: memory_dir.join(INTERNAL_FILE),
            memory_dir,
            entities_dir,
            rotate_bytes,
            long_term_lock: RwLock::new(()),
            history_lock: RwLock::new(()),
            internal_lock: RwLock::new(()),
            entity_locks: StdMutex::new(HashMap::new()),
        })
    }

    pub fn memory_dir(&self) -> &Path {
        &self.memory_dir
    }

    pub async fn read_long_term(&self) -> String {
        let _guard = self.long_term_lock.read().await;
        read_or_empty(&self.long_term_file).await
    }

    pub async fn write_long_term(&self, content: &str) -> Result<()> {
        let _guard = self.long_term_lock.write().await;
        fs::write(&self.long_term_file, content)
            .await
            .map_err(io_err(&self.long_term_file))?;
        info!("Core memory updated ({} bytes)", content.len());
        Ok(())
    }

    pub async fn append_history(&self, role: &str, content: &str) -> Result<()> {
        let _guard = self.history_lock.write().await;
        self.rotate_history_if_needed().await;
        append_entry(&self.history_file, role, content).await
    }

    pub async fn append_internal(&self, role: &str, content: &str) -> Result<()> {
        let _guard = self.internal_lock.write().await;
        append_entry(&self.internal_file, role, content).await
    }

    // Rotation failures are swallowed so that logging can continue.
    async fn rotate_history_if_needed(&self) {
        let size = match fs::metadata(&self.history_file).await {
            Ok(meta) => meta.len(),
            Err(_) => return,
        };
        if size <= self.rotate_bytes {
            return;
        }

        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let mut archive = self
            .memory_dir
            .join(format!("{}{}.md", HISTORY_ARCHIVE_PREFIX, stamp));
        let mut counter = 1;
        while fs::try_exists(&archive).await.unwrap_or(false) {
            archive = self
                .memory_dir
                .join(format!("{}{}_{}.md", HISTORY_ARCHIVE_PREFIX, stamp, counter));
            counter += 1;
        }

        match fs::rename(&self.history_file, &archive).await {
            Ok(()) => info!("Rotated history ({} bytes) to {:?}", size, archive),
            Err(e) => warn!("History rotation failed, continuing: {}", e),
        }
    }

    /// Returns at most `max_bytes` from the end of the history. When the read
    /// starts mid-file the partial first line is dropped.
    pub async fn read_recent_history(&self, max_bytes: u64) -> String {
        let _guard = self.history_lock.read().await;
        match read_tail(&self.history_file, max_bytes).await {
            Ok(text) => text,
            Err(e) => {
                debug!("No recent history available: {}", e);
                String::new()
            }
        }
    }

    pub async fn read_entity(&self, name: &str) -> Result<Option<String>> {
        let file = self.entity_path(name)?;
        let lock = self.entity_lock(&file);
        let _guard = lock.read().await;
        match fs::read_to_string(&file).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&file)(e)),
        }
    }

    pub async fn write_entity(&self, name: &str, content: &str) -> Result<()> {
        let file = self.entity_path(name)?;
        let lock = self.entity_lock(&file);
        let _guard = lock.write().await;
        fs::write(&file, content).await.map_err(io_err(&file))?;
        info!("Entity '{}' saved", name);
        Ok(())
    }

    pub async fn list_entities(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.entities_dir)
            .await
            .map_err(io_err(&self.entities_dir))?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(io_err(&self.entities_dir))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(display_name(stem));
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn build_context(&self) -> String {
        let long_term = self.read_long_term().await;
        let entities = self.list_entities().await.unwrap_or_default();

        if long_term.trim().is_empty() && entities.is_empty() {
            return NO_MEMORY_SENTINEL.to_string();
        }

        let mut context = String::from("## Personal Context & Memory\n\n");
        if long_term.trim().is_empty() {
            context.push_str("(No core profile yet.)\n");
        } else {
            context.push_str(long_term.trim_end());
            context.push('\n');
        }
        if !entities.is_empty() {
            context.push_str(&format!(
                "\nKnown entities (use read_entity for details): {}\n",
                entities.join(", ")
            ));
        }
        context
    }

    fn entity_path(&self, name: &str) -> Result<PathBuf> {
        let file_name = file_name_for_entity(name)?;
        Ok(self.entities_dir.join(format!("{}.md", file_name)))
    }

    fn entity_lock(&self, file: &Path) -> Arc<RwLock<()>> {
        let key = file.to_string_lossy().to_string();
        let mut locks = match self.entity_locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(key).or_default().clone()
    }
}

pub fn file_name_for_entity(name: &str) -> Result<String> {
    let trimmed = name.trim();
    let invalid = trimmed.is_empty()
        || trimmed.starts_with('.')
        || trimmed.contains(['/', '\\', '\0']);
    if invalid {
        return Err(MemoryError::InvalidEntityName(name.to_string()));
    }
    Ok(trimmed.replace(' ', "_"))
}

pub fn display_name(file_stem: &str) -> String {
    file_stem.replace('_', " ")
}

async fn read_or_empty(path: &Path) -> String {
    fs::read_to_string(path).await.unwrap_or_default()
}

async fn append_entry(path: &Path, role: &str, content: &str) -> Result<()> {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    let entry = format!("[{}] {}: {}\n\n", timestamp, role.to_uppercase(), content);

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(io_err(path))?;
    file.write_all(entry.as_bytes())
        .await
        .map_err(io_err(path))?;
    file.flush().await.map_err(io_err(path))
}

async fn read_tail(path: &Path, max_bytes: u64) -> std::io::Result<String> {
    let mut file = fs::File::open(path).await?;
    let size = file.metadata().await?.len();
    if size == 0 {
        return Ok(String::new());
    }

    let start = size.saturating_sub(max_bytes);
    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = Vec::with_capacity((size - start) as usize);
    file.read_to_end(&mut buf).await?;

    let text = String::from_utf8_lossy(&buf);
    if start == 0 {
        return Ok(text.trim().to_string());
    }

    match text.find('\n') {
        Some(idx) => Ok(text[idx + 1..].trim().to_string()),
        None => Ok(String::new()),
    }
}
