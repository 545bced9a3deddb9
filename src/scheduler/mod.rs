use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{MessageBus, OutboundMessage};
use crate::error::SchedulerError;
use crate::memory::MemoryStore;
use crate::workspace::{Workspace, CRON_FILE};

const MAX_ID_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub schedule: String,
    pub command: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub label: String,
}

impl CronJob {
    pub fn new(
        label: &str,
        schedule: &str,
        command: &str,
        channel: &str,
        chat_id: &str,
    ) -> Result<Self, SchedulerError> {
        Ok(Self {
            id: job_id_from_label(label)?,
            schedule: schedule.trim().to_string(),
            command: command.to_string(),
            chat_id: chat_id.to_string(),
            channel: channel.to_string(),
            label: label.to_string(),
        })
    }
}

/// Same label, same id: re-adding a label replaces the job.
pub fn job_id_from_label(label: &str) -> Result<String, SchedulerError> {
    let id: String = label
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(MAX_ID_LEN)
        .collect();
    if id.is_empty() {
        return Err(SchedulerError::EmptyJobId(label.to_string()));
    }
    Ok(id)
}

#[derive(Debug, Clone)]
pub enum JobSchedule {
    Cron(Box<Schedule>),
    Every(Duration),
}

impl JobSchedule {
    /// Accepts 5-field cron (seconds pinned to 0), 6/7-field cron,
    /// `@daily`-style shorthands and `@every 1h30m` intervals.
    pub fn parse(expr: &str) -> Result<Self, SchedulerError> {
        let expr = expr.trim();
        let invalid = |reason: String| SchedulerError::InvalidSchedule {
            expr: expr.to_string(),
            reason,
        };

        if let Some(interval) = expr.strip_prefix("@every") {
            return parse_interval(interval.trim())
                .map(JobSchedule::Every)
                .map_err(invalid);
        }

        let normalized = if expr.starts_with('@') {
            expr.to_string()
        } else {
            match expr.split_whitespace().count() {
                5 => format!("0 {}", expr),
                6 | 7 => expr.to_string(),
                n => {
                    return Err(invalid(format!(
                        "expected 5 to 7 cron fields, found {}",
                        n
                    )))
                }
            }
        };

        Schedule::from_str(&normalized)
            .map(|s| JobSchedule::Cron(Box::new(s)))
            .map_err(|e| invalid(e.to_string()))
    }

    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            JobSchedule::Cron(schedule) => schedule.after(&after).next(),
            JobSchedule::Every(interval) => {
                chrono::Duration::from_std(*interval).ok().map(|d| after + d)
            }
        }
    }
}

fn parse_interval(text: &str) -> Result<Duration, String> {
    if text.is_empty() {
        return Err("missing interval after @every".to_string());
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => return Err(format!("unknown interval unit '{}'", c)),
        };
        let n: u64 = digits
            .parse()
            .map_err(|_| format!("missing number before '{}'", c))?;
        total = total.saturating_add(n.saturating_mul(unit));
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(format!("interval '{}' is missing a unit (s, m or h)", text));
    }
    if total == 0 {
        return Err("interval must be greater than zero".to_string());
    }
    Ok(Duration::from_secs(total))
}

/// What a job tick needs: somewhere to run, somewhere to log, somewhere to reply.
struct JobRunner {
    workspace: Arc<Workspace>,
    memory: Arc<MemoryStore>,
    bus: MessageBus,
}

impl JobRunner {
    async fn fire(&self, job: &CronJob, cancel: &CancellationToken) -> String {
        info!("Cron job '{}' ({}) fired", job.label, job.id);

        let msg = match self.workspace.run_shell(&job.command, cancel).await {
            Ok(output) if output.success => output.text_or_placeholder(),
            Ok(output) => failure_block(&job.label, &output.output),
            Err(e) => failure_block(&job.label, &e.to_string()),
        };

        if !job.chat_id.is_empty() && !job.channel.is_empty() {
            self.bus
                .send_outbound(OutboundMessage::text(&job.channel, &job.chat_id, &msg))
                .await;
        } else {
            debug!("Cron job {} has no reply target", job.id);
        }

        let entry = format!(
            "[Cron Job Runtime] Job '{}' ({}) fired. Result: {}",
            job.label, job.id, msg
        );
        if let Err(e) = self.memory.append_internal("CRON", &entry).await {
            warn!("Failed to log cron job {} run: {}", job.id, e);
        }
        msg
    }
}

fn failure_block(label: &str, output: &str) -> String {
    format!("⚠️ Cron job `{}` failed:\n```\n{}\n```", label, output)
}

struct SchedulerState {
    jobs: BTreeMap<String, CronJob>,
    timers: HashMap<String, CancellationToken>,
    engine: Option<CancellationToken>,
}

pub struct JobScheduler {
    runner: Arc<JobRunner>,
    data_file: PathBuf,
    state: Mutex<SchedulerState>,
}

impl JobScheduler {
    pub fn new(workspace: Arc<Workspace>, memory: Arc<MemoryStore>, bus: MessageBus) -> Self {
        let data_file = workspace.path().join(CRON_FILE);
        Self {
            runner: Arc::new(JobRunner {
                workspace,
                memory,
                bus,
            }),
            data_file,
            state: Mutex::new(SchedulerState {
                jobs: BTreeMap::new(),
                timers: HashMap::new(),
                engine: None,
            }),
        }
    }

    /// Loads `CRON.json`, schedules every job and keeps timers running until
    /// `cancel` fires. Returns the number of scheduled jobs.
    pub async fn start(&self, cancel: CancellationToken) -> usize {
        let loaded = self.load().await;
        let mut state = self.state.lock().await;
        if state.engine.is_some() {
            warn!("Job scheduler already running");
            return state.timers.len();
        }

        let engine = cancel.child_token();
        state.engine = Some(engine.clone());
        for job in loaded {
            state.jobs.insert(job.id.clone(), job);
        }

        let jobs: Vec<CronJob> = state.jobs.values().cloned().collect();
        let mut scheduled = 0;
        for job in jobs {
            match JobSchedule::parse(&job.schedule) {
                Ok(schedule) => {
                    let token = engine.child_token();
                    state.timers.insert(job.id.clone(), token.clone());
                    self.spawn_timer(job, schedule, token);
                    scheduled += 1;
                }
                Err(e) => warn!("Failed to schedule job {}: {}", job.id, e),
            }
        }

        tokio::spawn(async move {
            engine.cancelled().await;
            info!("Job scheduler stopped");
        });

        info!("Job scheduler started with {} job(s)", scheduled);
        scheduled
    }

    /// Adds or replaces the job with the same id. The schedule is validated
    /// and `CRON.json` written before the running state is touched.
    pub async fn add(&self, job: CronJob) -> Result<(), SchedulerError> {
        let schedule = JobSchedule::parse(&job.schedule)?;
        let mut state = self.state.lock().await;

        let mut jobs = state.jobs.clone();
        jobs.insert(job.id.clone(), job.clone());
        self.persist(&jobs).await?;
        state.jobs = jobs;

        if let Some(old) = state.timers.remove(&job.id) {
            info!("Replacing existing cron job {}", job.id);
            old.cancel();
        }
        if let Some(engine) = state.engine.clone() {
            let token = engine.child_token();
            state.timers.insert(job.id.clone(), token.clone());
            self.spawn_timer(job.clone(), schedule, token);
        }

        info!(
            "Added cron job {} '{}' ({}): {}",
            job.id, job.label, job.schedule, job.command
        );
        Ok(())
    }

    /// Removes a job by id or label.
    pub async fn remove(&self, id_or_label: &str) -> Result<CronJob, SchedulerError> {
        let mut state = self.state.lock().await;

        let key = if state.jobs.contains_key(id_or_label) {
            Some(id_or_label.to_string())
        } else {
            state
                .jobs
                .values()
                .find(|j| j.label == id_or_label)
                .map(|j| j.id.clone())
                .or_else(|| {
                    job_id_from_label(id_or_label)
                        .ok()
                        .filter(|id| state.jobs.contains_key(id))
                })
        };
        let key = key.ok_or_else(|| SchedulerError::NotFound(id_or_label.to_string()))?;

        let mut jobs = state.jobs.clone();
        let removed = jobs
            .remove(&key)
            .ok_or_else(|| SchedulerError::NotFound(id_or_label.to_string()))?;
        self.persist(&jobs).await?;
        state.jobs = jobs;

        if let Some(timer) = state.timers.remove(&key) {
            timer.cancel();
        }
        info!("Removed cron job {}", key);
        Ok(removed)
    }

    pub async fn list(&self) -> Vec<CronJob> {
        self.state.lock().await.jobs.values().cloned().collect()
    }

    /// Cancels every timer. Jobs stay registered and persisted.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        for (_, timer) in state.timers.drain() {
            timer.cancel();
        }
        if let Some(engine) = state.engine.take() {
            engine.cancel();
        }
    }

    /// Runs a job once, outside its schedule. Returns the delivered text.
    pub async fn run_now(&self, job: &CronJob) -> String {
        self.runner.fire(job, &CancellationToken::new()).await
    }

    fn spawn_timer(&self, job: CronJob, schedule: JobSchedule, token: CancellationToken) {
        let runner = self.runner.clone();
        tokio::spawn(async move {
            let mut cursor = Utc::now();
            while let Some(next) = schedule.next_after(cursor) {
                let delay = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                runner.fire(&job, &token).await;
                if token.is_cancelled() {
                    break;
                }
                cursor = next.max(Utc::now());
            }
            debug!("Timer for cron job {} ended", job.id);
        });
    }

    async fn load(&self) -> Vec<CronJob> {
        let raw = match tokio::fs::read_to_string(&self.data_file).await {
            Ok(raw) => raw,
            Err(e) => {
                info!("No existing cron jobs loaded ({}), starting fresh", e);
                return Vec::new();
            }
        };
        match serde_json::from_str::<Vec<CronJob>>(&raw) {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("Ignoring unreadable {:?}: {}", self.data_file, e);
                Vec::new()
            }
        }
    }

    async fn persist(&self, jobs: &BTreeMap<String, CronJob>) -> Result<(), SchedulerError> {
        let list: Vec<&CronJob> = jobs.values().collect();
        let persist_err = |reason: String| SchedulerError::Persist {
            path: self.data_file.clone(),
            reason,
        };
        let data = serde_json::to_string_pretty(&list).map_err(|e| persist_err(e.to_string()))?;
        tokio::fs::write(&self.data_file, data)
            .await
            .map_err(|e| persist_err(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusReceiver;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        workspace: Arc<Workspace>,
        memory: Arc<MemoryStore>,
        receiver: BusReceiver,
        scheduler: JobScheduler,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let workspace =
            Arc::new(Workspace::new(dir.path(), Vec::new(), Duration::from_secs(5)).unwrap());
        let memory = Arc::new(MemoryStore::open(workspace.path(), 1024 * 1024).await.unwrap());
        let (bus, receiver) = MessageBus::new(16);
        let scheduler = JobScheduler::new(workspace.clone(), memory.clone(), bus);
        Fixture {
            _dir: dir,
            workspace,
            memory,
            receiver,
            scheduler,
        }
    }

    #[test]
    fn ids_are_derived_from_labels() {
        assert_eq!(job_id_from_label("Morning joke!").unwrap(), "Morningjoke");
        assert_eq!(
            job_id_from_label("a very long label that keeps going").unwrap(),
            "averylonglabelthatke"
        );
        assert!(matches!(
            job_id_from_label("!!! ---"),
            Err(SchedulerError::EmptyJobId(_))
        ));
    }

    #[test]
    fn schedule_grammar() {
        assert!(matches!(
            JobSchedule::parse("*/5 * * * *"),
            Ok(JobSchedule::Cron(_))
        ));
        assert!(JobSchedule::parse("0 30 9 * * Mon-Fri").is_ok());
        assert!(JobSchedule::parse("@daily").is_ok());
        match JobSchedule::parse("@every 1h30m").unwrap() {
            JobSchedule::Every(d) => assert_eq!(d, Duration::from_secs(5400)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(JobSchedule::parse("@every 10").is_err());
        assert!(JobSchedule::parse("@every 0s").is_err());
        assert!(JobSchedule::parse("every day please").is_err());
        assert!(JobSchedule::parse("* *").is_err());
    }

    #[test]
    fn five_field_cron_fires_on_the_minute() {
        let schedule = JobSchedule::parse("* * * * *").unwrap();
        let now = Utc::now();
        let next = schedule.next_after(now).unwrap();
        assert_eq!(next.timestamp() % 60, 0);
        assert!(next > now);
    }

    #[tokio::test]
    async fn re_adding_a_label_replaces_the_job() {
        let f = fixture().await;
        f.scheduler.start(CancellationToken::new()).await;

        let first = CronJob::new("joke", "@every 1h", "echo one", "chat", "42").unwrap();
        let second = CronJob::new("joke", "0 9 * * *", "echo two", "chat", "42").unwrap();
        f.scheduler.add(first).await.unwrap();
        f.scheduler.add(second).await.unwrap();

        let jobs = f.scheduler.list().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].schedule, "0 9 * * *");
        assert_eq!(jobs[0].command, "echo two");

        let persisted: Vec<CronJob> = serde_json::from_str(
            &std::fs::read_to_string(f.workspace.path().join(CRON_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(persisted, jobs);
        f.scheduler.stop().await;
    }

    #[tokio::test]
    async fn invalid_schedule_leaves_existing_job_alone() {
        let f = fixture().await;
        let job = CronJob::new("backup", "@every 1h", "echo ok", "chat", "1").unwrap();
        f.scheduler.add(job.clone()).await.unwrap();

        let mut broken = job.clone();
        broken.schedule = "not a schedule".to_string();
        assert!(f.scheduler.add(broken).await.is_err());
        assert_eq!(f.scheduler.list().await, vec![job]);
    }

    #[tokio::test]
    async fn remove_by_id_or_label_and_reload_from_disk() {
        let f = fixture().await;
        f.scheduler
            .add(CronJob::new("Water plants", "@daily", "echo water", "chat", "1").unwrap())
            .await
            .unwrap();
        f.scheduler
            .add(CronJob::new("stretch", "@hourly", "echo stretch", "chat", "1").unwrap())
            .await
            .unwrap();

        let removed = f.scheduler.remove("Water plants").await.unwrap();
        assert_eq!(removed.id, "Waterplants");
        assert!(matches!(
            f.scheduler.remove("Waterplants").await,
            Err(SchedulerError::NotFound(_))
        ));

        let (bus, _rx) = MessageBus::new(4);
        let reloaded = JobScheduler::new(f.workspace.clone(), f.memory.clone(), bus);
        let cancel = CancellationToken::new();
        assert_eq!(reloaded.start(cancel.clone()).await, 1);
        assert_eq!(reloaded.list().await[0].id, "stretch");
        cancel.cancel();
    }

    #[tokio::test]
    async fn tick_delivers_output_and_logs_internally() {
        let mut f = fixture().await;
        let ok = CronJob::new("greet", "@every 1h", "echo hi", "chat", "42").unwrap();
        assert_eq!(f.scheduler.run_now(&ok).await.trim(), "hi");
        let out = f.receiver.recv_outbound().await.unwrap();
        assert_eq!(out.chat_id, "42");
        assert_eq!(out.content.trim(), "hi");

        let bad = CronJob::new("broken", "@every 1h", "echo nope; exit 1", "chat", "42").unwrap();
        let msg = f.scheduler.run_now(&bad).await;
        assert!(msg.starts_with("⚠️ Cron job `broken` failed:"));

        let silent = CronJob::new("quiet", "@every 1h", "true", "", "").unwrap();
        assert_eq!(f.scheduler.run_now(&silent).await, "(no output)");

        let internal = std::fs::read_to_string(
            f.workspace.path().join("memory").join("INTERNAL.md"),
        )
        .unwrap();
        assert!(internal.contains("[Cron Job Runtime] Job 'greet' (greet) fired."));
        assert!(internal.contains("CRON"));
    }

    #[tokio::test]
    async fn failed_write_leaves_jobs_untouched() {
        let f = fixture().await;
        let cancel = CancellationToken::new();
        f.scheduler.start(cancel.clone()).await;
        let kept = CronJob::new("stretch", "@hourly", "echo stretch", "chat", "1").unwrap();
        f.scheduler.add(kept.clone()).await.unwrap();

        let data_file = f.workspace.path().join(CRON_FILE);
        std::fs::remove_file(&data_file).unwrap();
        std::fs::create_dir(&data_file).unwrap();

        let joke = CronJob::new("joke", "@every 1h", "echo ha", "chat", "1").unwrap();
        assert!(matches!(
            f.scheduler.add(joke).await,
            Err(SchedulerError::Persist { .. })
        ));
        assert!(matches!(
            f.scheduler.remove("stretch").await,
            Err(SchedulerError::Persist { .. })
        ));
        assert_eq!(f.scheduler.list().await, vec![kept]);

        let state = f.scheduler.state.lock().await;
        assert_eq!(state.timers.len(), 1);
        assert!(state.timers.contains_key("stretch"));
        drop(state);
        cancel.cancel();
    }

    #[tokio::test]
    async fn second_start_does_not_duplicate_timers() {
        let mut f = fixture().await;
        let cancel = CancellationToken::new();
        f.scheduler.start(cancel.clone()).await;
        f.scheduler
            .add(CronJob::new("tick", "@every 1s", "echo tock", "chat", "7").unwrap())
            .await
            .unwrap();
        assert_eq!(f.scheduler.start(cancel.clone()).await, 1);

        let first = tokio::time::timeout(Duration::from_secs(5), f.receiver.recv_outbound())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.content.trim(), "tock");
        // A duplicated timer would deliver a second tick right behind the first.
        let again =
            tokio::time::timeout(Duration::from_millis(500), f.receiver.recv_outbound()).await;
        assert!(again.is_err());
        cancel.cancel();
    }

    #[tokio::test]
    async fn interval_jobs_fire_on_their_own() {
        let mut f = fixture().await;
        let cancel = CancellationToken::new();
        f.scheduler.start(cancel.clone()).await;
        f.scheduler
            .add(CronJob::new("tick", "@every 1s", "echo tock", "chat", "7").unwrap())
            .await
            .unwrap();

        let out = tokio::time::timeout(Duration::from_secs(5), f.receiver.recv_outbound())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.content.trim(), "tock");
        cancel.cancel();
    }
}
