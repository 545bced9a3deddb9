use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use littleclaw::{
    agent::{Agent, AgentSettings, Heartbeat},
    bus::{Dispatcher, MessageBus},
    config::{Config, LoggingConfig},
    memory::MemoryStore,
    provider::{OpenAiProvider, Provider},
    scheduler::JobScheduler,
    telegram::TelegramChannel,
    tools::ToolRegistry,
    workspace::Workspace,
    VERSION,
};

#[derive(Parser, Debug)]
#[command(name = "littleclaw")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the agent (default)
    Run,
    /// Delete the workspace: memory, skills, jobs and files
    Reset {
        #[arg(long)]
        yes: bool,
    },
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("littleclaw=info"));

    match &logging.file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)?;
    init_logging(&config.logging)?;

    match args.command.unwrap_or(Cmd::Run) {
        Cmd::Run => run(config).await,
        Cmd::Reset { yes } => reset(&config.workspace.path, yes),
    }
}

fn reset(workspace: &Path, yes: bool) -> Result<()> {
    if !workspace.exists() {
        println!("Nothing to reset: {} does not exist", workspace.display());
        return Ok(());
    }

    if !yes {
        print!(
            "This permanently deletes {} (memory, skills, jobs). Type 'yes' to continue: ",
            workspace.display()
        );
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        if answer.trim() != "yes" {
            println!("Aborted.");
            return Ok(());
        }
    }

    std::fs::remove_dir_all(workspace)
        .with_context(|| format!("Failed to delete {}", workspace.display()))?;
    println!("🧹 Workspace {} deleted.", workspace.display());
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    config.validate()?;
    println!(
        "🦀 Littleclaw v{} | {} via {}",
        VERSION,
        config.provider.model,
        config.provider.kind.as_str()
    );

    let workspace = Arc::new(Workspace::new(
        &config.workspace.path,
        config.tools.blocked_commands.clone(),
        Duration::from_secs(config.tools.exec_timeout_secs),
    )?);
    let memory = Arc::new(
        MemoryStore::open(workspace.path(), config.memory.rotate_bytes)
            .await
            .context("Failed to open memory store")?,
    );
    let registry = ToolRegistry::new(workspace.clone());
    let (bus, receiver) = MessageBus::new(config.bus.capacity);

    let scheduler = config.scheduler.enabled.then(|| {
        Arc::new(JobScheduler::new(
            workspace.clone(),
            memory.clone(),
            bus.clone(),
        ))
    });

    let provider: Arc<dyn Provider> = Arc::new(OpenAiProvider::new(&config.provider)?);
    let agent = Arc::new(Agent::new(
        provider,
        registry,
        memory,
        scheduler.clone(),
        bus.clone(),
        AgentSettings::from_config(&config),
    ));

    let cancel = CancellationToken::new();
    let telegram = TelegramChannel::new(&config.telegram, bus.clone());

    let consolidation = agent.consolidation().clone();
    let mut dispatcher = Dispatcher::new(receiver, agent);
    dispatcher.add_sink(telegram.sink());
    let tracker = dispatcher.tracker();
    let dispatch = tokio::spawn(dispatcher.run(cancel.clone()));

    if let Some(scheduler) = &scheduler {
        scheduler.start(cancel.clone()).await;
    }

    if config.heartbeat.enabled {
        let heartbeat = Heartbeat::new(
            bus.clone(),
            Duration::from_secs(config.heartbeat.interval_secs),
            consolidation,
        );
        tokio::spawn(heartbeat.run(cancel.clone()));
    }

    let bot_cancel = cancel.clone();
    let bot = tokio::spawn(async move {
        if let Err(e) = telegram.run(bot_cancel).await {
            error!("Telegram adapter stopped: {:#}", e);
        }
    });

    info!("✅ Littleclaw is running. Press Ctrl-C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down...");
    cancel.cancel();
    if let Some(scheduler) = &scheduler {
        scheduler.stop().await;
    }
    let _ = dispatch.await;
    let _ = bot.await;
    tracker.wait().await;

    info!("Goodbye! 🦀");
    Ok(())
}
