use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use vault_orchestrator::approval::SAMPLE_POLICY;
use vault_orchestrator::audit::AuditLog;
use vault_orchestrator::config::OrchestratorConfig;
use vault_orchestrator::orchestrator::{Orchestrator, TriggerSchedule, spawn_trigger_loop};
use vault_orchestrator::status::VaultStatus;
use vault_orchestrator::vault::{Vault, paths};
use vault_orchestrator::watchers::{DropFolderWatcher, spawn_watcher_loop};

#[derive(Parser)]
#[command(name = "vault-orchestrator", version, about = "Folder-backed task orchestration with human approval")]
struct Cli {
    /// Vault root folder.
    #[arg(long, global = true)]
    vault: Option<PathBuf>,

    /// Logical owner name used for claims.
    #[arg(long, global = true)]
    owner: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the trigger loop until interrupted.
    Run(RunArgs),
    /// Run a single iteration and print its report.
    Once(RunArgs),
    /// Run the drop-folder watcher on its own.
    Watch {
        /// Seconds between polls.
        #[arg(long, default_value_t = 10)]
        interval: u64,
    },
    /// Print folder counts and claims as JSON.
    Status,
    /// Create the folder layout and a sample approval policy.
    Init,
}

#[derive(Args)]
struct RunArgs {
    /// Seconds between iterations.
    #[arg(long)]
    interval: Option<u64>,

    /// Cron expression; replaces the interval.
    #[arg(long)]
    schedule: Option<String>,

    /// Reasoning engine program.
    #[arg(long)]
    engine: Option<String>,

    /// Argument passed to the engine before the prompt. Repeatable.
    #[arg(long = "engine-arg")]
    engine_args: Vec<String>,

    /// Engine time budget in seconds.
    #[arg(long)]
    engine_timeout: Option<u64>,

    /// Approval policy file.
    #[arg(long)]
    policy: Option<PathBuf>,

    /// Do not watch the Inbox drop folder.
    #[arg(long)]
    no_drop_folder: bool,
}

impl RunArgs {
    fn apply(self, config: &mut OrchestratorConfig) {
        if let Some(secs) = self.interval {
            config.interval = Duration::from_secs(secs);
        }
        if self.schedule.is_some() {
            config.schedule = self.schedule;
        }
        if self.engine.is_some() {
            config.engine_program = self.engine;
        }
        if !self.engine_args.is_empty() {
            config.engine_args = self.engine_args;
        }
        if let Some(secs) = self.engine_timeout {
            config.engine_timeout = Duration::from_secs(secs);
        }
        if self.policy.is_some() {
            config.policy_path = self.policy;
        }
        if self.no_drop_folder {
            config.drop_folder = false;
        }
    }
}

/// Console logging plus a daily rolling file in `<vault>/Logs/` when that
/// folder exists.
fn init_tracing(vault_root: &Path) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let logs = vault_root.join(paths::LOGS);

    if logs.is_dir() {
        let appender = tracing_appender::rolling::daily(&logs, "orchestrator.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .with(fmt::layer().with_target(false).with_ansi(false).with_writer(writer))
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry().with(filter).with(console).init();
        None
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut config = match OrchestratorConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(vault) = cli.vault {
        config.vault_root = vault;
    }
    if let Some(owner) = cli.owner {
        config.owner_name = owner;
    }

    let _guard = init_tracing(&config.vault_root);

    let result = match cli.command {
        Command::Run(args) => {
            args.apply(&mut config);
            run(config).await
        }
        Command::Once(args) => {
            args.apply(&mut config);
            once(config).await
        }
        Command::Watch { interval } => watch(config, Duration::from_secs(interval.max(1))).await,
        Command::Status => status(config).await,
        Command::Init => init(config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Exiting");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: OrchestratorConfig) -> anyhow::Result<()> {
    config.validate()?;
    let schedule = TriggerSchedule::from_config(&config)?;
    let orchestrator = Orchestrator::from_config(config)
        .await
        .context("failed to start orchestrator")?;

    eprintln!("📂 Vault Orchestrator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Vault: {}", orchestrator.vault().root().display());
    eprintln!("   Owner: {}", orchestrator.owner());
    eprintln!("   Schedule: {schedule}");
    eprintln!(
        "   Engine: {}",
        orchestrator
            .config()
            .engine_program
            .as_deref()
            .unwrap_or("none")
    );
    eprintln!("   Press Ctrl-C to stop.\n");

    let (mut handle, shutdown) = spawn_trigger_loop(Arc::new(orchestrator), schedule);
    tokio::select! {
        joined = &mut handle => {
            joined.context("trigger loop panicked")??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupt received, finishing current iteration");
            shutdown.store(true, Ordering::Relaxed);
            handle.await.context("trigger loop panicked")??;
        }
    }
    Ok(())
}

async fn once(config: OrchestratorConfig) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::from_config(config)
        .await
        .context("failed to start orchestrator")?;
    orchestrator.startup(Utc::now()).await?;
    let report = orchestrator.run_once(Utc::now()).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn watch(config: OrchestratorConfig, interval: Duration) -> anyhow::Result<()> {
    let vault = Vault::open(&config.vault_root).await?;
    vault.ensure_layout().await?;
    let audit = AuditLog::new(vault.resolve(paths::LOGS));
    let watcher = Arc::new(DropFolderWatcher::new(vault.resolve(paths::INBOX)));

    eprintln!("   Watching {} every {}s", vault.resolve(paths::INBOX).display(), interval.as_secs());
    let (handle, shutdown) =
        spawn_watcher_loop(watcher, vault, audit, config.offset_retention, interval);
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    shutdown.store(true, Ordering::Relaxed);
    handle.await.context("watcher panicked")?;
    Ok(())
}

async fn status(config: OrchestratorConfig) -> anyhow::Result<()> {
    let vault = Vault::open(&config.vault_root).await?;
    let status = VaultStatus::collect(&vault, Utc::now(), config.approval_ttl).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn init(config: OrchestratorConfig) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.vault_root)
        .await
        .with_context(|| format!("cannot create {}", config.vault_root.display()))?;
    let vault = Vault::open(&config.vault_root).await?;
    vault.ensure_layout().await?;

    let policy = config.policy_path();
    if tokio::fs::try_exists(&policy).await.unwrap_or(false) {
        eprintln!("   Policy already present: {}", policy.display());
    } else {
        tokio::fs::write(&policy, SAMPLE_POLICY)
            .await
            .with_context(|| format!("cannot write {}", policy.display()))?;
        eprintln!("   Wrote sample policy: {}", policy.display());
    }
    eprintln!("   Vault ready at {}", vault.root().display());
    Ok(())
}
