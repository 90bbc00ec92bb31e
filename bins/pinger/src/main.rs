mod app;
mod heartbeat;
mod http;
mod module;
#[cfg(feature = "web-api")]
mod status;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ping_core::cfg::AppId;
use ping_core::driver::DEFAULT_CONSTRAINT_POLL;
use ping_core::job::{CycleOutcome, ExistingJobPolicy, JobStatus};
use ping_core::logx;
use ping_core::ping::DeviceIdProvider;
use ping_core::scheduler::{DueOutcome, JobSpec};
use ping_core::store::{keys, KvSerde};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::app::Env;
use crate::heartbeat::Heartbeat;
use crate::module::{Module, ModuleCtx};

const APP: AppId = AppId {
    qualifier: "com",
    organization: "local",
    application: env!("CARGO_PKG_NAME"), // "pinger"
};

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"), version, about = "Periodic device ping daemon")]
struct Cli {
    /// Log level override (info,debug,trace)
    #[arg(long, global = true)]
    log: Option<String>,
    /// Directory holding config.toml (defaults to the per-user config dir)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
    /// Ping server base URL override
    #[arg(long, global = true)]
    server_url: Option<String>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy)]
enum Command {
    /// Schedule the recurring ping and run until ctrl-c (default)
    Run,
    /// Send one ping cycle now; exit code 1 if it fails
    Once,
    /// Print the last saved job status as JSON
    Status,
    /// Print the device id sent with each ping
    DeviceId,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let env = Env::load(&APP, cli.config_dir.as_deref(), cli.server_url.clone())?;
    logx::init(cli.log.as_deref().unwrap_or(&env.cfg.log_level));

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => runtime()?.block_on(run(env)).map(|()| ExitCode::SUCCESS),
        Command::Once => runtime()?.block_on(once(env)),
        Command::Status => status(&env),
        Command::DeviceId => {
            println!("{}", env.device_ids().device_id());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    #[cfg(feature = "rt-single")]
    let mut builder = tokio::runtime::Builder::new_current_thread();
    #[cfg(not(feature = "rt-single"))]
    let mut builder = {
        let mut b = tokio::runtime::Builder::new_multi_thread();
        b.worker_threads(num_cpus::get().max(1));
        b
    };
    builder.enable_all().build().context("build tokio runtime")
}

async fn run(env: Env) -> Result<()> {
    info!("{} boot, config in {}", APP.application, env.config_dir.display());
    let scheduler = env.scheduler()?;
    let job = env.cfg.job_name.clone();

    // Boot trigger: Keep makes repeated starts idempotent.
    let outcome = scheduler.enqueue(env.job_spec()?, ExistingJobPolicy::Keep).await?;
    info!("job {job} every {}s: {outcome:?}", env.cfg.interval_secs);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = ModuleCtx {
        kv: env.kv.clone(),
        scheduler: scheduler.clone(),
        job: job.clone(),
        shutdown: shutdown_rx,
    };

    let mut modules: Vec<Box<dyn Module>> = vec![Box::new(Heartbeat::new(DEFAULT_CONSTRAINT_POLL))];
    #[cfg(feature = "web-api")]
    if let Some(addr) = env.cfg.status_addr.as_deref() {
        let addr = addr.parse().with_context(|| format!("parse status_addr {addr}"))?;
        modules.push(Box::new(status::StatusServer::new(addr)));
    }

    let handles: Vec<_> = modules
        .into_iter()
        .map(|m| {
            let name = m.name();
            info!("starting module {name}");
            (name, m.spawn(ctx.clone()))
        })
        .collect();

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutdown requested");
    scheduler.cancel(&job).await;
    let _ = shutdown_tx.send(true);

    for (name, handle) in handles {
        match handle.await {
            Ok(Ok(())) => info!("module {name} stopped"),
            Ok(Err(e)) => error!("module {name} failed: {e:#}"),
            Err(e) => error!("module {name} panicked: {e}"),
        }
    }
    Ok(())
}

async fn once(env: Env) -> Result<ExitCode> {
    let scheduler = env.scheduler()?;
    let name = format!("{}_once", env.cfg.job_name);
    scheduler.enqueue(JobSpec::one_shot(name.clone()), ExistingJobPolicy::Replace).await?;

    let DueOutcome::Ran(record) = scheduler.on_due(&name).await else {
        anyhow::bail!("ping cycle did not run");
    };
    println!("{}", serde_json::to_string_pretty(&record)?);
    match record.outcome {
        CycleOutcome::Succeeded => Ok(ExitCode::SUCCESS),
        _ => {
            warn!("ping cycle {}", record.outcome.label());
            Ok(ExitCode::from(1))
        }
    }
}

fn status(env: &Env) -> Result<ExitCode> {
    let job = &env.cfg.job_name;
    let saved = env
        .kv
        .get_t::<JobStatus>(&keys::last_status(job))?
        .unwrap_or_else(|| JobStatus::not_scheduled(job));
    println!("{}", serde_json::to_string_pretty(&saved)?);
    Ok(ExitCode::SUCCESS)
}
