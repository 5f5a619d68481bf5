use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use resume_core_orchestrator::{
    AgentContext, AppConfig, ConfigStore, EventBus, InsightExtractor, ModelRegistry, Orchestrator,
    RecoveryStore, UnconfiguredJobFetcher,
};
use resume_core_observability::{canonical_logs_dir_from_root, init_process_logging, ProcessKind};
use resume_core_providers::ProviderRegistry;
use resume_core_server::{serve, AppState, UnconfiguredDocxRenderer};
use tracing::info;

const MAX_MANUAL_RETRIES: u32 = 3;
const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "resume-core-engine")]
#[command(about = "Headless resume-optimization pipeline core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long, default_value_t = false)]
        dev_mode: bool,
    },
    /// Admits one run locally (no HTTP server) and prints its final snapshot,
    /// for a smoke test of the pipeline end to end.
    Run {
        #[arg(long)]
        resume_text: String,
        #[arg(long)]
        job_text: String,
        #[arg(long, default_value = "smoke-test-client")]
        client_id: String,
        #[arg(long)]
        state_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
            dev_mode,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, _log_info) =
                init_process_logging(ProcessKind::Engine, &logs_dir, LOG_RETENTION_DAYS)?;
            let state = build_state(&state_dir, dev_mode).await?;
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            log_startup_paths(&state_dir, &addr);
            serve(addr, state).await?;
        }
        Command::Run {
            resume_text,
            job_text,
            client_id,
            state_dir,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, _log_info) =
                init_process_logging(ProcessKind::Engine, &logs_dir, LOG_RETENTION_DAYS)?;
            let state = build_state(&state_dir, true).await?;

            let outcome = state
                .orchestrator
                .start_run(resume_core_types::RunRequest {
                    client_id,
                    resume_text,
                    job_text: Some(job_text),
                    job_url: None,
                    linkedin_url: None,
                    github_username: None,
                    models: Default::default(),
                })
                .await?;
            info!(run_id = %outcome.run_id, "run admitted, waiting for completion");

            loop {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                let snapshot = state.bus.snapshot(outcome.run_id).await?;
                if matches!(
                    snapshot.status,
                    resume_core_orchestrator::OverallStatus_::Succeeded
                        | resume_core_orchestrator::OverallStatus_::Failed
                ) {
                    println!("{}", serde_json::to_string_pretty(&snapshot)?);
                    break;
                }
            }
        }
    }

    Ok(())
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("RESUME_CORE_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".resume-core")
}

fn log_startup_paths(state_dir: &PathBuf, addr: &SocketAddr) {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let config_path = state_dir.join("config.json");
    info!("starting resume-core-engine on http://{addr}");
    info!(
        "startup paths: cwd={} state_dir={} config_path={}",
        cwd.display(),
        state_dir.display(),
        config_path.display()
    );
}

async fn build_state(state_dir: &PathBuf, dev_mode: bool) -> anyhow::Result<AppState> {
    let config_store = ConfigStore::new(state_dir.join("config.json")).await?;
    let cli_overrides = if dev_mode {
        Some(serde_json::json!({ "dev_mode": true }))
    } else {
        None
    };
    let config: AppConfig = config_store.load(cli_overrides).await?;

    let store = Arc::new(RecoveryStore::new(state_dir).await?);
    let bus = EventBus::new(store.clone());
    let registry = Arc::new(ProviderRegistry::new(
        resume_core_providers::env_configured_providers(),
    ));
    let models = Arc::new(ModelRegistry::new());
    let insights = Arc::new(InsightExtractor::new(
        bus.clone(),
        registry.clone(),
        config.insight_flush_chars,
        config.insight_flush_seconds,
    ));
    let ctx = AgentContext {
        registry,
        bus: bus.clone(),
        models: models.clone(),
    };

    let orchestrator = Arc::new(Orchestrator {
        store,
        bus,
        models,
        insights,
        ctx,
        job_fetcher: Arc::new(UnconfiguredJobFetcher),
        config,
    });

    Ok(AppState {
        orchestrator,
        renderer: Arc::new(UnconfiguredDocxRenderer),
        max_manual_retries: MAX_MANUAL_RETRIES,
    })
}
