use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;
use tracing::Level;

use postcrew_engine::{LlmAgentInvoker, WorkflowConfig};
use postcrew_llm::{OpenAiCompletion, Reliable, ReliableConfig, TavilySearch};
use postcrew_server::{ServerConfig, ServerDeps};
use postcrew_store::runs::RunRepo;
use postcrew_store::Database;
use postcrew_telemetry::{home_dir, init_telemetry, TelemetryConfig};

/// Multi-agent LinkedIn post generator.
#[derive(Debug, Parser)]
#[command(name = "postcrew", version)]
struct Args {
    #[arg(long, env = "POSTCREW_PORT", default_value_t = 9191)]
    port: u16,

    /// Defaults to ~/.postcrew/database/postcrew.db.
    #[arg(long, env = "POSTCREW_DB")]
    db: Option<PathBuf>,

    #[arg(long, env = "POSTCREW_LOG_LEVEL", default_value = "info")]
    log_level: Level,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: String,

    #[arg(long, env = "OPENAI_BASE_URL")]
    openai_base_url: Option<String>,

    /// Model for routing, research, writing and critique.
    #[arg(long, default_value = "gpt-4o-mini")]
    model: String,

    /// Model for the groundedness evaluation.
    #[arg(long, default_value = "gpt-4o")]
    eval_model: String,

    #[arg(long, env = "TAVILY_API_KEY", hide_env_values = true)]
    tavily_api_key: String,

    #[arg(long, default_value_t = 5)]
    max_revisions: u32,

    #[arg(long, default_value_t = 120)]
    invoke_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: args.log_level,
        ..Default::default()
    });

    let db_path = args
        .db
        .clone()
        .unwrap_or_else(|| home_dir().join("database").join("postcrew.db"));
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let db = Database::open(&db_path).with_context(|| format!("failed to open {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database opened");

    let interrupted = RunRepo::new(db.clone()).fail_stale_running("interrupted by server restart")?;
    if interrupted > 0 {
        tracing::warn!(count = interrupted, "marked interrupted runs failed");
    }

    let invoker = build_invoker(&args);
    let deps = ServerDeps {
        db,
        invoker: Arc::new(invoker),
        workflow: WorkflowConfig {
            max_revisions: args.max_revisions,
            invoke_timeout: Duration::from_secs(args.invoke_timeout_secs),
        },
        log_sink: telemetry.sink(),
    };
    let config = ServerConfig {
        port: args.port,
        ..Default::default()
    };
    let handle = postcrew_server::start(config, deps)
        .await
        .context("failed to start server")?;

    tracing::info!(port = handle.port, model = %args.model, eval_model = %args.eval_model, "postcrew ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    let cancelled = handle.orchestrator.cancel_all();
    tracing::info!(cancelled, "shutting down");
    Ok(())
}

fn build_invoker(args: &Args) -> LlmAgentInvoker {
    let completion = |model: &str| {
        let mut client = OpenAiCompletion::new(SecretString::from(args.openai_api_key.clone()), model);
        if let Some(base_url) = &args.openai_base_url {
            client = client.with_base_url(base_url.clone());
        }
        Arc::new(Reliable::new(client, ReliableConfig::default()))
    };
    let search = TavilySearch::new(SecretString::from(args.tavily_api_key.clone()));

    LlmAgentInvoker::new(
        completion(&args.model),
        completion(&args.eval_model),
        Arc::new(Reliable::new(search, ReliableConfig::default())),
    )
}
