use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use transcript_platform::config::Settings;
use transcript_platform::controller::{handlers, reconciler, ControllerState};
use transcript_platform::db::Db;
use transcript_platform::kv::Kv;
use transcript_platform::workload::{DockerScheduler, WorkloadScheduler};

/// Bot Lifecycle Controller. Configuration primarily comes from the
/// environment (spec §6); these flags only override the bind address.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Override CONTROLLER_BIND_ADDR
    #[arg(long)]
    bind_addr: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::load()?;
    if let Some(bind_addr) = cli.bind_addr {
        settings.controller_bind_addr = bind_addr;
    }

    let db = Db::connect(&settings.database_url).await?;
    db.migrate().await?;
    let kv = Kv::connect(&settings.redis_url).await?;

    let scheduler: Arc<dyn WorkloadScheduler> = Arc::new(DockerScheduler::new(
        std::env::var("BOT_IMAGE").unwrap_or_else(|_| "transcript-bot:latest".to_string()),
    ));

    let state = ControllerState {
        db,
        kv,
        scheduler,
        settings: settings.clone(),
        http: reqwest::Client::new(),
    };

    let reconciler_state = state.clone();
    let reconciliation_interval = settings.reconciliation_interval;
    tokio::spawn(async move {
        reconciler::run(reconciler_state, reconciliation_interval).await;
    });

    let app = handlers::router(state);
    let listener = tokio::net::TcpListener::bind(&settings.controller_bind_addr).await?;
    tracing::info!("bot controller listening on {}", settings.controller_bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
