use std::sync::Arc;

use clap::Parser;

use transcript_platform::config::Settings;
use transcript_platform::filter::HallucinationFilter;
use transcript_platform::kv::Kv;
use transcript_platform::worker::recognizer::{FakeRecognizer, Recognizer};
use transcript_platform::worker::{health, run_janitor, server, WorkerState};

/// Recognition Worker. Configuration primarily comes from the environment
/// (spec §6); these flags only override the bind address.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Override WORKER_BIND_ADDR
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
        settings.worker_bind_addr = bind_addr;
    }

    let kv = Kv::connect(&settings.redis_url).await?;

    let filter = if settings.hallucination_filter_paths.is_empty() {
        HallucinationFilter::empty()
    } else {
        HallucinationFilter::load(&settings.hallucination_filter_paths)?
    };

    // TODO: swap in the real streaming ASR backend; this repo does not
    // vendor model weights (see SPEC_FULL.md §3).
    let recognizer: Arc<dyn Recognizer> = Arc::new(FakeRecognizer);

    let state = WorkerState::new(settings.clone(), kv, recognizer, filter);

    tokio::spawn(run_janitor(state.clone(), settings.background_task_interval));
    tokio::spawn(health::run_health_monitor(state.clone()));

    let app = server::router(state);
    let listener = tokio::net::TcpListener::bind(&settings.worker_bind_addr).await?;
    tracing::info!("recognition worker listening on {}", settings.worker_bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
