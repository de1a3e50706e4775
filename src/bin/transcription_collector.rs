use clap::Parser;

use transcript_platform::collector::{consumer, flush, http, CollectorState};
use transcript_platform::config::Settings;
use transcript_platform::db::Db;
use transcript_platform::kv::Kv;

/// Transcription Collector. Configuration primarily comes from the
/// environment (spec §6); these flags only override the bind address.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Override COLLECTOR_BIND_ADDR
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
        settings.collector_bind_addr = bind_addr;
    }

    let db = Db::connect(&settings.database_url).await?;
    db.migrate().await?;
    let kv = Kv::connect(&settings.redis_url).await?;

    let state = CollectorState::new(db, kv, settings.clone());

    tokio::spawn(consumer::run_transcription_loop(state.clone()));
    tokio::spawn(consumer::run_speaker_events_loop(state.clone()));
    tokio::spawn(consumer::run_stale_claimer(state.clone(), settings.pending_msg_timeout));
    tokio::spawn(flush::run(state.clone(), settings.background_task_interval));

    let app = http::router(state);
    let listener = tokio::net::TcpListener::bind(&settings.collector_bind_addr).await?;
    tracing::info!("transcription collector listening on {}", settings.collector_bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
