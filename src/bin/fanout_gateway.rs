use clap::Parser;

use transcript_platform::config::Settings;
use transcript_platform::db::Db;
use transcript_platform::gateway::{router, GatewayState};

/// Live Fan-Out Gateway. Configuration primarily comes from the environment
/// (spec §6); these flags only override the bind address.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Override GATEWAY_BIND_ADDR
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
        settings.gateway_bind_addr = bind_addr;
    }

    let db = Db::connect(&settings.database_url).await?;

    let state = GatewayState {
        db,
        redis_url: settings.redis_url.clone(),
        http: reqwest::Client::new(),
        collector_base_url: settings.collector_base_url.clone(),
    };

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&settings.gateway_bind_addr).await?;
    tracing::info!("fan-out gateway listening on {}", settings.gateway_bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
