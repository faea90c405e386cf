use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt};

mod config;
mod genai;
mod itinerary;
mod models;
mod render;
mod server;
mod storage;

#[derive(Debug, Parser)]
#[command(name = "tripbook")]
#[command(about = "Headless trip planner with AI itinerary generation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Start {
        #[arg(long, default_value = "127.0.0.1:7171")]
        listen: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start { listen } => {
            let addr: SocketAddr = listen.parse()?;
            let app_config = config::AppConfig::from_env();
            let gemini_config = config::GeminiConfig::from_env();
            if gemini_config.api_key.is_empty() {
                tracing::warn!("GEMINI_API_KEY is not set, itinerary generation will fail");
            }

            let repo = storage::SqliteTripRepository::initialize(app_config.database_url).await?;
            let client = Arc::new(genai::GeminiClient::new(&gemini_config));
            let session = Arc::new(itinerary::ItinerarySession::new(client));
            let prometheus = PrometheusBuilder::new().install_recorder()?;

            let state = server::AppState {
                repo: Arc::new(repo),
                session,
                prometheus: Some(prometheus),
            };
            server::serve(addr, state).await?;
        }
    }
    Ok(())
}
