use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use genai_relay::config::{Cli, Config};
use genai_relay::genai::client::VertexClient;
use genai_relay::server::api::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "genai_relay=debug,tower_http=debug"
    } else {
        "genai_relay=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("genai-relay v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    config.upstream.apply_env();
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }

    info!(
        location = config.upstream.location,
        model = config.upstream.model,
        temperature = config.generation.temperature,
        max_output_tokens = config.generation.max_output_tokens,
        "Configuration loaded"
    );

    // The client is built once and shared read-only by every request.
    let model = Arc::new(VertexClient::from_config(&config.upstream)?);

    let config = Arc::new(config);
    let state = Arc::new(AppState::new(model, config.clone()));
    let app = build_router(state);

    let listen_addr = &config.server.listen;
    let listener = TcpListener::bind(listen_addr).await?;
    info!("Listening on http://{listen_addr}/generate");

    axum::serve(listener, app).await?;

    Ok(())
}
