use anthropic_gateway::config::config_search_paths;
use anthropic_gateway::{build_router, AppState, BackendKind, BackendTarget, GatewayConfig, SharedJournal};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "anthropic-gateway",
    about = "Anthropic Messages API gateway for OpenRouter, LiteLLM and Azure Databricks backends",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Backend kind (overrides config): openrouter, litellm, azure_databricks, litellm_openrouter
    #[arg(long)]
    backend: Option<BackendKind>,

    /// Request journal file (JSON lines)
    #[arg(long, default_value = "anthropic-gateway.log")]
    log_file: PathBuf,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "anthropic_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths (first match wins):");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = GatewayConfig::find_and_load(cli.config.as_deref())?;
    config.apply_env_overrides()?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(kind) = cli.backend {
        config.backend.kind = kind;
    }

    // Refuse to serve with an incomplete backend
    config.validate()?;
    let target = BackendTarget::from_config(&config)?;

    let journal = SharedJournal::new(&cli.log_file)?;
    if let Err(e) = journal.compact() {
        warn!(error = %e, "Journal compaction failed");
    }

    info!("anthropic-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("  Backend:   {}", target.kind);
    info!("  Base URL:  {}", target.base_url);
    info!("  Models:    {} mapped", config.backend.models.len());
    info!(
        "  Tools:     {}",
        if config.tools.enabled { "server-side" } else { "passed through" }
    );
    info!("  Journal:   {}", cli.log_file.display());

    let state = Arc::new(AppState::build(&config, target, journal)?);
    let app = build_router(state);

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);
    info!("  ANTHROPIC_BASE_URL=http://localhost:{}", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
