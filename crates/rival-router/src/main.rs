use clap::Parser;
use rival_core::{DEFAULT_HOST, DEFAULT_MAX_DATA_SIZE_MIB, DEFAULT_PORT};
use rival_router::RouterConfig;
use tracing_subscriber::EnvFilter;

/// Route frames between rival peers.
#[derive(Parser, Debug)]
#[command(name = "rival-router", version)]
struct Cli {
    /// Address to bind.
    #[arg(long, env = "RIVAL_HOST", default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, env = "RIVAL_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Inbound message ceiling in MiB.
    #[arg(long, env = "RIVAL_MAX_DATA_SIZE", default_value_t = DEFAULT_MAX_DATA_SIZE_MIB)]
    max_data_size: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("rival_router=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = RouterConfig {
        host: cli.host,
        port: cli.port,
        max_data_size: cli.max_data_size,
    };

    tracing::info!("Starting rival router on {}", config.bind_addr());
    rival_router::run(config).await?;
    Ok(())
}
