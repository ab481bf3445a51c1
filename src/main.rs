use clap::Parser;
use mcp_gateway::config::GatewayConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "mcp-gatewayd", version, about = "MCP protocol gateway")]
struct Cli {
    /// Path to the server-definition JSON file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bind port; overrides GATEWAY_PORT.
    #[arg(long)]
    port: Option<u16>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let config_path = GatewayConfig::resolve_config_path(cli.config.as_ref().and_then(|p| p.to_str()));

    let config = match GatewayConfig::load(&config_path, cli.port) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, path = %config_path.display(), "failed to load gateway config");
            std::process::exit(1);
        }
    };

    let loader = mcp_gateway::default_config_loader();
    match mcp_gateway::run_gateway(config, loader).await {
        Ok(mcp_gateway::ShutdownCause::Signal) => std::process::exit(130),
        Ok(mcp_gateway::ShutdownCause::Terminate) => {}
        Err(e) => {
            tracing::error!(error = %e, "gateway exited with error");
            std::process::exit(1);
        }
    }
}
