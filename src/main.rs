use clap::Parser;
use sitesnap::{run_server, run_standalone, setup_logging, Cli, Commands, Config};
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let args = Cli::parse();

    if args.url.is_none() && args.command.is_none() {
        eprintln!("Usage: sitesnap <URL>");
        eprintln!("       sitesnap serve [--port <PORT>]");
        std::process::exit(1);
    }

    if let Err(e) = setup_logging(args.verbose) {
        eprintln!("Failed to initialise logging: {e}");
        std::process::exit(1);
    }

    info!("Starting sitesnap v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(args).await {
        error!("Application error: {:#}", e);
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Cli) -> anyhow::Result<()> {
    let config = load_config(&args).await?;

    match (args.command, args.url) {
        (Some(Commands::Serve { port, bind }), _) => run_server(config, &bind, port).await,
        (None, Some(url)) => run_standalone(&url, config).await,
        (None, None) => Err(anyhow::anyhow!("a URL is required")),
    }
}

async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = if let Some(config_path) = &args.config {
        let config_content = tokio::fs::read_to_string(config_path).await?;
        serde_json::from_str(&config_content)?
    } else {
        Config::default()
    };

    // Override with CLI arguments
    if let Some(timeout) = args.timeout {
        config.navigation_timeout = Duration::from_secs(timeout);
    }

    if let Some(chrome_path) = &args.chrome_path {
        config.chrome_path = Some(chrome_path.clone());
    }

    config.validate()?;

    info!("Configuration loaded successfully");
    info!("Navigation timeout: {:?}", config.navigation_timeout);
    info!(
        "Artifact budget: {} bytes, quality ladder {:?}",
        config.encoder.max_artifact_size,
        config.encoder.ladder()
    );

    Ok(config)
}
