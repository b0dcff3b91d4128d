use crate::{
    build_router, format_bytes, format_duration, AppState, ArtifactNaming, ArtifactStore,
    ArtifactSummary, CaptureController, ChromiumEngine, Config, EventStatus, JobRegistry, Metrics,
};
use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "sitesnap")]
#[command(about = "Full-page desktop and mobile screenshots under a fixed size budget")]
#[command(version)]
pub struct Cli {
    /// URL to capture in standalone mode
    pub url: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,

    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Navigation timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Chrome executable path")]
    pub chrome_path: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP capture service
    Serve {
        #[arg(short, long, default_value = "3000", help = "Server port")]
        port: u16,

        #[arg(long, default_value = "127.0.0.1", help = "Bind address")]
        bind: String,
    },
}

/// Capture `url` once, writing `screenshot_<viewport>.<ext>` to the working
/// directory.
pub async fn run_standalone(url: &str, config: Config) -> anyhow::Result<()> {
    let started = Instant::now();
    let store = ArtifactStore::new(".", "", ArtifactNaming::Fixed);
    let controller = CaptureController::new(
        Arc::new(ChromiumEngine::new(config.clone())),
        &config,
        store,
        Metrics::new(),
    );
    let registry = JobRegistry::new(controller, config.progress_buffer);

    println!("Capturing {url}");
    let mut progress = registry.submit_and_subscribe(url)?;

    while let Some(event) = progress.next().await {
        match event.status {
            EventStatus::Completed => {
                let result = event
                    .result
                    .ok_or_else(|| anyhow!("completed without a result"))?;
                println!("Screenshots captured in {}:", format_duration(started.elapsed()));
                print_artifact("Desktop", &result.desktop);
                print_artifact("Mobile", &result.mobile);
                return Ok(());
            }
            EventStatus::Error => {
                return Err(anyhow!(event
                    .error
                    .map(|e| e.message)
                    .unwrap_or(event.message)));
            }
            _ => println!("[{:>3}%] {}", event.progress, event.message),
        }
    }

    Err(anyhow!("progress stream ended before the job finished"))
}

fn print_artifact(label: &str, artifact: &ArtifactSummary) {
    println!("  {label}: {}", artifact.filename);
    println!("    Size: {}", format_bytes(artifact.size));
    match artifact.quality {
        Some(quality) => println!("    Format: {:?} (quality {quality})", artifact.format),
        None => println!("    Format: {:?}", artifact.format),
    }
    println!("    Resolution: {}", artifact.resolution);
    if !artifact.within_budget {
        println!("    Warning: still over the size budget at the lowest quality");
    }
}

/// Serve the HTTP API until SIGINT or SIGTERM.
pub async fn run_server(config: Config, bind: &str, port: u16) -> anyhow::Result<()> {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    let metrics_handle = match metrics::set_boxed_recorder(Box::new(recorder)) {
        Ok(()) => Some(handle),
        Err(e) => {
            warn!("Prometheus recorder not installed: {}", e);
            None
        }
    };

    tokio::fs::create_dir_all(&config.artifacts_dir)
        .await
        .with_context(|| format!("creating {}", config.artifacts_dir.display()))?;

    let controller = CaptureController::new(
        Arc::new(ChromiumEngine::new(config.clone())),
        &config,
        ArtifactStore::new(
            &config.artifacts_dir,
            config.artifacts_url_prefix.clone(),
            ArtifactNaming::Timestamped,
        ),
        Metrics::new(),
    );
    let state = AppState {
        registry: JobRegistry::new(controller, config.progress_buffer),
        metrics: metrics_handle,
    };
    let app = build_router(state, &config);

    let listener = tokio::net::TcpListener::bind((bind, port))
        .await
        .with_context(|| format!("binding {bind}:{port}"))?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let sigint = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to create SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = sigint => {
            info!("Received SIGINT");
        }
        _ = sigterm => {
            info!("Received SIGTERM");
        }
    }
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!(e))?;

    Ok(())
}
