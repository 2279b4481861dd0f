use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use drivetrace::config::AppConfig;
use drivetrace::http::{run_http_server, HttpState};
use drivetrace::EngineHandle;

#[derive(Parser, Debug)]
#[command(
    name = "drivetrace",
    about = "Drive-test capture orchestration and quality-zone clustering"
)]
struct Cli {
    /// Path to the JSON config file (defaults apply when absent)
    #[arg(long, default_value = "drivetrace.json")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine with its HTTP/SSE API
    Serve {
        /// Listen address overriding the config file
        #[arg(long)]
        addr: Option<String>,
    },
    /// List attached devices
    Devices,
    /// Analyze a previously extracted trace offline
    Analyze {
        /// JSON-lines point dump produced by the extraction toolchain
        #[arg(long)]
        trace: PathBuf,
        /// Zone count for the clustering pass
        #[arg(long, default_value_t = 4)]
        k: usize,
        /// Upper bound for the elbow sweep
        #[arg(long, default_value_t = 8)]
        max_k: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    drivetrace::init_logging();
    match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = AppConfig::load_from_file(&cli.config);
    let handle = Arc::new(EngineHandle::new(config));

    match cli.command {
        Commands::Serve { addr } => {
            let addr: SocketAddr = addr
                .unwrap_or_else(|| handle.config().http.addr.clone())
                .parse()
                .context("parsing listen address")?;
            run_http_server(HttpState { handle }, addr).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Devices => {
            let devices = handle.list_devices().await.context("querying adb")?;
            if devices.is_empty() {
                println!("No devices attached");
            }
            for device in devices {
                println!("{device}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Analyze { trace, k, max_k } => {
            let session = handle
                .create_offline_session(&trace)
                .await
                .context("loading trace")?;

            let summary = handle
                .extract_kpi_summary(&trace)
                .context("summarizing trace")?;
            println!("{}", serde_json::to_string_pretty(&summary)?);

            if let Some(update) = handle.cluster_now(session.id, Some(k)).await? {
                println!("{}", serde_json::to_string_pretty(&update.zones)?);
            } else {
                println!("No points in trace");
                return Ok(ExitCode::from(2));
            }

            if let Some(Ok(elbow)) = handle.elbow(session.id, max_k).await {
                println!("{}", serde_json::to_string_pretty(&elbow)?);
            }
            if let Some(Ok(score)) = handle.silhouette(session.id, k).await {
                println!("silhouette(k={k}) = {score:.4}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
