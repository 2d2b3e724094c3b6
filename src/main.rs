//! forelay/src/main.rs
//! Standalone binary: load the configuration, start a session, stop on
//! Ctrl-C.

use clap::Parser;
use forelay::config::{Config, EnvProxyDetector};
use forelay::error::Result;
use forelay::pac::{self, FallbackEvaluator};
use forelay::selector::PacEvaluator;
use forelay::session::Session;
use forelay::types::ProxyKind;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "forelay", about = "Local forwarding HTTP proxy")]
struct Args {
    /// Path to the key=value configuration file.
    #[arg(short, long, default_value = "forelay.properties")]
    config: PathBuf,

    /// Override the configured listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Default log filter (RUST_LOG overrides it).
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    forelay::logging::init(&args.log);
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = if args.config.exists() {
        Config::load(&args.config)?
    } else {
        warn!(
            "configuration file {} not found, using defaults",
            args.config.display()
        );
        Config::default()
    };
    if let Some(port) = args.port {
        config.local_port = port;
    }
    config.apply_system_proxy(&EnvProxyDetector);

    let pac: Option<Arc<dyn PacEvaluator>> = if config.proxy_kind == ProxyKind::Pac {
        let location = config.pac_file_location.clone().ok_or_else(|| {
            forelay::error::ProxyError::Internal(
                "proxy.type=PAC requires proxy.pac.fileLocation".into(),
            )
        })?;
        let source = pac::load_source(&location).await?;
        Some(Arc::new(FallbackEvaluator::from_source(&source)))
    } else {
        None
    };

    let session = Session::start(config, pac).await?;
    info!("listening on {}", session.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    session.stop().await;
    Ok(())
}
