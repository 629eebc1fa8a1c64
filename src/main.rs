mod bandwidth;
mod buffer_pool;
mod config;
mod descriptor;
mod pool;
mod server;
mod socks;

use std::process::ExitCode;
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::bandwidth::AutoOptimizer;
use crate::config::{Cli, Command, Config, StartArgs};
use crate::pool::ProxyPool;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("multisocks={}", cli.log_level.as_filter())));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    let _ = color_eyre::install();

    match cli.command {
        Some(Command::Start(args)) => match run(args).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(code) => code,
        },
        None => {
            let _ = Cli::command().print_help();
            ExitCode::SUCCESS
        }
    }
}

async fn run(args: StartArgs) -> Result<(), ExitCode> {
    let config = Config::from_start_args(args).map_err(|err| {
        error!("{err}");
        ExitCode::from(err.exit_code())
    })?;
    let config = Arc::new(config);

    let pool = Arc::new(ProxyPool::new(config.descriptors.clone()));
    info!("loaded {} proxies:", pool.len());
    for descriptor in pool.descriptors().iter().take(5) {
        info!("  - {}", descriptor.connection_string());
    }
    if pool.len() > 5 {
        info!("  - ... and {} more", pool.len() - 5);
    }

    let listener = TcpListener::bind(config.bind_addr).await.map_err(|err| {
        error!(addr = %config.bind_addr, %err, "failed to bind listener");
        ExitCode::from(2)
    })?;
    let local_addr = listener.local_addr().unwrap_or(config.bind_addr);
    info!("SOCKS server listening on {local_addr}");

    let probes = tokio::spawn(pool::run_health_probes(
        Arc::clone(&pool),
        config.probe_interval,
    ));
    let optimizer = config.auto_optimize.then(|| {
        info!("auto-optimization enabled, retuning every {:?}", config.retune_interval);
        tokio::spawn(
            AutoOptimizer::new(
                Arc::clone(&pool),
                config.bandwidth_url.clone(),
                config.retune_interval,
            )
            .run(),
        )
    });

    let shutdown = async {
        let _ = signal::ctrl_c().await;
        info!("shutdown signal received");
    };
    let served = server::serve(listener, pool, Arc::clone(&config), shutdown).await;

    probes.abort();
    if let Some(task) = optimizer {
        task.abort();
    }

    match served {
        Ok(()) => {
            info!("clean shutdown");
            Ok(())
        }
        Err(err) => {
            error!(%err, "server terminated abnormally");
            Err(ExitCode::FAILURE)
        }
    }
}
