use std::path::Path;
use std::time::Duration;

use clap::Parser;
use tokio::runtime::Builder;
use tokio::signal;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use weir::config::Config;
use weir::engine::Engine;
use weir::sink;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Config(#[from] weir::config::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Sink setup failed: {0}")]
    Sink(#[from] sink::Error),
}

fn default_config_path() -> String {
    "/etc/weir/weir.yaml".to_string()
}

#[derive(Parser)]
#[clap(version, about = "StatsD-protocol metrics aggregation daemon")]
struct Opts {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// override the configured bind host
    #[clap(long)]
    host: Option<String>,
    /// override the configured bind port
    #[clap(long)]
    port: Option<u16>,
}

async fn inner_main(config: Config) -> Result<(), Error> {
    let mut sink = sink::Server::new(&config.sink)?;
    let mut engine = Engine::new(config.clone());

    if let Err(error) = engine.start().await {
        // The flush cycle still runs; the process just has nothing feeding
        // it until a restart.
        error!(%error, "listener failed to start, continuing without ingestion");
    }

    let period = Duration::from_secs(config.flush.interval_seconds.max(1));
    let mut interval = time::interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match engine.flush_into(&mut sink) {
                    Ok(emitted) => debug!(emitted, "flush pass complete"),
                    Err(error) => warn!(%error, "sample dispatch failed"),
                }
            }
            result = signal::ctrl_c() => {
                if let Err(error) = result {
                    warn!(%error, "interrupt handler failed");
                }
                info!("received interrupt, shutting down");
                break;
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();
    let mut config = Config::load(Path::new(&opts.config_path))?;
    if opts.host.is_some() {
        config.listener.host = opts.host;
    }
    if let Some(port) = opts.port {
        config.listener.port = port;
    }
    info!(
        host = config.listener.host.as_deref().unwrap_or("*"),
        port = config.listener.port,
        interval_seconds = config.flush.interval_seconds,
        "starting weir"
    );

    let runtime = Builder::new_multi_thread().enable_io().enable_time().build()?;
    runtime.block_on(inner_main(config))
}
