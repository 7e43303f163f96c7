mod config;
mod http;
mod limiter;
mod metrics;
mod proto;
mod resolver;
mod rule;
mod server;
mod switcher;
mod trace;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggerConfig;
use crate::http::HttpServer;
use crate::limiter::Limiter;
use crate::metrics::Metrics;
use crate::resolver::Resolver;
use crate::server::DnsServer;
use crate::switcher::Switcher;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    name = "masquerade-dns",
    about = "Masquerading DNS front-end: static answers for selected names, upstream forwarding for the rest",
    long_about = None
)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long = "path", default_value = "configs/config.yml")]
    path: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = config::load(&args.path)?;
    init_tracing(&cfg.logger);
    info!(service = %cfg.logger.name, "start");

    let metrics = Arc::new(Metrics::new().context("init metrics")?);
    let limiter = Arc::new(Limiter::new(&cfg.limiter));
    let resolver =
        Arc::new(Resolver::new(&cfg.resolver, metrics.clone()).context("init resolver")?);
    let switcher = Arc::new(
        Switcher::new(&cfg.switcher, metrics.clone(), limiter).context("compile switch rules")?,
    );

    let http_server = HttpServer::bind(&cfg.http, metrics.clone()).await?;
    let dns_server = DnsServer::bind(&cfg.dns, metrics, switcher, resolver).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dns_task = tokio::spawn(dns_server.run(shutdown_rx.clone()));
    let http_task = tokio::spawn(http_server.serve(shutdown_rx));

    shutdown_signal().await;
    info!("stop");
    let _ = shutdown_tx.send(true);

    if let Err(err) = dns_task.await.context("join dns server")? {
        error!(error = %err, "can't stop DNS server");
    }
    match tokio::time::timeout(SHUTDOWN_GRACE, http_task).await {
        Ok(joined) => {
            if let Err(err) = joined.context("join metrics endpoint")? {
                error!(error = %err, "can't stop metrics endpoint");
            }
        }
        Err(_) => warn!("metrics endpoint did not stop within the grace period"),
    }

    Ok(())
}

fn init_tracing(config: &LoggerConfig) {
    let level = if config.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                warn!(error = %err, "can't install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
