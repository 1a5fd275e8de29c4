//! eth-proxy: HTTP getwork frontend for Stratum mining pools.
//!
//! Wires the upstream clients, the job registry, and the miner-facing HTTP
//! listener together, and owns startup validation and shutdown cleanup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use eth_proxy::config::Config;
use eth_proxy::getwork::{self, GetworkService};
use eth_proxy::jobs::JobRegistry;
use eth_proxy::upstream::{IdleWatchdog, SessionController, UpstreamClient, UpstreamEvent};

const PID_FILE: &str = "eth-proxy.pid";
const LOG_FILE: &str = "proxy.log";

#[derive(Parser)]
#[command(name = "eth-proxy", version, about = "Ethereum getwork/Stratum mining proxy")]
struct Cli {
    /// Path to the proxy configuration file.
    #[arg(short, long, default_value = "eth-proxy.conf")]
    config: PathBuf,
}

fn init_logging(cfg: &Config) -> Result<()> {
    let level = cfg.tracing_level();
    let filter = tracing_subscriber::filter::LevelFilter::from_level(level);
    let console = tracing_subscriber::fmt::layer().with_target(false);
    if cfg.log_to_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(LOG_FILE)
            .with_context(|| format!("cannot open {}", LOG_FILE))?;
        tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
            .init();
    } else {
        tracing_subscriber::registry().with(filter).with(console).init();
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM - shutting down"),
            _ = tokio::signal::ctrl_c() => info!("SIGINT - shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("failed to register Ctrl+C handler");
        info!("Ctrl+C - shutting down");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;
    init_logging(&cfg)?;

    if let Err(e) = cfg.validate() {
        error!("{}", e);
        std::process::exit(1);
    }

    warn!("Ethereum Stratum proxy version: {}", eth_proxy::VERSION);

    let watchdog = IdleWatchdog::new();

    warn!("Trying to connect to Stratum pool at {}", cfg.pool);
    let mut upstreams = vec![UpstreamClient::new(
        "main",
        &cfg.pool.host,
        cfg.pool.port,
        false,
        cfg.debug,
        watchdog.activity_handle(),
    )];
    for (i, addr) in cfg.failovers().iter().enumerate() {
        warn!("Trying to connect to failover Stratum pool-{} at {}", i + 1, addr);
        upstreams.push(UpstreamClient::new(
            &format!("failover{}", i + 1),
            &addr.host,
            addr.port,
            true,
            cfg.debug,
            watchdog.activity_handle(),
        ));
    }
    for upstream in &upstreams {
        watchdog.register(Arc::clone(upstream));
    }

    let registry = JobRegistry::new(upstreams.clone(), cfg.coin_timeout());
    for upstream in &upstreams {
        SessionController::new(
            Arc::clone(upstream),
            Arc::clone(&registry),
            cfg.wallet.clone(),
            cfg.custom_email(),
            cfg.debug,
        )
        .spawn();
    }

    // Subscribe before the dial loops start so the first event is not lost.
    let mut primary_events = upstreams[0].subscribe();
    for upstream in &upstreams {
        upstream.spawn();
    }
    watchdog.spawn();

    // Block until the primary connects; a proxy that cannot reach its main
    // pool on the very first dial is misconfigured.
    loop {
        match primary_events.recv().await {
            Ok(UpstreamEvent::Connected) => break,
            Ok(UpstreamEvent::ConnectFailed) => {
                warn!("First pool server must be online first time during start");
                std::process::exit(1);
            }
            Ok(_) => continue,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => std::process::exit(1),
        }
    }

    let bind_addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .with_context(|| format!("invalid HOST/PORT {}:{}", cfg.host, cfg.port))?;
    let listener = getwork::listener::bind(bind_addr)?;

    std::fs::write(PID_FILE, std::process::id().to_string())
        .with_context(|| format!("cannot write {}", PID_FILE))?;

    warn!("-----------------------------------------------------------------------");
    if cfg.host == "0.0.0.0" {
        warn!("PROXY IS LISTENING ON ALL IPs ON PORT {}", cfg.port);
    } else {
        warn!("LISTENING FOR MINERS ON http://{}:{}", cfg.host, cfg.port);
    }
    warn!("-----------------------------------------------------------------------");
    warn!("Wallet: {}", cfg.wallet);
    warn!("Worker ID enabled: {}", cfg.enable_worker_id);
    if cfg.monitoring {
        warn!("Email monitoring on {}", cfg.monitoring_email);
    } else {
        warn!("Email monitoring disabled");
    }
    warn!("Failover enabled: {}", cfg.pool_failover_enable);
    warn!("-----------------------------------------------------------------------");

    let service = GetworkService::new(Arc::clone(&registry), cfg.enable_worker_id);
    let app = getwork::listener::router(service);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP listener failed")?;

    info!("Shutting down proxy...");
    let _ = std::fs::remove_file(PID_FILE);
    for upstream in &upstreams {
        upstream.stop();
    }
    Ok(())
}
