mod config;
mod error;
mod routes;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use nudge_core::db::GatewayPool;
use nudge_core::peers::{PeerDirectory, ServiceBrowser, ServiceRecord, StaticBrowser};
use nudge_core::scheduler::{Scheduler, SchedulerConfig};
use nudge_core::sync::{PeerClient, SyncEngine};
use nudge_core::{Clock, SystemClock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use config::AppConfig;
use routes::{app_router, AppState};
use transport::LogTransport;

/// Transport events waiting for the scheduler
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Parser)]
#[command(name = "nudged")]
#[command(about = "Reminder daemon that keeps every machine on the network in step")]
#[command(version)]
struct Cli {
    /// Path to the reminder database
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,

    /// Address the HTTP surface binds to
    #[arg(long, value_name = "HOST:PORT")]
    bind: Option<String>,

    /// Hostname advertised to peers
    #[arg(long)]
    hostname: Option<String>,

    /// Extra peer to sync with, repeatable
    #[arg(long = "peer", value_name = "HOST:PORT")]
    peers: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nudged=info".parse().expect("valid directive"))
                .add_directive("nudge_core=info".parse().expect("valid directive")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::from_env()?;
    if let Some(db_path) = cli.db_path {
        config.db_path = db_path;
    }
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(hostname) = cli.hostname {
        config.hostname = hostname;
    }
    for peer in &cli.peers {
        config.peers.push(ServiceRecord::parse_address(peer)?);
    }
    tracing::info!("Starting nudged with config: {:?}", config);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cancel = CancellationToken::new();
    let pool = GatewayPool::open(&config.db_path, Arc::clone(&clock))?;

    let scheduler = Scheduler::new(
        pool.clone(),
        Arc::new(LogTransport::new()),
        SchedulerConfig {
            poll_interval: config.poll_interval,
            delay: config.delay,
            queue_capacity: config.queue_capacity,
            ..SchedulerConfig::default()
        },
        cancel.clone(),
    );
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let mut workers = scheduler.spawn(events_rx);

    let peers = Arc::new(PeerDirectory::new(
        config.hostname.clone(),
        config.peer_ttl_secs,
        Arc::clone(&clock),
    ));
    let browser: Arc<dyn ServiceBrowser> = Arc::new(StaticBrowser::new(config.peers.clone()));
    let own_record = ServiceRecord::for_host(config.hostname.clone(), config.port());
    workers.extend(peers.spawn(browser, own_record, &cancel));

    let sync = SyncEngine::new(pool.clone(), PeerClient::new(config.peer_timeout)?);
    let state = AppState::new(pool, scheduler.clone(), peers, sync, events_tx);
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("nudged listening on {}", config.bind_addr);

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("shutdown requested"),
            Err(error) => tracing::error!(%error, "failed to listen for ctrl-c"),
        }
        shutdown.cancel();
    });

    let stop = cancel.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(stop.clone().cancelled_owned())
            .await;
        // A server that dies on its own takes the workers down with it
        stop.cancel();
        result
    });

    cancel.cancelled().await;
    scheduler.shutdown().await;
    match tokio::time::timeout(config.shutdown_grace, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(error))) => tracing::error!(%error, "server error"),
        Ok(Err(error)) => tracing::error!(%error, "server task failed"),
        Err(_) => tracing::warn!(
            grace_secs = config.shutdown_grace.as_secs(),
            "in-flight requests did not finish in time"
        ),
    }
    for worker in workers {
        if let Err(error) = worker.await {
            tracing::warn!(%error, "worker ended abnormally");
        }
    }
    tracing::info!("nudged stopped");
    Ok(())
}
