use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::any;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sidekick::cli::{Cli, Commands};
use sidekick::config::Config;
use sidekick::processor::Processor;
use sidekick::proxy::handler::proxy_handler;
use sidekick::proxy::upstream::UpstreamClient;
use sidekick::store::postgres::PgStore;
use sidekick::store::writer::{BatchWriter, WriterConfig};
use sidekick::{bus, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = sidekick::config::load()?;
    let args = Cli::parse();

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cfg.log_level.clone());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let port = match args.command {
        Some(Commands::Serve { port }) => port.unwrap_or(cfg.port),
        None => cfg.port,
    };

    let result = run_server(cfg, port).await;
    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn run_server(cfg: Config, port: u16) -> anyhow::Result<()> {
    tracing::info!("Connecting to database...");
    let store = PgStore::connect(&cfg.database_url).await?;

    tracing::info!("Running migrations...");
    store.migrate().await?;

    let writer = BatchWriter::new(
        store.pool().clone(),
        WriterConfig {
            buffer_size: cfg.writer_buffer_size,
            batch_size: cfg.writer_batch_size,
            flush_ms: cfg.writer_flush_ms,
        },
    );

    let (event_bus, bus_rx) = bus::channel(bus::DEFAULT_CAPACITY);
    let processor = Processor::new(writer.handle());
    let consumer = tokio::spawn(processor.clone().run(bus_rx));

    let state = Arc::new(AppState {
        config: cfg,
        upstream: UpstreamClient::new(),
        bus: event_bus,
        writer: writer.handle(),
        processor,
    });

    let app = axum::Router::new()
        .fallback(any(proxy_handler))
        .with_state(state.clone())
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        port = port,
        upstream = %state.config.upstream_url,
        "sidekick proxy started"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down...");

    // Shutdown order matters: dropping the state releases the bus
    // publisher so the consumer drains; any in-flight streaming relays
    // hold their own clones and publish their terminators first. The
    // writer goes last so processor-emitted jobs are persisted.
    drop(state);
    match tokio::time::timeout(Duration::from_secs(30), consumer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("processor task failed: {e}"),
        Err(_) => tracing::warn!("processor did not drain within the shutdown budget"),
    }
    writer.shutdown().await;

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
