//! pkt-tracer-hub: central ingestion and query service (spec §4.5, §4.6).
//!
//! Runs the `Ingest` and `Query` gRPC services over one tonic server,
//! backed by a ClickHouse [`registry::Registry`], alongside the telemetry
//! endpoint. Shutdown is signal-driven with the same bounded graceful
//! timeout the agent uses.

mod cli;
mod ingest;
mod query;
mod registry;

use std::sync::Arc;

use tonic::transport::Server;

use pkt_tracer_proto::tracehub::ingest_server::IngestServer;
use pkt_tracer_proto::tracehub::query_server::QueryServer;
use pkt_tracer_types::config;
use pkt_tracer_types::metrics::Telemetry;

use ingest::IngestService;
use query::QueryService;
use registry::Registry;

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() {
    let args = cli::parse();
    let file_config = match config::read_hub_config(&args.config_path).await {
        Ok(cfg) => cfg,
        Err(config::Error::NoFile) => config::HubConfig::default(),
        Err(error) => {
            eprintln!("failed to read hub configuration: {error}");
            std::process::exit(exitcode::CONFIG);
        }
    };
    let cfg = args.apply_overrides(file_config);

    let _log_handle = pkt_tracer_types::logging::init(&cfg.log_level, cfg.log_file.as_deref());
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %cfg.listen_address,
        clickhouse = %cfg.clickhouse_url,
        "starting pkt-tracer-hub"
    );

    std::process::exit(run(cfg).await);
}

async fn run(cfg: config::HubConfig) -> i32 {
    let telemetry = Telemetry::new();

    if cfg.metrics_enabled || cfg.healthcheck_enabled {
        if let Some(addr) = cfg.telemetry_address.clone() {
            match addr.parse() {
                Ok(socket_addr) => {
                    let telemetry = telemetry.clone();
                    tokio::spawn(async move {
                        if let Err(error) = pkt_tracer_types::metrics::serve(socket_addr, telemetry).await {
                            tracing::error!(%error, "telemetry endpoint exited");
                        }
                    });
                }
                Err(error) => tracing::warn!(%error, address = %addr, "invalid telemetry address, telemetry endpoint disabled"),
            }
        }
    }

    let registry = Registry::connect(&cfg.clickhouse_url, &cfg.clickhouse_database);
    if let Err(error) = registry.migrate().await {
        tracing::error!(%error, "failed to provision clickhouse schema");
        return exitcode::UNAVAILABLE;
    }
    let registry = Arc::new(registry);

    let listen_address = match cfg.listen_address.parse() {
        Ok(addr) => addr,
        Err(error) => {
            tracing::error!(%error, address = %cfg.listen_address, "invalid listen address");
            return exitcode::CONFIG;
        }
    };

    let ingest = IngestService::new(registry.clone(), telemetry.clone(), cfg.max_rows_in_batch, cfg.flush_interval);
    let query = QueryService::new(registry.clone(), cfg.follow_check_interval);

    let shutdown = shutdown_signal();
    telemetry.set_healthy(true);
    tracing::info!("pkt-tracer-hub ready");

    let result = Server::builder()
        .add_service(IngestServer::new(ingest))
        .add_service(QueryServer::new(query))
        .serve_with_shutdown(listen_address, shutdown)
        .await;

    match result {
        Ok(()) => {
            tracing::info!("pkt-tracer-hub shut down cleanly");
            exitcode::OK
        }
        Err(error) => {
            tracing::error!(%error, "pkt-tracer-hub server failed");
            telemetry.set_healthy(false);
            exitcode::SOFTWARE
        }
    }
}

async fn shutdown_signal() {
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).expect("install SIGTERM handler");
    let mut int = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).expect("install SIGINT handler");
    tokio::select! {
        _ = term.recv() => tracing::info!("received SIGTERM, shutting down"),
        _ = int.recv() => tracing::info!("received SIGINT, shutting down"),
    }
}
