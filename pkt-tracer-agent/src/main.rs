//! pkt-tracer-agent: host-side packet trace collection pipeline (spec §4, §5).
//!
//! Wires the netlink reader's fan-out to three independent consumers (the
//! trace collector/merger/sender pipeline, the table watcher, and the
//! rule-text cache's netlink feed), alongside the SG-network resolver and
//! the telemetry endpoint, under one supervisor: the first fatal component
//! error cancels every other component and the process exits non-zero.

mod cli;
mod expr_codec;
mod iface_resolver;
mod netlink_reader;
mod rule_cache;
mod sg_resolver;
mod table_watcher;
mod trace_collector;
mod trace_merger;
mod trace_sender;

use std::sync::Arc;
use std::time::SystemTime;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use pkt_tracer_types::config;
use pkt_tracer_types::metrics::Telemetry;
use pkt_tracer_types::netlink::Frame;

use iface_resolver::IfaceResolver;
use rule_cache::RuleCache;
use sg_resolver::SgResolver;
use table_watcher::{NetlinkRuleSource, TableWatcher};
use trace_merger::Merger;
use trace_sender::TraceSender;

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Error)]
enum FatalError {
    #[error(transparent)]
    Netlink(#[from] netlink_reader::Error),
    #[error(transparent)]
    Telemetry(#[from] std::io::Error),
    #[error(transparent)]
    SgResolver(#[from] sg_resolver::Error),
    #[error(transparent)]
    TableWatcher(#[from] table_watcher::Error),
    #[error(transparent)]
    TraceSender(#[from] trace_sender::Error),
    #[error(transparent)]
    TraceMerger(#[from] trace_merger::Error),
}

#[tokio::main]
async fn main() {
    let args = cli::parse();
    let file_config = match config::read_agent_config(&args.config_path).await {
        Ok(cfg) => cfg,
        Err(config::Error::NoFile) => config::AgentConfig::default(),
        Err(error) => {
            eprintln!("failed to read agent configuration: {error}");
            std::process::exit(exitcode::CONFIG);
        }
    };
    let cfg = args.apply_overrides(file_config);

    let _log_handle = pkt_tracer_types::logging::init(&cfg.log_level, cfg.log_file.as_deref());
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        tracehub = %cfg.tracehub_address,
        sg = %cfg.sg_address,
        "starting pkt-tracer-agent"
    );

    std::process::exit(run(cfg).await);
}

async fn run(cfg: config::AgentConfig) -> i32 {
    let cancel = CancellationToken::new();
    let telemetry = Telemetry::new();

    // Hard stop if components don't wind down within the configured grace
    // period, so a stuck netlink read or RPC call can't wedge shutdown.
    {
        let cancel = cancel.clone();
        let deadline = cfg.graceful_shutdown;
        tokio::spawn(async move {
            cancel.cancelled().await;
            tokio::time::sleep(deadline).await;
            tracing::error!("graceful shutdown timed out, forcing exit");
            std::process::exit(exitcode::TEMPFAIL);
        });
    }

    let mut tasks: JoinSet<(&'static str, Result<(), FatalError>)> = JoinSet::new();

    if cfg.metrics_enabled || cfg.healthcheck_enabled {
        if let Some(addr) = cfg.telemetry_address.clone() {
            match addr.parse() {
                Ok(socket_addr) => {
                    let telemetry = telemetry.clone();
                    tasks.spawn(async move {
                        ("telemetry", pkt_tracer_types::metrics::serve(socket_addr, telemetry).await.map_err(Into::into))
                    });
                }
                Err(error) => tracing::warn!(%error, address = %addr, "invalid telemetry address, telemetry endpoint disabled"),
            }
        }
    }

    let iface = match IfaceResolver::load().await {
        Ok(resolver) => Arc::new(resolver),
        Err(error) => {
            tracing::error!(%error, "failed to load interface table");
            return exitcode::OSERR;
        }
    };

    let sg = Arc::new(SgResolver::empty());
    {
        let sg = sg.clone();
        let cancel = cancel.clone();
        tasks.spawn({
            let address = cfg.sg_address.clone();
            let mode = cfg.sg_sync_mode;
            let interval = cfg.sg_sync_interval;
            async move { ("sg_resolver", sg_resolver::run(mode, address, interval, sg, cancel).await.map_err(Into::into)) }
        });
    }

    let (mut consumers, reader_handle) = match netlink_reader::spawn(
        cfg.netlink_rcvbuf,
        3,
        64,
        cancel.clone(),
        telemetry.clone(),
    ) {
        Ok(parts) => parts,
        Err(error) => {
            tracing::error!(%error, "failed to open netlink socket");
            return exitcode::OSERR;
        }
    };
    // Fixed fan-out order: trace pipeline, table watcher, rule-cache feed.
    let rule_cache_consumer = consumers.pop().expect("three consumers requested");
    let table_consumer = consumers.pop().expect("three consumers requested");
    let trace_consumer = consumers.pop().expect("three consumers requested");
    tasks.spawn(async move {
        match reader_handle.await {
            Ok(result) => ("netlink_reader", result.map_err(Into::into)),
            Err(join_error) => ("netlink_reader", Err(netlink_panic(join_error.to_string()))),
        }
    });

    let rule_cache = Arc::new(RuleCache::new(NetlinkRuleSource));
    match tokio::task::spawn_blocking(table_watcher::enumerate_rule_cache_preload).await {
        Ok(Ok(entries)) => {
            let n = entries.len();
            rule_cache.preload(entries, SystemTime::now());
            tracing::info!(rules = n, "preloaded rule-text cache from kernel ruleset");
        }
        Ok(Err(error)) => tracing::warn!(%error, "rule-text cache preload failed, starting with an empty cache"),
        Err(error) => tracing::warn!(%error, "rule-text cache preload task panicked"),
    }
    {
        let cache = rule_cache.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            table_watcher::run_rule_cache_feed(rule_cache_consumer, cache, cancel).await;
            ("rule_cache_feed", Ok(()))
        });
    }

    let watcher = Arc::new(TableWatcher::new());
    match tokio::task::spawn_blocking({
        let watcher = watcher.clone();
        move || table_watcher::enumerate_startup(&watcher)
    })
    .await
    {
        Ok(Ok(())) => tracing::info!("completed startup table enumeration"),
        Ok(Err(error)) => tracing::warn!(%error, "startup table enumeration failed, table model starts empty"),
        Err(error) => tracing::warn!(%error, "startup table enumeration task panicked"),
    }
    {
        let watcher = watcher.clone();
        let cancel = cancel.clone();
        let hub_address = cfg.tracehub_address.clone();
        let dial_timeout = cfg.dial_timeout;
        let compression = cfg.compression;
        let sync_interval = cfg.table_sync_interval;
        tasks.spawn(async move {
            (
                "table_watcher",
                table_watcher::run(table_consumer, watcher, hub_address, dial_timeout, compression, sync_interval, cancel)
                    .await
                    .map_err(Into::into),
            )
        });
    }

    let (sender, sender_handle) =
        trace_sender::spawn(cfg.tracehub_address.clone(), cfg.dial_timeout, cfg.compression, 1024, cancel.clone());
    tasks.spawn(async move {
        match sender_handle.await {
            Ok(result) => ("trace_sender", result.map_err(Into::into)),
            Err(join_error) => ("trace_sender", Err(sender_panic(join_error.to_string()))),
        }
    });

    {
        let cancel = cancel.clone();
        let telemetry = telemetry.clone();
        let agent_id = cfg.user_agent.clone();
        tasks.spawn(async move {
            ("trace_pipeline", run_trace_pipeline(trace_consumer, rule_cache, iface, sg, sender, telemetry, agent_id, cancel).await)
        });
    }

    telemetry.set_healthy(true);
    spawn_shutdown_signals(cancel.clone());

    let mut exit_code = exitcode::OK;
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok((name, Ok(()))) => tracing::debug!(component = name, "component exited cleanly"),
            Ok((name, Err(error))) => {
                tracing::error!(component = name, %error, "component failed, cancelling remaining components");
                telemetry.set_healthy(false);
                exit_code = exitcode::SOFTWARE;
                cancel.cancel();
            }
            Err(join_error) => {
                tracing::error!(%join_error, "component task panicked, cancelling remaining components");
                telemetry.set_healthy(false);
                exit_code = exitcode::SOFTWARE;
                cancel.cancel();
            }
        }
    }
    exit_code
}

fn netlink_panic(message: String) -> netlink_reader::Error {
    netlink_reader::Error::Fatal(pkt_tracer_types::netlink::ReadError::Fatal(message))
}

fn sender_panic(message: String) -> trace_sender::Error {
    trace_sender::Error::Rpc(tonic::Status::internal(message))
}

fn spawn_shutdown_signals(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).expect("install SIGTERM handler");
        let mut int = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).expect("install SIGINT handler");
        tokio::select! {
            _ = term.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = int.recv() => tracing::info!("received SIGINT, shutting down"),
        }
        cancel.cancel();
    });
}

/// Drives one consumer's frames through collector → merger → sender,
/// ignoring non-trace frames and non-fatal per-trace outcomes (spec §4.4).
#[allow(clippy::too_many_arguments)]
async fn run_trace_pipeline(
    mut consumer: tokio::sync::mpsc::Receiver<Vec<Frame>>,
    rule_cache: Arc<RuleCache<NetlinkRuleSource>>,
    iface: Arc<IfaceResolver>,
    sg: Arc<SgResolver>,
    sender: TraceSender,
    telemetry: Telemetry,
    agent_id: String,
    cancel: CancellationToken,
) -> Result<(), FatalError> {
    let mut merger = Merger::new(rule_cache, iface, sg, agent_id.clone());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            maybe = consumer.recv() => {
                let Some(batch) = maybe else { return Ok(()) };
                for frame in batch {
                    let Frame::Trace(buf) = frame else { continue };
                    let Some(partial) = trace_collector::parse(&buf, SystemTime::now()) else { continue };
                    match merger.ingest(partial).await {
                        Ok(Some(merged)) => {
                            telemetry.traces_counter.with_label_values(&[&agent_id]).inc();
                            sender.send(merged).await.map_err(FatalError::TraceSender)?;
                        }
                        Ok(None) => {}
                        Err(error) => tracing::warn!(%error, "dropping trace: merge failed"),
                    }
                }
            }
        }
    }
}
