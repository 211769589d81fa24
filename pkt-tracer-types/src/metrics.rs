//! Process telemetry: Prometheus counters plus the `/healthcheck` boolean
//! (spec §7). Grounded on the teacher's `metrics.rs` (one struct owning
//! registration) but built out fully, since the teacher's own file is a
//! stub that never registers anything with a real registry.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use prometheus::{CounterVec, Encoder, Registry, TextEncoder, opts};
use tokio::net::TcpListener;

/// Shared process telemetry: Prometheus counters for the error taxonomy in
/// spec §7, plus an atomic healthcheck flag flipped by the supervisor.
#[derive(Clone)]
pub struct Telemetry {
    registry: Registry,
    pub err_nl_mem_counter: CounterVec,
    pub db_write_counter: CounterVec,
    pub traces_counter: CounterVec,
    healthy: Arc<AtomicBool>,
}

impl Telemetry {
    pub fn new() -> Self {
        let registry = Registry::new();
        let err_nl_mem_counter = CounterVec::new(
            opts!("err_nl_mem_counter", "netlink buffer-overrun events by source"),
            &["source"],
        )
        .expect("valid metric");
        let db_write_counter =
            CounterVec::new(opts!("db_write_counter", "store write attempts by table and outcome"), &[
                "table", "outcome",
            ])
            .expect("valid metric");
        let traces_counter =
            CounterVec::new(opts!("traces_counter", "merged traces emitted by agent"), &["agent_id"])
                .expect("valid metric");

        registry.register(Box::new(err_nl_mem_counter.clone())).expect("register");
        registry.register(Box::new(db_write_counter.clone())).expect("register");
        registry.register(Box::new(traces_counter.clone())).expect("register");

        Telemetry {
            registry,
            err_nl_mem_counter,
            db_write_counter,
            traces_counter,
            healthy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn render(&self) -> String {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&families, &mut buf).expect("encode");
        String::from_utf8(buf).expect("utf8 metrics")
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Telemetry::new()
    }
}

/// Serves `/metrics` and `/healthcheck` over plain HTTP until the socket is
/// dropped; intended to run as one spawned task per process (spec §6, §7).
pub async fn serve(addr: SocketAddr, telemetry: Telemetry) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let telemetry = telemetry.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let telemetry = telemetry.clone();
                async move { handle(req, telemetry) }
            });
            if let Err(error) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(%error, "telemetry connection closed");
            }
        });
    }
}

fn handle(
    req: Request<hyper::body::Incoming>,
    telemetry: Telemetry,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let body = match req.uri().path() {
        "/healthcheck" => {
            let healthy = telemetry.is_healthy();
            return Ok(Response::builder()
                .status(if healthy { 200 } else { 503 })
                .body(Full::new(Bytes::from(healthy.to_string())))
                .expect("valid response"));
        }
        "/metrics" => telemetry.render(),
        _ => {
            return Ok(Response::builder()
                .status(404)
                .body(Full::new(Bytes::from("not found")))
                .expect("valid response"));
        }
    };
    Ok(Response::new(Full::new(Bytes::from(body))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_flag_starts_false() {
        let t = Telemetry::new();
        assert!(!t.is_healthy());
        t.set_healthy(true);
        assert!(t.is_healthy());
    }

    #[test]
    fn render_includes_registered_metric_names() {
        let t = Telemetry::new();
        t.err_nl_mem_counter.with_label_values(&["collector"]).inc();
        let rendered = t.render();
        assert!(rendered.contains("err_nl_mem_counter"));
    }
}
