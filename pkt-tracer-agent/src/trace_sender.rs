//! Trace sender (spec §4.4, §4.5): batches merged traces and streams them to
//! the hub over a long-lived `TraceStream` client-streaming RPC.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, Endpoint};

use pkt_tracer_proto::tracehub::ingest_client::IngestClient;
use pkt_tracer_proto::tracehub::{MergedTrace as WireTrace, TraceBatch};
use pkt_tracer_types::model::MergedTrace;

#[derive(Debug, Error)]
pub enum Error {
    #[error("tracehub transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("tracehub rpc error: {0}")]
    Rpc(#[from] tonic::Status),
}

fn to_wire(t: MergedTrace) -> WireTrace {
    WireTrace {
        trace_id: t.trace_id,
        table: t.table,
        chain: t.chain,
        jump_target: t.jump_target,
        rule_handle: t.rule_handle,
        family: t.family,
        iifname: t.iifname,
        oifname: t.oifname,
        smac: t.smac,
        dmac: t.dmac,
        saddr: t.saddr,
        daddr: t.daddr,
        sport: t.sport as u32,
        dport: t.dport as u32,
        s_sg_name: t.s_sg_name,
        d_sg_name: t.d_sg_name,
        s_sg_net: t.s_sg_net,
        d_sg_net: t.d_sg_net,
        length: t.length,
        ip_proto: t.ip_proto,
        verdict: t.verdict,
        rule: t.rule_text,
        agent_id: t.agent_id,
    }
}

/// A long-lived sender: holds one end of an mpsc channel that the merger
/// feeds, batches queued traces, and pushes them as a client-stream to the
/// hub. The stream is re-established (with the same channel) if the RPC
/// drops, so the merger never blocks on hub connectivity beyond the channel
/// capacity.
pub struct TraceSender {
    tx: mpsc::Sender<MergedTrace>,
}

impl TraceSender {
    pub async fn send(&self, trace: MergedTrace) -> Result<(), Error> {
        // The channel is only closed when the run loop has exited for good;
        // treat that as a non-fatal drop, the supervisor already knows.
        let _ = self.tx.send(trace).await;
        Ok(())
    }
}

/// Connects to the hub and drives the `TraceStream` RPC until cancelled.
/// Returns the sender handle the pipeline's merger stage uses to enqueue
/// merged traces.
pub fn spawn(
    address: String,
    dial_timeout: Duration,
    compression: bool,
    channel_capacity: usize,
    cancel: tokio_util::sync::CancellationToken,
) -> (TraceSender, tokio::task::JoinHandle<Result<(), Error>>) {
    let (tx, rx) = mpsc::channel(channel_capacity);
    let handle = tokio::spawn(run(address, dial_timeout, compression, rx, cancel));
    (TraceSender { tx }, handle)
}

async fn connect(address: &str, dial_timeout: Duration) -> Result<Channel, Error> {
    let endpoint = Endpoint::from_shared(address.to_string())?.connect_timeout(dial_timeout);
    Ok(endpoint.connect().await?)
}

async fn run(
    address: String,
    dial_timeout: Duration,
    compression: bool,
    mut rx: mpsc::Receiver<MergedTrace>,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<(), Error> {
    loop {
        let channel = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = connect(&address, dial_timeout) => result?,
        };
        let mut client = IngestClient::new(channel);
        if compression {
            client = client.send_compressed(tonic::codec::CompressionEncoding::Gzip);
        }

        let (batch_tx, batch_rx) = mpsc::channel::<TraceBatch>(16);
        let outbound = ReceiverStream::new(batch_rx);
        let call = tokio::spawn({
            let mut client = client.clone();
            async move { client.trace_stream(outbound).await }
        });

        let mut buf = Vec::new();
        let flush_tick = tokio::time::interval(Duration::from_secs(1));
        tokio::pin!(flush_tick);
        let disconnected = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if !buf.is_empty() {
                        let _ = batch_tx.send(TraceBatch { traces: std::mem::take(&mut buf) }).await;
                    }
                    drop(batch_tx);
                    let _ = call.await;
                    return Ok(());
                }
                maybe = rx.recv() => {
                    match maybe {
                        Some(trace) => buf.push(to_wire(trace)),
                        None => {
                            drop(batch_tx);
                            let _ = call.await;
                            return Ok(());
                        }
                    }
                    if buf.len() >= 256 && batch_tx.send(TraceBatch { traces: std::mem::take(&mut buf) }).await.is_err() {
                        break true;
                    }
                }
                _ = flush_tick.tick() => {
                    if !buf.is_empty() && batch_tx.send(TraceBatch { traces: std::mem::take(&mut buf) }).await.is_err() {
                        break true;
                    }
                }
            }
        };
        drop(batch_tx);
        if disconnected {
            tracing::warn!("tracehub stream dropped, reconnecting");
            continue;
        }
    }
}
