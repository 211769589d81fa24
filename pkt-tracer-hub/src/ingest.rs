//! Hub ingest service (spec §4.5): `TraceStream` and `SyncNftTables`,
//! batched onto ClickHouse with a row-count-or-interval flush policy.
//!
//! Each RPC call runs its own [`BatchWriter`] and flush ticker inline in the
//! handler task — tonic already gives every call its own task, so there's no
//! need for a separate mailbox/worker split the way the agent's netlink
//! fan-out needs one.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tonic::{Request, Response, Status, Streaming};

use pkt_tracer_proto::tracehub::ingest_server::Ingest;
use pkt_tracer_proto::tracehub::{NftTableBatch, TraceBatch};
use pkt_tracer_types::metrics::Telemetry;

use crate::registry::{self, Registry};

/// Accumulates rows and signals a flush once `cap` is reached (spec §4.5,
/// testable property 9: "flush precisely when the appended row count
/// transitions from N-1 to N").
struct BatchWriter<T> {
    buf: Vec<T>,
    cap: usize,
}

impl<T> BatchWriter<T> {
    fn new(cap: usize) -> Self {
        BatchWriter { buf: Vec::new(), cap: cap.max(1) }
    }

    fn push(&mut self, row: T) -> Option<Vec<T>> {
        self.buf.push(row);
        if self.buf.len() >= self.cap { Some(std::mem::take(&mut self.buf)) } else { None }
    }

    fn drain_if_nonempty(&mut self) -> Option<Vec<T>> {
        if self.buf.is_empty() { None } else { Some(std::mem::take(&mut self.buf)) }
    }
}

pub struct IngestService {
    registry: Arc<Registry>,
    telemetry: Telemetry,
    max_rows_in_batch: usize,
    flush_interval: Duration,
}

impl IngestService {
    pub fn new(registry: Arc<Registry>, telemetry: Telemetry, max_rows_in_batch: usize, flush_interval: Duration) -> Self {
        IngestService { registry, telemetry, max_rows_in_batch, flush_interval }
    }

    fn observe(&self, table: &str, outcome: &str) {
        self.telemetry.db_write_counter.with_label_values(&[table, outcome]).inc();
    }
}

fn to_status(error: registry::Error) -> Status {
    Status::internal(error.to_string())
}

#[tonic::async_trait]
impl Ingest for IngestService {
    async fn trace_stream(&self, request: Request<Streaming<TraceBatch>>) -> Result<Response<()>, Status> {
        let mut stream = request.into_inner();
        let mut writer = BatchWriter::new(self.max_rows_in_batch);
        let mut tick = tokio::time::interval(self.flush_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await; // first tick fires immediately; consume it so flushes are interval-spaced

        loop {
            tokio::select! {
                message = stream.message() => {
                    match message? {
                        Some(batch) => {
                            for trace in batch.traces {
                                let row = registry::TraceRow::from_wire(trace, OffsetDateTime::now_utc());
                                if let Some(rows) = writer.push(row) {
                                    self.flush(rows).await?;
                                }
                            }
                        }
                        None => {
                            if let Some(rows) = writer.drain_if_nonempty() {
                                self.flush(rows).await?;
                            }
                            return Ok(Response::new(()));
                        }
                    }
                }
                _ = tick.tick() => {
                    if let Some(rows) = writer.drain_if_nonempty() {
                        self.flush(rows).await?;
                    }
                }
            }
        }
    }

    async fn sync_nft_tables(&self, request: Request<Streaming<NftTableBatch>>) -> Result<Response<()>, Status> {
        let mut stream = request.into_inner();
        self.registry.truncate_staging().await.map_err(to_status)?;

        let mut writer = BatchWriter::new(self.max_rows_in_batch);
        let mut tick = tokio::time::interval(self.flush_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            tokio::select! {
                message = stream.message() => {
                    match message? {
                        Some(batch) => {
                            for snapshot in batch.tables {
                                for row in registry::flatten_snapshot(snapshot, OffsetDateTime::now_utc()) {
                                    if let Some(rows) = writer.push(row) {
                                        self.flush_staging(rows).await?;
                                    }
                                }
                            }
                        }
                        None => {
                            if let Some(rows) = writer.drain_if_nonempty() {
                                self.flush_staging(rows).await?;
                            }
                            self.registry.publish_staged_tables().await.map_err(to_status)?;
                            return Ok(Response::new(()));
                        }
                    }
                }
                _ = tick.tick() => {
                    if let Some(rows) = writer.drain_if_nonempty() {
                        self.flush_staging(rows).await?;
                    }
                }
            }
        }
    }
}

impl IngestService {
    async fn flush(&self, rows: Vec<registry::TraceRow>) -> Result<(), Status> {
        match self.registry.insert_traces(rows).await {
            Ok(()) => {
                self.observe("traces", "ok");
                Ok(())
            }
            Err(error) => {
                self.observe("traces", "error");
                Err(to_status(error))
            }
        }
    }

    async fn flush_staging(&self, rows: Vec<registry::NftTableRow>) -> Result<(), Status> {
        match self.registry.insert_staging(rows).await {
            Ok(()) => {
                self.observe("nftables", "ok");
                Ok(())
            }
            Err(error) => {
                self.observe("nftables", "error");
                Err(to_status(error))
            }
        }
    }
}
