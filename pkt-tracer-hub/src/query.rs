//! Hub query service (spec §4.6): `FetchTraces` (one-shot or long-poll
//! "follow") and `FetchNftTable`.
//!
//! `FetchTraces` lowers a [`pkt_tracer_types::filter::FilterScope`] — built
//! either from the request's per-field lists or its free-form `query`
//! string (spec §4.7) — into a `WHERE` clause, then either runs it once or
//! loops it on a `check_interval` ticker with an advancing `[from, to)`
//! window (testable property 10).

use std::pin::Pin;
use std::time::{Duration, SystemTime};

use futures::Stream;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use pkt_tracer_proto::tracehub::query_server::Query;
use pkt_tracer_proto::tracehub::{FetchNftTableQry, FetchedTrace, NftTableList, NftTableRow, TraceList, TraceScope};
use pkt_tracer_types::filter::FilterScope;

use crate::registry::{self, FetchedTraceRow, Registry};

const PAGE_SIZE: usize = 1024;

pub struct QueryService {
    registry: std::sync::Arc<Registry>,
    check_interval: Duration,
}

impl QueryService {
    pub fn new(registry: std::sync::Arc<Registry>, check_interval: Duration) -> Self {
        QueryService { registry, check_interval }
    }
}

fn to_status(error: registry::Error) -> Status {
    Status::internal(error.to_string())
}

fn to_systemtime(ts: &prost_types::Timestamp) -> SystemTime {
    let secs = ts.seconds.max(0) as u64;
    let nanos = ts.nanos.max(0) as u32;
    std::time::UNIX_EPOCH + Duration::from_secs(secs) + Duration::from_nanos(nanos as u64)
}

fn to_prost_timestamp(t: OffsetDateTime) -> prost_types::Timestamp {
    prost_types::Timestamp { seconds: t.unix_timestamp(), nanos: t.nanosecond() as i32 }
}

fn scope_from_request(scope: &TraceScope) -> FilterScope {
    let time_range = match (&scope.time_from, &scope.time_to) {
        (Some(from), Some(to)) => {
            Some(pkt_tracer_types::filter::TimeRange { from: to_systemtime(from), to: to_systemtime(to) })
        }
        _ => None,
    };
    FilterScope {
        trace_id: scope.trace_id.clone(),
        table: scope.table.clone(),
        chain: scope.chain.clone(),
        jump_target: scope.jump_target.clone(),
        rule_handle: scope.rule_handle.clone(),
        family: scope.family.clone(),
        iifname: scope.iifname.clone(),
        oifname: scope.oifname.clone(),
        smac: scope.smac.clone(),
        dmac: scope.dmac.clone(),
        saddr: scope.saddr.clone(),
        daddr: scope.daddr.clone(),
        sport: scope.sport.clone(),
        dport: scope.dport.clone(),
        s_sg_name: scope.s_sg_name.clone(),
        d_sg_name: scope.d_sg_name.clone(),
        s_sg_net: scope.s_sg_net.clone(),
        d_sg_net: scope.d_sg_net.clone(),
        length: scope.length.clone(),
        ip_proto: scope.ip_proto.clone(),
        verdict: scope.verdict.clone(),
        agent_id: scope.agent_id.clone(),
        time_range,
        follow: scope.follow,
        query: if scope.query.is_empty() { None } else { Some(scope.query.clone()) },
    }
}

/// Renders a `FilterScope` into the hub's `WHERE` clause: the free-form
/// query if set (mutually exclusive with per-field filters, spec §4.7),
/// else the per-field `IN` clauses, plus an agent-id restriction and an
/// optional time-range bound, all joined with `AND`.
fn where_clause(scope: &FilterScope, time_range: Option<(OffsetDateTime, OffsetDateTime)>) -> Result<String, Status> {
    scope.validate().map_err(|e| Status::invalid_argument(e.to_string()))?;

    let mut clauses = Vec::new();
    if let Some(query) = &scope.query {
        let lowered = pkt_tracer_types::filter::lower_query(query).map_err(|e| Status::invalid_argument(e.to_string()))?;
        clauses.push(lowered);
    } else if let Some(per_field) = scope.per_field_clause() {
        clauses.push(per_field);
    }

    if !scope.agent_id.is_empty() {
        let rendered: Vec<String> = scope.agent_id.iter().map(|a| format!("'{}'", a.replace('\'', "''"))).collect();
        clauses.push(format!("agent_id IN ({})", rendered.join(",")));
    }

    if let Some((from, to)) = time_range {
        clauses.push(format!(
            "timestamp >= toDateTime64('{}', 3) AND timestamp < toDateTime64('{}', 3)",
            from.format(&time::format_description::well_known::Rfc3339).map_err(|e| Status::internal(e.to_string()))?,
            to.format(&time::format_description::well_known::Rfc3339).map_err(|e| Status::internal(e.to_string()))?,
        ));
    }

    if clauses.is_empty() { Ok("1=1".to_string()) } else { Ok(clauses.join(" AND ")) }
}

fn row_to_proto(row: FetchedTraceRow) -> FetchedTrace {
    FetchedTrace {
        trace_id: row.trace_id,
        table_id: row.table_id,
        table: row.table,
        chain: row.chain,
        jump_target: row.jump_target,
        rule_handle: row.rule_handle,
        rule: row.rule,
        verdict: row.verdict,
        iifname: row.iifname,
        oifname: row.oifname,
        family: row.family,
        ip_proto: row.ip_proto,
        length: row.length,
        smac: row.smac,
        dmac: row.dmac,
        saddr: row.saddr,
        daddr: row.daddr,
        sport: row.sport,
        dport: row.dport,
        s_sg_name: row.s_sg_name,
        d_sg_name: row.d_sg_name,
        s_sg_net: row.s_sg_net,
        d_sg_net: row.d_sg_net,
        agent_id: row.agent_id,
        timestamp: Some(to_prost_timestamp(row.timestamp)),
    }
}

type TraceListStream = Pin<Box<dyn Stream<Item = Result<TraceList, Status>> + Send + 'static>>;

#[tonic::async_trait]
impl Query for QueryService {
    type FetchTracesStream = TraceListStream;

    async fn fetch_traces(&self, request: Request<TraceScope>) -> Result<Response<Self::FetchTracesStream>, Status> {
        let scope_msg = request.into_inner();
        let scope = scope_from_request(&scope_msg);
        scope.validate().map_err(|e| Status::invalid_argument(e.to_string()))?;

        let (tx, rx) = mpsc::channel(8);
        let registry = self.registry.clone();
        let check_interval = self.check_interval;
        let explicit_range = scope.time_range.map(|r| (OffsetDateTime::from(r.from), OffsetDateTime::from(r.to)));

        if scope.follow {
            tokio::spawn(async move {
                run_follow(registry, scope, explicit_range, check_interval, tx).await;
            });
        } else {
            tokio::spawn(async move {
                run_one_shot(registry, scope, explicit_range, tx).await;
            });
        }

        let stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn fetch_nft_table(&self, request: Request<FetchNftTableQry>) -> Result<Response<NftTableList>, Status> {
        let qry = request.into_inner();
        let rows = self.registry.fetch_nft_tables(&qry.table_id).await.map_err(to_status)?;
        let tables = rows
            .into_iter()
            .map(|r| NftTableRow { table_id: r.table_id, table_text: r.table_str, timestamp: Some(to_prost_timestamp(r.timestamp)) })
            .collect();
        Ok(Response::new(NftTableList { tables }))
    }
}

/// One-shot `FetchTraces` (spec §4.6): pages through the store, sending a
/// batch per page, terminated by an empty `TraceList` marker.
async fn run_one_shot(
    registry: std::sync::Arc<Registry>,
    scope: FilterScope,
    explicit_range: Option<(OffsetDateTime, OffsetDateTime)>,
    tx: mpsc::Sender<Result<TraceList, Status>>,
) {
    let clause = match where_clause(&scope, explicit_range) {
        Ok(c) => c,
        Err(status) => {
            let _ = tx.send(Err(status)).await;
            return;
        }
    };

    let mut offset = 0usize;
    loop {
        match registry.fetch_traces(&clause, PAGE_SIZE, offset).await {
            Ok(rows) => {
                let done = rows.len() < PAGE_SIZE;
                let traces = rows.into_iter().map(row_to_proto).collect();
                if tx.send(Ok(TraceList { traces })).await.is_err() {
                    return;
                }
                if done {
                    let _ = tx.send(Ok(TraceList { traces: Vec::new() })).await;
                    return;
                }
                offset += PAGE_SIZE;
            }
            Err(error) => {
                let _ = tx.send(Err(to_status(error))).await;
                return;
            }
        }
    }
}

/// Follow-mode `FetchTraces` (spec §4.6, testable property 10): re-issues
/// the query on every `check_interval` tick with a window that advances
/// `last.to <- now` each time, so ticks never overlap and never gap.
async fn run_follow(
    registry: std::sync::Arc<Registry>,
    scope: FilterScope,
    explicit_range: Option<(OffsetDateTime, OffsetDateTime)>,
    check_interval: Duration,
    tx: mpsc::Sender<Result<TraceList, Status>>,
) {
    let mut window_from = explicit_range.map(|(from, _)| from).unwrap_or_else(OffsetDateTime::now_utc);
    let mut tick = tokio::time::interval(check_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tick.tick().await;
        let now = OffsetDateTime::now_utc();
        let clause = match where_clause(&scope, Some((window_from, now))) {
            Ok(c) => c,
            Err(status) => {
                let _ = tx.send(Err(status)).await;
                return;
            }
        };
        window_from = now;

        let mut offset = 0usize;
        loop {
            match registry.fetch_traces(&clause, PAGE_SIZE, offset).await {
                Ok(rows) => {
                    let done = rows.len() < PAGE_SIZE;
                    let traces = rows.into_iter().map(row_to_proto).collect();
                    let is_empty = traces.is_empty();
                    if tx.send(Ok(TraceList { traces })).await.is_err() {
                        return;
                    }
                    if done {
                        if !is_empty {
                            let _ = tx.send(Ok(TraceList { traces: Vec::new() })).await;
                        }
                        break;
                    }
                    offset += PAGE_SIZE;
                }
                Err(error) => {
                    let _ = tx.send(Err(to_status(error))).await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_from_request_maps_follow_and_query_fields() {
        let msg = TraceScope { follow: true, query: "table=='nat'".to_string(), ..Default::default() };
        let scope = scope_from_request(&msg);
        assert!(scope.follow);
        assert_eq!(scope.query.as_deref(), Some("table=='nat'"));
    }

    #[test]
    fn where_clause_rejects_query_and_per_field_together() {
        let mut scope = FilterScope { query: Some("table=='nat'".to_string()), ..Default::default() };
        scope.table.push("nat".to_string());
        assert!(where_clause(&scope, None).is_err());
    }

    #[test]
    fn where_clause_defaults_to_tautology_when_unfiltered() {
        let scope = FilterScope::default();
        assert_eq!(where_clause(&scope, None).unwrap(), "1=1");
    }

    #[test]
    fn where_clause_appends_agent_id_restriction() {
        let mut scope = FilterScope::default();
        scope.agent_id.push("agent-1".to_string());
        let clause = where_clause(&scope, None).unwrap();
        assert_eq!(clause, "agent_id IN ('agent-1')");
    }
}
