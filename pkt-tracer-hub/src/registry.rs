//! ClickHouse-backed persisted state (spec §6): the `traces` table, the
//! `nftables` table, and the `vu_fetch_trace` view the query service reads
//! through.
//!
//! Table snapshots are written into a staging table during one
//! `SyncNftTables` call and atomically exchanged into `nftables` when the
//! stream completes (spec §4.5), so a concurrent `FetchNftTable` never
//! observes a half-written cycle. `EXCHANGE TABLES` is the mechanism;
//! ClickHouse guarantees it's atomic from a reader's perspective.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use clickhouse::{Client, Row};

use pkt_tracer_proto::tracehub::{MergedTrace as WireTrace, NftTableSnapshot};

#[derive(Debug, Error)]
pub enum Error {
    #[error("clickhouse error: {0}")]
    ClickHouse(#[from] clickhouse::error::Error),
}

/// One row of the `traces` table, written by `TraceStream` (spec §4.5).
/// Column names match [`pkt_tracer_types::filter::FIELD_DICTIONARY`]'s
/// targets directly, so `vu_fetch_trace` needs no renaming for the fields it
/// inherits from this table.
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct TraceRow {
    pub trace_id: u32,
    pub table: String,
    pub chain: String,
    pub jump_target: String,
    pub rule_handle: u64,
    pub family: String,
    pub iifname: String,
    pub oifname: String,
    pub smac: String,
    pub dmac: String,
    pub saddr: String,
    pub daddr: String,
    pub sport: u32,
    pub dport: u32,
    pub s_sg_name: String,
    pub d_sg_name: String,
    pub s_sg_net: String,
    pub d_sg_net: String,
    pub length: u32,
    pub ip_proto: String,
    pub verdict: String,
    pub rule: String,
    pub agent_id: String,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    pub timestamp: OffsetDateTime,
}

impl TraceRow {
    pub fn from_wire(t: WireTrace, observed_at: OffsetDateTime) -> Self {
        TraceRow {
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
            sport: t.sport,
            dport: t.dport,
            s_sg_name: t.s_sg_name,
            d_sg_name: t.d_sg_name,
            s_sg_net: t.s_sg_net,
            d_sg_net: t.d_sg_net,
            length: t.length,
            ip_proto: t.ip_proto,
            verdict: t.verdict,
            rule: t.rule,
            agent_id: t.agent_id,
            timestamp: observed_at,
        }
    }
}

/// One row of the `nftables`/`nftables_staging` tables: one rule per row,
/// denormalised against its owning table's name/family/canonical text
/// (mirrors the flattening the original Go model used, `models.go`
/// `NftTablesDB`). A table snapshot with no rules still writes one row, so
/// the table's text isn't lost.
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct NftTableRow {
    pub table_name: String,
    pub table_family: String,
    pub chain_name: String,
    pub rule: String,
    pub handle: u64,
    pub table_str: String,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    pub timestamp: OffsetDateTime,
}

pub fn flatten_snapshot(snapshot: NftTableSnapshot, observed_at: OffsetDateTime) -> Vec<NftTableRow> {
    if snapshot.rules.is_empty() {
        return vec![NftTableRow {
            table_name: snapshot.table_name,
            table_family: snapshot.table_family,
            chain_name: String::new(),
            rule: String::new(),
            handle: 0,
            table_str: snapshot.table_text,
            timestamp: observed_at,
        }];
    }
    snapshot
        .rules
        .into_iter()
        .map(|r| NftTableRow {
            table_name: snapshot.table_name.clone(),
            table_family: snapshot.table_family.clone(),
            chain_name: r.chain,
            rule: r.rule,
            handle: r.handle,
            table_str: snapshot.table_text.clone(),
            timestamp: observed_at,
        })
        .collect()
}

/// Row read back through `vu_fetch_trace` (spec §4.6). `table_id` is
/// produced by the view (spec §9 open question b); here it's
/// `cityHash64(table_name, table_family)`, computed in SQL so it stays
/// stable across query-side process restarts.
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct FetchedTraceRow {
    pub trace_id: u32,
    pub table_id: u64,
    pub table: String,
    pub chain: String,
    pub jump_target: String,
    pub rule_handle: u64,
    pub rule: String,
    pub verdict: String,
    pub iifname: String,
    pub oifname: String,
    pub family: String,
    pub ip_proto: String,
    pub length: u32,
    pub smac: String,
    pub dmac: String,
    pub saddr: String,
    pub daddr: String,
    pub sport: u32,
    pub dport: u32,
    pub s_sg_name: String,
    pub d_sg_name: String,
    pub s_sg_net: String,
    pub d_sg_net: String,
    pub agent_id: String,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    pub timestamp: OffsetDateTime,
}

/// Row read back for `FetchNftTable` (spec §4.6).
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct NftTableSnapshotRow {
    pub table_id: u64,
    pub table_str: String,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    pub timestamp: OffsetDateTime,
}

/// Handle to the ClickHouse-backed store. Cheap to clone (the underlying
/// `clickhouse::Client` is a thin `reqwest`-style handle over pooled HTTP
/// connections).
#[derive(Clone)]
pub struct Registry {
    client: Client,
}

impl Registry {
    pub fn connect(url: &str, database: &str) -> Self {
        let client = Client::default().with_url(url).with_database(database);
        Registry { client }
    }

    /// Creates the store's tables/view if absent. Idempotent, safe to call
    /// on every hub startup (spec §6).
    pub async fn migrate(&self) -> Result<(), Error> {
        self.client
            .query(
                "CREATE TABLE IF NOT EXISTS traces (
                    trace_id UInt32,
                    table String,
                    chain String,
                    jump_target String,
                    rule_handle UInt64,
                    family String,
                    iifname String,
                    oifname String,
                    smac String,
                    dmac String,
                    saddr String,
                    daddr String,
                    sport UInt32,
                    dport UInt32,
                    s_sg_name String,
                    d_sg_name String,
                    s_sg_net String,
                    d_sg_net String,
                    length UInt32,
                    ip_proto String,
                    verdict String,
                    rule String,
                    agent_id String,
                    timestamp DateTime64(3)
                ) ENGINE = MergeTree ORDER BY timestamp",
            )
            .execute()
            .await?;

        for name in ["nftables", "nftables_staging"] {
            self.client
                .query(&format!(
                    "CREATE TABLE IF NOT EXISTS {name} (
                        table_name String,
                        table_family String,
                        chain_name String,
                        rule String,
                        handle UInt64,
                        table_str String,
                        timestamp DateTime64(3)
                    ) ENGINE = MergeTree ORDER BY (table_name, table_family)"
                ))
                .execute()
                .await?;
        }

        self.client
            .query(
                "CREATE VIEW IF NOT EXISTS vu_fetch_trace AS
                 SELECT
                    t.trace_id AS trace_id,
                    cityHash64(n.table_name, n.table_family) AS table_id,
                    t.table AS table,
                    t.chain AS chain,
                    t.jump_target AS jump_target,
                    t.rule_handle AS rule_handle,
                    t.rule AS rule,
                    t.verdict AS verdict,
                    t.iifname AS iifname,
                    t.oifname AS oifname,
                    t.family AS family,
                    t.ip_proto AS ip_proto,
                    t.length AS length,
                    t.smac AS smac,
                    t.dmac AS dmac,
                    t.saddr AS saddr,
                    t.daddr AS daddr,
                    t.sport AS sport,
                    t.dport AS dport,
                    t.s_sg_name AS s_sg_name,
                    t.d_sg_name AS d_sg_name,
                    t.s_sg_net AS s_sg_net,
                    t.d_sg_net AS d_sg_net,
                    t.agent_id AS agent_id,
                    t.timestamp AS timestamp
                 FROM traces AS t
                 LEFT JOIN (
                     SELECT DISTINCT table_name, table_family FROM nftables
                 ) AS n ON t.table = n.table_name AND t.family = n.table_family",
            )
            .execute()
            .await?;

        Ok(())
    }

    pub async fn insert_traces(&self, rows: Vec<TraceRow>) -> Result<(), Error> {
        let mut insert = self.client.insert::<TraceRow>("traces")?;
        for row in &rows {
            insert.write(row).await?;
        }
        insert.end().await?;
        Ok(())
    }

    /// Empties the staging table at the start of a `SyncNftTables` cycle.
    pub async fn truncate_staging(&self) -> Result<(), Error> {
        self.client.query("TRUNCATE TABLE nftables_staging").execute().await?;
        Ok(())
    }

    pub async fn insert_staging(&self, rows: Vec<NftTableRow>) -> Result<(), Error> {
        let mut insert = self.client.insert::<NftTableRow>("nftables_staging")?;
        for row in &rows {
            insert.write(row).await?;
        }
        insert.end().await?;
        Ok(())
    }

    /// Atomically publishes a completed sync cycle's staged snapshot as the
    /// queryable `nftables` table (spec §4.5). The prior `nftables` contents
    /// end up in `nftables_staging`, ready to be truncated by the next cycle.
    pub async fn publish_staged_tables(&self) -> Result<(), Error> {
        self.client.query("EXCHANGE TABLES nftables AND nftables_staging").execute().await?;
        Ok(())
    }

    /// Runs a `FetchTraces` query (one page of a one-shot fetch, or one
    /// follow-mode tick) against `vu_fetch_trace`.
    pub async fn fetch_traces(&self, where_clause: &str, limit: usize, offset: usize) -> Result<Vec<FetchedTraceRow>, Error> {
        let sql = format!(
            "SELECT trace_id, table_id, table, chain, jump_target, rule_handle, rule, verdict, iifname, \
             oifname, family, ip_proto, length, smac, dmac, saddr, daddr, sport, dport, s_sg_name, d_sg_name, \
             s_sg_net, d_sg_net, agent_id, timestamp FROM vu_fetch_trace WHERE {where_clause} \
             ORDER BY timestamp LIMIT {limit} OFFSET {offset}"
        );
        Ok(self.client.query(&sql).fetch_all::<FetchedTraceRow>().await?)
    }

    /// Runs a `FetchNftTable` query, either unscoped (all tables) or scoped
    /// to a list of `table_id`s (spec §4.6).
    pub async fn fetch_nft_tables(&self, table_ids: &[u64]) -> Result<Vec<NftTableSnapshotRow>, Error> {
        let sql = if table_ids.is_empty() {
            "SELECT cityHash64(table_name, table_family) AS table_id, any(table_str) AS table_str, \
             max(timestamp) AS timestamp FROM nftables GROUP BY table_name, table_family"
                .to_string()
        } else {
            let ids: Vec<String> = table_ids.iter().map(u64::to_string).collect();
            format!(
                "SELECT cityHash64(table_name, table_family) AS table_id, any(table_str) AS table_str, \
                 max(timestamp) AS timestamp FROM nftables GROUP BY table_name, table_family \
                 HAVING table_id IN ({})",
                ids.join(",")
            )
        };
        Ok(self.client.query(&sql).fetch_all::<NftTableSnapshotRow>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> NftTableSnapshot {
        use pkt_tracer_proto::tracehub::NftRule;
        NftTableSnapshot {
            table_name: "filter".to_string(),
            table_family: "ip".to_string(),
            table_text: "table ip filter { }".to_string(),
            rules: vec![NftRule { chain: "input".to_string(), rule: "accept".to_string(), handle: 1 }],
        }
    }

    #[test]
    fn flattening_emits_one_row_per_rule() {
        let now = OffsetDateTime::now_utc();
        let rows = flatten_snapshot(sample_snapshot(), now);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].chain_name, "input");
        assert_eq!(rows[0].handle, 1);
    }

    #[test]
    fn flattening_a_ruleless_table_still_keeps_its_text() {
        let now = OffsetDateTime::now_utc();
        let mut snapshot = sample_snapshot();
        snapshot.rules.clear();
        let rows = flatten_snapshot(snapshot, now);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].table_str, "table ip filter { }");
        assert_eq!(rows[0].chain_name, "");
    }
}
