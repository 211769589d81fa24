//! Trace merger (spec §4.4): joins partial traces sharing a `trace-id` into
//! one [`MergedTrace`], enriched with rule text, interface names, and SG
//! metadata.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;

use pkt_tracer_types::model::{
    verdict, Decision, Family, FiveTuple, MergedTrace, PartialTrace, TraceType,
};

use crate::iface_resolver::IfaceResolver;
use crate::rule_cache::{KernelRuleSource, LookupError as RuleLookupError, RuleCache};
use crate::sg_resolver::SgResolver;

#[derive(Debug, Error)]
pub enum Error {
    #[error("missing interface name: {0}")]
    MissingIface(#[from] crate::iface_resolver::NotFound),
    #[error("sg lookup failed: {0}")]
    SgLookup(String),
}

struct Pending {
    tr: Option<PartialTrace>,
    verdicts: HashSet<i32>,
    decisions: Vec<Decision>,
    rule_handle: Option<u64>,
    rule_family: Option<Family>,
    rule_table: Option<String>,
    rule_chain: Option<String>,
    jump_target: Option<String>,
    agent_id: String,
}

impl Pending {
    fn new(agent_id: &str) -> Self {
        Pending {
            tr: None,
            verdicts: HashSet::new(),
            decisions: Vec::new(),
            rule_handle: None,
            rule_family: None,
            rule_table: None,
            rule_chain: None,
            jump_target: None,
            agent_id: agent_id.to_string(),
        }
    }

    fn is_ready(&self) -> bool {
        self.tr.is_some()
            && self.rule_handle.map(|h| h != 0).unwrap_or(false)
            && (self.verdicts.contains(&verdict::ACCEPT) || self.verdicts.contains(&verdict::DROP))
    }
}

/// Owns the `trace-id -> pending-state` map and drives partials to
/// completion (spec §4.4).
pub struct Merger<K: KernelRuleSource> {
    pending: HashMap<u32, Pending>,
    rule_cache: Arc<RuleCache<K>>,
    iface: Arc<IfaceResolver>,
    sg: Arc<SgResolver>,
    agent_id: String,
}

impl<K: KernelRuleSource> Merger<K> {
    pub fn new(
        rule_cache: Arc<RuleCache<K>>,
        iface: Arc<IfaceResolver>,
        sg: Arc<SgResolver>,
        agent_id: String,
    ) -> Self {
        Merger { pending: HashMap::new(), rule_cache, iface, sg, agent_id }
    }

    /// Feeds one partial into the merger's in-progress state and, if it
    /// completes a trace, emits the merged record.
    pub async fn ingest(&mut self, partial: PartialTrace) -> Result<Option<MergedTrace>, Error> {
        let trace_id = partial.trace_id;
        let entry = self.pending.entry(trace_id).or_insert_with(|| Pending::new(&self.agent_id));

        if partial.headers.link_layer.is_some() || partial.headers.network.is_some() {
            entry.tr = Some(partial.clone());
        }

        match partial.kind {
            TraceType::Rule => {
                if let Some(handle) = partial.rule_handle {
                    entry.rule_handle = Some(handle);
                    entry.rule_family = partial.family;
                    entry.rule_table = partial.table.clone();
                    entry.rule_chain = partial.chain.clone();
                    entry.jump_target = partial.jump_target.clone();
                    if let Some(v) = partial.verdict {
                        entry.verdicts.insert(v);
                        entry.decisions.push(Decision {
                            kind: TraceType::Rule,
                            verdict: v,
                            table: partial.table.clone(),
                            chain: partial.chain.clone(),
                        });
                    }
                }
            }
            TraceType::Return => {
                if let Some(v) = partial.verdict {
                    entry.verdicts.insert(v);
                    entry.decisions.push(Decision {
                        kind: TraceType::Return,
                        verdict: v,
                        table: partial.table.clone(),
                        chain: partial.chain.clone(),
                    });
                }
            }
            TraceType::Policy => {
                if let Some(p) = partial.policy {
                    entry.verdicts.insert(p);
                    entry.decisions.push(Decision {
                        kind: TraceType::Policy,
                        verdict: p,
                        table: partial.table.clone(),
                        chain: partial.chain.clone(),
                    });
                }
            }
        }

        if !entry.is_ready() {
            return Ok(None);
        }

        let pending = self.pending.remove(&trace_id).expect("just matched");
        match self.complete(trace_id, pending).await {
            Ok(merged) => Ok(Some(merged)),
            Err(MergeFailure::Expired) => Ok(None),
            Err(MergeFailure::Fatal(e)) => Err(e),
        }
    }

    async fn complete(&self, trace_id: u32, pending: Pending) -> Result<MergedTrace, MergeFailure> {
        let tr = pending.tr.expect("ready implies tr present");
        let family = pending.rule_family.unwrap_or(Family::Ip);
        let table = pending.rule_table.clone().unwrap_or_default();
        let chain = pending.rule_chain.clone().unwrap_or_default();
        let handle = pending.rule_handle.unwrap_or(0);

        let rule_text = match self.rule_cache.lookup(&table, family, &chain, handle, tr.observed_at).await {
            Ok(text) => text,
            Err(RuleLookupError::ExpiredTrace) => return Err(MergeFailure::Expired),
            Err(RuleLookupError::KernelQuery(e)) => {
                return Err(MergeFailure::Fatal(Error::SgLookup(e)))
            }
        };

        let iifname = self.iface.resolve(tr.iif.unwrap_or(0))?;
        let oifname = self.iface.resolve(tr.oif.unwrap_or(0))?;

        let five_tuple = parse_five_tuple(&tr);

        let (s_sg_name, s_sg_net) = match self.sg.lookup(&five_tuple.saddr) {
            Ok(e) => (e.sg_name, e.network_name),
            Err(_) => (String::new(), String::new()),
        };
        let (d_sg_name, d_sg_net) = match self.sg.lookup(&five_tuple.daddr) {
            Ok(e) => (e.sg_name, e.network_name),
            Err(_) => (String::new(), String::new()),
        };

        Ok(MergedTrace {
            trace_id,
            family: family.to_string(),
            table,
            chain,
            jump_target: pending.jump_target.unwrap_or_default(),
            rule_handle: handle,
            rule_text,
            verdict: pkt_tracer_types::model::render_verdict_chain(&pending.decisions),
            iifname,
            oifname,
            smac: five_tuple.smac,
            dmac: five_tuple.dmac,
            saddr: five_tuple.saddr,
            daddr: five_tuple.daddr,
            sport: five_tuple.sport,
            dport: five_tuple.dport,
            ip_proto: five_tuple.proto,
            length: five_tuple.length,
            s_sg_name,
            d_sg_name,
            s_sg_net,
            d_sg_net,
            agent_id: pending.agent_id,
        })
    }
}

enum MergeFailure {
    Expired,
    Fatal(Error),
}

/// Parses the network/transport/link-layer byte blobs captured on a partial
/// into a [`FiveTuple`]. Unparseable or absent layers leave the
/// corresponding fields at their zero value (spec §3.1 "all fields besides
/// trace-id/type are optional").
fn parse_five_tuple(tr: &PartialTrace) -> FiveTuple {
    let mut out = FiveTuple::default();

    if let Some(ll) = &tr.headers.link_layer {
        if ll.len() >= 12 {
            out.smac = mac_string(&ll[6..12]);
            out.dmac = mac_string(&ll[0..6]);
        }
    }

    if let Some(net) = &tr.headers.network {
        if !net.is_empty() {
            let version = net[0] >> 4;
            if version == 4 && net.len() >= 20 {
                out.length = u16::from_be_bytes([net[2], net[3]]) as u32;
                let proto = net[9];
                out.proto = proto_name(proto).to_string();
                out.saddr = std::net::Ipv4Addr::new(net[12], net[13], net[14], net[15]).to_string();
                out.daddr = std::net::Ipv4Addr::new(net[16], net[17], net[18], net[19]).to_string();
            } else if version == 6 && net.len() >= 40 {
                out.length = u16::from_be_bytes([net[4], net[5]]) as u32 + 40;
                let proto = net[6];
                out.proto = proto_name(proto).to_string();
                out.saddr = ipv6_string(&net[8..24]);
                out.daddr = ipv6_string(&net[24..40]);
            }
        }
    }

    if let Some(transport) = &tr.headers.transport {
        if transport.len() >= 4 {
            out.sport = u16::from_be_bytes([transport[0], transport[1]]);
            out.dport = u16::from_be_bytes([transport[2], transport[3]]);
        }
    }

    out
}

fn mac_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":")
}

fn ipv6_string(bytes: &[u8]) -> String {
    let mut segments = [0u16; 8];
    for (i, seg) in segments.iter_mut().enumerate() {
        *seg = u16::from_be_bytes([bytes[i * 2], bytes[i * 2 + 1]]);
    }
    std::net::Ipv6Addr::from(segments).to_string()
}

fn proto_name(code: u8) -> &'static str {
    match code {
        1 => "icmp",
        6 => "tcp",
        17 => "udp",
        58 => "icmpv6",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::time::SystemTime;

    struct StubKernel;

    #[async_trait::async_trait]
    impl KernelRuleSource for StubKernel {
        async fn query_rule(&self, _: &str, _: Family, _: &str, _: u64) -> Result<String, RuleLookupError> {
            Ok("ip saddr 10.0.0.1 accept".to_string())
        }
    }

    fn ipv4_header(proto: u8, src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut h = vec![0x45, 0, 0, 40, 0, 0, 0, 0, 64, proto, 0, 0];
        h.extend_from_slice(&src);
        h.extend_from_slice(&dst);
        h
    }

    fn new_merger() -> Merger<StubKernel> {
        let rule_cache = Arc::new(RuleCache::new(StubKernel));
        let iface = Arc::new(IfaceResolver::from_map(StdHashMap::new()));
        let sg = Arc::new(SgResolver::empty());
        Merger::new(rule_cache, iface, sg, "agent-1".to_string())
    }

    fn rule_partial(id: u32, verdict: i32) -> PartialTrace {
        PartialTrace {
            trace_id: id,
            kind: TraceType::Rule,
            family: Some(Family::Ip),
            table: Some("filter".to_string()),
            chain: Some("input".to_string()),
            rule_handle: Some(5),
            jump_target: None,
            verdict: Some(verdict),
            policy: None,
            headers: pkt_tracer_types::model::PacketHeaders {
                link_layer: None,
                network: Some(ipv4_header(6, [10, 0, 0, 1], [10, 0, 0, 2])),
                transport: Some(vec![0x03, 0xe8, 0x01, 0xbb]),
            },
            iif: Some(0),
            oif: Some(0),
            iif_type: None,
            oif_type: None,
            mark: None,
            observed_at: SystemTime::UNIX_EPOCH,
        }
    }

    fn return_partial(id: u32, verdict: i32) -> PartialTrace {
        PartialTrace {
            trace_id: id,
            kind: TraceType::Return,
            family: None,
            table: None,
            chain: None,
            rule_handle: None,
            jump_target: None,
            verdict: Some(verdict),
            policy: None,
            headers: pkt_tracer_types::model::PacketHeaders::default(),
            iif: None,
            oif: None,
            iif_type: None,
            oif_type: None,
            mark: None,
            observed_at: SystemTime::UNIX_EPOCH,
        }
    }

    fn policy_partial(id: u32, policy: i32) -> PartialTrace {
        PartialTrace {
            trace_id: id,
            kind: TraceType::Policy,
            family: None,
            table: None,
            chain: None,
            rule_handle: None,
            jump_target: None,
            verdict: None,
            policy: Some(policy),
            headers: pkt_tracer_types::model::PacketHeaders::default(),
            iif: None,
            oif: None,
            iif_type: None,
            oif_type: None,
            mark: None,
            observed_at: SystemTime::UNIX_EPOCH,
        }
    }

    #[tokio::test]
    async fn accept_path_emits_once_with_rendered_verdict_chain() {
        let mut merger = new_merger();
        assert!(merger.ingest(rule_partial(7, verdict::GOTO)).await.unwrap().is_none());
        assert!(merger.ingest(return_partial(7, verdict::CONTINUE)).await.unwrap().is_none());
        let merged = merger.ingest(policy_partial(7, verdict::ACCEPT)).await.unwrap().unwrap();

        assert_eq!(merged.verdict, "rule::goto->return::continue->policy::accept");
        assert_eq!(merged.rule_handle, 5);
        assert_eq!(merged.saddr, "10.0.0.1");
        assert_eq!(merged.daddr, "10.0.0.2");
        assert_eq!(merged.sport, 1000);
        assert_eq!(merged.dport, 443);
        assert_eq!(merged.ip_proto, "tcp");

        assert!(merger.pending.is_empty());
    }

    #[tokio::test]
    async fn further_partial_after_emit_starts_a_new_trace() {
        let mut merger = new_merger();
        merger.ingest(rule_partial(7, verdict::DROP)).await.unwrap();
        assert!(merger.pending.is_empty());
        assert!(merger.ingest(return_partial(7, verdict::CONTINUE)).await.unwrap().is_none());
        assert_eq!(merger.pending.len(), 1);
    }

    #[tokio::test]
    async fn incomplete_trace_without_terminal_verdict_stays_pending() {
        let mut merger = new_merger();
        assert!(merger.ingest(rule_partial(9, verdict::CONTINUE)).await.unwrap().is_none());
        assert_eq!(merger.pending.len(), 1);
    }
}
