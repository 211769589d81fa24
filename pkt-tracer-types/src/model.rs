//! Data model shared by the agent's trace pipeline and table watcher, and by
//! the hub's ingest/query services (spec §3).

use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

/// Firewall address family (spec §3.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Family {
    Ip,
    Ip6,
    Inet,
    Arp,
    Bridge,
    Netdev,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Family::Ip => "ip",
            Family::Ip6 => "ip6",
            Family::Inet => "inet",
            Family::Arp => "arp",
            Family::Bridge => "bridge",
            Family::Netdev => "netdev",
        };
        f.write_str(s)
    }
}

impl Family {
    pub fn parse(s: &str) -> Option<Family> {
        match s {
            "ip" => Some(Family::Ip),
            "ip6" => Some(Family::Ip6),
            "inet" => Some(Family::Inet),
            "arp" => Some(Family::Arp),
            "bridge" => Some(Family::Bridge),
            "netdev" => Some(Family::Netdev),
            _ => None,
        }
    }
}

/// Kernel verdict codes (spec §4.4 "numeric verdicts use kernel semantics").
pub mod verdict {
    pub const CONTINUE: i32 = -1;
    pub const BREAK: i32 = -2;
    pub const JUMP: i32 = -3;
    pub const GOTO: i32 = -4;
    pub const RETURN: i32 = -5;
    pub const DROP: i32 = 0;
    pub const ACCEPT: i32 = 1;
    pub const STOLEN: i32 = 2;
    pub const QUEUE: i32 = 3;
    pub const REPEAT: i32 = 4;
    pub const STOP: i32 = 5;

    pub fn name(code: i32) -> &'static str {
        match code {
            CONTINUE => "continue",
            BREAK => "break",
            JUMP => "jump",
            GOTO => "goto",
            RETURN => "return",
            DROP => "drop",
            ACCEPT => "accept",
            STOLEN => "stolen",
            QUEUE => "queue",
            REPEAT => "repeat",
            STOP => "stop",
            _ => "unknown",
        }
    }

    pub fn is_terminal(code: i32) -> bool {
        code == ACCEPT || code == DROP
    }
}

/// Which stage of the evaluation pipeline produced a partial trace (§3.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceType {
    Rule,
    Return,
    Policy,
}

/// Raw packet layer headers captured at trace time, kept as opaque bytes;
/// only header presence and the network-layer 5-tuple parsed from them
/// matter to the merger.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PacketHeaders {
    pub link_layer: Option<Vec<u8>>,
    pub network: Option<Vec<u8>>,
    pub transport: Option<Vec<u8>>,
}

/// One partial trace as emitted by the kernel for a single rule evaluation
/// of a traced packet (spec §3.1). All fields besides `trace_id` and `kind`
/// are optional, mirroring the kernel's attribute presence bitmask.
#[derive(Clone, Debug)]
pub struct PartialTrace {
    pub trace_id: u32,
    pub kind: TraceType,
    pub family: Option<Family>,
    pub table: Option<String>,
    pub chain: Option<String>,
    pub rule_handle: Option<u64>,
    pub jump_target: Option<String>,
    pub verdict: Option<i32>,
    pub policy: Option<i32>,
    pub headers: PacketHeaders,
    pub iif: Option<u32>,
    pub oif: Option<u32>,
    pub iif_type: Option<u16>,
    pub oif_type: Option<u16>,
    pub mark: Option<u32>,
    pub observed_at: SystemTime,
}

/// Parsed five-tuple, derived from `PacketHeaders::network`/`transport` by
/// the collector when those layers are present.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FiveTuple {
    pub saddr: String,
    pub daddr: String,
    pub sport: u16,
    pub dport: u16,
    pub proto: String,
    pub smac: String,
    pub dmac: String,
    pub length: u32,
}

/// One decision in the reconstructed verdict chain (§4.4).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    pub kind: TraceType,
    pub verdict: i32,
    pub table: Option<String>,
    pub chain: Option<String>,
}

/// Render the decision chain as `rule::goto->return::continue->policy::accept`,
/// suppressing the trailing `->` once a terminal verdict is reached.
pub fn render_verdict_chain(chain: &[Decision]) -> String {
    let mut parts = Vec::with_capacity(chain.len());
    for d in chain {
        let kind = match d.kind {
            TraceType::Rule => "rule",
            TraceType::Return => "return",
            TraceType::Policy => "policy",
        };
        parts.push(format!("{kind}::{}", verdict::name(d.verdict)));
        if verdict::is_terminal(d.verdict) {
            break;
        }
    }
    parts.join("->")
}

/// Canonical merged trace row, emitted by the agent and ingested by the hub
/// (spec §3.2).
#[derive(Clone, Debug, Default)]
pub struct MergedTrace {
    pub trace_id: u32,
    pub family: String,
    pub table: String,
    pub chain: String,
    pub jump_target: String,
    pub rule_handle: u64,
    pub rule_text: String,
    pub verdict: String,
    pub iifname: String,
    pub oifname: String,
    pub smac: String,
    pub dmac: String,
    pub saddr: String,
    pub daddr: String,
    pub sport: u16,
    pub dport: u16,
    pub ip_proto: String,
    pub length: u32,
    pub s_sg_name: String,
    pub d_sg_name: String,
    pub s_sg_net: String,
    pub d_sg_net: String,
    pub agent_id: String,
}

// --- Firewall table snapshot model (spec §3.3) -----------------------------

/// A single statement inside a rule's expression tree. Kept lightweight —
/// enough to reconstruct a textual rule and to support structural diffing —
/// rather than a full nftables AST.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Stmt {
    Match { left: String, op: String, right: String },
    Counter,
    Verdict(String),
    Jump(String),
    Goto(String),
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stmt::Match { left, op, right } => write!(f, "{left} {op} {right}"),
            Stmt::Counter => write!(f, "counter"),
            Stmt::Verdict(v) => write!(f, "{v}"),
            Stmt::Jump(target) => write!(f, "jump {target}"),
            Stmt::Goto(target) => write!(f, "goto {target}"),
        }
    }
}

/// A rule within a chain, addressed by its stable kernel-assigned handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    pub handle: u64,
    pub expr: Vec<Stmt>,
}

impl Rule {
    pub fn text(&self) -> String {
        self.expr.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(" ")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainPolicy {
    Accept,
    Drop,
}

impl fmt::Display for ChainPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChainPolicy::Accept => "accept",
            ChainPolicy::Drop => "drop",
        })
    }
}

/// A base chain's hook attachment, `None` for a regular (non-base) chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainHook {
    pub hook: String,
    pub priority: i32,
    pub chain_type: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chain {
    pub name: String,
    pub hook: Option<ChainHook>,
    pub policy: Option<ChainPolicy>,
    pub rules: Vec<Rule>,
}

impl Chain {
    fn upsert_rule(&mut self, rule: Rule) {
        if let Some(existing) = self.rules.iter_mut().find(|r| r.handle == rule.handle) {
            *existing = rule;
        } else {
            self.rules.push(rule);
        }
    }

    fn remove_rule(&mut self, handle: u64) {
        self.rules.retain(|r| r.handle != handle);
    }
}

/// A typed set element. Identity is the typed rendering, not raw bytes
/// (spec §3.5 invariant), so `key()` is the comparison basis everywhere.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetElement {
    pub value: String,
    pub interval_end: bool,
}

impl SetElement {
    pub fn key(&self) -> &str {
        &self.value
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetFlags {
    pub interval: bool,
    pub constant: bool,
    pub timeout: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Set {
    pub name: String,
    pub key_type: String,
    pub flags: SetFlags,
    pub elements: Vec<SetElement>,
}

impl Set {
    fn upsert_element(&mut self, elem: SetElement) {
        if let Some(existing) = self.elements.iter_mut().find(|e| e.key() == elem.key()) {
            *existing = elem;
        } else {
            self.elements.push(elem);
        }
    }

    fn remove_element(&mut self, key: &str) {
        self.elements.retain(|e| e.key() != key);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Table {
    pub name: String,
    pub family: Family,
    pub chains: Vec<Chain>,
    pub sets: Vec<Set>,
    pub updated_at: SystemTime,
    pub used_at: SystemTime,
}

impl Table {
    pub fn new(name: impl Into<String>, family: Family, now: SystemTime) -> Self {
        Table {
            name: name.into(),
            family,
            chains: Vec::new(),
            sets: Vec::new(),
            updated_at: now,
            used_at: SystemTime::UNIX_EPOCH,
        }
    }

    pub fn upsert_chain(&mut self, chain: Chain, now: SystemTime) {
        if let Some(existing) = self.chains.iter_mut().find(|c| c.name == chain.name) {
            *existing = chain;
        } else {
            self.chains.push(chain);
        }
        self.updated_at = now;
    }

    pub fn remove_chain(&mut self, name: &str, now: SystemTime) {
        self.chains.retain(|c| c.name != name);
        self.updated_at = now;
    }

    pub fn chain_mut(&mut self, name: &str) -> Option<&mut Chain> {
        self.chains.iter_mut().find(|c| c.name == name)
    }

    pub fn upsert_rule(&mut self, chain: &str, rule: Rule, now: SystemTime) {
        if let Some(c) = self.chain_mut(chain) {
            c.upsert_rule(rule);
            self.updated_at = now;
        }
    }

    pub fn remove_rule(&mut self, chain: &str, handle: u64, now: SystemTime) {
        if let Some(c) = self.chain_mut(chain) {
            c.remove_rule(handle);
            self.updated_at = now;
        }
    }

    pub fn upsert_set(&mut self, set: Set, now: SystemTime) {
        if let Some(existing) = self.sets.iter_mut().find(|s| s.name == set.name) {
            *existing = set;
        } else {
            self.sets.push(set);
        }
        self.updated_at = now;
    }

    pub fn remove_set(&mut self, name: &str, now: SystemTime) {
        self.sets.retain(|s| s.name != name);
        self.updated_at = now;
    }

    pub fn set_mut(&mut self, name: &str) -> Option<&mut Set> {
        self.sets.iter_mut().find(|s| s.name == name)
    }

    pub fn upsert_set_element(&mut self, set: &str, elem: SetElement, now: SystemTime) {
        if let Some(s) = self.set_mut(set) {
            s.upsert_element(elem);
            self.updated_at = now;
        }
    }

    pub fn remove_set_element(&mut self, set: &str, key: &str, now: SystemTime) {
        if let Some(s) = self.set_mut(set) {
            s.remove_element(key);
            self.updated_at = now;
        }
    }

    /// Whether this table is due for publication: dirty since its last
    /// publish, and quiesced for at least `sync_interval` (spec §4.3).
    pub fn due_for_publish(&self, sync_interval: std::time::Duration, now: SystemTime) -> bool {
        if self.updated_at <= self.used_at {
            return false;
        }
        now.duration_since(self.updated_at).map(|elapsed| elapsed >= sync_interval).unwrap_or(false)
    }

    /// Deterministic pretty-print used both for hub publication and operator
    /// display (spec §4.3 "canonical text form").
    pub fn canonical_text(&self) -> String {
        let mut out = format!("table {} {} {{\n", self.family, self.name);
        for set in &self.sets {
            out.push_str("\tset ");
            out.push_str(&set.name);
            out.push_str(" {\n\t\ttype ");
            out.push_str(&set.key_type);
            out.push_str(";\n");
            let mut flags = Vec::new();
            if set.flags.interval {
                flags.push("interval");
            }
            if set.flags.constant {
                flags.push("constant");
            }
            if set.flags.timeout {
                flags.push("timeout");
            }
            if !flags.is_empty() {
                out.push_str("\t\tflags ");
                out.push_str(&flags.join(","));
                out.push_str(";\n");
            }
            if !set.elements.is_empty() {
                out.push_str("\t\telements = { ");
                let rendered: Vec<String> = set
                    .elements
                    .iter()
                    .map(|e| if e.interval_end { format!("{} -", e.value) } else { e.value.clone() })
                    .collect();
                out.push_str(&rendered.join(", "));
                out.push_str(" }\n");
            }
            out.push_str("\t}\n");
        }
        for chain in &self.chains {
            out.push_str("\tchain ");
            out.push_str(&chain.name);
            out.push_str(" {\n");
            if let Some(hook) = &chain.hook {
                out.push_str(&format!(
                    "\t\ttype {} hook {} priority {}; policy {};\n",
                    hook.chain_type,
                    hook.hook,
                    hook.priority,
                    chain.policy.map(|p| p.to_string()).unwrap_or_else(|| "accept".to_string())
                ));
            }
            for rule in &chain.rules {
                out.push_str(&format!("\t\t{} #handle {}\n", rule.text(), rule.handle));
            }
            out.push_str("\t}\n");
        }
        out.push_str("}\n");
        out
    }
}

/// The in-host ordered model of all firewall tables (spec §3.3, §4.3).
#[derive(Clone, Debug, Default)]
pub struct TableModel {
    tables: Vec<Table>,
    index: HashMap<(String, Family), usize>,
}

impl TableModel {
    pub fn new() -> Self {
        TableModel::default()
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (i, t) in self.tables.iter().enumerate() {
            self.index.insert((t.name.clone(), t.family), i);
        }
    }

    pub fn upsert_table(&mut self, name: &str, family: Family, now: SystemTime) -> &mut Table {
        if let Some(&i) = self.index.get(&(name.to_string(), family)) {
            return &mut self.tables[i];
        }
        self.tables.push(Table::new(name, family, now));
        self.reindex();
        self.tables.last_mut().expect("just pushed")
    }

    pub fn remove_table(&mut self, name: &str, family: Family) {
        self.tables.retain(|t| !(t.name == name && t.family == family));
        self.reindex();
    }

    pub fn table_mut(&mut self, name: &str, family: Family) -> Option<&mut Table> {
        let &i = self.index.get(&(name.to_string(), family))?;
        self.tables.get_mut(i)
    }

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn due_for_publish(&self, sync_interval: std::time::Duration, now: SystemTime) -> Vec<usize> {
        self.tables
            .iter()
            .enumerate()
            .filter(|(_, t)| t.due_for_publish(sync_interval, now))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn mark_published(&mut self, idx: usize, now: SystemTime) {
        if let Some(t) = self.tables.get_mut(idx) {
            t.used_at = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn chain(name: &str) -> Chain {
        Chain { name: name.to_string(), hook: None, policy: None, rules: Vec::new() }
    }

    #[test]
    fn chain_ordering_survives_delete_and_reinsert() {
        let now = SystemTime::now();
        let mut model = TableModel::new();
        let t = model.upsert_table("filter", Family::Ip, now);
        t.upsert_chain(chain("a"), now);
        t.upsert_chain(chain("b"), now);
        t.remove_chain("a", now);
        t.upsert_chain(chain("c"), now);
        let names: Vec<&str> = t.chains.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn reinsert_preserves_position() {
        let now = SystemTime::now();
        let mut model = TableModel::new();
        let t = model.upsert_table("filter", Family::Ip, now);
        t.upsert_chain(chain("a"), now);
        t.upsert_chain(chain("b"), now);
        t.upsert_chain(chain("b"), now);
        let names: Vec<&str> = t.chains.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn canonical_text_is_deterministic() {
        let now = SystemTime::now();
        let mut model = TableModel::new();
        let t = model.upsert_table("filter", Family::Ip, now);
        t.upsert_chain(chain("input"), now);
        t.upsert_rule(
            "input",
            Rule { handle: 1, expr: vec![Stmt::Verdict("accept".to_string())] },
            now,
        );
        let a = t.canonical_text();
        let b = t.canonical_text();
        assert_eq!(a, b);
    }

    #[test]
    fn verdict_chain_rendering_suppresses_trailing_arrow() {
        let chain = vec![
            Decision { kind: TraceType::Rule, verdict: verdict::GOTO, table: None, chain: None },
            Decision { kind: TraceType::Return, verdict: verdict::CONTINUE, table: None, chain: None },
            Decision { kind: TraceType::Policy, verdict: verdict::ACCEPT, table: None, chain: None },
        ];
        assert_eq!(render_verdict_chain(&chain), "rule::goto->return::continue->policy::accept");
    }

    #[test]
    fn publish_quiescence_requires_elapsed_interval_since_last_change() {
        let t0 = SystemTime::UNIX_EPOCH;
        let mut table = Table::new("filter", Family::Ip, t0);
        table.used_at = t0;
        table.updated_at = t0 + Duration::from_secs(5);
        let too_soon = t0 + Duration::from_secs(6);
        assert!(!table.due_for_publish(Duration::from_secs(3), too_soon));
        let due = t0 + Duration::from_secs(8);
        assert!(table.due_for_publish(Duration::from_secs(3), due));
    }
}
