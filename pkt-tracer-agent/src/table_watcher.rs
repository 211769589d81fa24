//! Table watcher (spec §4.3): maintains the in-host ordered firewall model
//! and periodically publishes quiesced snapshots to the hub.
//!
//! Startup enumeration and steady-state maintenance share one decoder: a
//! dump response for `NEWTABLE`/`NEWCHAIN`/... carries the same message
//! subtype as the matching multicast event (see `netlink_reader`'s
//! `kernel_source` doc comment), so `netlink_reader::classify` is reused for
//! both.

use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, Endpoint};

use pkt_tracer_proto::tracehub::ingest_client::IngestClient;
use pkt_tracer_proto::tracehub::{NftRule as WireNftRule, NftTableBatch, NftTableSnapshot};
use pkt_tracer_types::model::{Chain, ChainHook, ChainPolicy, Family, Rule, Set, SetElement, SetFlags, Stmt, Table, TableModel};
use pkt_tracer_types::netlink::{self, Frame, NftEvent};

use crate::expr_codec;
use crate::netlink_reader;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open netlink socket: {0}")]
    Socket(#[source] std::io::Error),
    #[error("failed to bind netlink socket: {0}")]
    Bind(#[source] std::io::Error),
    #[error("failed to send dump request: {0}")]
    Send(#[source] std::io::Error),
    #[error("netlink dump failed: {0}")]
    Recv(#[source] std::io::Error),
    #[error("kernel returned a netlink error for this dump request")]
    KernelError,
    #[error("tracehub transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("tracehub rpc error: {0}")]
    Rpc(#[from] tonic::Status),
}

/// `NFT_MSG_GET*` request subtypes, paired 1:1 with `netlink_reader::nft_msg`'s
/// `NEW*` response subtypes.
mod get_msg {
    pub const GETTABLE: u16 = 1;
    pub const GETCHAIN: u16 = 4;
    pub const GETRULE: u16 = 7;
    pub const GETSET: u16 = 10;
    pub const GETSETELEM: u16 = 13;
}

/// `nft_*_attributes` netlink attribute numbers (`linux/netfilter/nf_tables.h`).
mod attr {
    pub mod table {
        pub const NAME: u16 = 1;
    }
    pub mod hook {
        pub const HOOKNUM: u16 = 1;
        pub const PRIORITY: u16 = 2;
    }
    pub mod chain {
        pub const TABLE: u16 = 1;
        pub const NAME: u16 = 3;
        pub const HOOK: u16 = 4;
        pub const POLICY: u16 = 5;
        pub const TYPE: u16 = 7;
    }
    pub mod rule {
        pub const TABLE: u16 = 1;
        pub const CHAIN: u16 = 2;
        pub const HANDLE: u16 = 3;
        pub const EXPRESSIONS: u16 = 4;
    }
    pub mod set {
        pub const TABLE: u16 = 1;
        pub const NAME: u16 = 2;
        pub const FLAGS: u16 = 3;
        pub const KEY_TYPE: u16 = 4;
    }
    pub mod set_elem_list {
        pub const TABLE: u16 = 1;
        pub const SET: u16 = 2;
        pub const ELEMENTS: u16 = 3;
    }
    pub mod set_elem {
        pub const KEY: u16 = 1;
        pub const FLAGS: u16 = 3;
    }
}

/// `NFT_SET_*` flag bits (enum `nft_set_flags`).
mod set_flag {
    pub const CONSTANT: u32 = 0x2;
    pub const INTERVAL: u32 = 0x4;
    pub const TIMEOUT: u32 = 0x10;
}

/// `NFT_SET_ELEM_INTERVAL_END` (enum `nft_set_elem_flags`).
const SET_ELEM_INTERVAL_END: u32 = 0x1;

fn hook_name(num: u32) -> &'static str {
    match num {
        0 => "prerouting",
        1 => "input",
        2 => "forward",
        3 => "output",
        4 => "postrouting",
        _ => "unknown",
    }
}

fn family_byte(f: Family) -> u8 {
    match f {
        Family::Ip => 2,
        Family::Ip6 => 10,
        Family::Inet => 1,
        Family::Arp => 3,
        Family::Bridge => 7,
        Family::Netdev => 5,
    }
}

fn family_from_byte(b: u8) -> Option<Family> {
    match b {
        2 => Some(Family::Ip),
        10 => Some(Family::Ip6),
        1 => Some(Family::Inet),
        3 => Some(Family::Arp),
        7 => Some(Family::Bridge),
        5 => Some(Family::Netdev),
        _ => None,
    }
}

fn split_family(payload: &[u8]) -> Option<(Family, &[u8])> {
    let (&byte, rest) = payload.split_first()?;
    Some((family_from_byte(byte)?, rest))
}

/// A decoded `NEWRULE`, usable both to update the table model and to feed
/// the rule-text cache's `NEWRULE`/`DELRULE` subscription (spec §4.2).
pub struct DecodedRule {
    pub table: String,
    pub family: Family,
    pub chain: String,
    pub handle: u64,
    pub expr: Vec<Stmt>,
}

/// Decodes a `NEWRULE`/`DELRULE` frame payload (family byte + attrs) into
/// its `(table, family, chain, handle)` key plus, for `NEWRULE`, its
/// expression tree.
pub fn decode_rule_frame(payload: &[u8]) -> Option<DecodedRule> {
    let (family, attrs) = split_family(payload)?;
    let mut table = None;
    let mut chain = None;
    let mut handle = None;
    let mut expr = Vec::new();
    for (t, p) in netlink::parse_attrs(attrs) {
        match t {
            x if x == attr::rule::TABLE => table = netlink::cstr(p),
            x if x == attr::rule::CHAIN => chain = netlink::cstr(p),
            x if x == attr::rule::HANDLE => handle = netlink::be64(p),
            x if x == attr::rule::EXPRESSIONS => expr = expr_codec::decode(p),
            _ => {}
        }
    }
    Some(DecodedRule { table: table?, family, chain: chain?, handle: handle?, expr })
}

fn decode_chain(payload: &[u8]) -> Option<(String, Family, Chain)> {
    let (family, attrs) = split_family(payload)?;
    let mut table = None;
    let mut name = None;
    let mut hook = None;
    let mut policy = None;
    for (t, p) in netlink::parse_attrs(attrs) {
        match t {
            x if x == attr::chain::TABLE => table = netlink::cstr(p),
            x if x == attr::chain::NAME => name = netlink::cstr(p),
            x if x == attr::chain::POLICY => {
                policy = netlink::be32(p).map(|v| if v == 0 { ChainPolicy::Accept } else { ChainPolicy::Drop })
            }
            x if x == attr::chain::HOOK => {
                let mut hooknum = None;
                let mut priority = 0i32;
                for (ht, hp) in netlink::parse_attrs(p) {
                    match ht {
                        x if x == attr::hook::HOOKNUM => hooknum = netlink::be32(hp),
                        x if x == attr::hook::PRIORITY => priority = netlink::be32(hp).unwrap_or(0) as i32,
                        _ => {}
                    }
                }
                let chain_type = String::new();
                hook = hooknum.map(|n| ChainHook { hook: hook_name(n).to_string(), priority, chain_type });
            }
            x if x == attr::chain::TYPE => {
                if let (Some(h), Some(ty)) = (hook.as_mut(), netlink::cstr(p)) {
                    h.chain_type = ty;
                }
            }
            _ => {}
        }
    }
    Some((table?, family, Chain { name: name?, hook, policy, rules: Vec::new() }))
}

/// `NFTA_LIST_ELEM` wraps each element in an `NFTA_SET_ELEM_LIST_ELEMENTS`
/// nest, same convention as the rule expression list in `expr_codec`.
const LIST_ELEM: u16 = 1;

fn decode_set_elements(buf: &[u8]) -> Vec<SetElement> {
    let mut out = Vec::new();
    for (t, p) in netlink::parse_attrs(buf) {
        if t == LIST_ELEM {
            let mut key = None;
            let mut flags = 0u32;
            for (et, ep) in netlink::parse_attrs(p) {
                match et {
                    x if x == attr::set_elem::KEY => key = decode_data_value(ep),
                    x if x == attr::set_elem::FLAGS => flags = netlink::be32(ep).unwrap_or(0),
                    _ => {}
                }
            }
            if let Some(value) = key {
                out.push(SetElement { value, interval_end: flags & SET_ELEM_INTERVAL_END != 0 });
            }
        }
    }
    out
}

/// `NFTA_DATA_VALUE`-nested element key, rendered as text by length: an IPv4
/// address for a 4-byte key, an IPv6 address for 16 bytes, otherwise a hex
/// dump (spec §3.5 "identity computed from the typed key rendering").
fn decode_data_value(nested: &[u8]) -> Option<String> {
    for (t, p) in netlink::parse_attrs(nested) {
        if t != 1 {
            continue;
        }
        return Some(match p.len() {
            4 => std::net::Ipv4Addr::new(p[0], p[1], p[2], p[3]).to_string(),
            16 => {
                let mut seg = [0u16; 8];
                for (i, s) in seg.iter_mut().enumerate() {
                    *s = u16::from_be_bytes([p[i * 2], p[i * 2 + 1]]);
                }
                std::net::Ipv6Addr::from(seg).to_string()
            }
            _ => p.iter().map(|b| format!("{b:02x}")).collect(),
        });
    }
    None
}

/// Owns the in-host firewall table model and applies netlink transitions to
/// it (spec §4.3's event table).
pub struct TableWatcher {
    model: Mutex<TableModel>,
}

impl TableWatcher {
    pub fn new() -> Self {
        TableWatcher { model: Mutex::new(TableModel::new()) }
    }

    pub fn with_model(model: TableModel) -> Self {
        TableWatcher { model: Mutex::new(model) }
    }

    /// Applies one netlink event (multicast or dump-response) to the model.
    pub fn apply(&self, event: NftEvent, payload: &[u8], now: SystemTime) {
        let mut model = self.model.lock().expect("lock poisoned");
        match event {
            NftEvent::NewTable => {
                if let Some((family, attrs)) = split_family(payload) {
                    if let Some(name) =
                        netlink::parse_attrs(attrs).into_iter().find(|(t, _)| *t == attr::table::NAME).and_then(|(_, p)| netlink::cstr(p))
                    {
                        model.upsert_table(&name, family, now);
                    }
                }
            }
            NftEvent::DelTable => {
                if let Some((family, attrs)) = split_family(payload) {
                    if let Some(name) =
                        netlink::parse_attrs(attrs).into_iter().find(|(t, _)| *t == attr::table::NAME).and_then(|(_, p)| netlink::cstr(p))
                    {
                        model.remove_table(&name, family);
                    }
                }
            }
            NftEvent::NewChain => {
                if let Some((table, family, chain)) = decode_chain(payload) {
                    model.upsert_table(&table, family, now).upsert_chain(chain, now);
                }
            }
            NftEvent::DelChain => {
                if let Some((table, family, chain)) = decode_chain(payload) {
                    if let Some(t) = model.table_mut(&table, family) {
                        t.remove_chain(&chain.name, now);
                    }
                }
            }
            NftEvent::NewRule => {
                if let Some(r) = decode_rule_frame(payload) {
                    model.upsert_table(&r.table, r.family, now).upsert_rule(&r.chain, Rule { handle: r.handle, expr: r.expr }, now);
                }
            }
            NftEvent::DelRule => {
                if let Some(r) = decode_rule_frame(payload) {
                    if let Some(t) = model.table_mut(&r.table, r.family) {
                        t.remove_rule(&r.chain, r.handle, now);
                    }
                }
            }
            NftEvent::NewSet | NftEvent::DelSet => {
                if let Some((family, attrs)) = split_family(payload) {
                    let mut table = None;
                    let mut name = None;
                    let mut flags_raw = 0u32;
                    let mut key_type = String::new();
                    for (t, p) in netlink::parse_attrs(attrs) {
                        match t {
                            x if x == attr::set::TABLE => table = netlink::cstr(p),
                            x if x == attr::set::NAME => name = netlink::cstr(p),
                            x if x == attr::set::FLAGS => flags_raw = netlink::be32(p).unwrap_or(0),
                            x if x == attr::set::KEY_TYPE => key_type = netlink::be32(p).map(|v| v.to_string()).unwrap_or_default(),
                            _ => {}
                        }
                    }
                    if let (Some(table), Some(name)) = (table, name) {
                        if event == NftEvent::NewSet {
                            let flags = SetFlags {
                                interval: flags_raw & set_flag::INTERVAL != 0,
                                constant: flags_raw & set_flag::CONSTANT != 0,
                                timeout: flags_raw & set_flag::TIMEOUT != 0,
                            };
                            model.upsert_table(&table, family, now).upsert_set(
                                Set { name, key_type, flags, elements: Vec::new() },
                                now,
                            );
                        } else if let Some(t) = model.table_mut(&table, family) {
                            t.remove_set(&name, now);
                        }
                    }
                }
            }
            NftEvent::NewSetElem | NftEvent::DelSetElem => {
                if let Some((family, attrs)) = split_family(payload) {
                    let mut table = None;
                    let mut set = None;
                    let mut elements = Vec::new();
                    for (t, p) in netlink::parse_attrs(attrs) {
                        match t {
                            x if x == attr::set_elem_list::TABLE => table = netlink::cstr(p),
                            x if x == attr::set_elem_list::SET => set = netlink::cstr(p),
                            x if x == attr::set_elem_list::ELEMENTS => elements = decode_set_elements(p),
                            _ => {}
                        }
                    }
                    if let (Some(table), Some(set_name)) = (table, set) {
                        if let Some(t) = model.table_mut(&table, family) {
                            for elem in elements {
                                if event == NftEvent::NewSetElem {
                                    t.upsert_set_element(&set_name, elem, now);
                                } else {
                                    t.remove_set_element(&set_name, elem.key(), now);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn due_for_publish(&self, sync_interval: Duration, now: SystemTime) -> Vec<Table> {
        let model = self.model.lock().expect("lock poisoned");
        model.due_for_publish(sync_interval, now).into_iter().map(|i| model.tables()[i].clone()).collect()
    }

    pub fn mark_published(&self, names: &[(String, Family)], now: SystemTime) {
        let mut model = self.model.lock().expect("lock poisoned");
        let idx: Vec<usize> = model
            .tables()
            .iter()
            .enumerate()
            .filter(|(_, t)| names.iter().any(|(n, f)| *n == t.name && *f == t.family))
            .map(|(i, _)| i)
            .collect();
        for i in idx {
            model.mark_published(i, now);
        }
    }
}

impl Default for TableWatcher {
    fn default() -> Self {
        TableWatcher::new()
    }
}

// --- Startup enumeration via a request/response netlink dump ---------------

fn open_request_socket() -> Result<libc::c_int, Error> {
    unsafe {
        let fd = libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, libc::NETLINK_NETFILTER);
        if fd < 0 {
            return Err(Error::Socket(std::io::Error::last_os_error()));
        }
        let timeout = libc::timeval { tv_sec: 2, tv_usec: 0 };
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &timeout as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        );
        let mut addr: libc::sockaddr_nl = std::mem::zeroed();
        addr.nl_family = libc::AF_NETLINK as u16;
        let rc = libc::bind(fd, &addr as *const _ as *const libc::sockaddr, std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t);
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(Error::Bind(err));
        }
        Ok(fd)
    }
}

const NLM_F_REQUEST: u16 = 0x1;
const NLM_F_DUMP: u16 = 0x100 | 0x200; // NLM_F_ROOT | NLM_F_MATCH
const NLMSG_DONE: u16 = 0x3;
const NLMSG_ERROR: u16 = 0x2;
const NFNL_SUBSYS_NFTABLES: u16 = 10;

fn build_request(cmd: u16, family: Family, seq: u32) -> Vec<u8> {
    let nfgenmsg = [family_byte(family), 0, 0, 0];
    let total = 16 + nfgenmsg.len();
    let mut msg = Vec::with_capacity(total);
    msg.extend_from_slice(&(total as u32).to_ne_bytes());
    let nl_type = (NFNL_SUBSYS_NFTABLES << 8) | cmd;
    msg.extend_from_slice(&nl_type.to_ne_bytes());
    msg.extend_from_slice(&(NLM_F_REQUEST | NLM_F_DUMP).to_ne_bytes());
    msg.extend_from_slice(&seq.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes());
    msg.extend_from_slice(&nfgenmsg);
    msg
}

/// Runs one dump request/response cycle for `cmd` against `family`, applying
/// every `NEW*` response frame to `watcher` via the shared event decoder.
fn dump_one(fd: libc::c_int, cmd: u16, family: Family, seq: u32, watcher: &TableWatcher, now: SystemTime) -> Result<(), Error> {
    let req = build_request(cmd, family, seq);
    let sent = unsafe { libc::send(fd, req.as_ptr() as *const libc::c_void, req.len(), 0) };
    if sent < 0 {
        return Err(Error::Send(std::io::Error::last_os_error()));
    }

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            return Err(Error::Recv(std::io::Error::last_os_error()));
        }
        let mut done = false;
        for (nl_type, body) in netlink_reader::iter_nlmsgs(&buf[..n as usize]) {
            if nl_type == NLMSG_DONE {
                done = true;
                break;
            }
            if nl_type == NLMSG_ERROR {
                return Err(Error::KernelError);
            }
            if let Some(Frame::Table(event, payload)) = netlink_reader::classify(nl_type, body) {
                watcher.apply(event, &payload, now);
            }
        }
        if done {
            return Ok(());
        }
    }
}

const ALL_FAMILIES: [Family; 6] = [Family::Ip, Family::Ip6, Family::Inet, Family::Arp, Family::Bridge, Family::Netdev];

/// Full kernel ruleset enumeration at startup (spec §4.3 "full enumeration
/// via the kernel admin API"): for every family, dump tables, then chains,
/// rules, sets and set elements, in that dependency order so parents exist
/// before their children are appended.
pub fn enumerate_startup(watcher: &TableWatcher) -> Result<(), Error> {
    let fd = open_request_socket()?;
    let now = SystemTime::now();
    let mut seq = 1u32;
    let result = (|| {
        for cmd in [get_msg::GETTABLE, get_msg::GETCHAIN, get_msg::GETRULE, get_msg::GETSET, get_msg::GETSETELEM] {
            for family in ALL_FAMILIES {
                dump_one(fd, cmd, family, seq, watcher, now)?;
                seq += 1;
            }
        }
        Ok(())
    })();
    unsafe { libc::close(fd) };
    result
}

// --- Steady-state maintenance + publication loop ----------------------------

fn to_wire_rule(rule: &Rule, chain: &str) -> WireNftRule {
    WireNftRule { chain: chain.to_string(), rule: rule.text(), handle: rule.handle }
}

fn to_wire_snapshot(table: &Table) -> NftTableSnapshot {
    let mut rules = Vec::new();
    for chain in &table.chains {
        for rule in &chain.rules {
            rules.push(to_wire_rule(rule, &chain.name));
        }
    }
    NftTableSnapshot { table_name: table.name.clone(), table_family: table.family.to_string(), table_text: table.canonical_text(), rules }
}

async fn connect(address: &str, dial_timeout: Duration) -> Result<Channel, Error> {
    Ok(Endpoint::from_shared(address.to_string())?.connect_timeout(dial_timeout).connect().await?)
}

/// Drives the table watcher's steady state: consumes the netlink reader's
/// fan-out (filtering for `Frame::Table`), applies events to the model, and
/// publishes quiesced snapshots to the hub every `sync_interval` (spec §4.3).
/// Events keep applying to the model across a dropped publish stream — only
/// publication, not event tracking, depends on hub connectivity.
pub async fn run(
    mut consumer: mpsc::Receiver<Vec<Frame>>,
    watcher: std::sync::Arc<TableWatcher>,
    hub_address: String,
    dial_timeout: Duration,
    compression: bool,
    sync_interval: Duration,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<(), Error> {
    loop {
        let channel = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = connect(&hub_address, dial_timeout) => result?,
        };
        let mut client = IngestClient::new(channel);
        if compression {
            client = client.send_compressed(tonic::codec::CompressionEncoding::Gzip);
        }

        let (batch_tx, batch_rx) = mpsc::channel::<NftTableBatch>(4);
        let outbound = ReceiverStream::new(batch_rx);
        let call = tokio::spawn({
            let mut client = client.clone();
            async move { client.sync_nft_tables(outbound).await }
        });

        let mut tick = tokio::time::interval(sync_interval);
        let disconnected = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    drop(batch_tx);
                    let _ = call.await;
                    return Ok(());
                }
                maybe = consumer.recv() => {
                    let Some(batch) = maybe else {
                        drop(batch_tx);
                        let _ = call.await;
                        return Ok(());
                    };
                    let now = SystemTime::now();
                    for frame in batch {
                        if let Frame::Table(event, payload) = frame {
                            watcher.apply(event, &payload, now);
                        }
                    }
                }
                _ = tick.tick() => {
                    let now = SystemTime::now();
                    let due = watcher.due_for_publish(sync_interval, now);
                    if due.is_empty() {
                        continue;
                    }
                    let snapshots: Vec<NftTableSnapshot> = due.iter().map(to_wire_snapshot).collect();
                    let names: Vec<(String, Family)> = due.iter().map(|t| (t.name.clone(), t.family)).collect();
                    if batch_tx.send(NftTableBatch { tables: snapshots }).await.is_err() {
                        break true;
                    }
                    watcher.mark_published(&names, now);
                }
            }
        };
        drop(batch_tx);
        if disconnected {
            tracing::warn!("tracehub table sync stream dropped, reconnecting");
            continue;
        }
    }
}

// --- KernelRuleSource: on-miss kernel queries for the rule-text cache -------

/// Queries the live kernel ruleset for one rule's text, used by
/// [`crate::rule_cache::RuleCache`] on a cache miss and for its eager
/// startup preload (spec §4.2).
pub struct NetlinkRuleSource;

fn query_rule_blocking(table: &str, family: Family, chain: &str, handle: u64) -> Result<String, pkt_tracer_types::error::RuleLookupError> {
    use pkt_tracer_types::error::RuleLookupError;
    let fd = open_request_socket().map_err(|e| RuleLookupError::KernelQuery(e.to_string()))?;
    let result = (|| -> Result<String, Error> {
        let req = build_request(get_msg::GETRULE, family, 1);
        let sent = unsafe { libc::send(fd, req.as_ptr() as *const libc::c_void, req.len(), 0) };
        if sent < 0 {
            return Err(Error::Send(std::io::Error::last_os_error()));
        }
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
            if n < 0 {
                return Err(Error::Recv(std::io::Error::last_os_error()));
            }
            let mut done = false;
            for (nl_type, body) in netlink_reader::iter_nlmsgs(&buf[..n as usize]) {
                if nl_type == NLMSG_DONE {
                    done = true;
                    break;
                }
                if nl_type == NLMSG_ERROR {
                    return Err(Error::KernelError);
                }
                if let Some(Frame::Table(NftEvent::NewRule, payload)) = netlink_reader::classify(nl_type, body) {
                    if let Some(r) = decode_rule_frame(&payload) {
                        if r.table == table && r.chain == chain && r.handle == handle {
                            return Ok(Rule { handle: r.handle, expr: r.expr }.text());
                        }
                    }
                }
            }
            if done {
                return Err(Error::KernelError);
            }
        }
    })();
    unsafe { libc::close(fd) };
    result.map_err(|e| RuleLookupError::KernelQuery(e.to_string()))
}

#[async_trait::async_trait]
impl crate::rule_cache::KernelRuleSource for NetlinkRuleSource {
    async fn query_rule(
        &self,
        table: &str,
        family: Family,
        chain: &str,
        handle: u64,
    ) -> Result<String, pkt_tracer_types::error::RuleLookupError> {
        let table = table.to_string();
        let chain = chain.to_string();
        tokio::task::spawn_blocking(move || query_rule_blocking(&table, family, &chain, handle))
            .await
            .unwrap_or_else(|e| Err(pkt_tracer_types::error::RuleLookupError::KernelQuery(e.to_string())))
    }
}

/// Feeds the rule-text cache from the same netlink fan-out the table
/// watcher consumes: every `NEWRULE`/`DELRULE` frame refreshes or marks the
/// corresponding cache entry (spec §4.2).
pub async fn run_rule_cache_feed(
    mut consumer: mpsc::Receiver<Vec<Frame>>,
    cache: std::sync::Arc<crate::rule_cache::RuleCache<NetlinkRuleSource>>,
    cancel: tokio_util::sync::CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            maybe = consumer.recv() => {
                let Some(batch) = maybe else { return };
                let now = SystemTime::now();
                for frame in batch {
                    match frame {
                        Frame::Table(NftEvent::NewRule, payload) => {
                            if let Some(r) = decode_rule_frame(&payload) {
                                let text = Rule { handle: r.handle, expr: r.expr }.text();
                                cache.on_new_rule(&r.table, r.family, &r.chain, r.handle, text, now);
                            }
                        }
                        Frame::Table(NftEvent::DelRule, payload) => {
                            if let Some(r) = decode_rule_frame(&payload) {
                                cache.on_del_rule(&r.table, r.family, &r.chain, r.handle);
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

/// Startup preload entries for [`crate::rule_cache::RuleCache::preload`],
/// harvested from the same enumeration pass as [`enumerate_startup`].
pub fn enumerate_rule_cache_preload() -> Result<Vec<(String, Family, String, u64, String)>, Error> {
    let fd = open_request_socket()?;
    let mut out = Vec::new();
    let mut seq = 1u32;
    let result = (|| {
        for family in ALL_FAMILIES {
            let req = build_request(get_msg::GETRULE, family, seq);
            seq += 1;
            let sent = unsafe { libc::send(fd, req.as_ptr() as *const libc::c_void, req.len(), 0) };
            if sent < 0 {
                return Err(Error::Send(std::io::Error::last_os_error()));
            }
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
                if n < 0 {
                    return Err(Error::Recv(std::io::Error::last_os_error()));
                }
                let mut done = false;
                for (nl_type, body) in netlink_reader::iter_nlmsgs(&buf[..n as usize]) {
                    if nl_type == NLMSG_DONE {
                        done = true;
                        break;
                    }
                    if nl_type == NLMSG_ERROR {
                        return Err(Error::KernelError);
                    }
                    if let Some(Frame::Table(NftEvent::NewRule, payload)) = netlink_reader::classify(nl_type, body) {
                        if let Some(r) = decode_rule_frame(&payload) {
                            let text = Rule { handle: r.handle, expr: r.expr }.text();
                            out.push((r.table, r.family, r.chain, r.handle, text));
                        }
                    }
                }
                if done {
                    break;
                }
            }
        }
        Ok(())
    })();
    unsafe { libc::close(fd) };
    result.map(|_| out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nla(typ: u16, payload: &[u8]) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&((4 + payload.len()) as u16).to_ne_bytes());
        v.extend_from_slice(&typ.to_ne_bytes());
        v.extend_from_slice(payload);
        while v.len() % 4 != 0 {
            v.push(0);
        }
        v
    }

    fn cstr_attr(typ: u16, s: &str) -> Vec<u8> {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        nla(typ, &bytes)
    }

    #[test]
    fn applies_new_table_then_new_chain_in_order() {
        let watcher = TableWatcher::new();
        let now = SystemTime::now();

        let mut table_payload = vec![family_byte(Family::Ip)];
        table_payload.extend(cstr_attr(attr::table::NAME, "filter"));
        watcher.apply(NftEvent::NewTable, &table_payload, now);

        let mut chain_payload = vec![family_byte(Family::Ip)];
        chain_payload.extend(cstr_attr(attr::chain::TABLE, "filter"));
        chain_payload.extend(cstr_attr(attr::chain::NAME, "input"));
        watcher.apply(NftEvent::NewChain, &chain_payload, now);

        let model = watcher.model.lock().unwrap();
        assert_eq!(model.tables().len(), 1);
        assert_eq!(model.tables()[0].chains.len(), 1);
        assert_eq!(model.tables()[0].chains[0].name, "input");
    }

    #[test]
    fn decodes_rule_frame_key_and_expression() {
        let mut payload = vec![family_byte(Family::Ip)];
        payload.extend(cstr_attr(attr::rule::TABLE, "filter"));
        payload.extend(cstr_attr(attr::rule::CHAIN, "input"));
        let mut handle_attr = Vec::new();
        handle_attr.extend_from_slice(&12u16.to_ne_bytes());
        handle_attr.extend_from_slice(&attr::rule::HANDLE.to_ne_bytes());
        handle_attr.extend_from_slice(&7u64.to_be_bytes());
        payload.extend(handle_attr);

        let decoded = decode_rule_frame(&payload).unwrap();
        assert_eq!(decoded.table, "filter");
        assert_eq!(decoded.chain, "input");
        assert_eq!(decoded.handle, 7);
        assert_eq!(decoded.family, Family::Ip);
    }
}
