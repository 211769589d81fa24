//! Netlink wire constants and frame classification shared by the agent's
//! netlink reader, rule-text cache, and table watcher (spec §4.1, §6).

use thiserror::Error;

/// Decodes a netlink attribute TLV stream: 4-byte header (u16 length
/// including header, u16 type), payload padded to 4-byte alignment.
/// Attribute payloads for multi-byte integers are big-endian (spec §6).
pub fn parse_attrs(mut buf: &[u8]) -> Vec<(u16, &[u8])> {
    const NLA_HDR_LEN: usize = 4;
    const NLA_F_NESTED: u16 = 1 << 15;
    const NLA_F_NET_BYTEORDER: u16 = 1 << 14;
    let mut out = Vec::new();
    while buf.len() >= NLA_HDR_LEN {
        let len = u16::from_ne_bytes([buf[0], buf[1]]) as usize;
        let attr_type = u16::from_ne_bytes([buf[2], buf[3]]) & !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);
        if len < NLA_HDR_LEN || len > buf.len() {
            break;
        }
        let payload = &buf[NLA_HDR_LEN..len];
        out.push((attr_type, payload));
        let aligned = (len + 3) & !3;
        if aligned >= buf.len() {
            break;
        }
        buf = &buf[aligned..];
    }
    out
}

pub fn be32(payload: &[u8]) -> Option<u32> {
    payload.get(0..4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

pub fn be64(payload: &[u8]) -> Option<u64> {
    payload.get(0..8).map(|b| {
        u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
    })
}

pub fn be16(payload: &[u8]) -> Option<u16> {
    payload.get(0..2).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

pub fn cstr(payload: &[u8]) -> Option<String> {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    std::str::from_utf8(&payload[..end]).ok().map(|s| s.to_string())
}

/// Netfilter trace/table netlink multicast groups this agent subscribes to.
pub mod group {
    pub const NFTRACE: u32 = 1 << 0;
    pub const NFTABLES: u32 = 1 << 1;
}

/// `NFTA_TRACE_*` attribute type numbers (spec §6). Values follow the
/// kernel's `nf_tables_trace` netlink attribute enum ordering.
pub mod trace_attr {
    pub const TABLE: u16 = 1;
    pub const CHAIN: u16 = 2;
    pub const RULE_HANDLE: u16 = 3;
    pub const TYPE: u16 = 4;
    pub const VERDICT: u16 = 5;
    pub const ID: u16 = 7;
    pub const LL_HEADER: u16 = 8;
    pub const NETWORK_HEADER: u16 = 9;
    pub const TRANSPORT_HEADER: u16 = 10;
    pub const IIF: u16 = 11;
    pub const IIFTYPE: u16 = 12;
    pub const OIF: u16 = 13;
    pub const OIFTYPE: u16 = 14;
    pub const MARK: u16 = 15;
    pub const NFPROTO: u16 = 16;
    pub const POLICY: u16 = 17;
}

/// `NFT_TRACETYPE_*` values carried in `trace_attr::TYPE`.
pub mod trace_type_code {
    pub const RULE: u32 = 1;
    pub const POLICY: u32 = 2;
    pub const RETURN: u32 = 3;
}

/// Netlink message subtypes this agent reacts to on the `NFTABLES` group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NftEvent {
    NewTable,
    DelTable,
    NewChain,
    DelChain,
    NewRule,
    DelRule,
    NewSet,
    DelSet,
    NewSetElem,
    DelSetElem,
}

/// A decoded raw frame: either a typed nftables event, or a trace subtype
/// the reader passes straight through for the collector to parse.
#[derive(Clone, Debug)]
pub enum Frame {
    Table(NftEvent, Vec<u8>),
    Trace(Vec<u8>),
}

/// Error classification for the netlink reader's blocking read loop
/// (spec §4.1).
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ReadError {
    /// `ENOBUFS`/`ENOMEM`: kernel dropped messages. Non-fatal, reported as
    /// an observable event; the next read resumes.
    #[error("netlink receive buffer overrun")]
    BufferOverrun,
    /// Temporary errno (`EINTR`): silently retried.
    #[error("interrupted")]
    Interrupted,
    /// Timeout elapsed with no data: silently retried.
    #[error("not ready")]
    NotReady,
    /// Any other errno: fatal, propagated to consumers.
    #[error("fatal netlink error: {0}")]
    Fatal(String),
}

impl ReadError {
    /// Classify a raw `errno` value from a netlink socket read, per the
    /// table in spec §4.1.
    pub fn classify(errno: i32) -> ReadError {
        match errno {
            libc_enobufs if libc_enobufs == nix_enobufs() => ReadError::BufferOverrun,
            nix_enomem if nix_enomem == nix_enomem_val() => ReadError::BufferOverrun,
            nix_eintr if nix_eintr == nix_eintr_val() => ReadError::Interrupted,
            nix_eagain if nix_eagain == nix_eagain_val() => ReadError::NotReady,
            other => ReadError::Fatal(format!("errno {other}")),
        }
    }

    pub fn is_transient(&self) -> bool {
        !matches!(self, ReadError::Fatal(_))
    }
}

// Kept as tiny indirections rather than a `libc` dependency in this crate —
// pkt-tracer-agent (the only consumer that owns real sockets) maps its
// actual `libc::E*` constants to these at the call site via `classify`.
fn nix_enobufs() -> i32 {
    105
}
fn nix_enomem_val() -> i32 {
    12
}
fn nix_eintr_val() -> i32 {
    4
}
fn nix_eagain_val() -> i32 {
    11
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_enobufs_as_buffer_overrun() {
        assert_eq!(ReadError::classify(105), ReadError::BufferOverrun);
    }

    #[test]
    fn classifies_eagain_as_not_ready() {
        assert_eq!(ReadError::classify(11), ReadError::NotReady);
    }

    #[test]
    fn unknown_errno_is_fatal() {
        assert!(matches!(ReadError::classify(999), ReadError::Fatal(_)));
    }

    #[test]
    fn parse_attrs_decodes_two_attributes() {
        // attr 1: type=trace_attr::ID (7), u32 value 42
        let mut buf = Vec::new();
        buf.extend_from_slice(&8u16.to_ne_bytes());
        buf.extend_from_slice(&trace_attr::ID.to_ne_bytes());
        buf.extend_from_slice(&42u32.to_be_bytes());
        // attr 2: type=trace_attr::TABLE (1), string "filter\0" padded
        let name = b"filter\0\0";
        buf.extend_from_slice(&((4 + name.len()) as u16).to_ne_bytes());
        buf.extend_from_slice(&trace_attr::TABLE.to_ne_bytes());
        buf.extend_from_slice(name);

        let attrs = parse_attrs(&buf);
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].0, trace_attr::ID);
        assert_eq!(be32(attrs[0].1), Some(42));
        assert_eq!(attrs[1].0, trace_attr::TABLE);
        assert_eq!(cstr(attrs[1].1).as_deref(), Some("filter"));
    }
}
