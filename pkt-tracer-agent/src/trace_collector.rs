//! Trace collector (spec §4.4): parses raw `NFTRACE` netlink frames into
//! structured [`PartialTrace`] records and stamps them with `observed_at`.

use std::time::SystemTime;

use pkt_tracer_types::model::{Family, PacketHeaders, PartialTrace, TraceType};
use pkt_tracer_types::netlink::{be16, be32, be64, cstr, trace_attr, trace_type_code};

/// Parses one raw `NFTRACE` attribute buffer into a [`PartialTrace`].
///
/// A partial whose `TYPE` attribute is missing, or doesn't match
/// `rule`/`return`/`policy`, is ignored by returning `None` (spec §9 open
/// question c).
pub fn parse(buf: &[u8], observed_at: SystemTime) -> Option<PartialTrace> {
    let attrs = pkt_tracer_types::netlink::parse_attrs(buf);

    let mut trace_id = None;
    let mut kind_code = None;
    let mut family = None;
    let mut table = None;
    let mut chain = None;
    let mut rule_handle = None;
    let mut jump_target = None;
    let mut verdict = None;
    let mut policy = None;
    let mut headers = PacketHeaders::default();
    let mut iif = None;
    let mut oif = None;
    let mut iif_type = None;
    let mut oif_type = None;
    let mut mark = None;

    for (attr_type, payload) in attrs {
        match attr_type {
            t if t == trace_attr::ID => trace_id = be32(payload),
            t if t == trace_attr::TYPE => kind_code = be32(payload),
            t if t == trace_attr::NFPROTO => family = be32(payload).and_then(family_from_nfproto),
            t if t == trace_attr::TABLE => table = cstr(payload),
            t if t == trace_attr::CHAIN => chain = cstr(payload),
            t if t == trace_attr::RULE_HANDLE => rule_handle = be64(payload),
            t if t == trace_attr::VERDICT => {
                // nested: first 4 bytes code, optional trailing jump chain name
                if payload.len() >= 4 {
                    verdict = be32(&payload[0..4]).map(|v| v as i32);
                    if payload.len() > 4 {
                        jump_target = cstr(&payload[4..]);
                    }
                }
            }
            t if t == trace_attr::POLICY => policy = be32(payload).map(|v| v as i32),
            t if t == trace_attr::LL_HEADER => headers.link_layer = Some(payload.to_vec()),
            t if t == trace_attr::NETWORK_HEADER => headers.network = Some(payload.to_vec()),
            t if t == trace_attr::TRANSPORT_HEADER => headers.transport = Some(payload.to_vec()),
            t if t == trace_attr::IIF => iif = be32(payload),
            t if t == trace_attr::OIF => oif = be32(payload),
            t if t == trace_attr::IIFTYPE => iif_type = be16(payload),
            t if t == trace_attr::OIFTYPE => oif_type = be16(payload),
            t if t == trace_attr::MARK => mark = be32(payload),
            _ => {}
        }
    }

    let trace_id = trace_id?;
    let kind = match kind_code {
        Some(c) if c == trace_type_code::RULE => TraceType::Rule,
        Some(c) if c == trace_type_code::RETURN => TraceType::Return,
        Some(c) if c == trace_type_code::POLICY => TraceType::Policy,
        Some(_) | None => return None,
    };

    Some(PartialTrace {
        trace_id,
        kind,
        family,
        table,
        chain,
        rule_handle,
        jump_target,
        verdict,
        policy,
        headers,
        iif,
        oif,
        iif_type,
        oif_type,
        mark,
        observed_at,
    })
}

fn family_from_nfproto(code: u32) -> Option<Family> {
    match code {
        2 => Some(Family::Ip),
        10 => Some(Family::Ip6),
        1 => Some(Family::Inet),
        3 => Some(Family::Arp),
        7 => Some(Family::Bridge),
        5 => Some(Family::Netdev),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr_u32(typ: u16, val: u32) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&8u16.to_ne_bytes());
        v.extend_from_slice(&typ.to_ne_bytes());
        v.extend_from_slice(&val.to_be_bytes());
        v
    }

    fn attr_str(typ: u16, s: &str) -> Vec<u8> {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        while bytes.len() % 4 != 0 {
            bytes.push(0);
        }
        let mut v = Vec::new();
        v.extend_from_slice(&((4 + bytes.len()) as u16).to_ne_bytes());
        v.extend_from_slice(&typ.to_ne_bytes());
        v.extend_from_slice(&bytes);
        v
    }

    #[test]
    fn parses_rule_partial_with_handle_and_verdict() {
        let mut buf = Vec::new();
        buf.extend(attr_u32(trace_attr::ID, 7));
        buf.extend(attr_u32(trace_attr::TYPE, trace_type_code::RULE));
        buf.extend(attr_str(trace_attr::TABLE, "filter"));
        buf.extend(attr_str(trace_attr::CHAIN, "input"));
        let mut handle_attr = Vec::new();
        handle_attr.extend_from_slice(&12u16.to_ne_bytes());
        handle_attr.extend_from_slice(&trace_attr::RULE_HANDLE.to_ne_bytes());
        handle_attr.extend_from_slice(&5u64.to_be_bytes());
        buf.extend(handle_attr);

        let parsed = parse(&buf, SystemTime::UNIX_EPOCH).unwrap();
        assert_eq!(parsed.trace_id, 7);
        assert_eq!(parsed.kind, TraceType::Rule);
        assert_eq!(parsed.table.as_deref(), Some("filter"));
        assert_eq!(parsed.chain.as_deref(), Some("input"));
        assert_eq!(parsed.rule_handle, Some(5));
    }

    #[test]
    fn missing_type_attribute_is_ignored() {
        let buf = attr_u32(trace_attr::ID, 1);
        assert!(parse(&buf, SystemTime::UNIX_EPOCH).is_none());
    }

    #[test]
    fn missing_trace_id_is_ignored() {
        let buf = attr_u32(trace_attr::TYPE, trace_type_code::POLICY);
        assert!(parse(&buf, SystemTime::UNIX_EPOCH).is_none());
    }

    #[test]
    fn unrecognised_type_code_is_ignored() {
        let mut buf = Vec::new();
        buf.extend(attr_u32(trace_attr::ID, 1));
        buf.extend(attr_u32(trace_attr::TYPE, 99));
        assert!(parse(&buf, SystemTime::UNIX_EPOCH).is_none());
    }
}
