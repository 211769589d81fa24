//! Rule expression decoder (spec §4.2 "dedicated expression encoder"):
//! turns a raw `NFTA_RULE_EXPRESSIONS` attribute payload into the model's
//! [`Stmt`] sequence used for canonical rule text.

use pkt_tracer_types::model::Stmt;
use pkt_tracer_types::netlink::{be32, cstr, parse_attrs};

/// `NFTA_LIST_ELEM` and per-expression attribute numbers, per
/// `linux/netfilter/nf_tables.h`.
mod attr {
    pub const LIST_ELEM: u16 = 1;
    pub const EXPR_NAME: u16 = 1;
    pub const EXPR_DATA: u16 = 2;
    pub const DATA_VERDICT: u16 = 2;
    pub const VERDICT_CODE: u16 = 1;
    pub const VERDICT_CHAIN: u16 = 2;
}

/// NFT_GOTO/NFT_JUMP/NFT_RETURN/NFT_BREAK/NFT_CONTINUE/accept/drop, as
/// carried in an `immediate` expression's verdict data.
mod verdict_code {
    pub const DROP: i32 = 0;
    pub const ACCEPT: i32 = 1;
    pub const JUMP: i32 = -3;
    pub const GOTO: i32 = -4;
    pub const RETURN: i32 = -5;
}

/// Decodes the flattened list of expressions in chain order. Expressions
/// this decoder doesn't recognise render as a bare match placeholder
/// carrying the expression's name, so rule text stays stable even for
/// expression types not yet modelled symbolically.
pub fn decode(buf: &[u8]) -> Vec<Stmt> {
    let mut out = Vec::new();
    for (attr_type, payload) in parse_attrs(buf) {
        if attr_type != attr::LIST_ELEM {
            continue;
        }
        if let Some(stmt) = decode_one(payload) {
            out.push(stmt);
        }
    }
    out
}

fn decode_one(buf: &[u8]) -> Option<Stmt> {
    let mut name = None;
    let mut data = None;
    for (attr_type, payload) in parse_attrs(buf) {
        match attr_type {
            t if t == attr::EXPR_NAME => name = cstr(payload),
            t if t == attr::EXPR_DATA => data = Some(payload.to_vec()),
            _ => {}
        }
    }
    let name = name?;
    match name.as_str() {
        "counter" => Some(Stmt::Counter),
        "immediate" => decode_immediate(data.as_deref().unwrap_or(&[])),
        // `cmp`, `payload`, `meta`, `lookup`, ... — the general register-based
        // match machinery. Symbolic field recovery needs cross-referencing
        // the preceding `payload`/`meta` load with this comparison, which
        // this decoder doesn't attempt yet; render a stable placeholder
        // instead of silently dropping the statement.
        other => Some(Stmt::Match { left: other.to_string(), op: "match".to_string(), right: String::new() }),
    }
}

fn decode_immediate(buf: &[u8]) -> Option<Stmt> {
    for (attr_type, payload) in parse_attrs(buf) {
        if attr_type != attr::DATA_VERDICT {
            continue;
        }
        let mut code = None;
        let mut target = None;
        for (t, p) in parse_attrs(payload) {
            match t {
                t if t == attr::VERDICT_CODE => code = be32(p).map(|v| v as i32),
                t if t == attr::VERDICT_CHAIN => target = cstr(p),
                _ => {}
            }
        }
        return match code {
            Some(verdict_code::ACCEPT) => Some(Stmt::Verdict("accept".to_string())),
            Some(verdict_code::DROP) => Some(Stmt::Verdict("drop".to_string())),
            Some(verdict_code::RETURN) => Some(Stmt::Verdict("return".to_string())),
            Some(verdict_code::JUMP) => target.map(Stmt::Jump),
            Some(verdict_code::GOTO) => target.map(Stmt::Goto),
            _ => None,
        };
    }
    None
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

    fn counter_expr() -> Vec<u8> {
        let mut name = b"counter\0".to_vec();
        let mut expr = nla(attr::EXPR_NAME, &name);
        name.clear();
        nla(attr::LIST_ELEM, &{
            expr
        })
    }

    #[test]
    fn decodes_counter_expression() {
        let buf = counter_expr();
        let stmts = decode(&buf);
        assert_eq!(stmts, vec![Stmt::Counter]);
    }

    #[test]
    fn decodes_immediate_accept_verdict() {
        let code = nla(attr::VERDICT_CODE, &1i32.to_be_bytes());
        let verdict_data = nla(attr::DATA_VERDICT, &code);
        let mut expr = nla(attr::EXPR_NAME, b"immediate\0");
        expr.extend(nla(attr::EXPR_DATA, &verdict_data));
        let buf = nla(attr::LIST_ELEM, &expr);

        let stmts = decode(&buf);
        assert_eq!(stmts, vec![Stmt::Verdict("accept".to_string())]);
    }

    #[test]
    fn decodes_immediate_goto_with_target_chain() {
        let mut verdict_payload = nla(attr::VERDICT_CODE, &(-4i32).to_be_bytes());
        verdict_payload.extend(nla(attr::VERDICT_CHAIN, b"forward\0"));
        let verdict_data = nla(attr::DATA_VERDICT, &verdict_payload);
        let mut expr = nla(attr::EXPR_NAME, b"immediate\0");
        expr.extend(nla(attr::EXPR_DATA, &verdict_data));
        let buf = nla(attr::LIST_ELEM, &expr);

        let stmts = decode(&buf);
        assert_eq!(stmts, vec![Stmt::Goto("forward".to_string())]);
    }

    #[test]
    fn unrecognised_expression_renders_as_placeholder() {
        let expr = nla(attr::EXPR_NAME, b"payload\0");
        let buf = nla(attr::LIST_ELEM, &expr);
        let stmts = decode(&buf);
        assert_eq!(stmts, vec![Stmt::Match { left: "payload".to_string(), op: "match".to_string(), right: String::new() }]);
    }
}
