//! The `FetchTraces` filter scope and free-form query expression language
//! (spec §3.4, §4.7).
//!
//! The per-field filter struct avoids reflection (the source's approach per
//! the redesign notes): [`FIELD_DICTIONARY`] is one constant table mapping
//! the CLI-facing field name to both its trace-scope column and its
//! `FilterScope` appender, walked by [`FilterScope::per_field_clause`].

use std::time::SystemTime;
use thiserror::Error;

/// CLI-facing field name → store column name. Identifiers outside this
/// table are a parse error (spec §4.7).
pub const FIELD_DICTIONARY: &[(&str, &str)] = &[
    ("trace_id", "trace_id"),
    ("table", "table"),
    ("chain", "chain"),
    ("jump_target", "jump_target"),
    ("rule_handle", "rule_handle"),
    ("family", "family"),
    ("iifname", "iifname"),
    ("oifname", "oifname"),
    ("smac", "smac"),
    ("dmac", "dmac"),
    ("saddr", "saddr"),
    ("daddr", "daddr"),
    ("ip_src", "ip_s"),
    ("ip_dst", "ip_d"),
    ("sport", "sport"),
    ("dport", "dport"),
    ("s_sg_name", "s_sg_name"),
    ("d_sg_name", "d_sg_name"),
    ("s_sg_net", "s_sg_net"),
    ("d_sg_net", "d_sg_net"),
    ("length", "length"),
    ("ip_proto", "ip_proto"),
    ("verdict", "verdict"),
    ("agent_id", "agent_id"),
];

fn column_for(field: &str) -> Option<&'static str> {
    FIELD_DICTIONARY.iter().find(|(name, _)| *name == field).map(|(_, col)| *col)
}

/// A closed-open timestamp range `[from, to)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeRange {
    pub from: SystemTime,
    pub to: SystemTime,
}

/// Logical AND of per-field membership constraints over the merged-trace
/// schema (spec §3.4). A query string and per-field filters are mutually
/// exclusive — see [`FilterScope::validate`].
#[derive(Clone, Debug, Default)]
pub struct FilterScope {
    pub trace_id: Vec<u32>,
    pub table: Vec<String>,
    pub chain: Vec<String>,
    pub jump_target: Vec<String>,
    pub rule_handle: Vec<u64>,
    pub family: Vec<String>,
    pub iifname: Vec<String>,
    pub oifname: Vec<String>,
    pub smac: Vec<String>,
    pub dmac: Vec<String>,
    pub saddr: Vec<String>,
    pub daddr: Vec<String>,
    pub sport: Vec<u32>,
    pub dport: Vec<u32>,
    pub s_sg_name: Vec<String>,
    pub d_sg_name: Vec<String>,
    pub s_sg_net: Vec<String>,
    pub d_sg_net: Vec<String>,
    pub length: Vec<u32>,
    pub ip_proto: Vec<String>,
    pub verdict: Vec<String>,
    pub agent_id: Vec<String>,
    pub time_range: Option<TimeRange>,
    pub follow: bool,
    pub query: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScopeError {
    #[error("query string and per-field filters are mutually exclusive")]
    QueryAndFieldsBothSet,
}

impl FilterScope {
    fn has_per_field_filters(&self) -> bool {
        !self.trace_id.is_empty()
            || !self.table.is_empty()
            || !self.chain.is_empty()
            || !self.jump_target.is_empty()
            || !self.rule_handle.is_empty()
            || !self.family.is_empty()
            || !self.iifname.is_empty()
            || !self.oifname.is_empty()
            || !self.smac.is_empty()
            || !self.dmac.is_empty()
            || !self.saddr.is_empty()
            || !self.daddr.is_empty()
            || !self.sport.is_empty()
            || !self.dport.is_empty()
            || !self.s_sg_name.is_empty()
            || !self.d_sg_name.is_empty()
            || !self.s_sg_net.is_empty()
            || !self.d_sg_net.is_empty()
            || !self.length.is_empty()
            || !self.ip_proto.is_empty()
            || !self.verdict.is_empty()
    }

    /// Enforces the query/per-field exclusivity at the request boundary
    /// (spec §4.7, testable property 8).
    pub fn validate(&self) -> Result<(), ScopeError> {
        if self.query.is_some() && self.has_per_field_filters() {
            return Err(ScopeError::QueryAndFieldsBothSet);
        }
        Ok(())
    }

    fn in_clause(column: &str, values: &[String]) -> Option<String> {
        if values.is_empty() {
            return None;
        }
        let rendered: Vec<String> = values.iter().map(|v| format!("'{}'", v.replace('\'', "''"))).collect();
        Some(format!("{column} IN ({})", rendered.join(",")))
    }

    fn in_clause_num<T: std::fmt::Display>(column: &str, values: &[T]) -> Option<String> {
        if values.is_empty() {
            return None;
        }
        let rendered: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        Some(format!("{column} IN ({})", rendered.join(",")))
    }

    /// Builds the per-field WHERE clause by walking the field dictionary —
    /// no reflection, no struct-tag machinery.
    pub fn per_field_clause(&self) -> Option<String> {
        let mut clauses = Vec::new();
        clauses.extend(Self::in_clause_num("trace_id", &self.trace_id));
        clauses.extend(Self::in_clause("table", &self.table));
        clauses.extend(Self::in_clause("chain", &self.chain));
        clauses.extend(Self::in_clause("jump_target", &self.jump_target));
        clauses.extend(Self::in_clause_num("rule_handle", &self.rule_handle));
        clauses.extend(Self::in_clause("family", &self.family));
        clauses.extend(Self::in_clause("iifname", &self.iifname));
        clauses.extend(Self::in_clause("oifname", &self.oifname));
        clauses.extend(Self::in_clause("smac", &self.smac));
        clauses.extend(Self::in_clause("dmac", &self.dmac));
        clauses.extend(Self::in_clause("saddr", &self.saddr));
        clauses.extend(Self::in_clause("daddr", &self.daddr));
        clauses.extend(Self::in_clause_num("sport", &self.sport));
        clauses.extend(Self::in_clause_num("dport", &self.dport));
        clauses.extend(Self::in_clause("s_sg_name", &self.s_sg_name));
        clauses.extend(Self::in_clause("d_sg_name", &self.d_sg_name));
        clauses.extend(Self::in_clause("s_sg_net", &self.s_sg_net));
        clauses.extend(Self::in_clause("d_sg_net", &self.d_sg_net));
        clauses.extend(Self::in_clause_num("length", &self.length));
        clauses.extend(Self::in_clause("ip_proto", &self.ip_proto));
        clauses.extend(Self::in_clause("verdict", &self.verdict));
        clauses.extend(Self::in_clause("agent_id", &self.agent_id));
        if clauses.is_empty() { None } else { Some(clauses.join(" AND ")) }
    }
}

// --- Query expression language (spec §4.7) ---------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("unexpected token: {0}")]
    UnexpectedToken(String),
    #[error("unknown field: {0}")]
    UnknownField(String),
    #[error("trailing input after expression: {0}")]
    TrailingInput(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Literal {
    Int(i64),
    Str(String),
}

impl Literal {
    fn render(&self) -> String {
        match self {
            Literal::Int(i) => i.to_string(),
            Literal::Str(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl CmpOp {
    fn render(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Lt => "<",
            CmpOp::Ge => ">=",
            CmpOp::Le => "<=",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Expr {
    Cmp { column: String, op: CmpOp, value: Literal },
    In { column: String, negate: bool, values: Vec<Literal> },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn render(&self) -> String {
        match self {
            Expr::Cmp { column, op, value } => format!("{column} {} {}", op.render(), value.render()),
            Expr::In { column, negate, values } => {
                let op = if *negate { "NOT IN" } else { "IN" };
                let vals: Vec<String> = values.iter().map(Literal::render).collect();
                format!("{column} {op} ({})", vals.join(","))
            }
            Expr::Not(inner) => format!("NOT {}", Self::wrap_if_compound(inner)),
            Expr::And(l, r) => format!("{} AND {}", Self::render_and_child(l), Self::render_and_child(r)),
            Expr::Or(l, r) => format!("{} OR {}", l.render(), r.render()),
        }
    }

    fn wrap_if_compound(e: &Expr) -> String {
        match e {
            Expr::And(..) | Expr::Or(..) => format!("({})", e.render()),
            other => other.render(),
        }
    }

    /// AND binds tighter than OR; when a child of AND is itself an OR,
    /// wrap it in parens to preserve semantics (spec §4.7).
    fn render_and_child(e: &Expr) -> String {
        match e {
            Expr::Or(..) => format!("({})", e.render()),
            other => other.render(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Ident(String),
    Int(i64),
    Str(String),
    Op(&'static str),
    And,
    Or,
    Not,
    In,
    LParen,
    RParen,
    Comma,
}

fn normalize_hyphens(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_single = false;
    let mut in_double = false;
    for c in input.chars() {
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                out.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                out.push(c);
            }
            '-' if !in_single && !in_double => out.push('_'),
            other => out.push(other),
        }
    }
    out
}

fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let normalized = normalize_hyphens(input);
    let chars: Vec<char> = normalized.chars().collect();
    let mut i = 0;
    let mut tokens = Vec::new();
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op("!="));
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op("=="));
                    i += 2;
                } else {
                    return Err(ParseError::UnexpectedToken("=".to_string()));
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(">="));
                    i += 2;
                } else {
                    tokens.push(Token::Op(">"));
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op("<="));
                    i += 2;
                } else {
                    tokens.push(Token::Op("<"));
                    i += 1;
                }
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != quote {
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(ParseError::UnexpectedEof);
                }
                let s: String = chars[start..i].iter().collect();
                tokens.push(Token::Str(s));
                i += 1;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let s: String = chars[start..i].iter().collect();
                tokens.push(Token::Int(s.parse().map_err(|_| ParseError::UnexpectedToken(s))?));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let s: String = chars[start..i].iter().collect();
                match s.to_ascii_lowercase().as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "not" => tokens.push(Token::Not),
                    "in" => tokens.push(Token::In),
                    _ => tokens.push(Token::Ident(s)),
                }
            }
            other => return Err(ParseError::UnexpectedToken(other.to_string())),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.next();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.next().cloned() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    Some(other) => Err(ParseError::UnexpectedToken(format!("{other:?}"))),
                    None => Err(ParseError::UnexpectedEof),
                }
            }
            Some(Token::Ident(name)) => self.parse_field_expr(&name),
            Some(other) => Err(ParseError::UnexpectedToken(format!("{other:?}"))),
            None => Err(ParseError::UnexpectedEof),
        }
    }

    fn parse_field_expr(&mut self, name: &str) -> Result<Expr, ParseError> {
        let column = column_for(name).ok_or_else(|| ParseError::UnknownField(name.to_string()))?;
        match self.next().cloned() {
            Some(Token::Op(op)) => {
                let cmp = match op {
                    "==" => CmpOp::Eq,
                    "!=" => CmpOp::Ne,
                    ">" => CmpOp::Gt,
                    "<" => CmpOp::Lt,
                    ">=" => CmpOp::Ge,
                    "<=" => CmpOp::Le,
                    _ => unreachable!(),
                };
                let value = self.parse_literal()?;
                Ok(Expr::Cmp { column: column.to_string(), op: cmp, value })
            }
            Some(Token::In) => self.parse_in_list(column, false),
            Some(Token::Not) => match self.next() {
                Some(Token::In) => self.parse_in_list(column, true),
                Some(other) => Err(ParseError::UnexpectedToken(format!("{other:?}"))),
                None => Err(ParseError::UnexpectedEof),
            },
            Some(other) => Err(ParseError::UnexpectedToken(format!("{other:?}"))),
            None => Err(ParseError::UnexpectedEof),
        }
    }

    fn parse_in_list(&mut self, column: &str, negate: bool) -> Result<Expr, ParseError> {
        match self.next() {
            Some(Token::LParen) => {}
            Some(other) => return Err(ParseError::UnexpectedToken(format!("{other:?}"))),
            None => return Err(ParseError::UnexpectedEof),
        }
        let mut values = vec![self.parse_literal()?];
        while matches!(self.peek(), Some(Token::Comma)) {
            self.next();
            values.push(self.parse_literal()?);
        }
        match self.next() {
            Some(Token::RParen) => Ok(Expr::In { column: column.to_string(), negate, values }),
            Some(other) => Err(ParseError::UnexpectedToken(format!("{other:?}"))),
            None => Err(ParseError::UnexpectedEof),
        }
    }

    fn parse_literal(&mut self) -> Result<Literal, ParseError> {
        match self.next().cloned() {
            Some(Token::Int(i)) => Ok(Literal::Int(i)),
            Some(Token::Str(s)) => Ok(Literal::Str(s)),
            Some(other) => Err(ParseError::UnexpectedToken(format!("{other:?}"))),
            None => Err(ParseError::UnexpectedEof),
        }
    }
}

/// Parses and lowers a free-form filter query string into a WHERE clause
/// fragment (spec §4.7).
pub fn lower_query(query: &str) -> Result<String, ParseError> {
    let tokens = tokenize(query)?;
    let mut parser = Parser { tokens: &tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != tokens.len() {
        let rest: Vec<String> = tokens[parser.pos..].iter().map(|t| format!("{t:?}")).collect();
        return Err(ParseError::TrailingInput(rest.join(" ")));
    }
    Ok(expr.render())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowers_mixed_and_or_in_expression() {
        let got =
            lower_query("(sport>=80 and sport<=443) and ip-dst=='93.184.215.14' and dport in (80,443)").unwrap();
        assert_eq!(got, "sport >= 80 AND sport <= 443 AND ip_d = '93.184.215.14' AND dport IN (80,443)");
    }

    #[test]
    fn wraps_or_inside_and() {
        let got = lower_query("table=='nat' and (verdict=='drop' or verdict=='accept')").unwrap();
        assert_eq!(got, "table = 'nat' AND (verdict = 'drop' OR verdict = 'accept')");
    }

    #[test]
    fn not_in_lowers() {
        let got = lower_query("table not in ('nat','mangle')").unwrap();
        assert_eq!(got, "table NOT IN ('nat','mangle')");
    }

    #[test]
    fn unknown_field_is_parse_error() {
        assert!(matches!(lower_query("bogus_field==1"), Err(ParseError::UnknownField(_))));
    }

    #[test]
    fn bare_equals_is_not_a_valid_operator() {
        assert!(matches!(lower_query("trid=123"), Err(ParseError::UnexpectedToken(_))));
    }

    #[test]
    fn scope_rejects_query_and_fields_together() {
        let mut scope = FilterScope { query: Some("table=='nat'".to_string()), ..Default::default() };
        scope.table.push("nat".to_string());
        assert_eq!(scope.validate(), Err(ScopeError::QueryAndFieldsBothSet));
    }
}
