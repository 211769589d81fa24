use thiserror::Error;

/// Component tag attached to a [`PipelineError`], matching the taxonomy in
/// the spec's error handling design (Collector, Merger, Sender,
/// TableWatcher, RuleTracer, Visor).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Component {
    Collector,
    Merger,
    Sender,
    TableWatcher,
    RuleTracer,
    Visor,
    Ingest,
    Query,
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Component::Collector => "Collector",
            Component::Merger => "Merger",
            Component::Sender => "Sender",
            Component::TableWatcher => "TableWatcher",
            Component::RuleTracer => "RuleTracer",
            Component::Visor => "Visor",
            Component::Ingest => "Ingest",
            Component::Query => "Query",
        };
        f.write_str(name)
    }
}

/// A fatal error surfaced by one pipeline component to the supervisor.
///
/// Transient errors (buffer overruns, `expired-trace`, SG `NotFound`, ...)
/// never become a `PipelineError` — they're handled inline by the
/// component that observed them and reported as metrics/log events.
#[derive(Debug, Error)]
#[error("{component}: {source}")]
pub struct PipelineError {
    pub component: Component,
    #[source]
    pub source: anyhow::Error,
}

impl PipelineError {
    pub fn new(component: Component, source: impl Into<anyhow::Error>) -> Self {
        PipelineError { component, source: source.into() }
    }
}

/// Routine, non-fatal outcomes of a merge attempt (§4.4, §7).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MergeOutcome {
    #[error("trace not ready")]
    NotReady,
    #[error("expired trace")]
    Expired,
}

/// Outcome of a rule-text cache lookup (§4.2).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RuleLookupError {
    #[error("expired trace")]
    ExpiredTrace,
    #[error("kernel ruleset enumeration failed: {0}")]
    KernelQuery(String),
}

/// Outcome of an SG-network resolver lookup (§4.8).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SgLookupError {
    #[error("no SG/network membership found for this address")]
    NotFound,
}
