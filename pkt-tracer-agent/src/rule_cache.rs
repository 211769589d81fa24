//! Rule-text cache (spec §4.2): maps `(table, family, chain, rule-handle)`
//! to the most recently captured human-readable rule expression.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

pub use pkt_tracer_types::error::RuleLookupError as LookupError;
use pkt_tracer_types::model::Family;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Key {
    table: String,
    family: Family,
    chain: String,
    handle: u64,
}

#[derive(Clone, Debug)]
struct CacheEntry {
    rule_text: String,
    captured_at: SystemTime,
    removed: bool,
}

/// Trait abstracting "ask the kernel for the current rule text of this
/// handle" so the lookup protocol can be unit tested without a real
/// netlink/nftables admin connection.
#[async_trait::async_trait]
pub trait KernelRuleSource: Send + Sync {
    async fn query_rule(
        &self,
        table: &str,
        family: Family,
        chain: &str,
        handle: u64,
    ) -> Result<String, LookupError>;
}

pub struct RuleCache<K: KernelRuleSource> {
    entries: Mutex<HashMap<Key, CacheEntry>>,
    kernel: K,
}

impl<K: KernelRuleSource> RuleCache<K> {
    pub fn new(kernel: K) -> Self {
        RuleCache { entries: Mutex::new(HashMap::new()), kernel }
    }

    /// `NEWRULE`: refresh the entry with a fresh timestamp and clear the
    /// removed flag (spec §4.2).
    pub fn on_new_rule(&self, table: &str, family: Family, chain: &str, handle: u64, rule_text: String, now: SystemTime) {
        let key = Key { table: table.to_string(), family, chain: chain.to_string(), handle };
        self.entries.lock().expect("lock poisoned").insert(
            key,
            CacheEntry { rule_text, captured_at: now, removed: false },
        );
    }

    /// `DELRULE`: mark the entry removed but retain it briefly so in-flight
    /// traces can still be annotated (and correctly rejected as expired).
    pub fn on_del_rule(&self, table: &str, family: Family, chain: &str, handle: u64) {
        let key = Key { table: table.to_string(), family, chain: chain.to_string(), handle };
        if let Some(entry) = self.entries.lock().expect("lock poisoned").get_mut(&key) {
            entry.removed = true;
        }
    }

    /// The lookup protocol of spec §4.2: cache hit and fresh → text;
    /// cache miss → query the kernel, cache, and return; otherwise
    /// `ExpiredTrace`.
    pub async fn lookup(
        &self,
        table: &str,
        family: Family,
        chain: &str,
        handle: u64,
        observed_at: SystemTime,
    ) -> Result<String, LookupError> {
        let key = Key { table: table.to_string(), family, chain: chain.to_string(), handle };
        let cached = self.entries.lock().expect("lock poisoned").get(&key).cloned();
        match cached {
            Some(entry) if !entry.removed && entry.captured_at <= observed_at => Ok(entry.rule_text),
            Some(entry) if entry.removed || entry.captured_at > observed_at => {
                let _ = entry;
                Err(LookupError::ExpiredTrace)
            }
            None => {
                let text = self.kernel.query_rule(table, family, chain, handle).await?;
                self.on_new_rule(table, family, chain, handle, text.clone(), observed_at);
                Ok(text)
            }
            _ => Err(LookupError::ExpiredTrace),
        }
    }

    /// Eager startup population by enumerating the whole kernel ruleset
    /// (spec §4.2 "Refreshed eagerly at startup").
    pub fn preload(&self, entries: Vec<(String, Family, String, u64, String)>, now: SystemTime) {
        let mut guard = self.entries.lock().expect("lock poisoned");
        for (table, family, chain, handle, text) in entries {
            guard.insert(
                Key { table, family, chain, handle },
                CacheEntry { rule_text: text, captured_at: now, removed: false },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct NeverQueried;

    #[async_trait::async_trait]
    impl KernelRuleSource for NeverQueried {
        async fn query_rule(&self, _: &str, _: Family, _: &str, _: u64) -> Result<String, LookupError> {
            panic!("kernel should not be queried on a fresh cache hit")
        }
    }

    struct AlwaysReturns(&'static str);

    #[async_trait::async_trait]
    impl KernelRuleSource for AlwaysReturns {
        async fn query_rule(&self, _: &str, _: Family, _: &str, _: u64) -> Result<String, LookupError> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn fresh_cache_hit_returns_rule_text_without_kernel_query() {
        let cache = RuleCache::new(NeverQueried);
        let t0 = SystemTime::UNIX_EPOCH;
        cache.on_new_rule("filter", Family::Ip, "input", 5, "ip saddr 10.0.0.1 accept".to_string(), t0);
        let text = cache.lookup("filter", Family::Ip, "input", 5, t0 + Duration::from_secs(1)).await.unwrap();
        assert_eq!(text, "ip saddr 10.0.0.1 accept");
    }

    #[tokio::test]
    async fn stale_entry_is_expired_without_kernel_query() {
        let cache = RuleCache::new(NeverQueried);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(10);
        cache.on_new_rule("filter", Family::Ip, "input", 5, "accept".to_string(), t0);
        let err = cache.lookup("filter", Family::Ip, "input", 5, t0 - Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err, LookupError::ExpiredTrace);
    }

    #[tokio::test]
    async fn removed_entry_is_expired() {
        let cache = RuleCache::new(NeverQueried);
        let t0 = SystemTime::UNIX_EPOCH;
        cache.on_new_rule("filter", Family::Ip, "input", 5, "accept".to_string(), t0);
        cache.on_del_rule("filter", Family::Ip, "input", 5);
        let err = cache.lookup("filter", Family::Ip, "input", 5, t0 + Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, LookupError::ExpiredTrace);
    }

    #[tokio::test]
    async fn cache_miss_queries_kernel_and_caches_result() {
        let cache = RuleCache::new(AlwaysReturns("tcp dport 443 accept"));
        let t0 = SystemTime::UNIX_EPOCH;
        let text = cache.lookup("filter", Family::Ip, "input", 9, t0).await.unwrap();
        assert_eq!(text, "tcp dport 443 accept");
    }
}
