//! SG-network resolver (spec §4.8): maintains `IP → (SG name, network name)`
//! lookups backed by the security-group directory, refreshed on
//! `sync-status` change via either pull polling or a push stream.

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::RwLock;
use std::time::Duration;

use cidr::IpCidr;
use thiserror::Error;
use tokio_stream::StreamExt;
use tonic::transport::Channel;

use pkt_tracer_proto::sgroups::security_groups_client::SecurityGroupsClient;
use pkt_tracer_types::config::SgSyncMode;
pub use pkt_tracer_types::error::SgLookupError as LookupError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("sg directory transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("sg directory rpc error: {0}")]
    Rpc(#[from] tonic::Status),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub sg_name: String,
    pub network_name: String,
}

#[derive(Clone, Debug)]
struct CidrEntry {
    cidr: IpCidr,
    entry: Entry,
}

/// A fast `IP → entry` map in front of a slow ordered CIDR list; the slow
/// list is scanned on miss and the resolved entry memoised in the fast map.
/// Replaced atomically under one lock on refresh (spec §4.8, testable
/// property 11).
struct Cache {
    fast: HashMap<IpAddr, Entry>,
    slow: Vec<CidrEntry>,
}

pub struct SgResolver {
    cache: RwLock<Cache>,
}

impl SgResolver {
    pub fn empty() -> Self {
        SgResolver { cache: RwLock::new(Cache { fast: HashMap::new(), slow: Vec::new() }) }
    }

    pub fn lookup(&self, ip: &str) -> Result<Entry, LookupError> {
        let addr = IpAddr::from_str(ip).map_err(|_| LookupError::NotFound)?;
        {
            let cache = self.cache.read().expect("lock poisoned");
            if let Some(entry) = cache.fast.get(&addr) {
                return Ok(entry.clone());
            }
            if let Some(found) = cache.slow.iter().find(|c| c.cidr.contains(&addr)) {
                let entry = found.entry.clone();
                drop(cache);
                self.cache.write().expect("lock poisoned").fast.insert(addr, entry.clone());
                return Ok(entry);
            }
        }
        Err(LookupError::NotFound)
    }

    /// Replaces the whole cache atomically; the fast map is cleared so stale
    /// memoised misses/hits from before the rebuild don't linger.
    fn replace(&self, slow: Vec<CidrEntry>) {
        let mut cache = self.cache.write().expect("lock poisoned");
        cache.slow = slow;
        cache.fast.clear();
    }
}

/// Builds the slow CIDR list from the directory's `ListSecurityGroups` +
/// `ListNetworks` responses.
fn build_slow_list(
    groups: Vec<pkt_tracer_proto::sgroups::SecurityGroup>,
    networks: Vec<pkt_tracer_proto::sgroups::Network>,
) -> Vec<CidrEntry> {
    let cidrs: HashMap<&str, &str> = networks.iter().map(|n| (n.name.as_str(), n.cidr.as_str())).collect();
    let mut out = Vec::new();
    for group in &groups {
        for net_name in &group.networks {
            let Some(cidr_str) = cidrs.get(net_name.as_str()) else { continue };
            let Ok(cidr) = IpCidr::from_str(cidr_str) else { continue };
            out.push(CidrEntry {
                cidr,
                entry: Entry { sg_name: group.name.clone(), network_name: net_name.clone() },
            });
        }
    }
    out
}

async fn refresh(client: &mut SecurityGroupsClient<Channel>, resolver: &SgResolver) -> Result<(), Error> {
    let groups = client.list_security_groups(()).await?.into_inner().groups;
    let networks = client.list_networks(()).await?.into_inner().networks;
    resolver.replace(build_slow_list(groups, networks));
    Ok(())
}

/// Runs the pull-mode refresh loop: poll `SyncStatus` every `interval` and
/// rebuild the cache whenever `updated_at` changes (spec §4.8).
pub async fn run_pull(
    address: String,
    interval: Duration,
    resolver: std::sync::Arc<SgResolver>,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<(), Error> {
    let mut client = SecurityGroupsClient::connect(address).await?;
    let mut last_updated: Option<prost_types::Timestamp> = None;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(interval) => {}
        }
        match client.sync_status(()).await {
            Ok(resp) => {
                let updated_at = resp.into_inner().updated_at;
                if updated_at != last_updated {
                    if let Err(error) = refresh(&mut client, &resolver).await {
                        tracing::warn!(%error, "sg cache refresh failed, keeping previous cache");
                    } else {
                        last_updated = updated_at;
                    }
                }
            }
            Err(status) if status.code() == tonic::Code::NotFound => {
                tracing::debug!("sg directory reports no data yet");
            }
            Err(status) => {
                tracing::warn!(%status, "sg sync-status check failed");
            }
        }
    }
}

/// Runs the push-mode refresh loop: a server-streaming `SyncStatuses`
/// subscription, rebuilding the cache on each pushed change (spec §4.8).
pub async fn run_push(
    address: String,
    resolver: std::sync::Arc<SgResolver>,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<(), Error> {
    let mut client = SecurityGroupsClient::connect(address).await?;
    let mut stream = client.sync_statuses(()).await?.into_inner();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = stream.next() => {
                match next {
                    Some(Ok(_status)) => {
                        if let Err(error) = refresh(&mut client, &resolver).await {
                            tracing::warn!(%error, "sg cache refresh failed, keeping previous cache");
                        }
                    }
                    Some(Err(status)) => {
                        tracing::warn!(%status, "sg push stream error");
                    }
                    None => return Ok(()),
                }
            }
        }
    }
}

pub async fn run(
    mode: SgSyncMode,
    address: String,
    interval: Duration,
    resolver: std::sync::Arc<SgResolver>,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<(), Error> {
    match mode {
        SgSyncMode::Pull => run_pull(address, interval, resolver, cancel).await,
        SgSyncMode::Push => run_push(address, resolver, cancel).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkt_tracer_proto::sgroups::{Network, SecurityGroup};

    #[test]
    fn lookup_resolves_via_slow_cidr_list_then_memoises() {
        let resolver = SgResolver::empty();
        let groups =
            vec![SecurityGroup { name: "sg1".to_string(), networks: vec!["net1".to_string()] }];
        let networks = vec![Network { name: "net1".to_string(), cidr: "10.0.0.0/24".to_string() }];
        resolver.replace(build_slow_list(groups, networks));

        let entry = resolver.lookup("10.0.0.5").unwrap();
        assert_eq!(entry.sg_name, "sg1");
        assert_eq!(entry.network_name, "net1");

        // now memoised in the fast map
        assert!(resolver.cache.read().unwrap().fast.contains_key(&"10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn lookup_miss_is_not_found() {
        let resolver = SgResolver::empty();
        assert_eq!(resolver.lookup("192.168.1.1"), Err(LookupError::NotFound));
    }

    #[test]
    fn replace_clears_fast_map() {
        let resolver = SgResolver::empty();
        let groups =
            vec![SecurityGroup { name: "sg1".to_string(), networks: vec!["net1".to_string()] }];
        let networks = vec![Network { name: "net1".to_string(), cidr: "10.0.0.0/24".to_string() }];
        resolver.replace(build_slow_list(groups.clone(), networks.clone()));
        resolver.lookup("10.0.0.5").unwrap();
        assert!(!resolver.cache.read().unwrap().fast.is_empty());

        resolver.replace(build_slow_list(groups, networks));
        assert!(resolver.cache.read().unwrap().fast.is_empty());
    }
}
