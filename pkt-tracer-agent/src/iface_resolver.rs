//! Interface index → name cache (spec §4.1 "Interface resolver").
//!
//! Refreshed by one full `rtnetlink` link dump at construction; the merger
//! treats a resolver miss as a fatal merge error (spec §4.4 step 2), so the
//! cache is rebuilt eagerly rather than lazily populated per lookup.

use std::collections::HashMap;
use std::sync::RwLock;

use futures::TryStreamExt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open rtnetlink connection: {0}")]
    Connect(#[source] std::io::Error),
    #[error("failed to enumerate links: {0}")]
    LinkDump(#[source] rtnetlink::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("no interface name cached for ifindex {0}")]
pub struct NotFound(pub u32);

pub struct IfaceResolver {
    names: RwLock<HashMap<u32, String>>,
}

impl IfaceResolver {
    /// Enumerates all interfaces on the host via a one-shot rtnetlink dump.
    pub async fn load() -> Result<Self, Error> {
        let (connection, handle, _) = rtnetlink::new_connection().map_err(Error::Connect)?;
        tokio::spawn(connection);

        let mut names = HashMap::new();
        let mut links = handle.link().get().execute();
        while let Some(msg) = links.try_next().await.map_err(Error::LinkDump)? {
            let index = msg.header.index;
            if let Some(name) = msg.attributes.iter().find_map(|attr| match attr {
                rtnetlink::packet_route::link::LinkAttribute::IfName(name) => Some(name.clone()),
                _ => None,
            }) {
                names.insert(index, name);
            }
        }
        Ok(IfaceResolver { names: RwLock::new(names) })
    }

    #[cfg(test)]
    pub fn from_map(names: HashMap<u32, String>) -> Self {
        IfaceResolver { names: RwLock::new(names) }
    }

    pub fn resolve(&self, ifindex: u32) -> Result<String, NotFound> {
        if ifindex == 0 {
            return Ok(String::new());
        }
        self.names.read().expect("lock poisoned").get(&ifindex).cloned().ok_or(NotFound(ifindex))
    }

    /// Applies a NEWLINK/DELLINK style update, keeping the cache current
    /// between full reloads without requiring a fresh dump per lookup.
    pub fn upsert(&self, ifindex: u32, name: String) {
        self.names.write().expect("lock poisoned").insert(ifindex, name);
    }

    pub fn remove(&self, ifindex: u32) {
        self.names.write().expect("lock poisoned").remove(&ifindex);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_ifindex_resolves_to_empty_name() {
        let resolver = IfaceResolver::from_map(HashMap::new());
        assert_eq!(resolver.resolve(0).unwrap(), "");
    }

    #[test]
    fn missing_ifindex_is_not_found() {
        let resolver = IfaceResolver::from_map(HashMap::new());
        assert_eq!(resolver.resolve(7), Err(NotFound(7)));
    }

    #[test]
    fn upsert_then_resolve_roundtrips() {
        let resolver = IfaceResolver::from_map(HashMap::new());
        resolver.upsert(3, "eth0".to_string());
        assert_eq!(resolver.resolve(3).unwrap(), "eth0");
    }
}
