//! Process-wide registry mapping domain patterns to outbound networks.
//!
//! Tunnel loops publish the domains their peer advertised; lookups pick
//! the network capability that serves a location's host. Entries keep
//! insertion order and the first inserted match wins; tests depend on
//! this ordering. When nothing matches, the direct-network default
//! (owner 0) is returned.

use crate::net::{DirectNetwork, Location, Network};
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, trace};

/// A router entry: domain patterns served by one network capability.
#[derive(Clone)]
pub struct RouterItem {
    pub domains: Vec<String>,
    pub network: Arc<dyn Network>,
    /// Identity of the tunnel loop that advertised this entry.
    pub owner: u64,
}

impl fmt::Debug for RouterItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterItem")
            .field("domains", &self.domains)
            .field("owner", &self.owner)
            .finish()
    }
}

/// Ordered domain → network registry.
pub struct Router {
    items: RwLock<Vec<RouterItem>>,
    default: Arc<dyn Network>,
}

impl Router {
    /// Create a router whose fallback is the direct host network.
    pub fn new() -> Self {
        Self::with_default(Arc::new(DirectNetwork))
    }

    /// Create a router with an explicit fallback capability.
    pub fn with_default(default: Arc<dyn Network>) -> Self {
        Self {
            items: RwLock::new(Vec::new()),
            default,
        }
    }

    /// Append an entry.
    pub fn add_item(&self, item: RouterItem) {
        debug!("router add: {:?}", item);
        self.items.write().unwrap().push(item);
    }

    /// Remove every entry advertised by `owner`.
    pub fn remove_owner(&self, owner: u64) {
        let mut items = self.items.write().unwrap();
        let before = items.len();
        items.retain(|item| item.owner != owner);
        if items.len() != before {
            debug!("router purged {} entries of owner {}", before - items.len(), owner);
        }
    }

    /// Pick the network serving `loc`, falling back to the default.
    ///
    /// Linear scan over entries and their patterns; first match wins.
    pub fn resolve(&self, loc: &Location) -> Arc<dyn Network> {
        let items = self.items.read().unwrap();
        for item in items.iter() {
            if item.domains.iter().any(|d| domain_covers(d, &loc.host)) {
                trace!("{} routed to owner {}", loc, item.owner);
                return Arc::clone(&item.network);
            }
        }
        trace!("{} routed to default", loc);
        Arc::clone(&self.default)
    }

    /// Number of registered entries (excluding the default).
    pub fn len(&self) -> usize {
        self.items.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Literal equality, or suffix match on a label boundary: `example.com`
/// covers `example.com` and `a.example.com` but not `badexample.com`.
fn domain_covers(pattern: &str, host: &str) -> bool {
    if host == pattern {
        return true;
    }
    host.len() > pattern.len()
        && host.ends_with(pattern)
        && host.as_bytes()[host.len() - pattern.len() - 1] == b'.'
}
