//! Tunnel Registry: process-wide subdomain → session table, owned
//! by the server bootstrap and handed to both listeners explicitly rather
//! than reached for as a hidden singleton.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::session::Session;

/// A point-in-time view of one registered tunnel, for the status page.
pub struct TunnelSnapshot {
    pub subdomain: String,
    pub client_id: String,
    pub peer_addr: std::net::SocketAddr,
    pub registered_at: Instant,
    pub last_heartbeat_at: Instant,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub request_count: u64,
    pub error_count: u64,
}

/// Returned by [`TunnelRegistry::register`] when the subdomain is already
/// claimed by a live session. Carries only the coarse age of the existing
/// registration — the occupant session itself is never exposed to the
/// challenger.
#[derive(Debug, Clone, Copy)]
pub struct Conflict {
    pub existing_age: Duration,
}

/// Sharded subdomain → session map. All operations are non-blocking and
/// complete without I/O, matching the target's `DashMap<String, TunnelEntry>`
/// relay table.
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: DashMap<String, Arc<Session>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            tunnels: DashMap::new(),
        }
    }

    /// Atomically insert `session` under `subdomain` iff no live session
    /// currently occupies it.
    pub fn register(&self, subdomain: &str, session: Arc<Session>) -> Result<(), Conflict> {
        match self.tunnels.entry(subdomain.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
            dashmap::mapref::entry::Entry::Occupied(slot) => Err(Conflict {
                existing_age: slot.get().registered_at.elapsed(),
            }),
        }
    }

    /// Non-blocking lookup. Never returns a session that has already
    /// transitioned to `Closed` — closed sessions unregister themselves
    /// before their last response frame can be dispatched.
    pub fn lookup(&self, subdomain: &str) -> Option<Arc<Session>> {
        self.tunnels.get(subdomain).map(|e| Arc::clone(e.value()))
    }

    /// No-op if the current occupant is not `session` — prevents a stale
    /// (already-replaced) session from evicting its successor.
    pub fn unregister(&self, subdomain: &str, session: &Arc<Session>) {
        if let Some(entry) = self.tunnels.get(subdomain) {
            if !Arc::ptr_eq(entry.value(), session) {
                return;
            }
        } else {
            return;
        }
        self.tunnels
            .remove_if(subdomain, |_, current| Arc::ptr_eq(current, session));
    }

    /// Snapshot of every currently registered tunnel, for the status page.
    pub fn snapshot(&self) -> Vec<TunnelSnapshot> {
        self.tunnels
            .iter()
            .map(|entry| entry.value().snapshot(entry.key().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::test_session;

    #[test]
    fn register_is_exclusive() {
        let registry = TunnelRegistry::new();
        let a = test_session("p");
        let b = test_session("p");
        registry.register("p", a.clone()).unwrap();
        let err = registry.register("p", b).unwrap_err();
        assert!(err.existing_age < Duration::from_secs(1));
        assert!(Arc::ptr_eq(&registry.lookup("p").unwrap(), &a));
    }

    #[test]
    fn unregister_ignores_stale_occupant() {
        let registry = TunnelRegistry::new();
        let a = test_session("p");
        let b = test_session("p");
        registry.register("p", a.clone()).unwrap();
        // `a` was already evicted by a direct remove+insert of `b` below;
        // unregistering the stale `a` must not evict `b`.
        registry.tunnels.insert("p".to_string(), b.clone());
        registry.unregister("p", &a);
        assert!(Arc::ptr_eq(&registry.lookup("p").unwrap(), &b));
    }

    #[test]
    fn unregister_removes_current_occupant() {
        let registry = TunnelRegistry::new();
        let a = test_session("p");
        registry.register("p", a.clone()).unwrap();
        registry.unregister("p", &a);
        assert!(registry.lookup("p").is_none());
    }

    #[test]
    fn lookup_missing_is_none() {
        let registry = TunnelRegistry::new();
        assert!(registry.lookup("nope").is_none());
    }

    #[test]
    fn snapshot_lists_all_tunnels() {
        let registry = TunnelRegistry::new();
        registry.register("a", test_session("a")).unwrap();
        registry.register("b", test_session("b")).unwrap();
        let mut subdomains: Vec<_> = registry.snapshot().into_iter().map(|s| s.subdomain).collect();
        subdomains.sort();
        assert_eq!(subdomains, vec!["a".to_string(), "b".to_string()]);
    }
}
