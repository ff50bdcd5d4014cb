//! # policy
//!
//! The pluggable routing hook (component C6): which peer(s) host the
//! server state for a given lock name, and when create/delete replication
//! is needed.
//!
//! Coordinator election and peer selection algorithms are themselves out of
//! scope (§1) — both concrete locators below accept the already-resolved
//! coordinator/view as input rather than computing it.

use std::sync::Mutex;

use crate::owner::MemberAddress;

/// Where `GRANT_LOCK`/`RELEASE_LOCK` for a given lock name should be sent,
/// and whether a replication message should also go out.
pub trait ServerLocator: Send + Sync {
    /// Destination for a `GRANT_LOCK`/`RELEASE_LOCK` request for `lock_name`.
    fn route(&self, lock_name: &str) -> MemberAddress;

    /// Additional peers that should receive `CREATE_LOCK`/`DELETE_LOCK`
    /// replication traffic for `lock_name`, if any.
    fn replicas(&self, lock_name: &str) -> Vec<MemberAddress> {
        let _ = lock_name;
        Vec::new()
    }
}

/// Centralized scheme: a single current coordinator owns all server state;
/// `CREATE_LOCK`/`DELETE_LOCK` are additionally multicast to backups so a
/// coordinator failover preserves state.
pub struct CentralCoordinatorLocator {
    coordinator: Mutex<MemberAddress>,
    backups: Mutex<Vec<MemberAddress>>,
}

impl CentralCoordinatorLocator {
    pub fn new(coordinator: MemberAddress, backups: Vec<MemberAddress>) -> Self {
        Self { coordinator: Mutex::new(coordinator), backups: Mutex::new(backups) }
    }

    /// Update the current coordinator, e.g. after the transport reports a
    /// coordinator failover. Peer selection itself is out of scope; this
    /// just records the already-elected result.
    pub fn set_coordinator(&self, coordinator: MemberAddress) {
        *self.coordinator.lock().unwrap() = coordinator;
    }

    pub fn set_backups(&self, backups: Vec<MemberAddress>) {
        *self.backups.lock().unwrap() = backups;
    }
}

impl ServerLocator for CentralCoordinatorLocator {
    fn route(&self, _lock_name: &str) -> MemberAddress {
        self.coordinator.lock().unwrap().clone()
    }

    fn replicas(&self, _lock_name: &str) -> Vec<MemberAddress> {
        self.backups.lock().unwrap().clone()
    }
}

/// Consistent-peer scheme: each lock name is mapped to a deterministic
/// member of the current view (hash mod view size); no replication.
pub struct ConsistentPeerLocator {
    view: Mutex<Vec<MemberAddress>>,
}

impl ConsistentPeerLocator {
    pub fn new(view: Vec<MemberAddress>) -> Self {
        Self { view: Mutex::new(view) }
    }

    pub fn set_view(&self, view: Vec<MemberAddress>) {
        *self.view.lock().unwrap() = view;
    }

    fn hash_name(name: &str) -> u64 {
        // FNV-1a: simple, deterministic, no external dependency needed for
        // a routing hash that never leaves the process.
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in name.as_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        hash
    }
}

impl ServerLocator for ConsistentPeerLocator {
    fn route(&self, lock_name: &str) -> MemberAddress {
        let view = self.view.lock().unwrap();
        assert!(!view.is_empty(), "consistent-peer locator requires a non-empty view");
        let idx = (Self::hash_name(lock_name) as usize) % view.len();
        view[idx].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn central_coordinator_routes_everything_to_coordinator() {
        let locator = CentralCoordinatorLocator::new(
            MemberAddress::from_str("coord"),
            vec![MemberAddress::from_str("backup1")],
        );
        assert_eq!(locator.route("x"), MemberAddress::from_str("coord"));
        assert_eq!(locator.route("y"), MemberAddress::from_str("coord"));
        assert_eq!(locator.replicas("x"), vec![MemberAddress::from_str("backup1")]);
    }

    #[test]
    fn consistent_peer_is_deterministic_for_a_fixed_view() {
        let view = vec![
            MemberAddress::from_str("p1"),
            MemberAddress::from_str("p2"),
            MemberAddress::from_str("p3"),
        ];
        let locator = ConsistentPeerLocator::new(view);
        let first = locator.route("lock-x");
        let second = locator.route("lock-x");
        assert_eq!(first, second);
        assert!(locator.replicas("lock-x").is_empty());
    }

    #[test]
    fn consistent_peer_spreads_different_names_across_view() {
        let view: Vec<_> = (0..8).map(|i| MemberAddress::from_str(format!("p{i}"))).collect();
        let locator = ConsistentPeerLocator::new(view);
        let names = ["alpha", "beta", "gamma", "delta", "epsilon"];
        let routes: std::collections::HashSet<_> = names.iter().map(|n| locator.route(n)).collect();
        assert!(routes.len() > 1, "expected distinct names to spread across peers");
    }
}
