//! # transport
//!
//! The external message-passing interface the core depends on (§6), plus an
//! in-memory reference implementation used by tests and the demo binary.
//!
//! Real deployments supply their own [`Transport`]: delivery, framing, flow
//! control, failure detection and view computation are explicitly out of
//! scope for this crate (§1).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::locking_layer::{Event, LockingLayer};
use crate::owner::MemberAddress;

/// Per-message delivery hints a [`Transport`] may honor.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendFlags {
    /// Mirrors §5's "do-not-bundle" latency hint; correctness never depends
    /// on a transport honoring it.
    pub bypass_bundling: bool,
}

/// The message-passing primitive the protocol core requires of its
/// surrounding stack.
///
/// `destination = None` means broadcast to all members, matching the `nil`
/// address convention of §3.
pub trait Transport: Send + Sync {
    /// Send an already-encoded, header-tagged payload to one member or all
    /// members.
    fn send(&self, destination: Option<MemberAddress>, payload: Vec<u8>, flags: SendFlags) -> Result<(), String>;
}

/// A transport that delivers straight from one [`LockingLayer`]'s `down`
/// path into another's `up` path, on the sending thread.
///
/// This is the reference implementation named in §6; it exists purely so
/// the protocol can be exercised end-to-end without a real group-
/// communication stack. It is FIFO per sender-destination pair by
/// construction (synchronous delivery), as the protocol's ordering
/// guarantees (§5) require.
#[derive(Default)]
pub struct InMemoryTransport {
    members: Mutex<HashMap<MemberAddress, Weak<LockingLayer>>>,
}

impl InMemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a member's layer so it can receive deliveries. The layer is
    /// held weakly: the transport does not keep members alive.
    pub fn register(&self, address: MemberAddress, layer: &Arc<LockingLayer>) {
        self.members.lock().unwrap().insert(address, Arc::downgrade(layer));
    }

    pub fn unregister(&self, address: &MemberAddress) {
        self.members.lock().unwrap().remove(address);
    }

    /// Deliver a view change to every currently registered member.
    pub fn broadcast_view(&self, members: Vec<MemberAddress>) {
        let targets: Vec<Arc<LockingLayer>> = self
            .members
            .lock()
            .unwrap()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for layer in targets {
            layer.up(Event::ViewChange(members.clone()));
        }
    }
}

impl Transport for InMemoryTransport {
    fn send(&self, destination: Option<MemberAddress>, payload: Vec<u8>, _flags: SendFlags) -> Result<(), String> {
        let targets: Vec<Arc<LockingLayer>> = {
            let members = self.members.lock().unwrap();
            match destination {
                Some(addr) => members.get(&addr).and_then(Weak::upgrade).into_iter().collect(),
                None => members.values().filter_map(Weak::upgrade).collect(),
            }
        };
        if targets.is_empty() {
            return Err(format!("no registered member for destination {destination:?}"));
        }
        for layer in targets {
            layer.up(Event::Message(payload.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_to_unknown_destination_fails() {
        let transport = InMemoryTransport::new();
        let err = transport
            .send(Some(MemberAddress::from_str("ghost")), vec![1, 2, 3], SendFlags::default())
            .unwrap_err();
        assert!(err.contains("no registered member"));
    }
}
