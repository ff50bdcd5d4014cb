//! # owner
//!
//! Member and owner identity (component C2).
//!
//! An [`Owner`] is the `(member_address, thread_id)` pair that identifies a
//! single thread on a single member as a lock holder or contender.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::ThreadId;

/// An opaque identifier for a group member.
///
/// Equality and hashing are structural; `None` in contexts that carry
/// `Option<MemberAddress>` means "broadcast to all members" (the wire-level
/// `nil` address of §4.1).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberAddress(Vec<u8>);

impl MemberAddress {
    /// Build a member address from raw bytes (transport-defined).
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Convenience constructor for string-keyed transports (the common case
    /// in this crate's demo and tests).
    pub fn from_str(s: impl AsRef<str>) -> Self {
        Self(s.as_ref().as_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for MemberAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{s}"),
            Err(_) => write!(f, "{:02x?}", self.0),
        }
    }
}

/// `(member_address, thread_id)` pair uniquely identifying a lock holder or
/// contender. Two threads on the same member contend like threads on
/// different members.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Owner {
    pub address: MemberAddress,
    pub thread_id: u64,
}

impl Owner {
    pub fn new(address: MemberAddress, thread_id: u64) -> Self {
        Self { address, thread_id }
    }

    /// A placeholder owner for messages that carry no meaningful owner,
    /// such as a `DELETE_LOCK` replication notice.
    pub fn nil() -> Self {
        Self { address: MemberAddress::new(Vec::new()), thread_id: 0 }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.thread_id)
    }
}

/// Assigns a stable, process-unique `u64` to each OS thread that asks for
/// one.
///
/// Rust's [`std::thread::ThreadId`] has no public numeric accessor, so this
/// interns the opaque `ThreadId` the first time a given thread calls into
/// the locking layer and hands back the same number on every subsequent
/// call from that thread. This is the one thread-local-adjacent piece of
/// state §4.5 calls for; it is otherwise unused.
#[derive(Debug, Default)]
pub struct ThreadIdRegistry {
    ids: Mutex<HashMap<ThreadId, u64>>,
    next: AtomicU64,
}

impl ThreadIdRegistry {
    pub fn new() -> Self {
        Self {
            ids: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
        }
    }

    /// Return the stable numeric id for the calling thread, assigning one on
    /// first use.
    pub fn current(&self) -> u64 {
        let tid = std::thread::current().id();
        let mut ids = self.ids.lock().unwrap();
        *ids.entry(tid).or_insert_with(|| self.next.fetch_add(1, Ordering::Relaxed))
    }
}
