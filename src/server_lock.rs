//! # server_lock
//!
//! The server-side lock state machine (component C3): arbitrates ownership
//! of one lock name and maintains a fair FIFO waiter queue.
//!
//! `ServerLock` is intentionally effect-returning rather than holding a
//! back-reference to the locking layer: every state-changing operation
//! returns the [`ServerEffect`]s (responses to send, notifications to fire)
//! that the caller — the [`crate::locking_layer::LockingLayer`] — performs
//! outside the lock's own monitor. This keeps the state machine a plain,
//! directly testable value and avoids the deadlock risk §9 warns about
//! (a listener or send callback re-entering the lock while its monitor is
//! held).

use std::sync::Mutex;

use tracing::warn;

use crate::error::ProtocolError;
use crate::message::{Request, RequestType};
use crate::owner::{MemberAddress, Owner};

/// A side effect produced by a [`ServerLock`] state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEffect {
    /// Send `response` to `response.owner`.
    Send(Request),
    /// The lock transitioned from free to held by `owner`.
    Locked { name: String, owner: Owner },
    /// The lock transitioned from held by `owner` to free.
    Unlocked { name: String, owner: Owner },
}

#[derive(Debug, Default)]
struct ServerLockState {
    current_owner: Option<Owner>,
    queue: Vec<Request>,
}

/// Per-(peer, lock_name) authoritative lock state.
///
/// All operations on one `ServerLock` are mutually exclusive (a single
/// coarse monitor, §4.2/§5): the entire queue and owner transition happens
/// under one lock acquisition.
#[derive(Debug)]
pub struct ServerLock {
    lock_name: String,
    state: Mutex<ServerLockState>,
}

impl ServerLock {
    pub fn new(lock_name: impl Into<String>) -> Self {
        Self { lock_name: lock_name.into(), state: Mutex::new(ServerLockState::default()) }
    }

    /// Construct a lock pre-seeded with an owner, for the `CREATE_LOCK`
    /// replication path (§4.4).
    pub fn with_owner(lock_name: impl Into<String>, owner: Owner) -> Self {
        Self {
            lock_name: lock_name.into(),
            state: Mutex::new(ServerLockState { current_owner: Some(owner), queue: Vec::new() }),
        }
    }

    pub fn lock_name(&self) -> &str {
        &self.lock_name
    }

    /// True once `current_owner` is `None` and `queue` is empty — the
    /// condition under which the entry must be dropped from the registry
    /// (invariant 1, §8).
    pub fn is_free_and_empty(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.current_owner.is_none() && state.queue.is_empty()
    }

    pub fn current_owner(&self) -> Option<Owner> {
        self.state.lock().unwrap().current_owner.clone()
    }

    /// Number of waiters queued behind the current owner (for the
    /// management surface, §6).
    pub fn queue_len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    #[cfg(test)]
    fn queue_snapshot(&self) -> Vec<Request> {
        self.state.lock().unwrap().queue.clone()
    }

    /// Dispatch one incoming request (§4.2's `handle_request`) and then run
    /// the queue-promotion pass, returning every effect produced.
    pub fn handle_request(&self, req: Request) -> Result<Vec<ServerEffect>, ProtocolError> {
        let mut effects = Vec::new();
        let mut state = self.state.lock().unwrap();
        match req.kind {
            RequestType::GrantLock => {
                if state.current_owner.is_none() {
                    Self::set_owner(&mut state, &self.lock_name, Some(req.owner.clone()), &mut effects);
                    effects.push(ServerEffect::Send(Request::lock_granted(self.lock_name.clone(), req.owner)));
                } else if state.current_owner.as_ref() == Some(&req.owner) {
                    effects.push(ServerEffect::Send(Request::lock_granted(self.lock_name.clone(), req.owner)));
                } else if req.is_trylock && req.timeout == 0 {
                    effects.push(ServerEffect::Send(Request::lock_denied(self.lock_name.clone(), req.owner)));
                } else {
                    Self::add_to_queue(&mut state, req);
                }
            }
            RequestType::ReleaseLock => {
                if state.current_owner.is_none() {
                    // Open question (a): silently dropped, see SPEC_FULL.md.
                } else if state.current_owner.as_ref() == Some(&req.owner) {
                    let prev = state.current_owner.take();
                    if let Some(prev) = prev {
                        effects.push(ServerEffect::Unlocked { name: self.lock_name.clone(), owner: prev });
                    }
                } else {
                    Self::add_to_queue(&mut state, req);
                }
            }
            other => {
                warn!(lock = %self.lock_name, kind = ?other, "dropping request of unexpected type at server lock");
                return Err(ProtocolError::UnknownRequestType(other as u8));
            }
        }
        Self::process_queue(&mut state, &self.lock_name, &mut effects);
        Ok(effects)
    }

    /// §4.2's `add_to_queue`: enforces "at most one queued `GRANT_LOCK` per
    /// owner" and resolves a `RELEASE_LOCK` against the queue inline.
    fn add_to_queue(state: &mut ServerLockState, req: Request) {
        match req.kind {
            RequestType::GrantLock => {
                if !state.queue.iter().any(|q| q.owner == req.owner) {
                    state.queue.push(req);
                }
            }
            RequestType::ReleaseLock => {
                state.queue.retain(|q| q.owner != req.owner);
            }
            _ => unreachable!("add_to_queue only receives GRANT_LOCK/RELEASE_LOCK"),
        }
    }

    /// §4.2's `process_queue`: promote at most one waiter per call.
    fn process_queue(state: &mut ServerLockState, lock_name: &str, effects: &mut Vec<ServerEffect>) {
        if state.current_owner.is_some() || state.queue.is_empty() {
            return;
        }
        let head = state.queue.remove(0);
        debug_assert_eq!(head.kind, RequestType::GrantLock);
        let owner = head.owner.clone();
        Self::set_owner(state, lock_name, Some(owner.clone()), effects);
        effects.push(ServerEffect::Send(Request::lock_granted(lock_name.to_string(), owner)));
    }

    fn set_owner(state: &mut ServerLockState, lock_name: &str, new: Option<Owner>, effects: &mut Vec<ServerEffect>) {
        let prev = state.current_owner.clone();
        match (&prev, &new) {
            (None, Some(o)) => effects.push(ServerEffect::Locked { name: lock_name.to_string(), owner: o.clone() }),
            (Some(o), None) => effects.push(ServerEffect::Unlocked { name: lock_name.to_string(), owner: o.clone() }),
            _ => {}
        }
        state.current_owner = new;
    }

    /// §4.2's `handle_view`: evict an owner or waiters whose member left
    /// the view, then run the queue-promotion pass.
    pub fn handle_view(&self, members: &[MemberAddress]) -> Vec<ServerEffect> {
        let mut effects = Vec::new();
        let mut state = self.state.lock().unwrap();
        if let Some(owner) = state.current_owner.clone() {
            if !members.contains(&owner.address) {
                Self::set_owner(&mut state, &self.lock_name, None, &mut effects);
            }
        }
        state.queue.retain(|q| members.contains(&q.owner.address));
        Self::process_queue(&mut state, &self.lock_name, &mut effects);
        effects
    }
}
