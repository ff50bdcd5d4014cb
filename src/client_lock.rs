//! # client_lock
//!
//! The client-side lock handle (component C4): a standard blocking-mutex
//! contract (`lock`, `lock_interruptibly`, `try_lock`, `try_lock(timeout)`,
//! `unlock`) implemented on top of async request/response messaging with a
//! remote server replica.
//!
//! Each `ClientLock` is a monitor (`Mutex` + `Condvar`, the idiom this
//! crate's teacher uses throughout its own blocking lock manager) exposing
//! three outcomes through one condition variable: acquired, denied, or
//! still-waiting.
//!
//! Rust has no `Thread.interrupt()` analogue. This crate models
//! cancellation as an explicit [`CancelToken`] a caller can fire from
//! another thread to unblock a waiter — the same atomic-flag cancellation
//! idiom used across this corpus's other cancellable lock/mutex
//! implementations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::LockApiError;
use crate::owner::Owner;

/// A cooperative cancellation flag for a waiting [`ClientLock`] call.
///
/// Firing a token wakes any thread waiting inside `lock_interruptibly` or
/// `try_lock(timeout)` on this handle; `lock()` observes the same flag but
/// absorbs it (§4.3, §7).
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn fire(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_fired(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Dependency-injected collaborators a `ClientLock` needs but must not own
/// a cyclic reference to (§9): sending requests to the server, and
/// deregistering itself from the locking layer's registry on unlock.
pub struct ClientLockLink {
    pub send_grant: Box<dyn Fn(&str, Owner, u64, bool) -> Result<(), String> + Send + Sync>,
    pub send_release: Box<dyn Fn(&str, Owner) -> Result<(), String> + Send + Sync>,
    pub remove_self: Box<dyn Fn(&str, &Owner) + Send + Sync>,
    pub notify_deleted: Box<dyn Fn(&str) + Send + Sync>,
}

#[derive(Debug, Default)]
struct ClientLockState {
    owner: Option<Owner>,
    acquired: bool,
    denied: bool,
    timeout: u64,
    is_trylock: bool,
}

/// Per-(peer, lock_name, owner) requester-side handle.
pub struct ClientLock {
    name: String,
    identity: Owner,
    link: Arc<ClientLockLink>,
    state: Mutex<ClientLockState>,
    condvar: Condvar,
    cancel: CancelToken,
}

impl ClientLock {
    pub fn new(name: impl Into<String>, identity: Owner, link: Arc<ClientLockLink>) -> Self {
        Self {
            name: name.into(),
            identity,
            link,
            state: Mutex::new(ClientLockState::default()),
            condvar: Condvar::new(),
            cancel: CancelToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> &Owner {
        &self.identity
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_acquired(&self) -> bool {
        self.state.lock().unwrap().acquired
    }

    pub fn is_denied(&self) -> bool {
        self.state.lock().unwrap().denied
    }

    /// Up-path handler: the server granted this owner's request.
    ///
    /// Idempotent: re-delivery of `LOCK_GRANTED` for an already-acquired
    /// owner just re-wakes waiters, per §4.3. A grant that arrives with no
    /// request in flight (the caller already gave up on timeout or
    /// cancellation, per S3) is spurious: it is immediately retracted with
    /// a forced `RELEASE_LOCK` rather than left to silently "acquire" a
    /// lock nobody is waiting to use.
    pub fn on_lock_granted(&self) {
        let spurious = {
            let mut state = self.state.lock().unwrap();
            if state.owner.is_none() {
                true
            } else {
                state.acquired = true;
                self.condvar.notify_all();
                false
            }
        };
        if spurious {
            self.unlock_internal(true);
        }
    }

    /// Up-path handler: the server denied a non-blocking `try_lock`.
    pub fn on_lock_denied(&self) {
        let mut state = self.state.lock().unwrap();
        state.denied = true;
        self.condvar.notify_all();
    }

    /// `lock()` — blocks until acquired; cancellation is absorbed.
    pub fn lock(&self) {
        self.acquire(false).expect("lock() never returns Err");
    }

    /// `lock_interruptibly()` — blocks until acquired, propagating
    /// cancellation fired before resolution.
    pub fn lock_interruptibly(&self) -> Result<(), LockApiError> {
        self.acquire(true)
    }

    fn acquire(&self, propagate_cancel: bool) -> Result<(), LockApiError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.acquired {
                return Ok(());
            }
            state.owner = Some(self.identity.clone());
            state.is_trylock = false;
            state.timeout = 0;
        }
        // The monitor must not be held across this call: a synchronous
        // transport may deliver LOCK_GRANTED back to this same handle
        // before send_grant returns, and on_lock_granted() re-locks it.
        let sent = (self.link.send_grant)(&self.name, self.identity.clone(), 0, false);

        let mut state = self.state.lock().unwrap();
        if let Err(e) = sent {
            if propagate_cancel {
                state.owner = None;
                drop(state);
                self.cancel.clear();
                return Err(LockApiError::SendFailed(e));
            }
            // lock() never returns Err, so there is nothing to report the
            // failure through; the transport has already logged it, and we
            // keep waiting as if the request were still in flight.
        }

        loop {
            if state.acquired {
                self.cancel.clear();
                return Ok(());
            }
            if self.cancel.is_fired() {
                if propagate_cancel {
                    drop(state);
                    self.unlock_internal(true);
                    self.cancel.clear();
                    return Err(LockApiError::Interrupted);
                }
                // lock(): absorb and keep waiting.
            }
            let (next, _timeout) = self
                .condvar
                .wait_timeout(state, Duration::from_millis(50))
                .unwrap();
            state = next;
        }
    }

    /// `try_lock()` — non-blocking.
    pub fn try_lock(&self) -> bool {
        self.acquire_try(0, false).unwrap_or(false)
    }

    /// `try_lock(duration)` — waits up to `timeout`, retracting the request
    /// on expiry.
    pub fn try_lock_timeout(&self, timeout: Duration) -> Result<bool, LockApiError> {
        self.acquire_try(timeout.as_millis() as u64, true)
    }

    fn acquire_try(&self, timeout_ms: u64, use_timeout: bool) -> Result<bool, LockApiError> {
        let already_settled = {
            let mut state = self.state.lock().unwrap();
            if state.denied {
                return Ok(false);
            }
            if !state.acquired {
                state.is_trylock = true;
                state.timeout = timeout_ms;
                state.owner = Some(self.identity.clone());
                false
            } else {
                true
            }
        };

        // Dropped before send_grant for the same reason as in acquire(): a
        // synchronous transport can deliver the response before this call
        // returns, and the handler re-locks self.state.
        let sent = if already_settled {
            Ok(())
        } else {
            (self.link.send_grant)(&self.name, self.identity.clone(), timeout_ms, true)
        };

        let mut state = self.state.lock().unwrap();
        if let Err(e) = sent {
            if use_timeout {
                state.owner = None;
                drop(state);
                self.cancel.clear();
                return Err(LockApiError::SendFailed(e));
            }
            // try_lock() has no bound to report the failure through.
        }

        let deadline = if use_timeout { Some(Instant::now() + Duration::from_millis(timeout_ms)) } else { None };

        loop {
            if state.acquired || state.denied {
                break;
            }
            if self.cancel.is_fired() {
                drop(state);
                self.unlock_internal(true);
                self.cancel.clear();
                return Err(LockApiError::Interrupted);
            }
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let remaining = deadline - now;
                let wait_for = remaining.min(Duration::from_millis(50));
                let (next, _timeout) = self.condvar.wait_timeout(state, wait_for).unwrap();
                state = next;
            } else {
                let (next, _timeout) = self.condvar.wait_timeout(state, Duration::from_millis(50)).unwrap();
                state = next;
            }
        }

        let ok = state.acquired && !state.denied;
        drop(state);
        if !ok {
            // Covers both outright denial and the timeout-lost-to-race
            // case where a grant may still arrive after we gave up.
            self.unlock_internal(true);
        }
        self.cancel.clear();
        Ok(ok)
    }

    /// `unlock()` — §4.3's `_unlock(force=false)`.
    pub fn unlock(&self) {
        self.unlock_internal(false);
    }

    fn unlock_internal(&self, force: bool) {
        let mut state = self.state.lock().unwrap();
        if !force && !state.acquired && !state.denied {
            return;
        }
        if let Some(owner) = state.owner.clone() {
            let _ = (self.link.send_release)(&self.name, owner);
        } else if force {
            let _ = (self.link.send_release)(&self.name, self.identity.clone());
        }
        state.acquired = false;
        state.denied = false;
        state.owner = None;
        self.condvar.notify_all();
        drop(state);
        (self.link.remove_self)(&self.name, &self.identity);
        (self.link.notify_deleted)(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::owner::MemberAddress;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn noop_link() -> (Arc<ClientLockLink>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel();
        let tx_grant = tx.clone();
        let tx_release = tx.clone();
        let link = ClientLockLink {
            send_grant: Box::new(move |name, owner, timeout, is_trylock| {
                let _ = tx_grant.send(format!("grant:{name}:{owner}:{timeout}:{is_trylock}"));
                Ok(())
            }),
            send_release: Box::new(move |name, owner| {
                let _ = tx_release.send(format!("release:{name}:{owner}"));
                Ok(())
            }),
            remove_self: Box::new(|_, _| {}),
            notify_deleted: Box::new(|_| {}),
        };
        (Arc::new(link), rx)
    }

    fn owner(name: &str) -> Owner {
        Owner::new(MemberAddress::from_str(name), 7)
    }

    #[test]
    fn lock_blocks_until_granted() {
        let (link, rx) = noop_link();
        let lock = Arc::new(ClientLock::new("x", owner("a"), link));
        assert_eq!(rx.try_recv().unwrap_err(), mpsc::TryRecvError::Empty);

        let l2 = lock.clone();
        let handle = std::thread::spawn(move || l2.lock());
        // A GRANT_LOCK should have been sent before we grant it back.
        let msg = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(msg.starts_with("grant:x:a/7:0:false"));

        lock.on_lock_granted();
        handle.join().unwrap();
        assert!(lock.is_acquired());
    }

    #[test]
    fn try_lock_returns_false_on_denied() {
        let (link, _rx) = noop_link();
        let lock = ClientLock::new("x", owner("a"), link);
        let l = Arc::new(lock);
        let l2 = l.clone();
        let handle = std::thread::spawn(move || l2.try_lock());
        std::thread::sleep(Duration::from_millis(20));
        l.on_lock_denied();
        assert!(!handle.join().unwrap());
        assert!(l.is_denied());
    }

    #[test]
    fn try_lock_timeout_expires_and_sends_release() {
        let (link, rx) = noop_link();
        let lock = ClientLock::new("x", owner("a"), link);
        let result = lock.try_lock_timeout(Duration::from_millis(30)).unwrap();
        assert!(!result);
        let messages: Vec<_> = rx.try_iter().collect();
        assert!(messages.iter().any(|m| m.starts_with("grant:")));
        assert!(messages.iter().any(|m| m.starts_with("release:")));
    }

    #[test]
    fn try_lock_timeout_succeeds_if_granted_before_deadline() {
        let (link, _rx) = noop_link();
        let lock = Arc::new(ClientLock::new("x", owner("a"), link));
        let l2 = lock.clone();
        let handle = std::thread::spawn(move || l2.try_lock_timeout(Duration::from_millis(200)));
        std::thread::sleep(Duration::from_millis(20));
        lock.on_lock_granted();
        assert!(handle.join().unwrap().unwrap());
    }

    #[test]
    fn lock_interruptibly_propagates_cancellation_before_grant() {
        let (link, rx) = noop_link();
        let lock = Arc::new(ClientLock::new("x", owner("a"), link));
        let token = lock.cancel_token();
        let l2 = lock.clone();
        let handle = std::thread::spawn(move || l2.lock_interruptibly());
        std::thread::sleep(Duration::from_millis(20));
        token.fire();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(LockApiError::Interrupted)));
        let messages: Vec<_> = rx.try_iter().collect();
        assert!(messages.iter().any(|m| m.starts_with("release:")));
    }

    #[test]
    fn lock_interruptibly_grant_wins_if_it_arrives_first() {
        let (link, _rx) = noop_link();
        let lock = Arc::new(ClientLock::new("x", owner("a"), link));
        let token = lock.cancel_token();
        let l2 = lock.clone();
        let handle = std::thread::spawn(move || l2.lock_interruptibly());
        std::thread::sleep(Duration::from_millis(10));
        lock.on_lock_granted();
        std::thread::sleep(Duration::from_millis(10));
        token.fire();
        let result = handle.join().unwrap();
        assert!(result.is_ok());
        assert!(lock.is_acquired());
    }

    #[test]
    fn unlock_is_noop_when_never_requested() {
        let (link, rx) = noop_link();
        let lock = ClientLock::new("x", owner("a"), link);
        lock.unlock();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn repeated_grant_after_acquired_is_idempotent() {
        let (link, _rx) = noop_link();
        let lock = Arc::new(ClientLock::new("x", owner("a"), link));
        let l2 = lock.clone();
        let handle = std::thread::spawn(move || l2.lock());
        std::thread::sleep(Duration::from_millis(20));
        lock.on_lock_granted();
        handle.join().unwrap();
        lock.on_lock_granted();
        assert!(lock.is_acquired());
    }

    #[test]
    fn late_grant_after_timeout_is_retracted_as_spurious() {
        let (link, rx) = noop_link();
        let lock = ClientLock::new("x", owner("a"), link);
        assert!(!lock.try_lock_timeout(Duration::from_millis(20)).unwrap());
        let _ = rx.try_iter().count(); // drain grant + first release
        lock.on_lock_granted();
        assert!(!lock.is_acquired());
        let messages: Vec<_> = rx.try_iter().collect();
        assert!(messages.iter().any(|m| m.starts_with("release:")));
    }

    #[test]
    fn remove_self_and_notify_deleted_fire_once_per_unlock() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c1 = calls.clone();
        let c2 = calls.clone();
        let link = ClientLockLink {
            send_grant: Box::new(|_, _, _, _| Ok(())),
            send_release: Box::new(|_, _| Ok(())),
            remove_self: Box::new(move |_, _| {
                c1.fetch_add(1, Ordering::SeqCst);
            }),
            notify_deleted: Box::new(move |_| {
                c2.fetch_add(1, Ordering::SeqCst);
            }),
        };
        let lock = Arc::new(ClientLock::new("x", owner("a"), Arc::new(link)));
        let l2 = lock.clone();
        let handle = std::thread::spawn(move || l2.lock());
        std::thread::sleep(Duration::from_millis(20));
        lock.on_lock_granted();
        handle.join().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        lock.unlock();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
