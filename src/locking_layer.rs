//! # locking_layer
//!
//! The registry and event dispatcher (component C5): holds every
//! [`ServerLock`] and [`ClientLock`] this peer is responsible for, and
//! routes events down (API calls from the application) and up (incoming
//! protocol traffic and view changes from the transport).

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::client_lock::{CancelToken, ClientLock, ClientLockLink};
use crate::error::LockApiError;
use crate::message::{decode_tagged, encode_tagged, Request, RequestType};
use crate::owner::{MemberAddress, Owner, ThreadIdRegistry};
use crate::policy::ServerLocator;
use crate::server_lock::{ServerEffect, ServerLock};
use crate::transport::{SendFlags, Transport};

/// Events delivered to [`LockingLayer::up`] from the transport: incoming
/// protocol messages, view changes, and local-address assignment.
#[derive(Debug, Clone)]
pub enum Event {
    Message(Vec<u8>),
    ViewChange(Vec<MemberAddress>),
    SetLocalAddress(MemberAddress),
}

/// Subscriber to the four lock lifecycle notifications (§6).
///
/// Every method has a no-op default so a listener only needs to override
/// what it cares about. A panicking listener is caught and logged by the
/// layer; it never aborts the rest of the dispatch (§4.4, §7).
pub trait LockNotification: Send + Sync {
    fn lock_created(&self, _name: &str) {}
    fn lock_deleted(&self, _name: &str) {}
    fn locked(&self, _name: &str, _owner: &Owner) {}
    fn unlocked(&self, _name: &str, _owner: &Owner) {}
}

struct NamedServerLocks {
    locks: Mutex<HashMap<String, Arc<ServerLock>>>,
}

/// Registry of server locks + client locks for one peer, plus event
/// dispatch and notification fan-out.
pub struct LockingLayer {
    local_address: Mutex<Option<MemberAddress>>,
    thread_ids: ThreadIdRegistry,
    server_locks: NamedServerLocks,
    client_locks: Mutex<HashMap<String, HashMap<Owner, Arc<ClientLock>>>>,
    listeners: Mutex<Vec<Arc<dyn LockNotification>>>,
    transport: Arc<dyn Transport>,
    locator: Arc<dyn ServerLocator>,
    bypass_bundling: bool,
}

impl LockingLayer {
    pub fn new(transport: Arc<dyn Transport>, locator: Arc<dyn ServerLocator>) -> Arc<Self> {
        Self::with_bundling(transport, locator, true)
    }

    /// `bypass_bundling` is the one configuration knob named in §6,
    /// defaulting to `true`.
    pub fn with_bundling(transport: Arc<dyn Transport>, locator: Arc<dyn ServerLocator>, bypass_bundling: bool) -> Arc<Self> {
        Arc::new(Self {
            local_address: Mutex::new(None),
            thread_ids: ThreadIdRegistry::new(),
            server_locks: NamedServerLocks { locks: Mutex::new(HashMap::new()) },
            client_locks: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            transport,
            locator,
            bypass_bundling,
        })
    }

    fn send_flags(&self) -> SendFlags {
        SendFlags { bypass_bundling: self.bypass_bundling }
    }

    // ---- identity -----------------------------------------------------

    pub fn set_local_address(&self, address: MemberAddress) {
        *self.local_address.lock().unwrap() = Some(address);
    }

    pub fn local_address(&self) -> Option<MemberAddress> {
        self.local_address.lock().unwrap().clone()
    }

    fn current_owner(&self) -> Owner {
        let address = self
            .local_address
            .lock()
            .unwrap()
            .clone()
            .expect("local address must be set via set_local_address before locking");
        Owner::new(address, self.thread_ids.current())
    }

    // ---- notifications --------------------------------------------------

    pub fn subscribe(&self, listener: Arc<dyn LockNotification>) {
        self.listeners.lock().unwrap().push(listener);
    }

    fn fire(&self, call: impl Fn(&dyn LockNotification)) {
        let snapshot: Vec<Arc<dyn LockNotification>> = self.listeners.lock().unwrap().clone();
        for listener in snapshot {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| call(listener.as_ref())));
            if result.is_err() {
                error!("lock notification listener panicked; continuing dispatch");
            }
        }
    }

    fn fire_lock_created(&self, name: &str) {
        self.fire(|l| l.lock_created(name));
    }

    fn fire_lock_deleted(&self, name: &str) {
        self.fire(|l| l.lock_deleted(name));
    }

    fn fire_locked(&self, name: &str, owner: &Owner) {
        self.fire(|l| l.locked(name, owner));
    }

    fn fire_unlocked(&self, name: &str, owner: &Owner) {
        self.fire(|l| l.unlocked(name, owner));
    }

    fn apply_effects(&self, effects: Vec<ServerEffect>) {
        for effect in effects {
            match effect {
                ServerEffect::Send(response) => {
                    let _ = self.send_direct(response.owner.address.clone(), response);
                }
                ServerEffect::Locked { name, owner } => self.fire_locked(&name, &owner),
                ServerEffect::Unlocked { name, owner } => self.fire_unlocked(&name, &owner),
            }
        }
    }

    fn send_direct(&self, destination: MemberAddress, request: Request) -> Result<(), String> {
        let payload = encode_tagged(&request);
        self.transport.send(Some(destination), payload, self.send_flags()).map_err(|e| {
            error!(lock = %request.lock_name, error = %e, "send failure for protocol response");
            e
        })
    }

    // ---- server-side registry ------------------------------------------

    fn get_or_create_server_lock(&self, name: &str) -> (Arc<ServerLock>, bool) {
        let mut locks = self.server_locks.locks.lock().unwrap();
        if let Some(existing) = locks.get(name) {
            return (existing.clone(), false);
        }
        let created = Arc::new(ServerLock::new(name));
        locks.insert(name.to_string(), created.clone());
        (created, true)
    }

    /// Look up a server lock without creating one. A `RELEASE_LOCK` for a
    /// name this peer has never seen a `GRANT_LOCK`/`CREATE_LOCK` for must
    /// not spin up a new entry (§3 Lifecycle).
    fn existing_server_lock(&self, name: &str) -> Option<Arc<ServerLock>> {
        self.server_locks.locks.lock().unwrap().get(name).cloned()
    }

    fn drop_server_lock_if_empty(&self, name: &str, lock: &Arc<ServerLock>) -> bool {
        if !lock.is_free_and_empty() {
            return false;
        }
        let mut locks = self.server_locks.locks.lock().unwrap();
        if let Some(current) = locks.get(name) {
            if Arc::ptr_eq(current, lock) {
                locks.remove(name);
                return true;
            }
        }
        false
    }

    /// Multicast `CREATE_LOCK`/`DELETE_LOCK` to whatever backups the policy
    /// names for `name` (§4.6). A no-op under a locator whose `replicas()`
    /// is empty, e.g. [`crate::policy::ConsistentPeerLocator`].
    fn replicate_create(&self, name: &str, owner: Owner) {
        for backup in self.locator.replicas(name) {
            let _ = self.send_direct(backup, Request::create_lock(name, owner.clone()));
        }
    }

    fn replicate_delete(&self, name: &str) {
        for backup in self.locator.replicas(name) {
            let _ = self.send_direct(backup, Request::delete_lock(name, Owner::nil()));
        }
    }

    /// Read-only snapshot for a management surface (§6): current owner and
    /// queue length per server lock name.
    pub fn server_lock_snapshot(&self) -> HashMap<String, (Option<Owner>, usize)> {
        let locks = self.server_locks.locks.lock().unwrap();
        locks
            .iter()
            .map(|(name, lock)| (name.clone(), (lock.current_owner(), lock.queue_len())))
            .collect()
    }

    // ---- client-side registry and the five lock operations -------------

    fn make_link(self: &Arc<Self>, name: &str) -> Arc<ClientLockLink> {
        let _ = name;
        let w_grant = Arc::downgrade(self);
        let w_release = Arc::downgrade(self);
        let w_remove = Arc::downgrade(self);
        let w_deleted = Arc::downgrade(self);
        Arc::new(ClientLockLink {
            send_grant: Box::new(move |name, owner, timeout, is_trylock| match w_grant.upgrade() {
                Some(layer) => layer.send_grant_lock_request(name, owner, timeout, is_trylock),
                None => Err("locking layer dropped".to_string()),
            }),
            send_release: Box::new(move |name, owner| match w_release.upgrade() {
                Some(layer) => layer.send_release_lock_request(name, owner),
                None => Err("locking layer dropped".to_string()),
            }),
            remove_self: Box::new(move |name, owner| {
                if let Some(layer) = w_remove.upgrade() {
                    layer.remove_client_lock(name, owner);
                }
            }),
            notify_deleted: Box::new(move |name| {
                if let Some(layer) = w_deleted.upgrade() {
                    layer.fire_lock_deleted(name);
                }
            }),
        })
    }

    /// The pluggable routing hook (§4.6): send a `GRANT_LOCK` request
    /// wherever the policy says this lock's server state lives.
    fn send_grant_lock_request(&self, name: &str, owner: Owner, timeout: u64, is_trylock: bool) -> Result<(), String> {
        let destination = self.locator.route(name);
        let request = Request::grant_lock(name, owner, timeout, is_trylock);
        self.send_direct(destination, request)
    }

    fn send_release_lock_request(&self, name: &str, owner: Owner) -> Result<(), String> {
        let destination = self.locator.route(name);
        let request = Request::release_lock(name, owner);
        self.send_direct(destination, request)
    }

    fn remove_client_lock(&self, name: &str, owner: &Owner) {
        let mut map = self.client_locks.lock().unwrap();
        if let Some(per_name) = map.get_mut(name) {
            per_name.remove(owner);
            if per_name.is_empty() {
                map.remove(name);
            }
        }
    }

    /// `LOCK(info)`'s handle factory: look up or create the `ClientLock`
    /// for `(name, current_owner())`.
    pub fn client_lock(self: &Arc<Self>, name: &str) -> Arc<ClientLock> {
        let owner = self.current_owner();
        let mut map = self.client_locks.lock().unwrap();
        let per_name = map.entry(name.to_string()).or_default();
        if let Some(existing) = per_name.get(&owner) {
            return existing.clone();
        }
        let link = self.make_link(name);
        let created = Arc::new(ClientLock::new(name, owner.clone(), link));
        per_name.insert(owner, created.clone());
        created
    }

    /// Blocking `lock()`.
    pub fn lock(self: &Arc<Self>, name: &str) {
        self.client_lock(name).lock();
    }

    /// Cancellable `lock_interruptibly()`.
    pub fn lock_interruptibly(self: &Arc<Self>, name: &str) -> Result<(), LockApiError> {
        self.client_lock(name).lock_interruptibly()
    }

    /// Non-blocking `try_lock()`.
    pub fn try_lock(self: &Arc<Self>, name: &str) -> bool {
        self.client_lock(name).try_lock()
    }

    /// Bounded `try_lock(timeout)`.
    pub fn try_lock_timeout(self: &Arc<Self>, name: &str, timeout: Duration) -> Result<bool, LockApiError> {
        self.client_lock(name).try_lock_timeout(timeout)
    }

    /// `UNLOCK(info)`: look up without creating; no-op if absent.
    pub fn unlock(&self, name: &str) {
        let owner = self.current_owner();
        let existing = {
            let map = self.client_locks.lock().unwrap();
            map.get(name).and_then(|per_name| per_name.get(&owner)).cloned()
        };
        if let Some(client_lock) = existing {
            client_lock.unlock();
        }
    }

    /// A cancellation handle for an in-flight `lock_interruptibly`/
    /// `try_lock(timeout)` call on this thread's handle for `name`, if one
    /// exists. Firing it interrupts the wait (§8 S6).
    pub fn cancel_token(&self, name: &str) -> Option<CancelToken> {
        let owner = self.current_owner();
        let map = self.client_locks.lock().unwrap();
        map.get(name).and_then(|per_name| per_name.get(&owner)).map(|l| l.cancel_token())
    }

    /// `UNLOCK_ALL`: snapshot every `ClientLock` under the registry
    /// monitor, then unlock each outside it to avoid deadlocking with the
    /// up-path.
    pub fn unlock_all(&self) {
        let snapshot: Vec<Arc<ClientLock>> = {
            let map = self.client_locks.lock().unwrap();
            map.values().flat_map(|per_name| per_name.values().cloned()).collect()
        };
        for client_lock in snapshot {
            client_lock.unlock();
        }
    }

    // ---- view changes (shared by down-path and up-path) -----------------

    pub fn view_change(&self, members: Vec<MemberAddress>) {
        let snapshot: Vec<(String, Arc<ServerLock>)> = {
            let locks = self.server_locks.locks.lock().unwrap();
            locks.iter().map(|(n, l)| (n.clone(), l.clone())).collect()
        };
        for (name, lock) in snapshot {
            let effects = lock.handle_view(&members);
            self.apply_effects(effects);
            if self.drop_server_lock_if_empty(&name, &lock) {
                self.replicate_delete(&name);
            }
        }
    }

    // ---- up-path: incoming protocol traffic -----------------------------

    pub fn up(&self, event: Event) {
        match event {
            Event::Message(bytes) => self.handle_incoming_message(&bytes),
            Event::ViewChange(members) => self.view_change(members),
            Event::SetLocalAddress(addr) => self.set_local_address(addr),
        }
    }

    fn handle_incoming_message(&self, bytes: &[u8]) {
        let request = match decode_tagged(bytes) {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "dropping undecodable protocol message");
                return;
            }
        };
        match request.kind {
            RequestType::GrantLock => self.handle_grant_lock(request),
            RequestType::ReleaseLock => self.handle_release_lock(request),
            RequestType::LockGranted => self.dispatch_to_client(&request, |c| c.on_lock_granted()),
            RequestType::LockDenied => self.dispatch_to_client(&request, |c| c.on_lock_denied()),
            RequestType::CreateLock => self.install_replicated_lock(request),
            RequestType::DeleteLock => self.remove_replicated_lock(&request.lock_name),
        }
    }

    /// A `GRANT_LOCK` creates the server lock on first contact (§3
    /// Lifecycle), so it always goes through the get-or-create path.
    fn handle_grant_lock(&self, request: Request) {
        let (lock, created) = self.get_or_create_server_lock(&request.lock_name);
        if created {
            self.fire_lock_created(&request.lock_name);
        }
        self.dispatch_server_request(&lock, request);
        if created {
            if let Some(owner) = lock.current_owner() {
                self.replicate_create(lock.lock_name(), owner);
            }
        }
        if self.drop_server_lock_if_empty(lock.lock_name(), &lock) {
            self.replicate_delete(lock.lock_name());
        }
    }

    /// A `RELEASE_LOCK` for a lock name this peer has no server state for
    /// is stale traffic and is silently dropped (§3 Lifecycle, §9): it must
    /// never spin up a `ServerLock` just to immediately discard it.
    fn handle_release_lock(&self, request: Request) {
        let Some(lock) = self.existing_server_lock(&request.lock_name) else {
            debug!(lock = %request.lock_name, owner = %request.owner, "release for unknown server lock dropped");
            return;
        };
        self.dispatch_server_request(&lock, request);
        if self.drop_server_lock_if_empty(lock.lock_name(), &lock) {
            self.replicate_delete(lock.lock_name());
        }
    }

    fn dispatch_server_request(&self, lock: &Arc<ServerLock>, request: Request) {
        let lock_name = request.lock_name.clone();
        match lock.handle_request(request) {
            Ok(effects) => self.apply_effects(effects),
            Err(e) => warn!(lock = %lock_name, error = %e, "dropping request of unexpected type"),
        }
    }

    fn dispatch_to_client(&self, request: &Request, op: impl FnOnce(&ClientLock)) {
        let client_lock = {
            let map = self.client_locks.lock().unwrap();
            map.get(&request.lock_name).and_then(|per_name| per_name.get(&request.owner)).cloned()
        };
        match client_lock {
            Some(c) => op(&c),
            None => debug!(lock = %request.lock_name, owner = %request.owner, "response for unknown client lock dropped"),
        }
    }

    fn install_replicated_lock(&self, request: Request) {
        let mut locks = self.server_locks.locks.lock().unwrap();
        locks.insert(request.lock_name.clone(), Arc::new(ServerLock::with_owner(request.lock_name.clone(), request.owner)));
        drop(locks);
        self.fire_lock_created(&request.lock_name);
    }

    fn remove_replicated_lock(&self, name: &str) {
        self.server_locks.locks.lock().unwrap().remove(name);
    }
}
