//! End-to-end scenarios driven over the in-memory transport with real OS
//! threads, mirroring the synchronous, direct-assertion style of this
//! crate's own unit tests against individual locks.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use distlock::message::{encode_tagged, Request};
use distlock::owner::MemberAddress;
use distlock::policy::{ConsistentPeerLocator, ServerLocator};
use distlock::transport::InMemoryTransport;
use distlock::{Event, LockingLayer};

fn member(name: &str) -> MemberAddress {
    MemberAddress::from_str(name)
}

fn cluster(names: &[&str]) -> (Arc<InMemoryTransport>, Vec<Arc<LockingLayer>>) {
    let transport = InMemoryTransport::new();
    let locator: Arc<dyn ServerLocator> = Arc::new(ConsistentPeerLocator::new(vec![member("server")]));
    let layers = names
        .iter()
        .map(|name| {
            let layer = LockingLayer::new(transport.clone(), locator.clone());
            layer.set_local_address(member(name));
            transport.register(member(name), &layer);
            layer
        })
        .collect();
    (transport, layers)
}

/// S5 — same-owner retry: two `GRANT_LOCK` requests carrying the identical
/// owner (as a retried message would) while the lock is held elsewhere
/// collapse to a single queue entry, and the owner is granted exactly once
/// when the holder releases.
#[test]
fn s5_same_owner_retry_collapses_to_single_grant() {
    let (_transport, layers) = cluster(&["a", "d", "server"]);
    let (a, d, server) = (&layers[0], &layers[1], &layers[2]);

    d.lock("x");
    assert!(d.client_lock("x").is_acquired());

    // Register A's client-side handle first (without sending anything),
    // so the eventual LOCK_GRANTED has somewhere to land; then simulate a
    // message the transport delivered twice by injecting the identical
    // GRANT_LOCK request at the server twice, rather than racing two
    // threads (which would resolve to two distinct (address, thread_id)
    // owners, not a retry of the same one).
    let client_a = a.client_lock("x");
    let retried = Request::grant_lock("x", client_a.identity().clone(), 0, false);
    server.up(Event::Message(encode_tagged(&retried)));
    server.up(Event::Message(encode_tagged(&retried)));

    let (_, queue_len) = server.server_lock_snapshot().remove("x").expect("lock x exists at the server");
    assert_eq!(queue_len, 1, "duplicate GRANT_LOCK from the same owner must not double-enqueue");

    d.unlock("x");
    thread::sleep(Duration::from_millis(30));

    assert!(client_a.is_acquired());
}

/// Mutual exclusion invariant (§8, invariant 4): across a small cluster,
/// only one member ever observes `acquired == true` for a given name at a
/// time, even under concurrent contention.
#[test]
fn mutual_exclusion_holds_under_concurrent_contention() {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    let (_transport, layers) = cluster(&["a", "b", "c", "server"]);
    let in_critical_section = Arc::new(AtomicBool::new(false));
    let violations = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = layers[..3]
        .iter()
        .cloned()
        .map(|layer| {
            let in_cs = in_critical_section.clone();
            let violations = violations.clone();
            thread::spawn(move || {
                layer.lock("shared");
                if in_cs.swap(true, Ordering::SeqCst) {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_millis(15));
                in_cs.store(false, Ordering::SeqCst);
                layer.unlock("shared");
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(violations.load(Ordering::SeqCst), 0);
}

/// View changes that remove a waiter (not the owner) simply drop that
/// waiter from the queue without disturbing the current holder.
#[test]
fn view_change_drops_departed_waiter_without_disturbing_holder() {
    let (transport, layers) = cluster(&["a", "b", "server"]);
    let (a, b) = (&layers[0], &layers[1]);

    a.lock("x");
    let b2 = b.clone();
    let waiter = thread::spawn(move || b2.try_lock_timeout(Duration::from_millis(300)));
    thread::sleep(Duration::from_millis(30));

    // B leaves the view while still queued.
    transport.broadcast_view(vec![member("a"), member("server")]);

    assert!(a.client_lock("x").is_acquired());
    a.unlock("x");

    // B was evicted from the queue before A released, so it must not have
    // been granted: its bounded wait times out and returns false.
    assert!(!waiter.join().unwrap().unwrap());
}
