//! # distlock
//!
//! The core of a distributed advisory-lock protocol that runs as a layer
//! inside a group-communication stack: members of a group cooperate to
//! serialize access to named mutual-exclusion locks, with contending
//! requesters queued fairly until the current holder releases or leaves.
//!
//! ## Components
//! - [`message`] — the six-message wire protocol and its codec (C1).
//! - [`owner`] — member/thread identity (C2).
//! - [`server_lock`] — the server-side arbitration state machine (C3).
//! - [`client_lock`] — the client-side blocking-mutex handle (C4).
//! - [`locking_layer`] — the registry and event dispatcher tying the above
//!   together (C5).
//! - [`policy`] — the pluggable routing hook deciding which peer hosts a
//!   lock's server state (C6).
//! - [`transport`] — the external message-passing interface the core
//!   depends on, plus an in-memory reference implementation.
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use distlock::locking_layer::LockingLayer;
//! use distlock::owner::MemberAddress;
//! use distlock::policy::ConsistentPeerLocator;
//! use distlock::transport::InMemoryTransport;
//!
//! let transport = InMemoryTransport::new();
//! let locator = Arc::new(ConsistentPeerLocator::new(vec![MemberAddress::from_str("a")]));
//! let layer = LockingLayer::new(transport.clone(), locator);
//! layer.set_local_address(MemberAddress::from_str("a"));
//! transport.register(MemberAddress::from_str("a"), &layer);
//!
//! layer.lock("resource");
//! // critical section
//! layer.unlock("resource");
//! ```

pub mod client_lock;
pub mod error;
pub mod locking_layer;
pub mod message;
pub mod owner;
pub mod policy;
pub mod server_lock;
pub mod transport;

pub use client_lock::{CancelToken, ClientLock};
pub use error::{LockApiError, ProtocolError};
pub use locking_layer::{Event, LockNotification, LockingLayer};
pub use message::{Request, RequestType};
pub use owner::{MemberAddress, Owner};
pub use policy::{CentralCoordinatorLocator, ConsistentPeerLocator, ServerLocator};
pub use server_lock::ServerLock;
pub use transport::{InMemoryTransport, Transport};
