//! # lockfree-hash
//!
//! A lock-free concurrent hash table and the hazard-pointer reclamation
//! scheme it relies on, ported from Concurrency Kit's `p64_hashtable`.
//!
//! Entries are intrusive (the caller owns the node, embeds a
//! [`ht::HashEntry`] header, and implements [`ht::Node`]); the table only
//! ever links and unlinks the header's `(hash, next)` pair. Concurrent
//! readers protect the nodes they're traversing with hazard pointers from
//! [`hp`], so a concurrent remove can never free memory a reader still
//! holds.
//!
//! ## Module organization
//!
//! ### Foundation
//! - [`cc`] - bit manipulation and branch-prediction hints
//! - [`malloc`] - memory allocator abstraction
//! - [`pr`] - memory barriers
//! - [`mod@backoff`] - exponential backoff for contention management
//!
//! ### Core
//! - [`pair`] - the atomic `(hash, next)` pair the table's CAS operates on
//! - [`hp`] - hazard pointer memory reclamation
//! - [`ht`] - the lock-free hash table itself
//!
//! ### Collaborators
//! - [`rwlock`] - reader-writer lock, a sibling primitive not composed into
//!   the hash table

#![no_std]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::module_inception)]

extern crate alloc;

/// Compiler compatibility utilities: bit manipulation and branch hints.
pub mod cc;

/// Memory allocator abstraction.
pub mod malloc;

/// Memory barriers.
pub mod pr;

/// Exponential backoff for contention management.
pub mod backoff;

/// The atomic `(hash, next)` pair.
pub mod pair;

/// Hazard pointer memory reclamation.
pub mod hp;

/// The lock-free hash table.
pub mod ht;

/// Reader-writer lock.
pub mod rwlock;

pub use malloc::Allocator;
