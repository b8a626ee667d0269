//! Portable memory barriers.
//!
//! Thin wrappers over `core::sync::atomic::fence` giving the rest of the
//! crate the same small fence vocabulary the original C used (`smp_rmb`,
//! `smp_wmb`-style names), so call sites read as intent rather than raw
//! `Ordering` variants.
//!
//! # Progress guarantees
//!
//! - **Wait-free**: fence and `stall` calls.
//! - **Lock-free**: everything built on top of them (CAS retry loops in
//!   `ht`, `hp`, `rwlock`).

use core::sync::atomic::{compiler_fence, fence, Ordering};

/// Compiler barrier only: prevents compiler reordering, no hardware fence.
#[inline(always)]
pub fn barrier() {
    compiler_fence(Ordering::SeqCst);
}

/// Acquire fence: operations before it cannot be reordered after it.
#[inline(always)]
pub fn fence_acquire() {
    fence(Ordering::Acquire);
}

/// Release fence: operations after it cannot be reordered before it.
#[inline(always)]
pub fn fence_release() {
    fence(Ordering::Release);
}

/// Acquire-release fence.
#[inline(always)]
pub fn fence_acqrel() {
    fence(Ordering::AcqRel);
}

/// Full sequentially-consistent fence.
#[inline(always)]
pub fn fence_memory() {
    fence(Ordering::SeqCst);
}

/// CPU pause hint for spin loops. Reduces power draw and contention in
/// tight retry loops.
#[inline(always)]
pub fn stall() {
    core::hint::spin_loop();
}
