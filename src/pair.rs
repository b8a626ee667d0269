//! Atomic `(hash, next)` pair: the 16-byte compare-and-swap unit the hash
//! table's correctness rests on.
//!
//! The original C implementation overlays `struct { uint64_t hash; void
//! *next; }` onto a `__int128` and issues a single `cmpxchg16b`. Stable Rust
//! has no portable 128-bit atomic type, so this module wraps
//! [`portable_atomic::AtomicU128`], a real, `no_std`-compatible crate that
//! provides a 128-bit CAS on stable across the targets CK itself supports,
//! behind a narrow interface: `load_acquire`, `cas_release`,
//! `fetch_or_next_relaxed`.
//!
//! The low bit of the `next` half is the REMOVE mark (see `ht`).

use core::ptr;
use portable_atomic::{AtomicU128, Ordering};

use crate::ht::HashEntry;

/// A snapshot of one bucket-slot's `(hash, next)` pair.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PairValue {
    pub hash: u64,
    pub next: *mut HashEntry,
}

impl PairValue {
    #[inline]
    pub const fn new(hash: u64, next: *mut HashEntry) -> Self {
        Self { hash, next }
    }

    #[inline]
    fn pack(self) -> u128 {
        (self.hash as u128) | ((self.next as usize as u128) << 64)
    }

    #[inline]
    fn unpack(raw: u128) -> Self {
        Self {
            hash: raw as u64,
            next: (raw >> 64) as usize as *mut HashEntry,
        }
    }
}

/// A 16-byte atomic cell holding `(hash, next)`.
///
/// Every head slot and every entry's own link field is one of these; a
/// parent's slot and its linked child are mutated together by a single
/// CAS on this type, which is what gives the structure its ABA defense
/// (a stale pointer can't slip back in without also matching the hash it
/// was originally linked under).
#[repr(transparent)]
pub struct Pair {
    raw: AtomicU128,
}

impl Pair {
    #[inline]
    pub fn new(hash: u64, next: *mut HashEntry) -> Self {
        Self {
            raw: AtomicU128::new(PairValue::new(hash, next).pack()),
        }
    }

    #[inline]
    pub fn empty() -> Self {
        Self::new(0, ptr::null_mut())
    }

    /// Overwrite the pair with a raw, non-atomic store. Only safe to call
    /// before the slot is visible to any other thread (e.g. initializing a
    /// node the caller is about to insert).
    #[inline]
    pub fn store_relaxed(&self, value: PairValue) {
        self.raw.store(value.pack(), Ordering::Relaxed);
    }

    #[inline]
    pub fn load_acquire(&self) -> PairValue {
        PairValue::unpack(self.raw.load(Ordering::Acquire))
    }

    #[inline]
    pub fn load_relaxed(&self) -> PairValue {
        PairValue::unpack(self.raw.load(Ordering::Relaxed))
    }

    /// Strong CAS with release-on-success / relaxed-on-failure ordering,
    /// matching the original's `__ATOMIC_RELEASE` insert CAS.
    #[inline]
    pub fn cas_release(&self, expected: PairValue, new: PairValue) -> Result<(), PairValue> {
        self.raw
            .compare_exchange(expected.pack(), new.pack(), Ordering::Release, Ordering::Relaxed)
            .map(|_| ())
            .map_err(PairValue::unpack)
    }

    /// Strong CAS with relaxed ordering on both outcomes, used by the
    /// physical-unlink step: the preceding `fetch_or_next_relaxed`
    /// logical-delete step is the real publication barrier.
    #[inline]
    pub fn cas_relaxed(&self, expected: PairValue, new: PairValue) -> Result<(), PairValue> {
        self.raw
            .compare_exchange(expected.pack(), new.pack(), Ordering::Relaxed, Ordering::Relaxed)
            .map(|_| ())
            .map_err(PairValue::unpack)
    }

    /// OR `mark` into the pointer half only, leaving `hash` untouched.
    /// Used for the logical-delete REMOVE mark, which is intentionally
    /// relaxed: the physical unlink CAS is the real publication point.
    #[inline]
    pub fn fetch_or_next_relaxed(&self, mark: usize) {
        self.raw.fetch_or((mark as u128) << 64, Ordering::Relaxed);
    }
}

unsafe impl Send for Pair {}
unsafe impl Sync for Pair {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_roundtrip() {
        let mut x = 7u8;
        let ptr = &mut x as *mut u8 as *mut HashEntry;
        let v = PairValue::new(0xDEAD_BEEF, ptr);
        assert_eq!(PairValue::unpack(v.pack()), v);
    }

    #[test]
    fn cas_release_succeeds_on_match() {
        let pair = Pair::empty();
        let new = PairValue::new(5, ptr::null_mut());
        assert!(pair.cas_release(PairValue::new(0, ptr::null_mut()), new).is_ok());
        assert_eq!(pair.load_acquire(), new);
    }

    #[test]
    fn cas_release_fails_on_mismatch() {
        let pair = Pair::new(1, ptr::null_mut());
        let err = pair
            .cas_release(PairValue::new(0, ptr::null_mut()), PairValue::new(9, ptr::null_mut()))
            .unwrap_err();
        assert_eq!(err, PairValue::new(1, ptr::null_mut()));
    }

    #[test]
    fn fetch_or_marks_pointer_half_only() {
        let pair = Pair::new(42, ptr::null_mut());
        pair.fetch_or_next_relaxed(1);
        let v = pair.load_relaxed();
        assert_eq!(v.hash, 42);
        assert_eq!(v.next as usize & 1, 1);
    }
}
