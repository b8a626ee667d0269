//! Hazard pointer memory reclamation (the Hazard Pointer Domain, HPD).
//!
//! A process-wide registry of per-thread reservation slots. A thread
//! publishes the address of a shared object it is about to dereference;
//! the retirement path checks those publications before reclaiming memory.
//! See `ht` for the one consumer of this protocol in this crate.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::pr;

/// Hazard pointer slots per registered thread.
///
/// Matches the at-most-three live hazards a chain traversal needs
/// (parent, current, next) with one spare.
pub const HP_PER_THREAD: usize = 4;

/// Retirement-list length that triggers a scan.
const SCAN_THRESHOLD: usize = 2 * HP_PER_THREAD;

/// One thread's hazard reservation record, linked into the domain's
/// registry for the lifetime of the process (records are never
/// deallocated, only recycled (reclaiming a reclaimer's own bookkeeping
/// would need its own reclamation scheme).
#[repr(C)]
struct HazardRecord {
    hazards: [AtomicPtr<()>; HP_PER_THREAD],
    next: AtomicPtr<HazardRecord>,
    active: AtomicUsize,
    retired: UnsafeCell<Vec<Retired>>,
}

struct Retired {
    ptr: *mut (),
    deleter: unsafe fn(*mut ()),
}

impl HazardRecord {
    fn new() -> Self {
        Self {
            hazards: core::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            next: AtomicPtr::new(ptr::null_mut()),
            active: AtomicUsize::new(1),
            retired: UnsafeCell::new(Vec::new()),
        }
    }
}

/// The process-wide hazard pointer registry.
///
/// One `HazardDomain` is shared by every thread that touches a given
/// [`crate::ht::Table`]; each thread calls [`HazardDomain::register`]
/// once to obtain its own [`HazardGuard`].
pub struct HazardDomain {
    records: AtomicPtr<HazardRecord>,
}

impl HazardDomain {
    /// Create an empty domain with no registered threads.
    pub const fn new() -> Self {
        Self {
            records: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Register the calling thread, returning a guard that owns its
    /// hazard slots until dropped.
    pub fn register(&self) -> HazardGuard<'_> {
        let record = Box::into_raw(Box::new(HazardRecord::new()));
        loop {
            let head = self.records.load(Ordering::Relaxed);
            unsafe {
                (*record).next.store(head, Ordering::Relaxed);
            }
            if self
                .records
                .compare_exchange_weak(head, record, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        HazardGuard { domain: self, record }
    }

    fn collect_hazards(&self) -> Vec<*mut ()> {
        let mut hazards = Vec::new();
        let mut current = self.records.load(Ordering::Acquire);
        while !current.is_null() {
            let record = unsafe { &*current };
            if record.active.load(Ordering::Acquire) != 0 {
                for hp in &record.hazards {
                    let ptr = hp.load(Ordering::Acquire);
                    if !ptr.is_null() {
                        hazards.push(ptr);
                    }
                }
            }
            current = record.next.load(Ordering::Acquire);
        }
        hazards
    }
}

impl Default for HazardDomain {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for HazardDomain {}
unsafe impl Sync for HazardDomain {}

/// A thread's registration in a [`HazardDomain`].
///
/// Dropping the guard clears its publications and marks the record
/// inactive (the backing allocation is recycled by a future
/// [`HazardDomain::register`] call on the same domain, not freed).
pub struct HazardGuard<'d> {
    domain: &'d HazardDomain,
    record: *mut HazardRecord,
}

impl<'d> HazardGuard<'d> {
    #[inline]
    fn record(&self) -> &HazardRecord {
        unsafe { &*self.record }
    }

    /// Publish `ptr` in `slot`, ensuring the publication is visible to a
    /// concurrent scan before returning.
    ///
    /// Exposed crate-internally so `ht` can build a pair-aware acquire loop
    /// on top of it (the `(hash, next)` pair isn't an `AtomicPtr<T>`, so the
    /// generic `acquire` above doesn't fit it directly).
    pub(crate) fn publish(&self, slot: usize, ptr: *mut ()) {
        self.record().hazards[slot].store(ptr, Ordering::Release);
        pr::fence_acqrel();
    }

    /// Core of the hazard protocol: call `reload` until two consecutive
    /// reads agree, publishing the candidate in `slot` between them so a
    /// concurrent retire-scan can see it before the value is trusted.
    ///
    /// Without this second read, a retiring thread could free the object
    /// in the window between reading `*loc` and publishing it: the
    /// candidate pointer would be visible to a scan only after it was
    /// already dangling.
    fn acquire_with<T>(&self, slot: usize, mut reload: impl FnMut() -> *mut T) -> *mut T {
        loop {
            let ptr = reload();
            self.publish(slot, ptr as *mut ());
            let reloaded = reload();
            if reloaded == ptr {
                return ptr;
            }
        }
    }

    /// Atomically load `*loc`, publish it in `slot`, and re-validate
    /// against `*loc` until stable. The returned pointer is safe to
    /// dereference until `release`/`release_readonly` is called on `slot`
    /// or another `acquire` overwrites it.
    pub fn acquire<T>(&self, slot: usize, loc: &AtomicPtr<T>) -> *mut T {
        self.acquire_with(slot, || loc.load(Ordering::Acquire))
    }

    /// Clear a hazard slot that held a pointer the caller might have
    /// mutated through.
    pub fn release(&self, slot: usize) {
        self.record().hazards[slot].store(ptr::null_mut(), Ordering::Release);
    }

    /// Clear a hazard slot that was only ever read through. Semantically
    /// identical to [`release`](Self::release) today, kept distinct
    /// because the original API distinguishes the two call sites.
    pub fn release_readonly(&self, slot: usize) {
        self.release(slot);
    }

    fn release_all(&self) {
        for hp in &self.record().hazards {
            hp.store(ptr::null_mut(), Ordering::Release);
        }
    }

    /// Hand `ptr` to the domain for deferred reclamation. `deleter` is
    /// invoked once no published hazard still references `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must not be dereferenced by the caller after this call, and
    /// `deleter` must be a valid destructor for it.
    pub unsafe fn retire<T>(&self, ptr: *mut T, deleter: unsafe fn(*mut T)) {
        let retired = &mut *self.record().retired.get();
        retired.push(Retired {
            ptr: ptr as *mut (),
            // SAFETY: only ever invoked below with the `ptr` it was paired with.
            deleter: core::mem::transmute::<unsafe fn(*mut T), unsafe fn(*mut ())>(deleter),
        });
        if retired.len() >= SCAN_THRESHOLD {
            self.scan();
        }
    }

    /// Reclaim every retired node no longer covered by a published
    /// hazard. Safe to call at any time; a no-op if nothing is reclaimable.
    pub fn scan(&self) {
        let hazards = self.domain.collect_hazards();
        let retired = unsafe { &mut *self.record().retired.get() };
        retired.retain(|node| {
            if hazards.contains(&node.ptr) {
                true
            } else {
                unsafe {
                    (node.deleter)(node.ptr);
                }
                false
            }
        });
    }
}

impl Drop for HazardGuard<'_> {
    fn drop(&mut self) {
        self.release_all();
        self.record().active.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicPtr;

    #[test]
    fn acquire_returns_current_value() {
        let domain = HazardDomain::new();
        let guard = domain.register();
        let mut x = 7i32;
        let loc = AtomicPtr::new(&mut x as *mut i32);
        let acquired = guard.acquire(0, &loc);
        assert_eq!(acquired, &mut x as *mut i32);
        guard.release(0);
    }

    #[test]
    fn retire_keeps_hazarded_node_alive_until_scan() {
        let domain = HazardDomain::new();
        let guard = domain.register();

        let boxed = Box::new(55i32);
        let raw = Box::into_raw(boxed);
        let loc = AtomicPtr::new(raw);

        let acquired = guard.acquire(0, &loc);
        assert_eq!(acquired, raw);

        unsafe {
            guard.retire(raw, |p| unsafe { drop(Box::from_raw(p)) });
        }
        // Still hazarded: a scan must not free it.
        guard.scan();
        // Safe to read because the scan above could not have reclaimed it.
        assert_eq!(unsafe { *raw }, 55);

        guard.release(0);
        guard.scan();
    }

    #[test]
    fn two_threads_can_register_independently() {
        let domain = HazardDomain::new();
        let g1 = domain.register();
        let g2 = domain.register();
        assert_ne!(g1.record, g2.record);
    }
}
