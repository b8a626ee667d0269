//! Memory allocator abstraction.
//!
//! [`Table`](crate::ht::Table) allocates its bucket array exactly once, up
//! front, and frees it exactly once, when dropped: there is no resizing, so
//! the [`Allocator`] trait only needs `malloc`/`free`, not a full
//! realloc-capable interface. A caller that wants the bucket array carved
//! out of a NUMA-local arena or a fixed pool implements this trait instead
//! of going through [`GlobalAllocator`].
//!
//! # Example
//!
//! ```
//! use lockfree_hash::malloc::{Allocator, GlobalAllocator};
//!
//! let alloc = GlobalAllocator;
//! let ptr = alloc.malloc(1024).expect("allocation failed");
//! unsafe { alloc.free(ptr, 1024, false); }
//! ```

use alloc::alloc::{alloc, dealloc, Layout};
use core::ptr::NonNull;

/// A memory allocator for the table's bucket array.
///
/// # Safety
///
/// Implementations must ensure that:
/// - `malloc` returns properly aligned memory for any type
/// - `free` only deallocates memory previously allocated by this allocator
/// - All operations are thread-safe if used with concurrent data structures
pub trait Allocator {
    /// Allocate a new memory block of at least `size` bytes, or `None` if
    /// allocation fails. The returned memory is not guaranteed to be
    /// initialized.
    fn malloc(&self, size: usize) -> Option<NonNull<u8>>;

    /// Deallocate a memory block previously returned by `malloc`.
    ///
    /// `defer` hints that deallocation may be batched rather than performed
    /// immediately; `GlobalAllocator` ignores it and frees synchronously.
    ///
    /// # Safety
    ///
    /// - `ptr` must have been allocated by this allocator
    /// - `size` must match the size passed to the `malloc` call that
    ///   produced `ptr`
    /// - `ptr` must not be used after this call
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize, defer: bool);
}

/// An [`Allocator`] backed by Rust's global allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalAllocator;

impl Allocator for GlobalAllocator {
    fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return NonNull::new(core::mem::align_of::<usize>() as *mut u8);
        }

        let layout = Layout::from_size_align(size, core::mem::align_of::<usize>()).ok()?;
        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc(layout) };
        NonNull::new(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize, _defer: bool) {
        if size == 0 {
            return;
        }

        let layout = match Layout::from_size_align(size, core::mem::align_of::<usize>()) {
            Ok(l) => l,
            Err(_) => return,
        };

        // SAFETY: caller guarantees ptr was allocated by us with this size
        dealloc(ptr.as_ptr(), layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_allocator_is_zero_sized() {
        assert_eq!(core::mem::size_of::<GlobalAllocator>(), 0);
    }

    #[test]
    fn malloc_then_free_roundtrip() {
        let alloc = GlobalAllocator;
        let ptr = alloc.malloc(1024).expect("allocation failed");

        unsafe {
            core::ptr::write_bytes(ptr.as_ptr(), 0xAB, 1024);
            alloc.free(ptr, 1024, false);
        }
    }

    #[test]
    fn zero_size_allocation_is_safe_to_free() {
        let alloc = GlobalAllocator;
        let ptr = alloc.malloc(0).expect("zero-size malloc should succeed");
        unsafe { alloc.free(ptr, 0, false) };
    }

    #[test]
    fn bucket_array_sized_allocation_matches_table_usage() {
        // Table rounds capacity up to whole 64-byte buckets; a handful of
        // bucket-sized allocations exercises the same path `Table::alloc`
        // takes without depending on `ht` from this module's own tests.
        let alloc = GlobalAllocator;
        let mut blocks = alloc::vec::Vec::new();
        for buckets in 1..=8usize {
            let size = buckets * 64;
            let ptr = alloc.malloc(size).expect("allocation failed");
            unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, size) };
            blocks.push((ptr, size));
        }
        for (ptr, size) in blocks {
            unsafe { alloc.free(ptr, size, false) };
        }
    }
}
