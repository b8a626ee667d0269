//! Lock-free concurrent hash table.
//!
//! Entries are intrusive: the caller embeds a [`HashEntry`] as the first
//! field of its own type and implements [`Node`] to get it back. The table
//! never allocates or drops an entry itself, only ever links and unlinks
//! the `(hash, next)` pair a [`HashEntry`] wraps.
//!
//! Buckets hold `BUCKET_SIZE` head slots; a hash that collides on a head
//! slot overflows into a singly linked list rooted at that slot. Deletion is
//! two-phase: a logical mark (the low bit of the `next` pointer) followed by
//! a physical unlink that any thread observing the mark may perform
//! ("helping"). That is what keeps the structure lock-free rather than
//! merely non-blocking for the thread that started the remove.

use core::ptr;
use core::sync::atomic::{AtomicIsize, Ordering};

use crate::cc;
use crate::hp::HazardGuard;
use crate::malloc::{Allocator, GlobalAllocator};
use crate::pair::{Pair, PairValue};

/// Head slots per bucket. `64 / 16 = 4`: a cache line holds four 16-byte
/// `(hash, next)` pairs.
const BUCKET_SIZE: usize = 4;

/// Low bit of the `next` half of a pair: set once an entry is logically
/// removed and before it has been physically unlinked.
const REMOVE_MARK: usize = 1;

#[inline]
fn has_mark(p: *mut HashEntry) -> bool {
    (p as usize) & REMOVE_MARK != 0
}

#[inline]
fn strip_mark(p: *mut HashEntry) -> *mut HashEntry {
    ((p as usize) & !REMOVE_MARK) as *mut HashEntry
}

/// The embedded header every hash table entry carries.
///
/// Holds one atomically-mutable `(hash, next)` pair. For a bucket head
/// slot, `next` points at the first entry hashed into it (or null). For an
/// entry that is itself in a chain, `next` points at whatever was linked
/// after it and `hash` is the hash *that node* was inserted under: the
/// entry's own hash lives only in the parent that points to it.
#[repr(transparent)]
pub struct HashEntry {
    pair: Pair,
}

impl HashEntry {
    /// A fresh, unlinked header. Must be installed via [`Table::insert`]
    /// before it is reachable from any other thread.
    pub fn empty() -> Self {
        Self { pair: Pair::empty() }
    }
}

impl Default for HashEntry {
    fn default() -> Self {
        Self::empty()
    }
}

/// A type that can be linked into a [`Table`].
///
/// # Safety
///
/// `header` must return a reference to a [`HashEntry`] that is the first
/// field of `Self` (so that a `*const HashEntry` recovered from the table
/// can be cast back to `*const Self`), and that header must not move for as
/// long as the entry may be reachable from the table (including the window
/// before a concurrent reader's hazard pointer has been dropped).
pub unsafe trait Node: Sized {
    /// Borrow this node's embedded header.
    fn header(&self) -> &HashEntry;

    /// Recover `Self` from a header pointer previously obtained via
    /// [`Node::header`] on a live `Self`.
    ///
    /// # Safety
    ///
    /// `entry` must have been produced by calling `header()` on a valid
    /// `Self`, or be null-checked away before use.
    #[inline]
    unsafe fn from_header(entry: *const HashEntry) -> *const Self {
        entry as *const Self
    }
}

#[inline]
fn header_ptr<N: Node>(entry: &N) -> *mut HashEntry {
    entry.header() as *const HashEntry as *mut HashEntry
}

#[repr(C, align(64))]
struct Bucket {
    heads: [HashEntry; BUCKET_SIZE],
}

impl Bucket {
    fn root(&self, hash: u64) -> &HashEntry {
        &self.heads[(hash as usize) % BUCKET_SIZE]
    }
}

/// A live, hazard-protected reference to an entry found by [`Table::lookup`].
///
/// The entry stays safe to dereference until this guard is dropped, at
/// which point the hazard slot it occupied is released.
pub struct Protected<'g, 'd, N: Node> {
    guard: &'g HazardGuard<'d>,
    slot: usize,
    ptr: *const N,
}

impl<'g, 'd, N: Node> Protected<'g, 'd, N> {
    /// Borrow the protected entry.
    #[inline]
    pub fn get(&self) -> &N {
        unsafe { &*self.ptr }
    }
}

impl<N: Node> core::ops::Deref for Protected<'_, '_, N> {
    type Target = N;
    fn deref(&self) -> &N {
        self.get()
    }
}

impl<N: Node> Drop for Protected<'_, '_, N> {
    fn drop(&mut self) {
        self.guard.release_readonly(self.slot);
    }
}

/// Hazard-acquire the `(hash, next)` pair at `pair`, publishing the
/// (unmarked) `next` pointer in `slot` and re-validating until the
/// publication matches the live value.
///
/// This reads `hash` and `next` together in one 128-bit load (via
/// [`Pair::load_acquire`]), which is what keeps every reader of a parent's
/// hash consistent with the pointer it describes: the two halves can never
/// be observed torn, unlike two separate word-sized loads.
fn hp_acquire_pair(guard: &HazardGuard<'_>, slot: usize, pair: &Pair) -> PairValue {
    loop {
        let v = pair.load_acquire();
        guard.publish(slot, strip_mark(v.next) as *mut ());
        let v2 = pair.load_acquire();
        if v2 == v {
            return v;
        }
    }
}

/// A lock-free hash table of intrusive [`Node`]s.
///
/// `nused` is an advisory, debug-only count: concurrent helping can cause
/// the same logical removal to be observed and accounted for by more than
/// one helper in principle, so it should be read as "approximately this
/// many entries", not relied on for correctness.
pub struct Table<A: Allocator = GlobalAllocator> {
    nbkts: u32,
    nused: AtomicIsize,
    buckets: ptr::NonNull<Bucket>,
    allocator: A,
}

unsafe impl<A: Allocator + Send> Send for Table<A> {}
unsafe impl<A: Allocator + Sync> Sync for Table<A> {}

impl Table<GlobalAllocator> {
    /// Allocate a table sized for at least `capacity_hint` entries, using
    /// the global allocator.
    pub fn alloc(capacity_hint: u32) -> Option<Self> {
        Self::with_allocator(capacity_hint, GlobalAllocator)
    }
}

impl<A: Allocator> Table<A> {
    /// Allocate a table sized for at least `capacity_hint` entries using a
    /// caller-supplied allocator.
    pub fn with_allocator(capacity_hint: u32, allocator: A) -> Option<Self> {
        let nbkts = ((capacity_hint as usize + BUCKET_SIZE - 1) / BUCKET_SIZE).max(1);
        let size = nbkts
            .checked_mul(core::mem::size_of::<Bucket>())
            .expect("bucket array size overflow");
        let raw = allocator.malloc(size)?;
        // SAFETY: `raw` is a fresh allocation of `size` bytes; zeroing it
        // gives every head slot `(hash: 0, next: null)`, a valid empty
        // `HashEntry`, which is exactly what `calloc` would have produced
        // in the original.
        unsafe {
            ptr::write_bytes(raw.as_ptr(), 0, size);
        }
        Some(Self {
            nbkts: nbkts as u32,
            nused: AtomicIsize::new(0),
            buckets: raw.cast::<Bucket>(),
            allocator,
        })
    }

    /// Number of buckets backing this table.
    #[inline]
    pub fn nbkts(&self) -> u32 {
        self.nbkts
    }

    /// Advisory entry count. See the struct-level note on `nused`.
    #[inline]
    pub fn len(&self) -> usize {
        self.nused.load(Ordering::Relaxed).max(0) as usize
    }

    /// Whether the advisory entry count is zero.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn bucket(&self, bix: u32) -> &Bucket {
        // SAFETY: `bix < self.nbkts`, and `buckets` spans `nbkts` buckets
        // for the table's lifetime.
        unsafe { &*self.buckets.as_ptr().add(bix as usize) }
    }

    #[inline]
    fn bucket_index(&self, hash: u64) -> u32 {
        ((hash / BUCKET_SIZE as u64) % self.nbkts as u64) as u32
    }

    /// Look up `key`, returning a hazard-protected handle on a match.
    ///
    /// `cmp` is called with candidate entries whose stored hash matches
    /// `hash`; it should compare the full key, since hash collisions are
    /// possible. The returned [`Protected`] keeps the entry alive (not
    /// reclaimed by a concurrent [`Table::remove`]) until it is dropped.
    pub fn lookup<'g, 'd, N: Node, K: ?Sized>(
        &self,
        cmp: impl Fn(&N, &K) -> bool,
        key: &K,
        hash: u64,
        guard: &'g HazardGuard<'d>,
        out_slot: usize,
    ) -> Option<Protected<'g, 'd, N>> {
        let scratch = (out_slot + 1) % crate::hp::HP_PER_THREAD;
        let bkt = self.bucket(self.bucket_index(hash));

        let matches = |he: *mut HashEntry| -> bool {
            if he.is_null() {
                return false;
            }
            let node = unsafe { &*N::from_header(he) };
            cmp(node, key)
        };

        let mut mask: u32 = 0;
        for i in 0..BUCKET_SIZE {
            if bkt.heads[i].pair.load_relaxed().hash == hash {
                mask |= 1 << i;
            }
        }
        while mask != 0 {
            let i = (cc::ffs(mask) - 1) as usize;
            mask &= !(1 << i);
            let v = hp_acquire_pair(guard, out_slot, &bkt.heads[i].pair);
            let he = strip_mark(v.next);
            if matches(he) {
                return Some(Protected {
                    guard,
                    slot: out_slot,
                    ptr: unsafe { N::from_header(he) },
                });
            }
        }
        guard.release_readonly(out_slot);

        let root = bkt.root(hash);
        let mut prnt: *const HashEntry = root;
        loop {
            // `prnt`'s child (`this`) is hazard-protected by publishing it
            // in `scratch` as part of this acquire.
            let v = hp_acquire_pair(guard, scratch, unsafe { &(*prnt).pair });
            let this = strip_mark(v.next);
            if this.is_null() {
                guard.release_readonly(scratch);
                return None;
            }
            // `this` is provably live right now (still published in
            // `scratch`), so re-publishing it in `out_slot` needs no
            // further re-validation.
            guard.release_readonly(out_slot);
            guard.publish(out_slot, this as *mut ());
            guard.release_readonly(scratch);
            if v.hash == hash && matches(this) {
                return Some(Protected {
                    guard,
                    slot: out_slot,
                    ptr: unsafe { N::from_header(this) },
                });
            }
            prnt = this;
        }
    }

    /// Link `entry` into the table under `hash`.
    ///
    /// `entry` must not already be linked into this or any other table.
    /// Helps complete any removal it finds blocking its path.
    pub fn insert<N: Node>(&self, entry: &N, hash: u64, guard: &HazardGuard<'_>) {
        let he = header_ptr(entry);
        unsafe {
            (*he).pair.store_relaxed(PairValue::new(0, ptr::null_mut()));
        }

        let bix = self.bucket_index(hash);
        let bkt = self.bucket(bix);

        if bucket_insert(bkt, he, hash) {
            self.nused.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let root = bkt.root(hash);
        let mut removed = 0isize;
        list_insert(root, he, hash, guard, &mut removed);
        self.apply_removed(removed);
        self.nused.fetch_add(1, Ordering::Relaxed);
    }

    /// Unlink `entry` from the table. Returns `true` if this call performed
    /// the logical removal (as opposed to finding the entry already gone).
    pub fn remove<N: Node>(&self, entry: &N, hash: u64, guard: &HazardGuard<'_>) -> bool {
        let he = header_ptr(entry);
        let bix = self.bucket_index(hash);
        let bkt = self.bucket(bix);

        let mut removed = 0isize;
        let mut direct_head = None;
        for i in 0..BUCKET_SIZE {
            let head = &bkt.heads[i];
            if strip_mark(head.pair.load_relaxed().next) == he {
                direct_head = Some(head);
                break;
            }
        }
        let ok = if let Some(head) = direct_head {
            remove_node(head, he, hash, &mut removed)
        } else {
            let root = bkt.root(hash);
            list_remove(root, he, hash, guard, &mut removed)
        };
        self.apply_removed(removed);
        ok
    }

    fn apply_removed(&self, removed: isize) {
        if removed != 0 {
            self.nused.fetch_sub(removed, Ordering::Relaxed);
        }
    }

    /// Dump a human-readable summary of bucket occupancy. Not
    /// synchronized with concurrent writers, for debugging only.
    pub fn check(&self, out: &mut dyn core::fmt::Write) -> u32 {
        let mut total = 0u32;
        for bix in 0..self.nbkts {
            let bkt = self.bucket(bix);
            let mut count = 0u32;
            for i in 0..BUCKET_SIZE {
                let mut cur = strip_mark(bkt.heads[i].pair.load_relaxed().next);
                while !cur.is_null() {
                    count += 1;
                    cur = strip_mark(unsafe { (*cur).pair.load_relaxed().next });
                }
            }
            total += count;
            let _ = writeln!(out, "bucket {bix}: {count} entries");
        }
        total
    }
}

impl<A: Allocator> Drop for Table<A> {
    fn drop(&mut self) {
        let size = self.nbkts as usize * core::mem::size_of::<Bucket>();
        unsafe {
            self.allocator.free(self.buckets.cast::<u8>(), size, false);
        }
    }
}

fn insert_node(prnt: &HashEntry, he: *mut HashEntry, hash: u64) -> Option<PairValue> {
    let expect = PairValue::new(0, ptr::null_mut());
    let new = PairValue::new(hash, he);
    match prnt.pair.cas_release(expect, new) {
        Ok(()) => None,
        Err(old) => Some(old),
    }
}

fn bucket_insert(bkt: &Bucket, he: *mut HashEntry, hash: u64) -> bool {
    let mut mask: u32 = 0;
    for i in 0..BUCKET_SIZE {
        if bkt.heads[i].pair.load_relaxed().next.is_null() {
            mask |= 1 << i;
        }
    }
    while mask != 0 {
        let i = (cc::ffs(mask) - 1) as usize;
        mask &= !(1 << i);
        if insert_node(&bkt.heads[i], he, hash).is_none() {
            return true;
        }
    }
    false
}

/// Append `he` to the end of the chain rooted at `root`, helping unlink any
/// logically-removed node it passes along the way. Helped removals are
/// added to `removed` so the caller can keep `nused` in sync.
fn list_insert(
    root: &HashEntry,
    he: *mut HashEntry,
    hash: u64,
    guard: &HazardGuard<'_>,
    removed: &mut isize,
) {
    let mut slot_prnt = 0usize;
    let mut slot_this = 1usize;
    let mut prnt: *const HashEntry = root;

    loop {
        let v = hp_acquire_pair(guard, slot_this, unsafe { &(*prnt).pair });
        let this = strip_mark(v.next);

        if this.is_null() {
            match insert_node(unsafe { &*prnt }, he, hash) {
                None => break,
                Some(old) => {
                    if has_mark(old.next) {
                        prnt = root;
                    }
                    continue;
                }
            }
        }

        assert!(
            !ptr::eq(this, he),
            "entry is already linked into this table"
        );

        let this_pair = unsafe { (*this).pair.load_relaxed() };
        if cc::unlikely(has_mark(this_pair.next)) {
            if remove_node(unsafe { &*prnt }, this, v.hash, removed) {
                continue;
            }
            prnt = root;
            continue;
        }

        prnt = this;
        core::mem::swap(&mut slot_prnt, &mut slot_this);
    }

    guard.release_readonly(slot_prnt);
    guard.release_readonly(slot_this);
}

/// Two-phase unlink of `this` from `prnt`: a relaxed logical mark, then a
/// CAS that splices `prnt` past it. `hash` is the hash `prnt` currently
/// records for `this` (read atomically alongside `prnt.next`).
///
/// Returns `true` if `this` is unlinked (by this call or one that raced
/// with it), `false` if `prnt` itself turned out to be removed, meaning the
/// caller must restart its search from further back in the chain.
fn remove_node(prnt: &HashEntry, this: *mut HashEntry, hash: u64, removed: &mut isize) -> bool {
    debug_assert_eq!(strip_mark(this), this);

    let this_ref = unsafe { &*this };
    this_ref.pair.fetch_or_next_relaxed(REMOVE_MARK);
    let this_pair = this_ref.pair.load_relaxed();

    let expect = PairValue::new(hash, this);
    let new = PairValue::new(this_pair.hash, strip_mark(this_pair.next));
    match prnt.pair.cas_relaxed(expect, new) {
        Ok(()) => {
            *removed += 1;
            true
        }
        Err(old) => strip_mark(old.next) != this,
    }
}

/// Walk the chain rooted at `root` looking for `he`, helping unlink any
/// other logically-removed node it passes along the way. If `prnt` itself
/// turns out to already be marked (the `remove_node` call returns `false`),
/// the search restarts from `root` rather than continuing from a parent
/// that's about to be spliced out from under it.
fn list_remove(
    root: &HashEntry,
    he: *mut HashEntry,
    hash: u64,
    guard: &HazardGuard<'_>,
    removed: &mut isize,
) -> bool {
    let mut slot_prnt = 0usize;
    let mut slot_this = 1usize;
    let root_ptr: *const HashEntry = root;
    let mut prnt: *const HashEntry = root;

    let result = loop {
        let v = hp_acquire_pair(guard, slot_this, unsafe { &(*prnt).pair });
        let this = strip_mark(v.next);
        if this.is_null() {
            break false;
        }
        if ptr::eq(this, he) {
            if remove_node(unsafe { &*prnt }, this, hash, removed) {
                break true;
            }
            prnt = root_ptr;
            continue;
        }
        let this_pair = unsafe { (*this).pair.load_relaxed() };
        if cc::unlikely(has_mark(this_pair.next)) {
            if remove_node(unsafe { &*prnt }, this, v.hash, removed) {
                continue;
            }
            prnt = root_ptr;
            continue;
        }
        prnt = this;
        core::mem::swap(&mut slot_prnt, &mut slot_this);
    };

    guard.release_readonly(slot_prnt);
    guard.release_readonly(slot_this);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hp::HazardDomain;
    use alloc::vec::Vec;

    struct IntEntry {
        header: HashEntry,
        value: i64,
    }

    impl IntEntry {
        fn new(value: i64) -> Self {
            Self { header: HashEntry::empty(), value }
        }
    }

    unsafe impl Node for IntEntry {
        fn header(&self) -> &HashEntry {
            &self.header
        }
    }

    fn hash_of(v: i64) -> u64 {
        v as u64
    }

    #[test]
    fn insert_then_lookup_finds_entry() {
        let table = Table::alloc(8).unwrap();
        let domain = HazardDomain::new();
        let guard = domain.register();

        let entry = IntEntry::new(42);
        table.insert(&entry, hash_of(42), &guard);

        let found = table
            .lookup::<IntEntry, i64>(|n, k| n.value == *k, &42, hash_of(42), &guard, 0)
            .expect("entry should be found");
        assert_eq!(found.value, 42);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn lookup_miss_returns_none() {
        let table = Table::alloc(8).unwrap();
        let domain = HazardDomain::new();
        let guard = domain.register();

        let entry = IntEntry::new(1);
        table.insert(&entry, hash_of(1), &guard);

        assert!(table
            .lookup::<IntEntry, i64>(|n, k| n.value == *k, &2, hash_of(2), &guard, 0)
            .is_none());
    }

    #[test]
    fn remove_unlinks_entry() {
        let table = Table::alloc(8).unwrap();
        let domain = HazardDomain::new();
        let guard = domain.register();

        let entry = IntEntry::new(7);
        table.insert(&entry, hash_of(7), &guard);
        assert!(table.remove(&entry, hash_of(7), &guard));

        assert!(table
            .lookup::<IntEntry, i64>(|n, k| n.value == *k, &7, hash_of(7), &guard, 0)
            .is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn overflow_chain_holds_multiple_entries_per_bucket() {
        let table = Table::alloc(1).unwrap();
        let domain = HazardDomain::new();
        let guard = domain.register();

        let entries: Vec<IntEntry> = (0..10).map(IntEntry::new).collect();
        for (i, e) in entries.iter().enumerate() {
            table.insert(e, hash_of(i as i64), &guard);
        }
        for (i, _) in entries.iter().enumerate() {
            let found = table
                .lookup::<IntEntry, i64>(|n, k| n.value == *k, &(i as i64), hash_of(i as i64), &guard, 0)
                .unwrap_or_else(|| panic!("missing entry {i}"));
            assert_eq!(found.value, i as i64);
        }
    }

    #[test]
    fn check_reports_total_entry_count() {
        let table = Table::alloc(4).unwrap();
        let domain = HazardDomain::new();
        let guard = domain.register();
        let entries: Vec<IntEntry> = (0..5).map(IntEntry::new).collect();
        for (i, e) in entries.iter().enumerate() {
            table.insert(e, hash_of(i as i64), &guard);
        }

        struct Sink;
        impl core::fmt::Write for Sink {
            fn write_str(&mut self, _s: &str) -> core::fmt::Result {
                Ok(())
            }
        }
        assert_eq!(table.check(&mut Sink), 5);
    }
}
