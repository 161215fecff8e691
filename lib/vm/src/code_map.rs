//! A map from program counters to the code that contains them.
//!
//! Lookups happen from signal handlers and from profilers sampling other
//! threads, so they must never block or allocate. Registrations are rare.
//!
//! The map keeps two copies of a sorted list of address ranges. Readers
//! announce themselves in the observer counter of the live copy and then
//! read it. A writer takes a mutex, edits the copy no reader can see, makes
//! it live, waits for the readers of the retired copy to leave, and finally
//! applies the same edit to the retired copy.
//!
//! A writer cannot wait for a lookup running on its own thread, so updates
//! from inside a lookup callback are refused. Owners that may be destroyed
//! from such a callback postpone the destruction with
//! [`defer_until_lookups_end`].

use parking_lot::Mutex;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

thread_local! {
    /// Number of lookups running on this thread.
    static LOOKUP_DEPTH: Cell<usize> = const { Cell::new(0) };
    static HAS_DEFERRED: Cell<bool> = const { Cell::new(false) };
    static DEFERRED: RefCell<Vec<Box<dyn FnOnce()>>> = const { RefCell::new(Vec::new()) };
}

/// Whether the calling thread is inside a [`CodeMap::lookup`] callback.
pub fn in_code_map_lookup() -> bool {
    LOOKUP_DEPTH.with(Cell::get) > 0
}

/// Run `f` as soon as the calling thread has left every lookup, right away
/// if it is in none.
pub fn defer_until_lookups_end(f: impl FnOnce() + 'static) {
    if !in_code_map_lookup() {
        f();
        return;
    }
    DEFERRED.with(|deferred| deferred.borrow_mut().push(Box::new(f)));
    HAS_DEFERRED.with(|has| has.set(true));
}

fn run_deferred() {
    // Touching `DEFERRED` may allocate, which signal handlers must not.
    while HAS_DEFERRED.with(|has| has.replace(false)) {
        let deferred = DEFERRED.with(|deferred| std::mem::take(&mut *deferred.borrow_mut()));
        for f in deferred {
            f();
        }
    }
}

struct Entry<T> {
    start: usize,
    end: usize,
    item: NonNull<T>,
}

/// Maps `[start, end)` address ranges to items registered for them.
pub struct CodeMap<T> {
    snapshots: [UnsafeCell<Vec<Entry<T>>>; 2],
    live: AtomicUsize,
    /// Readers of each snapshot.
    observers: [AtomicUsize; 2],
    writer: Mutex<()>,
}

// Items are only ever handed out as `&T`.
unsafe impl<T: Sync> Send for CodeMap<T> {}
unsafe impl<T: Sync> Sync for CodeMap<T> {}

impl<T> fmt::Debug for CodeMap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeMap")
            .field("len", &self.len())
            .field(
                "observers",
                &[
                    self.observers[0].load(Ordering::Relaxed),
                    self.observers[1].load(Ordering::Relaxed),
                ],
            )
            .finish()
    }
}

impl<T> Default for CodeMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts a lookup in progress until it ends, even by unwinding.
struct ObserverGuard<'a>(&'a AtomicUsize);

impl<'a> ObserverGuard<'a> {
    fn new(observers: &'a AtomicUsize) -> Self {
        LOOKUP_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self(observers)
    }
}

impl Drop for ObserverGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
        let depth = LOOKUP_DEPTH.with(|depth| {
            depth.set(depth.get() - 1);
            depth.get()
        });
        if depth == 0 {
            run_deferred();
        }
    }
}

fn search<T>(entries: &[Entry<T>], pc: usize) -> Option<&Entry<T>> {
    let idx = entries.partition_point(|entry| entry.end <= pc);
    entries.get(idx).filter(|entry| entry.start <= pc)
}

impl<T> CodeMap<T> {
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            snapshots: [UnsafeCell::new(Vec::new()), UnsafeCell::new(Vec::new())],
            live: AtomicUsize::new(0),
            observers: [AtomicUsize::new(0), AtomicUsize::new(0)],
            writer: Mutex::new(()),
        }
    }

    /// Number of registered ranges.
    pub fn len(&self) -> usize {
        self.with_live(|entries| entries.len()).0
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` on the item whose range contains `pc`.
    ///
    /// The item stays registered, and therefore alive, until `f` returns.
    /// Never blocks. `f` must not register or unregister anything, in this
    /// or any other map; owners it drops have to postpone unregistering
    /// with [`defer_until_lookups_end`].
    pub fn lookup<R>(&self, pc: usize, f: impl FnOnce(&T) -> R) -> Option<R> {
        let (item, _guard) = self.with_live(|entries| search(entries, pc).map(|entry| entry.item));
        // Registered items outlive their registration.
        item.map(|item| f(unsafe { item.as_ref() }))
    }

    /// Whether `pc` lies in a registered range.
    pub fn contains(&self, pc: usize) -> bool {
        self.lookup(pc, |_| ()).is_some()
    }

    /// Run `f` on the live snapshot. The returned guard keeps the lookup
    /// counted.
    fn with_live<R>(&self, f: impl FnOnce(&[Entry<T>]) -> R) -> (R, ObserverGuard<'_>) {
        loop {
            let live = self.live.load(Ordering::SeqCst);
            self.observers[live].fetch_add(1, Ordering::SeqCst);
            let guard = ObserverGuard::new(&self.observers[live]);
            if self.live.load(Ordering::SeqCst) != live {
                // Retired before we were counted: a writer may be editing it.
                continue;
            }
            // No writer touches a snapshot while we are counted on it.
            let entries = unsafe { &*self.snapshots[live].get() };
            return (f(entries), guard);
        }
    }

    /// Register `item` for `[start, end)`.
    ///
    /// Panics if the range is empty or overlaps a registered range.
    ///
    /// # Safety
    ///
    /// `item` must stay valid until it is removed with [`CodeMap::remove`].
    pub unsafe fn insert(&self, start: usize, end: usize, item: NonNull<T>) {
        assert!(start < end, "empty code range {start:#x}..{end:#x}");
        self.update(|entries| {
            let idx = entries.partition_point(|e| e.start < start);
            if let Some(prev) = idx.checked_sub(1).map(|i| &entries[i]) {
                assert!(
                    prev.end <= start,
                    "code range {start:#x}..{end:#x} overlaps registered {:#x}..{:#x}",
                    prev.start,
                    prev.end
                );
            }
            if let Some(next) = entries.get(idx) {
                assert!(
                    end <= next.start,
                    "code range {start:#x}..{end:#x} overlaps registered {:#x}..{:#x}",
                    next.start,
                    next.end
                );
            }
            entries.insert(idx, Entry { start, end, item });
        });
        tracing::trace!(start, end, "registered code range");
    }

    /// Unregister the range starting at `start`, which must belong to
    /// `item`. Once this returns no lookup can observe `item` anymore.
    ///
    /// Panics if no such registration exists.
    pub fn remove(&self, start: usize, item: NonNull<T>) {
        self.update(|entries| {
            let idx = entries
                .binary_search_by_key(&start, |e| e.start)
                .ok()
                .filter(|idx| entries[*idx].item == item)
                .unwrap_or_else(|| panic!("no code registered at {start:#x}"));
            entries.remove(idx);
        });
        tracing::trace!(start, "unregistered code range");
    }

    fn update(&self, mut edit: impl FnMut(&mut Vec<Entry<T>>)) {
        assert!(
            !in_code_map_lookup(),
            "code map updated from inside a lookup"
        );
        let _lock = self.writer.lock();
        let live = self.live.load(Ordering::SeqCst);
        let standby = 1 - live;

        // Nobody reads the standby snapshot: it was retired by the previous
        // update only after its observers left.
        edit(unsafe { &mut *self.snapshots[standby].get() });
        self.live.store(standby, Ordering::SeqCst);

        self.wait_for_observers(live);

        edit(unsafe { &mut *self.snapshots[live].get() });
        debug_assert_eq!(
            unsafe { (*self.snapshots[live].get()).len() },
            unsafe { (*self.snapshots[standby].get()).len() },
        );
    }

    /// Spin until no lookup counted on the `retired` snapshot is still
    /// running. Lookups starting now use the other one.
    fn wait_for_observers(&self, retired: usize) {
        let mut spins = 0u32;
        while self.observers[retired].load(Ordering::SeqCst) != 0 {
            if spins < 64 {
                std::hint::spin_loop();
                spins += 1;
            } else {
                thread::yield_now();
            }
        }
    }
}
