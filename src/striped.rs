// Copyright 2021 UCLouvain
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT License <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option.  This file may not be
// copied, modified, or distributed except according to those terms.
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The striping engine: a base value, a lazily-created table of cells and the protocol that
//! spreads contended updates over them.

use crate::cell::{Cell, Table};
use crate::probe;
use crate::{FnAcc, StripedValue};
use atomic::Atomic;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::OnceLock;

/// Number of threads that can run in parallel on this machine, computed once.
fn available_parallelism() -> usize {
    static NCPU: OnceLock<usize> = OnceLock::new();
    *NCPU.get_or_init(|| {
        std::thread::available_parallelism()
            .map(Into::into)
            .unwrap_or(1)
    })
}

#[inline]
fn apply<T: StripedValue, F: FnAcc<T> + ?Sized>(v: T, x: T, combine: Option<&F>) -> T {
    match combine {
        Some(f) => f.call(v, x),
        None => v.plus(x),
    }
}

/// Structural lock on the cell table, released when dropped.
pub struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A 64-bit value that many threads can update concurrently, with updates spread over an
/// adaptively sized table of cells when they contend.
///
/// Without contention, every update is a CAS on a single `base` value. The first failed CAS
/// creates a table of two cells; further collisions on a cell double the table, until it has at
/// least as many cells as there are CPUs. Each thread picks its cell with its own probe, which is
/// re-mixed on every collision, so that threads eventually spread over distinct cells.
///
/// The table is only changed while holding a spin flag, and a thread that fails to take the flag
/// never waits for it: it retries on another cell or on the base instead.
///
/// The value of the accumulator is the combination of the base and of all cells. Reading it is
/// not atomic: it is exact only if no update runs concurrently.
///
/// ```rust
/// use striped64::Striped64;
/// let striped: Striped64<i64> = Striped64::default();
/// crossbeam_utils::thread::scope(|s| {
///     for _ in 0..4 {
///         s.spawn(|_| {
///             for _ in 0..1000 {
///                 striped.add(1);
///             }
///         });
///     }
/// })
/// .unwrap();
/// assert_eq!(striped.sum(), 4000);
/// ```
pub struct Striped64<T: StripedValue> {
    base: Atomic<T>,
    cells: AtomicPtr<Table<T>>,
    busy: AtomicBool,
    ncpu: usize,
}

impl<T: StripedValue> Striped64<T> {
    /// Create an accumulator whose base holds `base`, with a table capped by the number of CPUs.
    pub fn new(base: T) -> Self {
        Self::with_parallelism(base, available_parallelism())
    }

    /// Create an accumulator whose table stops growing once it has at least `ncpu` cells.
    ///
    /// The table has at least 2 cells once created, whatever `ncpu`.
    pub fn with_parallelism(base: T, ncpu: usize) -> Self {
        Self {
            base: Atomic::new(base),
            cells: AtomicPtr::new(std::ptr::null_mut()),
            busy: AtomicBool::new(false),
            ncpu: ncpu.max(1),
        }
    }

    /// The parallelism the table growth is capped by.
    pub fn parallelism(&self) -> usize {
        self.ncpu
    }

    /// Current value of the base.
    #[inline]
    pub fn base(&self) -> T {
        self.base.load(Ordering::Acquire)
    }

    /// CAS the base from `current` to `new`. Return `true` iff it took effect.
    #[inline]
    pub fn cas_base(&self, current: T, new: T) -> bool {
        self.base
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Try to take the structural lock, without waiting.
    #[inline]
    pub fn try_lock(&self) -> Option<BusyGuard<'_>> {
        if self.is_busy() {
            return None;
        }
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| BusyGuard(&self.busy))
    }

    #[inline]
    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Relaxed)
    }

    #[inline]
    fn table(&self) -> Option<&Table<T>> {
        // SAFETY: tables are freed only when `self` is dropped.
        unsafe { self.cells.load(Ordering::Acquire).as_ref() }
    }

    /// Snapshot of the current cell table, if any.
    pub fn cells(&self) -> Option<Cells<'_, T>> {
        self.table().map(|table| Cells { table })
    }

    /// Length of the cell table, 0 if it was not created yet.
    pub fn table_len(&self) -> usize {
        self.table().map_or(0, Table::len)
    }

    /// The cell the calling thread currently hashes to, if it exists.
    #[inline]
    pub fn probe_cell(&self) -> Option<&Cell<T>> {
        let table = self.table()?;
        table.get(table.index(probe::current()))
    }

    /// Add `x`.
    #[inline]
    pub fn add(&self, x: T) {
        self.update(x, None::<&fn(T, T) -> T>);
    }

    /// Combine `x` into the accumulator with `combine`, or add it if `combine` is `None`.
    ///
    /// This tries a single CAS on the base (or, if the table exists, on the cell of the calling
    /// thread) and falls back to [`accumulate`](Self::accumulate) if it fails.
    #[inline]
    pub fn update<F: FnAcc<T> + ?Sized>(&self, x: T, combine: Option<&F>) {
        if self.cells.load(Ordering::Acquire).is_null() {
            let b = self.base();
            let r = apply(b, x, combine);
            if r.same_bits(b) || self.cas_base(b, r) {
                return;
            }
        }
        match self.probe_cell() {
            Some(cell) => {
                let v = cell.load();
                if !cell.cas(v, apply(v, x, combine)) {
                    self.accumulate(x, combine, false);
                }
            }
            None => self.accumulate(x, combine, true),
        }
    }

    /// Combine `x` into the accumulator, handling table creation, growth and contention.
    ///
    /// `was_uncontended` is `false` if the caller already failed a CAS on the cell it hashes to:
    /// that CAS is then not retried before the probe is re-mixed.
    pub fn accumulate<F: FnAcc<T> + ?Sized>(
        &self,
        x: T,
        combine: Option<&F>,
        mut was_uncontended: bool,
    ) {
        let mut h = probe::current();
        if h == 0 {
            h = probe::reseed();
            was_uncontended = true;
        }
        // True if the last cell we looked at was non-empty and contended.
        let mut collide = false;
        loop {
            let current = self.cells.load(Ordering::Acquire);
            // SAFETY: tables are freed only when `self` is dropped.
            if let Some(table) = unsafe { current.as_ref() } {
                let n = table.len();
                match table.get(table.index(h)) {
                    None => {
                        if !self.is_busy() {
                            let cell = Box::new(Cell::new(x));
                            if let Some(guard) = self.try_lock() {
                                // Recheck under lock, the table may have grown.
                                let created = self.table().map_or(false, |table| {
                                    table.install(table.index(h), cell).is_ok()
                                });
                                drop(guard);
                                if created {
                                    tracing::trace!(target: "striped64", len = n, "cell created");
                                    return;
                                }
                                // Slot is now non-empty.
                                continue;
                            }
                        }
                        collide = false;
                    }
                    Some(_) if !was_uncontended => {
                        // CAS already known to fail, retry after rehash.
                        was_uncontended = true;
                    }
                    Some(cell) => {
                        let v = cell.load();
                        if cell.cas(v, apply(v, x, combine)) {
                            return;
                        }
                        if n >= self.ncpu || self.cells.load(Ordering::Acquire) != current {
                            // At max size or stale.
                            collide = false;
                        } else if !collide {
                            collide = true;
                        } else if let Some(guard) = self.try_lock() {
                            let grown = self.cells.load(Ordering::Relaxed) == current;
                            if grown {
                                // SAFETY: `current` is still the table and we hold the flag.
                                let table = Box::into_raw(unsafe { Table::grow(current) });
                                self.cells.store(table, Ordering::Release);
                            }
                            drop(guard);
                            if grown {
                                tracing::trace!(
                                    target: "striped64",
                                    from = n,
                                    to = n << 1,
                                    "table grown"
                                );
                            }
                            collide = false;
                            // Retry with expanded table.
                            continue;
                        }
                    }
                }
                h = probe::advance(h);
            } else {
                if let Some(guard) = self.try_lock() {
                    let init = self.cells.load(Ordering::Relaxed).is_null();
                    if init {
                        let table = Box::into_raw(Table::init(h, x));
                        self.cells.store(table, Ordering::Release);
                    }
                    drop(guard);
                    if init {
                        tracing::trace!(target: "striped64", "table initialized");
                        return;
                    }
                    continue;
                }
                // Fall back on using base.
                let v = self.base();
                if self.cas_base(v, apply(v, x, combine)) {
                    return;
                }
            }
        }
    }

    /// Combine `init`, the base and every cell with `f`.
    ///
    /// Concurrent updates may or may not be reflected in the result.
    pub fn fold<F: FnAcc<T> + ?Sized>(&self, init: T, f: &F) -> T {
        let table = self.table();
        let acc = f.call(init, self.base());
        table
            .into_iter()
            .flat_map(Table::iter)
            .fold(acc, |acc, cell| f.call(acc, cell.load()))
    }

    /// Sum of the base and of all cells.
    ///
    /// The result is exact only when no update runs concurrently.
    pub fn sum(&self) -> T {
        self.fold(T::zero(), &|a: T, b: T| a.plus(b))
    }

    /// Set the base and every cell to `value`.
    ///
    /// Updates concurrent with a reset may be lost.
    pub fn reset(&self, value: T) {
        self.base.store(value, Ordering::Release);
        if let Some(table) = self.table() {
            for cell in table.iter() {
                cell.store(value);
            }
        }
    }

    /// Combine every slot with `f` starting from `init`, resetting each slot to `value` as it is
    /// read.
    pub fn fold_then_reset<F: FnAcc<T> + ?Sized>(&self, init: T, value: T, f: &F) -> T {
        let table = self.table();
        let acc = f.call(init, self.base.swap(value, Ordering::AcqRel));
        table.into_iter().flat_map(Table::iter).fold(acc, |acc, cell| {
            f.call(acc, cell.swap(value))
        })
    }
}

impl<T: StripedValue> Default for Striped64<T> {
    fn default() -> Self {
        Self::new(T::zero())
    }
}

impl<T: StripedValue + fmt::Debug> fmt::Debug for Striped64<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Striped64")
            .field("base", &self.base())
            .field("table_len", &self.table_len())
            .field("parallelism", &self.ncpu)
            .finish()
    }
}

impl<T: StripedValue> Drop for Striped64<T> {
    fn drop(&mut self) {
        let head = std::mem::replace(self.cells.get_mut(), std::ptr::null_mut());
        // SAFETY: `head` is the newest table, and `&mut self` guarantees that no reference to any
        // table or cell is alive.
        unsafe { Table::free_chain(head) };
    }
}

/// Read-only view of the cell table of a [`Striped64`].
pub struct Cells<'a, T: StripedValue> {
    table: &'a Table<T>,
}

impl<'a, T: StripedValue> Cells<'a, T> {
    /// Length of the table (a power of two).
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Always `false`: a table is never empty.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The cell at index `i`, if it was created.
    pub fn get(&self, i: usize) -> Option<&'a Cell<T>> {
        self.table.get(i)
    }

    /// Iterate over the cells that were created.
    pub fn iter(&self) -> impl Iterator<Item = &'a Cell<T>> + 'a {
        let table = self.table;
        (0..table.len()).filter_map(move |i| table.get(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_utils::thread::scope;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};

    #[test]
    fn uncontended_updates_stay_on_base() {
        let striped: Striped64<i64> = Striped64::default();
        striped.add(5);
        assert_eq!(striped.base(), 5);
        assert_eq!(striped.table_len(), 0);
        assert!(striped.cells().is_none());
    }

    #[test]
    fn accumulate_initializes_table() {
        std::thread::spawn(|| {
            let striped: Striped64<i64> = Striped64::with_parallelism(0, 8);
            striped.accumulate(4, None::<&fn(i64, i64) -> i64>, true);
            let h = probe::current();
            assert_ne!(h, 0);
            assert_eq!(striped.base(), 0);
            let cells = striped.cells().unwrap();
            assert_eq!(cells.len(), 2);
            assert_eq!(cells.iter().count(), 1);
            assert_eq!(cells.get((h & 1) as usize).map(Cell::load), Some(4));
            assert_eq!(striped.probe_cell().map(Cell::load), Some(4));
            assert_eq!(striped.sum(), 4);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn accumulate_creates_missing_cell() {
        std::thread::spawn(|| {
            let striped: Striped64<i64> = Striped64::with_parallelism(0, 8);
            striped.accumulate(1, None::<&fn(i64, i64) -> i64>, true);
            let h = probe::current();
            // Move this thread to the other slot of the two-slot table.
            let mut other = h;
            while other & 1 == h & 1 {
                other = probe::advance(other);
            }
            striped.accumulate(2, None::<&fn(i64, i64) -> i64>, true);
            assert_eq!(striped.table_len(), 2);
            assert_eq!(striped.cells().unwrap().iter().count(), 2);
            assert_eq!(striped.sum(), 3);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn single_writer_fold() {
        let max = |a: i64, b: i64| a.max(b);
        let striped = Striped64::new(i64::MIN);
        for x in [3, -7, 12, 5, 11].iter() {
            striped.update(*x, Some(&max));
        }
        assert_eq!(striped.fold(i64::MIN, &max), 12);

        let striped: Striped64<i64> = Striped64::default();
        for x in 1..=100 {
            striped.add(x);
        }
        assert_eq!(striped.sum(), 5050);
    }

    fn no_combine() -> Option<&'static fn(i64, i64) -> i64> {
        None
    }

    /// Move the calling thread's probe to the other slot of a two-slot table.
    fn move_to_other_slot(h: u32) -> u32 {
        let mut other = probe::advance(h);
        while other & 1 == h & 1 {
            other = probe::advance(other);
        }
        other
    }

    #[test]
    fn busy_table_init_falls_back_to_base() {
        std::thread::spawn(|| {
            let striped: Striped64<i64> = Striped64::with_parallelism(0, 8);
            let guard = striped.try_lock().unwrap();
            striped.accumulate(5, no_combine(), true);
            assert_eq!(striped.base(), 5);
            assert_eq!(striped.table_len(), 0);
            for _ in 0..100 {
                striped.accumulate(1, no_combine(), false);
            }
            assert_eq!(striped.base(), 105);
            assert_eq!(striped.table_len(), 0);
            drop(guard);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn collision_on_base_creates_table() {
        std::thread::spawn(|| {
            let striped: Striped64<i64> = Striped64::with_parallelism(0, 8);
            striped.add(5);
            assert_eq!(striped.base(), 5);
            assert_eq!(striped.table_len(), 0);

            // What a thread that lost the CAS on the base would call.
            striped.accumulate(3, no_combine(), false);
            let h = probe::current();
            assert_eq!(striped.base(), 5);
            assert_eq!(striped.table_len(), 2);
            let cells = striped.cells().unwrap();
            assert_eq!(cells.iter().count(), 1);
            assert_eq!(cells.get((h & 1) as usize).map(Cell::load), Some(3));
            assert_eq!(striped.sum(), 8);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn known_contended_cell_rehashes_first() {
        std::thread::spawn(|| {
            let striped: Striped64<i64> = Striped64::with_parallelism(0, 8);
            striped.accumulate(3, no_combine(), true);
            let h = probe::current();
            assert!(striped.probe_cell().is_some());

            striped.accumulate(1, no_combine(), false);
            assert_ne!(probe::current(), h);
            assert_eq!(striped.table_len(), 2);
            assert_eq!(striped.sum(), 4);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn busy_empty_slot_moves_to_another_cell() {
        std::thread::spawn(|| {
            let striped: Striped64<i64> = Striped64::with_parallelism(0, 8);
            striped.accumulate(3, no_combine(), true);
            let h = probe::current();
            let other = move_to_other_slot(h);
            assert!(striped.probe_cell().is_none());

            let guard = striped.try_lock().unwrap();
            striped.accumulate(2, no_combine(), true);
            drop(guard);

            assert_ne!(probe::current(), other);
            assert_eq!(striped.base(), 0);
            let cells = striped.cells().unwrap();
            assert_eq!(cells.iter().count(), 1);
            assert_eq!(cells.get((h & 1) as usize).map(Cell::load), Some(5));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn float_update_keeps_sign_of_zero() {
        let striped: Striped64<f64> = Striped64::new(-0.0);
        striped.add(0.0);
        assert_eq!(striped.base().to_bits(), 0.0f64.to_bits());
        striped.add(0.0);
        assert_eq!(striped.base().to_bits(), 0.0f64.to_bits());
    }

    #[test]
    fn cells_snapshot_crosses_threads() {
        std::thread::spawn(|| {
            let striped: Striped64<i64> = Striped64::with_parallelism(0, 8);
            striped.accumulate(6, no_combine(), true);
            let cells = striped.cells().unwrap();
            let total = scope(|s| {
                s.spawn(|_| cells.iter().map(Cell::load).sum::<i64>())
                    .join()
                    .unwrap()
            })
            .unwrap();
            assert_eq!(total, 6);
        })
        .join()
        .unwrap();
    }

    struct Witnessed {
        striped: Striped64<i64>,
        events: AtomicUsize,
        while_busy: AtomicUsize,
    }

    /// Counts the events emitted while the structural lock of `striped` is held.
    struct LockWitness(Arc<Witnessed>);

    impl tracing::Subscriber for LockWitness {
        fn enabled(&self, _: &tracing::Metadata<'_>) -> bool {
            true
        }
        fn new_span(&self, _: &tracing::span::Attributes<'_>) -> tracing::span::Id {
            tracing::span::Id::from_u64(1)
        }
        fn record(&self, _: &tracing::span::Id, _: &tracing::span::Record<'_>) {}
        fn record_follows_from(&self, _: &tracing::span::Id, _: &tracing::span::Id) {}
        fn event(&self, _: &tracing::Event<'_>) {
            self.0.events.fetch_add(1, Ordering::Relaxed);
            if self.0.striped.try_lock().is_none() {
                self.0.while_busy.fetch_add(1, Ordering::Relaxed);
            }
        }
        fn enter(&self, _: &tracing::span::Id) {}
        fn exit(&self, _: &tracing::span::Id) {}
    }

    #[test]
    fn events_are_emitted_after_unlock() {
        std::thread::spawn(|| {
            let witnessed = Arc::new(Witnessed {
                striped: Striped64::with_parallelism(0, 8),
                events: AtomicUsize::new(0),
                while_busy: AtomicUsize::new(0),
            });
            let subscriber = LockWitness(witnessed.clone());
            tracing::subscriber::with_default(subscriber, || {
                let striped = &witnessed.striped;
                striped.accumulate(1, no_combine(), true);
                move_to_other_slot(probe::current());
                striped.accumulate(2, no_combine(), true);
                assert_eq!(striped.cells().unwrap().iter().count(), 2);
            });
            assert_eq!(witnessed.events.load(Ordering::Relaxed), 2);
            assert_eq!(witnessed.while_busy.load(Ordering::Relaxed), 0);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn two_contending_adds() {
        let striped: Striped64<i64> = Striped64::default();
        striped.add(5);
        let barrier = Barrier::new(2);
        scope(|s| {
            for _ in 0..2 {
                s.spawn(|_| {
                    barrier.wait();
                    striped.add(3);
                });
            }
        })
        .unwrap();
        assert_eq!(striped.sum(), 11);
        let len = striped.table_len();
        assert!(len == 0 || len == 2);
    }

    #[test]
    fn no_lost_updates() {
        const THREADS: usize = 8;
        const ADDS: i64 = 20_000;
        let striped: Striped64<i64> = Striped64::with_parallelism(0, 4);
        scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|_| {
                    for _ in 0..ADDS {
                        striped.add(1);
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(striped.sum(), THREADS as i64 * ADDS);
        assert!(striped.table_len() <= 4);
    }

    #[test]
    fn table_only_grows() {
        let striped: Striped64<u64> = Striped64::with_parallelism(0, 3);
        let done = AtomicBool::new(false);
        scope(|s| {
            let writers = (0..6)
                .map(|_| {
                    s.spawn(|_| {
                        for _ in 0..20_000 {
                            striped.add(1);
                        }
                    })
                })
                .collect::<Vec<_>>();
            s.spawn(|_| {
                let mut last = 0;
                while !done.load(Ordering::Relaxed) {
                    let len = striped.table_len();
                    assert!(len >= last);
                    assert!(len == 0 || len.is_power_of_two());
                    assert!(len <= 4);
                    last = len;
                }
            });
            for w in writers {
                w.join().unwrap();
            }
            done.store(true, Ordering::Relaxed);
        })
        .unwrap();
        assert_eq!(striped.sum(), 6 * 20_000);
    }

    #[test]
    fn growth_cap_is_at_least_two() {
        let striped: Striped64<i64> = Striped64::with_parallelism(0, 0);
        assert_eq!(striped.parallelism(), 1);
        scope(|s| {
            for _ in 0..4 {
                s.spawn(|_| {
                    for _ in 0..10_000 {
                        striped.add(1);
                    }
                });
            }
        })
        .unwrap();
        assert!(striped.table_len() <= 2);
        assert_eq!(striped.sum(), 40_000);
    }

    #[test]
    fn float_domain() {
        let striped: Striped64<f64> = Striped64::with_parallelism(0.0, 4);
        scope(|s| {
            for _ in 0..4 {
                s.spawn(|_| {
                    for _ in 0..10_000 {
                        striped.add(0.5);
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(striped.sum(), 20_000.0);
    }

    #[test]
    fn reset_and_fold_then_reset() {
        std::thread::spawn(|| {
            let striped: Striped64<i64> = Striped64::default();
            striped.add(2);
            striped.accumulate(3, None::<&fn(i64, i64) -> i64>, true);
            assert_eq!(striped.sum(), 5);
            let plus = |a: i64, b: i64| a + b;
            assert_eq!(striped.fold_then_reset(0, 0, &plus), 5);
            assert_eq!(striped.sum(), 0);
            striped.add(4);
            striped.reset(0);
            assert_eq!(striped.sum(), 0);
            assert_eq!(striped.table_len(), 2);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn lock_is_released_on_drop() {
        let striped: Striped64<i64> = Striped64::default();
        let guard = striped.try_lock().unwrap();
        assert!(striped.try_lock().is_none());
        drop(guard);
        assert!(striped.try_lock().is_some());
    }

    #[test]
    fn debug_output() {
        let striped: Striped64<i64> = Striped64::with_parallelism(7, 2);
        assert_eq!(
            format!("{:?}", striped),
            "Striped64 { base: 7, table_len: 0, parallelism: 2 }"
        );
    }
}
