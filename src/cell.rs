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

//! Cells and the table that holds them.

use crate::StripedValue;
use atomic::Atomic;
use crossbeam_utils::CachePadded;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// A padded atomic slot of the cell table.
///
/// Cells sit next to each other in memory once they are allocated together, so each of them is
/// padded to a full cache line: otherwise threads updating neighbouring cells would keep
/// invalidating each other's cache lines.
#[derive(Debug)]
pub struct Cell<T: StripedValue> {
    value: CachePadded<Atomic<T>>,
}

impl<T: StripedValue> Cell<T> {
    pub(crate) fn new(x: T) -> Self {
        Self {
            value: CachePadded::new(Atomic::new(x)),
        }
    }

    /// Current value of the cell.
    #[inline]
    pub fn load(&self) -> T {
        self.value.load(Ordering::Acquire)
    }

    /// Replace `current` by `new`. Return `true` iff the cell held `current` (bitwise).
    #[inline]
    pub fn cas(&self, current: T, new: T) -> bool {
        self.value
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub(crate) fn store(&self, x: T) {
        self.value.store(x, Ordering::Release);
    }

    #[inline]
    pub(crate) fn swap(&self, x: T) -> T {
        self.value.swap(x, Ordering::AcqRel)
    }
}

/// A power-of-two sized table of lazily-populated cells.
///
/// A slot, once populated, is never emptied. When the table grows, the new table references the
/// same cells as the old one at the same indices, and keeps the old table alive through `prev`:
/// threads may still be looking at it.
pub(crate) struct Table<T: StripedValue> {
    slots: Box<[AtomicPtr<Cell<T>>]>,
    prev: AtomicPtr<Table<T>>,
}

impl<T: StripedValue> Table<T> {
    /// Two-slot table with `x` in slot `probe & 1`.
    pub(crate) fn init(probe: u32, x: T) -> Box<Self> {
        let table = Self::empty(2, ptr::null_mut());
        let cell = Box::into_raw(Box::new(Cell::new(x)));
        table.slots[(probe & 1) as usize].store(cell, Ordering::Release);
        table
    }

    /// Table of twice the length of `old`, sharing its cells.
    ///
    /// # Safety
    /// `old` must be the current table of an accumulator whose busy flag is held by the caller,
    /// and the caller must publish the result in place of `old`.
    pub(crate) unsafe fn grow(old: *mut Table<T>) -> Box<Self> {
        let old_ref = &*old;
        let table = Self::empty(old_ref.len() << 1, old);
        for (new, cur) in table.slots.iter().zip(old_ref.slots.iter()) {
            new.store(cur.load(Ordering::Acquire), Ordering::Relaxed);
        }
        table
    }

    fn empty(len: usize, prev: *mut Table<T>) -> Box<Self> {
        debug_assert!(len.is_power_of_two());
        let slots = (0..len)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::new(Self {
            slots,
            prev: AtomicPtr::new(prev),
        })
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub(crate) fn index(&self, probe: u32) -> usize {
        (self.len() - 1) & probe as usize
    }

    #[inline]
    pub(crate) fn get(&self, i: usize) -> Option<&Cell<T>> {
        // SAFETY: populated slots point to cells that are freed only when the accumulator is
        // dropped.
        unsafe { self.slots[i].load(Ordering::Acquire).as_ref() }
    }

    /// Install `cell` at `i` if the slot is empty. On failure, the cell is handed back.
    ///
    /// The caller must hold the busy flag.
    pub(crate) fn install(&self, i: usize, cell: Box<Cell<T>>) -> Result<(), Box<Cell<T>>> {
        let slot = &self.slots[i];
        if slot.load(Ordering::Relaxed).is_null() {
            slot.store(Box::into_raw(cell), Ordering::Release);
            Ok(())
        } else {
            Err(cell)
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Cell<T>> {
        (0..self.len()).filter_map(move |i| self.get(i))
    }

    /// Free the chain of tables starting at `head` and every cell it references.
    ///
    /// # Safety
    /// `head` must be the newest table of its chain (it references every cell ever created), and
    /// no other reference to the chain may exist.
    pub(crate) unsafe fn free_chain(head: *mut Table<T>) {
        if head.is_null() {
            return;
        }
        for slot in (*head).slots.iter() {
            let cell = slot.load(Ordering::Relaxed);
            if !cell.is_null() {
                drop(Box::from_raw(cell));
            }
        }
        let mut table = head;
        while !table.is_null() {
            let boxed = Box::from_raw(table);
            table = boxed.prev.load(Ordering::Relaxed);
        }
    }
}
