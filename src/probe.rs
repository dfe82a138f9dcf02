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

//! Per-thread probe used to pick a slot in the cell table.
//!
//! The probe is zero until the thread first contends on an accumulator. It is then seeded with a
//! random non-zero value, and re-mixed with a xorshift step each time the thread collides with
//! another one on a cell.

use std::cell::Cell;

thread_local! {
    static PROBE: Cell<u32> = const { Cell::new(0) };
}

/// Return the probe of the calling thread, or 0 if it was never seeded.
#[inline]
pub fn current() -> u32 {
    PROBE.try_with(Cell::get).unwrap_or(0)
}

/// Seed the probe of the calling thread with a fresh non-zero value and return it.
pub fn reseed() -> u32 {
    let seed = match rand::random::<u32>() {
        0 => 1,
        seed => seed,
    };
    // The thread-local may already be destroyed if we are called from another thread-local's
    // destructor. The caller can still use the value for this call.
    let _ = PROBE.try_with(|p| p.set(seed));
    seed
}

/// Mix `probe` with a Marsaglia xorshift step, record it as the probe of the calling thread and
/// return it.
#[inline]
pub fn advance(mut probe: u32) -> u32 {
    probe ^= probe << 13;
    probe ^= probe >> 17;
    probe ^= probe << 5;
    let _ = PROBE.try_with(|p| p.set(probe));
    probe
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unseeded_thread_reads_zero() {
        std::thread::spawn(|| assert_eq!(current(), 0))
            .join()
            .unwrap();
    }

    #[test]
    fn reseed_is_nonzero_and_stored() {
        std::thread::spawn(|| {
            let a = reseed();
            assert_ne!(a, 0);
            assert_eq!(current(), a);
            let b = reseed();
            assert_ne!(b, 0);
            assert_eq!(current(), b);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn reseeds_differ() {
        // Two 32-bit draws collide with probability 2^-32; retrying a few times makes a spurious
        // failure practically impossible.
        let differ = (0..8).any(|_| reseed() != reseed());
        assert!(differ);
    }

    #[test]
    fn advance_is_xorshift() {
        let mut p: u32 = 1;
        p ^= p << 13;
        p ^= p >> 17;
        p ^= p << 5;
        assert_eq!(advance(1), p);
        assert_eq!(current(), p);
    }

    #[test]
    fn advance_never_reaches_zero() {
        let mut p = reseed();
        for _ in 0..10_000 {
            p = advance(p);
            assert_ne!(p, 0);
        }
    }
}
