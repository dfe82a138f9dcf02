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

#![deny(missing_docs)]

//! Striped64
//! Counters and accumulators that many threads can hammer at once.
//!
//! The engine of this library is [`Striped64`]: a 64-bit value updated by CAS on a single base
//! while threads do not contend, and spread over a growing table of cache-padded cells when they
//! do. [`StripedAdder`] is a sum on top of it, and [`StripedAcc`] accumulates with any
//! associative and commutative function.
//!
//! These are modelled after Java's
//! [`LongAdder`](https://docs.oracle.com/javase/8/docs/api/java/util/concurrent/atomic/LongAdder.html),
//! [`DoubleAdder`](https://docs.oracle.com/javase/8/docs/api/java/util/concurrent/atomic/DoubleAdder.html),
//! [`LongAccumulator`](https://docs.oracle.com/javase/8/docs/api/java/util/concurrent/atomic/LongAccumulator.html)
//! and
//! [`DoubleAccumulator`](https://docs.oracle.com/javase/8/docs/api/java/util/concurrent/atomic/DoubleAccumulator.html).
//!
//!  [`Striped64`]: struct.Striped64.html
//!  [`StripedAdder`]: struct.StripedAdder.html
//!  [`StripedAcc`]: struct.StripedAcc.html

mod cell;
pub mod probe;
mod striped;
mod value;

pub use cell::Cell;
pub use striped::{BusyGuard, Cells, Striped64};
pub use value::StripedValue;

use num_traits::One;
use std::fmt;
use std::ops::Neg;

/// This is workaround for the fact that the Fn trait is not stable.
/// We could have `StripedAcc<T, F: Fn(T, T) -> T>`.  However, since the `Fn` trait is not stable,
/// this would not allow to have `StripedAcc` for an accumulator other than a closure (which makes
/// the type un-namable) or a function pointer (which means dynamic dispatch).
/// The `FnAcc` is a custom trait that we use as a purpose-specific variant of `Fn(T, T) -> T`.
pub trait FnAcc<T> {
    /// Call the function.
    fn call(&self, arg1: T, arg2: T) -> T;
}

impl<T, U: Fn(T, T) -> T> FnAcc<T> for U {
    fn call(&self, arg1: T, arg2: T) -> T {
        self(arg1, arg2)
    }
}

/// The striped accumulator allows to accumulate data in a single state from multiple threads,
/// spreading the updates over more memory as contention grows.
///
/// The accumulation function must be associative and commutative, and the `identity` element
/// must be the neutral element w.r.t. the accumulation function. Since a contended update may be
/// retried, the function should be free of side effects.
///
/// Memory usage stays at a single value as long as there is no contention, and is bounded by one
/// cache line per CPU.
///
/// ```rust
/// use striped64::StripedAcc;
/// let acc: StripedAcc<i64, _> = StripedAcc::new(|a: i64, b: i64| a.max(b), i64::MIN);
/// let acc_ref = &acc;
/// crossbeam_utils::thread::scope(|s| {
///     for j in 1..=2 {
///         s.spawn(move |_| {
///             for i in 1..=3 {
///                 acc_ref.acc(i*j);
///             }
///         });
///     }
/// })
/// .unwrap();
/// assert_eq!(acc.get(), 6);
/// ```
pub struct StripedAcc<T: StripedValue, F: FnAcc<T>> {
    state: Striped64<T>,
    acc_fn: F,
    identity: T,
}

impl<T: StripedValue, F: FnAcc<T>> StripedAcc<T, F> {
    /// Create a `StripedAcc`.
    pub fn new(acc_fn: F, identity: T) -> Self {
        Self {
            state: Striped64::new(identity),
            acc_fn,
            identity,
        }
    }
    /// Accumulate `x`. If `state` is the current state, the new state is `acc_fn(state, x)`.
    pub fn acc(&self, x: T) {
        self.state.update(x, Some(&self.acc_fn));
    }
    /// Return the current state.
    ///
    /// Accumulations that run concurrently with `get` may or may not be included.
    pub fn get(&self) -> T {
        self.state.fold(self.identity, &self.acc_fn)
    }
    /// Reset the state to the identity.
    pub fn reset(&self) {
        self.state.reset(self.identity);
    }
    /// Return the current state and reset it to the identity.
    pub fn get_then_reset(&self) -> T {
        self.state
            .fold_then_reset(self.identity, self.identity, &self.acc_fn)
    }
    /// The identity element.
    pub fn identity(&self) -> T {
        self.identity
    }
}

impl<T: StripedValue + fmt::Debug, F: FnAcc<T>> fmt::Debug for StripedAcc<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StripedAcc")
            .field("value", &self.get())
            .field("identity", &self.identity)
            .finish()
    }
}

/// The striped adder allows to increment and decrement a number from multiple threads,
/// spreading the updates over more memory as contention grows. `StripedAdder` can wrap `i64`,
/// `u64`, `isize`, `usize` (with wrapping arithmetic) and `f64`.
///
/// See [`Striped64`] for a discussion of performance characteristics.
///
/// ```rust
/// use striped64::StripedAdder;
/// let adder: StripedAdder<i64> = StripedAdder::new();
/// crossbeam_utils::thread::scope(|s| {
///     for _ in 0..10 {
///         s.spawn(|_| {
///             for _ in 0..10 {
///                 adder.increment();
///             }
///         });
///     }
/// })
/// .unwrap();
/// assert_eq!(adder.sum(), 100);
/// ```
///
///  [`Striped64`]: struct.Striped64.html
pub struct StripedAdder<T: StripedValue>(Striped64<T>);

impl<T: StripedValue> StripedAdder<T> {
    /// Create a new `StripedAdder` initialized to 0.
    pub fn new() -> Self {
        Self(Striped64::default())
    }
    /// Add `x` to the `StripedAdder`.
    pub fn add(&self, x: T) {
        self.0.add(x);
    }
    /// Return the value of the `StripedAdder`.
    ///
    /// Additions that run concurrently with `sum` may or may not be included.
    pub fn sum(&self) -> T {
        self.0.sum()
    }
    /// Reset the `StripedAdder` to 0.
    pub fn reset(&self) {
        self.0.reset(T::zero());
    }
    /// Return the value of the `StripedAdder` and reset it to 0.
    pub fn sum_then_reset(&self) -> T {
        self.0
            .fold_then_reset(T::zero(), T::zero(), &|a: T, b: T| a.plus(b))
    }
}

impl<T: StripedValue + One> StripedAdder<T> {
    /// Add 1 to the `StripedAdder`.
    pub fn increment(&self) {
        self.add(T::one());
    }
}

impl<T: StripedValue + One + Neg<Output = T>> StripedAdder<T> {
    /// Subtract 1 from the `StripedAdder`.
    pub fn decrement(&self) {
        self.add(-T::one());
    }
}

impl<T: StripedValue> Default for StripedAdder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: StripedValue + fmt::Debug> fmt::Debug for StripedAdder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StripedAdder").field(&self.sum()).finish()
    }
}
