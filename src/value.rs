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

//! Numeric domains that can be striped.

use num_traits::{WrappingAdd, Zero};

/// A 64-bit-wide value that can live in a striped slot.
///
/// The slot is updated by compare-and-swap on the raw representation of the value, so two values
/// are considered equal by the CAS when their bit patterns are equal. For floats this means that
/// `-0.0` and `0.0` are distinct and that a `NaN` slot can still be updated.
pub trait StripedValue: Copy + Zero + Send + Sync + 'static {
    /// The default combining function, used when no custom function is given.
    fn plus(self, rhs: Self) -> Self;

    /// Whether `self` and `other` have the same representation, i.e. whether a CAS expecting
    /// `other` would succeed on a slot holding `self`.
    fn same_bits(self, other: Self) -> bool;
}

macro_rules! impl_wrapping {
    ($($t:ty),*) => {
        $(
            impl StripedValue for $t {
                #[inline]
                fn plus(self, rhs: Self) -> Self {
                    WrappingAdd::wrapping_add(&self, &rhs)
                }

                #[inline]
                fn same_bits(self, other: Self) -> bool {
                    self == other
                }
            }
        )*
    };
}

impl_wrapping!(i64, u64, isize, usize);

impl StripedValue for f64 {
    #[inline]
    fn plus(self, rhs: Self) -> Self {
        self + rhs
    }

    #[inline]
    fn same_bits(self, other: Self) -> bool {
        self.to_bits() == other.to_bits()
    }
}
