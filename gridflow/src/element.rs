/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Cell element types and their in-band no-data encoding.
//!
//! Per-element numeric conditions never surface as `Err`: a cell that
//! has no value holds its type's marker instead. Floats mark with NaN;
//! signed integers with their minimum; unsigned integers with their
//! maximum. Arithmetic on integers wraps rather than panics, matching
//! the engine's rule that element math is total.

use rand::distributions::uniform::SampleUniform;

use partactor::Cell;

/// A cell value the operation executors can compute with.
pub trait Element: Cell + PartialEq + PartialOrd + SampleUniform {
    const ZERO: Self;
    const ONE: Self;

    /// The type's canonical in-band no-data marker.
    const NO_DATA: Self;

    /// True if `self` is the canonical marker. NaN-aware for floats.
    fn is_no_data(self) -> bool;

    fn elem_add(self, other: Self) -> Self;
    fn elem_sub(self, other: Self) -> Self;
    fn elem_mul(self, other: Self) -> Self;

    /// Division; callers guard against zero divisors.
    fn elem_div(self, other: Self) -> Self;

    /// Negation, `None` where the type cannot represent the result.
    fn checked_neg(self) -> Option<Self>;

    fn elem_abs(self) -> Self;

    /// Square root, `None` outside the domain (all integers, negative
    /// floats).
    fn checked_sqrt(self) -> Option<Self>;

    fn elem_max(self, other: Self) -> Self;
}

/// Floating-point elements; required where results are fractional.
pub trait Real: Element {
    fn from_count(count: usize) -> Self;
}

/// Integer elements; usable as zone identifiers.
pub trait Integral: Element + Eq + std::hash::Hash {}

macro_rules! float_element {
    ($($t:ty),*) => {$(
        impl Element for $t {
            const ZERO: Self = 0.0;
            const ONE: Self = 1.0;
            const NO_DATA: Self = <$t>::NAN;

            fn is_no_data(self) -> bool {
                self.is_nan()
            }

            fn elem_add(self, other: Self) -> Self {
                self + other
            }

            fn elem_sub(self, other: Self) -> Self {
                self - other
            }

            fn elem_mul(self, other: Self) -> Self {
                self * other
            }

            fn elem_div(self, other: Self) -> Self {
                self / other
            }

            fn checked_neg(self) -> Option<Self> {
                Some(-self)
            }

            fn elem_abs(self) -> Self {
                self.abs()
            }

            fn checked_sqrt(self) -> Option<Self> {
                (self >= 0.0).then(|| self.sqrt())
            }

            fn elem_max(self, other: Self) -> Self {
                self.max(other)
            }
        }

        impl Real for $t {
            fn from_count(count: usize) -> Self {
                count as $t
            }
        }
    )*};
}

macro_rules! signed_element {
    ($($t:ty),*) => {$(
        impl Element for $t {
            const ZERO: Self = 0;
            const ONE: Self = 1;
            const NO_DATA: Self = <$t>::MIN;

            fn is_no_data(self) -> bool {
                self == Self::NO_DATA
            }

            fn elem_add(self, other: Self) -> Self {
                self.wrapping_add(other)
            }

            fn elem_sub(self, other: Self) -> Self {
                self.wrapping_sub(other)
            }

            fn elem_mul(self, other: Self) -> Self {
                self.wrapping_mul(other)
            }

            fn elem_div(self, other: Self) -> Self {
                self.wrapping_div(other)
            }

            fn checked_neg(self) -> Option<Self> {
                <$t>::checked_neg(self)
            }

            fn elem_abs(self) -> Self {
                self.wrapping_abs()
            }

            fn checked_sqrt(self) -> Option<Self> {
                None
            }

            fn elem_max(self, other: Self) -> Self {
                Ord::max(self, other)
            }
        }

        impl Integral for $t {}
    )*};
}

macro_rules! unsigned_element {
    ($($t:ty),*) => {$(
        impl Element for $t {
            const ZERO: Self = 0;
            const ONE: Self = 1;
            const NO_DATA: Self = <$t>::MAX;

            fn is_no_data(self) -> bool {
                self == Self::NO_DATA
            }

            fn elem_add(self, other: Self) -> Self {
                self.wrapping_add(other)
            }

            fn elem_sub(self, other: Self) -> Self {
                self.wrapping_sub(other)
            }

            fn elem_mul(self, other: Self) -> Self {
                self.wrapping_mul(other)
            }

            fn elem_div(self, other: Self) -> Self {
                self.wrapping_div(other)
            }

            fn checked_neg(self) -> Option<Self> {
                (self == 0).then_some(0)
            }

            fn elem_abs(self) -> Self {
                self
            }

            fn checked_sqrt(self) -> Option<Self> {
                None
            }

            fn elem_max(self, other: Self) -> Self {
                Ord::max(self, other)
            }
        }

        impl Integral for $t {}
    )*};
}

float_element!(f32, f64);
signed_element!(i8, i32, i64);
unsigned_element!(u8, u32, u64);
