/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Shape and index primitives for the gridflow framework.
//!
//! Provides [`Shape`], [`Offset`], and [`Region`], the fixed-rank
//! building blocks shared by every layer of the partitioned-array
//! runtime, and [`Tiling`], the row-major block decomposition that
//! assigns every cell of a logical array to exactly one partition.
//!
//! Rank is a const generic parameter throughout, so entities that
//! cooperate on an array agree on its dimensionality at compile time.
//! The crate deliberately has no runtime dependencies beyond serde;
//! it is reused by both the partition runtime and the operation
//! layer.

mod region;
mod shape;
mod tiling;

pub use region::Region;
pub use shape::Index;
pub use shape::IndexIterator;
pub use shape::Offset;
pub use shape::Shape;
pub use shape::ShapeError;
pub use shape::offset_index;
pub use tiling::Tiling;
