/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use serde::Deserialize;
use serde::Serialize;

use crate::shape::Index;
use crate::shape::Offset;
use crate::shape::Shape;
use crate::shape::ShapeError;

/// A rectangular window into a rank-`R` array: an offset plus extents.
/// Regions are half-open: they cover `offset[d] .. offset[d] + extent[d]`
/// in every dimension.
#[derive(Serialize, Deserialize, Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Region<const R: usize> {
    offset: Offset<R>,
    shape: Shape<R>,
}

impl<const R: usize> Region<R> {
    /// The window at `offset` with the given extents.
    pub fn new(offset: Offset<R>, shape: Shape<R>) -> Self {
        Self { offset, shape }
    }

    /// The window covering all of `shape`, anchored at the origin.
    pub fn of_shape(shape: Shape<R>) -> Self {
        Self {
            offset: Offset::origin(),
            shape,
        }
    }

    pub fn offset(&self) -> Offset<R> {
        self.offset
    }

    pub fn shape(&self) -> Shape<R> {
        self.shape
    }

    /// One past the last covered position in dimension `dim`.
    pub fn end(&self, dim: usize) -> usize {
        self.offset.coord(dim) + self.shape.extent(dim)
    }

    pub fn nr_elements(&self) -> usize {
        self.shape.nr_elements()
    }

    pub fn is_empty(&self) -> bool {
        self.shape.is_empty()
    }

    /// True if the (frame-global) coordinate falls inside this window.
    pub fn contains(&self, index: Index<R>) -> bool {
        (0..R).all(|dim| index[dim] >= self.offset.coord(dim) && index[dim] < self.end(dim))
    }

    /// Error unless the window lies entirely within an array of shape
    /// `outer`.
    pub fn checked_within(&self, outer: &Shape<R>) -> Result<(), ShapeError> {
        if (0..R).any(|dim| self.end(dim) > outer.extent(dim)) {
            return Err(ShapeError::RegionOutOfBounds {
                offset: self.offset.coords().to_vec(),
                extents: self.shape.extents().to_vec(),
                shape: outer.extents().to_vec(),
            });
        }
        Ok(())
    }

    /// The overlap of two windows expressed in the same frame, or
    /// `None` if they are disjoint (or the overlap is empty).
    pub fn intersect(&self, other: &Region<R>) -> Option<Region<R>> {
        let mut offset = [0; R];
        let mut extents = [0; R];
        for dim in 0..R {
            let begin = self.offset.coord(dim).max(other.offset.coord(dim));
            let end = self.end(dim).min(other.end(dim));
            if begin >= end {
                return None;
            }
            offset[dim] = begin;
            extents[dim] = end - begin;
        }
        Some(Region::new(Offset::new(offset), Shape::new(extents)))
    }

    /// Re-express this window relative to an enclosing `frame` (both in
    /// the same outer coordinate system). `None` if the window is not
    /// fully contained in the frame.
    pub fn localize(&self, frame: &Region<R>) -> Option<Region<R>> {
        let mut offset = [0; R];
        for dim in 0..R {
            if self.offset.coord(dim) < frame.offset.coord(dim) || self.end(dim) > frame.end(dim) {
                return None;
            }
            offset[dim] = self.offset.coord(dim) - frame.offset.coord(dim);
        }
        Some(Region::new(Offset::new(offset), self.shape))
    }

    /// Iterate the frame-global coordinates covered by the window, in
    /// row-major order.
    pub fn indices(&self) -> impl Iterator<Item = Index<R>> + '_ {
        self.shape
            .indices()
            .map(move |local| self.offset.globalize(local))
    }
}

impl<const R: usize> std::fmt::Display for Region<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.shape, self.offset)
    }
}
