/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use serde::Deserialize;
use serde::Serialize;

use crate::region::Region;
use crate::shape::Index;
use crate::shape::Offset;
use crate::shape::Shape;
use crate::shape::ShapeError;

/// A row-major block decomposition of a rank-`R` array: every tile has
/// the same shape except at the high boundary of each dimension, where
/// tiles are clamped to the array edge.
///
/// The decomposition is total and disjoint: every cell of the array
/// belongs to exactly one tile.
///
/// ```
/// # use gridslice::{Shape, Tiling};
/// let tiling = Tiling::new(Shape::new([5, 4]), Shape::new([2, 2])).unwrap();
/// assert_eq!(tiling.shape_in_tiles(), Shape::new([3, 2]));
/// // The last row of tiles is clamped to one row of cells.
/// assert_eq!(tiling.tile_region([2, 0]).unwrap().shape(), Shape::new([1, 2]));
/// ```
#[derive(Serialize, Deserialize, Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Tiling<const R: usize> {
    array_shape: Shape<R>,
    tile_shape: Shape<R>,
}

impl<const R: usize> Tiling<R> {
    /// Decompose `array_shape` into tiles of (at most) `tile_shape`.
    /// A zero tile extent is only permitted in dimensions where the
    /// array itself is empty.
    pub fn new(array_shape: Shape<R>, tile_shape: Shape<R>) -> Result<Self, ShapeError> {
        for dim in 0..R {
            if tile_shape.extent(dim) == 0 && array_shape.extent(dim) > 0 {
                return Err(ShapeError::EmptyTileExtent { dim });
            }
        }
        Ok(Self {
            array_shape,
            tile_shape,
        })
    }

    /// Decompose into square-ish tiles of `extent` cells per dimension.
    pub fn square(array_shape: Shape<R>, extent: usize) -> Result<Self, ShapeError> {
        Self::new(array_shape, Shape::new([extent; R]))
    }

    /// The trivial decomposition: one tile covering the whole array.
    pub fn single(array_shape: Shape<R>) -> Self {
        Self {
            array_shape,
            tile_shape: array_shape,
        }
    }

    pub fn array_shape(&self) -> Shape<R> {
        self.array_shape
    }

    /// The uniform (interior) tile shape. Boundary tiles may be
    /// smaller; see [`Tiling::tile_region`].
    pub fn tile_shape(&self) -> Shape<R> {
        self.tile_shape
    }

    /// The shape of the tile grid itself: ceil(array / tile) per
    /// dimension.
    pub fn shape_in_tiles(&self) -> Shape<R> {
        let mut extents = [0; R];
        for dim in 0..R {
            let array = self.array_shape.extent(dim);
            let tile = self.tile_shape.extent(dim);
            extents[dim] = if array == 0 {
                0
            } else {
                (array + tile - 1) / tile
            };
        }
        Shape::new(extents)
    }

    pub fn nr_tiles(&self) -> usize {
        self.shape_in_tiles().nr_elements()
    }

    /// The region of the array covered by the tile at `tile` (a
    /// coordinate in the tile grid), clamped at the array boundary.
    pub fn tile_region(&self, tile: Index<R>) -> Result<Region<R>, ShapeError> {
        let grid = self.shape_in_tiles();
        if !grid.contains(tile) {
            return Err(ShapeError::IndexOutOfBounds {
                index: tile.to_vec(),
                shape: grid.extents().to_vec(),
            });
        }
        let mut offset = [0; R];
        let mut extents = [0; R];
        for dim in 0..R {
            offset[dim] = tile[dim] * self.tile_shape.extent(dim);
            extents[dim] =
                self.tile_shape.extent(dim).min(self.array_shape.extent(dim) - offset[dim]);
        }
        Ok(Region::new(Offset::new(offset), Shape::new(extents)))
    }

    /// The row-major position of a tile within the tile grid.
    pub fn tile_rank(&self, tile: Index<R>) -> Result<usize, ShapeError> {
        self.shape_in_tiles().linearize(tile)
    }

    /// The tile-grid coordinate owning the array cell at `cell`.
    pub fn tile_of_cell(&self, cell: Index<R>) -> Result<Index<R>, ShapeError> {
        if !self.array_shape.contains(cell) {
            return Err(ShapeError::IndexOutOfBounds {
                index: cell.to_vec(),
                shape: self.array_shape.extents().to_vec(),
            });
        }
        let mut tile = [0; R];
        for dim in 0..R {
            tile[dim] = cell[dim] / self.tile_shape.extent(dim);
        }
        Ok(tile)
    }

    /// Iterate `(tile, region)` pairs in row-major tile order.
    pub fn regions(&self) -> impl Iterator<Item = (Index<R>, Region<R>)> + '_ {
        self.shape_in_tiles().indices().map(move |tile| {
            // The index comes from the grid itself, so the lookup
            // cannot fail.
            let region = match self.tile_region(tile) {
                Ok(region) => region,
                Err(_) => unreachable!(),
            };
            (tile, region)
        })
    }
}

impl<const R: usize> std::fmt::Display for Tiling<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} in tiles of {}", self.array_shape, self.tile_shape)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_exact_division() {
        let tiling = Tiling::new(Shape::new([4, 4]), Shape::new([2, 2])).unwrap();
        assert_eq!(tiling.shape_in_tiles(), Shape::new([2, 2]));
        assert_eq!(tiling.nr_tiles(), 4);
        for (_, region) in tiling.regions() {
            assert_eq!(region.shape(), Shape::new([2, 2]));
        }
    }

    #[test]
    fn test_boundary_clamp() {
        let tiling = Tiling::new(Shape::new([5, 3]), Shape::new([2, 2])).unwrap();
        assert_eq!(tiling.shape_in_tiles(), Shape::new([3, 2]));
        assert_eq!(
            tiling.tile_region([0, 0]).unwrap(),
            Region::new(Offset::new([0, 0]), Shape::new([2, 2]))
        );
        assert_eq!(
            tiling.tile_region([2, 1]).unwrap(),
            Region::new(Offset::new([4, 2]), Shape::new([1, 1]))
        );
    }

    #[test]
    fn test_single() {
        let tiling = Tiling::single(Shape::new([7, 9]));
        assert_eq!(tiling.nr_tiles(), 1);
        assert_eq!(
            tiling.tile_region([0, 0]).unwrap(),
            Region::of_shape(Shape::new([7, 9]))
        );
    }

    #[test]
    fn test_empty_array() {
        let tiling = Tiling::new(Shape::new([0, 5]), Shape::new([2, 2])).unwrap();
        assert_eq!(tiling.nr_tiles(), 0);
        assert_eq!(tiling.regions().count(), 0);
    }

    #[test]
    fn test_zero_tile_extent_rejected() {
        assert!(matches!(
            Tiling::new(Shape::new([4, 4]), Shape::new([2, 0])),
            Err(ShapeError::EmptyTileExtent { dim: 1 })
        ));
        // Fine when the array is empty in that dimension.
        assert!(Tiling::new(Shape::new([4, 0]), Shape::new([2, 0])).is_ok());
    }

    #[test]
    fn test_tile_of_cell() {
        let tiling = Tiling::new(Shape::new([5, 4]), Shape::new([2, 3])).unwrap();
        assert_eq!(tiling.tile_of_cell([0, 0]).unwrap(), [0, 0]);
        assert_eq!(tiling.tile_of_cell([4, 3]).unwrap(), [2, 1]);
        assert!(tiling.tile_of_cell([5, 0]).is_err());
    }

    #[test]
    fn test_serde_round_trip() {
        let tiling = Tiling::new(Shape::new([5, 4]), Shape::new([2, 3])).unwrap();
        let bytes = bincode::serialize(&tiling).unwrap();
        let back: Tiling<2> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, tiling);
    }

    proptest! {
        // Every cell of the array is covered by exactly one tile, for
        // all boundary remainder cases.
        #[test]
        fn test_tiles_partition_the_array(
            rows in 0usize..=12,
            cols in 0usize..=12,
            tile_rows in 1usize..=5,
            tile_cols in 1usize..=5,
        ) {
            let array_shape = Shape::new([rows, cols]);
            let tiling =
                Tiling::new(array_shape, Shape::new([tile_rows, tile_cols])).unwrap();

            let mut covered = vec![0u32; array_shape.nr_elements()];
            for (tile, region) in tiling.regions() {
                region.checked_within(&array_shape).unwrap();
                for cell in region.indices() {
                    covered[array_shape.linearize(cell).unwrap()] += 1;
                    prop_assert_eq!(tiling.tile_of_cell(cell).unwrap(), tile);
                }
            }
            prop_assert!(covered.iter().all(|count| *count == 1));
        }
    }
}
