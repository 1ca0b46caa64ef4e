/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use serde::Deserialize;
use serde::Serialize;

/// The type of error for shape and index operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ShapeError {
    #[error("index {index:?} out of bounds for shape {shape:?}")]
    IndexOutOfBounds { index: Vec<usize>, shape: Vec<usize> },

    #[error("linear index {index} out of range {total}")]
    LinearOutOfRange { index: usize, total: usize },

    #[error("region at {offset:?} with extents {extents:?} exceeds shape {shape:?}")]
    RegionOutOfBounds {
        offset: Vec<usize>,
        extents: Vec<usize>,
        shape: Vec<usize>,
    },

    #[error("tile extent is zero in dimension {dim} while the array is nonempty there")]
    EmptyTileExtent { dim: usize },

    #[error("shape mismatch: {left:?} vs {right:?}")]
    Mismatch { left: Vec<usize>, right: Vec<usize> },
}

/// A cell coordinate: one position per dimension. Rank is carried in
/// the type, so cooperating shapes, offsets, and indices cannot
/// disagree on dimensionality.
pub type Index<const R: usize> = [usize; R];

/// The extents of a dense, row-major, rank-`R` array. Extents may be
/// zero (the shape is then empty).
///
/// ```
/// # use gridslice::Shape;
/// let shape = Shape::new([2, 3]);
/// assert_eq!(shape.nr_elements(), 6);
/// assert_eq!(shape.linearize([1, 2]).unwrap(), 5);
/// ```
#[derive(Serialize, Deserialize, Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Shape<const R: usize>(#[serde(with = "rank_array")] [usize; R]);

impl<const R: usize> Shape<R> {
    /// Create a shape with the given per-dimension extents.
    pub fn new(extents: [usize; R]) -> Self {
        Self(extents)
    }

    /// The extents, one per dimension.
    pub fn extents(&self) -> &[usize; R] {
        &self.0
    }

    /// The extent of dimension `dim`. Panics if `dim >= R`.
    pub fn extent(&self, dim: usize) -> usize {
        self.0[dim]
    }

    /// The number of cells in the shape: the product of its extents.
    /// Rank-0 shapes hold exactly one element.
    pub fn nr_elements(&self) -> usize {
        self.0.iter().product()
    }

    /// True if the shape contains no cells.
    pub fn is_empty(&self) -> bool {
        self.nr_elements() == 0
    }

    /// True if `index` is a valid cell coordinate for this shape.
    pub fn contains(&self, index: Index<R>) -> bool {
        index.iter().zip(self.0.iter()).all(|(i, extent)| i < extent)
    }

    /// Map a cell coordinate to its row-major linear position.
    pub fn linearize(&self, index: Index<R>) -> Result<usize, ShapeError> {
        if !self.contains(index) {
            return Err(ShapeError::IndexOutOfBounds {
                index: index.to_vec(),
                shape: self.0.to_vec(),
            });
        }
        Ok(index
            .iter()
            .zip(self.0.iter())
            .fold(0, |linear, (i, extent)| linear * extent + i))
    }

    /// Map a row-major linear position back to its cell coordinate.
    pub fn delinearize(&self, linear: usize) -> Result<Index<R>, ShapeError> {
        if linear >= self.nr_elements() {
            return Err(ShapeError::LinearOutOfRange {
                index: linear,
                total: self.nr_elements(),
            });
        }
        let mut index = [0; R];
        let mut rest = linear;
        for dim in (0..R).rev() {
            index[dim] = rest % self.0[dim];
            rest /= self.0[dim];
        }
        Ok(index)
    }

    /// Iterate all cell coordinates in row-major order.
    pub fn indices(&self) -> IndexIterator<R> {
        IndexIterator::new(*self)
    }

    /// Error unless `self` and `other` have identical extents.
    pub fn ensure_same(&self, other: &Shape<R>) -> Result<(), ShapeError> {
        if self != other {
            return Err(ShapeError::Mismatch {
                left: self.0.to_vec(),
                right: other.0.to_vec(),
            });
        }
        Ok(())
    }
}

impl<const R: usize> std::fmt::Display for Shape<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if R == 0 {
            return write!(f, "()");
        }
        for (dim, extent) in self.0.iter().enumerate() {
            if dim > 0 {
                write!(f, "x")?;
            }
            write!(f, "{}", extent)?;
        }
        Ok(())
    }
}

impl<const R: usize> From<[usize; R]> for Shape<R> {
    fn from(extents: [usize; R]) -> Self {
        Self::new(extents)
    }
}

/// The position of a block within an enclosing rank-`R` array,
/// expressed in cells from the array origin.
#[derive(Serialize, Deserialize, Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Offset<const R: usize>(#[serde(with = "rank_array")] [usize; R]);

impl<const R: usize> Offset<R> {
    /// The origin: zero in every dimension.
    pub fn origin() -> Self {
        Self([0; R])
    }

    /// Create an offset with the given per-dimension positions.
    pub fn new(coords: [usize; R]) -> Self {
        Self(coords)
    }

    /// The positions, one per dimension.
    pub fn coords(&self) -> &[usize; R] {
        &self.0
    }

    /// The position in dimension `dim`. Panics if `dim >= R`.
    pub fn coord(&self, dim: usize) -> usize {
        self.0[dim]
    }

    /// Translate a coordinate local to a block at this offset into the
    /// enclosing array's frame.
    pub fn globalize(&self, local: Index<R>) -> Index<R> {
        let mut global = [0; R];
        for dim in 0..R {
            global[dim] = self.0[dim] + local[dim];
        }
        global
    }
}

impl<const R: usize> std::fmt::Display for Offset<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (dim, coord) in self.0.iter().enumerate() {
            if dim > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", coord)?;
        }
        write!(f, "]")
    }
}

impl<const R: usize> From<[usize; R]> for Offset<R> {
    fn from(coords: [usize; R]) -> Self {
        Self::new(coords)
    }
}

/// Row-major odometer over the cell coordinates of a shape.
pub struct IndexIterator<const R: usize> {
    extents: [usize; R],
    next: Option<Index<R>>,
}

impl<const R: usize> IndexIterator<R> {
    fn new(shape: Shape<R>) -> Self {
        let next = if shape.is_empty() { None } else { Some([0; R]) };
        Self {
            extents: *shape.extents(),
            next,
        }
    }
}

impl<const R: usize> Iterator for IndexIterator<R> {
    type Item = Index<R>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        let mut index = current;
        self.next = None;
        for dim in (0..R).rev() {
            index[dim] += 1;
            if index[dim] < self.extents[dim] {
                self.next = Some(index);
                break;
            }
            index[dim] = 0;
        }
        Some(current)
    }
}

/// Serde support for the rank-generic coordinate arrays. Serde's own
/// array impls stop at fixed lengths; these serialize as a sequence
/// and check the length against `R` on the way back in.
mod rank_array {
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serialize;
    use serde::Serializer;
    use serde::de::Error as _;

    pub(super) fn serialize<S: Serializer, const N: usize>(
        array: &[usize; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        array[..].serialize(serializer)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[usize; N], D::Error> {
        let coords = Vec::<usize>::deserialize(deserializer)?;
        let len = coords.len();
        coords
            .try_into()
            .map_err(|_| D::Error::invalid_length(len, &"as many coordinates as the rank"))
    }
}

/// Move `index` by a signed per-dimension delta, returning `None` when
/// the result would leave `shape`. This is the neighbor lookup used by
/// windowed and flow computations.
pub fn offset_index<const R: usize>(
    index: Index<R>,
    delta: [isize; R],
    shape: &Shape<R>,
) -> Option<Index<R>> {
    let mut moved = [0; R];
    for dim in 0..R {
        let coord = index[dim].checked_add_signed(delta[dim])?;
        if coord >= shape.extent(dim) {
            return None;
        }
        moved[dim] = coord;
    }
    Some(moved)
}
