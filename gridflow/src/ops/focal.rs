/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Focal operations: each output cell depends on a square window
//! around the input cell.
//!
//! Windows cross partition boundaries. Per partition, the executor
//! assembles a haloed input block: the partition's own cells plus a
//! `radius`-deep ring read from the adjacent partitions, with
//! out-of-array ring cells set to the halo fill. The window loop then
//! runs entirely against local memory. Focal operations are rank-2.

use gridslice::Offset;
use gridslice::Region;
use gridslice::Shape;
use partactor::Block;
use partactor::Caller;
use serde::Deserialize;
use serde::Serialize;

use crate::array::PartitionedArray;
use crate::array::spawned_partition;
use crate::cluster::Cluster;
use crate::element::Element;
use crate::element::Real;
use crate::error::Error;
use crate::policy::Policies;

/// A square focal window.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kernel {
    radius: usize,
}

impl Kernel {
    /// The window reaching `radius` cells in every direction.
    pub fn square(radius: usize) -> Self {
        Self { radius }
    }

    pub fn radius(&self) -> usize {
        self.radius
    }

    /// Cells on a side: `2 * radius + 1`.
    pub fn extent(&self) -> usize {
        2 * self.radius + 1
    }
}

/// What window cells beyond the array boundary read as.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum HaloFill<T> {
    /// The policies' input no-data value. Windows touching the
    /// boundary then follow the operation's no-data rule.
    NoData,
    /// A constant, e.g. zero to treat the outside as empty.
    Constant(T),
}

impl<T: Element> HaloFill<T> {
    fn value(&self, policies: &Policies<T>) -> T {
        match self {
            HaloFill::NoData => policies.input_no_data_value(),
            HaloFill::Constant(value) => *value,
        }
    }
}

/// Assemble the partition at `rank` grown by `radius` cells on every
/// side. In-array ring cells are read from the owning partitions,
/// concurrently; out-of-array ring cells are set to `fill`.
pub(crate) async fn read_haloed<T: Element>(
    caller: &Caller,
    array: &PartitionedArray<T, 2>,
    rank: usize,
    radius: usize,
    fill: T,
) -> Result<Block<T, 2>, Error> {
    let own = array.region_of(rank)?;
    let tiling = array.tiling();
    let array_shape = tiling.array_shape();
    let grown_shape = Shape::new([
        own.shape().extent(0) + 2 * radius,
        own.shape().extent(1) + 2 * radius,
    ]);
    let mut halo = Block::filled(grown_shape, fill);

    // The grown window's origin in array coordinates; negative at the
    // array's low edges.
    let origin = [
        own.offset().coord(0) as isize - radius as isize,
        own.offset().coord(1) as isize - radius as isize,
    ];
    // The in-array part of the grown window.
    let begin = [origin[0].max(0) as usize, origin[1].max(0) as usize];
    let end = [
        ((origin[0] + grown_shape.extent(0) as isize) as usize).min(array_shape.extent(0)),
        ((origin[1] + grown_shape.extent(1) as isize) as usize).min(array_shape.extent(1)),
    ];
    let covered = Region::new(
        Offset::new(begin),
        Shape::new([end[0] - begin[0], end[1] - begin[1]]),
    );

    let first_tile = tiling.tile_of_cell(begin)?;
    let last_tile = tiling.tile_of_cell([end[0] - 1, end[1] - 1])?;
    let mut reads = Vec::new();
    for tile_row in first_tile[0]..=last_tile[0] {
        for tile_col in first_tile[1]..=last_tile[1] {
            let tile = [tile_row, tile_col];
            let piece = match covered.intersect(&tiling.tile_region(tile)?) {
                Some(piece) => piece,
                None => continue,
            };
            let part = array.partition(tiling.tile_rank(tile)?);
            let caller = caller.clone();
            reads.push(async move {
                let reference = part.await?;
                let local = match piece.localize(&reference.global_region()) {
                    Some(local) => local,
                    // The piece was cut from this tile's region.
                    None => unreachable!(),
                };
                let values = reference
                    .read_region(&caller, local)
                    .await
                    .map_err(|err| Error::partition(reference.id(), err))?;
                Ok::<_, Error>((piece, values))
            });
        }
    }
    for (piece, values) in futures::future::try_join_all(reads).await? {
        let dest = Region::new(
            Offset::new([
                (piece.offset().coord(0) as isize - origin[0]) as usize,
                (piece.offset().coord(1) as isize - origin[1]) as usize,
            ]),
            piece.shape(),
        );
        halo.write_region(&dest, &values)
            .map_err(|err| Error::Shape(err.to_string()))?;
    }
    Ok(halo)
}

/// Sum over the window. Windows containing a no-data or out-of-domain
/// cell are marked no-data.
pub fn focal_sum<T: Element>(
    cluster: &Cluster,
    input: &PartitionedArray<T, 2>,
    kernel: Kernel,
    fill: HaloFill<T>,
    policies: Policies<T>,
) -> Result<PartitionedArray<T, 2>, Error> {
    focal(cluster, input, kernel, fill, policies, eval_focal_sum::<T>)
}

/// Mean over the window's valid cells. Windows with no valid cell are
/// marked no-data.
pub fn focal_mean<T: Real>(
    cluster: &Cluster,
    input: &PartitionedArray<T, 2>,
    kernel: Kernel,
    fill: HaloFill<T>,
    policies: Policies<T>,
) -> Result<PartitionedArray<T, 2>, Error> {
    focal(cluster, input, kernel, fill, policies, eval_focal_mean::<T>)
}

/// Shared focal driver: per partition, assemble the haloed input on
/// the caller side and evaluate the window loop, serving the output on
/// the input's owner.
fn focal<T: Element>(
    cluster: &Cluster,
    input: &PartitionedArray<T, 2>,
    kernel: Kernel,
    fill: HaloFill<T>,
    policies: Policies<T>,
    eval: fn(&Block<T, 2>, Shape<2>, Kernel, &Policies<T>) -> Block<T, 2>,
) -> Result<PartitionedArray<T, 2>, Error> {
    let input = std::sync::Arc::new(input.clone());
    let fill = fill.value(&policies);
    let mut partitions = Vec::with_capacity(input.nr_partitions());
    for rank in 0..input.nr_partitions() {
        let input = std::sync::Arc::clone(&input);
        let owner = cluster.locality(input.locality_of(rank)).clone();
        let caller = cluster.caller().clone();
        let task = tokio::spawn(async move {
            let own = input.region_of(rank)?;
            let halo = read_haloed(&caller, &input, rank, kernel.radius(), fill).await?;
            let out = eval(&halo, own.shape(), kernel, &policies);
            Ok(owner.spawn_partition(own.offset(), out))
        });
        partitions.push(spawned_partition(task));
    }
    Ok(PartitionedArray::from_parts(
        input.tiling(),
        input.placement().to_vec(),
        partitions,
    ))
}

fn eval_focal_sum<T: Element>(
    halo: &Block<T, 2>,
    shape: Shape<2>,
    kernel: Kernel,
    policies: &Policies<T>,
) -> Block<T, 2> {
    let halo_cols = halo.shape().extent(1);
    let halo_values = halo.values();
    let cols = shape.extent(1);
    let mut out = Block::filled(shape, policies.no_data_mark());
    let out_values = out.values_mut();
    for row in 0..shape.extent(0) {
        'cell: for col in 0..cols {
            let mut acc = T::ZERO;
            for window_row in 0..kernel.extent() {
                let start = (row + window_row) * halo_cols + col;
                for &value in &halo_values[start..start + kernel.extent()] {
                    if policies.is_input_no_data(value) || !policies.domain_contains(value) {
                        continue 'cell;
                    }
                    acc = acc.elem_add(value);
                }
            }
            out_values[row * cols + col] = acc;
        }
    }
    out
}

fn eval_focal_mean<T: Real>(
    halo: &Block<T, 2>,
    shape: Shape<2>,
    kernel: Kernel,
    policies: &Policies<T>,
) -> Block<T, 2> {
    let halo_cols = halo.shape().extent(1);
    let halo_values = halo.values();
    let cols = shape.extent(1);
    let mut out = Block::filled(shape, policies.no_data_mark());
    let out_values = out.values_mut();
    for row in 0..shape.extent(0) {
        for col in 0..cols {
            let mut acc = T::ZERO;
            let mut count = 0;
            for window_row in 0..kernel.extent() {
                let start = (row + window_row) * halo_cols + col;
                for &value in &halo_values[start..start + kernel.extent()] {
                    if policies.is_input_no_data(value) || !policies.domain_contains(value) {
                        continue;
                    }
                    acc = acc.elem_add(value);
                    count += 1;
                }
            }
            if count > 0 {
                out_values[row * cols + col] = acc.elem_div(T::from_count(count));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use gridslice::Tiling;

    use super::*;

    #[test]
    fn test_kernel_extent() {
        assert_eq!(Kernel::square(1).extent(), 3);
        assert_eq!(Kernel::square(2).extent(), 5);
        assert_eq!(Kernel::square(0).extent(), 1);
    }

    #[test]
    fn test_eval_focal_sum_window() {
        // A 2x2 output over a 4x4 halo (radius 1).
        let halo = Block::new(Shape::new([4, 4]), (1..=16).collect::<Vec<i64>>()).unwrap();
        let out = eval_focal_sum(
            &halo,
            Shape::new([2, 2]),
            Kernel::square(1),
            &Policies::default(),
        );
        assert_eq!(out.values()[0], 1 + 2 + 3 + 5 + 6 + 7 + 9 + 10 + 11);
        assert_eq!(out.values()[3], 6 + 7 + 8 + 10 + 11 + 12 + 14 + 15 + 16);
    }

    #[test]
    fn test_eval_focal_mean_skips_no_data() {
        let halo = Block::new(
            Shape::new([3, 3]),
            vec![3.0f64, f64::NAN, f64::NAN, 5.0, f64::NAN, f64::NAN, 4.0, f64::NAN, f64::NAN],
        )
        .unwrap();
        let out = eval_focal_mean(
            &halo,
            Shape::new([1, 1]),
            Kernel::square(1),
            &Policies::default(),
        );
        assert_eq!(out.values()[0], 4.0);

        let empty = Block::filled(Shape::new([3, 3]), f64::NAN);
        let out = eval_focal_mean(
            &empty,
            Shape::new([1, 1]),
            Kernel::square(1),
            &Policies::default(),
        );
        assert!(out.values()[0].is_nan());
    }

    #[tokio::test]
    async fn test_read_haloed_crosses_partitions() {
        let cluster = Cluster::local(2).unwrap();
        let tiling = Tiling::new(Shape::new([4, 4]), Shape::new([2, 2])).unwrap();
        let values: Vec<i64> = (0..16).collect();
        let input = partitioned(&cluster, tiling, &values);

        // The bottom-right tile: top and left ring cells come from the
        // other tiles, bottom and right are outside the array.
        let halo = read_haloed(cluster.caller(), &input, 3, 1, -1).await.unwrap();
        assert_eq!(
            halo.values(),
            &[
                5, 6, 7, -1, //
                9, 10, 11, -1, //
                13, 14, 15, -1, //
                -1, -1, -1, -1,
            ]
        );
    }

    #[tokio::test]
    async fn test_focal_sum_crosses_partitions() {
        let cluster = Cluster::local(2).unwrap();
        let tiling = Tiling::new(Shape::new([4, 4]), Shape::new([2, 2])).unwrap();
        let input = PartitionedArray::filled(&cluster, tiling, 1i64);

        let out = focal_sum(
            &cluster,
            &input,
            Kernel::square(1),
            HaloFill::Constant(0),
            Policies::default(),
        )
        .unwrap();
        let gathered = out.gather(cluster.caller()).await.unwrap();
        // Corner, edge, and interior windows.
        assert_eq!(gathered.get([0, 0]).unwrap(), 4);
        assert_eq!(gathered.get([0, 1]).unwrap(), 6);
        assert_eq!(gathered.get([1, 1]).unwrap(), 9);
        assert_eq!(gathered.get([1, 2]).unwrap(), 9);
        assert_eq!(gathered.get([3, 3]).unwrap(), 4);
    }

    #[tokio::test]
    async fn test_focal_sum_no_data_fill_marks_borders() {
        let cluster = Cluster::local(1).unwrap();
        let tiling = Tiling::single(Shape::new([3, 3]));
        let input = PartitionedArray::filled(&cluster, tiling, 2.0f64);

        let out = focal_sum(
            &cluster,
            &input,
            Kernel::square(1),
            HaloFill::NoData,
            Policies::default(),
        )
        .unwrap();
        let gathered = out.gather(cluster.caller()).await.unwrap();
        assert!(gathered.get([0, 0]).unwrap().is_nan());
        assert!(gathered.get([2, 1]).unwrap().is_nan());
        assert_eq!(gathered.get([1, 1]).unwrap(), 18.0);
    }

    #[tokio::test]
    async fn test_focal_mean_of_constant_is_constant() {
        let cluster = Cluster::local(2).unwrap();
        let tiling = Tiling::new(Shape::new([4, 6]), Shape::new([3, 3])).unwrap();
        let input = PartitionedArray::filled(&cluster, tiling, 7.0f64);

        // Out-of-array cells are skipped, so borders average over
        // fewer cells and still come out constant.
        let out = focal_mean(
            &cluster,
            &input,
            Kernel::square(2),
            HaloFill::NoData,
            Policies::default(),
        )
        .unwrap();
        let gathered = out.gather(cluster.caller()).await.unwrap();
        assert!(gathered.values().iter().all(|v| *v == 7.0));
    }

    fn partitioned<T: Element>(
        cluster: &Cluster,
        tiling: Tiling<2>,
        values: &[T],
    ) -> PartitionedArray<T, 2> {
        let whole = Block::new(tiling.array_shape(), values.to_vec()).unwrap();
        let blocks = tiling
            .regions()
            .map(|(_, region)| {
                Block::new(region.shape(), whole.region(&region).unwrap()).unwrap()
            })
            .collect();
        PartitionedArray::from_blocks(cluster, tiling, blocks).unwrap()
    }
}
