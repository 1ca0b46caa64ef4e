/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Partitioned arrays: the logical array an operation is written
//! against.
//!
//! A [`PartitionedArray`] is a tiling of a global shape plus one
//! future per tile resolving to that tile's [`PartitionRef`]. Futures
//! are [`Shared`], so any number of downstream operations can await
//! the same partition; operations chain without waiting for their
//! inputs to finish materializing.

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::future::Shared;
use gridslice::Region;
use gridslice::Shape;
use gridslice::Tiling;
use partactor::Block;
use partactor::Caller;
use partactor::LocalityId;
use partactor::PartitionRef;

use crate::cluster::Cluster;
use crate::element::Element;
use crate::error::Error;

/// A shareable, multiply-awaitable handle to one partition of an
/// array.
pub type PartitionFuture<T, const R: usize> =
    Shared<BoxFuture<'static, Result<PartitionRef<T, R>, Error>>>;

/// Wrap an already-resolved partition.
pub(crate) fn ready_partition<T: Element, const R: usize>(
    reference: PartitionRef<T, R>,
) -> PartitionFuture<T, R> {
    futures::future::ready(Ok(reference)).boxed().shared()
}

/// Wrap a spawned task computing a partition. Join failure surfaces
/// through the future like any other operation error.
pub(crate) fn spawned_partition<T: Element, const R: usize>(
    task: tokio::task::JoinHandle<Result<PartitionRef<T, R>, Error>>,
) -> PartitionFuture<T, R> {
    async move { task.await.map_err(Error::join)? }.boxed().shared()
}

/// A dense array decomposed into rectangular partitions placed on
/// localities. Cheap to clone; clones share partition futures.
#[derive(Clone)]
pub struct PartitionedArray<T: Element, const R: usize> {
    tiling: Tiling<R>,
    placement: Vec<LocalityId>,
    partitions: Vec<PartitionFuture<T, R>>,
}

impl<T: Element, const R: usize> std::fmt::Debug for PartitionedArray<T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionedArray")
            .field("tiling", &self.tiling)
            .field("placement", &self.placement)
            .finish()
    }
}

impl<T: Element, const R: usize> PartitionedArray<T, R> {
    pub(crate) fn from_parts(
        tiling: Tiling<R>,
        placement: Vec<LocalityId>,
        partitions: Vec<PartitionFuture<T, R>>,
    ) -> Self {
        debug_assert_eq!(placement.len(), tiling.nr_tiles());
        debug_assert_eq!(partitions.len(), tiling.nr_tiles());
        Self {
            tiling,
            placement,
            partitions,
        }
    }

    /// Create an array from one block per tile, in row-major tile
    /// order. Blocks are spawned on round-robin localities
    /// immediately.
    pub fn from_blocks(
        cluster: &Cluster,
        tiling: Tiling<R>,
        blocks: Vec<Block<T, R>>,
    ) -> Result<Self, Error> {
        if blocks.len() != tiling.nr_tiles() {
            return Err(Error::mismatch(
                format!("{} tiles", tiling.nr_tiles()),
                format!("{} blocks", blocks.len()),
            ));
        }
        let mut placement = Vec::with_capacity(blocks.len());
        let mut partitions = Vec::with_capacity(blocks.len());
        for ((_, region), block) in tiling.regions().zip(blocks) {
            if *block.shape() != region.shape() {
                return Err(Error::mismatch(region.shape(), block.shape()));
            }
            let owner = cluster.place(partitions.len());
            let reference = cluster
                .locality(owner)
                .spawn_partition(region.offset(), block);
            placement.push(owner);
            partitions.push(ready_partition(reference));
        }
        Ok(Self {
            tiling,
            placement,
            partitions,
        })
    }

    /// Create an array with every cell set to `value`.
    pub fn filled(cluster: &Cluster, tiling: Tiling<R>, value: T) -> Self {
        let mut placement = Vec::with_capacity(tiling.nr_tiles());
        let mut partitions = Vec::with_capacity(tiling.nr_tiles());
        for (_, region) in tiling.regions() {
            let owner = cluster.place(partitions.len());
            let reference = cluster
                .locality(owner)
                .spawn_partition(region.offset(), Block::filled(region.shape(), value));
            placement.push(owner);
            partitions.push(ready_partition(reference));
        }
        Self {
            tiling,
            placement,
            partitions,
        }
    }

    pub fn shape(&self) -> Shape<R> {
        self.tiling.array_shape()
    }

    pub fn tiling(&self) -> Tiling<R> {
        self.tiling
    }

    pub fn nr_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// The locality owning the tile at `rank` (row-major in the tile
    /// grid).
    pub fn locality_of(&self, rank: usize) -> LocalityId {
        self.placement[rank]
    }

    pub(crate) fn placement(&self) -> &[LocalityId] {
        &self.placement
    }

    /// The partition future for the tile at `rank`.
    pub fn partition(&self, rank: usize) -> PartitionFuture<T, R> {
        self.partitions[rank].clone()
    }

    /// The array-global region of the tile at `rank`.
    pub fn region_of(&self, rank: usize) -> Result<Region<R>, Error> {
        let tile = self.tiling.shape_in_tiles().delinearize(rank)?;
        Ok(self.tiling.tile_region(tile)?)
    }

    /// Error unless `self` and `other` share shape and tiling.
    pub fn ensure_alike<U: Element>(&self, other: &PartitionedArray<U, R>) -> Result<(), Error> {
        if self.tiling != other.tiling {
            return Err(Error::mismatch(self.tiling, other.tiling));
        }
        Ok(())
    }

    /// Await every partition ref, in tile order.
    pub async fn resolved(&self) -> Result<Vec<PartitionRef<T, R>>, Error> {
        futures::future::try_join_all(self.partitions.iter().cloned()).await
    }

    /// Assemble the whole array into one block on the caller.
    pub async fn gather(&self, caller: &Caller) -> Result<Block<T, R>, Error> {
        let mut out = Block::filled(self.shape(), T::NO_DATA);
        for (rank, reference) in self.resolved().await?.into_iter().enumerate() {
            let block = reference
                .read(caller)
                .await
                .map_err(|err| Error::partition(reference.id(), err))?;
            let region = self.region_of(rank)?;
            out.write_region(&region, block.values())
                .map_err(|err| Error::partition(reference.id(), err))?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use gridslice::Offset;

    use super::*;
    use crate::cluster::Cluster;

    #[tokio::test]
    async fn test_from_blocks_and_gather() {
        let cluster = Cluster::local(2).unwrap();
        let tiling = Tiling::new(Shape::new([2, 4]), Shape::new([2, 2])).unwrap();
        let blocks = vec![
            Block::new(Shape::new([2, 2]), vec![1i64, 2, 5, 6]).unwrap(),
            Block::new(Shape::new([2, 2]), vec![3, 4, 7, 8]).unwrap(),
        ];
        let array = PartitionedArray::from_blocks(&cluster, tiling, blocks).unwrap();

        assert_eq!(array.nr_partitions(), 2);
        assert_eq!(array.locality_of(0), LocalityId(0));
        assert_eq!(array.locality_of(1), LocalityId(1));

        let gathered = array.gather(cluster.caller()).await.unwrap();
        assert_eq!(gathered.values(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn test_filled() {
        let cluster = Cluster::local(1).unwrap();
        let tiling = Tiling::new(Shape::new([3, 3]), Shape::new([2, 2])).unwrap();
        let array = PartitionedArray::filled(&cluster, tiling, 7.5f64);

        assert_eq!(array.nr_partitions(), 4);
        let gathered = array.gather(cluster.caller()).await.unwrap();
        assert!(gathered.values().iter().all(|v| *v == 7.5));
    }

    #[tokio::test]
    async fn test_block_shape_checked() {
        let cluster = Cluster::local(1).unwrap();
        let tiling = Tiling::single(Shape::new([2, 2]));
        let wrong = Block::filled(Shape::new([2, 3]), 0i32);
        assert!(matches!(
            PartitionedArray::from_blocks(&cluster, tiling, vec![wrong]),
            Err(Error::Mismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_partition_future_is_shared() {
        let cluster = Cluster::local(1).unwrap();
        let tiling = Tiling::single(Shape::new([1, 2]));
        let block = Block::new(Shape::new([1, 2]), vec![1u32, 2]).unwrap();
        let array = PartitionedArray::from_blocks(&cluster, tiling, vec![block]).unwrap();

        let first = array.partition(0).await.unwrap();
        let second = array.partition(0).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(first.offset(), Offset::new([0, 0]));
    }
}
