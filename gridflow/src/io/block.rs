/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Block-store collaborators.
//!
//! A [`BlockStore`] serves rectangular windows of one stored array;
//! what lies behind the windows is the implementation's business: an
//! in-memory block, a raster file, a dataset service. Arrays load
//! from and save to stores one tile at a time, so a store never has
//! to materialize the whole array for a partitioned client.

use std::sync::Arc;

use async_trait::async_trait;
use gridslice::Offset;
use gridslice::Region;
use gridslice::Shape;
use gridslice::Tiling;
use partactor::Block;
use partactor::Caller;
use tokio::sync::RwLock;

use crate::array::PartitionedArray;
use crate::array::spawned_partition;
use crate::cluster::Cluster;
use crate::element::Element;
use crate::error::Error;

/// A storage collaborator serving windows of one stored array.
#[async_trait]
pub trait BlockStore<T: Element, const R: usize>: Send + Sync {
    /// Shape of the stored array.
    async fn shape(&self) -> Result<Shape<R>, Error>;

    /// Copy out the window at `region`.
    async fn read_block(&self, region: Region<R>) -> Result<Block<T, R>, Error>;

    /// Write `block` with its origin at `offset`.
    async fn write_block(&self, offset: Offset<R>, block: Block<T, R>) -> Result<(), Error>;
}

/// A store backed by one in-memory block.
pub struct MemoryStore<T, const R: usize> {
    block: RwLock<Block<T, R>>,
}

impl<T: Element, const R: usize> MemoryStore<T, R> {
    pub fn new(block: Block<T, R>) -> Self {
        Self {
            block: RwLock::new(block),
        }
    }

    pub fn filled(shape: Shape<R>, value: T) -> Self {
        Self::new(Block::filled(shape, value))
    }

    /// A copy of the store's current contents.
    pub async fn snapshot(&self) -> Block<T, R> {
        self.block.read().await.clone()
    }
}

#[async_trait]
impl<T: Element, const R: usize> BlockStore<T, R> for MemoryStore<T, R> {
    async fn shape(&self) -> Result<Shape<R>, Error> {
        Ok(*self.block.read().await.shape())
    }

    async fn read_block(&self, region: Region<R>) -> Result<Block<T, R>, Error> {
        let values = self.block.read().await.region(&region)?;
        Block::new(region.shape(), values).map_err(|err| Error::Store(err.to_string()))
    }

    async fn write_block(&self, offset: Offset<R>, block: Block<T, R>) -> Result<(), Error> {
        let region = Region::new(offset, *block.shape());
        self.block
            .write()
            .await
            .write_region(&region, block.values())
            .map_err(|err| Error::Store(err.to_string()))
    }
}

impl<T: Element, const R: usize> PartitionedArray<T, R> {
    /// Load an array from `store`, one concurrent read per tile.
    /// Placement is round-robin over the cluster's localities.
    pub async fn from_store<S>(
        cluster: &Cluster,
        store: Arc<S>,
        tiling: Tiling<R>,
    ) -> Result<Self, Error>
    where
        S: BlockStore<T, R> + 'static,
    {
        let stored = store.shape().await?;
        if stored != tiling.array_shape() {
            return Err(Error::mismatch(tiling.array_shape(), stored));
        }
        let mut placement = Vec::with_capacity(tiling.nr_tiles());
        let mut partitions = Vec::with_capacity(tiling.nr_tiles());
        for (rank, (_, region)) in tiling.regions().enumerate() {
            let owner = cluster.place(rank);
            let locality = cluster.locality(owner).clone();
            let store = Arc::clone(&store);
            let task = tokio::spawn(async move {
                let block = store.read_block(region).await?;
                if *block.shape() != region.shape() {
                    return Err(Error::mismatch(region.shape(), block.shape()));
                }
                Ok(locality.spawn_partition(region.offset(), block))
            });
            placement.push(owner);
            partitions.push(spawned_partition(task));
        }
        Ok(Self::from_parts(tiling, placement, partitions))
    }

    /// Write every partition of this array into `store`, concurrently.
    pub async fn to_store<S>(&self, caller: &Caller, store: Arc<S>) -> Result<(), Error>
    where
        S: BlockStore<T, R> + 'static,
    {
        let stored = store.shape().await?;
        if stored != self.shape() {
            return Err(Error::mismatch(self.shape(), stored));
        }
        let mut writes = Vec::with_capacity(self.nr_partitions());
        for rank in 0..self.nr_partitions() {
            let partition = self.partition(rank);
            let caller = caller.clone();
            let store = Arc::clone(&store);
            writes.push(async move {
                let reference = partition.await?;
                let block = reference
                    .read(&caller)
                    .await
                    .map_err(|err| Error::partition(reference.id(), err))?;
                store.write_block(reference.offset(), block).await
            });
        }
        futures::future::try_join_all(writes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn test_from_store_reads_tiles() {
        let cluster = Cluster::local(2).unwrap();
        let tiling = Tiling::new(Shape::new([4, 4]), Shape::new([2, 2])).unwrap();
        let values: Vec<i64> = (0..16).collect();
        let store = Arc::new(MemoryStore::new(
            Block::new(Shape::new([4, 4]), values.clone()).unwrap(),
        ));

        let array = PartitionedArray::from_store(&cluster, store, tiling).await.unwrap();
        let gathered = array.gather(cluster.caller()).await.unwrap();
        assert_eq!(gathered.values(), &values[..]);
    }

    #[tokio::test]
    async fn test_to_store_writes_back() {
        let cluster = Cluster::local(2).unwrap();
        let tiling = Tiling::new(Shape::new([2, 4]), Shape::new([2, 2])).unwrap();
        let array = PartitionedArray::filled(&cluster, tiling, 7.5f64);
        let store = Arc::new(MemoryStore::filled(Shape::new([2, 4]), 0.0f64));

        array.to_store(cluster.caller(), Arc::clone(&store)).await.unwrap();
        let snapshot = store.snapshot().await;
        assert!(snapshot.values().iter().all(|v| *v == 7.5));
    }

    #[tokio::test]
    async fn test_from_store_rejects_foreign_tiling() {
        let cluster = Cluster::local(1).unwrap();
        let store = Arc::new(MemoryStore::filled(Shape::new([4, 4]), 1i64));
        let tiling = Tiling::new(Shape::new([3, 3]), Shape::new([2, 2])).unwrap();

        assert_matches!(
            PartitionedArray::from_store(&cluster, store, tiling).await,
            Err(Error::Mismatch { .. })
        );
    }

    #[tokio::test]
    async fn test_store_round_trip_keeps_markers() {
        let cluster = Cluster::local(1).unwrap();
        let tiling = Tiling::single(Shape::new([1, 3]));
        let store = Arc::new(MemoryStore::new(
            Block::new(Shape::new([1, 3]), vec![1.0f64, f64::NAN, 3.0]).unwrap(),
        ));

        let array = PartitionedArray::from_store(&cluster, Arc::clone(&store), tiling)
            .await
            .unwrap();
        let out = Arc::new(MemoryStore::filled(Shape::new([1, 3]), 0.0f64));
        array.to_store(cluster.caller(), Arc::clone(&out)).await.unwrap();

        let snapshot = out.snapshot().await;
        assert_eq!(snapshot.values()[0], 1.0);
        assert!(snapshot.values()[1].is_nan());
        assert_eq!(snapshot.values()[2], 3.0);
    }
}
