/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Clusters: the set of localities a computation runs over.
//!
//! A cluster brings up `n` localities with dense ranks `0..n`, each
//! serving its own mailbox. Partition placement is round-robin over
//! ranks. Locality 0 doubles as the coordinator: its caller drives
//! gathers and other cluster-scope requests.

use gridslice::Shape;
use gridslice::Tiling;
use partactor::Caller;
use partactor::Locality;
use partactor::LocalityId;
use partactor::channel::ChannelTransport;

use crate::error::Error;

/// A fixed set of localities hosting partitioned arrays.
#[derive(Debug)]
pub struct Cluster {
    localities: Vec<Locality>,
}

impl Cluster {
    /// Bring up `nr_localities` localities on the given transport.
    pub fn new(nr_localities: usize, transport: ChannelTransport) -> Result<Self, Error> {
        if nr_localities == 0 {
            return Err(Error::Cluster("at least one locality is required".into()));
        }
        let localities = (0..nr_localities)
            .map(|rank| Ok(Locality::new(LocalityId(rank), transport)?))
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(Self { localities })
    }

    /// Bring up a cluster over in-process channels.
    pub fn local(nr_localities: usize) -> Result<Self, Error> {
        Self::new(nr_localities, ChannelTransport::Local)
    }

    /// Bring up a cluster over loopback TCP.
    pub fn tcp(nr_localities: usize) -> Result<Self, Error> {
        Self::new(nr_localities, ChannelTransport::Tcp)
    }

    /// Bring up a cluster on the configured default transport.
    pub fn from_config(nr_localities: usize) -> Result<Self, Error> {
        Self::new(nr_localities, partactor::config::global().default_transport)
    }

    pub fn nr_localities(&self) -> usize {
        self.localities.len()
    }

    pub fn localities(&self) -> &[Locality] {
        &self.localities
    }

    /// The locality with the given id. Ranks are dense, so this is a
    /// direct index.
    pub fn locality(&self, id: LocalityId) -> &Locality {
        &self.localities[id.rank()]
    }

    /// The coordinator's caller.
    pub fn caller(&self) -> &Caller {
        self.localities[0].caller()
    }

    /// The locality that owns the partition at `rank` under
    /// round-robin placement.
    pub fn place(&self, rank: usize) -> LocalityId {
        self.localities[rank % self.localities.len()].id()
    }

    /// A tiling of `array_shape` using the configured default
    /// partition extent per dimension.
    pub fn default_tiling<const R: usize>(
        &self,
        array_shape: Shape<R>,
    ) -> Result<Tiling<R>, Error> {
        Ok(Tiling::square(
            array_shape,
            partactor::config::global().default_partition_extent,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ranks_are_dense() {
        let cluster = Cluster::local(3).unwrap();
        assert_eq!(cluster.nr_localities(), 3);
        for rank in 0..3 {
            assert_eq!(cluster.locality(LocalityId(rank)).id(), LocalityId(rank));
        }
    }

    #[tokio::test]
    async fn test_round_robin_placement() {
        let cluster = Cluster::local(2).unwrap();
        let owners: Vec<_> = (0..5).map(|rank| cluster.place(rank).rank()).collect();
        assert_eq!(owners, vec![0, 1, 0, 1, 0]);
    }

    #[tokio::test]
    async fn test_tcp_localities_serve_on_tcp() {
        let cluster = Cluster::tcp(2).unwrap();
        for locality in cluster.localities() {
            assert!(locality.addr().to_string().starts_with("tcp:"));
        }
    }

    #[test]
    fn test_zero_localities_rejected() {
        assert!(matches!(Cluster::local(0), Err(Error::Cluster(_))));
    }

    #[tokio::test]
    async fn test_default_tiling_covers_array() {
        let cluster = Cluster::local(1).unwrap();
        let shape = Shape::new([2500, 600]);
        let tiling = cluster.default_tiling(shape).unwrap();
        assert_eq!(tiling.array_shape(), shape);
        assert!(tiling.nr_tiles() >= 1);
    }
}
