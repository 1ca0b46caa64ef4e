/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Zonal operations: each output cell depends on every input cell
//! sharing its zone, wherever those cells live.
//!
//! Execution is two-phase. Phase one computes one partial table per
//! partition, concurrently; the merge of all partials is the
//! cluster-wide barrier. Phase two rewrites each partition from the
//! merged table. Output partitions resolve only after every input
//! partition has been tallied.
//!
//! Zones are identified by integral cells using the type's standard
//! no-data marker; cells with a no-data zone are outside every zone
//! and come out marked.

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::future::Shared;
use futures::future::try_join;
use partactor::Block;
use tokio::task::JoinHandle;

use crate::array::PartitionedArray;
use crate::array::spawned_partition;
use crate::cluster::Cluster;
use crate::element::Element;
use crate::element::Integral;
use crate::error::Error;
use crate::policy::Policies;

/// Sum of each zone's valid values, written to every cell of the
/// zone. A zone with no valid values sums to zero.
pub fn zonal_sum<T: Element, Z: Integral, const R: usize>(
    cluster: &Cluster,
    values: &PartitionedArray<T, R>,
    zones: &PartitionedArray<Z, R>,
    policies: Policies<T>,
) -> Result<PartitionedArray<T, R>, Error> {
    values.ensure_alike(zones)?;

    let mut partials: Vec<JoinHandle<Result<HashMap<Z, T>, Error>>> = Vec::new();
    for rank in 0..values.nr_partitions() {
        let value_part = values.partition(rank);
        let zone_part = zones.partition(rank);
        let caller = cluster.caller().clone();
        partials.push(tokio::spawn(async move {
            let (value_ref, zone_ref) = try_join(value_part, zone_part).await?;
            let (value_block, zone_block) = try_join(
                async {
                    value_ref
                        .read(&caller)
                        .await
                        .map_err(|err| Error::partition(value_ref.id(), err))
                },
                async {
                    zone_ref
                        .read(&caller)
                        .await
                        .map_err(|err| Error::partition(zone_ref.id(), err))
                },
            )
            .await?;
            let mut totals = HashMap::new();
            for (&zone, &value) in zone_block.values().iter().zip(value_block.values()) {
                if zone.is_no_data() {
                    continue;
                }
                let entry = totals.entry(zone).or_insert(T::ZERO);
                if !policies.is_input_no_data(value) && policies.domain_contains(value) {
                    *entry = entry.elem_add(value);
                }
            }
            Ok(totals)
        }));
    }
    let merged = merge(partials);

    let mut partitions = Vec::with_capacity(zones.nr_partitions());
    for rank in 0..zones.nr_partitions() {
        let merged = merged.clone();
        let zone_part = zones.partition(rank);
        let caller = cluster.caller().clone();
        let owner = cluster.locality(values.locality_of(rank)).clone();
        let task = tokio::spawn(async move {
            let totals = merged.await?;
            let zone_ref = zone_part.await?;
            let zone_block = zone_ref
                .read(&caller)
                .await
                .map_err(|err| Error::partition(zone_ref.id(), err))?;
            let mut out = Block::filled(*zone_block.shape(), policies.no_data_mark());
            for (out, zone) in out.values_mut().iter_mut().zip(zone_block.values()) {
                if let Some(total) = totals.get(zone) {
                    *out = *total;
                }
            }
            Ok(owner.spawn_partition(zone_ref.offset(), out))
        });
        partitions.push(spawned_partition(task));
    }
    Ok(PartitionedArray::from_parts(
        values.tiling(),
        values.placement().to_vec(),
        partitions,
    ))
}

/// Number of cells in each zone, written to every cell of the zone.
pub fn zonal_area<Z: Integral, const R: usize>(
    cluster: &Cluster,
    zones: &PartitionedArray<Z, R>,
) -> Result<PartitionedArray<u64, R>, Error> {
    let mut partials: Vec<JoinHandle<Result<HashMap<Z, u64>, Error>>> = Vec::new();
    for rank in 0..zones.nr_partitions() {
        let zone_part = zones.partition(rank);
        let caller = cluster.caller().clone();
        partials.push(tokio::spawn(async move {
            let zone_ref = zone_part.await?;
            let zone_block = zone_ref
                .read(&caller)
                .await
                .map_err(|err| Error::partition(zone_ref.id(), err))?;
            let mut counts = HashMap::new();
            for &zone in zone_block.values() {
                if zone.is_no_data() {
                    continue;
                }
                *counts.entry(zone).or_insert(0) += 1;
            }
            Ok(counts)
        }));
    }
    let merged = merge(partials);

    let mut partitions = Vec::with_capacity(zones.nr_partitions());
    for rank in 0..zones.nr_partitions() {
        let merged = merged.clone();
        let zone_part = zones.partition(rank);
        let caller = cluster.caller().clone();
        let owner = cluster.locality(zones.locality_of(rank)).clone();
        let task = tokio::spawn(async move {
            let counts = merged.await?;
            let zone_ref = zone_part.await?;
            let zone_block = zone_ref
                .read(&caller)
                .await
                .map_err(|err| Error::partition(zone_ref.id(), err))?;
            let mut out = Block::filled(*zone_block.shape(), u64::NO_DATA);
            for (out, zone) in out.values_mut().iter_mut().zip(zone_block.values()) {
                if let Some(count) = counts.get(zone) {
                    *out = *count;
                }
            }
            Ok(owner.spawn_partition(zone_ref.offset(), out))
        });
        partitions.push(spawned_partition(task));
    }
    Ok(PartitionedArray::from_parts(
        zones.tiling(),
        zones.placement().to_vec(),
        partitions,
    ))
}

/// Fold the per-partition tables into one shared table; every phase
/// two task awaits the same merge.
fn merge<Z: Integral, A: Element>(
    partials: Vec<JoinHandle<Result<HashMap<Z, A>, Error>>>,
) -> Shared<BoxFuture<'static, Result<Arc<HashMap<Z, A>>, Error>>> {
    async move {
        let mut merged: HashMap<Z, A> = HashMap::new();
        for partial in partials {
            for (zone, value) in partial.await.map_err(Error::join)?? {
                let entry = merged.entry(zone).or_insert(A::ZERO);
                *entry = entry.elem_add(value);
            }
        }
        Ok(Arc::new(merged))
    }
    .boxed()
    .shared()
}

#[cfg(test)]
mod tests {
    use gridslice::Shape;
    use gridslice::Tiling;

    use super::*;

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

    #[tokio::test]
    async fn test_zonal_sum_spans_partitions() {
        let cluster = Cluster::local(2).unwrap();
        let tiling = Tiling::new(Shape::new([4, 4]), Shape::new([2, 2])).unwrap();
        // Zone 1 is the left half, zone 2 the right; both cross the
        // tile rows.
        let zones = partitioned::<i32>(
            &cluster,
            tiling,
            &[1, 1, 2, 2, 1, 1, 2, 2, 1, 1, 2, 2, 1, 1, 2, 2],
        );
        let values = partitioned::<i64>(&cluster, tiling, &(0..16).collect::<Vec<_>>());

        let out = zonal_sum(&cluster, &values, &zones, Policies::default()).unwrap();
        let gathered = out.gather(cluster.caller()).await.unwrap();
        assert_eq!(gathered.get([0, 0]).unwrap(), 52);
        assert_eq!(gathered.get([3, 1]).unwrap(), 52);
        assert_eq!(gathered.get([0, 2]).unwrap(), 68);
        assert_eq!(gathered.get([3, 3]).unwrap(), 68);
    }

    #[tokio::test]
    async fn test_zonal_sum_no_data() {
        let cluster = Cluster::local(1).unwrap();
        let tiling = Tiling::single(Shape::new([1, 4]));
        let zones = partitioned::<i32>(&cluster, tiling, &[1, i32::MIN, 1, 1]);
        let values = partitioned::<f64>(&cluster, tiling, &[1.0, 100.0, f64::NAN, 3.0]);

        let out = zonal_sum(&cluster, &values, &zones, Policies::default()).unwrap();
        let gathered = out.gather(cluster.caller()).await.unwrap();
        // The no-data zone cell is outside every zone; the no-data
        // value cell is skipped from the total but still in the zone.
        assert_eq!(gathered.values()[0], 4.0);
        assert!(gathered.values()[1].is_nan());
        assert_eq!(gathered.values()[2], 4.0);
        assert_eq!(gathered.values()[3], 4.0);
    }

    #[tokio::test]
    async fn test_zonal_area() {
        let cluster = Cluster::local(2).unwrap();
        let tiling = Tiling::new(Shape::new([2, 4]), Shape::new([2, 2])).unwrap();
        let zones = partitioned::<i32>(&cluster, tiling, &[7, 7, 9, i32::MIN, 7, 9, 9, 9]);

        let out = zonal_area(&cluster, &zones).unwrap();
        let gathered = out.gather(cluster.caller()).await.unwrap();
        assert_eq!(gathered.values()[0], 3);
        assert_eq!(gathered.values()[2], 4);
        assert_eq!(gathered.values()[3], u64::MAX);
        assert_eq!(gathered.values()[5], 4);
    }
}
