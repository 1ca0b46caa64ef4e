/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Inflow analysis of a flow direction network.
//!
//! For each cell of a partition this resolves where its outflow lands
//! and how many neighbors drain into it. The analysis reads the
//! partition's flow codes grown by a one-cell halo, so both sides of a
//! partition boundary see the same codes: a partition counts an
//! inbound edge from a neighbor tile exactly when that tile resolves
//! the matching outbound edge.

use std::collections::HashMap;
use std::sync::Arc;

use gridslice::Region;
use gridslice::Tiling;
use gridslice::offset_index;
use partactor::Block;

use crate::array::PartitionedArray;
use crate::array::spawned_partition;
use crate::cluster::Cluster;
use crate::element::Element;
use crate::error::Error;
use crate::ops::focal::read_haloed;
use crate::routing::direction::Flow;

/// Where a cell's outflow lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Drain {
    /// Another cell of the same partition, by local linear index.
    Local(usize),
    /// A cell of an adjacent partition, by tile rank and linear index
    /// in that partition's frame.
    Remote { tile: usize, cell: usize },
    /// Nowhere: the cell is a sink, has no direction, or drains off
    /// the array edge.
    None,
}

/// The routing structure of one partition, derived from its haloed
/// flow codes. Cell vectors are row-major over the partition.
pub(crate) struct FlowTopology {
    /// Decoded flow of each cell.
    pub(crate) flow: Vec<Flow>,
    /// Number of neighbors draining into each cell.
    pub(crate) inflow: Vec<u8>,
    /// Outflow target of each cell.
    pub(crate) drains: Vec<Drain>,
    /// Cross-partition arrivals to expect, keyed by source tile rank.
    pub(crate) expected: HashMap<usize, usize>,
}

/// Analyze the partition covering `own` from its flow codes grown by a
/// one-cell halo. Out-of-array halo cells must hold `u8::NO_DATA`.
pub(crate) fn analyze(
    tiling: &Tiling<2>,
    own: &Region<2>,
    halo: &Block<u8, 2>,
) -> Result<FlowTopology, Error> {
    let rows = own.shape().extent(0);
    let cols = own.shape().extent(1);
    let halo_shape = *halo.shape();
    let array_shape = tiling.array_shape();
    // The halo's origin in array coordinates; negative at the array's
    // low edges.
    let origin = [
        own.offset().coord(0) as isize - 1,
        own.offset().coord(1) as isize - 1,
    ];

    let mut inflow = vec![0u8; rows * cols];
    let mut expected: HashMap<usize, usize> = HashMap::new();
    // Every haloed cell draining into the partition's interior
    // contributes one inbound edge. Ring cells additionally tell us
    // how many messages their tile will send: the sender resolves the
    // same edge from its side of the boundary.
    for halo_cell in halo_shape.indices() {
        let Flow::Toward(direction) = Flow::decode(halo.get(halo_cell)?) else {
            continue;
        };
        let target = match offset_index(halo_cell, direction.delta(), &halo_shape) {
            Some(target) => target,
            None => continue,
        };
        let interior = (1..=rows).contains(&target[0]) && (1..=cols).contains(&target[1]);
        if !interior {
            continue;
        }
        inflow[(target[0] - 1) * cols + (target[1] - 1)] += 1;
        let ring = halo_cell[0] == 0
            || halo_cell[0] > rows
            || halo_cell[1] == 0
            || halo_cell[1] > cols;
        if ring {
            // Out-of-array ring positions hold the fill code and were
            // skipped above, so this cell is a real array cell.
            let global = [
                (origin[0] + halo_cell[0] as isize) as usize,
                (origin[1] + halo_cell[1] as isize) as usize,
            ];
            let source = tiling.tile_rank(tiling.tile_of_cell(global)?)?;
            *expected.entry(source).or_insert(0) += 1;
        }
    }

    let mut flow = Vec::with_capacity(rows * cols);
    let mut drains = Vec::with_capacity(rows * cols);
    for row in 0..rows {
        for col in 0..cols {
            let decoded = Flow::decode(halo.get([row + 1, col + 1])?);
            flow.push(decoded);
            let direction = match decoded {
                Flow::Toward(direction) => direction,
                Flow::Sink | Flow::NoData => {
                    drains.push(Drain::None);
                    continue;
                }
            };
            let cell = own.offset().globalize([row, col]);
            let drain = match offset_index(cell, direction.delta(), &array_shape) {
                // Material leaving the array is discarded.
                None => Drain::None,
                Some(target) if own.contains(target) => {
                    let local = [
                        target[0] - own.offset().coord(0),
                        target[1] - own.offset().coord(1),
                    ];
                    Drain::Local(own.shape().linearize(local)?)
                }
                Some(target) => {
                    let tile = tiling.tile_of_cell(target)?;
                    let region = tiling.tile_region(tile)?;
                    let local = [
                        target[0] - region.offset().coord(0),
                        target[1] - region.offset().coord(1),
                    ];
                    Drain::Remote {
                        tile: tiling.tile_rank(tile)?,
                        cell: region.shape().linearize(local)?,
                    }
                }
            };
            drains.push(drain);
        }
    }

    Ok(FlowTopology {
        flow,
        inflow,
        drains,
        expected,
    })
}

/// The number of neighbors draining into each cell, `0..=8`. Cells
/// without a flow direction are marked `u8::NO_DATA`.
#[tracing::instrument(skip_all, fields(partitions = flow.nr_partitions()))]
pub fn inflow_count(
    cluster: &Cluster,
    flow: &PartitionedArray<u8, 2>,
) -> Result<PartitionedArray<u8, 2>, Error> {
    let flow = Arc::new(flow.clone());
    let mut partitions = Vec::with_capacity(flow.nr_partitions());
    for rank in 0..flow.nr_partitions() {
        let flow = Arc::clone(&flow);
        let owner = cluster.locality(flow.locality_of(rank)).clone();
        let caller = cluster.caller().clone();
        let task = tokio::spawn(async move {
            let own = flow.region_of(rank)?;
            let halo = read_haloed(&caller, &flow, rank, 1, u8::NO_DATA).await?;
            let topology = analyze(&flow.tiling(), &own, &halo)?;
            let mut out = Block::filled(own.shape(), u8::NO_DATA);
            let values = out.values_mut();
            for (cell, decoded) in topology.flow.iter().enumerate() {
                if !matches!(decoded, Flow::NoData) {
                    values[cell] = topology.inflow[cell];
                }
            }
            Ok(owner.spawn_partition(own.offset(), out))
        });
        partitions.push(spawned_partition(task));
    }
    Ok(PartitionedArray::from_parts(
        flow.tiling(),
        flow.placement().to_vec(),
        partitions,
    ))
}
