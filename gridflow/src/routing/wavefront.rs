/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Distributed flow accumulation.
//!
//! [`accumulate`] pushes material down a flow direction network. Each
//! partition walks its cells as a wavefront: a cell fires once its
//! last inflow has arrived, adding everything it accumulated to the
//! cell it drains to. Edges that stay inside a partition are applied
//! directly; edges that cross a partition boundary ride a channel
//! dedicated to that ordered tile pair, drained by a monitor task on
//! the receiving side. All channels are created before any wavefront
//! starts, so an early sender only ever buffers into a channel whose
//! receiver is still on its way.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use gridslice::Shape;
use gridslice::Tiling;
use gridslice::offset_index;
use partactor::Block;
use partactor::Caller;
use partactor::Locality;
use partactor::PartitionRef;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::array::PartitionedArray;
use crate::array::spawned_partition;
use crate::cluster::Cluster;
use crate::element::Element;
use crate::error::Error;
use crate::ops::focal::read_haloed;
use crate::policy::Policies;
use crate::routing::direction::Direction;
use crate::routing::direction::Flow;
use crate::routing::inflow::Drain;
use crate::routing::inflow::analyze;

/// One unit of accumulated material crossing a partition boundary.
/// `dest` is a linear cell index in the receiving partition's frame.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FlowMessage<M> {
    pub(crate) dest: usize,
    pub(crate) value: M,
}

/// One channel per ordered pair of adjacent tiles.
///
/// Senders are taken, not cloned: a partition task takes every handle
/// out of its tile before doing anything that can fail, so whenever it
/// ends, its outgoing channels close and downstream monitors stop
/// waiting for it.
pub(crate) struct CommGrid<M> {
    grid: Shape<2>,
    senders: DashMap<(usize, usize), mpsc::UnboundedSender<FlowMessage<M>>>,
    receivers: DashMap<(usize, usize), mpsc::UnboundedReceiver<FlowMessage<M>>>,
}

impl<M> CommGrid<M> {
    pub(crate) fn new(tiling: &Tiling<2>) -> Result<Self, Error> {
        let grid = tiling.shape_in_tiles();
        let senders = DashMap::new();
        let receivers = DashMap::new();
        for tile in grid.indices() {
            for direction in Direction::ALL {
                let neighbor = match offset_index(tile, direction.delta(), &grid) {
                    Some(neighbor) => neighbor,
                    None => continue,
                };
                let pair = (grid.linearize(tile)?, grid.linearize(neighbor)?);
                let (tx, rx) = mpsc::unbounded_channel();
                senders.insert(pair, tx);
                receivers.insert(pair, rx);
            }
        }
        Ok(Self {
            grid,
            senders,
            receivers,
        })
    }

    /// Remove and return the send handles for every channel out of
    /// `from`, keyed by receiving tile rank.
    pub(crate) fn take_senders(
        &self,
        from: usize,
    ) -> Result<HashMap<usize, mpsc::UnboundedSender<FlowMessage<M>>>, Error> {
        let tile = self.grid.delinearize(from)?;
        let mut taken = HashMap::new();
        for direction in Direction::ALL {
            let neighbor = match offset_index(tile, direction.delta(), &self.grid) {
                Some(neighbor) => neighbor,
                None => continue,
            };
            let to = self.grid.linearize(neighbor)?;
            if let Some((_, sender)) = self.senders.remove(&(from, to)) {
                taken.insert(to, sender);
            }
        }
        Ok(taken)
    }

    pub(crate) fn take_receiver(
        &self,
        from: usize,
        to: usize,
    ) -> Option<mpsc::UnboundedReceiver<FlowMessage<M>>> {
        self.receivers.remove(&(from, to)).map(|(_, receiver)| receiver)
    }
}

/// Mutable wavefront state, shared between the partition task and its
/// channel monitors.
struct Wavefront<T> {
    /// Accumulated material per cell.
    out: Vec<T>,
    /// Inflows still outstanding per cell.
    pending: Vec<u8>,
    /// Cells that have not fired yet.
    remaining: usize,
    /// Monitors still draining an inbound channel.
    monitors: usize,
    /// Fired once the wavefront has covered the partition, or failed.
    done: Option<oneshot::Sender<Result<(), String>>>,
}

/// Everything a partition's wavefront needs besides the mutable state.
struct Engine<T: Element> {
    policies: Policies<T>,
    drains: Vec<Drain>,
    senders: HashMap<usize, mpsc::UnboundedSender<FlowMessage<T>>>,
    state: tokio::sync::Mutex<Wavefront<T>>,
}

/// Apply one arrival. A marked destination absorbs everything; a
/// marked arrival poisons the destination.
fn deliver<T: Element>(policies: &Policies<T>, out: &mut [T], dest: usize, value: T) {
    if policies.is_output_no_data(out[dest]) {
        return;
    }
    if policies.is_output_no_data(value) {
        out[dest] = policies.no_data_mark();
    } else {
        out[dest] = out[dest].elem_add(value);
    }
}

/// Fire every cell on `worklist`, plus every cell their deliveries
/// unblock. A cell fires exactly once, when its last inflow arrives.
fn fire<T: Element>(engine: &Engine<T>, state: &mut Wavefront<T>, mut worklist: Vec<usize>) {
    while let Some(cell) = worklist.pop() {
        state.remaining -= 1;
        let value = state.out[cell];
        match engine.drains[cell] {
            Drain::None => {}
            Drain::Local(dest) => {
                deliver(&engine.policies, &mut state.out, dest, value);
                state.pending[dest] -= 1;
                if state.pending[dest] == 0 {
                    worklist.push(dest);
                }
            }
            Drain::Remote { tile, cell: dest } => {
                let sender = match engine.senders.get(&tile) {
                    Some(sender) => sender,
                    // Channels exist for every adjacent tile pair.
                    None => unreachable!(),
                };
                if sender.send(FlowMessage { dest, value }).is_err() {
                    // The receiving wavefront is gone; it reports its
                    // own failure.
                    tracing::debug!("dropping flow into tile {}", tile);
                }
            }
        }
    }
    if state.remaining == 0 {
        if let Some(done) = state.done.take() {
            let _ = done.send(Ok(()));
        }
    }
}

async fn fail<T: Element>(engine: &Engine<T>, reason: &str) {
    let mut state = engine.state.lock().await;
    if let Some(done) = state.done.take() {
        let _ = done.send(Err(reason.to_string()));
    }
}

/// Drain exactly `quota` arrivals from one inbound channel. The quota
/// is the receiver's own count of boundary edges draining in from that
/// tile, which the sender resolves identically from its side.
async fn monitor<T: Element>(
    engine: Arc<Engine<T>>,
    mut receiver: mpsc::UnboundedReceiver<FlowMessage<T>>,
    quota: usize,
) {
    for _ in 0..quota {
        let message = match receiver.recv().await {
            Some(message) => message,
            None => {
                // The channel closed mid-quota: the sending partition
                // failed before delivering everything we counted.
                fail(&engine, "upstream flow partition failed").await;
                return;
            }
        };
        let mut state = engine.state.lock().await;
        deliver(&engine.policies, &mut state.out, message.dest, message.value);
        state.pending[message.dest] -= 1;
        if state.pending[message.dest] == 0 {
            fire(&engine, &mut state, vec![message.dest]);
        }
    }
    let mut state = engine.state.lock().await;
    state.monitors -= 1;
    if state.monitors == 0 && state.remaining > 0 {
        // Every counted arrival is in, yet cells still wait on one
        // another.
        if let Some(done) = state.done.take() {
            let _ = done.send(Err("flow direction network contains a cycle".to_string()));
        }
    }
}

async fn partition_wavefront<T: Element>(
    caller: Caller,
    grid: Arc<CommGrid<T>>,
    flow: Arc<PartitionedArray<u8, 2>>,
    material: Arc<PartitionedArray<T, 2>>,
    policies: Policies<T>,
    rank: usize,
    owner: Locality,
) -> Result<PartitionRef<T, 2>, Error> {
    // Take the outgoing send handles before anything that can fail:
    // an early return closes the channels, telling downstream
    // wavefronts to give up instead of waiting forever.
    let senders = grid.take_senders(rank)?;

    let own = flow.region_of(rank)?;
    let tiling = flow.tiling();
    let halo = read_haloed(&caller, &flow, rank, 1, u8::NO_DATA).await?;
    let material_ref = material.partition(rank).await?;
    let material_block = material_ref
        .read(&caller)
        .await
        .map_err(|err| Error::partition(material_ref.id(), err))?;
    let topology = analyze(&tiling, &own, &halo)?;

    // A cell starts from its own material. Cells without a flow
    // direction, with no-data material, or with material outside the
    // domain are marked; everything they would pass on is poisoned.
    let nr = own.shape().nr_elements();
    let mut out = Vec::with_capacity(nr);
    for (cell, &value) in material_block.values().iter().enumerate() {
        let valid = !matches!(topology.flow[cell], Flow::NoData)
            && !policies.is_input_no_data(value)
            && policies.domain_contains(value);
        out.push(if valid { value } else { policies.no_data_mark() });
    }

    let engine = Arc::new(Engine {
        policies,
        drains: topology.drains,
        senders,
        state: tokio::sync::Mutex::new(Wavefront {
            out,
            pending: topology.inflow,
            remaining: nr,
            monitors: 0,
            done: None,
        }),
    });
    let (done_tx, done_rx) = oneshot::channel();
    {
        let mut state = engine.state.lock().await;
        state.done = Some(done_tx);
        state.monitors = topology.expected.len();
        let seeds = (0..nr).filter(|&cell| state.pending[cell] == 0).collect();
        fire(&engine, &mut state, seeds);
        if state.remaining > 0 && topology.expected.is_empty() {
            return Err(Error::Compute(
                "flow direction network contains a cycle".to_string(),
            ));
        }
    }
    let mut monitors = Vec::with_capacity(topology.expected.len());
    for (source, quota) in topology.expected {
        let receiver = match grid.take_receiver(source, rank) {
            Some(receiver) => receiver,
            // Expected arrivals come from adjacent tiles only, and a
            // channel exists for every adjacent tile pair.
            None => unreachable!(),
        };
        monitors.push(tokio::spawn(monitor(Arc::clone(&engine), receiver, quota)));
    }

    let outcome = done_rx.await;
    // Monitors share the engine, and the engine owns the outgoing
    // senders. Stop them so the senders drop with this task and
    // downstream wavefronts observe the closed channels.
    for handle in monitors {
        handle.abort();
    }
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(reason)) => return Err(Error::Compute(reason)),
        Err(_) => return Err(Error::Compute("flow wavefront stalled".to_string())),
    }

    let out = std::mem::take(&mut engine.state.lock().await.out);
    let block = Block::new(own.shape(), out).map_err(|err| Error::Compute(err.to_string()))?;
    Ok(owner.spawn_partition(own.offset(), block))
}

/// Push material down a flow direction network.
///
/// Every cell's result is its own material plus everything draining in
/// from upstream. Cells whose flow code, material, or domain check
/// fails are marked no-data, and so is everything downstream of them;
/// sinks keep what they receive; material draining off the array edge
/// is discarded.
///
/// The network must be acyclic. A cycle confined to one partition is
/// reported as an error; one spanning partitions stalls that
/// partition's future.
#[tracing::instrument(skip_all, fields(partitions = flow.nr_partitions()))]
pub fn accumulate<T: Element>(
    cluster: &Cluster,
    flow: &PartitionedArray<u8, 2>,
    material: &PartitionedArray<T, 2>,
    policies: Policies<T>,
) -> Result<PartitionedArray<T, 2>, Error> {
    flow.ensure_alike(material)?;
    let tiling = flow.tiling();
    let grid = Arc::new(CommGrid::<T>::new(&tiling)?);
    let flow = Arc::new(flow.clone());
    let material = Arc::new(material.clone());
    let mut partitions = Vec::with_capacity(flow.nr_partitions());
    for rank in 0..flow.nr_partitions() {
        let grid = Arc::clone(&grid);
        let flow = Arc::clone(&flow);
        let material = Arc::clone(&material);
        let owner = cluster.locality(flow.locality_of(rank)).clone();
        let caller = cluster.caller().clone();
        let task = tokio::spawn(partition_wavefront(
            caller, grid, flow, material, policies, rank, owner,
        ));
        partitions.push(spawned_partition(task));
    }
    Ok(PartitionedArray::from_parts(
        tiling,
        flow.placement().to_vec(),
        partitions,
    ))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use gridslice::Tiling;

    use super::*;
    use crate::policy::Domain;

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
    async fn test_accumulate_single_row() {
        let cluster = Cluster::local(1).unwrap();
        let tiling = Tiling::single(Shape::new([1, 4]));
        let flow = partitioned(&cluster, tiling, &[6u8, 6, 6, 5]);
        let material = partitioned(&cluster, tiling, &[1.0f64, 1.0, 1.0, 1.0]);

        let out = accumulate(&cluster, &flow, &material, Policies::default()).unwrap();
        let gathered = out.gather(cluster.caller()).await.unwrap();
        assert_eq!(gathered.values(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[tokio::test]
    async fn test_accumulate_across_partitions() {
        // The chain crosses the tile boundary between columns 1 and 2;
        // the last cell drains off the array and its outflow vanishes.
        let cluster = Cluster::local(2).unwrap();
        let tiling = Tiling::new(Shape::new([1, 4]), Shape::new([1, 2])).unwrap();
        let flow = partitioned(&cluster, tiling, &[6u8, 6, 6, 6]);
        let material = partitioned(&cluster, tiling, &[1.0f64, 1.0, 1.0, 1.0]);

        let out = accumulate(&cluster, &flow, &material, Policies::default()).unwrap();
        let gathered = out.gather(cluster.caller()).await.unwrap();
        assert_eq!(gathered.values(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[tokio::test]
    async fn test_accumulate_pit_collects_everything() {
        let cluster = Cluster::local(2).unwrap();
        let tiling = Tiling::new(Shape::new([3, 3]), Shape::new([2, 2])).unwrap();
        let flow = partitioned(&cluster, tiling, &[3u8, 2, 1, 6, 5, 4, 9, 8, 7]);
        let material = partitioned(&cluster, tiling, &[1.0f64; 9]);

        let out = accumulate(&cluster, &flow, &material, Policies::default()).unwrap();
        let gathered = out.gather(cluster.caller()).await.unwrap();
        assert_eq!(gathered.values()[4], 9.0);
        for cell in [0, 1, 2, 3, 5, 6, 7, 8] {
            assert_eq!(gathered.values()[cell], 1.0);
        }
    }

    #[tokio::test]
    async fn test_accumulate_poisons_downstream() {
        let cluster = Cluster::local(1).unwrap();
        let tiling = Tiling::single(Shape::new([1, 4]));
        let flow = partitioned(&cluster, tiling, &[6u8, 6, 6, 5]);
        let material = partitioned(&cluster, tiling, &[1.0f64, f64::NAN, 1.0, 1.0]);

        let out = accumulate(&cluster, &flow, &material, Policies::default()).unwrap();
        let gathered = out.gather(cluster.caller()).await.unwrap();
        assert_eq!(gathered.values()[0], 1.0);
        assert!(gathered.values()[1].is_nan());
        assert!(gathered.values()[2].is_nan());
        assert!(gathered.values()[3].is_nan());
    }

    #[tokio::test]
    async fn test_accumulate_no_data_flow_absorbs() {
        // The second cell has no direction: arrivals into it vanish
        // and the chain restarts after it.
        let cluster = Cluster::local(1).unwrap();
        let tiling = Tiling::single(Shape::new([1, 4]));
        let flow = partitioned(&cluster, tiling, &[6u8, u8::NO_DATA, 6, 6]);
        let material = partitioned(&cluster, tiling, &[1.0f64, 1.0, 1.0, 1.0]);

        let out = accumulate(&cluster, &flow, &material, Policies::default()).unwrap();
        let gathered = out.gather(cluster.caller()).await.unwrap();
        assert_eq!(gathered.values()[0], 1.0);
        assert!(gathered.values()[1].is_nan());
        assert_eq!(gathered.values()[2], 1.0);
        assert_eq!(gathered.values()[3], 2.0);
    }

    #[tokio::test]
    async fn test_accumulate_domain_marks_sources() {
        let cluster = Cluster::local(1).unwrap();
        let tiling = Tiling::single(Shape::new([1, 3]));
        let flow = partitioned(&cluster, tiling, &[6u8, 6, 5]);
        let material = partitioned(&cluster, tiling, &[-1.0f64, 1.0, 1.0]);
        let policies = Policies::default().with_domain(Domain::NonNegative);

        let out = accumulate(&cluster, &flow, &material, policies).unwrap();
        let gathered = out.gather(cluster.caller()).await.unwrap();
        assert!(gathered.values()[0].is_nan());
        assert!(gathered.values()[1].is_nan());
        assert!(gathered.values()[2].is_nan());
    }

    #[tokio::test]
    async fn test_accumulate_rejects_local_cycle() {
        let cluster = Cluster::local(1).unwrap();
        let tiling = Tiling::single(Shape::new([1, 2]));
        // The two cells drain into each other.
        let flow = partitioned(&cluster, tiling, &[6u8, 4]);
        let material = partitioned(&cluster, tiling, &[1.0f64, 1.0]);

        let out = accumulate(&cluster, &flow, &material, Policies::default()).unwrap();
        assert_matches!(
            out.gather(cluster.caller()).await,
            Err(Error::Compute(reason)) if reason.contains("cycle")
        );
    }

    #[test]
    fn test_comm_grid_pairs() {
        let tiling = Tiling::new(Shape::new([4, 4]), Shape::new([2, 2])).unwrap();
        let grid = CommGrid::<f64>::new(&tiling).unwrap();

        // Tile 0 talks to its row, column, and diagonal neighbors.
        let senders = grid.take_senders(0).unwrap();
        let mut targets: Vec<usize> = senders.keys().copied().collect();
        targets.sort_unstable();
        assert_eq!(targets, vec![1, 2, 3]);

        // Each direction has its own channel.
        assert!(grid.take_receiver(0, 1).is_some());
        assert!(grid.take_receiver(1, 0).is_some());
        assert!(grid.take_receiver(1, 0).is_none());
    }

    #[tokio::test]
    async fn test_messages_ride_the_pair_channel() {
        let tiling = Tiling::new(Shape::new([2, 4]), Shape::new([2, 2])).unwrap();
        let grid = CommGrid::<i64>::new(&tiling).unwrap();
        let senders = grid.take_senders(0).unwrap();
        senders[&1].send(FlowMessage { dest: 2, value: 7 }).unwrap();

        let mut receiver = grid.take_receiver(0, 1).unwrap();
        let message = receiver.recv().await.unwrap();
        assert_eq!(message.dest, 2);
        assert_eq!(message.value, 7);
    }
}
