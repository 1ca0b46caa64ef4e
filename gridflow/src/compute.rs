/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Owner-side execution of cell-local work.
//!
//! Cell loops run where the data lives. An operation installs a
//! [`ComputeService`] across the cluster, then posts one
//! [`ComputeRequest`] per partition to the owning locality's port. The
//! owner resolves operand refs against its own ledger (recovering the
//! in-process path a wire round trip strips), evaluates the loop, and
//! replies with a ref to the freshly served output partition.
//!
//! The service lives as long as any request is in flight: every
//! driving task holds the installing `Arc`, and dropping the last one
//! tears the serve loops down.

use std::future::Future;
use std::sync::Arc;

use gridslice::Offset;
use gridslice::Shape;
use gridslice::Tiling;
use partactor::Block;
use partactor::Locality;
use partactor::LocalityId;
use partactor::PartitionRef;
use partactor::mailbox::OncePortRef;
use partactor::mailbox::PortRef;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::Deserialize;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::array::PartitionFuture;
use crate::array::PartitionedArray;
use crate::array::spawned_partition;
use crate::cluster::Cluster;
use crate::element::Element;
use crate::error::Error;
use crate::ops::local::BinaryOp;
use crate::ops::local::UnaryOp;
use crate::ops::local::eval_binary;
use crate::ops::local::eval_unary;
use crate::policy::Policies;

/// What a compute request resolves to: a ref to the output partition,
/// or the owner's rejection.
pub type ComputeReply<T, const R: usize> = Result<PartitionRef<T, R>, String>;

/// The requests a locality's compute port answers.
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum ComputeRequest<T: Element, const R: usize> {
    /// Evaluate a binary cell loop over two congruent partitions.
    Binary {
        op: BinaryOp,
        policies: Policies<T>,
        left: PartitionRef<T, R>,
        right: PartitionRef<T, R>,
        reply: OncePortRef<ComputeReply<T, R>>,
    },

    /// Evaluate a unary cell loop over one partition.
    Unary {
        op: UnaryOp,
        policies: Policies<T>,
        input: PartitionRef<T, R>,
        reply: OncePortRef<ComputeReply<T, R>>,
    },

    /// Materialize a partition of uniform draws from `low..high`.
    Uniform {
        offset: Offset<R>,
        shape: Shape<R>,
        low: T,
        high: T,
        seed: u64,
        reply: OncePortRef<ComputeReply<T, R>>,
    },
}

/// One compute port per locality, serving [`ComputeRequest`]s for a
/// single element type and rank.
pub struct ComputeService<T: Element, const R: usize> {
    ports: Vec<PortRef<ComputeRequest<T, R>>>,
    serve_tasks: Vec<JoinHandle<()>>,
}

impl<T: Element, const R: usize> ComputeService<T, R> {
    /// Open a compute port on every locality and start serving.
    pub fn install(cluster: &Cluster) -> Arc<Self> {
        let mut ports = Vec::with_capacity(cluster.nr_localities());
        let mut serve_tasks = Vec::with_capacity(cluster.nr_localities());
        for locality in cluster.localities() {
            let (port, mut receiver) = locality.mailbox().open_port::<ComputeRequest<T, R>>();
            ports.push(port.bind());
            let locality = locality.clone();
            serve_tasks.push(tokio::spawn(async move {
                while let Ok(request) = receiver.recv().await {
                    // Requests are independent; serve them concurrently.
                    tokio::spawn(serve_one(locality.clone(), request));
                }
            }));
        }
        Arc::new(Self { ports, serve_tasks })
    }

    /// The compute port of the locality with the given id.
    pub fn port(&self, owner: LocalityId) -> &PortRef<ComputeRequest<T, R>> {
        &self.ports[owner.rank()]
    }
}

impl<T: Element, const R: usize> Drop for ComputeService<T, R> {
    fn drop(&mut self) {
        for task in &self.serve_tasks {
            task.abort();
        }
    }
}

async fn serve_one<T: Element, const R: usize>(locality: Locality, request: ComputeRequest<T, R>) {
    let dialer = locality.dialer().clone();
    let result = match request {
        ComputeRequest::Binary {
            op,
            policies,
            left,
            right,
            reply,
        } => {
            let outcome = binary_block(&locality, op, &policies, left, right).await;
            dialer.post_once(reply, outcome)
        }
        ComputeRequest::Unary {
            op,
            policies,
            input,
            reply,
        } => {
            let outcome = unary_block(&locality, op, &policies, input).await;
            dialer.post_once(reply, outcome)
        }
        ComputeRequest::Uniform {
            offset,
            shape,
            low,
            high,
            seed,
            reply,
        } => {
            let outcome = uniform_block(&locality, offset, shape, low, high, seed);
            dialer.post_once(reply, outcome)
        }
    };
    if let Err(err) = result {
        tracing::warn!("{}: failed to reply to compute request: {}", locality.id(), err);
    }
}

/// Recover the in-process path for refs this locality owns. Refs
/// arrive off the wire with the direct path stripped.
fn resolve<T: Element, const R: usize>(
    locality: &Locality,
    reference: PartitionRef<T, R>,
) -> PartitionRef<T, R> {
    locality.partition(reference.id()).unwrap_or(reference)
}

async fn binary_block<T: Element, const R: usize>(
    locality: &Locality,
    op: BinaryOp,
    policies: &Policies<T>,
    left: PartitionRef<T, R>,
    right: PartitionRef<T, R>,
) -> ComputeReply<T, R> {
    let left = resolve(locality, left);
    let right = resolve(locality, right);
    let offset = left.offset();
    let caller = locality.caller();
    let (left, right) = futures::future::try_join(left.read(caller), right.read(caller))
        .await
        .map_err(|err| err.to_string())?;
    let out = eval_binary(op, policies, &left, &right).map_err(|err| err.to_string())?;
    Ok(locality.spawn_partition(offset, out))
}

async fn unary_block<T: Element, const R: usize>(
    locality: &Locality,
    op: UnaryOp,
    policies: &Policies<T>,
    input: PartitionRef<T, R>,
) -> ComputeReply<T, R> {
    let input = resolve(locality, input);
    let offset = input.offset();
    let block = input
        .read(locality.caller())
        .await
        .map_err(|err| err.to_string())?;
    Ok(locality.spawn_partition(offset, eval_unary(op, policies, &block)))
}

fn uniform_block<T: Element, const R: usize>(
    locality: &Locality,
    offset: Offset<R>,
    shape: Shape<R>,
    low: T,
    high: T,
    seed: u64,
) -> ComputeReply<T, R> {
    if !(low < high) {
        return Err("uniform requires low < high".to_string());
    }
    let mut rng = SmallRng::seed_from_u64(seed);
    let values = (0..shape.nr_elements())
        .map(|_| rng.gen_range(low..high))
        .collect();
    let block = Block::new(shape, values).map_err(|err| err.to_string())?;
    Ok(locality.spawn_partition(offset, block))
}

/// Drive a binary operation: one compute request per partition, sent
/// to the left operand's owner.
pub(crate) fn run_binary<T: Element, const R: usize>(
    cluster: &Cluster,
    op: BinaryOp,
    policies: Policies<T>,
    left: &PartitionedArray<T, R>,
    right: &PartitionedArray<T, R>,
) -> Result<PartitionedArray<T, R>, Error> {
    left.ensure_alike(right)?;
    let service = ComputeService::<T, R>::install(cluster);
    let mut partitions = Vec::with_capacity(left.nr_partitions());
    for rank in 0..left.nr_partitions() {
        let owner = cluster.locality(left.locality_of(rank)).clone();
        let port = service.port(owner.id()).clone();
        let caller = cluster.caller().clone();
        let left = left.partition(rank);
        let right = right.partition(rank);
        let service = Arc::clone(&service);
        partitions.push(request_partition(async move {
            let _keep = service;
            let (left, right) = futures::future::try_join(left, right).await?;
            let reply = caller
                .call(&port, |reply| ComputeRequest::Binary {
                    op,
                    policies,
                    left,
                    right,
                    reply,
                })
                .await?;
            Ok((owner, reply))
        }));
    }
    Ok(PartitionedArray::from_parts(
        left.tiling(),
        left.placement().to_vec(),
        partitions,
    ))
}

/// Drive a unary operation: one compute request per partition, sent to
/// the input's owner.
pub(crate) fn run_unary<T: Element, const R: usize>(
    cluster: &Cluster,
    op: UnaryOp,
    policies: Policies<T>,
    input: &PartitionedArray<T, R>,
) -> Result<PartitionedArray<T, R>, Error> {
    let service = ComputeService::<T, R>::install(cluster);
    let mut partitions = Vec::with_capacity(input.nr_partitions());
    for rank in 0..input.nr_partitions() {
        let owner = cluster.locality(input.locality_of(rank)).clone();
        let port = service.port(owner.id()).clone();
        let caller = cluster.caller().clone();
        let input = input.partition(rank);
        let service = Arc::clone(&service);
        partitions.push(request_partition(async move {
            let _keep = service;
            let input = input.await?;
            let reply = caller
                .call(&port, |reply| ComputeRequest::Unary {
                    op,
                    policies,
                    input,
                    reply,
                })
                .await?;
            Ok((owner, reply))
        }));
    }
    Ok(PartitionedArray::from_parts(
        input.tiling(),
        input.placement().to_vec(),
        partitions,
    ))
}

/// Drive uniform generation: one compute request per tile, placed
/// round-robin.
pub(crate) fn run_uniform<T: Element, const R: usize>(
    cluster: &Cluster,
    tiling: Tiling<R>,
    low: T,
    high: T,
    seed: u64,
) -> Result<PartitionedArray<T, R>, Error> {
    if !(low < high) {
        return Err(Error::Compute("uniform requires low < high".into()));
    }
    let service = ComputeService::<T, R>::install(cluster);
    let mut placement = Vec::with_capacity(tiling.nr_tiles());
    let mut partitions = Vec::with_capacity(tiling.nr_tiles());
    for (rank, (_, region)) in tiling.regions().enumerate() {
        let owner = cluster.locality(cluster.place(rank)).clone();
        placement.push(owner.id());
        let port = service.port(owner.id()).clone();
        let caller = cluster.caller().clone();
        // Each rank draws from its own stream.
        let seed = seed ^ (rank as u64).wrapping_mul(0x9E3779B97F4A7C15);
        let service = Arc::clone(&service);
        partitions.push(request_partition(async move {
            let _keep = service;
            let reply = caller
                .call(&port, |reply| ComputeRequest::Uniform {
                    offset: region.offset(),
                    shape: region.shape(),
                    low,
                    high,
                    seed,
                    reply,
                })
                .await?;
            Ok((owner, reply))
        }));
    }
    Ok(PartitionedArray::from_parts(tiling, placement, partitions))
}

/// Spawn a request task and adapt its reply into a partition future,
/// recovering the in-process path for the owner's fresh ref.
fn request_partition<T: Element, const R: usize>(
    request: impl Future<Output = Result<(Locality, ComputeReply<T, R>), Error>> + Send + 'static,
) -> PartitionFuture<T, R> {
    spawned_partition(tokio::spawn(async move {
        let (owner, reply) = request.await?;
        let reference = reply.map_err(Error::Compute)?;
        Ok(resolve(&owner, reference))
    }))
}
