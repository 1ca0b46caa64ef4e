/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Whole-array reductions to a single value on the caller.
//!
//! Partitions are tallied concurrently, one task per partition; the
//! caller folds the partials in tile order.

use tokio::task::JoinHandle;

use crate::array::PartitionedArray;
use crate::cluster::Cluster;
use crate::element::Element;
use crate::error::Error;
use crate::policy::Policies;

fn partial_tasks<T: Element, A, F, const R: usize>(
    cluster: &Cluster,
    input: &PartitionedArray<T, R>,
    fold: F,
) -> Vec<JoinHandle<Result<A, Error>>>
where
    A: Send + 'static,
    F: Fn(&[T]) -> A + Send + Sync + Copy + 'static,
{
    let mut partials = Vec::with_capacity(input.nr_partitions());
    for rank in 0..input.nr_partitions() {
        let part = input.partition(rank);
        let caller = cluster.caller().clone();
        partials.push(tokio::spawn(async move {
            let reference = part.await?;
            let block = reference
                .read(&caller)
                .await
                .map_err(|err| Error::partition(reference.id(), err))?;
            Ok(fold(block.values()))
        }));
    }
    partials
}

/// Sum of the array's valid cells. Zero if no cell is valid.
pub async fn sum<T: Element, const R: usize>(
    cluster: &Cluster,
    input: &PartitionedArray<T, R>,
    policies: Policies<T>,
) -> Result<T, Error> {
    let partials = partial_tasks(cluster, input, move |values: &[T]| {
        let mut acc = T::ZERO;
        for &value in values {
            if !policies.is_input_no_data(value) && policies.domain_contains(value) {
                acc = acc.elem_add(value);
            }
        }
        acc
    });
    let mut total = T::ZERO;
    for partial in partials {
        total = total.elem_add(partial.await.map_err(Error::join)??);
    }
    Ok(total)
}

/// Largest valid cell of the array. The no-data mark if no cell is
/// valid.
pub async fn maximum<T: Element, const R: usize>(
    cluster: &Cluster,
    input: &PartitionedArray<T, R>,
    policies: Policies<T>,
) -> Result<T, Error> {
    let partials = partial_tasks(cluster, input, move |values: &[T]| {
        let mut best: Option<T> = None;
        for &value in values {
            if policies.is_input_no_data(value) || !policies.domain_contains(value) {
                continue;
            }
            best = Some(match best {
                Some(best) => best.elem_max(value),
                None => value,
            });
        }
        best
    });
    let mut best: Option<T> = None;
    for partial in partials {
        if let Some(value) = partial.await.map_err(Error::join)?? {
            best = Some(match best {
                Some(best) => best.elem_max(value),
                None => value,
            });
        }
    }
    Ok(best.unwrap_or_else(|| policies.no_data_mark()))
}
