/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Cell-local operations: each output cell depends only on the input
//! cell(s) at the same position.
//!
//! Execution is owner-side. For every partition, the operand refs
//! travel to the owning locality as a compute request; the owner
//! evaluates the cell loop against its local block and serves the
//! result as a new partition. The returned array's futures resolve as
//! owners reply, so chains of operations pipeline per partition.

use gridslice::ShapeError;
use gridslice::Tiling;
use partactor::Block;
use serde::Deserialize;
use serde::Serialize;

use crate::array::PartitionedArray;
use crate::cluster::Cluster;
use crate::compute;
use crate::element::Element;
use crate::element::Real;
use crate::error::Error;
use crate::policy::Policies;

/// The binary cell-local operators.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl BinaryOp {
    /// Apply to one pair of in-domain values. `None` where the result
    /// has no representation (zero divisor).
    pub(crate) fn apply<T: Element>(self, left: T, right: T) -> Option<T> {
        match self {
            BinaryOp::Add => Some(left.elem_add(right)),
            BinaryOp::Subtract => Some(left.elem_sub(right)),
            BinaryOp::Multiply => Some(left.elem_mul(right)),
            BinaryOp::Divide => (right != T::ZERO).then(|| left.elem_div(right)),
        }
    }
}

/// The unary cell-local operators.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Negate,
    Abs,
    Sqrt,
}

impl UnaryOp {
    /// Apply to one in-domain value. `None` where the result has no
    /// representation (negating a minimum, rooting a negative).
    pub(crate) fn apply<T: Element>(self, value: T) -> Option<T> {
        match self {
            UnaryOp::Negate => value.checked_neg(),
            UnaryOp::Abs => Some(value.elem_abs()),
            UnaryOp::Sqrt => value.checked_sqrt(),
        }
    }
}

/// Evaluate a binary operator over two congruent blocks. No-data or
/// out-of-domain inputs, and unrepresentable results, yield the marked
/// output cell.
pub(crate) fn eval_binary<T: Element, const R: usize>(
    op: BinaryOp,
    policies: &Policies<T>,
    left: &Block<T, R>,
    right: &Block<T, R>,
) -> Result<Block<T, R>, ShapeError> {
    left.shape().ensure_same(right.shape())?;
    let mut out = Block::filled(*left.shape(), policies.no_data_mark());
    for ((out, &l), &r) in out
        .values_mut()
        .iter_mut()
        .zip(left.values())
        .zip(right.values())
    {
        if policies.is_input_no_data(l) || policies.is_input_no_data(r) {
            continue;
        }
        if !policies.domain_contains(l) || !policies.domain_contains(r) {
            continue;
        }
        if let Some(value) = op.apply(l, r) {
            *out = value;
        }
    }
    Ok(out)
}

/// Evaluate a unary operator over a block.
pub(crate) fn eval_unary<T: Element, const R: usize>(
    op: UnaryOp,
    policies: &Policies<T>,
    input: &Block<T, R>,
) -> Block<T, R> {
    let mut out = Block::filled(*input.shape(), policies.no_data_mark());
    for (out, &value) in out.values_mut().iter_mut().zip(input.values()) {
        if policies.is_input_no_data(value) || !policies.domain_contains(value) {
            continue;
        }
        if let Some(value) = op.apply(value) {
            *out = value;
        }
    }
    out
}

/// Elementwise sum of two congruent arrays.
pub fn add<T: Element, const R: usize>(
    cluster: &Cluster,
    left: &PartitionedArray<T, R>,
    right: &PartitionedArray<T, R>,
    policies: Policies<T>,
) -> Result<PartitionedArray<T, R>, Error> {
    compute::run_binary(cluster, BinaryOp::Add, policies, left, right)
}

/// Elementwise difference of two congruent arrays.
pub fn subtract<T: Element, const R: usize>(
    cluster: &Cluster,
    left: &PartitionedArray<T, R>,
    right: &PartitionedArray<T, R>,
    policies: Policies<T>,
) -> Result<PartitionedArray<T, R>, Error> {
    compute::run_binary(cluster, BinaryOp::Subtract, policies, left, right)
}

/// Elementwise product of two congruent arrays.
pub fn multiply<T: Element, const R: usize>(
    cluster: &Cluster,
    left: &PartitionedArray<T, R>,
    right: &PartitionedArray<T, R>,
    policies: Policies<T>,
) -> Result<PartitionedArray<T, R>, Error> {
    compute::run_binary(cluster, BinaryOp::Multiply, policies, left, right)
}

/// Elementwise quotient of two congruent arrays. Cells with a zero
/// divisor are marked no-data.
pub fn divide<T: Element, const R: usize>(
    cluster: &Cluster,
    left: &PartitionedArray<T, R>,
    right: &PartitionedArray<T, R>,
    policies: Policies<T>,
) -> Result<PartitionedArray<T, R>, Error> {
    compute::run_binary(cluster, BinaryOp::Divide, policies, left, right)
}

/// Elementwise negation.
pub fn negate<T: Element, const R: usize>(
    cluster: &Cluster,
    input: &PartitionedArray<T, R>,
    policies: Policies<T>,
) -> Result<PartitionedArray<T, R>, Error> {
    compute::run_unary(cluster, UnaryOp::Negate, policies, input)
}

/// Elementwise absolute value.
pub fn abs<T: Element, const R: usize>(
    cluster: &Cluster,
    input: &PartitionedArray<T, R>,
    policies: Policies<T>,
) -> Result<PartitionedArray<T, R>, Error> {
    compute::run_unary(cluster, UnaryOp::Abs, policies, input)
}

/// Elementwise square root. Cells with negative input are marked
/// no-data.
pub fn sqrt<T: Real, const R: usize>(
    cluster: &Cluster,
    input: &PartitionedArray<T, R>,
    policies: Policies<T>,
) -> Result<PartitionedArray<T, R>, Error> {
    compute::run_unary(cluster, UnaryOp::Sqrt, policies, input)
}

/// An array of independent draws from the uniform distribution over
/// `low..high`. The same seed, tiling, and cluster size reproduce the
/// same array.
pub fn uniform<T: Element, const R: usize>(
    cluster: &Cluster,
    tiling: Tiling<R>,
    low: T,
    high: T,
    seed: u64,
) -> Result<PartitionedArray<T, R>, Error> {
    compute::run_uniform(cluster, tiling, low, high, seed)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use gridslice::Shape;

    use super::*;
    use crate::policy::Domain;
    use crate::policy::NoDataDetect;

    fn block<T: Element>(values: Vec<T>) -> Block<T, 2> {
        let len = values.len();
        Block::new(Shape::new([1, len]), values).unwrap()
    }

    #[test]
    fn test_eval_binary_marks_no_data_inputs() {
        let policies = Policies::<f64>::default();
        let left = block(vec![1.0, f64::NAN, 3.0]);
        let right = block(vec![10.0, 10.0, f64::NAN]);
        let out = eval_binary(BinaryOp::Add, &policies, &left, &right).unwrap();
        assert_eq!(out.values()[0], 11.0);
        assert!(out.values()[1].is_nan());
        assert!(out.values()[2].is_nan());
    }

    #[test]
    fn test_eval_binary_divide_by_zero() {
        let policies = Policies::<i64>::default();
        let left = block(vec![10, 10]);
        let right = block(vec![2, 0]);
        let out = eval_binary(BinaryOp::Divide, &policies, &left, &right).unwrap();
        assert_eq!(out.values()[0], 5);
        assert!(out.values()[1].is_no_data());
    }

    #[test]
    fn test_eval_binary_domain() {
        let policies = Policies::<i64>::default().with_domain(Domain::NonNegative);
        let left = block(vec![1, -1]);
        let right = block(vec![1, 1]);
        let out = eval_binary(BinaryOp::Add, &policies, &left, &right).unwrap();
        assert_eq!(out.values()[0], 2);
        assert!(out.values()[1].is_no_data());
    }

    #[test]
    fn test_eval_binary_shape_mismatch() {
        let policies = Policies::<i64>::default();
        let left = block(vec![1, 2]);
        let right = block(vec![1, 2, 3]);
        assert_matches!(
            eval_binary(BinaryOp::Add, &policies, &left, &right),
            Err(ShapeError::Mismatch { .. })
        );
    }

    #[test]
    fn test_eval_unary_sqrt() {
        let policies = Policies::<f64>::default();
        let input = block(vec![4.0, -4.0, f64::NAN]);
        let out = eval_unary(UnaryOp::Sqrt, &policies, &input);
        assert_eq!(out.values()[0], 2.0);
        assert!(out.values()[1].is_nan());
        assert!(out.values()[2].is_nan());
    }

    #[test]
    fn test_eval_unary_sentinel_detection() {
        let policies = Policies::<f64>::default().with_input_no_data(NoDataDetect::Value(-9999.0));
        let input = block(vec![-9999.0, 2.0]);
        let out = eval_unary(UnaryOp::Abs, &policies, &input);
        assert!(out.values()[0].is_nan());
        assert_eq!(out.values()[1], 2.0);
    }

    #[tokio::test]
    async fn test_add_matches_elementwise() {
        let cluster = Cluster::local(2).unwrap();
        let tiling = Tiling::new(Shape::new([3, 4]), Shape::new([2, 2])).unwrap();
        let left_values: Vec<i64> = (0..12).collect();
        let right_values: Vec<i64> = (0..12).map(|v| v * 10).collect();
        let left = partitioned(&cluster, tiling, &left_values);
        let right = partitioned(&cluster, tiling, &right_values);

        let out = add(&cluster, &left, &right, Policies::default()).unwrap();
        let gathered = out.gather(cluster.caller()).await.unwrap();
        for (cell, value) in gathered.values().iter().enumerate() {
            assert_eq!(*value, left_values[cell] + right_values[cell]);
        }
    }

    #[tokio::test]
    async fn test_divide_marks_zero_divisors() {
        let cluster = Cluster::local(1).unwrap();
        let tiling = Tiling::single(Shape::new([1, 3]));
        let left = PartitionedArray::from_blocks(
            &cluster,
            tiling,
            vec![block(vec![8.0f64, 9.0, 10.0])],
        )
        .unwrap();
        let right =
            PartitionedArray::from_blocks(&cluster, tiling, vec![block(vec![2.0, 0.0, 5.0])])
                .unwrap();

        let out = divide(&cluster, &left, &right, Policies::default()).unwrap();
        let gathered = out.gather(cluster.caller()).await.unwrap();
        assert_eq!(gathered.values()[0], 4.0);
        assert!(gathered.values()[1].is_nan());
        assert_eq!(gathered.values()[2], 2.0);
    }

    #[tokio::test]
    async fn test_operations_chain() {
        let cluster = Cluster::local(2).unwrap();
        let tiling = Tiling::new(Shape::new([2, 4]), Shape::new([2, 2])).unwrap();
        let values: Vec<f64> = vec![1.0, 4.0, 9.0, 16.0, 25.0, 36.0, 49.0, 64.0];
        let input = partitioned(&cluster, tiling, &values);

        // sqrt(x) * sqrt(x) recovers x; the intermediate arrays are
        // never gathered.
        let roots = sqrt(&cluster, &input, Policies::default()).unwrap();
        let squares = multiply(&cluster, &roots, &roots, Policies::default()).unwrap();
        let gathered = squares.gather(cluster.caller()).await.unwrap();
        for (cell, value) in gathered.values().iter().enumerate() {
            assert!((value - values[cell]).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn test_mismatched_tilings_rejected() {
        let cluster = Cluster::local(1).unwrap();
        let left = PartitionedArray::filled(
            &cluster,
            Tiling::new(Shape::new([4, 4]), Shape::new([2, 2])).unwrap(),
            1i64,
        );
        let right = PartitionedArray::filled(
            &cluster,
            Tiling::new(Shape::new([4, 4]), Shape::new([4, 4])).unwrap(),
            1i64,
        );
        assert_matches!(
            add(&cluster, &left, &right, Policies::default()),
            Err(Error::Mismatch { .. })
        );
    }

    #[tokio::test]
    async fn test_uniform_bounds_and_determinism() {
        let cluster = Cluster::local(2).unwrap();
        let tiling = Tiling::new(Shape::new([4, 4]), Shape::new([2, 2])).unwrap();

        let first = uniform(&cluster, tiling, -1.0f64, 1.0, 42).unwrap();
        let second = uniform(&cluster, tiling, -1.0f64, 1.0, 42).unwrap();
        let other = uniform(&cluster, tiling, -1.0f64, 1.0, 43).unwrap();

        let first = first.gather(cluster.caller()).await.unwrap();
        let second = second.gather(cluster.caller()).await.unwrap();
        let other = other.gather(cluster.caller()).await.unwrap();

        assert!(first.values().iter().all(|v| (-1.0..1.0).contains(v)));
        assert_eq!(first.values(), second.values());
        assert_ne!(first.values(), other.values());
    }

    fn partitioned<T: Element>(
        cluster: &Cluster,
        tiling: Tiling<2>,
        values: &[T],
    ) -> PartitionedArray<T, 2> {
        let shape = tiling.array_shape();
        let whole = Block::new(shape, values.to_vec()).unwrap();
        let blocks = tiling
            .regions()
            .map(|(_, region)| {
                Block::new(region.shape(), whole.region(&region).unwrap()).unwrap()
            })
            .collect();
        PartitionedArray::from_blocks(cluster, tiling, blocks).unwrap()
    }
}
