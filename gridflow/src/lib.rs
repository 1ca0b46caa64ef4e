/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Partition-parallel array computation for raster modeling.
//!
//! An array is decomposed by a [`gridslice::Tiling`] into dense
//! partitions hosted on the localities of a [`Cluster`]; a
//! [`PartitionedArray`] holds one shared future per partition, so
//! operations chain without materializing intermediate results.
//! Operations come in the classic map-algebra families: elementwise
//! ([`ops::local`]), windowed ([`ops::focal`]), per-zone
//! ([`ops::zonal`]), whole-array reductions ([`ops::aggregate`]), and
//! flow-direction routing ([`routing`]), which resolves
//! cross-partition drainage as a distributed wavefront. Every
//! operation carries a [`Policies`] value deciding how no-data cells
//! are detected and marked, and which input values count as in
//! domain.
//!
//! Arrays load from and save to storage through [`io`]: a block-store
//! collaborator trait and ESRI ASCII rasters.

pub mod array;
pub mod cluster;
mod compute;
pub mod element;
pub mod error;
pub mod io;
pub mod ops;
pub mod policy;
pub mod routing;

pub use crate::array::PartitionFuture;
pub use crate::array::PartitionedArray;
pub use crate::cluster::Cluster;
pub use crate::element::Element;
pub use crate::element::Integral;
pub use crate::element::Real;
pub use crate::error::Error;
pub use crate::ops::focal::HaloFill;
pub use crate::ops::focal::Kernel;
pub use crate::policy::Domain;
pub use crate::policy::NoDataDetect;
pub use crate::policy::NoDataMark;
pub use crate::policy::Policies;
