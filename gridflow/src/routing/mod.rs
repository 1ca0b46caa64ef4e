/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Routing operations over flow direction networks.
//!
//! A flow direction network is a rank-2 `u8` array of keypad codes
//! ([`direction`]) in which every cell drains into one of its eight
//! neighbors, holds as a sink, or routes nothing. [`inflow_count`]
//! reports each cell's inbound degree; [`accumulate`] pushes material
//! down the network, partition-parallel, with cross-boundary flow
//! carried on per-tile-pair channels ([`wavefront`]).

pub mod direction;
pub mod inflow;
pub mod wavefront;

pub use direction::Direction;
pub use direction::Flow;
pub use inflow::inflow_count;
pub use wavefront::accumulate;
