/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Operation executors over partitioned arrays, grouped by the
//! neighborhood each output cell depends on: `local` (same cell),
//! `focal` (a window around the cell), `zonal` (all cells sharing a
//! zone), and `aggregate` (the whole array).

pub mod aggregate;
pub mod focal;
pub mod local;
pub mod zonal;
