/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Array I/O: block-store collaborators and ESRI ASCII rasters.

pub mod block;
pub mod raster;

pub use block::BlockStore;
pub use block::MemoryStore;
pub use raster::RasterMeta;
pub use raster::from_raster;
pub use raster::read_raster;
pub use raster::to_raster;
pub use raster::write_raster;
