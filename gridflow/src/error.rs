/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The operation-level error type.
//!
//! Partition futures are shared: several downstream operations can
//! await the same partition, and all of them must observe the same
//! failure. The error is therefore `Clone`, carrying foreign sources
//! in rendered form rather than by ownership.

use gridslice::ShapeError;
use partactor::PartitionError;
use partactor::PartitionId;
use partactor::channel::ChannelError;
use partactor::mailbox::MailboxError;

/// The type of error for array operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Operand arrays disagree structurally (shape or tiling).
    #[error("arrays are not alike: {left} vs {right}")]
    Mismatch { left: String, right: String },

    #[error("shape: {0}")]
    Shape(String),

    /// A partition request failed or was rejected by its server.
    #[error("partition {id}: {reason}")]
    Partition { id: PartitionId, reason: String },

    /// An owner-side compute request was rejected.
    #[error("compute: {0}")]
    Compute(String),

    /// Cluster construction failed.
    #[error("cluster: {0}")]
    Cluster(String),

    #[error("channel: {0}")]
    Channel(String),

    /// A spawned operation task failed to join.
    #[error("task: {0}")]
    Join(String),

    #[error("store: {0}")]
    Store(String),

    #[error("raster: {0}")]
    Raster(String),
}

impl Error {
    pub(crate) fn mismatch(left: impl std::fmt::Display, right: impl std::fmt::Display) -> Self {
        Error::Mismatch {
            left: left.to_string(),
            right: right.to_string(),
        }
    }

    pub(crate) fn partition(id: PartitionId, err: PartitionError) -> Self {
        Error::Partition {
            id,
            reason: err.to_string(),
        }
    }

    pub(crate) fn join(err: tokio::task::JoinError) -> Self {
        Error::Join(err.to_string())
    }
}

impl From<ShapeError> for Error {
    fn from(err: ShapeError) -> Self {
        Error::Shape(err.to_string())
    }
}

impl From<MailboxError> for Error {
    fn from(err: MailboxError) -> Self {
        Error::Channel(err.to_string())
    }
}

impl From<ChannelError> for Error {
    fn from(err: ChannelError) -> Self {
        Error::Channel(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Store(err.to_string())
    }
}
