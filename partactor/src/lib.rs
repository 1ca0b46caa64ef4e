/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Partition hosting for distributed arrays.
//!
//! This crate provides the runtime substrate the array layer builds
//! on: typed channels over local and TCP transports ([`channel`]),
//! mailboxes that multiplex message ports over one served address per
//! node ([`mailbox`]), and localities that own and serve array
//! partitions ([`locality`], [`partition`]).
//!
//! The design center is location transparency: a [`PartitionRef`]
//! works the same whether the partition lives in the caller's process
//! or behind a TCP connection, and every message type crosses the
//! same serialization boundary on every transport, so a single-process
//! run exercises the same code paths as a distributed one.

pub mod channel;
pub mod config;
pub mod locality;
pub mod mailbox;
pub mod partition;
pub mod reference;

use std::fmt::Debug;

use serde::Serialize;
use serde::de::DeserializeOwned;

pub use crate::locality::Locality;
pub use crate::mailbox::Caller;
pub use crate::mailbox::Dialer;
pub use crate::mailbox::Mailbox;
pub use crate::mailbox::OncePortRef;
pub use crate::mailbox::PortRef;
pub use crate::partition::Block;
pub use crate::partition::Partition;
pub use crate::partition::PartitionError;
pub use crate::partition::PartitionMeta;
pub use crate::partition::PartitionRef;
pub use crate::partition::PartitionRequest;
pub use crate::reference::LocalityId;
pub use crate::reference::PartitionId;

/// Serialized message bytes.
pub type Data = Vec<u8>;

/// A message that can travel between localities.
pub trait RemoteMessage: Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}
impl<T: Debug + Send + Sync + Serialize + DeserializeOwned + 'static> RemoteMessage for T {}

/// A value that can populate partition blocks: plain data, cheap to
/// copy, serializable for transport.
pub trait Cell: RemoteMessage + Copy {}
impl<T: RemoteMessage + Copy> Cell for T {}
