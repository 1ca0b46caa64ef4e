/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A locality is one runtime node: a served mailbox, a dialer, and the
//! ledger of partitions it owns.
//!
//! Localities spawn partitions and serve them for the life of the
//! locality. The ledger is type-erased so one locality can own
//! partitions of mixed element types and ranks; lookups downcast back
//! to the concrete partition type.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use gridslice::Offset;
use tokio::task::JoinHandle;

use crate::Cell;
use crate::channel::ChannelAddr;
use crate::channel::ChannelError;
use crate::channel::ChannelTransport;
use crate::mailbox::Caller;
use crate::mailbox::Dialer;
use crate::mailbox::Mailbox;
use crate::mailbox::MailboxServerHandle;
use crate::partition::Block;
use crate::partition::Partition;
use crate::partition::PartitionRef;
use crate::reference::LocalityId;
use crate::reference::PartitionId;

struct Served {
    reference: Box<dyn Any + Send + Sync>,
    join: JoinHandle<()>,
}

struct State {
    id: LocalityId,
    mailbox: Mailbox,
    dialer: Dialer,
    caller: Caller,
    next_partition: AtomicU64,
    partitions: DashMap<PartitionId, Served>,
    server: MailboxServerHandle,
}

impl Drop for State {
    fn drop(&mut self) {
        for entry in self.partitions.iter() {
            entry.value().join.abort();
        }
        self.server.stop();
    }
}

/// One runtime node hosting partitions. Cheap to clone.
#[derive(Clone)]
pub struct Locality {
    inner: Arc<State>,
}

impl std::fmt::Debug for Locality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Locality")
            .field("id", &self.inner.id)
            .field("addr", &self.inner.mailbox.addr())
            .field("partitions", &self.inner.partitions.len())
            .finish()
    }
}

impl Locality {
    /// Bring up a locality serving on a fresh address of the given
    /// transport.
    pub fn new(id: LocalityId, transport: ChannelTransport) -> Result<Self, ChannelError> {
        Self::serve(id, ChannelAddr::any(transport))
    }

    /// Bring up a locality serving on `addr`.
    pub fn serve(id: LocalityId, addr: ChannelAddr) -> Result<Self, ChannelError> {
        let (mailbox, server) = Mailbox::serve(id, addr)?;
        let dialer = Dialer::new();
        let caller = Caller::new(mailbox.clone(), dialer.clone());
        tracing::debug!("{}: serving on {}", id, mailbox.addr());
        Ok(Self {
            inner: Arc::new(State {
                id,
                mailbox,
                dialer,
                caller,
                next_partition: AtomicU64::new(0),
                partitions: DashMap::new(),
                server,
            }),
        })
    }

    pub fn id(&self) -> LocalityId {
        self.inner.id
    }

    /// The address this locality's mailbox serves on.
    pub fn addr(&self) -> ChannelAddr {
        self.inner.mailbox.addr()
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.inner.mailbox
    }

    pub fn dialer(&self) -> &Dialer {
        &self.inner.dialer
    }

    pub fn caller(&self) -> &Caller {
        &self.inner.caller
    }

    /// Spawn a partition owned by this locality and serve it. The
    /// returned ref carries the in-process path; its serialized form
    /// reaches the partition from anywhere.
    pub fn spawn_partition<T: Cell, const R: usize>(
        &self,
        offset: Offset<R>,
        data: Block<T, R>,
    ) -> PartitionRef<T, R> {
        let index = self.inner.next_partition.fetch_add(1, Ordering::Relaxed);
        let id = self.inner.id.partition_id(index);
        let partition = Partition::new(id, offset, data);
        let (reference, join) = partition.serve(&self.inner.mailbox, self.inner.dialer.clone());
        tracing::trace!("{}: spawned {} at {}", self.inner.id, id, offset);
        self.inner.partitions.insert(
            id,
            Served {
                reference: Box::new(reference.clone()),
                join,
            },
        );
        reference
    }

    /// Look up a partition this locality owns. `None` if the id is
    /// unknown or the element type or rank differ from the partition's
    /// own.
    pub fn partition<T: Cell, const R: usize>(&self, id: PartitionId) -> Option<PartitionRef<T, R>> {
        let entry = self.inner.partitions.get(&id)?;
        entry
            .reference
            .downcast_ref::<PartitionRef<T, R>>()
            .cloned()
    }

    /// Release a partition: stop serving it and drop its state.
    pub fn drop_partition(&self, id: PartitionId) -> bool {
        match self.inner.partitions.remove(&id) {
            Some((_, served)) => {
                served.join.abort();
                true
            }
            None => false,
        }
    }

    pub fn nr_partitions(&self) -> usize {
        self.inner.partitions.len()
    }
}

#[cfg(test)]
mod tests {
    use gridslice::Shape;

    use super::*;

    #[tokio::test]
    async fn test_spawn_and_lookup() {
        let locality = Locality::new(LocalityId(0), ChannelTransport::Local).unwrap();
        let data = Block::filled(Shape::new([2, 2]), 1.0f64);
        let reference = locality.spawn_partition(Offset::new([0, 0]), data);

        assert_eq!(reference.id(), LocalityId(0).partition_id(0));
        assert_eq!(locality.nr_partitions(), 1);

        let found: PartitionRef<f64, 2> = locality.partition(reference.id()).unwrap();
        assert_eq!(found.meta(), reference.meta());

        // Wrong element type or rank does not downcast.
        assert!(locality.partition::<i64, 2>(reference.id()).is_none());
        assert!(locality.partition::<f64, 1>(reference.id()).is_none());
    }

    #[tokio::test]
    async fn test_ids_are_monotone() {
        let locality = Locality::new(LocalityId(3), ChannelTransport::Local).unwrap();
        let a = locality.spawn_partition(Offset::new([0]), Block::filled(Shape::new([4]), 0i32));
        let b = locality.spawn_partition(Offset::new([4]), Block::filled(Shape::new([4]), 0i32));
        assert_eq!(a.id().to_string(), "loc[3].part[0]");
        assert_eq!(b.id().to_string(), "loc[3].part[1]");
        assert!(locality.drop_partition(a.id()));
        assert!(!locality.drop_partition(a.id()));
        assert_eq!(locality.nr_partitions(), 1);
    }

    #[tokio::test]
    async fn test_remote_access_via_serialized_ref() {
        let owner = Locality::new(LocalityId(0), ChannelTransport::Local).unwrap();
        let other = Locality::new(LocalityId(1), ChannelTransport::Local).unwrap();

        let data = Block::new(Shape::new([1, 4]), vec![1u32, 2, 3, 4]).unwrap();
        let reference = owner.spawn_partition(Offset::new([0, 0]), data);

        let bytes = bincode::serialize(&reference).unwrap();
        let remote: PartitionRef<u32, 2> = bincode::deserialize(&bytes).unwrap();
        let block = remote.read(other.caller()).await.unwrap();
        assert_eq!(block.values(), &[1, 2, 3, 4]);
    }
}
