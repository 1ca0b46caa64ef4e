/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Partitions: dense array blocks served behind mailbox ports.
//!
//! A [`Partition`] owns one rectangular block of a larger array. It is
//! served on its locality's mailbox, where it answers
//! [`PartitionRequest`]s. The handle callers hold is a
//! [`PartitionRef`]: serializable, shareable across localities, and
//! location-transparent. A ref held on the partition's own locality
//! keeps a direct pointer to the partition state and skips
//! serialization; a deserialized ref goes through the wire. Both paths
//! land on the same state, so readers and writers agree regardless of
//! where they run.
//!
//! Region arguments are in partition-local coordinates; callers
//! translate from array-global coordinates first.

use std::sync::Arc;

use gridslice::Offset;
use gridslice::Region;
use gridslice::Shape;
use gridslice::ShapeError;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::Cell;
use crate::mailbox::Caller;
use crate::mailbox::Dialer;
use crate::mailbox::Mailbox;
use crate::mailbox::MailboxError;
use crate::mailbox::OncePortRef;
use crate::mailbox::PortRef;
use crate::reference::PartitionId;

/// The type of error for partition operations.
#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    #[error("block of {expected} cells given {actual} values")]
    ValueCount { expected: usize, actual: usize },

    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    /// The serving side rejected the request.
    #[error("{0}")]
    Rejected(String),
}

/// A dense, row-major block of cell values with known extents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block<T, const R: usize> {
    shape: Shape<R>,
    values: Vec<T>,
}

impl<T: Cell, const R: usize> Block<T, R> {
    /// Create a block from row-major values. The value count must
    /// match the shape.
    pub fn new(shape: Shape<R>, values: Vec<T>) -> Result<Self, PartitionError> {
        if values.len() != shape.nr_elements() {
            return Err(PartitionError::ValueCount {
                expected: shape.nr_elements(),
                actual: values.len(),
            });
        }
        Ok(Self { shape, values })
    }

    /// Create a block with every cell set to `value`.
    pub fn filled(shape: Shape<R>, value: T) -> Self {
        Self {
            shape,
            values: vec![value; shape.nr_elements()],
        }
    }

    pub fn shape(&self) -> &Shape<R> {
        &self.shape
    }

    /// The cell values in row-major order.
    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [T] {
        &mut self.values
    }

    pub fn into_values(self) -> Vec<T> {
        self.values
    }

    /// The value at `index`.
    pub fn get(&self, index: gridslice::Index<R>) -> Result<T, ShapeError> {
        Ok(self.values[self.shape.linearize(index)?])
    }

    /// Overwrite the value at `index`.
    pub fn set(&mut self, index: gridslice::Index<R>, value: T) -> Result<(), ShapeError> {
        let linear = self.shape.linearize(index)?;
        self.values[linear] = value;
        Ok(())
    }

    /// Copy out a window, row-major within the window.
    pub fn region(&self, region: &Region<R>) -> Result<Vec<T>, ShapeError> {
        region.checked_within(&self.shape)?;
        let mut out = Vec::with_capacity(region.nr_elements());
        if region.is_empty() {
            return Ok(out);
        }
        if R == 0 {
            out.push(self.values[0]);
            return Ok(out);
        }
        // The innermost dimension is contiguous; copy it in runs.
        let run = region.shape().extent(R - 1);
        for row in run_starts(region) {
            let start = self.shape.linearize(row)?;
            out.extend_from_slice(&self.values[start..start + run]);
        }
        Ok(out)
    }

    /// Overwrite a window from row-major values.
    pub fn write_region(&mut self, region: &Region<R>, values: &[T]) -> Result<(), PartitionError> {
        region.checked_within(&self.shape)?;
        if values.len() != region.nr_elements() {
            return Err(PartitionError::ValueCount {
                expected: region.nr_elements(),
                actual: values.len(),
            });
        }
        if region.is_empty() {
            return Ok(());
        }
        if R == 0 {
            self.values[0] = values[0];
            return Ok(());
        }
        let run = region.shape().extent(R - 1);
        for (i, row) in run_starts(region).enumerate() {
            let start = self.shape.linearize(row)?;
            self.values[start..start + run].copy_from_slice(&values[i * run..(i + 1) * run]);
        }
        Ok(())
    }

    /// Set every cell to `value`.
    pub fn fill(&mut self, value: T) {
        self.values.fill(value);
    }
}

/// Global indices of the first cell of each innermost-dimension run of
/// `region`, in row-major order.
fn run_starts<const R: usize>(region: &Region<R>) -> impl Iterator<Item = gridslice::Index<R>> + '_ {
    let mut rows = *region.shape().extents();
    if R > 0 {
        rows[R - 1] = 1;
    }
    Shape::new(rows)
        .indices()
        .map(move |row| region.offset().globalize(row))
}

/// A partition's placement within the enclosing array.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMeta<const R: usize> {
    pub id: PartitionId,
    pub offset: Offset<R>,
    pub shape: Shape<R>,
}

/// The request vocabulary a served partition answers. Regions are in
/// partition-local coordinates.
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum PartitionRequest<T: Cell, const R: usize> {
    /// All cell values, row-major.
    Read { reply: OncePortRef<Vec<T>> },

    /// The values of a window, row-major within the window.
    ReadRegion {
        region: Region<R>,
        reply: OncePortRef<Result<Vec<T>, String>>,
    },

    /// Overwrite a window with row-major values.
    WriteRegion {
        region: Region<R>,
        values: Vec<T>,
        reply: OncePortRef<Result<(), String>>,
    },

    /// Set every cell to one value.
    Fill { value: T, reply: OncePortRef<()> },

    /// The partition's placement and extents.
    Meta { reply: OncePortRef<PartitionMeta<R>> },
}

/// One rectangular block of a distributed array, owned by a locality.
#[derive(Debug)]
pub struct Partition<T, const R: usize> {
    id: PartitionId,
    offset: Offset<R>,
    data: Block<T, R>,
}

impl<T: Cell, const R: usize> Partition<T, R> {
    pub fn new(id: PartitionId, offset: Offset<R>, data: Block<T, R>) -> Self {
        Self { id, offset, data }
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn offset(&self) -> Offset<R> {
        self.offset
    }

    pub fn shape(&self) -> &Shape<R> {
        self.data.shape()
    }

    pub fn data(&self) -> &Block<T, R> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Block<T, R> {
        &mut self.data
    }

    pub fn meta(&self) -> PartitionMeta<R> {
        PartitionMeta {
            id: self.id,
            offset: self.offset,
            shape: *self.data.shape(),
        }
    }

    /// Serve the partition on `mailbox`, answering requests until the
    /// returned task is aborted or the mailbox goes away. The returned
    /// ref carries the direct in-process path.
    pub fn serve(self, mailbox: &Mailbox, dialer: Dialer) -> (PartitionRef<T, R>, JoinHandle<()>) {
        let (port, mut receiver) = mailbox.open_port::<PartitionRequest<T, R>>();
        let port_ref = port.bind();
        let meta = self.meta();
        let cell = Arc::new(RwLock::new(self));
        let served = Arc::clone(&cell);
        let join = tokio::spawn(async move {
            while let Ok(request) = receiver.recv().await {
                handle(&served, &dialer, request).await;
            }
        });
        (
            PartitionRef {
                meta,
                port: port_ref,
                cell: Some(cell),
            },
            join,
        )
    }
}

async fn handle<T: Cell, const R: usize>(
    cell: &Arc<RwLock<Partition<T, R>>>,
    dialer: &Dialer,
    request: PartitionRequest<T, R>,
) {
    let id = cell.read().await.id;
    let result = match request {
        PartitionRequest::Read { reply } => {
            let values = cell.read().await.data.values().to_vec();
            dialer.post_once(reply, values)
        }
        PartitionRequest::ReadRegion { region, reply } => {
            let read = cell
                .read()
                .await
                .data
                .region(&region)
                .map_err(|err| err.to_string());
            dialer.post_once(reply, read)
        }
        PartitionRequest::WriteRegion {
            region,
            values,
            reply,
        } => {
            let written = cell
                .write()
                .await
                .data
                .write_region(&region, &values)
                .map_err(|err| err.to_string());
            dialer.post_once(reply, written)
        }
        PartitionRequest::Fill { value, reply } => {
            cell.write().await.data.fill(value);
            dialer.post_once(reply, ())
        }
        PartitionRequest::Meta { reply } => {
            let meta = cell.read().await.meta();
            dialer.post_once(reply, meta)
        }
    };
    if let Err(err) = result {
        tracing::warn!("{}: failed to reply: {}", id, err);
    }
}

/// A shareable, serializable reference to a served partition.
///
/// Placement metadata is fixed at spawn time and travels with the ref,
/// so offset and shape lookups never leave the caller.
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct PartitionRef<T: Cell, const R: usize> {
    meta: PartitionMeta<R>,
    port: PortRef<PartitionRequest<T, R>>,
    #[serde(skip)]
    cell: Option<Arc<RwLock<Partition<T, R>>>>,
}

impl<T: Cell, const R: usize> Clone for PartitionRef<T, R> {
    fn clone(&self) -> Self {
        Self {
            meta: self.meta,
            port: self.port.clone(),
            cell: self.cell.clone(),
        }
    }
}

impl<T: Cell, const R: usize> PartitionRef<T, R> {
    pub fn id(&self) -> PartitionId {
        self.meta.id
    }

    pub fn offset(&self) -> Offset<R> {
        self.meta.offset
    }

    pub fn shape(&self) -> Shape<R> {
        self.meta.shape
    }

    pub fn meta(&self) -> PartitionMeta<R> {
        self.meta
    }

    /// The partition's region in array-global coordinates.
    pub fn global_region(&self) -> Region<R> {
        Region::new(self.meta.offset, self.meta.shape)
    }

    /// True if this ref holds the direct in-process path.
    pub fn is_local(&self) -> bool {
        self.cell.is_some()
    }

    /// Read the whole block.
    pub async fn read(&self, caller: &Caller) -> Result<Block<T, R>, PartitionError> {
        if let Some(cell) = &self.cell {
            return Ok(cell.read().await.data.clone());
        }
        let values = caller
            .call(&self.port, |reply| PartitionRequest::Read { reply })
            .await?;
        Block::new(self.meta.shape, values)
    }

    /// Read a window, in partition-local coordinates.
    pub async fn read_region(
        &self,
        caller: &Caller,
        region: Region<R>,
    ) -> Result<Vec<T>, PartitionError> {
        if let Some(cell) = &self.cell {
            return Ok(cell.read().await.data.region(&region)?);
        }
        caller
            .call(&self.port, |reply| PartitionRequest::ReadRegion {
                region,
                reply,
            })
            .await?
            .map_err(PartitionError::Rejected)
    }

    /// Overwrite a window, in partition-local coordinates.
    pub async fn write_region(
        &self,
        caller: &Caller,
        region: Region<R>,
        values: Vec<T>,
    ) -> Result<(), PartitionError> {
        if let Some(cell) = &self.cell {
            return cell.write().await.data.write_region(&region, &values);
        }
        caller
            .call(&self.port, |reply| PartitionRequest::WriteRegion {
                region,
                values,
                reply,
            })
            .await?
            .map_err(PartitionError::Rejected)
    }

    /// Set every cell to `value`.
    pub async fn fill(&self, caller: &Caller, value: T) -> Result<(), PartitionError> {
        if let Some(cell) = &self.cell {
            cell.write().await.data.fill(value);
            return Ok(());
        }
        caller
            .call(&self.port, |reply| PartitionRequest::Fill { value, reply })
            .await?;
        Ok(())
    }

    /// Fetch placement from the serving side. [`Self::meta`] is the
    /// cached form; this one proves the partition is still being
    /// served.
    pub async fn fetch_meta(&self, caller: &Caller) -> Result<PartitionMeta<R>, PartitionError> {
        if let Some(cell) = &self.cell {
            return Ok(cell.read().await.meta());
        }
        Ok(caller
            .call(&self.port, |reply| PartitionRequest::Meta { reply })
            .await?)
    }

    /// Direct access to the partition state. Present only on the
    /// owning locality.
    pub fn local_cell(&self) -> Option<&Arc<RwLock<Partition<T, R>>>> {
        self.cell.as_ref()
    }

    /// Strip the in-process path, forcing the wire protocol. Tests use
    /// this to exercise the remote paths without a second process.
    pub fn remote_only(&self) -> Self {
        Self {
            meta: self.meta,
            port: self.port.clone(),
            cell: None,
        }
    }
}
