/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Local (in-process) channel implementation.
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::LazyLock;
use std::sync::Mutex;

use tokio::sync::mpsc;

use super::*;
use crate::Data;

// In-process channels, with a shared registry. Messages round-trip
// through bincode so that a local channel behaves exactly like a
// remote one.

struct Ports {
    ports: HashMap<u64, (mpsc::UnboundedSender<Data>, watch::Receiver<TxStatus>)>,
    next_port: u64,
}

impl Ports {
    fn alloc(&mut self) -> (u64, mpsc::UnboundedReceiver<Data>, watch::Sender<TxStatus>) {
        let port = self.next_port;
        self.next_port += 1;
        let (tx, rx) = mpsc::unbounded_channel::<Data>();
        let (status_tx, status_rx) = watch::channel(TxStatus::Active);
        if self.ports.insert(port, (tx.clone(), status_rx)).is_some() {
            panic!("port reused")
        }
        (port, rx, status_tx)
    }

    fn free(&mut self, port: u64) {
        self.ports.remove(&port);
    }

    fn get(&self, port: u64) -> Option<&(mpsc::UnboundedSender<Data>, watch::Receiver<TxStatus>)> {
        self.ports.get(&port)
    }
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            ports: HashMap::new(),
            next_port: 1,
        }
    }
}

static PORTS: LazyLock<Mutex<Ports>> = LazyLock::new(|| Mutex::new(Ports::default()));

#[derive(Debug)]
pub(crate) struct LocalTx<M: RemoteMessage> {
    tx: mpsc::UnboundedSender<Data>,
    port: u64,
    status: watch::Receiver<TxStatus>,
    _phantom: PhantomData<M>,
}

#[async_trait]
impl<M: RemoteMessage> Tx<M> for LocalTx<M> {
    fn try_post(
        &self,
        message: M,
        _return_channel: oneshot::Sender<M>,
    ) -> Result<(), SendError<M>> {
        let data: Data = match bincode::serialize(&message) {
            Ok(data) => data,
            Err(err) => return Err(SendError(err.into(), message)),
        };
        // Enqueueing on the receiver's queue is delivery; the return
        // channel is dropped, which the default `send` reads as
        // success.
        self.tx
            .send(data)
            .map_err(|_| SendError(ChannelError::Closed, message))
    }

    fn addr(&self) -> ChannelAddr {
        ChannelAddr::Local(self.port)
    }

    fn status(&self) -> &watch::Receiver<TxStatus> {
        &self.status
    }
}

#[derive(Debug)]
pub(crate) struct LocalRx<M: RemoteMessage> {
    data_rx: mpsc::UnboundedReceiver<Data>,
    status_tx: watch::Sender<TxStatus>,
    port: u64,
    _phantom: PhantomData<M>,
}

#[async_trait]
impl<M: RemoteMessage> Rx<M> for LocalRx<M> {
    async fn recv(&mut self) -> Result<M, ChannelError> {
        let data = self.data_rx.recv().await.ok_or(ChannelError::Closed)?;
        bincode::deserialize(&data).map_err(ChannelError::from)
    }

    fn addr(&self) -> ChannelAddr {
        ChannelAddr::Local(self.port)
    }
}

impl<M: RemoteMessage> Drop for LocalRx<M> {
    fn drop(&mut self) {
        let _ = self.status_tx.send(TxStatus::Closed);
        PORTS.lock().unwrap().free(self.port);
    }
}

/// Dial a local port, returning a Tx for it.
pub(crate) fn dial<M: RemoteMessage>(port: u64) -> Result<LocalTx<M>, ChannelError> {
    let ports = PORTS.lock().unwrap();
    if let Some((data_tx, status_rx)) = ports.get(port) {
        Ok(LocalTx {
            tx: data_tx.clone(),
            port,
            status: status_rx.clone(),
            _phantom: PhantomData,
        })
    } else {
        Err(ChannelError::Closed)
    }
}

/// Serve a fresh local port. The server is shut down when the returned
/// Rx is dropped.
pub(crate) fn serve<M: RemoteMessage>() -> (u64, LocalRx<M>) {
    let (port, data_rx, status_tx) = PORTS.lock().unwrap().alloc();
    (
        port,
        LocalRx {
            data_rx,
            status_tx,
            port,
            _phantom: PhantomData,
        },
    )
}
