/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Mailboxes multiplex typed message ports over a single served
//! channel address, one per locality.
//!
//! A [`Mailbox`] owns a table of open ports. Local holders of a
//! [`PortHandle`] send directly; a port bound with
//! [`PortHandle::bind`] yields a serializable [`PortRef`] that any
//! process can post to through a [`Dialer`]. Once-ports provide the
//! reply side of request/response exchanges: they deliver exactly one
//! message and then free themselves.
//!
//! Delivery to a port that no longer exists is logged and dropped;
//! senders that require a response observe the failure through their
//! reply port, and the enclosing operation fails.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::Data;
use crate::RemoteMessage;
use crate::channel;
use crate::channel::ChannelAddr;
use crate::channel::ChannelError;
use crate::channel::ChannelTx;
use crate::channel::Rx;
use crate::channel::SendError;
use crate::channel::Tx;
use crate::channel::TxStatus;
use crate::reference::LocalityId;

/// The type of error for mailbox operations.
#[derive(thiserror::Error, Debug)]
pub enum MailboxError {
    /// The port (or its mailbox) is gone.
    #[error("port closed")]
    Closed,

    /// A message could not be serialized or deserialized.
    #[error(transparent)]
    Serialize(#[from] Box<bincode::ErrorKind>),

    /// The underlying channel failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// The unit of transport between mailboxes: a destination port index
/// plus the serialized message bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// The destination port on the receiving mailbox.
    pub port: u64,
    /// The bincode-serialized message.
    pub data: Data,
}

/// A typed sink for serialized messages, installed in the mailbox's
/// port table by `bind`.
trait PortSink: Send + Sync {
    /// Deliver one serialized message.
    fn deliver(&self, data: Data) -> Result<(), String>;

    /// True if the port accepts exactly one message and should be
    /// freed after delivery.
    fn once(&self) -> bool;
}

struct MpscSink<M: RemoteMessage> {
    sender: mpsc::UnboundedSender<M>,
}

impl<M: RemoteMessage> PortSink for MpscSink<M> {
    fn deliver(&self, data: Data) -> Result<(), String> {
        let message: M = bincode::deserialize(&data).map_err(|err| err.to_string())?;
        self.sender
            .send(message)
            .map_err(|_| "receiver dropped".to_string())
    }

    fn once(&self) -> bool {
        false
    }
}

struct OnceSink<M: RemoteMessage> {
    sender: Mutex<Option<oneshot::Sender<M>>>,
}

impl<M: RemoteMessage> PortSink for OnceSink<M> {
    fn deliver(&self, data: Data) -> Result<(), String> {
        let message: M = bincode::deserialize(&data).map_err(|err| err.to_string())?;
        let sender = self
            .sender
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| "once port already delivered".to_string())?;
        sender.send(message).map_err(|_| "receiver dropped".to_string())
    }

    fn once(&self) -> bool {
        true
    }
}

struct State {
    locality: LocalityId,
    addr: ChannelAddr,
    ports: DashMap<u64, Box<dyn PortSink>>,
    next_port: AtomicU64,
}

/// A mailbox: the set of open ports of one locality, served on one
/// channel address. Cheap to clone.
#[derive(Clone)]
pub struct Mailbox {
    inner: Arc<State>,
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("locality", &self.inner.locality)
            .field("addr", &self.inner.addr)
            .finish()
    }
}

/// Stops the mailbox's serving loop when dropped.
#[derive(Debug)]
pub struct MailboxServerHandle {
    join: JoinHandle<()>,
}

impl MailboxServerHandle {
    /// Stop serving. In-flight envelopes may be dropped.
    pub fn stop(&self) {
        self.join.abort();
    }
}

impl Drop for MailboxServerHandle {
    fn drop(&mut self) {
        self.join.abort();
    }
}

impl Mailbox {
    /// Serve a new mailbox for `locality` on `addr` (or any address of
    /// its transport, for port 0). The serving loop runs until the
    /// returned handle is dropped.
    pub fn serve(
        locality: LocalityId,
        addr: ChannelAddr,
    ) -> Result<(Mailbox, MailboxServerHandle), ChannelError> {
        let (bound, mut rx) = channel::serve::<Envelope>(addr)?;
        let mailbox = Mailbox {
            inner: Arc::new(State {
                locality,
                addr: bound,
                ports: DashMap::new(),
                next_port: AtomicU64::new(1),
            }),
        };
        let served = mailbox.clone();
        let join = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => served.deliver(envelope),
                    Err(err) => {
                        tracing::debug!("{}: mailbox serving loop exits: {}", served.addr(), err);
                        break;
                    }
                }
            }
        });
        Ok((mailbox, MailboxServerHandle { join }))
    }

    /// The locality this mailbox belongs to.
    pub fn locality(&self) -> LocalityId {
        self.inner.locality
    }

    /// The address the mailbox serves on.
    pub fn addr(&self) -> ChannelAddr {
        self.inner.addr
    }

    /// Open a new port that accepts M-typed messages. The returned
    /// handle may be freely cloned and passed around locally; bind it
    /// to obtain a reference that travels across the network. The
    /// receiver should be retained only by the task responsible for
    /// processing the messages.
    pub fn open_port<M: RemoteMessage>(&self) -> (PortHandle<M>, PortReceiver<M>) {
        let port_index = self.allocate_port();
        let (sender, receiver) = mpsc::unbounded_channel::<M>();
        tracing::trace!(
            name = "open_port",
            "opening port {} at {}",
            port_index,
            self.inner.addr
        );
        (
            PortHandle {
                mailbox: self.clone(),
                port_index,
                sender,
            },
            PortReceiver {
                receiver,
                port_index,
                mailbox: self.clone(),
            },
        )
    }

    /// Open a port that accepts exactly one M-typed message: the reply
    /// half of a request/response exchange.
    pub fn open_once_port<M: RemoteMessage>(&self) -> (OncePortHandle<M>, OncePortReceiver<M>) {
        let port_index = self.allocate_port();
        let (sender, receiver) = oneshot::channel::<M>();
        (
            OncePortHandle {
                mailbox: self.clone(),
                port_index,
                sender,
            },
            OncePortReceiver {
                receiver: Some(receiver),
                port_index,
                mailbox: self.clone(),
            },
        )
    }

    fn allocate_port(&self) -> u64 {
        self.inner.next_port.fetch_add(1, Ordering::Relaxed)
    }

    fn deliver(&self, envelope: Envelope) {
        let Some(sink) = self.inner.ports.get(&envelope.port) else {
            tracing::warn!(
                "{}: dropping message for unknown port {}",
                self.inner.addr,
                envelope.port
            );
            return;
        };
        let result = sink.deliver(envelope.data);
        let once = sink.once();
        drop(sink);
        match result {
            Ok(()) => {
                if once {
                    self.inner.ports.remove(&envelope.port);
                }
            }
            Err(reason) => {
                tracing::warn!(
                    "{}: failed to deliver to port {}: {}",
                    self.inner.addr,
                    envelope.port,
                    reason
                );
            }
        }
    }
}

/// A local handle to an open port. Messages sent through the handle
/// bypass serialization.
#[derive(Debug)]
pub struct PortHandle<M: RemoteMessage> {
    mailbox: Mailbox,
    port_index: u64,
    sender: mpsc::UnboundedSender<M>,
}

impl<M: RemoteMessage> Clone for PortHandle<M> {
    fn clone(&self) -> Self {
        Self {
            mailbox: self.mailbox.clone(),
            port_index: self.port_index,
            sender: self.sender.clone(),
        }
    }
}

impl<M: RemoteMessage> PortHandle<M> {
    /// Send a message to the port, in-process.
    pub fn send(&self, message: M) -> Result<(), MailboxError> {
        self.sender.send(message).map_err(|_| MailboxError::Closed)
    }

    /// Install the port in the mailbox's table and return a reference
    /// that can be serialized and posted to from anywhere.
    pub fn bind(&self) -> PortRef<M> {
        if let Entry::Vacant(entry) = self.mailbox.inner.ports.entry(self.port_index) {
            entry.insert(Box::new(MpscSink {
                sender: self.sender.clone(),
            }));
        }
        PortRef {
            addr: self.mailbox.addr(),
            port: self.port_index,
            _marker: PhantomData,
        }
    }
}

/// The receive end of an open port. Dropping the receiver unbinds the
/// port: subsequent deliveries are dropped.
#[derive(Debug)]
pub struct PortReceiver<M: RemoteMessage> {
    receiver: mpsc::UnboundedReceiver<M>,
    port_index: u64,
    mailbox: Mailbox,
}

impl<M: RemoteMessage> PortReceiver<M> {
    /// Receive the next message delivered to this port.
    pub async fn recv(&mut self) -> Result<M, MailboxError> {
        self.receiver.recv().await.ok_or(MailboxError::Closed)
    }
}

impl<M: RemoteMessage> Drop for PortReceiver<M> {
    fn drop(&mut self) {
        self.mailbox.inner.ports.remove(&self.port_index);
    }
}

/// A local handle to a once-port. Consumed by sending or binding.
#[derive(Debug)]
pub struct OncePortHandle<M: RemoteMessage> {
    mailbox: Mailbox,
    port_index: u64,
    sender: oneshot::Sender<M>,
}

impl<M: RemoteMessage> OncePortHandle<M> {
    /// Send the port's one message, in-process.
    pub fn send(self, message: M) -> Result<(), MailboxError> {
        self.sender.send(message).map_err(|_| MailboxError::Closed)
    }

    /// Install the port in the mailbox's table and return a reference
    /// that can be serialized and posted to exactly once.
    pub fn bind(self) -> OncePortRef<M> {
        let port_ref = OncePortRef {
            addr: self.mailbox.addr(),
            port: self.port_index,
            _marker: PhantomData,
        };
        self.mailbox.inner.ports.insert(
            self.port_index,
            Box::new(OnceSink {
                sender: Mutex::new(Some(self.sender)),
            }),
        );
        port_ref
    }
}

/// The receive end of a once-port. Consumed by receiving.
#[derive(Debug)]
pub struct OncePortReceiver<M: RemoteMessage> {
    receiver: Option<oneshot::Receiver<M>>,
    port_index: u64,
    mailbox: Mailbox,
}

impl<M: RemoteMessage> OncePortReceiver<M> {
    /// Receive the port's one message.
    pub async fn recv(mut self) -> Result<M, MailboxError> {
        match self.receiver.take() {
            Some(receiver) => receiver.await.map_err(|_| MailboxError::Closed),
            // recv consumes self; the receiver is always present.
            None => unreachable!(),
        }
    }
}

impl<M: RemoteMessage> Drop for OncePortReceiver<M> {
    fn drop(&mut self) {
        self.mailbox.inner.ports.remove(&self.port_index);
    }
}

/// A serializable reference to a bound port: the mailbox address plus
/// the port index.
#[derive(Debug, Serialize, Deserialize)]
pub struct PortRef<M: RemoteMessage> {
    addr: ChannelAddr,
    port: u64,
    #[serde(skip)]
    _marker: PhantomData<M>,
}

impl<M: RemoteMessage> PortRef<M> {
    /// The address of the mailbox serving the port.
    pub fn addr(&self) -> ChannelAddr {
        self.addr
    }
}

impl<M: RemoteMessage> Clone for PortRef<M> {
    fn clone(&self) -> Self {
        Self {
            addr: self.addr,
            port: self.port,
            _marker: PhantomData,
        }
    }
}

impl<M: RemoteMessage> PartialEq for PortRef<M> {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr && self.port == other.port
    }
}

impl<M: RemoteMessage> Eq for PortRef<M> {}

impl<M: RemoteMessage> std::fmt::Display for PortRef<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.addr, self.port)
    }
}

/// A serializable reference to a bound once-port.
#[derive(Debug, Serialize, Deserialize)]
pub struct OncePortRef<M: RemoteMessage> {
    addr: ChannelAddr,
    port: u64,
    #[serde(skip)]
    _marker: PhantomData<M>,
}

impl<M: RemoteMessage> Clone for OncePortRef<M> {
    fn clone(&self) -> Self {
        Self {
            addr: self.addr,
            port: self.port,
            _marker: PhantomData,
        }
    }
}

impl<M: RemoteMessage> std::fmt::Display for OncePortRef<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.addr, self.port)
    }
}

/// Posts messages to port references, caching one dialed channel per
/// destination address. Cheap to clone; a locality shares one dialer
/// across all of its tasks.
#[derive(Clone, Debug, Default)]
pub struct Dialer {
    txs: Arc<DashMap<ChannelAddr, Arc<ChannelTx<Envelope>>>>,
}

impl Dialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post `message` to the port referred to by `dest`.
    pub fn post<M: RemoteMessage>(&self, dest: &PortRef<M>, message: M) -> Result<(), MailboxError> {
        let data = bincode::serialize(&message)?;
        self.post_envelope(
            dest.addr,
            Envelope {
                port: dest.port,
                data,
            },
        )
    }

    /// Post the one message a once-port accepts, consuming the
    /// reference.
    pub fn post_once<M: RemoteMessage>(
        &self,
        dest: OncePortRef<M>,
        message: M,
    ) -> Result<(), MailboxError> {
        let data = bincode::serialize(&message)?;
        self.post_envelope(
            dest.addr,
            Envelope {
                port: dest.port,
                data,
            },
        )
    }

    fn post_envelope(&self, addr: ChannelAddr, envelope: Envelope) -> Result<(), MailboxError> {
        // A closed tx is stale (its server restarted or its connection
        // failed); drop it and re-dial.
        if let Some(tx) = self.txs.get(&addr) {
            if *tx.status().borrow() == TxStatus::Closed {
                drop(tx);
                self.txs.remove(&addr);
            }
        }
        let tx = match self.txs.entry(addr) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let tx = Arc::new(channel::dial::<Envelope>(addr)?);
                entry.insert(Arc::clone(&tx));
                tx
            }
        };
        tx.try_post(envelope, oneshot::channel().0)
            .map_err(|SendError(err, _)| MailboxError::Channel(err))
    }
}

/// The capability to issue requests and await replies: a mailbox to
/// open reply ports on, plus a dialer to post with. One per locality,
/// shared by all of its tasks.
#[derive(Clone, Debug)]
pub struct Caller {
    mailbox: Mailbox,
    dialer: Dialer,
}

impl Caller {
    pub fn new(mailbox: Mailbox, dialer: Dialer) -> Self {
        Self { mailbox, dialer }
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn dialer(&self) -> &Dialer {
        &self.dialer
    }

    /// Post the request built around a fresh reply port, then await
    /// the reply. The request is handed its bound reply reference.
    pub async fn call<M: RemoteMessage, Reply: RemoteMessage>(
        &self,
        dest: &PortRef<M>,
        request: impl FnOnce(OncePortRef<Reply>) -> M,
    ) -> Result<Reply, MailboxError> {
        let (handle, receiver) = self.mailbox.open_once_port::<Reply>();
        self.dialer.post(dest, request(handle.bind()))?;
        receiver.recv().await
    }
}
