/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! One-way, typed communication channels. These carry messages between
//! localities, in-process (`local`) or across processes (`tcp`).
//! Messages round-trip through bincode on every transport, so local
//! and remote channels are behaviorally identical.

use core::net::SocketAddr;
use std::fmt;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::str::FromStr;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::sync::watch;

use crate::RemoteMessage;

pub(crate) mod local;
pub(crate) mod net;

/// The type of error that can occur on channel operations.
#[derive(thiserror::Error, Debug)]
pub enum ChannelError {
    /// An operation was attempted on a closed channel.
    #[error("channel closed")]
    Closed,

    /// The address was not valid.
    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    /// A bincode serialization or deserialization error occurred.
    #[error(transparent)]
    Bincode(#[from] Box<bincode::ErrorKind>),

    /// An I/O error on the underlying connection or listener.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A frame exceeded the configured maximum length.
    #[error("frame of {len} bytes exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// Some other error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// An error that occurred during send. Returns the message that failed
/// to send.
#[derive(thiserror::Error, Debug)]
#[error("{0}")]
pub struct SendError<M: RemoteMessage>(#[source] pub ChannelError, pub M);

impl<M: RemoteMessage> From<SendError<M>> for ChannelError {
    fn from(error: SendError<M>) -> Self {
        error.0
    }
}

/// The possible states of a `Tx`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum TxStatus {
    /// The tx is good.
    Active,
    /// The tx cannot be used for message delivery.
    Closed,
}

/// The transmit end of an M-typed channel.
#[async_trait]
pub trait Tx<M: RemoteMessage>: fmt::Debug {
    /// Enqueue `message` on the local end of the channel. The message
    /// is either delivered, or eventually handed back on
    /// `return_channel` once the channel is discovered to have failed.
    fn try_post(&self, message: M, return_channel: oneshot::Sender<M>) -> Result<(), SendError<M>>;

    /// Enqueue a message to be sent on the channel. The caller is
    /// expected to monitor the channel status for failures.
    fn post(&self, message: M) {
        let _ignore = self.try_post(message, oneshot::channel().0);
    }

    /// Send a message, returning when the message has been handed to
    /// the transport.
    async fn send(&self, message: M) -> Result<(), SendError<M>> {
        let (tx, rx) = oneshot::channel();
        self.try_post(message, tx)?;
        match rx.await {
            // The transport handed the message back; it was not delivered.
            Ok(message) => Err(SendError(ChannelError::Closed, message)),
            // The return channel was dropped: the message was passed on.
            Err(_) => Ok(()),
        }
    }

    /// The channel address to which this Tx is sending.
    fn addr(&self) -> ChannelAddr;

    /// A means to monitor the health of a `Tx`.
    fn status(&self) -> &watch::Receiver<TxStatus>;
}

/// The receive end of an M-typed channel.
#[async_trait]
pub trait Rx<M: RemoteMessage>: fmt::Debug {
    /// Receive the next message from the channel. If the channel
    /// returns an error it is considered broken and should be
    /// discarded.
    async fn recv(&mut self) -> Result<M, ChannelError>;

    /// The channel address from which this Rx is receiving.
    fn addr(&self) -> ChannelAddr;
}

/// Types of channel transports.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelTransport {
    /// Transport over a TCP connection.
    Tcp,

    /// Local transport uses an in-process registry and mpsc channels.
    Local,
}

impl ChannelTransport {
    /// All known channel transports.
    pub fn all() -> [ChannelTransport; 2] {
        [ChannelTransport::Tcp, ChannelTransport::Local]
    }

    /// Return an "any" address for this transport.
    pub fn any(&self) -> ChannelAddr {
        ChannelAddr::any(*self)
    }

    /// True if this transport crosses process boundaries.
    pub fn is_remote(&self) -> bool {
        match self {
            ChannelTransport::Tcp => true,
            ChannelTransport::Local => false,
        }
    }
}

impl fmt::Display for ChannelTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Local => write!(f, "local"),
        }
    }
}

impl FromStr for ChannelTransport {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(ChannelTransport::Tcp),
            "local" => Ok(ChannelTransport::Local),
            unknown => Err(anyhow::anyhow!("unknown channel transport: {}", unknown)),
        }
    }
}

/// The type of a channel address, used to multiplex the underlying
/// channel implementations. ChannelAddrs have a concrete syntax: the
/// address type, followed by ":", and an address parseable to that
/// type. For example:
///
/// - `tcp:127.0.0.1:1234` - localhost port 1234 over TCP
/// - `local:123` - the (in-process) local port 123
///
/// Both local and TCP ports 0 are reserved to indicate "any available
/// port" when serving.
///
/// ```
/// # use partactor::channel::ChannelAddr;
/// let addr: ChannelAddr = "tcp:127.0.0.1:1234".parse().unwrap();
/// let ChannelAddr::Tcp(socket_addr) = addr else {
///     panic!()
/// };
/// assert_eq!(socket_addr.port(), 1234);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, Ord, PartialOrd, Serialize, Deserialize, Hash)]
pub enum ChannelAddr {
    /// A socket address used to establish TCP channels. Supports both
    /// IPv4 and IPv6 address / port pairs.
    Tcp(SocketAddr),

    /// Local addresses are registered in-process and given an integral
    /// index.
    Local(u64),
}

impl ChannelAddr {
    /// The "any" address for the given transport type, used by servers
    /// to bind to any available port.
    pub fn any(transport: ChannelTransport) -> Self {
        match transport {
            ChannelTransport::Tcp => {
                Self::Tcp(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
            }
            ChannelTransport::Local => Self::Local(0),
        }
    }

    /// The transport used by this address.
    pub fn transport(&self) -> ChannelTransport {
        match self {
            Self::Tcp(_) => ChannelTransport::Tcp,
            Self::Local(_) => ChannelTransport::Local,
        }
    }
}

impl From<SocketAddr> for ChannelAddr {
    fn from(value: SocketAddr) -> Self {
        Self::Tcp(value)
    }
}

impl fmt::Display for ChannelAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp:{}", addr),
            Self::Local(index) => write!(f, "local:{}", index),
        }
    }
}

impl FromStr for ChannelAddr {
    type Err = anyhow::Error;

    fn from_str(addr: &str) -> Result<Self, Self::Err> {
        match addr.split_once(':') {
            Some(("local", rest)) => rest
                .parse::<u64>()
                .map(Self::Local)
                .map_err(anyhow::Error::from),
            Some(("tcp", rest)) => rest
                .parse::<SocketAddr>()
                .map(Self::Tcp)
                .map_err(anyhow::Error::from),
            Some((r#type, _)) => Err(anyhow::anyhow!("no such channel type: {type}")),
            None => Err(anyhow::anyhow!("no channel type specified")),
        }
    }
}

/// Universal channel transmitter.
#[derive(Debug)]
pub struct ChannelTx<M: RemoteMessage> {
    inner: ChannelTxKind<M>,
}

#[derive(Debug)]
enum ChannelTxKind<M: RemoteMessage> {
    Local(local::LocalTx<M>),
    Tcp(net::NetTx<M>),
}

#[async_trait]
impl<M: RemoteMessage> Tx<M> for ChannelTx<M> {
    fn try_post(&self, message: M, return_channel: oneshot::Sender<M>) -> Result<(), SendError<M>> {
        match &self.inner {
            ChannelTxKind::Local(tx) => tx.try_post(message, return_channel),
            ChannelTxKind::Tcp(tx) => tx.try_post(message, return_channel),
        }
    }

    fn addr(&self) -> ChannelAddr {
        match &self.inner {
            ChannelTxKind::Local(tx) => tx.addr(),
            ChannelTxKind::Tcp(tx) => tx.addr(),
        }
    }

    fn status(&self) -> &watch::Receiver<TxStatus> {
        match &self.inner {
            ChannelTxKind::Local(tx) => tx.status(),
            ChannelTxKind::Tcp(tx) => tx.status(),
        }
    }
}

/// Universal channel receiver.
#[derive(Debug)]
pub struct ChannelRx<M: RemoteMessage> {
    inner: ChannelRxKind<M>,
}

#[derive(Debug)]
enum ChannelRxKind<M: RemoteMessage> {
    Local(local::LocalRx<M>),
    Tcp(net::NetRx<M>),
}

#[async_trait]
impl<M: RemoteMessage> Rx<M> for ChannelRx<M> {
    async fn recv(&mut self) -> Result<M, ChannelError> {
        match &mut self.inner {
            ChannelRxKind::Local(rx) => rx.recv().await,
            ChannelRxKind::Tcp(rx) => rx.recv().await,
        }
    }

    fn addr(&self) -> ChannelAddr {
        match &self.inner {
            ChannelRxKind::Local(rx) => rx.addr(),
            ChannelRxKind::Tcp(rx) => rx.addr(),
        }
    }
}

/// Dial the provided address, returning the corresponding Tx, or an
/// error if the channel cannot be established. The underlying
/// connection is dropped whenever the returned Tx is dropped.
pub fn dial<M: RemoteMessage>(addr: ChannelAddr) -> Result<ChannelTx<M>, ChannelError> {
    tracing::debug!(name = "dial", "dialing channel {}", addr);
    let inner = match addr {
        ChannelAddr::Local(port) => ChannelTxKind::Local(local::dial(port)?),
        ChannelAddr::Tcp(addr) => ChannelTxKind::Tcp(net::tcp::dial(addr)),
    };
    Ok(ChannelTx { inner })
}

/// Serve on the provided channel address. The server is torn down when
/// the returned Rx is dropped.
pub fn serve<M: RemoteMessage>(
    addr: ChannelAddr,
) -> Result<(ChannelAddr, ChannelRx<M>), ChannelError> {
    tracing::debug!(name = "serve", "serving channel address {}", addr);
    match addr {
        ChannelAddr::Tcp(addr) => {
            let (addr, rx) = net::tcp::serve::<M>(addr)?;
            Ok((addr, ChannelRxKind::Tcp(rx)))
        }
        ChannelAddr::Local(0) => {
            let (port, rx) = local::serve::<M>();
            Ok((ChannelAddr::Local(port), ChannelRxKind::Local(rx)))
        }
        ChannelAddr::Local(port) => Err(ChannelError::InvalidAddress(format!(
            "invalid local addr: {}",
            port
        ))),
    }
    .map(|(addr, inner)| (addr, ChannelRx { inner }))
}

/// Serve on a fresh local address. The server is torn down when the
/// returned Rx is dropped.
pub fn serve_local<M: RemoteMessage>() -> (ChannelAddr, ChannelRx<M>) {
    let (port, rx) = local::serve::<M>();
    (
        ChannelAddr::Local(port),
        ChannelRx {
            inner: ChannelRxKind::Local(rx),
        },
    )
}
