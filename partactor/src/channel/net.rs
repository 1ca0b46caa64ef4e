/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! TCP channel implementation.
//!
//! Every message is carried in one frame: an 8-byte big-endian length
//! prefix followed by the bincode-serialized message body. Frames
//! larger than the configured maximum length poison the connection.
//! EOF on a frame boundary is a clean close; EOF mid-frame is an
//! error. There is no acknowledgment protocol: a delivery failure
//! flips the transmitter's status to `Closed` and hands queued
//! messages back to their return channels, and the enclosing
//! operation fails.

use std::io;

use bytes::Bytes;
use bytes::BytesMut;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::BufWriter;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::*;
use crate::config;

/// Size of the receive queue between connection readers and the
/// `NetRx` handed to the caller.
const RX_BUFFER_SIZE: usize = 1024;

/// Read one length-prefixed frame. `Ok(None)` denotes a clean close
/// (EOF on the frame boundary).
async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_length: usize,
) -> Result<Option<Bytes>, ChannelError> {
    let mut len_buf = [0u8; 8];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => (),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u64::from_be_bytes(len_buf) as usize;
    if len > max_frame_length {
        return Err(ChannelError::FrameTooLarge {
            len,
            max: max_frame_length,
        });
    }

    let mut body = BytesMut::with_capacity(len);
    let mut limited = (&mut *reader).take(len as u64);
    while body.len() < len {
        if limited.read_buf(&mut body).await? == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
    }
    Ok(Some(body.freeze()))
}

/// Write one length-prefixed frame and flush it.
async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<(), ChannelError> {
    writer.write_u64(body.len() as u64).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

#[derive(Debug)]
pub(crate) struct NetTx<M: RemoteMessage> {
    addr: ChannelAddr,
    queue: mpsc::UnboundedSender<(M, oneshot::Sender<M>)>,
    status: watch::Receiver<TxStatus>,
}

#[async_trait]
impl<M: RemoteMessage> Tx<M> for NetTx<M> {
    fn try_post(&self, message: M, return_channel: oneshot::Sender<M>) -> Result<(), SendError<M>> {
        self.queue
            .send((message, return_channel))
            .map_err(|mpsc::error::SendError((message, _))| {
                SendError(ChannelError::Closed, message)
            })
    }

    fn addr(&self) -> ChannelAddr {
        self.addr
    }

    fn status(&self) -> &watch::Receiver<TxStatus> {
        &self.status
    }
}

/// The sending side of a connection: drains the queue, one frame per
/// message. On connection failure, flips the status and hands every
/// queued message back.
async fn run_tx<M: RemoteMessage>(
    addr: core::net::SocketAddr,
    mut queue: mpsc::UnboundedReceiver<(M, oneshot::Sender<M>)>,
    status: watch::Sender<TxStatus>,
) {
    let failed: ChannelError = match TcpStream::connect(addr).await {
        Ok(stream) => {
            let _ = stream.set_nodelay(true);
            let mut writer = BufWriter::new(stream);
            loop {
                let Some((message, return_channel)) = queue.recv().await else {
                    // Tx dropped; connection closes with it.
                    return;
                };
                let body = match bincode::serialize(&message) {
                    Ok(body) => body,
                    Err(err) => {
                        // Per-message failure: hand it back, keep the
                        // connection.
                        tracing::warn!("tcp:{}: failed to serialize message: {}", addr, err);
                        let _ = return_channel.send(message);
                        continue;
                    }
                };
                if let Err(err) = write_frame(&mut writer, &body).await {
                    let _ = return_channel.send(message);
                    break err;
                }
            }
        }
        Err(err) => err.into(),
    };

    tracing::debug!("tcp:{}: connection failed: {}", addr, failed);
    let _ = status.send(TxStatus::Closed);
    // Hand queued messages back to their senders.
    queue.close();
    while let Ok((message, return_channel)) = queue.try_recv() {
        let _ = return_channel.send(message);
    }
}

#[derive(Debug)]
pub(crate) struct NetRx<M: RemoteMessage> {
    addr: ChannelAddr,
    rx: mpsc::Receiver<M>,
    _server: ServerHandle,
}

/// Aborts the accept loop when the `NetRx` is dropped; connection
/// readers exit on their own once the receive queue closes.
#[derive(Debug)]
struct ServerHandle(JoinHandle<()>);

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[async_trait]
impl<M: RemoteMessage> Rx<M> for NetRx<M> {
    async fn recv(&mut self) -> Result<M, ChannelError> {
        self.rx.recv().await.ok_or(ChannelError::Closed)
    }

    fn addr(&self) -> ChannelAddr {
        self.addr
    }
}

/// One task per accepted connection: read frames, deserialize, and
/// forward to the server's receive queue.
async fn serve_conn<M: RemoteMessage>(stream: TcpStream, messages: mpsc::Sender<M>) {
    let _ = stream.set_nodelay(true);
    let max_frame_length = config::global().codec_max_frame_length;
    let mut reader = BufReader::new(stream);
    loop {
        match read_frame(&mut reader, max_frame_length).await {
            Ok(Some(body)) => match bincode::deserialize::<M>(&body) {
                Ok(message) => {
                    if messages.send(message).await.is_err() {
                        // Rx dropped.
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!("failed to deserialize message: {}", err);
                    break;
                }
            },
            Ok(None) => break,
            Err(err) => {
                tracing::warn!("connection error: {}", err);
                break;
            }
        }
    }
}

pub(crate) mod tcp {
    use super::*;

    /// Dial `addr`, returning the transmit end. The connection is
    /// established (and re-queued messages failed) in the background.
    pub fn dial<M: RemoteMessage>(addr: core::net::SocketAddr) -> NetTx<M> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(TxStatus::Active);
        tokio::spawn(run_tx::<M>(addr, queue_rx, status_tx));
        NetTx {
            addr: ChannelAddr::Tcp(addr),
            queue: queue_tx,
            status: status_rx,
        }
    }

    /// Serve on `addr` (port 0 binds any available port), returning
    /// the bound address and the receive end.
    pub fn serve<M: RemoteMessage>(
        addr: core::net::SocketAddr,
    ) -> Result<(ChannelAddr, NetRx<M>), ChannelError> {
        // Bind a std listener so this function need not await; the
        // caller gets a usable address synchronously.
        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        let bound = listener.local_addr()?;

        let (msg_tx, msg_rx) = mpsc::channel(RX_BUFFER_SIZE);
        let server = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::debug!("tcp:{}: accepted connection from {}", bound, peer);
                        tokio::spawn(serve_conn::<M>(stream, msg_tx.clone()));
                    }
                    Err(err) => {
                        tracing::warn!("tcp:{}: accept failed: {}", bound, err);
                        break;
                    }
                }
            }
        });

        Ok((
            ChannelAddr::Tcp(bound),
            NetRx {
                addr: ChannelAddr::Tcp(bound),
                rx: msg_rx,
                _server: ServerHandle(server),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::channel::Rx;
    use crate::channel::Tx;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (client, server) = tokio::io::duplex(64);
        let (mut reader, _keep) = tokio::io::split(server);
        let (_, mut writer) = tokio::io::split(client);

        write_frame(&mut writer, b"flow").await.unwrap();
        let frame = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(&frame[..], b"flow");
    }

    #[tokio::test]
    async fn test_frame_too_large() {
        let (client, server) = tokio::io::duplex(64);
        let (mut reader, _keep) = tokio::io::split(server);
        let (_, mut writer) = tokio::io::split(client);

        write_frame(&mut writer, &[0u8; 32]).await.unwrap();
        assert_matches!(
            read_frame(&mut reader, 16).await,
            Err(ChannelError::FrameTooLarge { len: 32, max: 16 })
        );
    }

    #[tokio::test]
    async fn test_clean_close() {
        let (client, server) = tokio::io::duplex(64);
        let (mut reader, _keep) = tokio::io::split(server);
        drop(client);
        assert_matches!(read_frame(&mut reader, 1024).await, Ok(None));
    }

    #[tokio::test]
    async fn test_tx_fails_to_unreachable_peer() {
        // Bind a listener to reserve a port, then drop it so nothing
        // is listening there.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let tx = tcp::dial::<u64>(addr);
        let result = tx.send(7).await;
        assert_matches!(result, Err(SendError(ChannelError::Closed, 7)));

        let mut status = tx.status().clone();
        status.wait_for(|s| *s == TxStatus::Closed).await.unwrap();
    }

    #[tokio::test]
    async fn test_many_frames() {
        let (addr, mut rx) = tcp::serve::<u64>("127.0.0.1:0".parse().unwrap()).unwrap();
        let ChannelAddr::Tcp(socket_addr) = addr else {
            panic!()
        };
        let tx = tcp::dial::<u64>(socket_addr);
        for i in 0..100u64 {
            tx.post(i);
        }
        for i in 0..100u64 {
            assert_eq!(rx.recv().await.unwrap(), i);
        }
    }
}
