// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Datagram and stream transports.
//!
//! Every handle gets one reader task that pushes [`RelayEvent`]s into the
//! dispatcher channel, so the dispatcher stays the only owner of relay state.
//! Sends are issued by the dispatcher and never wait: datagrams use
//! `try_send_to`, stream packets go through a bounded queue drained by a
//! writer task.
//!
//! Relay-to-relay links frame each ACSP packet with its length, because TCP
//! does not keep packet boundaries:
//! ```text
//! +----------------+------------------+
//! | Length (2B BE) | ACSP packet      |
//! +----------------+------------------+
//! ```

use super::peer::PeerId;
use super::protocol::MAX_PACKET_SIZE;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Outbound packets queued per stream before new ones are dropped.
const STREAM_QUEUE_DEPTH: usize = 256;

/// Transport flavour; decides how read failures are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// UDP: no connection, read errors are transient.
    Datagram,
    /// TCP: end of stream means the other side is gone.
    Stream,
}

/// Send side of a connection, as seen by the dispatcher.
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Queue or send one packet without blocking.
    fn send(&self, packet: &[u8]) -> io::Result<()>;

    /// Remote endpoint, for logs.
    fn endpoint(&self) -> String;
}

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Upstream,
    Peer(PeerId),
}

/// Events delivered to the dispatcher.
#[derive(Debug)]
pub enum RelayEvent {
    /// One packet read from a handle.
    Packet { source: Source, data: Vec<u8> },
    /// A stream handle reached end of stream or failed.
    Closed { source: Source, reason: String },
    /// The downstream listener accepted a relay.
    Accepted { stream: TcpStream, addr: SocketAddr },
}

/// Transport error types.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("timed out connecting to {addr} after {timeout:?}")]
    ConnectTimeout { addr: SocketAddr, timeout: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid frame length {0}")]
    FrameLength(usize),
}

/// UDP endpoint talking to a single remote.
///
/// Replies go to the configured remote until a datagram arrives from
/// somewhere else; from then on they follow the last sender.
#[derive(Clone)]
pub struct DatagramTransport {
    socket: Arc<UdpSocket>,
    remote: Arc<Mutex<Option<SocketAddr>>>,
}

impl DatagramTransport {
    /// Bind a local UDP port.
    pub async fn bind(local: SocketAddr, remote: Option<SocketAddr>) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| TransportError::Bind {
                addr: local,
                source,
            })?;

        Ok(Self {
            socket: Arc::new(socket),
            remote: Arc::new(Mutex::new(remote)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Current send target.
    pub fn remote(&self) -> Option<SocketAddr> {
        *lock(&self.remote)
    }

    /// Spawn the reader task. Read errors and empty datagrams are ignored;
    /// the task ends only when the dispatcher goes away.
    pub fn spawn_reader(&self, source: Source, events: mpsc::Sender<RelayEvent>) -> JoinHandle<()> {
        let socket = self.socket.clone();
        let remote = self.remote.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((0, _)) => continue,
                    Ok((len, from)) => {
                        {
                            let mut target = lock(&remote);
                            if *target != Some(from) {
                                debug!("{:?}: replies now go to {}", source, from);
                                *target = Some(from);
                            }
                        }
                        let event = RelayEvent::Packet {
                            source,
                            data: buf[..len].to_vec(),
                        };
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        trace!("{:?}: ignoring UDP read error: {}", source, e);
                        tokio::task::yield_now().await;
                    }
                }
            }
        })
    }
}

impl Transport for DatagramTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    fn send(&self, packet: &[u8]) -> io::Result<()> {
        let target = self.remote().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "no remote address known yet")
        })?;
        self.socket.try_send_to(packet, target).map(|_| ())
    }

    fn endpoint(&self) -> String {
        match self.remote() {
            Some(addr) => addr.to_string(),
            None => "(unknown)".to_string(),
        }
    }
}

/// TCP link to another relay.
pub struct StreamTransport {
    outbound: mpsc::Sender<Vec<u8>>,
    peer_addr: SocketAddr,
}

impl StreamTransport {
    /// Split `stream` into a reader task feeding `events` and a writer task
    /// draining the outbound queue. Dropping the transport closes the
    /// write side.
    pub fn spawn(
        stream: TcpStream,
        peer_addr: SocketAddr,
        source: Source,
        events: mpsc::Sender<RelayEvent>,
    ) -> (Self, JoinHandle<()>) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("{}: could not disable Nagle: {}", peer_addr, e);
        }

        let (mut reader, mut writer) = stream.into_split();
        let (outbound, mut outbound_rx) = mpsc::channel::<Vec<u8>>(STREAM_QUEUE_DEPTH);

        tokio::spawn(async move {
            while let Some(packet) = outbound_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &packet).await {
                    debug!("{}: write failed: {}", peer_addr, e);
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let reader_task = tokio::spawn(async move {
            let mut buf = Vec::with_capacity(MAX_PACKET_SIZE);
            let reason = loop {
                match read_frame(&mut reader, &mut buf).await {
                    Ok(true) => {
                        let event = RelayEvent::Packet {
                            source,
                            data: buf.clone(),
                        };
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                    Ok(false) => break "end of stream".to_string(),
                    Err(e) => break e.to_string(),
                }
            };
            let _ = events.send(RelayEvent::Closed { source, reason }).await;
        });

        (
            Self {
                outbound,
                peer_addr,
            },
            reader_task,
        )
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl Transport for StreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn send(&self, packet: &[u8]) -> io::Result<()> {
        self.outbound.try_send(packet.to_vec()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                io::Error::new(io::ErrorKind::WouldBlock, "outbound queue full")
            }
            mpsc::error::TrySendError::Closed(_) => {
                io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")
            }
        })
    }

    fn endpoint(&self) -> String {
        self.peer_addr.to_string()
    }
}

/// Connect to an upstream relay, giving up after `timeout`.
pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, TransportError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(TransportError::Connect { addr, source }),
        Err(_) => Err(TransportError::ConnectTimeout { addr, timeout }),
    }
}

/// Read one frame into `buf`.
///
/// Returns `Ok(false)` if the stream closed cleanly before a new frame.
pub async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<bool, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
        Err(e) => return Err(e.into()),
    }

    let len = usize::from(u16::from_be_bytes(len_buf));
    if len == 0 || len > MAX_PACKET_SIZE {
        return Err(TransportError::FrameLength(len));
    }

    buf.clear();
    buf.resize(len, 0);
    reader.read_exact(buf).await?;
    Ok(true)
}

/// Write one frame.
pub async fn write_frame<W>(writer: &mut W, packet: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let len = u16::try_from(packet.len())
        .ok()
        .filter(|len| *len != 0 && usize::from(*len) <= MAX_PACKET_SIZE)
        .ok_or(TransportError::FrameLength(packet.len()))?;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(packet).await?;
    writer.flush().await?;
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory transport recording everything sent through it.
#[cfg(test)]
pub(crate) struct MemoryTransport {
    kind: TransportKind,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[cfg(test)]
impl MemoryTransport {
    pub(crate) fn new(kind: TransportKind) -> (Self, Arc<Mutex<Vec<Vec<u8>>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                kind,
                sent: sent.clone(),
            },
            sent,
        )
    }
}

#[cfg(test)]
impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn send(&self, packet: &[u8]) -> io::Result<()> {
        lock(&self.sent).push(packet.to_vec());
        Ok(())
    }

    fn endpoint(&self) -> String {
        "memory".to_string()
    }
}
