//! Transport channels underneath a layer stack.
//!
//! A [`TransportChannel`] moves raw bytes to and from the peer. The stack
//! only needs five operations from it:
//!
//! - **send**: write bytes (or one datagram) and flush before returning
//! - **fetch**: whatever is available, waiting up to the channel timeout
//! - **fetch exact**: exactly `n` bytes, or an error
//! - **close**
//! - **state**: a non-blocking check of the socket
//!
//! # Pushback
//!
//! Bytes read by a fetch that then fails are never lost. They are kept in
//! a pushback buffer and returned first by the next fetch:
//!
//! ```text
//! fetch_exact(8):  read 5 bytes ──▶ EOF ──▶ Err(Eof { expected: 8, available: 5 })
//!                        │
//!                        └──▶ pushback ──▶ next fetch_data() returns the 5 bytes
//! ```
//!
//! # Implementations
//!
//! - **[`StreamChannel`]**: any `AsyncRead + AsyncWrite` stream (TCP in
//!   production, turmoil TCP in simulation)
//! - **[`DatagramChannel`]**: any [`DatagramSocket`] (connected UDP in
//!   production, turmoil UDP in simulation)
//!
//! Timeouts go through `tokio::time`, so channels run unchanged on a paused
//! or simulated clock.

use std::{collections::VecDeque, io, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    time::{Instant, timeout, timeout_at},
};
use tracing::trace;

use crate::error::TransportError;

/// Largest read issued to the underlying socket.
const READ_SIZE: usize = 16 * 1024;

/// Largest datagram accepted.
const MAX_DATAGRAM: usize = 65_535;

/// Socket condition as seen by a non-blocking check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Open, nothing waiting
    Up,
    /// Closed locally or by the peer
    Closed,
    /// The last read timed out
    Timeout,
    /// The socket reported an error
    SocketException,
    /// Bytes are waiting to be fetched
    DataAvailable,
}

/// Byte channel at the bottom of a layer stack.
///
/// Not safe for concurrent use: one stack owns one channel.
#[async_trait]
pub trait TransportChannel: Send {
    /// Writes `data` and flushes.
    ///
    /// # Behavior
    ///
    /// - **Stream channels** write the bytes in order
    /// - **Datagram channels** send exactly one datagram
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] after [`close`](Self::close) and
    /// [`TransportError::Io`] if the socket fails.
    async fn send_data(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Returns whatever bytes are available.
    ///
    /// # Behavior
    ///
    /// - **Returns** pushed-back bytes first, without waiting
    /// - **Waits** up to the channel timeout for new bytes otherwise
    /// - **Returns empty** on timeout or end of stream; use
    ///   [`socket_state`](Self::socket_state) to tell them apart
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the socket fails.
    async fn fetch_data(&mut self) -> Result<Bytes, TransportError>;

    /// Returns exactly `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Eof`] or [`TransportError::TimedOut`] if
    /// fewer bytes arrive; the partial bytes are pushed back.
    async fn fetch_exact(&mut self, len: usize) -> Result<Bytes, TransportError>;

    /// Closes the channel. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the shutdown fails.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Probes the socket without waiting.
    ///
    /// Bytes read by the check are pushed back.
    async fn socket_state(&mut self) -> SocketState;

    /// Returns true if each send is one datagram.
    fn is_datagram(&self) -> bool;
}

/// Channel over a byte stream.
#[derive(Debug)]
pub struct StreamChannel<S> {
    stream: S,
    timeout: Duration,
    pushback: BytesMut,
    eof: bool,
    closed: bool,
    timed_out: bool,
}

impl<S> StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps `stream`, waiting up to `timeout` for each fetch.
    pub fn new(stream: S, timeout: Duration) -> Self {
        Self {
            stream,
            timeout,
            pushback: BytesMut::new(),
            eof: false,
            closed: false,
            timed_out: false,
        }
    }

    /// Bytes waiting in the pushback buffer.
    pub fn pushed_back(&self) -> usize {
        self.pushback.len()
    }

    /// Returns the wrapped stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Reads once into the pushback buffer. `Ok(0)` means end of stream.
    async fn read_some(&mut self) -> io::Result<usize> {
        let mut buf = vec![0u8; READ_SIZE];
        let n = self.stream.read(&mut buf).await?;
        if n == 0 {
            self.eof = true;
        }
        self.pushback.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

#[async_trait]
impl<S> TransportChannel for StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_data(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        trace!(len = data.len(), "stream bytes sent");
        Ok(())
    }

    async fn fetch_data(&mut self) -> Result<Bytes, TransportError> {
        if self.pushback.is_empty() && !self.eof && !self.closed {
            match timeout(self.timeout, self.read_some()).await {
                Ok(read) => {
                    read?;
                    self.timed_out = false;
                },
                Err(_) => self.timed_out = true,
            }
        }
        Ok(self.pushback.split().freeze())
    }

    async fn fetch_exact(&mut self, len: usize) -> Result<Bytes, TransportError> {
        let deadline = Instant::now() + self.timeout;
        while self.pushback.len() < len {
            if self.eof || self.closed {
                return Err(TransportError::Eof { expected: len, available: self.pushback.len() });
            }
            match timeout_at(deadline, self.read_some()).await {
                Ok(read) => {
                    read?;
                },
                Err(_) => {
                    self.timed_out = true;
                    let available = self.pushback.len();
                    return Err(TransportError::TimedOut { expected: len, available });
                },
            }
        }
        Ok(self.pushback.split_to(len).freeze())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            self.stream.shutdown().await?;
        }
        Ok(())
    }

    async fn socket_state(&mut self) -> SocketState {
        if self.closed || (self.eof && self.pushback.is_empty()) {
            return SocketState::Closed;
        }
        if !self.pushback.is_empty() {
            return SocketState::DataAvailable;
        }
        match timeout(Duration::ZERO, self.read_some()).await {
            Ok(Ok(0)) => SocketState::Closed,
            Ok(Ok(_)) => SocketState::DataAvailable,
            Ok(Err(_)) => SocketState::SocketException,
            Err(_) if self.timed_out => SocketState::Timeout,
            Err(_) => SocketState::Up,
        }
    }

    fn is_datagram(&self) -> bool {
        false
    }
}

/// Connects a TCP stream channel.
///
/// # Errors
///
/// Returns the connect error.
pub async fn connect_tcp(
    remote: SocketAddr,
    timeout: Duration,
) -> io::Result<StreamChannel<TcpStream>> {
    let stream = TcpStream::connect(remote).await?;
    stream.set_nodelay(true)?;
    Ok(StreamChannel::new(stream, timeout))
}

/// A connected datagram socket.
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    /// Sends one datagram to the connected peer.
    async fn send(&self, datagram: &[u8]) -> io::Result<usize>;

    /// Receives one datagram from the connected peer.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send(&self, datagram: &[u8]) -> io::Result<usize> {
        UdpSocket::send(self, datagram).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        UdpSocket::recv(self, buf).await
    }
}

/// Channel over a datagram socket.
#[derive(Debug)]
pub struct DatagramChannel<D> {
    socket: D,
    timeout: Duration,
    pushback: VecDeque<Bytes>,
    closed: bool,
    timed_out: bool,
}

impl<D: DatagramSocket> DatagramChannel<D> {
    /// Wraps `socket`, waiting up to `timeout` for each fetch.
    pub fn new(socket: D, timeout: Duration) -> Self {
        Self { socket, timeout, pushback: VecDeque::new(), closed: false, timed_out: false }
    }

    async fn recv_one(&self) -> io::Result<Bytes> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let n = self.socket.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(buf.into())
    }

    /// Puts partially consumed bytes back at the front of the queue.
    fn restore(&mut self, bytes: BytesMut) {
        if !bytes.is_empty() {
            self.pushback.push_front(bytes.freeze());
        }
    }
}

#[async_trait]
impl<D: DatagramSocket> TransportChannel for DatagramChannel<D> {
    async fn send_data(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.socket.send(data).await?;
        trace!(len = data.len(), "datagram sent");
        Ok(())
    }

    async fn fetch_data(&mut self) -> Result<Bytes, TransportError> {
        if let Some(datagram) = self.pushback.pop_front() {
            return Ok(datagram);
        }
        if self.closed {
            return Ok(Bytes::new());
        }
        match timeout(self.timeout, self.recv_one()).await {
            Ok(datagram) => {
                self.timed_out = false;
                Ok(datagram?)
            },
            Err(_) => {
                self.timed_out = true;
                Ok(Bytes::new())
            },
        }
    }

    async fn fetch_exact(&mut self, len: usize) -> Result<Bytes, TransportError> {
        let deadline = Instant::now() + self.timeout;
        let mut collected = BytesMut::new();
        while collected.len() < len {
            let next = match self.pushback.pop_front() {
                Some(datagram) => Ok(datagram),
                None if self.closed => {
                    let available = collected.len();
                    self.restore(collected);
                    return Err(TransportError::Eof { expected: len, available });
                },
                None => match timeout_at(deadline, self.recv_one()).await {
                    Ok(received) => received,
                    Err(_) => {
                        self.timed_out = true;
                        let available = collected.len();
                        self.restore(collected);
                        return Err(TransportError::TimedOut { expected: len, available });
                    },
                },
            };
            match next {
                Ok(datagram) => collected.extend_from_slice(&datagram),
                Err(err) => {
                    self.restore(collected);
                    return Err(err.into());
                },
            }
        }
        let rest = collected.split_off(len);
        self.restore(rest);
        Ok(collected.freeze())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }

    async fn socket_state(&mut self) -> SocketState {
        if self.closed {
            return SocketState::Closed;
        }
        if !self.pushback.is_empty() {
            return SocketState::DataAvailable;
        }
        match timeout(Duration::ZERO, self.recv_one()).await {
            Ok(Ok(datagram)) => {
                self.pushback.push_back(datagram);
                SocketState::DataAvailable
            },
            Ok(Err(_)) => SocketState::SocketException,
            Err(_) if self.timed_out => SocketState::Timeout,
            Err(_) => SocketState::Up,
        }
    }

    fn is_datagram(&self) -> bool {
        true
    }
}

/// Binds `local` and connects a UDP datagram channel to `remote`.
///
/// # Errors
///
/// Returns the bind or connect error.
pub async fn connect_udp(
    local: SocketAddr,
    remote: SocketAddr,
    timeout: Duration,
) -> io::Result<DatagramChannel<UdpSocket>> {
    let socket = UdpSocket::bind(local).await?;
    socket.connect(remote).await?;
    Ok(DatagramChannel::new(socket, timeout))
}
