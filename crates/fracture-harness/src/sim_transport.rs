//! Turmoil sockets behind the core transport channels.
//!
//! Stream stacks run over [`StreamChannel`] on a turmoil `TcpStream`
//! unchanged. Datagram stacks need a [`DatagramSocket`]; turmoil's UDP
//! socket has no connected mode, so [`SimDatagram`] remembers the peer
//! address itself.

use std::{
    io,
    net::SocketAddr,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use fracture_core::{
    LayerStack, TransportChannel,
    transport::{DatagramChannel, DatagramSocket, StreamChannel},
};
use turmoil::net::{TcpListener, TcpStream, UdpSocket};

/// Port the scripted peer listens on, for both TCP and UDP.
pub const PEER_PORT: u16 = 443;

/// Port the client binds for UDP.
pub const CLIENT_UDP_PORT: u16 = 50_000;

/// Stream channel over a simulated TCP connection.
pub type SimStreamChannel = StreamChannel<TcpStream>;

/// Connects to `host` on [`PEER_PORT`].
///
/// # Errors
///
/// Returns the connect error, e.g. when the host is not listening yet.
pub async fn connect_stream(host: &str, timeout: Duration) -> io::Result<SimStreamChannel> {
    let stream = TcpStream::connect((host, PEER_PORT)).await?;
    Ok(StreamChannel::new(stream, timeout))
}

/// Accepts one connection from `listener`.
///
/// # Errors
///
/// Returns the accept error.
pub async fn accept_stream(
    listener: &TcpListener,
    timeout: Duration,
) -> io::Result<SimStreamChannel> {
    let (stream, remote) = listener.accept().await?;
    tracing::debug!(%remote, "accepted simulated connection");
    Ok(StreamChannel::new(stream, timeout))
}

/// A turmoil UDP socket bound to one peer.
///
/// A socket created by [`connect`](Self::connect) knows its peer up front;
/// one created by [`bind`](Self::bind) adopts the source of the first
/// datagram it receives and drops datagrams from anyone else afterwards.
pub struct SimDatagram {
    socket: UdpSocket,
    peer: Mutex<Option<SocketAddr>>,
}

impl SimDatagram {
    /// Binds [`CLIENT_UDP_PORT`] and targets `host` on [`PEER_PORT`].
    ///
    /// # Errors
    ///
    /// Returns the bind error.
    pub async fn connect(host: &str) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", CLIENT_UDP_PORT)).await?;
        let peer = SocketAddr::new(turmoil::lookup(host), PEER_PORT);
        Ok(Self { socket, peer: Mutex::new(Some(peer)) })
    }

    /// Binds [`PEER_PORT`] and waits for a peer to speak first.
    ///
    /// # Errors
    ///
    /// Returns the bind error.
    pub async fn bind() -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", PEER_PORT)).await?;
        Ok(Self { socket, peer: Mutex::new(None) })
    }

    /// Address datagrams are sent to, once known.
    pub fn peer(&self) -> Option<SocketAddr> {
        *self.peer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DatagramSocket for SimDatagram {
    async fn send(&self, datagram: &[u8]) -> io::Result<usize> {
        let peer = self.peer().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "no datagram received from a peer yet")
        })?;
        self.socket.send_to(datagram, peer).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let (len, from) = self.socket.recv_from(buf).await?;
            let mut peer = self.peer.lock().unwrap_or_else(PoisonError::into_inner);
            match *peer {
                Some(known) if known != from => {
                    tracing::trace!(%from, "dropping datagram from a stranger");
                },
                _ => {
                    *peer = Some(from);
                    return Ok(len);
                },
            }
        }
    }
}

/// Layer stack shapes a simulated endpoint can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Preset {
    /// TLS messages over records over TCP
    #[default]
    Tls,
    /// HTTP over TLS over TCP
    Https,
    /// HTTP over TCP
    Http,
    /// TLS messages over QUIC frames and packets over UDP
    Quic,
}

impl Preset {
    /// Returns true if the preset runs over UDP.
    pub fn is_datagram(self) -> bool {
        matches!(self, Self::Quic)
    }

    /// Builds the preset's layers over `channel`.
    pub fn stack(self, channel: impl TransportChannel + 'static) -> LayerStack {
        match self {
            Self::Tls => LayerStack::tls(channel),
            Self::Https => LayerStack::https(channel),
            Self::Http => LayerStack::http(channel),
            Self::Quic => LayerStack::quic(channel),
        }
    }

    /// Connects to `host` with the preset's transport and builds its stack.
    ///
    /// # Errors
    ///
    /// Returns the connect or bind error.
    pub async fn connect(self, host: &str, timeout: Duration) -> io::Result<LayerStack> {
        if self.is_datagram() {
            let socket = SimDatagram::connect(host).await?;
            Ok(self.stack(DatagramChannel::new(socket, timeout)))
        } else {
            Ok(self.stack(connect_stream(host, timeout).await?))
        }
    }
}
