//! Connection and raw listener seams.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// A bidirectional byte stream with endpoint addressing.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Address of the remote peer.
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Address of the local endpoint.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Connection for TcpStream {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }
}

#[cfg(feature = "tls")]
impl<C: Connection> Connection for tokio_rustls::server::TlsStream<C> {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.get_ref().0.peer_addr()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.get_ref().0.local_addr()
    }
}

/// A source of raw connections, such as a bound TCP socket.
#[async_trait]
pub trait RawListener: Send + Sync + 'static {
    /// Connection type produced by this listener.
    type Conn: Connection;

    /// Accept the next raw connection.
    async fn accept(&self) -> io::Result<Self::Conn>;

    /// Address this listener is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl RawListener for TcpListener {
    type Conn = TcpStream;

    async fn accept(&self) -> io::Result<TcpStream> {
        let (stream, _) = TcpListener::accept(self).await?;
        Ok(stream)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}
