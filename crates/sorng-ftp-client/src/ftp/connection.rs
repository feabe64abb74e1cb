//! Socket boundary for the control and data connections.
//!
//! The session only sees boxed async byte streams. [`TcpTransport`] is the
//! real implementation; tests plug in in-memory streams.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Any bidirectional byte stream the session can drive.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// An established control connection.
pub struct Connection {
    pub stream: BoxedStream,
    /// Remote address; used to retry passive connects and to resolve EPSV.
    pub peer: Option<SocketAddr>,
}

/// Opens control and data connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, host: &str, port: u16) -> io::Result<Connection>;

    async fn connect_data(&self, addr: SocketAddr) -> io::Result<BoxedStream>;
}

/// Plain TCP via tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, host: &str, port: u16) -> io::Result<Connection> {
        let tcp = TcpStream::connect((host, port)).await?;
        tcp.set_nodelay(true).ok();
        let peer = tcp.peer_addr().ok();
        Ok(Connection {
            stream: Box::new(tcp),
            peer,
        })
    }

    async fn connect_data(&self, addr: SocketAddr) -> io::Result<BoxedStream> {
        let tcp = TcpStream::connect(addr).await?;
        tcp.set_nodelay(true).ok();
        Ok(Box::new(tcp))
    }
}
