use crate::Result;
use std::{
    pin::Pin,
    task::{Context, Poll},
};
#[cfg(feature = "tls")]
use std::sync::Arc;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
#[cfg(feature = "tls")]
use tokio_rustls::{client::TlsStream, webpki::DNSNameRef, TlsConnector};

/// How to reach the broker.
#[derive(Clone)]
pub enum ConnectionMode {
    /// Plain TCP.
    Tcp,
    /// TCP wrapped in TLS with the given rustls configuration.
    #[cfg(feature = "tls")]
    Tls(Arc<rustls::ClientConfig>),
}

impl Default for ConnectionMode {
    fn default() -> ConnectionMode {
        ConnectionMode::Tcp
    }
}

impl std::fmt::Debug for ConnectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ConnectionMode::Tcp => write!(f, "Tcp"),
            #[cfg(feature = "tls")]
            ConnectionMode::Tls(_) => write!(f, "Tls"),
        }
    }
}

/// A wrapper for the data connection, which may or may not be encrypted.
pub(crate) enum AsyncStream {
    TcpStream(TcpStream),
    #[cfg(feature = "tls")]
    TlsStream(Box<TlsStream<TcpStream>>),
}

impl AsyncStream {
    /// Open a stream to `host:port` using `mode`.
    pub(crate) async fn connect(host: &str, port: u16, mode: &ConnectionMode) -> Result<AsyncStream> {
        let tcp = TcpStream::connect((host, port)).await?;
        tcp.set_nodelay(true)?;
        match mode {
            ConnectionMode::Tcp => Ok(AsyncStream::TcpStream(tcp)),
            #[cfg(feature = "tls")]
            ConnectionMode::Tls(c) => {
                let connector = TlsConnector::from(c.clone());
                let domain = DNSNameRef::try_from_ascii_str(host)
                    .map_err(|_| crate::Error::from(format!("Invalid DNS name: {}", host)))?;
                let conn = connector.connect(domain, tcp).await?;
                Ok(AsyncStream::TlsStream(Box::new(conn)))
            }
        }
    }
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut ReadBuf,
    ) -> Poll<std::io::Result<()>> {
        match Pin::get_mut(self) {
            AsyncStream::TcpStream(tcp) => Pin::new(tcp).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            AsyncStream::TlsStream(tls) => Pin::new(tls.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &[u8],
    ) -> Poll<std::result::Result<usize, std::io::Error>> {
        match Pin::get_mut(self) {
            AsyncStream::TcpStream(tcp) => Pin::new(tcp).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            AsyncStream::TlsStream(tls) => Pin::new(tls.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context,
    ) -> Poll<std::result::Result<(), std::io::Error>> {
        match Pin::get_mut(self) {
            AsyncStream::TcpStream(tcp) => Pin::new(tcp).poll_flush(cx),
            #[cfg(feature = "tls")]
            AsyncStream::TlsStream(tls) => Pin::new(tls.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context,
    ) -> Poll<std::result::Result<(), std::io::Error>> {
        match Pin::get_mut(self) {
            AsyncStream::TcpStream(tcp) => Pin::new(tcp).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            AsyncStream::TlsStream(tls) => Pin::new(tls.as_mut()).poll_shutdown(cx),
        }
    }
}
