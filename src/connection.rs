//! Client and upstream byte streams over plain TCP or TLS.
#[cfg(feature = "tls")]
use crate::errors::Result;
use std::io::{Error, ErrorKind};
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
#[cfg(feature = "tls")]
use std::sync::Arc;
#[cfg(feature = "tls")]
use tokio_rustls::rustls;

/// One side of a proxied session: the client connection or the upstream connection.
///
/// A connection is closed at most once, through [`Connection::close_on_flush`] or by
/// dropping it.
#[derive(Debug)]
pub struct Connection {
  inner: MaybeTlsStream,
  closed: bool,
}

impl Connection {
  /// Wrap a plain TCP stream.
  pub fn new(stream: TcpStream) -> Self {
    Self::from_stream(MaybeTlsStream::Tcp(stream))
  }
  pub(crate) fn from_stream(inner: MaybeTlsStream) -> Self {
    Connection {
      inner,
      closed: false,
    }
  }
  /// The TCP stream underneath, TLS or not.
  pub fn tcp(&self) -> &TcpStream {
    match &self.inner {
      MaybeTlsStream::Tcp(stream) => stream,
      #[cfg(feature = "tls")]
      MaybeTlsStream::Tls(stream) => stream.get_ref().0,
    }
  }
  /// Remote address of this connection.
  pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
    self.tcp().peer_addr()
  }
  /// Local address of this connection.
  pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
    self.tcp().local_addr()
  }
  /// `true` once TLS has been negotiated on this connection.
  pub fn is_tls(&self) -> bool {
    !matches!(self.inner, MaybeTlsStream::Tcp(_))
  }
  /// Whether the peer is still there and may be written to.
  ///
  /// A peer that has shut down its sending side counts as gone, so nothing is relayed
  /// onto a half-closed connection.
  pub fn is_active(&self) -> bool {
    if self.closed {
      return false;
    }
    let socket = socket2::SockRef::from(self.tcp());
    let mut probe = [MaybeUninit::<u8>::uninit(); 1];
    match socket.peek(&mut probe) {
      Ok(0) => false,
      Ok(_) => true,
      Err(e) => e.kind() == ErrorKind::WouldBlock,
    }
  }
  /// Flush whatever is pending, then close. Later calls do nothing.
  pub async fn close_on_flush(&mut self) {
    if self.closed {
      return;
    }
    self.closed = true;
    let _ = self.inner.flush().await;
    let _ = self.inner.shutdown().await;
  }
}

#[cfg(feature = "tls")]
impl Connection {
  /// Terminate TLS from a client with the given server configuration.
  pub(crate) async fn accept_tls(self, config: Arc<rustls::ServerConfig>) -> Result<Connection> {
    match self.inner {
      MaybeTlsStream::Tcp(stream) => {
        let tls = tokio_rustls::TlsAcceptor::from(config)
          .accept(stream)
          .await?;
        Ok(Self::from_stream(MaybeTlsStream::Tls(Box::new(tls.into()))))
      }
      MaybeTlsStream::Tls(_) => Err(crate::errors::new_io_error(
        ErrorKind::InvalidInput,
        "connection already speaks tls",
      )),
    }
  }
  /// Open TLS toward an upstream server, verifying it as `domain`.
  pub(crate) async fn connect_tls(
    self,
    config: Arc<rustls::ClientConfig>,
    domain: &str,
  ) -> Result<Connection> {
    let name = rustls::pki_types::ServerName::try_from(domain.to_owned())
      .map_err(|e| crate::errors::Error::Other(e.to_string()))?;
    match self.inner {
      MaybeTlsStream::Tcp(stream) => {
        let tls = tokio_rustls::TlsConnector::from(config)
          .connect(name, stream)
          .await?;
        Ok(Self::from_stream(MaybeTlsStream::Tls(Box::new(tls.into()))))
      }
      MaybeTlsStream::Tls(_) => Err(crate::errors::new_io_error(
        ErrorKind::InvalidInput,
        "connection already speaks tls",
      )),
    }
  }
}

#[derive(Debug)]
pub(crate) enum MaybeTlsStream {
  /// TCP
  Tcp(TcpStream),
  #[cfg(feature = "tls")]
  /// TLS, either side of the handshake
  Tls(Box<tokio_rustls::TlsStream<TcpStream>>),
}

impl AsyncRead for Connection {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}
impl AsyncWrite for Connection {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::result::Result<usize, Error>> {
    if self.closed {
      return Poll::Ready(Err(Error::new(
        ErrorKind::NotConnected,
        "write on a closed connection",
      )));
    }
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
  ) -> Poll<std::result::Result<(), Error>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
  ) -> Poll<std::result::Result<(), Error>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}
impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      #[cfg(feature = "tls")]
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
    }
  }
}
impl AsyncWrite for MaybeTlsStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::result::Result<usize, Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      #[cfg(feature = "tls")]
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      #[cfg(feature = "tls")]
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
    }
  }
  fn poll_shutdown(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
  ) -> Poll<std::result::Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      #[cfg(feature = "tls")]
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncReadExt;
  use tokio::net::TcpListener;

  async fn pair() -> (Connection, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();
    (Connection::new(server), client)
  }

  #[tokio::test]
  async fn active_until_peer_closes() {
    let (conn, peer) = pair().await;
    assert!(conn.is_active(), "fresh connection should be active");
    drop(peer);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!conn.is_active(), "closed peer should be detected");
  }

  #[tokio::test]
  async fn pending_data_keeps_connection_active() {
    let (mut conn, mut peer) = pair().await;
    peer.write_all(b"x").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(conn.is_active());
    let mut buf = [0u8; 1];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"x");
  }

  #[tokio::test]
  async fn close_on_flush_is_idempotent() {
    let (mut conn, mut peer) = pair().await;
    conn.write_all(b"bye").await.unwrap();
    conn.close_on_flush().await;
    conn.close_on_flush().await;
    assert!(!conn.is_active());
    assert!(conn.write_all(b"more").await.is_err());
    let mut received = Vec::new();
    peer.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"bye");
  }
}
