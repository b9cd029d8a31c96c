//! Tunnel establishment.
//!
//! [`establish`] turns an inbound request that names a target into a live upstream
//! connection, with protocol specific behaviour supplied by a [`ConnectHandler`]. The
//! same engine serves HTTP `CONNECT`, SOCKS5 `CONNECT` and plain forwarding.
use crate::codec::RequestHead;
use crate::connection::Connection;
use crate::connector::{ResolvedAddress, ServerConnector};
use crate::context::{ConnectionInfo, ProxyContext};
use crate::errors::{Error, ResolveServerAddressError, Result};
use crate::relay::ClientRelay;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

pub(crate) const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
pub(crate) const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// Protocol hooks driven by [`establish`], generic over the request type `Q`.
#[async_trait::async_trait]
pub trait ConnectHandler<Q: Send + 'static>: Send {
  /// Derive the target from the inbound request.
  fn server_address(&self, request: &Q) -> std::result::Result<ResolvedAddress, ResolveServerAddressError>;
  /// Whether the client is still there to be relayed to.
  fn is_client_active(&self) -> bool;
  /// The upstream connection is open and the client is active.
  async fn connected(&mut self, upstream: Connection, request: Q) -> Result<()>;
  /// The upstream connection could not be opened.
  async fn fail_connect(&mut self, request: Q, cause: &Error) -> Result<()>;
  /// Flush and close whatever the handler still holds.
  async fn release(&mut self);
}

/// Resolve, connect and hand over to `handler`.
///
/// Resolution and connect failures are logged here and returned; the client has
/// already been released when this returns an error.
pub async fn establish<Q, C>(
  handler: &mut C,
  connector: &dyn ServerConnector,
  origin: &ConnectionInfo,
  request: Q,
) -> Result<()>
where
  Q: Send + 'static,
  C: ConnectHandler<Q> + ?Sized,
{
  let address = match handler.server_address(&request) {
    Ok(address) => address,
    Err(e) => {
      tracing::error!("{} {}", origin, e);
      handler.release().await;
      return Err(e.into());
    }
  };
  tracing::debug!("{} connecting to {}", origin, address);
  match connector.connect(&address, origin).await {
    Ok(mut upstream) => {
      if !handler.is_client_active() {
        tracing::debug!("{} client left while connecting to {}", origin, address);
        upstream.close_on_flush().await;
        handler.release().await;
        return Ok(());
      }
      if let Err(e) = handler.connected(upstream, request).await {
        handler.release().await;
        return Err(e);
      }
      Ok(())
    }
    Err(e) => {
      tracing::error!(
        "{} Unable to establish a remote connection to {}: {}",
        origin,
        address,
        e
      );
      let cause = Error::connect(address.to_string(), e);
      if let Err(e) = handler.fail_connect(request, &cause).await {
        tracing::debug!("{} failure notice not delivered: {}", origin, e);
      }
      handler.release().await;
      Err(cause)
    }
  }
}

/// Splice two connections into a raw byte relay.
///
/// Returns `false`, after closing both, when either side is no longer active. Once
/// spliced no further interception happens on the pair; when one direction ends the
/// write side of the other connection is flushed and shut down.
pub async fn relay_ducking(mut client: Connection, mut upstream: Connection) -> bool {
  if !(client.is_active() && upstream.is_active()) {
    release(Some(&mut client), Some(&mut upstream)).await;
    return false;
  }
  tokio::spawn(async move {
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);
    let outbound = async {
      let copied = tokio::io::copy(&mut client_read, &mut upstream_write).await;
      let _ = upstream_write.shutdown().await;
      copied
    };
    let inbound = async {
      let copied = tokio::io::copy(&mut upstream_read, &mut client_write).await;
      let _ = client_write.shutdown().await;
      copied
    };
    let (outbound, inbound) = tokio::join!(outbound, inbound);
    tracing::trace!("splice finished: {:?} up, {:?} down", outbound, inbound);
  });
  true
}

/// Flush and close whichever connections are present.
pub async fn release(client: Option<&mut Connection>, upstream: Option<&mut Connection>) {
  if let Some(client) = client {
    client.close_on_flush().await;
  }
  if let Some(upstream) = upstream {
    upstream.close_on_flush().await;
  }
}

/// `CONNECT` handling for the HTTP side of the proxy.
pub(crate) struct HttpTunnelHandler {
  shared: Arc<ProxyContext>,
  info: ConnectionInfo,
  client: Option<Connection>,
  early_data: Bytes,
  next: Option<ClientRelay>,
}

impl HttpTunnelHandler {
  pub(crate) fn new(
    shared: Arc<ProxyContext>,
    info: ConnectionInfo,
    client: Connection,
    early_data: Bytes,
  ) -> Self {
    HttpTunnelHandler {
      shared,
      info,
      client: Some(client),
      early_data,
      next: None,
    }
  }
  /// Relay to run over the intercepted TLS streams, if the tunnel was intercepted.
  pub(crate) fn into_next(self) -> Option<ClientRelay> {
    self.next
  }

  #[cfg(feature = "tls")]
  async fn intercept(
    &mut self,
    client: Connection,
    upstream: Connection,
    request: &RequestHead,
  ) -> Result<Option<(Connection, Connection)>> {
    let Some(mitm) = self.shared.mitm.clone() else {
      return Ok(Some((client, upstream)));
    };
    if !self.early_data.is_empty() {
      return Ok(Some((client, upstream)));
    }
    let address = self.server_address(request)?;
    let Some(server_config) = mitm.server_config(address.host()) else {
      return Ok(Some((client, upstream)));
    };
    let client = client.accept_tls(server_config).await?;
    let upstream = upstream
      .connect_tls(mitm.client_config(), address.host())
      .await?;
    tracing::debug!("{} intercepting tunnel to {}", self.info, address);
    let info = self.info.clone().intercepting(address.host());
    self.next = Some(ClientRelay::intercepted(
      self.shared.clone(),
      info,
      client,
      upstream,
      address,
    ));
    Ok(None)
  }
}

#[async_trait::async_trait]
impl ConnectHandler<RequestHead> for HttpTunnelHandler {
  fn server_address(
    &self,
    request: &RequestHead,
  ) -> std::result::Result<ResolvedAddress, ResolveServerAddressError> {
    let authority = request
      .authority()
      .ok_or_else(|| ResolveServerAddressError::new(request.uri().to_string(), "no authority"))?;
    ResolvedAddress::parse_authority(&authority, 443)
  }

  fn is_client_active(&self) -> bool {
    self.client.as_ref().is_some_and(Connection::is_active)
  }

  async fn connected(&mut self, upstream: Connection, request: RequestHead) -> Result<()> {
    let Some(mut client) = self.client.take() else {
      return Ok(());
    };
    client.write_all(CONNECTION_ESTABLISHED).await?;
    client.flush().await?;
    #[cfg(feature = "tls")]
    let Some((client, upstream)) = self.intercept(client, upstream, &request).await?
    else {
      return Ok(());
    };
    #[cfg(not(feature = "tls"))]
    let _ = request;
    let mut upstream = upstream;
    if !self.early_data.is_empty() {
      upstream.write_all(&self.early_data).await?;
      upstream.flush().await?;
    }
    relay_ducking(client, upstream).await;
    Ok(())
  }

  async fn fail_connect(&mut self, _request: RequestHead, _cause: &Error) -> Result<()> {
    if let Some(client) = self.client.as_mut() {
      client.write_all(BAD_GATEWAY).await?;
      client.flush().await?;
    }
    Ok(())
  }

  async fn release(&mut self) {
    release(self.client.as_mut(), None).await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tokio::io::AsyncReadExt;
  use tokio::net::{TcpListener, TcpStream};

  async fn pair() -> (Connection, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
    let (conn, _) = listener.accept().await.unwrap();
    (Connection::new(conn), peer)
  }

  fn origin() -> ConnectionInfo {
    let addr = "127.0.0.1:1".parse().unwrap();
    ConnectionInfo::new(1, addr, addr)
  }

  #[derive(Default)]
  struct Probe {
    client_active: bool,
    connected: AtomicUsize,
    failed: AtomicUsize,
    released: AtomicUsize,
  }

  #[async_trait::async_trait]
  impl ConnectHandler<String> for Probe {
    fn server_address(
      &self,
      request: &String,
    ) -> std::result::Result<ResolvedAddress, ResolveServerAddressError> {
      ResolvedAddress::parse_authority(request, 80)
    }
    fn is_client_active(&self) -> bool {
      self.client_active
    }
    async fn connected(&mut self, _upstream: Connection, _request: String) -> Result<()> {
      self.connected.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
    async fn fail_connect(&mut self, _request: String, cause: &Error) -> Result<()> {
      assert!(cause.is_connect());
      self.failed.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
    async fn release(&mut self) {
      self.released.fetch_add(1, Ordering::SeqCst);
    }
  }

  struct Refuse;
  #[async_trait::async_trait]
  impl ServerConnector for Refuse {
    async fn connect(&self, _: &ResolvedAddress, _: &ConnectionInfo) -> Result<Connection> {
      Err(crate::errors::new_io_error(
        std::io::ErrorKind::ConnectionRefused,
        "refused",
      ))
    }
  }

  #[tokio::test]
  async fn resolve_failure_releases_without_connecting() {
    let mut probe = Probe::default();
    let err = establish(&mut probe, &Refuse, &origin(), "bad:port".to_string())
      .await
      .unwrap_err();
    assert!(matches!(err, Error::ResolveServerAddress(_)));
    assert_eq!(probe.released.load(Ordering::SeqCst), 1);
    assert_eq!(probe.failed.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn connect_failure_calls_fail_connect() {
    let mut probe = Probe::default();
    let err = establish(&mut probe, &Refuse, &origin(), "example.com".to_string())
      .await
      .unwrap_err();
    assert!(err.is_connect());
    assert_eq!(probe.failed.load(Ordering::SeqCst), 1);
    assert_eq!(probe.connected.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn dead_client_discards_upstream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap().to_string();
    let mut probe = Probe::default();
    let connector = crate::connector::DirectServerConnector::default();
    establish(&mut probe, &connector, &origin(), target)
      .await
      .unwrap();
    assert_eq!(probe.connected.load(Ordering::SeqCst), 0);
    let (mut orphan, _) = listener.accept().await.unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(orphan.read(&mut buf).await.unwrap(), 0, "orphan should be closed");
  }

  #[tokio::test]
  async fn ducking_relays_both_ways() {
    let (client, mut client_peer) = pair().await;
    let (upstream, mut upstream_peer) = pair().await;
    assert!(relay_ducking(client, upstream).await);
    client_peer.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    upstream_peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    upstream_peer.write_all(b"pong").await.unwrap();
    client_peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
  }

  #[tokio::test]
  async fn ducking_refuses_inactive_side() {
    let (client, mut client_peer) = pair().await;
    let (upstream, upstream_peer) = pair().await;
    drop(upstream_peer);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!relay_ducking(client, upstream).await);
    let mut buf = [0u8; 1];
    assert_eq!(client_peer.read(&mut buf).await.unwrap(), 0);
  }
}
