use crate::config::ProxyConfig;
use crate::connection::Connection;
use crate::context::ConnectionInfo;
use crate::errors::{new_io_error, ResolveServerAddressError, Result};
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpSocket;

/// Host and port of a remote server, derived from an inbound request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedAddress {
  host: String,
  port: u16,
}

impl ResolvedAddress {
  /// Pair a host name or IP literal with a port.
  pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
    ResolvedAddress {
      host: host.into(),
      port,
    }
  }
  /// Parse `host[:port]`, with IPv6 literals in brackets. `default_port` applies when
  /// the authority names no port.
  pub fn parse_authority(
    authority: &str,
    default_port: u16,
  ) -> std::result::Result<Self, ResolveServerAddressError> {
    let invalid = |reason| ResolveServerAddressError::new(authority, reason);
    let authority = authority.trim();
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    if authority.is_empty() {
      return Err(invalid("empty authority"));
    }
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
      let (host, rest) = rest
        .split_once(']')
        .ok_or_else(|| invalid("unterminated ipv6 literal"))?;
      match rest {
        "" => (host, None),
        _ => match rest.strip_prefix(':') {
          Some(port) => (host, Some(port)),
          None => return Err(invalid("garbage after ipv6 literal")),
        },
      }
    } else {
      match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => (host, Some(port)),
        Some(_) => return Err(invalid("ipv6 literal must be bracketed")),
        None => (authority, None),
      }
    };
    if host.is_empty() {
      return Err(invalid("missing host"));
    }
    let port = match port {
      None => default_port,
      Some(port) => match port.parse::<u16>() {
        Ok(0) | Err(_) => return Err(invalid("invalid port")),
        Ok(port) => port,
      },
    };
    Ok(ResolvedAddress::new(host, port))
  }
  /// host name or IP literal, without brackets
  pub fn host(&self) -> &str {
    &self.host
  }
  /// port
  pub fn port(&self) -> u16 {
    self.port
  }
  /// The host as an IP address, when it is a literal.
  pub fn ip(&self) -> Option<IpAddr> {
    self.host.parse().ok()
  }
}

impl fmt::Display for ResolvedAddress {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.host.contains(':') {
      write!(f, "[{}]:{}", self.host, self.port)
    } else {
      write!(f, "{}:{}", self.host, self.port)
    }
  }
}

/// Opens upstream connections.
///
/// `origin` identifies the client connection the upstream is opened for, so an
/// implementation can route per client.
#[async_trait::async_trait]
pub trait ServerConnector: Send + Sync {
  /// Open a connection to `address`.
  async fn connect(&self, address: &ResolvedAddress, origin: &ConnectionInfo)
    -> Result<Connection>;
}

/// Dials the remote server directly.
#[derive(Debug, Clone)]
pub struct DirectServerConnector {
  connect_timeout: Option<Duration>,
  nodelay: bool,
  keepalive: bool,
}

impl Default for DirectServerConnector {
  fn default() -> Self {
    DirectServerConnector {
      connect_timeout: Some(Duration::from_secs(10)),
      nodelay: true,
      keepalive: false,
    }
  }
}

impl DirectServerConnector {
  /// Connector with the timeout from `config`.
  pub fn new(config: &ProxyConfig) -> Self {
    DirectServerConnector {
      connect_timeout: Some(config.connect_timeout()),
      ..Default::default()
    }
  }
  /// Set a timeout for only the connect phase.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.connect_timeout = timeout;
    self
  }
  /// Set `SO_NODELAY` on upstream sockets.
  ///
  /// Default is `true`.
  pub fn nodelay(mut self, value: bool) -> Self {
    self.nodelay = value;
    self
  }
  /// Set `SO_KEEPALIVE` on upstream sockets.
  ///
  /// Default is `false`.
  pub fn keepalive(mut self, value: bool) -> Self {
    self.keepalive = value;
    self
  }

  /// Connect to one socket address.
  pub async fn connect_with_addr<S: Into<SocketAddr>>(&self, addr: S) -> Result<Connection> {
    let addr = addr.into();
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    if self.keepalive {
      socket.set_keepalive(self.keepalive)?;
    }
    let stream = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|x| new_io_error(std::io::ErrorKind::TimedOut, &x.to_string()))??,
    };
    Ok(Connection::new(stream))
  }

  /// Resolve `address` and try each result in turn.
  pub(crate) async fn connect_host(&self, address: &ResolvedAddress) -> Result<Connection> {
    let candidates: Vec<SocketAddr> = match address.ip() {
      Some(ip) => vec![SocketAddr::new(ip, address.port())],
      None => tokio::net::lookup_host((address.host(), address.port()))
        .await?
        .collect(),
    };
    let mut last_error = None;
    for addr in candidates {
      match self.connect_with_addr(addr).await {
        Ok(connection) => return Ok(connection),
        Err(e) => {
          tracing::debug!("connect to {} ({}) failed: {}", address, addr, e);
          last_error = Some(e);
        }
      }
    }
    Err(last_error.unwrap_or_else(|| {
      new_io_error(std::io::ErrorKind::NotFound, "no address resolved for host")
    }))
  }
}

#[async_trait::async_trait]
impl ServerConnector for DirectServerConnector {
  async fn connect(
    &self,
    address: &ResolvedAddress,
    _origin: &ConnectionInfo,
  ) -> Result<Connection> {
    self.connect_host(address).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_authority_forms() {
    let a = ResolvedAddress::parse_authority("example.com:8443", 443).unwrap();
    assert_eq!((a.host(), a.port()), ("example.com", 8443));
    let b = ResolvedAddress::parse_authority("example.com", 80).unwrap();
    assert_eq!(b.port(), 80);
    let c = ResolvedAddress::parse_authority("[::1]:8080", 80).unwrap();
    assert_eq!((c.host(), c.port()), ("::1", 8080));
    assert_eq!(c.to_string(), "[::1]:8080");
    let d = ResolvedAddress::parse_authority("user:pw@example.com", 80).unwrap();
    assert_eq!(d.host(), "example.com");
  }

  #[test]
  fn parse_authority_rejects_garbage() {
    for bad in ["", ":80", "example.com:http", "example.com:0", "::1", "[::1"] {
      let err = ResolvedAddress::parse_authority(bad, 80).unwrap_err();
      assert_eq!(err.target(), bad);
    }
  }

  #[tokio::test]
  async fn direct_connector_reaches_listener() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let connector = DirectServerConnector::default();
    let addr = "127.0.0.1:9".parse().unwrap();
    let origin = ConnectionInfo::new(1, addr, addr);
    let conn = connector
      .connect(&ResolvedAddress::new("127.0.0.1", port), &origin)
      .await
      .unwrap();
    assert_eq!(conn.peer_addr().unwrap().port(), port);
  }

  #[tokio::test]
  async fn direct_connector_reports_refused() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let connector = DirectServerConnector::default();
    assert!(connector
      .connect_host(&ResolvedAddress::new("127.0.0.1", port))
      .await
      .is_err());
  }
}
