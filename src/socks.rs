//! SOCKS5 inbound side of the listener.
//!
//! Clients whose first byte is `0x05` are served here: method negotiation, optional
//! RFC 1929 username/password authentication, then a `CONNECT` that is completed by
//! the tunnel engine and spliced into a raw relay.
use crate::auth::Credentials;
use crate::connection::Connection;
use crate::connector::ResolvedAddress;
use crate::context::{ConnectionInfo, ProxyContext};
use crate::errors::{Error, ReplyError, ResolveServerAddressError, Result};
use crate::proxy::{consts, read_address};
use crate::tunnel::{self, relay_ducking, ConnectHandler};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const PASSWORD_AUTH_VERSION: u8 = 0x01;
const PASSWORD_AUTH_FAILED: u8 = 0x01;

/// A SOCKS5 `CONNECT` request read from a client.
#[derive(Debug, Clone, PartialEq)]
pub struct Socks5Request {
  address: ResolvedAddress,
  username: Option<String>,
}

impl Socks5Request {
  /// Requested destination.
  pub fn address(&self) -> &ResolvedAddress {
    &self.address
  }
  /// User that authenticated the request, if any.
  pub fn username(&self) -> Option<&str> {
    self.username.as_deref()
  }
}

fn reply(code: u8) -> [u8; 10] {
  [
    consts::SOCKS5_VERSION,
    code,
    0x00,
    consts::SOCKS5_ADDR_TYPE_IPV4,
    0,
    0,
    0,
    0,
    0,
    0,
  ]
}

/// Serve one SOCKS5 client until its tunnel is spliced or the client is turned away.
pub(crate) async fn serve(
  shared: Arc<ProxyContext>,
  info: ConnectionInfo,
  mut client: Connection,
) -> Result<()> {
  let request = match handshake(&shared, &mut client).await {
    Ok(Some(request)) => request,
    Ok(None) => {
      client.close_on_flush().await;
      return Ok(());
    }
    Err(e) => {
      client.close_on_flush().await;
      return Err(e);
    }
  };
  tracing::debug!("{} SOCKS5 CONNECT {}", info, request.address);
  let mut handler = Socks5ConnectHandler {
    client: Some(client),
  };
  tunnel::establish(&mut handler, shared.connector.as_ref(), &info, request).await
}

/// Negotiate a method and read the request. `None` means the client was answered with
/// a refusal and should be closed.
async fn handshake(shared: &ProxyContext, client: &mut Connection) -> Result<Option<Socks5Request>> {
  let mut buf = [0u8; 2];
  client.read_exact(&mut buf).await?;
  let [version, count] = buf;
  if version != consts::SOCKS5_VERSION {
    return Err(Error::decode(format!("unsupported socks version {}", version)));
  }
  let mut methods = vec![0u8; count as usize];
  client.read_exact(&mut methods).await?;
  let wanted = if shared.authenticator.is_some() {
    consts::SOCKS5_AUTH_METHOD_PASSWORD
  } else {
    consts::SOCKS5_AUTH_METHOD_NONE
  };
  if !methods.contains(&wanted) {
    client
      .write_all(&[consts::SOCKS5_VERSION, consts::SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE])
      .await?;
    return Ok(None);
  }
  client.write_all(&[consts::SOCKS5_VERSION, wanted]).await?;
  let mut username = None;
  if let Some(authenticator) = shared.authenticator.as_ref() {
    let credentials = read_password_auth(client).await?;
    if !authenticator.authenticate(Some(&credentials)) {
      tracing::info!("socks5 client rejected: {:?}", credentials.username());
      client
        .write_all(&[PASSWORD_AUTH_VERSION, PASSWORD_AUTH_FAILED])
        .await?;
      return Ok(None);
    }
    client
      .write_all(&[PASSWORD_AUTH_VERSION, consts::SOCKS5_REPLY_SUCCEEDED])
      .await?;
    username = credentials.username().map(str::to_string);
  }

  let mut buf = [0u8; 4];
  client.read_exact(&mut buf).await?;
  let [version, command, _rsv, address_type] = buf;
  if version != consts::SOCKS5_VERSION {
    return Err(Error::decode(format!("unsupported socks version {}", version)));
  }
  let target = match read_address(client, address_type).await {
    Ok(target) => target,
    Err(Error::ReplyError(ReplyError::AddressTypeNotSupported)) => {
      client
        .write_all(&reply(consts::SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED))
        .await?;
      return Ok(None);
    }
    Err(e) => return Err(e),
  };
  if command != consts::SOCKS5_CMD_TCP_CONNECT {
    client
      .write_all(&reply(consts::SOCKS5_REPLY_COMMAND_NOT_SUPPORTED))
      .await?;
    return Ok(None);
  }
  Ok(Some(Socks5Request {
    address: target.to_resolved(),
    username,
  }))
}

async fn read_password_auth(client: &mut Connection) -> Result<Credentials> {
  let version = client.read_u8().await?;
  if version != PASSWORD_AUTH_VERSION {
    return Err(Error::decode(format!(
      "unsupported socks auth version {}",
      version
    )));
  }
  let len = client.read_u8().await?;
  let mut username = vec![0u8; len as usize];
  client.read_exact(&mut username).await?;
  let len = client.read_u8().await?;
  let mut password = vec![0u8; len as usize];
  client.read_exact(&mut password).await?;
  let username = String::from_utf8_lossy(&username).to_string();
  Ok(Credentials::new(
    Some(username).filter(|u| !u.is_empty()),
    String::from_utf8_lossy(&password),
  ))
}

/// Completes a SOCKS5 `CONNECT` through the tunnel engine.
pub(crate) struct Socks5ConnectHandler {
  client: Option<Connection>,
}

#[async_trait::async_trait]
impl ConnectHandler<Socks5Request> for Socks5ConnectHandler {
  fn server_address(
    &self,
    request: &Socks5Request,
  ) -> std::result::Result<ResolvedAddress, ResolveServerAddressError> {
    if request.address.port() == 0 || request.address.host().is_empty() {
      return Err(ResolveServerAddressError::new(
        request.address.to_string(),
        "incomplete socks5 destination",
      ));
    }
    Ok(request.address.clone())
  }

  fn is_client_active(&self) -> bool {
    self.client.as_ref().is_some_and(Connection::is_active)
  }

  async fn connected(&mut self, upstream: Connection, _request: Socks5Request) -> Result<()> {
    let Some(mut client) = self.client.take() else {
      return Ok(());
    };
    client.write_all(&reply(consts::SOCKS5_REPLY_SUCCEEDED)).await?;
    client.flush().await?;
    relay_ducking(client, upstream).await;
    Ok(())
  }

  async fn fail_connect(&mut self, _request: Socks5Request, _cause: &Error) -> Result<()> {
    if let Some(client) = self.client.as_mut() {
      client
        .write_all(&reply(consts::SOCKS5_REPLY_CONNECTION_REFUSED))
        .await?;
      client.flush().await?;
    }
    Ok(())
  }

  async fn release(&mut self) {
    tunnel::release(self.client.as_mut(), None).await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn replies_use_unspecified_ipv4_bind_address() {
    assert_eq!(reply(0), [5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
    assert_eq!(reply(consts::SOCKS5_REPLY_CONNECTION_REFUSED)[1], 5);
  }

  #[test]
  fn zero_port_is_not_resolvable() {
    let handler = Socks5ConnectHandler { client: None };
    let request = Socks5Request {
      address: ResolvedAddress::new("example.com", 0),
      username: None,
    };
    assert!(handler.server_address(&request).is_err());
    assert!(!handler.is_client_active());
  }
}
