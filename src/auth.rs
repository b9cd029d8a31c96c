//! Proxy authentication
//!
//! Decoding of `Proxy-Authorization` values and the authenticator seam that decides
//! whether a client may use the proxy.
use crate::errors::{Error, Result};
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use http::HeaderValue;
use std::collections::HashMap;
use std::io::Write;

/// Challenge sent to a client that failed proxy authentication. The connection is closed
/// right after it is flushed.
pub(crate) const UNAUTHORIZED_RESPONSE: &[u8] =
  b"HTTP/1.1 407 Unauthorized\r\nProxy-Authenticate: Basic realm=\"Access to the staging site\"\r\n\r\n";

/// Username and password presented by a proxy client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
  username: Option<String>,
  password: String,
}

impl Credentials {
  /// Build credentials by hand.
  pub fn new<P: Into<String>>(username: Option<String>, password: P) -> Self {
    Credentials {
      username,
      password: password.into(),
    }
  }
  /// Decode a `Proxy-Authorization` header value.
  ///
  /// An empty value means the client sent no credentials and yields `Ok(None)`. When the
  /// value contains a space, the token after the first space is decoded, so both
  /// `Basic dXNlcjpwYXNz` and a bare `dXNlcjpwYXNz` are accepted. The decoded text is
  /// split on its first colon; without a colon the whole text is the password.
  ///
  /// ```rust
  /// # use slinger_relay::Credentials;
  /// let credentials = Credentials::decode("Basic YWxpY2U6c2VjcmV0").unwrap().unwrap();
  /// assert_eq!(credentials.username(), Some("alice"));
  /// assert_eq!(credentials.password(), "secret");
  /// ```
  pub fn decode(value: &str) -> Result<Option<Credentials>> {
    let value = value.trim();
    if value.is_empty() {
      return Ok(None);
    }
    let token = match value.split_once(' ') {
      Some((_scheme, token)) => token.trim(),
      None => value,
    };
    let decoded = BASE64_STANDARD
      .decode(token)
      .map_err(|e| Error::Unauthorized(format!("malformed credentials: {}", e)))?;
    let decoded = String::from_utf8(decoded)
      .map_err(|_| Error::Unauthorized("credentials are not valid utf-8".to_string()))?;
    let credentials = match decoded.split_once(':') {
      Some((username, password)) => Credentials::new(Some(username.to_string()), password),
      None => Credentials::new(None, decoded),
    };
    Ok(Some(credentials))
  }
  /// Decode the header straight from a header map entry.
  pub fn from_header(value: Option<&HeaderValue>) -> Result<Option<Credentials>> {
    match value {
      None => Ok(None),
      Some(value) => {
        let value = value
          .to_str()
          .map_err(|_| Error::Unauthorized("credentials are not visible ascii".to_string()))?;
        Credentials::decode(value)
      }
    }
  }
  /// username, absent when the decoded value carried no colon
  pub fn username(&self) -> Option<&str> {
    self.username.as_deref()
  }
  /// password
  pub fn password(&self) -> &str {
    &self.password
  }
}

/// Encode a `Basic` authorization value, the counterpart of [`Credentials::decode`].
pub fn encode_basic_auth<U, P>(username: U, password: Option<P>) -> HeaderValue
where
  U: std::fmt::Display,
  P: std::fmt::Display,
{
  use base64::write::EncoderWriter;

  let mut buf = b"Basic ".to_vec();
  {
    let mut encoder = EncoderWriter::new(&mut buf, &BASE64_STANDARD);
    let _ = write!(encoder, "{}:", username);
    if let Some(password) = password {
      let _ = write!(encoder, "{}", password);
    }
  }
  // base64 output and the `Basic ` prefix are always visible ascii
  let mut header = HeaderValue::from_bytes(&buf).unwrap_or_else(|_| HeaderValue::from_static(""));
  header.set_sensitive(true);
  header
}

/// Decides whether a client may use the proxy.
///
/// Implementations are shared by every connection and must be safe for concurrent use.
/// When no authenticator is configured every client is authorized.
pub trait ProxyAuthenticator: Send + Sync {
  /// `credentials` is `None` for a client that sent no `Proxy-Authorization`.
  fn authenticate(&self, credentials: Option<&Credentials>) -> bool;
}

impl<F> ProxyAuthenticator for F
where
  F: Fn(Option<&Credentials>) -> bool + Send + Sync,
{
  fn authenticate(&self, credentials: Option<&Credentials>) -> bool {
    self(credentials)
  }
}

/// Authenticator backed by a fixed table of users.
#[derive(Clone, Debug, Default)]
pub struct BasicAuthenticator {
  users: HashMap<String, String>,
}

impl BasicAuthenticator {
  /// An authenticator that knows no users and rejects everyone.
  pub fn new() -> Self {
    Self::default()
  }
  /// Allow `username` with `password`.
  pub fn user<U: Into<String>, P: Into<String>>(mut self, username: U, password: P) -> Self {
    self.users.insert(username.into(), password.into());
    self
  }
}

impl ProxyAuthenticator for BasicAuthenticator {
  fn authenticate(&self, credentials: Option<&Credentials>) -> bool {
    let Some(credentials) = credentials else {
      return false;
    };
    match credentials.username() {
      Some(username) => self
        .users
        .get(username)
        .is_some_and(|password| password == credentials.password()),
      None => false,
    }
  }
}

/// Outcome of checking a request against the configured authenticator.
pub(crate) fn authorize(
  authenticator: Option<&dyn ProxyAuthenticator>,
  header: Option<&HeaderValue>,
) -> Result<()> {
  let Some(authenticator) = authenticator else {
    return Ok(());
  };
  let credentials = Credentials::from_header(header)?;
  if authenticator.authenticate(credentials.as_ref()) {
    Ok(())
  } else {
    Err(Error::Unauthorized(match credentials.and_then(|c| c.username) {
      Some(username) => format!("rejected user `{}`", username),
      None => "rejected anonymous client".to_string(),
    }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn basic(raw: &str) -> String {
    format!("Basic {}", BASE64_STANDARD.encode(raw))
  }

  #[test]
  fn decode_username_and_password() {
    let credentials = Credentials::decode(&basic("alice:secret")).unwrap().unwrap();
    assert_eq!(credentials.username(), Some("alice"));
    assert_eq!(credentials.password(), "secret");
  }

  #[test]
  fn decode_password_only() {
    let credentials = Credentials::decode(&basic("justpassword")).unwrap().unwrap();
    assert_eq!(credentials.username(), None);
    assert_eq!(credentials.password(), "justpassword");
  }

  #[test]
  fn decode_splits_on_first_colon() {
    let credentials = Credentials::decode(&basic("bob:pa:ss")).unwrap().unwrap();
    assert_eq!(credentials.username(), Some("bob"));
    assert_eq!(credentials.password(), "pa:ss");
  }

  #[test]
  fn decode_without_scheme_prefix() {
    let token = BASE64_STANDARD.encode("alice:secret");
    let credentials = Credentials::decode(&token).unwrap().unwrap();
    assert_eq!(credentials.username(), Some("alice"));
  }

  #[test]
  fn decode_empty_is_anonymous() {
    assert_eq!(Credentials::decode("").unwrap(), None);
    assert_eq!(Credentials::from_header(None).unwrap(), None);
  }

  #[test]
  fn decode_malformed_is_unauthorized() {
    let err = Credentials::decode("Basic %%%not-base64%%%").unwrap_err();
    assert!(err.is_unauthorized(), "unexpected error {:?}", err);
  }

  #[test]
  fn encode_round_trips_through_decode() {
    let header = encode_basic_auth("carol", Some("hunter2"));
    assert!(header.is_sensitive());
    let credentials = Credentials::from_header(Some(&header)).unwrap().unwrap();
    assert_eq!(credentials, Credentials::new(Some("carol".to_string()), "hunter2"));
  }

  #[test]
  fn basic_authenticator_checks_table() {
    let authenticator = BasicAuthenticator::new().user("alice", "secret");
    let good = Credentials::decode(&basic("alice:secret")).unwrap();
    let bad = Credentials::decode(&basic("alice:wrong")).unwrap();
    let nameless = Credentials::decode(&basic("secret")).unwrap();
    assert!(authenticator.authenticate(good.as_ref()));
    assert!(!authenticator.authenticate(bad.as_ref()));
    assert!(!authenticator.authenticate(nameless.as_ref()));
    assert!(!authenticator.authenticate(None));
  }

  #[test]
  fn authorize_without_authenticator_allows_everyone() {
    assert!(authorize(None, None).is_ok());
  }

  #[test]
  fn authorize_rejects_malformed_header() {
    let authenticator = |_: Option<&Credentials>| true;
    let header = HeaderValue::from_static("Basic !!!");
    let err = authorize(Some(&authenticator), Some(&header)).unwrap_err();
    assert!(err.is_unauthorized());
  }
}
