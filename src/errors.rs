//! relay error
use std::io::ErrorKind;
use std::num::ParseIntError;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `slinger_relay::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while relaying a connection.
#[derive(ThisError, Debug)]
pub enum Error {
  #[error(transparent)]
  #[cfg(feature = "tls")]
  /// tls Error
  Tls(#[from] tokio_rustls::rustls::Error),
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// ParseIntError
  #[error(transparent)]
  IntError(#[from] ParseIntError),
  /// Upstream SOCKS5 proxy ReplyError
  #[error(transparent)]
  ReplyError(#[from] ReplyError),
  /// The target address could not be derived from the request
  #[error(transparent)]
  ResolveServerAddress(#[from] ResolveServerAddressError),
  /// The upstream connection could not be opened
  #[error("unable to connect to {target}: {source}")]
  Connect {
    /// `host:port` of the remote server
    target: String,
    /// underlying cause
    #[source]
    source: Box<Error>,
  },
  /// Malformed inbound protocol data
  #[error("decode error: {0}")]
  Decode(String),
  /// Proxy authentication failed or the credentials were unreadable
  #[error("unauthorized: {0}")]
  Unauthorized(String),
  /// A buffered message body grew past its configured bound
  #[error("content length exceeds {max} bytes")]
  TooLongContent {
    /// configured maximum
    max: usize,
  },
  /// An interceptor failed while handling a message
  #[error("interceptor error: {0}")]
  Interceptor(String),
  /// Unknown Error
  #[error("{0}")]
  Other(String),
}

/// Resolution of a target address from an inbound request failed.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
#[error("unable to resolve server address from `{target}`: {reason}")]
pub struct ResolveServerAddressError {
  target: String,
  reason: &'static str,
}

impl ResolveServerAddressError {
  pub(crate) fn new<T: Into<String>>(target: T, reason: &'static str) -> Self {
    ResolveServerAddressError {
      target: target.into(),
      reason,
    }
  }
  /// The request target that failed to resolve
  pub fn target(&self) -> &str {
    &self.target
  }
}

/// Reply code of a SOCKS5 server, RFC 1928 section 6.
#[derive(ThisError, Debug)]
pub enum ReplyError {
  #[error("Succeeded")]
  /// request granted
  Succeeded,
  #[error("General failure")]
  /// general SOCKS server failure
  GeneralFailure,
  #[error("Connection not allowed by ruleset")]
  /// connection not allowed by ruleset
  ConnectionNotAllowed,
  #[error("Network unreachable")]
  /// network unreachable
  NetworkUnreachable,
  #[error("Host unreachable")]
  /// host unreachable
  HostUnreachable,
  #[error("Connection refused")]
  /// connection refused
  ConnectionRefused,
  #[error("TTL expired")]
  /// TTL expired
  TtlExpired,
  #[error("Command not supported")]
  /// command not supported
  CommandNotSupported,
  #[error("Address type not supported")]
  /// address type not supported
  AddressTypeNotSupported,
  #[error("Unknown reply {0:#04x}")]
  /// a reply code outside RFC 1928
  Unknown(u8),
}

impl Error {
  /// Returns true if the error came from a body that outgrew its aggregation bound.
  pub fn is_too_long_content(&self) -> bool {
    matches!(self, Error::TooLongContent { .. })
  }
  /// Returns true if the error is a protocol decode failure.
  pub fn is_decode(&self) -> bool {
    matches!(self, Error::Decode(_))
  }
  /// Returns true if the error is an authentication failure.
  pub fn is_unauthorized(&self) -> bool {
    matches!(self, Error::Unauthorized(_))
  }
  /// Returns true if the upstream connection could not be opened.
  pub fn is_connect(&self) -> bool {
    matches!(self, Error::Connect { .. })
  }
  pub(crate) fn connect<T: Into<String>>(target: T, source: Error) -> Self {
    Error::Connect {
      target: target.into(),
      source: Box::new(source),
    }
  }
  pub(crate) fn decode<M: Into<String>>(msg: M) -> Self {
    Error::Decode(msg.into())
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}
#[cfg(feature = "tls")]
pub(crate) fn builder<E: Into<Box<dyn std::error::Error + Send + Sync>>>(e: E) -> Error {
  Error::Other(e.into().to_string())
}
