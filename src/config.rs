//! Proxy configuration
use crate::errors::{Error, Result};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_BIND: ([u8; 4], u16) = ([127, 0, 0, 1], 2228);

/// Validated, immutable settings of a [`ProxyServer`](crate::ProxyServer).
///
/// ```rust
/// # fn run() -> slinger_relay::Result<()> {
/// let config = slinger_relay::ProxyConfig::builder()
///   .bind_address("0.0.0.0:8080".parse().unwrap())
///   .worker_threads(4)
///   .build()?;
/// assert_eq!(config.worker_threads(), 4);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProxyConfig {
  bind_address: SocketAddr,
  acceptor_threads: usize,
  worker_threads: usize,
  max_header_size: usize,
  max_content_length: usize,
  connect_timeout: Duration,
  shutdown_timeout: Duration,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    ProxyConfig {
      bind_address: SocketAddr::from(DEFAULT_BIND),
      acceptor_threads: 1,
      worker_threads: std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1),
      max_header_size: 64 * 1024,
      max_content_length: 8 * 1024 * 1024,
      connect_timeout: Duration::from_secs(10),
      shutdown_timeout: Duration::from_secs(30),
    }
  }
}

impl ProxyConfig {
  /// Start from the defaults.
  pub fn builder() -> ProxyConfigBuilder {
    ProxyConfigBuilder {
      config: ProxyConfig::default(),
    }
  }
  /// Local address to listen on. Port 0 picks a free port.
  pub fn bind_address(&self) -> SocketAddr {
    self.bind_address
  }
  /// Threads accepting connections when the server owns its acceptor pool.
  pub fn acceptor_threads(&self) -> usize {
    self.acceptor_threads
  }
  /// Threads servicing connections when the server owns its worker pool.
  pub fn worker_threads(&self) -> usize {
    self.worker_threads
  }
  /// Largest accepted message head, in bytes.
  pub fn max_header_size(&self) -> usize {
    self.max_header_size
  }
  /// Largest body a full-message adapter built from this configuration buffers.
  pub fn max_content_length(&self) -> usize {
    self.max_content_length
  }
  /// Timeout for opening upstream connections.
  pub fn connect_timeout(&self) -> Duration {
    self.connect_timeout
  }
  /// How long a stop waits for owned pools to drain.
  pub fn shutdown_timeout(&self) -> Duration {
    self.shutdown_timeout
  }
}

/// Builder for [`ProxyConfig`].
#[derive(Debug, Clone)]
pub struct ProxyConfigBuilder {
  config: ProxyConfig,
}

impl ProxyConfigBuilder {
  /// Local address to listen on.
  ///
  /// Default is `127.0.0.1:2228`.
  pub fn bind_address(mut self, value: SocketAddr) -> Self {
    self.config.bind_address = value;
    self
  }
  /// Number of acceptor threads.
  ///
  /// Default is 1.
  pub fn acceptor_threads(mut self, value: usize) -> Self {
    self.config.acceptor_threads = value;
    self
  }
  /// Number of worker threads.
  ///
  /// Default is the available hardware parallelism.
  pub fn worker_threads(mut self, value: usize) -> Self {
    self.config.worker_threads = value;
    self
  }
  /// Largest accepted message head.
  ///
  /// Default is 64 KiB.
  pub fn max_header_size(mut self, value: usize) -> Self {
    self.config.max_header_size = value;
    self
  }
  /// Body bound for full-message adapters.
  ///
  /// Default is 8 MiB.
  pub fn max_content_length(mut self, value: usize) -> Self {
    self.config.max_content_length = value;
    self
  }
  /// Upstream connect timeout.
  ///
  /// Default is 10 seconds.
  pub fn connect_timeout(mut self, value: Duration) -> Self {
    self.config.connect_timeout = value;
    self
  }
  /// Default timeout for a graceful stop.
  ///
  /// Default is 30 seconds.
  pub fn shutdown_timeout(mut self, value: Duration) -> Self {
    self.config.shutdown_timeout = value;
    self
  }
  /// Validate and freeze the configuration.
  pub fn build(self) -> Result<ProxyConfig> {
    let config = self.config;
    let checks = [
      (config.acceptor_threads, "acceptor_threads"),
      (config.worker_threads, "worker_threads"),
      (config.max_header_size, "max_header_size"),
      (config.max_content_length, "max_content_length"),
    ];
    if let Some((_, name)) = checks.iter().find(|(value, _)| *value == 0) {
      return Err(Error::Other(format!("{} must be greater than zero", name)));
    }
    if config.connect_timeout.is_zero() {
      return Err(Error::Other(
        "connect_timeout must be greater than zero".to_string(),
      ));
    }
    Ok(config)
  }
}
