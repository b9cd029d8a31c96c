//! Per-connection state shared with interceptors, and the resume protocol.
use crate::auth::ProxyAuthenticator;
use crate::codec::HttpObject;
use crate::config::ProxyConfig;
use crate::connector::ServerConnector;
use crate::interceptor::InterceptorMatcher;
#[cfg(feature = "tls")]
use crate::mitm::MitmManager;
use crate::pipeline::Pipeline;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Message posted into a connection task by a [`ResumeHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
  Resume(u64),
  Discard(u64),
}

/// Identity of a client connection, as shown to interceptors and connectors.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
  id: u64,
  peer_addr: SocketAddr,
  local_addr: SocketAddr,
  intercepted_host: Option<String>,
}

impl ConnectionInfo {
  pub(crate) fn new(id: u64, peer_addr: SocketAddr, local_addr: SocketAddr) -> Self {
    ConnectionInfo {
      id,
      peer_addr,
      local_addr,
      intercepted_host: None,
    }
  }
  pub(crate) fn intercepting(mut self, host: &str) -> Self {
    self.intercepted_host = Some(host.to_string());
    self
  }
  /// Process-unique connection number.
  pub fn id(&self) -> u64 {
    self.id
  }
  /// Address of the client.
  pub fn peer_addr(&self) -> SocketAddr {
    self.peer_addr
  }
  /// Listening address the client connected to.
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }
  /// Host whose TLS session is being terminated by the proxy, if any.
  pub fn intercepted_host(&self) -> Option<&str> {
    self.intercepted_host.as_deref()
  }
}

impl fmt::Display for ConnectionInfo {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{} {}", self.id, self.peer_addr)?;
    if let Some(host) = &self.intercepted_host {
      write!(f, " ({})", host)?;
    }
    Ok(())
  }
}

/// Continuation for a paused message.
///
/// Obtained from [`InterceptContext::pause`]. It may be moved to any task or thread;
/// resuming posts a message to the owning connection, which then carries on with the
/// next interceptor. Dropping the handle without resuming vetoes the message.
#[derive(Debug)]
pub struct ResumeHandle {
  token: u64,
  sender: UnboundedSender<Signal>,
  done: bool,
}

impl ResumeHandle {
  /// Let the paused message continue.
  pub fn resume(mut self) {
    self.done = true;
    let _ = self.sender.send(Signal::Resume(self.token));
  }
  /// Drop the paused message and discard its body.
  pub fn discard(mut self) {
    self.done = true;
    let _ = self.sender.send(Signal::Discard(self.token));
  }
  /// Token identifying the paused message.
  pub fn token(&self) -> u64 {
    self.token
  }
}

impl Drop for ResumeHandle {
  fn drop(&mut self) {
    if !self.done {
      let _ = self.sender.send(Signal::Discard(self.token));
    }
  }
}

/// What an interceptor can reach while it handles one message.
pub struct InterceptContext<'a, H> {
  info: &'a ConnectionInfo,
  pipeline: &'a mut Pipeline<H>,
  refire: Vec<HttpObject<H>>,
  signals: &'a UnboundedSender<Signal>,
  next_token: &'a mut u64,
  parked: Option<u64>,
}

impl<'a, H> InterceptContext<'a, H> {
  pub(crate) fn new(
    info: &'a ConnectionInfo,
    pipeline: &'a mut Pipeline<H>,
    signals: &'a UnboundedSender<Signal>,
    next_token: &'a mut u64,
  ) -> Self {
    InterceptContext {
      info,
      pipeline,
      refire: Vec::new(),
      signals,
      next_token,
      parked: None,
    }
  }
  /// The client connection this message belongs to.
  pub fn connection(&self) -> &ConnectionInfo {
    self.info
  }
  /// Pipeline of the side this message was read from.
  pub fn pipeline(&mut self) -> &mut Pipeline<H> {
    self.pipeline
  }
  /// Submit `object` again at the top of the pipeline, ahead of anything not yet
  /// processed.
  pub fn refire(&mut self, object: HttpObject<H>) {
    self.refire.push(object);
  }
  /// Park the current message until the returned handle is resumed.
  ///
  /// Only meaningful together with returning [`Flow::Pause`](crate::Flow::Pause). While
  /// parked, nothing more is read from this side of the connection.
  pub fn pause(&mut self) -> ResumeHandle {
    *self.next_token += 1;
    let token = *self.next_token;
    self.parked = Some(token);
    ResumeHandle {
      token,
      sender: self.signals.clone(),
      done: false,
    }
  }
  pub(crate) fn finish(self) -> (Vec<HttpObject<H>>, Option<u64>) {
    (self.refire, self.parked)
  }
}

/// Collaborators shared by every connection of one server.
pub(crate) struct ProxyContext {
  pub(crate) config: ProxyConfig,
  pub(crate) connector: Arc<dyn ServerConnector>,
  pub(crate) authenticator: Option<Arc<dyn ProxyAuthenticator>>,
  pub(crate) interceptors: Option<Arc<dyn InterceptorMatcher>>,
  #[cfg(feature = "tls")]
  pub(crate) mitm: Option<Arc<dyn MitmManager>>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::codec::ResponseHead;
  use tokio::sync::mpsc;

  fn info() -> ConnectionInfo {
    let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
    ConnectionInfo::new(7, addr, addr)
  }

  #[test]
  fn dropped_handle_discards() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let info = info();
    let mut pipeline = Pipeline::<ResponseHead>::new();
    let mut next = 0;
    let mut ctx = InterceptContext::new(&info, &mut pipeline, &tx, &mut next);
    let handle = ctx.pause();
    let (refire, parked) = ctx.finish();
    assert!(refire.is_empty());
    assert_eq!(parked, Some(handle.token()));
    drop(handle);
    assert_eq!(rx.try_recv().unwrap(), Signal::Discard(1));
  }

  #[test]
  fn resume_posts_once() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let info = info();
    let mut pipeline = Pipeline::<ResponseHead>::new();
    let mut next = 41;
    let mut ctx = InterceptContext::new(&info, &mut pipeline, &tx, &mut next);
    let handle = ctx.pause();
    std::thread::spawn(move || handle.resume()).join().unwrap();
    assert_eq!(rx.try_recv().unwrap(), Signal::Resume(42));
    assert!(rx.try_recv().is_err());
  }

  #[test]
  fn display_includes_intercepted_host() {
    let info = info().intercepting("example.com");
    assert_eq!(info.to_string(), "#7 127.0.0.1:1 (example.com)");
    assert_eq!(info.intercepted_host(), Some("example.com"));
  }
}
