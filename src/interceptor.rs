//! Traffic interception interfaces
//!
//! Interceptors run against message heads before they are relayed. For each request the
//! [`InterceptorMatcher`] picks an ordered queue of request interceptors and, separately,
//! an ordered queue of response interceptors for the response that request produces.
//! Queues are drained front to back; an interceptor that returns [`Flow::Pause`] holds
//! the message until it resumes it (see [`InterceptContext::pause`]).
use crate::codec::{HttpMessage, MessageHead, RequestHead, ResponseHead};
use crate::context::InterceptContext;
use crate::errors::Result;
use std::collections::VecDeque;
use std::sync::Arc;

/// Verdict of an interceptor for the message it was shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
  /// Done with this message; hand it to the next interceptor.
  Continue,
  /// Hold the message. Take a [`ResumeHandle`](crate::ResumeHandle) or refire an
  /// object before returning this, otherwise the message is dropped.
  Pause,
}

/// Inspects and rewrites request heads.
pub trait HttpRequestInterceptor: Send + Sync {
  /// Called once per request, in matched order.
  fn pre_handle(
    &self,
    request: &mut RequestHead,
    ctx: &mut InterceptContext<'_, RequestHead>,
  ) -> Result<Flow>;
}

/// Inspects and rewrites responses.
pub trait HttpResponseInterceptor: Send + Sync {
  /// `request` is the head of the request that produced this response, as it was sent
  /// upstream.
  fn pre_handle(
    &self,
    request: &RequestHead,
    response: &mut HttpMessage<ResponseHead>,
    ctx: &mut InterceptContext<'_, ResponseHead>,
  ) -> Result<Flow>;
}

/// Request interceptors matched for one message.
pub type RequestInterceptorQueue = VecDeque<Arc<dyn HttpRequestInterceptor>>;
/// Response interceptors matched for one message.
pub type ResponseInterceptorQueue = VecDeque<Arc<dyn HttpResponseInterceptor>>;

/// Chooses the interceptors that apply to a request.
///
/// Shared by every connection of a server, so implementations must be safe for
/// concurrent use.
pub trait InterceptorMatcher: Send + Sync {
  /// Interceptors for the request itself; `None` when nothing applies.
  fn match_request_interceptors(&self, request: &RequestHead) -> Option<RequestInterceptorQueue>;
  /// Interceptors for the response to `request`; `None` when nothing applies.
  fn match_response_interceptors(&self, request: &RequestHead)
    -> Option<ResponseInterceptorQueue>;
}

type Predicate = Arc<dyn Fn(&RequestHead) -> bool + Send + Sync>;

/// Ready-made [`InterceptorMatcher`]: interceptors in registration order, each optionally
/// guarded by a predicate on the request.
#[derive(Default, Clone)]
pub struct InterceptorManager {
  request: Vec<(Option<Predicate>, Arc<dyn HttpRequestInterceptor>)>,
  response: Vec<(Option<Predicate>, Arc<dyn HttpResponseInterceptor>)>,
}

impl InterceptorManager {
  /// Create an empty manager
  pub fn new() -> Self {
    Self::default()
  }
  /// Run `interceptor` on every request.
  pub fn add_request_interceptor<I>(&mut self, interceptor: I) -> &mut Self
  where
    I: HttpRequestInterceptor + 'static,
  {
    self.request.push((None, Arc::new(interceptor)));
    self
  }
  /// Run `interceptor` on requests accepted by `when`.
  pub fn add_request_interceptor_when<I, P>(&mut self, when: P, interceptor: I) -> &mut Self
  where
    I: HttpRequestInterceptor + 'static,
    P: Fn(&RequestHead) -> bool + Send + Sync + 'static,
  {
    self.request.push((Some(Arc::new(when)), Arc::new(interceptor)));
    self
  }
  /// Run `interceptor` on every response.
  pub fn add_response_interceptor<I>(&mut self, interceptor: I) -> &mut Self
  where
    I: HttpResponseInterceptor + 'static,
  {
    self.response.push((None, Arc::new(interceptor)));
    self
  }
  /// Run `interceptor` on responses to requests accepted by `when`.
  pub fn add_response_interceptor_when<I, P>(&mut self, when: P, interceptor: I) -> &mut Self
  where
    I: HttpResponseInterceptor + 'static,
    P: Fn(&RequestHead) -> bool + Send + Sync + 'static,
  {
    self.response.push((Some(Arc::new(when)), Arc::new(interceptor)));
    self
  }
  /// `true` when nothing is registered
  pub fn is_empty(&self) -> bool {
    self.request.is_empty() && self.response.is_empty()
  }
}

fn select<T: ?Sized>(
  entries: &[(Option<Predicate>, Arc<T>)],
  request: &RequestHead,
) -> Option<VecDeque<Arc<T>>> {
  let queue: VecDeque<Arc<T>> = entries
    .iter()
    .filter(|(when, _)| when.as_ref().map_or(true, |when| when(request)))
    .map(|(_, interceptor)| interceptor.clone())
    .collect();
  if queue.is_empty() {
    None
  } else {
    Some(queue)
  }
}

impl InterceptorMatcher for InterceptorManager {
  fn match_request_interceptors(&self, request: &RequestHead) -> Option<RequestInterceptorQueue> {
    select(&self.request, request)
  }
  fn match_response_interceptors(
    &self,
    request: &RequestHead,
  ) -> Option<ResponseInterceptorQueue> {
    select(&self.response, request)
  }
}

/// Logs every head it sees through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingInterceptor;

impl HttpRequestInterceptor for LoggingInterceptor {
  fn pre_handle(
    &self,
    request: &mut RequestHead,
    ctx: &mut InterceptContext<'_, RequestHead>,
  ) -> Result<Flow> {
    tracing::info!(
      "[MITM] {} Request: {} {}",
      ctx.connection(),
      request.method(),
      request.uri()
    );
    for (name, value) in request.headers() {
      tracing::debug!("  {}: {:?}", name, value);
    }
    Ok(Flow::Continue)
  }
}

impl HttpResponseInterceptor for LoggingInterceptor {
  fn pre_handle(
    &self,
    request: &RequestHead,
    response: &mut HttpMessage<ResponseHead>,
    ctx: &mut InterceptContext<'_, ResponseHead>,
  ) -> Result<Flow> {
    tracing::info!(
      "[MITM] {} Response: {} for {}",
      ctx.connection(),
      response.head().status(),
      request.uri()
    );
    for (name, value) in response.head().headers() {
      tracing::debug!("  {}: {:?}", name, value);
    }
    Ok(Flow::Continue)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use http::{Method, Uri};

  struct Tag;
  impl HttpRequestInterceptor for Tag {
    fn pre_handle(
      &self,
      _request: &mut RequestHead,
      _ctx: &mut InterceptContext<'_, RequestHead>,
    ) -> Result<Flow> {
      Ok(Flow::Continue)
    }
  }

  fn get(uri: &'static str) -> RequestHead {
    RequestHead::new(Method::GET, Uri::from_static(uri))
  }

  #[test]
  fn empty_manager_matches_nothing() {
    let manager = InterceptorManager::new();
    assert!(manager.is_empty());
    assert!(manager
      .match_request_interceptors(&get("http://a.example/"))
      .is_none());
    assert!(manager
      .match_response_interceptors(&get("http://a.example/"))
      .is_none());
  }

  #[test]
  fn predicates_filter_and_order_is_kept() {
    let mut manager = InterceptorManager::new();
    manager
      .add_request_interceptor(LoggingInterceptor)
      .add_request_interceptor_when(|r| r.uri().host() == Some("b.example"), Tag)
      .add_response_interceptor(LoggingInterceptor);
    let a = manager
      .match_request_interceptors(&get("http://a.example/"))
      .unwrap();
    assert_eq!(a.len(), 1);
    let b = manager
      .match_request_interceptors(&get("http://b.example/"))
      .unwrap();
    assert_eq!(b.len(), 2);
    assert!(manager
      .match_response_interceptors(&get("http://a.example/"))
      .is_some());
  }
}
