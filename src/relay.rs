//! Relay and interception engine for one client connection.
//!
//! Requests read from the client are decoded, run through the request pipeline and
//! the matched request interceptors, and forwarded to the upstream server for their
//! authority. Responses come back through the upstream pipeline and the response
//! interceptors picked for the request that produced them. Responses are paired with
//! requests in order, so pipelined requests work.
use crate::auth::{authorize, UNAUTHORIZED_RESPONSE};
use crate::codec::{
  Decoder, Encoder, HttpMessage, HttpObject, MessageHead, RequestHead, ResponseHead,
};
use crate::connection::Connection;
use crate::connector::ResolvedAddress;
use crate::context::{ConnectionInfo, InterceptContext, ProxyContext, Signal};
use crate::errors::{Error, ResolveServerAddressError, Result};
use crate::interceptor::{
  Flow, HttpRequestInterceptor, HttpResponseInterceptor, RequestInterceptorQueue,
  ResponseInterceptorQueue,
};
use crate::pipeline::Pipeline;
use crate::tunnel::{self, ConnectHandler, HttpTunnelHandler, BAD_GATEWAY};
use bytes::BytesMut;
use http::header::{HeaderValue, HOST, PROXY_AUTHORIZATION};
use http::{StatusCode, Uri};
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

const READ_CHUNK: usize = 8 * 1024;
const PROXY_CONNECTION: &str = "proxy-connection";

/// A forwarded request waiting for, or receiving, its response.
struct Exchange {
  request: RequestHead,
  interceptors: Option<ResponseInterceptorQueue>,
}

struct Upstream {
  conn: Connection,
  authority: String,
  buf: BytesMut,
  decoder: Decoder<ResponseHead>,
  pipeline: Pipeline<ResponseHead>,
  ready: VecDeque<HttpObject<ResponseHead>>,
  eof: bool,
  close_client: bool,
}

impl Upstream {
  fn new(conn: Connection, authority: String, max_header_size: usize) -> Self {
    Upstream {
      conn,
      authority,
      buf: BytesMut::with_capacity(READ_CHUNK),
      decoder: Decoder::new(max_header_size),
      pipeline: Pipeline::new(),
      ready: VecDeque::new(),
      eof: false,
      close_client: false,
    }
  }
}

#[derive(Debug)]
enum Exit {
  Closed,
  Tunnel(RequestHead),
}

enum Event {
  Client(usize),
  Upstream(usize),
  Signal(Signal),
  Idle,
}

enum Drained<H> {
  Forward,
  Parked(u64),
  Refired(Vec<HttpObject<H>>),
  Vetoed,
}

/// State of one client connection while it speaks HTTP.
pub(crate) struct ClientRelay {
  shared: Arc<ProxyContext>,
  info: ConnectionInfo,
  client: Connection,
  client_buf: BytesMut,
  client_eof: bool,
  request_decoder: Decoder<RequestHead>,
  request_pipeline: Pipeline<RequestHead>,
  request_ready: VecDeque<HttpObject<RequestHead>>,
  request_encoder: Encoder,
  request_interceptors: Option<RequestInterceptorQueue>,
  request_matched: bool,
  parked_request: Option<(u64, HttpMessage<RequestHead>)>,
  held_request: Option<HttpMessage<RequestHead>>,
  discard_request_body: bool,
  upstream: Option<Upstream>,
  fixed_upstream: bool,
  authenticate: bool,
  response_encoder: Encoder,
  exchanges: VecDeque<Exchange>,
  current: Option<Exchange>,
  parked_response: Option<(u64, HttpMessage<ResponseHead>)>,
  discard_response_body: bool,
  signals: UnboundedSender<Signal>,
  signal_rx: UnboundedReceiver<Signal>,
  next_token: u64,
}

impl ClientRelay {
  /// Relay for a freshly accepted client speaking proxy HTTP.
  pub(crate) fn new(shared: Arc<ProxyContext>, info: ConnectionInfo, client: Connection) -> Self {
    let (signals, signal_rx) = mpsc::unbounded_channel();
    let max_header_size = shared.config.max_header_size();
    ClientRelay {
      shared,
      info,
      client,
      client_buf: BytesMut::with_capacity(READ_CHUNK),
      client_eof: false,
      request_decoder: Decoder::new(max_header_size),
      request_pipeline: Pipeline::new(),
      request_ready: VecDeque::new(),
      request_encoder: Encoder::default(),
      request_interceptors: None,
      request_matched: false,
      parked_request: None,
      held_request: None,
      discard_request_body: false,
      upstream: None,
      fixed_upstream: false,
      authenticate: true,
      response_encoder: Encoder::default(),
      exchanges: VecDeque::new(),
      current: None,
      parked_response: None,
      discard_response_body: false,
      signals,
      signal_rx,
      next_token: 0,
    }
  }

  /// Relay over a terminated TLS tunnel: every request goes to `upstream`, and the
  /// client already authenticated on the outer connection.
  pub(crate) fn intercepted(
    shared: Arc<ProxyContext>,
    info: ConnectionInfo,
    client: Connection,
    upstream: Connection,
    address: ResolvedAddress,
  ) -> Self {
    let max_header_size = shared.config.max_header_size();
    let mut relay = ClientRelay::new(shared, info, client);
    relay.upstream = Some(Upstream::new(
      upstream,
      address.to_string(),
      max_header_size,
    ));
    relay.fixed_upstream = true;
    relay.authenticate = false;
    relay
  }

  /// Serve the connection until it closes or turns into a tunnel. An intercepted
  /// tunnel hands back the relay that continues on the decrypted streams.
  pub(crate) async fn run(mut self) -> Option<ClientRelay> {
    match self.drive().await {
      Ok(Exit::Closed) => {
        self.close().await;
        None
      }
      Ok(Exit::Tunnel(head)) => self.tunnel(head).await,
      Err(e) => {
        report(&self.info, &e);
        self.close().await;
        None
      }
    }
  }

  async fn close(&mut self) {
    let upstream = self.upstream.as_mut().map(|upstream| &mut upstream.conn);
    tunnel::release(Some(&mut self.client), upstream).await;
  }

  async fn tunnel(mut self, head: RequestHead) -> Option<ClientRelay> {
    if let Some(mut upstream) = self.upstream.take() {
      upstream.conn.close_on_flush().await;
    }
    let mut early_data = BytesMut::new();
    for object in self.request_ready.drain(..) {
      if let HttpObject::Unknown(data) = object {
        early_data.extend_from_slice(&data);
      }
    }
    early_data.extend_from_slice(&self.client_buf);
    let ClientRelay {
      shared,
      info,
      client,
      ..
    } = self;
    tracing::debug!("{} CONNECT {}", info, head.uri());
    let mut handler =
      HttpTunnelHandler::new(shared.clone(), info.clone(), client, early_data.freeze());
    match tunnel::establish(&mut handler, shared.connector.as_ref(), &info, head).await {
      Ok(()) => handler.into_next(),
      Err(e) => {
        report(&info, &e);
        None
      }
    }
  }

  async fn drive(&mut self) -> Result<Exit> {
    loop {
      self.pump_responses().await?;
      if let Some(exit) = self.pump_requests().await? {
        return Ok(exit);
      }
      if let Some(exit) = self.settle().await {
        return Ok(exit);
      }
      match self.next_event().await? {
        Event::Signal(signal) => {
          if let Some(exit) = self.on_signal(signal).await? {
            return Ok(exit);
          }
        }
        Event::Client(0) => {
          self.client_eof = true;
          if let Some(object) = self.request_decoder.decode_eof(&mut self.client_buf)? {
            let fired = self.request_pipeline.fire(object)?;
            self.request_ready.extend(fired);
          }
        }
        Event::Upstream(0) => self.upstream_closed()?,
        Event::Client(_) | Event::Upstream(_) => {}
        Event::Idle => return Ok(Exit::Closed),
      }
    }
  }

  async fn next_event(&mut self) -> Result<Event> {
    let read_client =
      !self.client_eof && self.parked_request.is_none() && self.held_request.is_none();
    let read_upstream = self.parked_response.is_none()
      && self.upstream.as_ref().is_some_and(|upstream| !upstream.eof);
    self.client_buf.reserve(READ_CHUNK);
    let client = &mut self.client;
    let client_buf = &mut self.client_buf;
    let signal_rx = &mut self.signal_rx;
    let upstream = self.upstream.as_mut();
    let upstream_read = async move {
      match upstream {
        Some(upstream) => {
          upstream.buf.reserve(READ_CHUNK);
          upstream.conn.read_buf(&mut upstream.buf).await
        }
        None => std::future::pending().await,
      }
    };
    tokio::select! {
      signal = signal_rx.recv() => Ok(signal.map_or(Event::Idle, Event::Signal)),
      read = client.read_buf(client_buf), if read_client => Ok(Event::Client(read?)),
      read = upstream_read, if read_upstream => Ok(Event::Upstream(read?)),
    }
  }

  fn upstream_closed(&mut self) -> Result<()> {
    let pending = self.current.is_some() || !self.exchanges.is_empty();
    let fixed = self.fixed_upstream;
    let Some(upstream) = self.upstream.as_mut() else {
      return Ok(());
    };
    upstream.eof = true;
    upstream.close_client =
      fixed || pending || upstream.decoder.in_message() || upstream.decoder.is_upgraded();
    if let Some(object) = upstream.decoder.decode_eof(&mut upstream.buf)? {
      let fired = upstream.pipeline.fire(object)?;
      upstream.ready.extend(fired);
    }
    Ok(())
  }

  /// Decide whether the connection is finished once everything readable is handled.
  async fn settle(&mut self) -> Option<Exit> {
    if let Some(upstream) = self.upstream.as_ref() {
      if upstream.eof && upstream.ready.is_empty() && self.parked_response.is_none() {
        if upstream.close_client {
          tracing::debug!("{} upstream {} closed", self.info, upstream.authority);
          return Some(Exit::Closed);
        }
        if let Some(mut upstream) = self.upstream.take() {
          upstream.conn.close_on_flush().await;
        }
      }
    }
    if self.client_eof {
      if self.request_decoder.is_upgraded() {
        return Some(Exit::Closed);
      }
      let idle = self.parked_request.is_none()
        && self.held_request.is_none()
        && self.request_ready.is_empty()
        && self.parked_response.is_none()
        && self.current.is_none()
        && self.exchanges.is_empty();
      if idle {
        return Some(Exit::Closed);
      }
    }
    None
  }

  async fn on_signal(&mut self, signal: Signal) -> Result<Option<Exit>> {
    match signal {
      Signal::Resume(token) => {
        if let Some(message) = take_parked(&mut self.parked_request, token) {
          if let Some(queue) = self.request_interceptors.as_mut() {
            queue.pop_front();
          }
          return self.intercept_request(message).await;
        }
        if let Some(message) = take_parked(&mut self.parked_response, token) {
          if let Some(queue) = self
            .current
            .as_mut()
            .and_then(|exchange| exchange.interceptors.as_mut())
          {
            queue.pop_front();
          }
          self.intercept_response(message).await?;
        }
      }
      Signal::Discard(token) => {
        if let Some(message) = take_parked(&mut self.parked_request, token) {
          tracing::debug!("{} request {} discarded", self.info, message.head().uri());
          self.reset_request();
          self.discard_request_body = !message.is_full();
        } else if let Some(message) = take_parked(&mut self.parked_response, token) {
          tracing::debug!("{} response {} discarded", self.info, message.head().status());
          self.veto_response(&message);
        }
      }
    }
    Ok(None)
  }

  async fn pump_requests(&mut self) -> Result<Option<Exit>> {
    if self.held_request.is_some() {
      if self.has_pending_responses() {
        return Ok(None);
      }
      if let Some(message) = self.held_request.take() {
        if let Some(exit) = self.forward_request(message).await? {
          return Ok(Some(exit));
        }
      }
    }
    loop {
      if self.parked_request.is_some() {
        return Ok(None);
      }
      let object = match self.request_ready.pop_front() {
        Some(object) => object,
        None => match self.request_decoder.decode(&mut self.client_buf)? {
          Some(object) => {
            let fired = self.request_pipeline.fire(object)?;
            self.request_ready.extend(fired);
            continue;
          }
          None => return Ok(None),
        },
      };
      let exit = match object {
        HttpObject::Head(head) => self.on_request(HttpMessage::Head(head)).await?,
        HttpObject::Full(full) => self.on_request(HttpMessage::Full(full)).await?,
        HttpObject::Content(data) => {
          if !self.discard_request_body {
            self.send_upstream(HttpObject::Content(data)).await?;
          }
          None
        }
        HttpObject::Last(last) => {
          if !std::mem::take(&mut self.discard_request_body) {
            self.send_upstream(HttpObject::Last(last)).await?;
          }
          None
        }
        HttpObject::Unknown(data) => {
          self.send_upstream(HttpObject::Unknown(data)).await?;
          None
        }
      };
      if exit.is_some() {
        return Ok(exit);
      }
    }
  }

  async fn on_request(&mut self, message: HttpMessage<RequestHead>) -> Result<Option<Exit>> {
    if !self.request_matched {
      if self.authenticate {
        let header = message.head().headers().get(PROXY_AUTHORIZATION);
        if let Err(e) = authorize(self.shared.authenticator.as_deref(), header) {
          tracing::info!("{} {}", self.info, e);
          self.client.write_all(UNAUTHORIZED_RESPONSE).await?;
          self.client.flush().await?;
          return Ok(Some(Exit::Closed));
        }
      }
      tracing::debug!(
        "{} {} {}",
        self.info,
        message.head().method(),
        message.head().uri()
      );
      self.request_matched = true;
      self.request_interceptors = self
        .shared
        .interceptors
        .as_ref()
        .and_then(|matcher| matcher.match_request_interceptors(message.head()));
    }
    self.intercept_request(message).await
  }

  async fn intercept_request(
    &mut self,
    mut message: HttpMessage<RequestHead>,
  ) -> Result<Option<Exit>> {
    let drained = match self.request_interceptors.as_mut() {
      None => Drained::Forward,
      Some(queue) => drain(
        queue,
        &self.info,
        &mut self.request_pipeline,
        &self.signals,
        &mut self.next_token,
        |interceptor, ctx| interceptor.pre_handle(message.head_mut(), ctx),
      )?,
    };
    match drained {
      Drained::Forward => {
        self.reset_request();
        self.forward_request(message).await
      }
      Drained::Parked(token) => {
        self.parked_request = Some((token, message));
        Ok(None)
      }
      Drained::Refired(objects) => {
        refire(&mut self.request_pipeline, &mut self.request_ready, objects)?;
        Ok(None)
      }
      Drained::Vetoed => {
        tracing::debug!("{} request {} vetoed", self.info, message.head().uri());
        self.reset_request();
        self.discard_request_body = !message.is_full();
        Ok(None)
      }
    }
  }

  fn reset_request(&mut self) {
    self.request_interceptors = None;
    self.request_matched = false;
  }

  fn has_pending_responses(&self) -> bool {
    self.current.is_some() || !self.exchanges.is_empty()
  }

  /// `true` when `head` cannot go over the current upstream connection.
  fn leaves_upstream(&self, head: &RequestHead) -> bool {
    if head.is_connect() {
      return true;
    }
    let authority = head.authority().unwrap_or_default();
    self
      .upstream
      .as_ref()
      .map_or(true, |upstream| {
        upstream.eof || !upstream.authority.eq_ignore_ascii_case(&authority)
      })
  }

  async fn forward_request(
    &mut self,
    mut message: HttpMessage<RequestHead>,
  ) -> Result<Option<Exit>> {
    // A new upstream is opened only after every earlier response went out in full.
    if !self.fixed_upstream && self.has_pending_responses() && self.leaves_upstream(message.head())
    {
      tracing::debug!(
        "{} holding {} until pending responses complete",
        self.info,
        message.head().uri()
      );
      self.held_request = Some(message);
      return Ok(None);
    }
    if message.head().is_connect() && !self.fixed_upstream {
      let head = match message {
        HttpMessage::Head(head) => head,
        HttpMessage::Full(full) => full.into_parts().0,
      };
      return Ok(Some(Exit::Tunnel(head)));
    }
    if !self.fixed_upstream && !self.ensure_upstream(message.head()).await? {
      return Ok(Some(Exit::Closed));
    }
    let interceptors = self
      .shared
      .interceptors
      .as_ref()
      .and_then(|matcher| matcher.match_response_interceptors(message.head()));
    self.exchanges.push_back(Exchange {
      request: message.head().clone(),
      interceptors,
    });
    let head = message.head_mut();
    if !self.fixed_upstream {
      to_origin_form(head)?;
    }
    head.headers_mut().remove(PROXY_AUTHORIZATION);
    head.headers_mut().remove(PROXY_CONNECTION);
    let method = head.method().clone();
    let Some(upstream) = self.upstream.as_mut() else {
      return Ok(Some(Exit::Closed));
    };
    upstream.decoder.push_request_method(method);
    self.send_upstream(message.into_object()).await?;
    Ok(None)
  }

  /// Make sure an upstream connection to the authority of `head` is open. `false`
  /// means the connection is finished: the target was unusable or the client left.
  async fn ensure_upstream(&mut self, head: &RequestHead) -> Result<bool> {
    let authority = head.authority().unwrap_or_default();
    if let Some(upstream) = self.upstream.as_ref() {
      if !upstream.eof && upstream.authority.eq_ignore_ascii_case(&authority) {
        return Ok(true);
      }
    }
    if let Some(mut previous) = self.upstream.take() {
      previous.conn.close_on_flush().await;
    }
    let mut handler = ForwardHandler {
      client: &mut self.client,
      upstream: None,
    };
    let established = tunnel::establish(
      &mut handler,
      self.shared.connector.as_ref(),
      &self.info,
      head.clone(),
    )
    .await;
    match (established, handler.upstream) {
      (Ok(()), Some(conn)) => {
        self.upstream = Some(Upstream::new(
          conn,
          authority,
          self.shared.config.max_header_size(),
        ));
        Ok(true)
      }
      (Ok(()), None) => Ok(false),
      (Err(e), _) => {
        report(&self.info, &e);
        Ok(false)
      }
    }
  }

  async fn send_upstream(&mut self, object: HttpObject<RequestHead>) -> Result<()> {
    let Some(upstream) = self.upstream.as_mut() else {
      return Ok(());
    };
    let mut out = BytesMut::new();
    self.request_encoder.encode(object, &mut out);
    upstream.conn.write_all(&out).await?;
    upstream.conn.flush().await?;
    Ok(())
  }

  async fn send_client(&mut self, object: HttpObject<ResponseHead>) -> Result<()> {
    let mut out = BytesMut::new();
    self.response_encoder.encode(object, &mut out);
    self.client.write_all(&out).await?;
    self.client.flush().await?;
    Ok(())
  }

  async fn pump_responses(&mut self) -> Result<()> {
    loop {
      if self.parked_response.is_some() {
        return Ok(());
      }
      let Some(upstream) = self.upstream.as_mut() else {
        return Ok(());
      };
      let object = match upstream.ready.pop_front() {
        Some(object) => object,
        None => match upstream.decoder.decode(&mut upstream.buf)? {
          Some(object) => {
            let fired = upstream.pipeline.fire(object)?;
            upstream.ready.extend(fired);
            continue;
          }
          None => return Ok(()),
        },
      };
      match object {
        HttpObject::Head(head)
          if head.status().is_informational() && head.status() != StatusCode::SWITCHING_PROTOCOLS =>
        {
          self.send_client(HttpObject::Head(head)).await?
        }
        HttpObject::Head(head) => self.on_response(HttpMessage::Head(head)).await?,
        HttpObject::Full(full) => self.on_response(HttpMessage::Full(full)).await?,
        HttpObject::Content(data) => {
          if !self.discard_response_body {
            self.send_client(HttpObject::Content(data)).await?;
          }
        }
        HttpObject::Last(last) => {
          self.current = None;
          if !std::mem::take(&mut self.discard_response_body) {
            self.send_client(HttpObject::Last(last)).await?;
          }
        }
        HttpObject::Unknown(data) => self.send_client(HttpObject::Unknown(data)).await?,
      }
    }
  }

  async fn on_response(&mut self, message: HttpMessage<ResponseHead>) -> Result<()> {
    if self.current.is_none() {
      let Some(exchange) = self.exchanges.pop_front() else {
        return Err(Error::decode("response without a pending request"));
      };
      self.current = Some(exchange);
    }
    self.intercept_response(message).await
  }

  async fn intercept_response(&mut self, mut message: HttpMessage<ResponseHead>) -> Result<()> {
    let (Some(upstream), Some(exchange)) = (self.upstream.as_mut(), self.current.as_mut()) else {
      return Ok(());
    };
    let drained = match exchange.interceptors.as_mut() {
      None => Drained::Forward,
      Some(queue) => {
        let request = &exchange.request;
        drain(
          queue,
          &self.info,
          &mut upstream.pipeline,
          &self.signals,
          &mut self.next_token,
          |interceptor, ctx| interceptor.pre_handle(request, &mut message, ctx),
        )?
      }
    };
    match drained {
      Drained::Forward => {
        let complete = message.is_full();
        let switching = message.head().status() == StatusCode::SWITCHING_PROTOCOLS;
        self.send_client(message.into_object()).await?;
        if switching {
          self.request_decoder.upgrade();
        }
        if complete {
          self.current = None;
        }
      }
      Drained::Parked(token) => self.parked_response = Some((token, message)),
      Drained::Refired(objects) => {
        if let Some(upstream) = self.upstream.as_mut() {
          refire(&mut upstream.pipeline, &mut upstream.ready, objects)?;
        }
      }
      Drained::Vetoed => {
        tracing::debug!("{} response {} vetoed", self.info, message.head().status());
        self.veto_response(&message);
      }
    }
    Ok(())
  }

  fn veto_response(&mut self, message: &HttpMessage<ResponseHead>) {
    if message.is_full() {
      self.current = None;
    } else {
      self.discard_response_body = true;
    }
  }
}

/// Run `queue` front to back over one message. An interceptor is removed from the
/// queue only once it lets the message continue.
fn drain<I, H>(
  queue: &mut VecDeque<Arc<I>>,
  info: &ConnectionInfo,
  pipeline: &mut Pipeline<H>,
  signals: &UnboundedSender<Signal>,
  next_token: &mut u64,
  mut call: impl FnMut(&I, &mut InterceptContext<'_, H>) -> Result<Flow>,
) -> Result<Drained<H>>
where
  I: ?Sized,
{
  while let Some(interceptor) = queue.front().cloned() {
    let mut ctx = InterceptContext::new(info, pipeline, signals, next_token);
    let flow = call(&*interceptor, &mut ctx).map_err(|e| match e {
      Error::Interceptor(_) => e,
      other => Error::Interceptor(other.to_string()),
    })?;
    let (refired, parked) = ctx.finish();
    match flow {
      Flow::Continue => {
        queue.pop_front();
      }
      Flow::Pause => {
        if let Some(token) = parked {
          return Ok(Drained::Parked(token));
        }
        if !refired.is_empty() {
          return Ok(Drained::Refired(refired));
        }
        queue.clear();
        return Ok(Drained::Vetoed);
      }
    }
  }
  Ok(Drained::Forward)
}

/// Push `objects` through `pipeline` ahead of everything already waiting.
fn refire<H>(
  pipeline: &mut Pipeline<H>,
  ready: &mut VecDeque<HttpObject<H>>,
  objects: Vec<HttpObject<H>>,
) -> Result<()> {
  let mut fired = Vec::new();
  for object in objects {
    fired.extend(pipeline.fire(object)?);
  }
  for object in fired.into_iter().rev() {
    ready.push_front(object);
  }
  Ok(())
}

fn take_parked<H>(slot: &mut Option<(u64, HttpMessage<H>)>, token: u64) -> Option<HttpMessage<H>> {
  if slot.as_ref().is_some_and(|(parked, _)| *parked == token) {
    slot.take().map(|(_, message)| message)
  } else {
    None
  }
}

/// Rewrite an absolute-form target to origin form, keeping the authority in `Host`.
fn to_origin_form(head: &mut RequestHead) -> Result<()> {
  if head.uri().authority().is_none() {
    return Ok(());
  }
  if !head.headers().contains_key(HOST) {
    if let Some(authority) = head.authority() {
      let value = HeaderValue::from_str(&authority)?;
      head.headers_mut().insert(HOST, value);
    }
  }
  let path = head
    .uri()
    .path_and_query()
    .map_or("/", |path| path.as_str())
    .to_string();
  *head.uri_mut() = Uri::try_from(path)?;
  Ok(())
}

/// Log a connection-ending error at a level matching its cause.
pub(crate) fn report(info: &ConnectionInfo, err: &Error) {
  match err {
    Error::TooLongContent { max } => {
      tracing::error!("{} aggregated body exceeds {} bytes, releasing connection", info, max)
    }
    Error::Connect { .. } | Error::ResolveServerAddress(_) => tracing::debug!("{} {}", info, err),
    Error::IO(e)
      if matches!(
        e.kind(),
        ErrorKind::ConnectionReset
          | ErrorKind::ConnectionAborted
          | ErrorKind::BrokenPipe
          | ErrorKind::UnexpectedEof
      ) =>
    {
      tracing::debug!("{} connection lost: {}", info, e)
    }
    _ => tracing::error!("{} {}", info, err),
  }
}

/// Opens the upstream connection for a plain forwarded request.
struct ForwardHandler<'a> {
  client: &'a mut Connection,
  upstream: Option<Connection>,
}

#[async_trait::async_trait]
impl<'a> ConnectHandler<RequestHead> for ForwardHandler<'a> {
  fn server_address(
    &self,
    request: &RequestHead,
  ) -> std::result::Result<ResolvedAddress, ResolveServerAddressError> {
    let authority = request
      .authority()
      .ok_or_else(|| ResolveServerAddressError::new(request.uri().to_string(), "no authority"))?;
    let default_port = match request.uri().scheme_str() {
      Some("https") => 443,
      _ => 80,
    };
    ResolvedAddress::parse_authority(&authority, default_port)
  }

  fn is_client_active(&self) -> bool {
    self.client.is_active()
  }

  async fn connected(&mut self, upstream: Connection, _request: RequestHead) -> Result<()> {
    self.upstream = Some(upstream);
    Ok(())
  }

  async fn fail_connect(&mut self, _request: RequestHead, _cause: &Error) -> Result<()> {
    self.client.write_all(BAD_GATEWAY).await?;
    self.client.flush().await?;
    Ok(())
  }

  async fn release(&mut self) {
    self.client.close_on_flush().await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use http::Method;

  #[test]
  fn origin_form_keeps_authority_in_host() {
    let mut head = RequestHead::new(
      Method::GET,
      Uri::from_static("http://example.com:8080/a/b?c=d"),
    );
    to_origin_form(&mut head).unwrap();
    assert_eq!(head.uri(), "/a/b?c=d");
    assert_eq!(head.headers()[HOST], "example.com:8080");
  }

  #[test]
  fn origin_form_leaves_existing_host() {
    let mut head = RequestHead::new(Method::GET, Uri::from_static("http://example.com"));
    head
      .headers_mut()
      .insert(HOST, HeaderValue::from_static("virtual.example"));
    to_origin_form(&mut head).unwrap();
    assert_eq!(head.uri(), "/");
    assert_eq!(head.headers()[HOST], "virtual.example");
  }

  #[test]
  fn take_parked_matches_token_only() {
    let head = ResponseHead::new(StatusCode::OK);
    let mut slot = Some((3, HttpMessage::Head(head)));
    assert!(take_parked(&mut slot, 2).is_none());
    assert!(slot.is_some());
    assert!(take_parked(&mut slot, 3).is_some());
    assert!(slot.is_none());
  }

  struct Veto;
  impl HttpRequestInterceptor for Veto {
    fn pre_handle(
      &self,
      _request: &mut RequestHead,
      _ctx: &mut InterceptContext<'_, RequestHead>,
    ) -> Result<Flow> {
      Ok(Flow::Pause)
    }
  }

  struct Tag;
  impl HttpRequestInterceptor for Tag {
    fn pre_handle(
      &self,
      request: &mut RequestHead,
      _ctx: &mut InterceptContext<'_, RequestHead>,
    ) -> Result<Flow> {
      request
        .headers_mut()
        .insert("x-tag", HeaderValue::from_static("1"));
      Ok(Flow::Continue)
    }
  }

  #[test]
  fn drain_stops_at_veto() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let addr = "127.0.0.1:1".parse().unwrap();
    let info = ConnectionInfo::new(1, addr, addr);
    let mut pipeline = Pipeline::<RequestHead>::new();
    let mut next = 0;
    let mut queue: RequestInterceptorQueue = VecDeque::new();
    queue.push_back(Arc::new(Tag));
    queue.push_back(Arc::new(Veto));
    queue.push_back(Arc::new(Tag));
    let mut head = RequestHead::new(Method::GET, Uri::from_static("/"));
    let drained = drain(&mut queue, &info, &mut pipeline, &tx, &mut next, |i, ctx| {
      i.pre_handle(&mut head, ctx)
    })
    .unwrap();
    assert!(matches!(drained, Drained::Vetoed));
    assert!(queue.is_empty());
    assert_eq!(head.headers()["x-tag"], "1");
  }
}
