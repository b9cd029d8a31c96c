//! HTTP/1 message model and the incremental codec used on both sides of a relay.
//!
//! Bytes read from a connection are turned into a stream of [`HttpObject`]s: one head,
//! zero or more content chunks and an end marker per message. The encoder writes those
//! objects back out in the framing announced by the head they follow.
use crate::errors::{Error, Result};
use crate::{COLON_SPACE, CR_LF, SPACE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{Method, StatusCode, Uri, Version};
use std::collections::VecDeque;
use std::marker::PhantomData;

const MAX_HEADERS: usize = 128;
const MAX_CHUNK_LINE: usize = 4096;

/// Start line and headers shared by requests and responses.
pub trait MessageHead: Clone + Send + Sync + std::fmt::Debug + 'static {
  /// header map
  fn headers(&self) -> &HeaderMap;
  /// mutable header map
  fn headers_mut(&mut self) -> &mut HeaderMap;
  /// protocol version
  fn version(&self) -> Version;
  /// Append the wire form of this head, terminated by an empty line.
  fn encode(&self, dst: &mut BytesMut);
}

/// Parsing side of a head, private to the codec.
pub(crate) trait Decodable: MessageHead + Sized {
  fn parse(src: &[u8]) -> Result<Option<(Self, usize)>>;
  fn framing(&self, request_method: Option<&Method>) -> Result<Framing>;
}

/// Body delimitation chosen from a parsed head.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Framing {
  /// 1xx other than 101: head only, the final response follows
  Informational,
  Empty,
  Length(u64),
  Chunked,
  UntilClose,
  /// after the head the stream stops being HTTP
  Upgrade,
}

/// Request line and headers.
#[derive(Clone, Debug)]
pub struct RequestHead {
  method: Method,
  uri: Uri,
  version: Version,
  headers: HeaderMap,
}

impl RequestHead {
  /// A HTTP/1.1 head with no headers.
  pub fn new(method: Method, uri: Uri) -> Self {
    RequestHead {
      method,
      uri,
      version: Version::HTTP_11,
      headers: HeaderMap::new(),
    }
  }
  /// Get the HTTP Method of the request.
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// Get a mutable reference to the Method.
  pub fn method_mut(&mut self) -> &mut Method {
    &mut self.method
  }
  /// Get the request target.
  pub fn uri(&self) -> &Uri {
    &self.uri
  }
  /// Get a mutable reference to the request target.
  pub fn uri_mut(&mut self) -> &mut Uri {
    &mut self.uri
  }
  /// Get a mutable reference to the version.
  pub fn version_mut(&mut self) -> &mut Version {
    &mut self.version
  }
  /// `true` for a tunnel-establishing request.
  pub fn is_connect(&self) -> bool {
    self.method == Method::CONNECT
  }
  /// `host[:port]` this request is addressed to, from the target or the `Host` header.
  pub fn authority(&self) -> Option<String> {
    if let Some(authority) = self.uri.authority() {
      return Some(authority.as_str().rsplit('@').next().unwrap_or_default().to_string());
    }
    self
      .headers
      .get(HOST)
      .and_then(|h| h.to_str().ok())
      .map(|h| h.trim().to_string())
      .filter(|h| !h.is_empty())
  }
}

impl MessageHead for RequestHead {
  fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  fn version(&self) -> Version {
    self.version
  }
  fn encode(&self, dst: &mut BytesMut) {
    dst.put_slice(self.method.as_str().as_bytes());
    dst.put_slice(SPACE);
    dst.put_slice(self.uri.to_string().as_bytes());
    dst.put_slice(SPACE);
    dst.put_slice(format!("{:?}", self.version).as_bytes());
    dst.put_slice(CR_LF);
    encode_headers(&self.headers, dst);
  }
}

impl Decodable for RequestHead {
  fn parse(src: &[u8]) -> Result<Option<(Self, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    let len = match request.parse(src) {
      Ok(httparse::Status::Complete(len)) => len,
      Ok(httparse::Status::Partial) => return Ok(None),
      Err(e) => return Err(Error::decode(format!("invalid request head: {}", e))),
    };
    let method = request
      .method
      .ok_or_else(|| Error::decode("missing method"))
      .and_then(|m| Method::from_bytes(m.as_bytes()).map_err(|e| Error::decode(e.to_string())))?;
    let uri = request
      .path
      .ok_or_else(|| Error::decode("missing request target"))
      .and_then(|p| Uri::try_from(p).map_err(|e| Error::decode(e.to_string())))?;
    let head = RequestHead {
      method,
      uri,
      version: parse_version(request.version)?,
      headers: collect_headers(request.headers)?,
    };
    Ok(Some((head, len)))
  }

  fn framing(&self, _request_method: Option<&Method>) -> Result<Framing> {
    if self.is_connect() {
      return Ok(Framing::Upgrade);
    }
    Ok(body_framing(&self.headers)?.unwrap_or(Framing::Empty))
  }
}

/// Status line and headers.
#[derive(Clone, Debug)]
pub struct ResponseHead {
  version: Version,
  status: StatusCode,
  reason: Option<String>,
  headers: HeaderMap,
}

impl ResponseHead {
  /// A HTTP/1.1 head with the canonical reason phrase.
  pub fn new(status: StatusCode) -> Self {
    ResponseHead {
      version: Version::HTTP_11,
      status,
      reason: None,
      headers: HeaderMap::new(),
    }
  }
  /// Get the `StatusCode` of this Response.
  pub fn status(&self) -> StatusCode {
    self.status
  }
  /// Get a mutable reference to the status.
  pub fn status_mut(&mut self) -> &mut StatusCode {
    &mut self.status
  }
  /// Reason phrase as received, or the canonical one.
  pub fn reason(&self) -> &str {
    match &self.reason {
      Some(reason) => reason,
      None => self.status.canonical_reason().unwrap_or_default(),
    }
  }
  /// Replace the reason phrase.
  pub fn set_reason<R: Into<String>>(&mut self, reason: R) {
    self.reason = Some(reason.into());
  }
}

impl MessageHead for ResponseHead {
  fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  fn version(&self) -> Version {
    self.version
  }
  fn encode(&self, dst: &mut BytesMut) {
    dst.put_slice(format!("{:?}", self.version).as_bytes());
    dst.put_slice(SPACE);
    dst.put_slice(self.status.as_str().as_bytes());
    dst.put_slice(SPACE);
    dst.put_slice(self.reason().as_bytes());
    dst.put_slice(CR_LF);
    encode_headers(&self.headers, dst);
  }
}

impl Decodable for ResponseHead {
  fn parse(src: &[u8]) -> Result<Option<(Self, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    let len = match response.parse(src) {
      Ok(httparse::Status::Complete(len)) => len,
      Ok(httparse::Status::Partial) => return Ok(None),
      Err(e) => return Err(Error::decode(format!("invalid response head: {}", e))),
    };
    let status = response
      .code
      .ok_or_else(|| Error::decode("missing status code"))
      .and_then(|c| StatusCode::from_u16(c).map_err(|e| Error::decode(e.to_string())))?;
    let reason = response
      .reason
      .filter(|r| Some(*r) != status.canonical_reason())
      .map(str::to_string);
    let head = ResponseHead {
      version: parse_version(response.version)?,
      status,
      reason,
      headers: collect_headers(response.headers)?,
    };
    Ok(Some((head, len)))
  }

  fn framing(&self, request_method: Option<&Method>) -> Result<Framing> {
    let status = self.status;
    if status == StatusCode::SWITCHING_PROTOCOLS {
      return Ok(Framing::Upgrade);
    }
    if status.is_informational() {
      return Ok(Framing::Informational);
    }
    if request_method == Some(&Method::CONNECT) && status.is_success() {
      return Ok(Framing::Upgrade);
    }
    if request_method == Some(&Method::HEAD)
      || status == StatusCode::NO_CONTENT
      || status == StatusCode::NOT_MODIFIED
    {
      return Ok(Framing::Empty);
    }
    Ok(body_framing(&self.headers)?.unwrap_or(Framing::UntilClose))
  }
}

fn parse_version(version: Option<u8>) -> Result<Version> {
  match version {
    Some(0) => Ok(Version::HTTP_10),
    Some(1) => Ok(Version::HTTP_11),
    _ => Err(Error::decode("unsupported http version")),
  }
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Result<HeaderMap> {
  let mut headers = HeaderMap::with_capacity(raw.len());
  for header in raw {
    let name =
      HeaderName::from_bytes(header.name.as_bytes()).map_err(|e| Error::decode(e.to_string()))?;
    let value = HeaderValue::from_bytes(header.value).map_err(|e| Error::decode(e.to_string()))?;
    headers.append(name, value);
  }
  Ok(headers)
}

fn encode_headers(headers: &HeaderMap, dst: &mut BytesMut) {
  for (name, value) in headers.iter() {
    dst.put_slice(name.as_str().as_bytes());
    dst.put_slice(COLON_SPACE);
    dst.put_slice(value.as_bytes());
    dst.put_slice(CR_LF);
  }
  dst.put_slice(CR_LF);
}

pub(crate) fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get_all(TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .next_back()
    .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

fn body_framing(headers: &HeaderMap) -> Result<Option<Framing>> {
  if is_chunked(headers) {
    return Ok(Some(Framing::Chunked));
  }
  match headers.get(CONTENT_LENGTH) {
    None => Ok(None),
    Some(value) => {
      let length = value
        .to_str()
        .map_err(|e| Error::decode(e.to_string()))?
        .trim()
        .parse::<u64>()
        .map_err(|e| Error::decode(format!("invalid content-length: {}", e)))?;
      Ok(Some(if length == 0 {
        Framing::Empty
      } else {
        Framing::Length(length)
      }))
    }
  }
}

/// Final piece of a message body.
#[derive(Clone, Debug, Default)]
pub struct LastContent {
  /// remaining body bytes, often empty
  pub data: Bytes,
  /// chunked trailers
  pub trailers: HeaderMap,
}

/// A head together with its complete body.
#[derive(Clone, Debug)]
pub struct FullMessage<H> {
  head: H,
  body: Bytes,
}

impl<H: MessageHead> FullMessage<H> {
  /// Join a head and a body.
  pub fn new(head: H, body: Bytes) -> Self {
    FullMessage { head, body }
  }
  /// message head
  pub fn head(&self) -> &H {
    &self.head
  }
  /// mutable message head
  pub fn head_mut(&mut self) -> &mut H {
    &mut self.head
  }
  /// complete body
  pub fn body(&self) -> &Bytes {
    &self.body
  }
  /// Replace the body and announce its length.
  pub fn set_body<B: Into<Bytes>>(&mut self, body: B) {
    self.body = body.into();
    let headers = self.head.headers_mut();
    headers.remove(TRANSFER_ENCODING);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(self.body.len()));
  }
  /// Split into head and body.
  pub fn into_parts(self) -> (H, Bytes) {
    (self.head, self.body)
  }
  fn prepare_for_wire(&mut self) {
    let headers = self.head.headers_mut();
    headers.remove(TRANSFER_ENCODING);
    if !headers.contains_key(CONTENT_LENGTH) || !self.body.is_empty() {
      headers.insert(CONTENT_LENGTH, HeaderValue::from(self.body.len()));
    }
  }
}

/// A unit flowing through a connection's pipeline.
#[derive(Clone, Debug)]
pub enum HttpObject<H> {
  /// start line and headers
  Head(H),
  /// a body chunk
  Content(Bytes),
  /// end of the current message
  Last(LastContent),
  /// a complete message, produced by aggregation
  Full(FullMessage<H>),
  /// bytes the codec does not model, relayed untouched
  Unknown(Bytes),
}

/// What a response interceptor is shown: a bare head while streaming, or a complete
/// message once a buffering stage has aggregated it.
#[derive(Clone, Debug)]
pub enum HttpMessage<H> {
  /// streaming head, the body follows as chunks
  Head(H),
  /// aggregated message
  Full(FullMessage<H>),
}

impl<H: MessageHead> HttpMessage<H> {
  /// head of either form
  pub fn head(&self) -> &H {
    match self {
      HttpMessage::Head(head) => head,
      HttpMessage::Full(full) => full.head(),
    }
  }
  /// mutable head of either form
  pub fn head_mut(&mut self) -> &mut H {
    match self {
      HttpMessage::Head(head) => head,
      HttpMessage::Full(full) => full.head_mut(),
    }
  }
  /// `true` when the body is already complete
  pub fn is_full(&self) -> bool {
    matches!(self, HttpMessage::Full(_))
  }
  pub(crate) fn into_object(self) -> HttpObject<H> {
    match self {
      HttpMessage::Head(head) => HttpObject::Head(head),
      HttpMessage::Full(full) => HttpObject::Full(full),
    }
  }
}

#[derive(Debug)]
enum State {
  Head,
  Length(u64),
  ChunkSize,
  ChunkData(u64),
  ChunkDataEnd,
  Trailers,
  UntilClose,
  EmitLast { upgrade: bool },
  Upgraded,
}

/// Incremental HTTP/1 decoder for one direction of a connection.
#[derive(Debug)]
pub(crate) struct Decoder<H> {
  state: State,
  max_head_size: usize,
  trailers: HeaderMap,
  request_methods: VecDeque<Method>,
  _head: PhantomData<H>,
}

impl<H: Decodable> Decoder<H> {
  pub(crate) fn new(max_head_size: usize) -> Self {
    Decoder {
      state: State::Head,
      max_head_size,
      trailers: HeaderMap::new(),
      request_methods: VecDeque::new(),
      _head: PhantomData,
    }
  }

  /// Record the method of a request sent on the paired connection so the matching
  /// response is framed correctly.
  pub(crate) fn push_request_method(&mut self, method: Method) {
    self.request_methods.push_back(method);
  }

  /// Stop parsing; everything from now on is relayed as [`HttpObject::Unknown`].
  pub(crate) fn upgrade(&mut self) {
    self.state = State::Upgraded;
  }

  pub(crate) fn is_upgraded(&self) -> bool {
    matches!(self.state, State::Upgraded)
  }

  /// `true` between a head and its end marker.
  pub(crate) fn in_message(&self) -> bool {
    !matches!(self.state, State::Head | State::Upgraded)
  }

  /// Decode the next object from `src`, or `None` when more bytes are needed.
  pub(crate) fn decode(&mut self, src: &mut BytesMut) -> Result<Option<HttpObject<H>>> {
    loop {
      match self.state {
        State::Head => {
          while src.starts_with(CR_LF) {
            src.advance(2);
          }
          if src.is_empty() {
            return Ok(None);
          }
          let Some((head, len)) = H::parse(src)? else {
            if src.len() > self.max_head_size {
              return Err(Error::decode("message head too large"));
            }
            return Ok(None);
          };
          if len > self.max_head_size {
            return Err(Error::decode("message head too large"));
          }
          src.advance(len);
          let framing = head.framing(self.request_methods.front())?;
          if framing != Framing::Informational {
            self.request_methods.pop_front();
          }
          self.state = match framing {
            Framing::Informational => State::Head,
            Framing::Empty | Framing::Length(0) => State::EmitLast { upgrade: false },
            Framing::Upgrade => State::EmitLast { upgrade: true },
            Framing::Length(n) => State::Length(n),
            Framing::Chunked => State::ChunkSize,
            Framing::UntilClose => State::UntilClose,
          };
          return Ok(Some(HttpObject::Head(head)));
        }
        State::EmitLast { upgrade } => {
          self.state = if upgrade { State::Upgraded } else { State::Head };
          return Ok(Some(HttpObject::Last(LastContent::default())));
        }
        State::Length(remaining) => {
          if src.is_empty() {
            return Ok(None);
          }
          let data = split_at_most(src, remaining);
          let left = remaining - data.len() as u64;
          self.state = if left == 0 {
            State::EmitLast { upgrade: false }
          } else {
            State::Length(left)
          };
          return Ok(Some(HttpObject::Content(data)));
        }
        State::ChunkSize => {
          let Some(end) = find_crlf(src) else {
            if src.len() > MAX_CHUNK_LINE {
              return Err(Error::decode("chunk size line too long"));
            }
            return Ok(None);
          };
          let size = parse_chunk_size(&src[..end])?;
          src.advance(end + 2);
          self.state = if size == 0 {
            State::Trailers
          } else {
            State::ChunkData(size)
          };
        }
        State::ChunkData(remaining) => {
          if src.is_empty() {
            return Ok(None);
          }
          let data = split_at_most(src, remaining);
          let left = remaining - data.len() as u64;
          self.state = if left == 0 {
            State::ChunkDataEnd
          } else {
            State::ChunkData(left)
          };
          return Ok(Some(HttpObject::Content(data)));
        }
        State::ChunkDataEnd => {
          if src.len() < 2 {
            return Ok(None);
          }
          if !src.starts_with(CR_LF) {
            return Err(Error::decode("missing CRLF after chunk data"));
          }
          src.advance(2);
          self.state = State::ChunkSize;
        }
        State::Trailers => {
          let Some(end) = find_crlf(src) else {
            if src.len() > self.max_head_size {
              return Err(Error::decode("trailers too large"));
            }
            return Ok(None);
          };
          if end == 0 {
            src.advance(2);
            self.state = State::Head;
            let trailers = std::mem::take(&mut self.trailers);
            return Ok(Some(HttpObject::Last(LastContent {
              data: Bytes::new(),
              trailers,
            })));
          }
          let line = src.split_to(end);
          src.advance(2);
          let (name, value) = parse_trailer(&line)?;
          self.trailers.append(name, value);
        }
        State::UntilClose => {
          if src.is_empty() {
            return Ok(None);
          }
          return Ok(Some(HttpObject::Content(src.split().freeze())));
        }
        State::Upgraded => {
          if src.is_empty() {
            return Ok(None);
          }
          return Ok(Some(HttpObject::Unknown(src.split().freeze())));
        }
      }
    }
  }

  /// The peer closed its side. Ends a read-until-close body; any other unfinished
  /// message is a decode failure.
  pub(crate) fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<HttpObject<H>>> {
    match self.state {
      State::UntilClose => {
        self.state = State::Head;
        Ok(Some(HttpObject::Last(LastContent::default())))
      }
      State::Head if src.is_empty() => Ok(None),
      State::Upgraded => Ok(None),
      _ => Err(Error::decode("connection closed before message was complete")),
    }
  }
}

fn split_at_most(src: &mut BytesMut, limit: u64) -> Bytes {
  let n = usize::try_from(limit).unwrap_or(usize::MAX).min(src.len());
  src.split_to(n).freeze()
}

fn find_crlf(src: &[u8]) -> Option<usize> {
  src.windows(2).position(|w| w == CR_LF)
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
  let size = line.split(|b| *b == b';').next().unwrap_or_default();
  let size = std::str::from_utf8(size)
    .map_err(|_| Error::decode("chunk size is not ascii"))?
    .trim();
  u64::from_str_radix(size, 16).map_err(|e| Error::decode(format!("invalid chunk size: {}", e)))
}

fn parse_trailer(line: &[u8]) -> Result<(HeaderName, HeaderValue)> {
  let colon = line
    .iter()
    .position(|b| *b == b':')
    .ok_or_else(|| Error::decode("malformed trailer"))?;
  let name = HeaderName::from_bytes(line[..colon].trim_ascii())
    .map_err(|e| Error::decode(e.to_string()))?;
  let value = HeaderValue::from_bytes(line[colon + 1..].trim_ascii())
    .map_err(|e| Error::decode(e.to_string()))?;
  Ok((name, value))
}

/// Writes objects back to the wire in the framing of the head they follow.
#[derive(Debug, Default)]
pub(crate) struct Encoder {
  chunked: bool,
}

impl Encoder {
  pub(crate) fn encode<H: MessageHead>(&mut self, object: HttpObject<H>, dst: &mut BytesMut) {
    match object {
      HttpObject::Head(head) => {
        self.chunked = is_chunked(head.headers());
        head.encode(dst);
      }
      HttpObject::Content(data) => self.encode_data(&data, dst),
      HttpObject::Last(last) => {
        self.encode_data(&last.data, dst);
        if self.chunked {
          dst.put_slice(b"0\r\n");
          for (name, value) in last.trailers.iter() {
            dst.put_slice(name.as_str().as_bytes());
            dst.put_slice(COLON_SPACE);
            dst.put_slice(value.as_bytes());
            dst.put_slice(CR_LF);
          }
          dst.put_slice(CR_LF);
        }
        self.chunked = false;
      }
      HttpObject::Full(mut full) => {
        full.prepare_for_wire();
        full.head.encode(dst);
        dst.put_slice(&full.body);
        self.chunked = false;
      }
      HttpObject::Unknown(data) => dst.put_slice(&data),
    }
  }

  fn encode_data(&self, data: &[u8], dst: &mut BytesMut) {
    if data.is_empty() {
      return;
    }
    if self.chunked {
      dst.put_slice(format!("{:x}", data.len()).as_bytes());
      dst.put_slice(CR_LF);
      dst.put_slice(data);
      dst.put_slice(CR_LF);
    } else {
      dst.put_slice(data);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn drain<H: Decodable>(decoder: &mut Decoder<H>, src: &mut BytesMut) -> Vec<HttpObject<H>> {
    let mut out = Vec::new();
    while let Some(object) = decoder.decode(src).unwrap() {
      out.push(object);
    }
    out
  }

  fn body_of<H>(objects: &[HttpObject<H>]) -> Vec<u8> {
    let mut body = Vec::new();
    for object in objects {
      match object {
        HttpObject::Content(data) => body.extend_from_slice(data),
        HttpObject::Last(last) => body.extend_from_slice(&last.data),
        _ => {}
      }
    }
    body
  }

  #[test]
  fn decode_request_with_content_length() {
    let mut decoder = Decoder::<RequestHead>::new(8192);
    let mut src = BytesMut::from(&b"POST /submit HTTP/1.1\r\nHost: a.example\r\nContent-Length: 5\r\n\r\nhello"[..]);
    let objects = drain(&mut decoder, &mut src);
    assert_eq!(objects.len(), 3);
    let HttpObject::Head(head) = &objects[0] else {
      panic!("expected head, got {:?}", objects[0]);
    };
    assert_eq!(head.method(), &Method::POST);
    assert_eq!(head.uri().path(), "/submit");
    assert_eq!(head.authority().as_deref(), Some("a.example"));
    assert_eq!(body_of(&objects), b"hello");
    assert!(matches!(objects[2], HttpObject::Last(_)));
    assert!(!decoder.in_message());
  }

  #[test]
  fn decode_request_split_across_reads() {
    let mut decoder = Decoder::<RequestHead>::new(8192);
    let mut src = BytesMut::from(&b"GET http://a.example/x HTTP/1.1\r\nHo"[..]);
    assert!(decoder.decode(&mut src).unwrap().is_none());
    src.extend_from_slice(b"st: a.example\r\n\r\n");
    let objects = drain(&mut decoder, &mut src);
    assert!(matches!(objects[0], HttpObject::Head(_)));
    assert!(matches!(objects[1], HttpObject::Last(_)));
  }

  #[test]
  fn decode_chunked_response_with_trailers() {
    let mut decoder = Decoder::<ResponseHead>::new(8192);
    decoder.push_request_method(Method::GET);
    let mut src = BytesMut::from(
      &b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\nX-Checksum: abc\r\n\r\n"[..],
    );
    let objects = drain(&mut decoder, &mut src);
    assert_eq!(body_of(&objects), b"Wikipedia");
    let Some(HttpObject::Last(last)) = objects.last() else {
      panic!("expected last content");
    };
    assert_eq!(last.trailers.get("x-checksum").unwrap(), "abc");
    assert!(src.is_empty());
  }

  #[test]
  fn decode_head_response_has_no_body() {
    let mut decoder = Decoder::<ResponseHead>::new(8192);
    decoder.push_request_method(Method::HEAD);
    let mut src = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 1234\r\n\r\n"[..]);
    let objects = drain(&mut decoder, &mut src);
    assert_eq!(objects.len(), 2);
    assert!(matches!(objects[1], HttpObject::Last(_)));
  }

  #[test]
  fn decode_informational_keeps_method_for_final_response() {
    let mut decoder = Decoder::<ResponseHead>::new(8192);
    decoder.push_request_method(Method::HEAD);
    let mut src = BytesMut::from(
      &b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n"[..],
    );
    let objects = drain(&mut decoder, &mut src);
    assert_eq!(objects.len(), 3, "{:?}", objects);
    let HttpObject::Head(informational) = &objects[0] else {
      panic!("expected head");
    };
    assert_eq!(informational.status(), StatusCode::CONTINUE);
  }

  #[test]
  fn decode_until_close_ends_on_eof() {
    let mut decoder = Decoder::<ResponseHead>::new(8192);
    decoder.push_request_method(Method::GET);
    let mut src = BytesMut::from(&b"HTTP/1.0 200 OK\r\n\r\nstream"[..]);
    let objects = drain(&mut decoder, &mut src);
    assert_eq!(body_of(&objects), b"stream");
    assert!(decoder.in_message());
    let last = decoder.decode_eof(&mut src).unwrap();
    assert!(matches!(last, Some(HttpObject::Last(_))));
    assert!(!decoder.in_message());
  }

  #[test]
  fn decode_eof_mid_message_is_error() {
    let mut decoder = Decoder::<ResponseHead>::new(8192);
    decoder.push_request_method(Method::GET);
    let mut src = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc"[..]);
    drain(&mut decoder, &mut src);
    assert!(decoder.decode_eof(&mut src).unwrap_err().is_decode());
  }

  #[test]
  fn decode_connect_switches_to_raw() {
    let mut decoder = Decoder::<RequestHead>::new(8192);
    let mut src = BytesMut::from(&b"CONNECT example.com:443 HTTP/1.1\r\n\r\n\x16\x03\x01"[..]);
    let objects = drain(&mut decoder, &mut src);
    let HttpObject::Head(head) = &objects[0] else {
      panic!("expected head");
    };
    assert!(head.is_connect());
    assert_eq!(head.authority().as_deref(), Some("example.com:443"));
    assert!(matches!(objects[1], HttpObject::Last(_)));
    assert!(matches!(&objects[2], HttpObject::Unknown(b) if b.as_ref() == b"\x16\x03\x01"));
    assert!(decoder.is_upgraded());
  }

  #[test]
  fn decode_rejects_garbage() {
    let mut decoder = Decoder::<RequestHead>::new(8192);
    let mut src = BytesMut::from(&b"\x00\x01 nonsense\r\n\r\n"[..]);
    assert!(decoder.decode(&mut src).unwrap_err().is_decode());
  }

  #[test]
  fn decode_rejects_oversized_head() {
    let mut decoder = Decoder::<RequestHead>::new(32);
    let mut src = BytesMut::from(&b"GET / HTTP/1.1\r\nX-Padding: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"[..]);
    assert!(decoder.decode(&mut src).unwrap_err().is_decode());
  }

  #[test]
  fn encode_preserves_chunked_framing() {
    let raw = &b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n4\r\nWiki\r\n0\r\n\r\n"[..];
    let mut decoder = Decoder::<ResponseHead>::new(8192);
    decoder.push_request_method(Method::GET);
    let mut src = BytesMut::from(raw);
    let mut encoder = Encoder::default();
    let mut out = BytesMut::new();
    for object in drain(&mut decoder, &mut src) {
      encoder.encode(object, &mut out);
    }
    assert_eq!(&out[..], raw);
  }

  #[test]
  fn encode_full_message_sets_content_length() {
    let mut head = ResponseHead::new(StatusCode::OK);
    head
      .headers_mut()
      .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    let full = FullMessage::new(head, Bytes::from_static(b"abc"));
    let mut out = BytesMut::new();
    Encoder::default().encode(HttpObject::Full(full), &mut out);
    assert_eq!(&out[..], b"HTTP/1.1 200 OK\r\ncontent-length: 3\r\n\r\nabc");
  }

  #[test]
  fn response_keeps_custom_reason() {
    let (head, _) = ResponseHead::parse(b"HTTP/1.1 200 Connection Established\r\n\r\n")
      .unwrap()
      .unwrap();
    assert_eq!(head.reason(), "Connection Established");
    let mut out = BytesMut::new();
    head.encode(&mut out);
    assert_eq!(&out[..], b"HTTP/1.1 200 Connection Established\r\n\r\n");
  }
}
