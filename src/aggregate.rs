//! Full-message adapter.
//!
//! [`FullResponseAdapter`] lets a [`FullHttpResponseInterceptor`] look at a complete,
//! decompressed response body. When it sees a streaming head it splices a
//! decompression stage and an aggregation stage into the upstream pipeline right
//! after the decoder, then refires the head so it travels through them. Once the
//! aggregator emits the complete message both stages are removed again and the
//! wrapped interceptor is called. Responses that carry no body by protocol rule are
//! handed over at once with an empty body and their framing headers untouched.
use crate::codec::{FullMessage, HttpMessage, HttpObject, MessageHead, RequestHead, ResponseHead};
use crate::config::ProxyConfig;
use crate::context::InterceptContext;
use crate::errors::{Error, Result};
use crate::interceptor::{Flow, HttpResponseInterceptor};
use crate::pipeline::{Stage, AGGREGATOR, DECODER, DECOMPRESS};
use bytes::{Bytes, BytesMut};
use flate2::write::{GzDecoder, ZlibDecoder};
use http::header::{HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{Method, StatusCode};
use std::io::Write;

enum Inflater {
  Gzip(GzDecoder<Vec<u8>>),
  Deflate(ZlibDecoder<Vec<u8>>),
}

impl Inflater {
  fn for_coding(coding: &str) -> Option<Self> {
    match coding.trim().to_ascii_lowercase().as_str() {
      "gzip" | "x-gzip" => Some(Inflater::Gzip(GzDecoder::new(Vec::new()))),
      "deflate" | "x-deflate" => Some(Inflater::Deflate(ZlibDecoder::new(Vec::new()))),
      _ => None,
    }
  }
  fn write(&mut self, data: &[u8]) -> std::io::Result<Bytes> {
    let out = match self {
      Inflater::Gzip(d) => {
        d.write_all(data)?;
        std::mem::take(d.get_mut())
      }
      Inflater::Deflate(d) => {
        d.write_all(data)?;
        std::mem::take(d.get_mut())
      }
    };
    Ok(Bytes::from(out))
  }
  fn finish(&mut self) -> std::io::Result<Bytes> {
    let out = match self {
      Inflater::Gzip(d) => {
        d.try_finish()?;
        std::mem::take(d.get_mut())
      }
      Inflater::Deflate(d) => {
        d.try_finish()?;
        std::mem::take(d.get_mut())
      }
    };
    Ok(Bytes::from(out))
  }
}

/// Pipeline stage that removes `gzip` and `deflate` content codings.
///
/// Other codings are left alone. A decoded head loses `Content-Encoding` and
/// `Content-Length` and is marked chunked, since the decoded length is not known yet.
#[derive(Default)]
pub struct HttpContentDecompressor {
  inflater: Option<Inflater>,
  fed: bool,
}

impl HttpContentDecompressor {
  /// A stage with no message in progress.
  pub fn new() -> Self {
    Self::default()
  }
  fn begin<H: MessageHead>(&mut self, head: &mut H) {
    self.fed = false;
    let coding = head
      .headers()
      .get(CONTENT_ENCODING)
      .and_then(|v| v.to_str().ok())
      .map(str::to_string);
    self.inflater = coding.as_deref().and_then(Inflater::for_coding);
    if self.inflater.is_some() {
      let headers = head.headers_mut();
      headers.remove(CONTENT_ENCODING);
      headers.remove(CONTENT_LENGTH);
      headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    }
  }
  fn inflate(&mut self, data: &[u8]) -> Result<Bytes> {
    match self.inflater.as_mut() {
      None => Ok(Bytes::copy_from_slice(data)),
      Some(inflater) => {
        if !data.is_empty() {
          self.fed = true;
        }
        inflater
          .write(data)
          .map_err(|e| Error::decode(format!("corrupt compressed body: {}", e)))
      }
    }
  }
}

impl<H: MessageHead> Stage<H> for HttpContentDecompressor {
  fn process(&mut self, object: HttpObject<H>, out: &mut Vec<HttpObject<H>>) -> Result<()> {
    match object {
      HttpObject::Head(mut head) => {
        self.begin(&mut head);
        out.push(HttpObject::Head(head));
      }
      HttpObject::Content(data) if self.inflater.is_some() => {
        let data = self.inflate(&data)?;
        if !data.is_empty() {
          out.push(HttpObject::Content(data));
        }
      }
      HttpObject::Last(mut last) if self.inflater.is_some() => {
        let mut data = BytesMut::from(&self.inflate(&last.data)?[..]);
        if self.fed {
          if let Some(inflater) = self.inflater.as_mut() {
            let rest = inflater
              .finish()
              .map_err(|e| Error::decode(format!("corrupt compressed body: {}", e)))?;
            data.extend_from_slice(&rest);
          }
        }
        self.inflater = None;
        last.data = data.freeze();
        out.push(HttpObject::Last(last));
      }
      HttpObject::Full(full) => {
        let (mut head, body) = full.into_parts();
        self.begin(&mut head);
        let mut data = BytesMut::from(&self.inflate(&body)?[..]);
        if self.fed {
          if let Some(inflater) = self.inflater.as_mut() {
            let rest = inflater
              .finish()
              .map_err(|e| Error::decode(format!("corrupt compressed body: {}", e)))?;
            data.extend_from_slice(&rest);
          }
        }
        self.inflater = None;
        let mut full = FullMessage::new(head, Bytes::new());
        full.set_body(data.freeze());
        out.push(HttpObject::Full(full));
      }
      other => out.push(other),
    }
    Ok(())
  }
}

/// Pipeline stage that buffers a head and its body into one [`HttpObject::Full`].
///
/// Fails with [`Error::TooLongContent`] as soon as the announced or accumulated body
/// exceeds `max_content_length`; the body is never truncated.
pub struct HttpObjectAggregator<H> {
  max_content_length: usize,
  head: Option<H>,
  body: BytesMut,
}

impl<H> HttpObjectAggregator<H> {
  /// Aggregate bodies of at most `max_content_length` bytes.
  pub fn new(max_content_length: usize) -> Self {
    HttpObjectAggregator {
      max_content_length,
      head: None,
      body: BytesMut::new(),
    }
  }
  fn append(&mut self, data: &[u8]) -> Result<()> {
    if self.body.len() + data.len() > self.max_content_length {
      self.head = None;
      self.body.clear();
      return Err(Error::TooLongContent {
        max: self.max_content_length,
      });
    }
    self.body.extend_from_slice(data);
    Ok(())
  }
}

impl<H: MessageHead> Stage<H> for HttpObjectAggregator<H> {
  fn process(&mut self, object: HttpObject<H>, out: &mut Vec<HttpObject<H>>) -> Result<()> {
    match object {
      HttpObject::Head(head) => {
        let announced = head
          .headers()
          .get(CONTENT_LENGTH)
          .and_then(|v| v.to_str().ok())
          .and_then(|v| v.trim().parse::<u64>().ok());
        if announced.is_some_and(|len| len > self.max_content_length as u64) {
          return Err(Error::TooLongContent {
            max: self.max_content_length,
          });
        }
        self.body.clear();
        self.head = Some(head);
      }
      HttpObject::Content(data) if self.head.is_some() => self.append(&data)?,
      HttpObject::Last(last) if self.head.is_some() => {
        self.append(&last.data)?;
        if let Some(mut head) = self.head.take() {
          let headers = head.headers_mut();
          for (name, value) in last.trailers.iter() {
            headers.append(name.clone(), value.clone());
          }
          let mut full = FullMessage::new(head, Bytes::new());
          full.set_body(self.body.split().freeze());
          out.push(HttpObject::Full(full));
        }
      }
      other => out.push(other),
    }
    Ok(())
  }
}

/// A response interceptor that wants the whole body at once.
///
/// Wrap it in a [`FullResponseAdapter`] to register it.
pub trait FullHttpResponseInterceptor: Send + Sync {
  /// Called with the complete, decompressed response. Changes made through
  /// [`FullMessage::set_body`] are relayed with a matching `Content-Length`.
  fn pre_handle(
    &self,
    request: &RequestHead,
    response: &mut FullMessage<ResponseHead>,
    ctx: &mut InterceptContext<'_, ResponseHead>,
  ) -> Result<Flow>;
}

/// Drives a [`FullHttpResponseInterceptor`] from a streaming response.
pub struct FullResponseAdapter<I> {
  inner: I,
  max_content_length: usize,
}

impl<I: FullHttpResponseInterceptor> FullResponseAdapter<I> {
  /// Buffer at most `max_content_length` body bytes per response.
  pub fn new(inner: I, max_content_length: usize) -> Self {
    FullResponseAdapter {
      inner,
      max_content_length,
    }
  }
  /// Buffer up to the configured `max_content_length`.
  pub fn with_config(inner: I, config: &ProxyConfig) -> Self {
    Self::new(inner, config.max_content_length())
  }
  /// wrapped interceptor
  pub fn inner(&self) -> &I {
    &self.inner
  }
}

/// `true` when a response to `request` with `status` never has a body.
fn is_bodiless(request: &RequestHead, status: StatusCode) -> bool {
  *request.method() == Method::HEAD
    || status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
    || (*request.method() == Method::CONNECT && status.is_success())
}

impl<I: FullHttpResponseInterceptor> FullResponseAdapter<I> {
  /// Show a bodiless response as an empty full message. `Content-Length` of a HEAD
  /// or 304 response describes a body that is never sent, so it is kept as is.
  fn handle_bodiless(
    &self,
    request: &RequestHead,
    head: &mut ResponseHead,
    ctx: &mut InterceptContext<'_, ResponseHead>,
  ) -> Result<Flow> {
    let length = head.headers().get(CONTENT_LENGTH).cloned();
    let chunked = head.headers().get(TRANSFER_ENCODING).cloned();
    let mut full = FullMessage::new(head.clone(), Bytes::new());
    let flow = self.inner.pre_handle(request, &mut full, ctx)?;
    let (mut edited, _) = full.into_parts();
    let headers = edited.headers_mut();
    headers.remove(CONTENT_LENGTH);
    headers.remove(TRANSFER_ENCODING);
    if let Some(length) = length {
      headers.insert(CONTENT_LENGTH, length);
    }
    if let Some(chunked) = chunked {
      headers.insert(TRANSFER_ENCODING, chunked);
    }
    *head = edited;
    Ok(flow)
  }
}

impl<I: FullHttpResponseInterceptor> HttpResponseInterceptor for FullResponseAdapter<I> {
  fn pre_handle(
    &self,
    request: &RequestHead,
    response: &mut HttpMessage<ResponseHead>,
    ctx: &mut InterceptContext<'_, ResponseHead>,
  ) -> Result<Flow> {
    match response {
      HttpMessage::Head(head) if is_bodiless(request, head.status()) => {
        self.handle_bodiless(request, head, ctx)
      }
      HttpMessage::Head(head) => {
        let pipeline = ctx.pipeline();
        pipeline.add_after(DECODER, DECOMPRESS, HttpContentDecompressor::new())?;
        pipeline.add_after(
          DECOMPRESS,
          AGGREGATOR,
          HttpObjectAggregator::<ResponseHead>::new(self.max_content_length),
        )?;
        ctx.refire(HttpObject::Head(head.clone()));
        Ok(Flow::Pause)
      }
      HttpMessage::Full(full) => {
        let pipeline = ctx.pipeline();
        pipeline.remove(DECOMPRESS);
        pipeline.remove(AGGREGATOR);
        self.inner.pre_handle(request, full, ctx)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::codec::{Decoder, Encoder, LastContent};
  use crate::context::ConnectionInfo;
  use crate::pipeline::Pipeline;
  use flate2::write::GzEncoder;
  use flate2::Compression;
  use http::{Method, StatusCode, Uri};
  use tokio::sync::mpsc;

  fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
  }

  fn run(pipeline: &mut Pipeline<ResponseHead>, raw: &[u8]) -> Result<Vec<HttpObject<ResponseHead>>> {
    let mut decoder = Decoder::<ResponseHead>::new(8192);
    decoder.push_request_method(Method::GET);
    let mut src = BytesMut::from(raw);
    let mut out = Vec::new();
    while let Some(object) = decoder.decode(&mut src)? {
      out.extend(pipeline.fire(object)?);
    }
    Ok(out)
  }

  fn aggregating() -> Pipeline<ResponseHead> {
    let mut pipeline = Pipeline::new();
    pipeline
      .add_after(DECODER, DECOMPRESS, HttpContentDecompressor::new())
      .unwrap();
    pipeline
      .add_after(DECOMPRESS, AGGREGATOR, HttpObjectAggregator::new(1024))
      .unwrap();
    pipeline
  }

  #[test]
  fn gzip_chunks_are_inflated_and_aggregated() {
    let compressed = gzip(b"hello hello hello world");
    let (first, second) = compressed.split_at(compressed.len() / 2);
    let mut raw = b"HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
    for part in [first, second] {
      raw.extend_from_slice(format!("{:x}\r\n", part.len()).as_bytes());
      raw.extend_from_slice(part);
      raw.extend_from_slice(b"\r\n");
    }
    raw.extend_from_slice(b"0\r\n\r\n");
    let out = run(&mut aggregating(), &raw).unwrap();
    let [HttpObject::Full(full)] = &out[..] else {
      panic!("expected one full message, got {:?}", out);
    };
    assert_eq!(full.body().as_ref(), b"hello hello hello world");
    let headers = full.head().headers();
    assert!(headers.get(CONTENT_ENCODING).is_none());
    assert!(headers.get(TRANSFER_ENCODING).is_none());
    assert_eq!(headers.get(CONTENT_LENGTH).unwrap(), "23");
  }

  #[test]
  fn identity_body_round_trips_byte_for_byte() {
    let raw = b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 5\r\n\r\nhello";
    let out = run(&mut aggregating(), raw).unwrap();
    let mut encoder = Encoder::default();
    let mut wire = BytesMut::new();
    for object in out {
      encoder.encode(object, &mut wire);
    }
    assert_eq!(&wire[..], &raw[..]);
  }

  #[test]
  fn unknown_coding_passes_through() {
    let mut stage = HttpContentDecompressor::new();
    let mut head = ResponseHead::new(StatusCode::OK);
    head
      .headers_mut()
      .insert(CONTENT_ENCODING, HeaderValue::from_static("br"));
    let mut out = Vec::new();
    stage.process(HttpObject::Head(head), &mut out).unwrap();
    stage
      .process(HttpObject::Content(Bytes::from_static(b"\x01\x02")), &mut out)
      .unwrap();
    let HttpObject::Head(head) = &out[0] else {
      panic!("expected head");
    };
    assert_eq!(head.headers().get(CONTENT_ENCODING).unwrap(), "br");
    assert!(matches!(&out[1], HttpObject::Content(b) if b.as_ref() == b"\x01\x02"));
  }

  #[test]
  fn body_twice_the_limit_fails() {
    let mut pipeline = Pipeline::new();
    pipeline
      .add_after(DECODER, AGGREGATOR, HttpObjectAggregator::new(8))
      .unwrap();
    let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n8\r\n01234567\r\n8\r\n89abcdef\r\n0\r\n\r\n";
    let err = run(&mut pipeline, raw).unwrap_err();
    assert!(err.is_too_long_content(), "{:?}", err);
  }

  #[test]
  fn announced_length_over_limit_fails_early() {
    let mut stage = HttpObjectAggregator::<ResponseHead>::new(4);
    let mut head = ResponseHead::new(StatusCode::OK);
    head
      .headers_mut()
      .insert(CONTENT_LENGTH, HeaderValue::from_static("5"));
    let err = stage.process(HttpObject::Head(head), &mut Vec::new()).unwrap_err();
    assert!(err.is_too_long_content());
  }

  #[test]
  fn trailers_become_headers() {
    let mut stage = HttpObjectAggregator::<ResponseHead>::new(16);
    let mut out = Vec::new();
    stage
      .process(HttpObject::Head(ResponseHead::new(StatusCode::OK)), &mut out)
      .unwrap();
    let mut trailers = http::HeaderMap::new();
    trailers.insert("x-digest", HeaderValue::from_static("abc"));
    stage
      .process(
        HttpObject::Last(LastContent {
          data: Bytes::from_static(b"tail"),
          trailers,
        }),
        &mut out,
      )
      .unwrap();
    let [HttpObject::Full(full)] = &out[..] else {
      panic!("expected full message");
    };
    assert_eq!(full.head().headers().get("x-digest").unwrap(), "abc");
    assert_eq!(full.body().as_ref(), b"tail");
  }

  struct Shout;
  impl FullHttpResponseInterceptor for Shout {
    fn pre_handle(
      &self,
      _request: &RequestHead,
      response: &mut FullMessage<ResponseHead>,
      _ctx: &mut InterceptContext<'_, ResponseHead>,
    ) -> Result<Flow> {
      let body = response.body().to_ascii_uppercase();
      response.set_body(body);
      Ok(Flow::Continue)
    }
  }

  #[test]
  fn head_response_is_not_aggregated() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let addr = "127.0.0.1:1".parse().unwrap();
    let info = ConnectionInfo::new(1, addr, addr);
    let request = RequestHead::new(Method::HEAD, Uri::from_static("/big"));
    let adapter = FullResponseAdapter::new(Shout, 1024);
    let mut pipeline = Pipeline::new();
    let mut next = 0;
    let mut head = ResponseHead::new(StatusCode::OK);
    head
      .headers_mut()
      .insert(CONTENT_LENGTH, HeaderValue::from_static("100000"));
    let mut message = HttpMessage::Head(head);

    let mut ctx = InterceptContext::new(&info, &mut pipeline, &tx, &mut next);
    let flow = adapter.pre_handle(&request, &mut message, &mut ctx).unwrap();
    assert_eq!(flow, Flow::Continue);
    let (refire, parked) = ctx.finish();
    assert!(refire.is_empty());
    assert!(parked.is_none());
    assert_eq!(pipeline.names().count(), 0);
    let HttpMessage::Head(head) = message else {
      panic!("expected a streaming head");
    };
    assert_eq!(head.headers()[CONTENT_LENGTH], "100000");
  }

  #[test]
  fn no_content_keeps_framing_headers() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let addr = "127.0.0.1:1".parse().unwrap();
    let info = ConnectionInfo::new(1, addr, addr);
    let request = RequestHead::new(Method::GET, Uri::from_static("/"));
    let adapter = FullResponseAdapter::new(Shout, 1024);
    let mut pipeline = Pipeline::new();
    let mut next = 0;
    let mut message = HttpMessage::Head(ResponseHead::new(StatusCode::NOT_MODIFIED));
    let mut ctx = InterceptContext::new(&info, &mut pipeline, &tx, &mut next);
    adapter.pre_handle(&request, &mut message, &mut ctx).unwrap();
    drop(ctx);
    assert!(message.head().headers().get(CONTENT_LENGTH).is_none());
    assert_eq!(pipeline.names().count(), 0);
  }

  #[test]
  fn adapter_inserts_stages_once_and_removes_them() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let addr = "127.0.0.1:1".parse().unwrap();
    let info = ConnectionInfo::new(1, addr, addr);
    let request = RequestHead::new(Method::GET, Uri::from_static("/"));
    let adapter = FullResponseAdapter::new(Shout, 64);
    let mut pipeline = Pipeline::new();
    let mut next = 0;

    let mut message = HttpMessage::Head(ResponseHead::new(StatusCode::OK));
    for _ in 0..2 {
      let mut ctx = InterceptContext::new(&info, &mut pipeline, &tx, &mut next);
      let flow = adapter.pre_handle(&request, &mut message, &mut ctx).unwrap();
      assert_eq!(flow, Flow::Pause);
      let (refire, parked) = ctx.finish();
      assert_eq!(refire.len(), 1);
      assert!(parked.is_none());
    }
    assert_eq!(pipeline.names().collect::<Vec<_>>(), [DECOMPRESS, AGGREGATOR]);

    let mut message = HttpMessage::Full(FullMessage::new(
      ResponseHead::new(StatusCode::OK),
      Bytes::from_static(b"quiet"),
    ));
    let mut ctx = InterceptContext::new(&info, &mut pipeline, &tx, &mut next);
    let flow = adapter.pre_handle(&request, &mut message, &mut ctx).unwrap();
    assert_eq!(flow, Flow::Continue);
    drop(ctx);
    assert_eq!(pipeline.names().count(), 0);
    let HttpMessage::Full(full) = message else {
      panic!("expected full message");
    };
    assert_eq!(full.body().as_ref(), b"QUIET");
  }
}
