#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # slinger-relay
//!
//! An HTTP/HTTPS forward proxy that relays traffic and lets you look at, rewrite, delay
//! or drop it on the way through.
//!
//! - Plain HTTP forwarding, `CONNECT` tunnels and SOCKS5 on one port
//! - Ordered request and response [interceptors](#interceptors)
//! - Whole-body inspection of streamed responses with [`FullResponseAdapter`]
//! - TLS interception of tunnels with a [`MitmManager`]
//! - Chaining through an upstream HTTP or SOCKS5 proxy
//!
//! ## Running a proxy
//!
//! ```rust,no_run
//! # async fn run() -> slinger_relay::Result<()> {
//! let config = slinger_relay::ProxyConfig::builder()
//!   .bind_address("127.0.0.1:8080".parse().unwrap())
//!   .build()?;
//! let mut server = slinger_relay::ProxyServer::builder(config).build();
//! let address = server.start().await?;
//! println!("listening on {}", address);
//! # server.async_stop(None).await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Interceptors
//!
//! An [`InterceptorMatcher`] picks the interceptors for each request; the
//! ready-made [`InterceptorManager`] keeps them in registration order, each optionally
//! guarded by a predicate.
//!
//! ```rust
//! use slinger_relay::{
//!   Flow, HttpRequestInterceptor, InterceptContext, InterceptorManager, MessageHead, RequestHead,
//! };
//!
//! struct Tag;
//!
//! impl HttpRequestInterceptor for Tag {
//!   fn pre_handle(
//!     &self,
//!     request: &mut RequestHead,
//!     _ctx: &mut InterceptContext<'_, RequestHead>,
//!   ) -> slinger_relay::Result<Flow> {
//!     request
//!       .headers_mut()
//!       .insert("x-relayed-by", "slinger-relay".parse()?);
//!     Ok(Flow::Continue)
//!   }
//! }
//!
//! let mut interceptors = InterceptorManager::new();
//! interceptors.add_request_interceptor_when(|r| r.uri().path().starts_with("/api"), Tag);
//! ```
//!
//! An interceptor that returns [`Flow::Pause`] holds its message; take a
//! [`ResumeHandle`] from [`InterceptContext::pause`] and resume it later, from any task.
//!
//! ## Optional Features
//!
//! - **tls**: TLS interception of `CONNECT` tunnels (default).
//! - **serde**: (de)serialization of [`ProxyConfig`].
//!
mod aggregate;
mod auth;
mod codec;
mod config;
mod connection;
mod connector;
mod context;
mod errors;
mod interceptor;
#[cfg(feature = "tls")]
mod mitm;
/// Per-connection processing stages
pub mod pipeline;
mod proxy;
mod relay;
mod server;
mod socks;
/// TLS material for interception
#[cfg(feature = "tls")]
pub mod tls;
/// Tunnel establishment
pub mod tunnel;

pub use aggregate::{
  FullHttpResponseInterceptor, FullResponseAdapter, HttpContentDecompressor, HttpObjectAggregator,
};
pub use auth::{encode_basic_auth, BasicAuthenticator, Credentials, ProxyAuthenticator};
pub use codec::{
  FullMessage, HttpMessage, HttpObject, LastContent, MessageHead, RequestHead, ResponseHead,
};
pub use config::{ProxyConfig, ProxyConfigBuilder};
pub use connection::Connection;
pub use connector::{DirectServerConnector, ResolvedAddress, ServerConnector};
pub use context::{ConnectionInfo, InterceptContext, ResumeHandle};
pub use errors::{Error, ReplyError, ResolveServerAddressError, Result};
pub use http::header;
pub use http::uri;
pub use http::Method;
pub use http::{StatusCode, Version};
pub use interceptor::{
  Flow, HttpRequestInterceptor, HttpResponseInterceptor, InterceptorManager, InterceptorMatcher,
  LoggingInterceptor, RequestInterceptorQueue, ResponseInterceptorQueue,
};
#[cfg(feature = "tls")]
pub use mitm::{FixedCertificateMitm, FixedCertificateMitmBuilder, MitmManager};
pub use pipeline::{Pipeline, Stage};
pub use proxy::{HttpProxy, Socks5Proxy, UpstreamProxy, UpstreamProxyConnector};
pub use server::{ProxyServer, ProxyServerBuilder, ServerState};
pub use socks::Socks5Request;
#[cfg(feature = "tls")]
pub use tokio_rustls::rustls;
pub use tunnel::ConnectHandler;

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
