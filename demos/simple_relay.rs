//! Plain forwarding proxy with request logging and optional chaining
//!
//! Serves HTTP, `CONNECT` tunnels and SOCKS5 on one port.
//!
//! To run:
//! ```bash
//! RUST_LOG=debug cargo run --example simple_relay -- 127.0.0.1:8080 [socks5://127.0.0.1:1080]
//! ```
//!
//! Then try:
//! ```bash
//! curl -x http://127.0.0.1:8080 http://example.com/
//! curl -x socks5h://127.0.0.1:8080 https://example.com/
//! ```

use slinger_relay::{
  InterceptorManager, LoggingInterceptor, ProxyConfig, ProxyServer, UpstreamProxy,
  UpstreamProxyConnector,
};
use tracing_subscriber::EnvFilter;

fn main() -> slinger_relay::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let mut args = std::env::args().skip(1);
  let bind = args
    .next()
    .unwrap_or_else(|| "127.0.0.1:8080".to_string())
    .parse::<std::net::SocketAddr>()
    .map_err(|e| slinger_relay::Error::Other(format!("bad bind address: {}", e)))?;
  let config = ProxyConfig::builder().bind_address(bind).build()?;

  let mut interceptors = InterceptorManager::new();
  interceptors.add_request_interceptor(LoggingInterceptor);
  interceptors.add_response_interceptor(LoggingInterceptor);

  let mut builder = ProxyServer::builder(config).with_interceptors(interceptors);
  if let Some(upstream) = args.next() {
    let proxy = UpstreamProxy::parse(upstream)?;
    println!("chaining through {}", proxy.address());
    builder = builder.with_connector(UpstreamProxyConnector::new(proxy));
  }
  let mut server = builder.build();
  let address = futures::executor::block_on(server.start())?;
  println!("relaying on {}, press Enter to stop", address);

  let mut line = String::new();
  std::io::stdin().read_line(&mut line)?;
  server.stop(None);
  Ok(())
}
