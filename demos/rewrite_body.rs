//! Intercept HTTPS and rewrite whole response bodies
//!
//! Tunnels are decrypted with the certificate in `tests/fixtures/identity.pem`, so the
//! client has to trust `tests/fixtures/cert.pem`. Every `text/html` response is
//! decompressed, buffered and has its title replaced before it reaches the client.
//!
//! To run:
//! ```bash
//! cargo run --example rewrite_body
//! curl --cacert tests/fixtures/cert.pem -x http://127.0.0.1:8080 https://localhost:8443/
//! ```

use slinger_relay::{
  Flow, FullHttpResponseInterceptor, FullMessage, FullResponseAdapter, FixedCertificateMitm,
  InterceptContext, InterceptorManager, MessageHead, ProxyConfig, ProxyServer, RequestHead,
  ResponseHead,
};
use tracing_subscriber::EnvFilter;

const IDENTITY: &[u8] = include_bytes!("../tests/fixtures/identity.pem");

struct RetitleHtml;

impl FullHttpResponseInterceptor for RetitleHtml {
  fn pre_handle(
    &self,
    request: &RequestHead,
    response: &mut FullMessage<ResponseHead>,
    ctx: &mut InterceptContext<'_, ResponseHead>,
  ) -> slinger_relay::Result<Flow> {
    let html = response
      .head()
      .headers()
      .get(slinger_relay::header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .is_some_and(|v| v.starts_with("text/html"));
    if !html {
      return Ok(Flow::Continue);
    }
    let body = String::from_utf8_lossy(response.body());
    let Some(start) = body.find("<title>") else {
      return Ok(Flow::Continue);
    };
    let Some(end) = body[start..].find("</title>") else {
      return Ok(Flow::Continue);
    };
    let rewritten = format!(
      "{}<title>relayed by slinger-relay</title>{}",
      &body[..start],
      &body[start + end + "</title>".len()..]
    );
    println!(
      "{} rewrote title of {}",
      ctx.connection(),
      request.uri()
    );
    response.set_body(rewritten);
    Ok(Flow::Continue)
  }
}

fn main() -> slinger_relay::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = ProxyConfig::builder()
    .bind_address(([127, 0, 0, 1], 8080).into())
    .build()?;
  let mitm = FixedCertificateMitm::builder(IDENTITY)?
    .danger_accept_invalid_certs(true)
    .build()?;

  let mut interceptors = InterceptorManager::new();
  interceptors.add_response_interceptor(FullResponseAdapter::with_config(RetitleHtml, &config));

  let mut server = ProxyServer::builder(config)
    .with_interceptors(interceptors)
    .with_mitm_manager(mitm)
    .build();
  let address = futures::executor::block_on(server.start())?;
  println!("relaying on {}, press Enter to stop", address);

  let mut line = String::new();
  std::io::stdin().read_line(&mut line)?;
  server.stop(None);
  Ok(())
}
