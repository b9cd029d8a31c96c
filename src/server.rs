//! Connection lifecycle: pools, listener and graceful shutdown.
use crate::auth::ProxyAuthenticator;
use crate::config::ProxyConfig;
use crate::connection::Connection;
use crate::connector::{DirectServerConnector, ServerConnector};
use crate::context::{ConnectionInfo, ProxyContext};
use crate::errors::{Error, Result};
use crate::interceptor::InterceptorMatcher;
#[cfg(feature = "tls")]
use crate::mitm::MitmManager;
use crate::proxy::consts;
use crate::relay::{report, ClientRelay};
use crate::socks;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{oneshot, watch};

const NAME: &str = "slinger-relay";

/// Where a [`ProxyServer`] is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
  /// built, or started but not yet listening
  Unbound,
  /// listening
  Bound,
  /// stop requested, pools draining
  Stopping,
  /// every owned pool has stopped
  Stopped,
}

impl ServerState {
  fn load(cell: &AtomicU8) -> Self {
    match cell.load(Ordering::Acquire) {
      0 => ServerState::Unbound,
      1 => ServerState::Bound,
      2 => ServerState::Stopping,
      _ => ServerState::Stopped,
    }
  }
  fn store(self, cell: &AtomicU8) {
    cell.store(self as u8, Ordering::Release);
  }
}

enum Pool {
  Owned(Runtime),
  External(Handle),
}

impl Pool {
  fn handle(&self) -> Handle {
    match self {
      Pool::Owned(runtime) => runtime.handle().clone(),
      Pool::External(handle) => handle.clone(),
    }
  }
}

fn owned_pool(kind: &'static str, threads: usize) -> Result<Runtime> {
  let counter = AtomicUsize::new(0);
  tokio::runtime::Builder::new_multi_thread()
    .worker_threads(threads)
    .thread_name_fn(move || {
      format!(
        "{}-{}-{}",
        NAME,
        kind,
        counter.fetch_add(1, Ordering::Relaxed)
      )
    })
    .enable_all()
    .build()
    .map_err(Error::from)
}

/// A forward proxy listening on one address.
///
/// ```rust,no_run
/// # async fn run() -> slinger_relay::Result<()> {
/// use slinger_relay::{InterceptorManager, LoggingInterceptor, ProxyConfig, ProxyServer};
/// let mut interceptors = InterceptorManager::new();
/// interceptors.add_request_interceptor(LoggingInterceptor);
/// let mut server = ProxyServer::builder(ProxyConfig::default())
///   .with_interceptors(interceptors)
///   .build();
/// let address = server.start().await?;
/// println!("listening on {}", address);
/// server.async_stop(None).await;
/// # Ok(())
/// # }
/// ```
pub struct ProxyServer {
  shared: Arc<ProxyContext>,
  acceptor: Option<Pool>,
  worker: Option<Pool>,
  external_acceptor: Option<Handle>,
  external_worker: Option<Handle>,
  state: Arc<AtomicU8>,
  bound: Arc<OnceLock<SocketAddr>>,
  shutdown: Option<watch::Sender<bool>>,
}

impl std::fmt::Debug for ProxyServer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ProxyServer")
      .field("config", &self.shared.config)
      .field("state", &self.state())
      .field("bound_address", &self.bound_address())
      .finish()
  }
}

impl ProxyServer {
  /// Start configuring a server.
  pub fn builder(config: ProxyConfig) -> ProxyServerBuilder {
    ProxyServerBuilder {
      config,
      connector: None,
      authenticator: None,
      interceptors: None,
      #[cfg(feature = "tls")]
      mitm: None,
      acceptor: None,
      worker: None,
    }
  }

  /// Current lifecycle state.
  pub fn state(&self) -> ServerState {
    ServerState::load(&self.state)
  }

  /// Actual listening address, once bound.
  pub fn bound_address(&self) -> Option<SocketAddr> {
    self.bound.get().copied()
  }

  /// The configuration this server was built with.
  pub fn config(&self) -> &ProxyConfig {
    &self.shared.config
  }

  /// Create the owned pools and bind the listener.
  ///
  /// The pools are created before this returns; binding happens on the acceptor pool
  /// and the returned future resolves with the bound address or the bind error. A server
  /// can be started once.
  pub fn start(&mut self) -> impl Future<Output = Result<SocketAddr>> + Send + 'static {
    let launched = self.launch();
    if let Err(e) = &launched {
      tracing::error!("{} start failed: {}", NAME, e);
    }
    async move {
      match launched {
        Ok(ready) => ready.await.unwrap_or_else(|_| {
          Err(Error::Other(
            "acceptor pool stopped before binding".to_string(),
          ))
        }),
        Err(e) => Err(e),
      }
    }
  }

  fn launch(&mut self) -> Result<oneshot::Receiver<Result<SocketAddr>>> {
    if self.state() != ServerState::Unbound || self.acceptor.is_some() {
      return Err(Error::Other("server already started".to_string()));
    }
    let config = &self.shared.config;
    let acceptor = match self.external_acceptor.take() {
      Some(handle) => Pool::External(handle),
      None => Pool::Owned(owned_pool("acceptor", config.acceptor_threads())?),
    };
    let worker = match self.external_worker.take() {
      Some(handle) => Pool::External(handle),
      None => match owned_pool("worker", config.worker_threads()) {
        Ok(runtime) => Pool::Owned(runtime),
        Err(e) => {
          if let Pool::Owned(runtime) = acceptor {
            runtime.shutdown_background();
          }
          return Err(e);
        }
      },
    };
    let (tx, rx) = oneshot::channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = Listener {
      shared: self.shared.clone(),
      worker: worker.handle(),
      state: self.state.clone(),
      bound: self.bound.clone(),
      shutdown: shutdown_rx,
      started: Instant::now(),
    };
    acceptor.handle().spawn(listener.run(tx));
    self.acceptor = Some(acceptor);
    self.worker = Some(worker);
    self.shutdown = Some(shutdown_tx);
    Ok(rx)
  }

  /// Stop accepting, then stop the acceptor pool and the worker pool, waiting up to
  /// `timeout_secs` (default: the configured shutdown timeout) for each. Blocks the
  /// calling thread. Pools supplied from outside are left running.
  pub fn stop(&mut self, timeout_secs: Option<u64>) {
    if let Some(stopping) = self.begin_stop(timeout_secs) {
      if stopping.join().is_err() {
        tracing::warn!("{} shutdown thread panicked", NAME);
      }
    }
  }

  /// Non-blocking form of [`ProxyServer::stop`]. The returned future completes once the
  /// owned pools have stopped or the timeout elapsed.
  pub fn async_stop(&mut self, timeout_secs: Option<u64>) -> impl Future<Output = ()> + Send + 'static {
    let (tx, rx) = oneshot::channel::<()>();
    let stopping = self.begin_stop(timeout_secs);
    std::thread::spawn(move || {
      if let Some(stopping) = stopping {
        let _ = stopping.join();
      }
      let _ = tx.send(());
    });
    async move {
      let _ = rx.await;
    }
  }

  fn begin_stop(&mut self, timeout_secs: Option<u64>) -> Option<std::thread::JoinHandle<()>> {
    match self.state() {
      ServerState::Stopping | ServerState::Stopped => return None,
      ServerState::Unbound | ServerState::Bound => {}
    }
    ServerState::Stopping.store(&self.state);
    tracing::info!("{} is stopping...", NAME);
    let timeout = timeout_secs
      .map(Duration::from_secs)
      .unwrap_or_else(|| self.shared.config.shutdown_timeout());
    if let Some(shutdown) = self.shutdown.take() {
      let _ = shutdown.send(true);
    }
    let acceptor = self.acceptor.take();
    let worker = self.worker.take();
    let state = self.state.clone();
    let spawned = std::thread::Builder::new()
      .name(format!("{}-shutdown", NAME))
      .spawn(move || {
        let started = Instant::now();
        shutdown_pool("Acceptor", acceptor, timeout);
        shutdown_pool("Worker", worker, timeout);
        ServerState::Stopped.store(&state);
        tracing::info!(
          "{} stopped in {:.3}s.",
          NAME,
          started.elapsed().as_secs_f64()
        );
      });
    match spawned {
      Ok(handle) => Some(handle),
      Err(e) => {
        tracing::error!("{} could not spawn shutdown thread: {}", NAME, e);
        ServerState::Stopped.store(&self.state);
        None
      }
    }
  }
}

fn shutdown_pool(kind: &str, pool: Option<Pool>, timeout: Duration) {
  match pool {
    Some(Pool::Owned(runtime)) => {
      let started = Instant::now();
      runtime.shutdown_timeout(timeout);
      if started.elapsed() >= timeout {
        tracing::warn!(
          "{} pool did not stop within {}s, abandoning it",
          kind,
          timeout.as_secs()
        );
      }
      tracing::info!("{} pool stopped.", kind);
    }
    Some(Pool::External(_)) => tracing::debug!("{} pool is external, left running", kind),
    None => {}
  }
}

impl Drop for ProxyServer {
  fn drop(&mut self) {
    let _ = self.begin_stop(None);
  }
}

/// Builder for [`ProxyServer`].
pub struct ProxyServerBuilder {
  config: ProxyConfig,
  connector: Option<Arc<dyn ServerConnector>>,
  authenticator: Option<Arc<dyn ProxyAuthenticator>>,
  interceptors: Option<Arc<dyn InterceptorMatcher>>,
  #[cfg(feature = "tls")]
  mitm: Option<Arc<dyn MitmManager>>,
  acceptor: Option<Handle>,
  worker: Option<Handle>,
}

impl ProxyServerBuilder {
  /// How upstream connections are opened.
  ///
  /// Default is a [`DirectServerConnector`] configured from the [`ProxyConfig`].
  pub fn with_connector<C: ServerConnector + 'static>(mut self, connector: C) -> Self {
    self.connector = Some(Arc::new(connector));
    self
  }
  /// Require proxy authentication.
  pub fn with_authenticator<A: ProxyAuthenticator + 'static>(mut self, authenticator: A) -> Self {
    self.authenticator = Some(Arc::new(authenticator));
    self
  }
  /// Interceptors to run on relayed traffic.
  pub fn with_interceptors<M: InterceptorMatcher + 'static>(mut self, interceptors: M) -> Self {
    self.interceptors = Some(Arc::new(interceptors));
    self
  }
  /// Terminate TLS inside `CONNECT` tunnels the manager selects.
  #[cfg(feature = "tls")]
  pub fn with_mitm_manager<M: MitmManager + 'static>(mut self, mitm: M) -> Self {
    self.mitm = Some(Arc::new(mitm));
    self
  }
  /// Accept connections on an existing runtime instead of an owned pool.
  pub fn with_acceptor_runtime(mut self, handle: Handle) -> Self {
    self.acceptor = Some(handle);
    self
  }
  /// Service connections on an existing runtime instead of an owned pool.
  pub fn with_worker_runtime(mut self, handle: Handle) -> Self {
    self.worker = Some(handle);
    self
  }
  /// Build the server. Nothing is bound until [`ProxyServer::start`].
  pub fn build(self) -> ProxyServer {
    let connector = self
      .connector
      .unwrap_or_else(|| Arc::new(DirectServerConnector::new(&self.config)));
    ProxyServer {
      shared: Arc::new(ProxyContext {
        config: self.config,
        connector,
        authenticator: self.authenticator,
        interceptors: self.interceptors,
        #[cfg(feature = "tls")]
        mitm: self.mitm,
      }),
      acceptor: None,
      worker: None,
      external_acceptor: self.acceptor,
      external_worker: self.worker,
      state: Arc::new(AtomicU8::new(ServerState::Unbound as u8)),
      bound: Arc::new(OnceLock::new()),
      shutdown: None,
    }
  }
}

struct Listener {
  shared: Arc<ProxyContext>,
  worker: Handle,
  state: Arc<AtomicU8>,
  bound: Arc<OnceLock<SocketAddr>>,
  shutdown: watch::Receiver<bool>,
  started: Instant,
}

impl Listener {
  async fn run(mut self, ready: oneshot::Sender<Result<SocketAddr>>) {
    let address = self.shared.config.bind_address();
    let listener = match TcpListener::bind(address).await.and_then(|listener| {
      let local = listener.local_addr()?;
      Ok((listener, local))
    }) {
      Ok(bound) => bound,
      Err(e) => {
        tracing::error!("{} start failed: {}", NAME, e);
        let _ = ready.send(Err(e.into()));
        return;
      }
    };
    let (listener, local) = listener;
    let _ = self.bound.set(local);
    if ServerState::load(&self.state) == ServerState::Unbound {
      ServerState::Bound.store(&self.state);
    }
    tracing::info!(
      "{} started in {:.3}s. Listening on: {}",
      NAME,
      self.started.elapsed().as_secs_f64(),
      local
    );
    let _ = ready.send(Ok(local));
    let mut next_id = 0u64;
    loop {
      tokio::select! {
        _ = self.shutdown.changed() => break,
        accepted = listener.accept() => match accepted {
          Ok((stream, peer)) => {
            next_id += 1;
            let info = ConnectionInfo::new(next_id, peer, local);
            tracing::debug!("{} accepted", info);
            self.worker.spawn(dispatch(self.shared.clone(), stream, info));
          }
          Err(e) => {
            tracing::warn!("{} accept failed: {}", NAME, e);
            tokio::time::sleep(Duration::from_millis(50)).await;
          }
        },
      }
    }
    tracing::debug!("{} listener on {} closed", NAME, local);
  }
}

/// Pick the protocol from the first byte and serve the connection.
async fn dispatch(shared: Arc<ProxyContext>, stream: TcpStream, info: ConnectionInfo) {
  if let Err(e) = stream.set_nodelay(true) {
    tracing::debug!("{} set_nodelay: {}", info, e);
  }
  let mut first = [0u8; 1];
  let is_socks = match stream.peek(&mut first).await {
    Ok(0) => return,
    Ok(_) => first[0] == consts::SOCKS5_VERSION,
    Err(e) => {
      tracing::debug!("{} closed before the first byte: {}", info, e);
      return;
    }
  };
  let client = Connection::new(stream);
  if is_socks {
    if let Err(e) = socks::serve(shared, info.clone(), client).await {
      report(&info, &e);
    }
    return;
  }
  let mut relay = Some(ClientRelay::new(shared, info, client));
  while let Some(current) = relay.take() {
    relay = current.run().await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn state_round_trips_through_atomic() {
    let cell = AtomicU8::new(0);
    for state in [
      ServerState::Unbound,
      ServerState::Bound,
      ServerState::Stopping,
      ServerState::Stopped,
    ] {
      state.store(&cell);
      assert_eq!(ServerState::load(&cell), state);
    }
  }

  #[test]
  fn stop_before_start_is_idempotent() {
    let mut server = ProxyServer::builder(ProxyConfig::default()).build();
    assert_eq!(server.state(), ServerState::Unbound);
    server.stop(Some(1));
    assert_eq!(server.state(), ServerState::Stopped);
    server.stop(Some(1));
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(server.bound_address().is_none());
  }

  #[test]
  fn owned_pools_bind_and_stop() {
    let config = ProxyConfig::builder()
      .bind_address("127.0.0.1:0".parse().unwrap())
      .worker_threads(2)
      .build()
      .unwrap();
    let mut server = ProxyServer::builder(config).build();
    let started = server.start();
    let address = futures::executor::block_on(started).unwrap();
    assert_ne!(address.port(), 0);
    assert_eq!(server.bound_address(), Some(address));
    assert_eq!(server.state(), ServerState::Bound);
    assert!(futures::executor::block_on(server.start()).is_err());
    server.stop(Some(5));
    assert_eq!(server.state(), ServerState::Stopped);
  }
}
