//! Deciding which tunnels to intercept, and the TLS configuration used for them.
use crate::errors::{builder, Result};
use crate::tls::{Certificate, Identity, NoVerifier};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_rustls::rustls;

/// Supplies TLS configuration for intercepted tunnels.
///
/// Consulted once per `CONNECT`. Shared by every connection, so implementations must
/// be safe for concurrent use.
pub trait MitmManager: Send + Sync {
  /// Server-side configuration presented to the client for `host`, or `None` to relay
  /// the tunnel without looking inside.
  fn server_config(&self, host: &str) -> Option<Arc<rustls::ServerConfig>>;
  /// Client-side configuration for the connection to the real server.
  fn client_config(&self) -> Arc<rustls::ClientConfig>;
}

/// Presents one fixed certificate to every intercepted client.
///
/// Clients must trust that certificate for interception to succeed, so this suits
/// test setups and tools that control the client's trust store.
#[derive(Debug, Clone)]
pub struct FixedCertificateMitm {
  server: Arc<rustls::ServerConfig>,
  client: Arc<rustls::ClientConfig>,
  hosts: Option<HashSet<String>>,
}

impl FixedCertificateMitm {
  /// Start configuring with a PEM identity (certificate chain and private key).
  pub fn builder(identity_pem: &[u8]) -> Result<FixedCertificateMitmBuilder> {
    Ok(FixedCertificateMitmBuilder {
      identity: Identity::from_pem(identity_pem)?,
      roots: Vec::new(),
      accept_invalid_certs: false,
      hosts: None,
    })
  }
}

impl MitmManager for FixedCertificateMitm {
  fn server_config(&self, host: &str) -> Option<Arc<rustls::ServerConfig>> {
    match &self.hosts {
      Some(hosts) if !hosts.contains(&host.to_ascii_lowercase()) => None,
      _ => Some(self.server.clone()),
    }
  }
  fn client_config(&self) -> Arc<rustls::ClientConfig> {
    self.client.clone()
  }
}

/// Builder for [`FixedCertificateMitm`].
#[derive(Debug)]
pub struct FixedCertificateMitmBuilder {
  identity: Identity,
  roots: Vec<Certificate>,
  accept_invalid_certs: bool,
  hosts: Option<HashSet<String>>,
}

impl FixedCertificateMitmBuilder {
  /// Trust `certificate` when verifying upstream servers.
  pub fn add_root_certificate(mut self, certificate: Certificate) -> Self {
    self.roots.push(certificate);
    self
  }
  /// Skip verification of upstream server certificates.
  ///
  /// # Warning
  ///
  /// Any certificate for any site will be trusted, including expired ones.
  pub fn danger_accept_invalid_certs(mut self, value: bool) -> Self {
    self.accept_invalid_certs = value;
    self
  }
  /// Only intercept `host`. May be called repeatedly; without any call every host is
  /// intercepted.
  pub fn intercept_host<H: AsRef<str>>(mut self, host: H) -> Self {
    self
      .hosts
      .get_or_insert_with(HashSet::new)
      .insert(host.as_ref().to_ascii_lowercase());
    self
  }
  /// Build the manager.
  pub fn build(self) -> Result<FixedCertificateMitm> {
    let provider = rustls::crypto::CryptoProvider::get_default()
      .cloned()
      .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));
    let server = self.identity.into_server_config(provider.clone())?;
    let config_builder = rustls::ClientConfig::builder_with_provider(provider)
      .with_safe_default_protocol_versions()
      .map_err(builder)?;
    let mut client = if self.accept_invalid_certs {
      config_builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth()
    } else {
      let mut root_cert_store = rustls::RootCertStore::empty();
      for cert in self.roots {
        cert.add_to_tls(&mut root_cert_store)?;
      }
      config_builder
        .with_root_certificates(root_cert_store)
        .with_no_client_auth()
    };
    client.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(FixedCertificateMitm {
      server: Arc::new(server),
      client: Arc::new(client),
      hosts: self.hosts,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const IDENTITY: &[u8] = include_bytes!("../tests/fixtures/identity.pem");

  #[test]
  fn intercepts_every_host_by_default() {
    let mitm = FixedCertificateMitm::builder(IDENTITY)
      .unwrap()
      .danger_accept_invalid_certs(true)
      .build()
      .unwrap();
    assert!(mitm.server_config("example.com").is_some());
    assert_eq!(mitm.client_config().alpn_protocols, [b"http/1.1".to_vec()]);
  }

  #[test]
  fn host_list_limits_interception() {
    let mitm = FixedCertificateMitm::builder(IDENTITY)
      .unwrap()
      .intercept_host("Example.com")
      .build()
      .unwrap();
    assert!(mitm.server_config("example.com").is_some());
    assert!(mitm.server_config("other.example").is_none());
  }

  #[test]
  fn rejects_identity_without_key() {
    let cert = include_bytes!("../tests/fixtures/cert.pem");
    assert!(FixedCertificateMitm::builder(cert).is_err());
  }
}
