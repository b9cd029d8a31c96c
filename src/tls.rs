//! TLS material for interception
//!
use crate::errors::{builder, Result};
use std::io::BufRead;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{ServerName, UnixTime};
use tokio_rustls::rustls::{
  client::danger::HandshakeSignatureValid, client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier, DigitallySignedStruct, Error as TLSError, RootCertStore,
  SignatureScheme,
};

/// Represents a trusted X509 root certificate.
#[derive(Clone, Debug)]
pub struct Certificate {
  original: Cert,
}
#[derive(Clone, Debug)]
enum Cert {
  Der(Vec<u8>),
  Pem(Vec<u8>),
}
impl Certificate {
  /// Create a `Certificate` from a binary DER encoded certificate
  pub fn from_der(der: &[u8]) -> Result<Certificate> {
    Ok(Certificate {
      original: Cert::Der(der.to_owned()),
    })
  }

  /// Create a `Certificate` from a PEM encoded certificate
  ///
  /// # Examples
  ///
  /// ```
  /// # use std::fs::File;
  /// # use std::io::Read;
  /// # fn cert() -> Result<(), Box<dyn std::error::Error>> {
  /// let mut buf = Vec::new();
  /// File::open("my_cert.pem")?
  ///     .read_to_end(&mut buf)?;
  /// let cert = slinger_relay::tls::Certificate::from_pem(&buf)?;
  /// # drop(cert);
  /// # Ok(())
  /// # }
  /// ```
  pub fn from_pem(pem: &[u8]) -> Result<Certificate> {
    Ok(Certificate {
      original: Cert::Pem(pem.to_owned()),
    })
  }

  pub(crate) fn add_to_tls(self, root_cert_store: &mut RootCertStore) -> Result<()> {
    match self.original {
      Cert::Der(buf) => root_cert_store.add(buf.into()).map_err(builder)?,
      Cert::Pem(buf) => {
        let mut reader = std::io::Cursor::new(buf);
        for c in read_pem_certs(&mut reader)? {
          root_cert_store.add(c).map_err(builder)?;
        }
      }
    }
    Ok(())
  }
}

fn read_pem_certs(
  reader: &mut impl BufRead,
) -> Result<Vec<rustls_pki_types::CertificateDer<'static>>> {
  rustls_pemfile::certs(reader)
    .map(|result| result.map_err(|_| builder("invalid certificate encoding")))
    .collect()
}

/// A certificate chain and its private key, presented to intercepted clients.
pub struct Identity {
  key: rustls_pki_types::PrivateKeyDer<'static>,
  certs: Vec<rustls_pki_types::CertificateDer<'static>>,
}

impl Clone for Identity {
  fn clone(&self) -> Self {
    Identity {
      key: self.key.clone_key(),
      certs: self.certs.clone(),
    }
  }
}

impl std::fmt::Debug for Identity {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Identity")
      .field("certs", &self.certs.len())
      .finish_non_exhaustive()
  }
}

impl Identity {
  /// Parses PEM encoded private key and certificate.
  ///
  /// The input should contain a PEM encoded private key
  /// and at least one PEM encoded certificate.
  ///
  /// Note: The private key must be in RSA, SEC1 Elliptic Curve or PKCS#8 format.
  pub fn from_pem(buf: &[u8]) -> Result<Identity> {
    use rustls_pemfile::Item;

    let mut pem = std::io::Cursor::new(buf);
    let mut sk = Vec::<rustls_pki_types::PrivateKeyDer>::new();
    let mut certs = Vec::<rustls_pki_types::CertificateDer>::new();

    for result in rustls_pemfile::read_all(&mut pem) {
      match result {
        Ok(Item::X509Certificate(cert)) => certs.push(cert),
        Ok(Item::Pkcs1Key(key)) => sk.push(key.into()),
        Ok(Item::Pkcs8Key(key)) => sk.push(key.into()),
        Ok(Item::Sec1Key(key)) => sk.push(key.into()),
        Ok(_) => continue,
        Err(_) => {
          return Err(builder(TLSError::General(String::from(
            "Invalid identity PEM file",
          ))))
        }
      }
    }

    match (sk.pop(), certs.is_empty()) {
      (Some(key), false) => Ok(Identity { key, certs }),
      _ => Err(builder(TLSError::General(String::from(
        "private key or certificate not found",
      )))),
    }
  }

  pub(crate) fn into_server_config(
    self,
    provider: std::sync::Arc<rustls::crypto::CryptoProvider>,
  ) -> Result<rustls::ServerConfig> {
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
      .with_safe_default_protocol_versions()
      .map_err(builder)?
      .with_no_client_auth()
      .with_single_cert(self.certs, self.key)
      .map_err(builder)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
  }
}

/// Accepts any server certificate.
#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &rustls_pki_types::CertificateDer,
    _intermediates: &[rustls_pki_types::CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &rustls_pki_types::CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &rustls_pki_types::CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const IDENTITY: &[u8] = include_bytes!("../tests/fixtures/identity.pem");
  const CERT: &[u8] = include_bytes!("../tests/fixtures/cert.pem");

  #[test]
  fn identity_needs_key_and_certificate() {
    let identity = Identity::from_pem(IDENTITY).unwrap();
    assert_eq!(identity.certs.len(), 1);
    assert!(Identity::from_pem(CERT).is_err());
  }

  #[test]
  fn pem_root_is_added() {
    let mut roots = RootCertStore::empty();
    Certificate::from_pem(CERT)
      .unwrap()
      .add_to_tls(&mut roots)
      .unwrap();
    assert_eq!(roots.len(), 1);
  }
}
