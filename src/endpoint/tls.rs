//! TLS material for the link envelope.
//!
//! A non-empty security directory turns the link into mutual TLS:
//! - dialing side: `client.pem` / `client.key` presented as the client
//!   certificate; `ca.pem` is the root store when server verification is
//!   on (the default)
//! - accepting side: `server.pem` / `server.key`, with `ca.pem` as the
//!   client CA pool; client certificates are required and verified
//!
//! Missing or malformed files are configuration errors, fatal for the
//! endpoint at startup.

use crate::{Error, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Load a TLS certificate chain from a PEM file.
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::Config(format!("open {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("parse {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load a TLS private key from a PEM file.
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::Config(format!("open {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Config(format!("parse {}: {}", path.display(), e)))?
        .ok_or_else(|| Error::Config(format!("no private key in {}", path.display())))
}

/// Load a CA pool from a PEM file.
fn load_ca_pool(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| Error::Config(format!("bad CA certificate in {}: {}", path.display(), e)))?;
    }
    Ok(roots)
}

/// TLS configuration for the dialing side.
pub(crate) fn client_config(secpath: &Path, verify: bool) -> Result<ClientConfig> {
    let certs = load_certs(&secpath.join("client.pem"))?;
    let key = load_private_key(&secpath.join("client.key"))?;

    let config = if verify {
        let roots = load_ca_pool(&secpath.join("ca.pem"))?;
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
    } else {
        warn!("server certificate verification disabled");
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
            .with_client_auth_cert(certs, key)
    }
    .map_err(|e| Error::Tls(e.to_string()))?;

    info!("tls client material loaded from {}", secpath.display());
    Ok(config)
}

/// TLS configuration for the accepting side: mutual TLS, client
/// certificates required.
pub(crate) fn server_config(secpath: &Path) -> Result<ServerConfig> {
    let certs = load_certs(&secpath.join("server.pem"))?;
    let key = load_private_key(&secpath.join("server.key"))?;
    let roots = load_ca_pool(&secpath.join("ca.pem"))?;

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| Error::Tls(e.to_string()))?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))?;

    info!("tls server material loaded from {}", secpath.display());
    Ok(config)
}

/// Skips server certificate validation. Signatures are still checked, but
/// the chain and name are not; only for deployments that pin trust
/// elsewhere and set `verify = false` explicitly.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_missing_material_is_config_error() {
        let missing = PathBuf::from("/nonexistent/secdir");
        assert!(matches!(
            client_config(&missing, true),
            Err(Error::Config(_))
        ));
        assert!(matches!(server_config(&missing), Err(Error::Config(_))));
    }
}
