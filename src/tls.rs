//! TLS security layers: load certificates from PEM files, wrap a session's
//! stream for the client (StartTLS / ldaps) or the server (accept) side.

use crate::error::LdapError;
use crate::session::{BoxStream, SecurityLayer};
use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::fs;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Client-side TLS upgrade: connects with the configured trust roots and
/// verifies the given server name.
pub struct TlsClient {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsClient {
    pub fn new(config: Arc<rustls::ClientConfig>, server_name: &str) -> Result<Self, LdapError> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| LdapError::Connection(format!("invalid server name: {server_name}")))?;
        Ok(Self {
            connector: TlsConnector::from(config),
            server_name,
        })
    }

    /// Trust the CAs in a PEM bundle file.
    pub fn from_ca_file(server_name: &str, ca_file: &str) -> Result<Self, LdapError> {
        let mut roots = rustls::RootCertStore::empty();
        for cert in load_certs_from_file(ca_file)? {
            roots.add(cert).map_err(|e| {
                LdapError::Connection(format!("rejected CA certificate in {ca_file}: {e}"))
            })?;
        }
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self::new(Arc::new(config), server_name)
    }
}

#[async_trait]
impl SecurityLayer for TlsClient {
    async fn secure(&self, stream: BoxStream) -> Result<BoxStream, LdapError> {
        let tls = self
            .connector
            .connect(self.server_name.clone(), stream)
            .await
            .map_err(|e| LdapError::Connection(format!("TLS handshake failed: {e}")))?;
        Ok(Box::new(tls))
    }
}

/// Server-side TLS upgrade: accepts with the configured certificate chain.
pub struct TlsServer {
    acceptor: TlsAcceptor,
}

impl TlsServer {
    pub fn new(config: Arc<rustls::ServerConfig>) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
        }
    }

    /// Build from PEM certificate chain and private key files.
    pub fn from_pem_files(cert_file: &str, key_file: &str) -> Result<Self, LdapError> {
        let certs = load_certs_from_file(cert_file)?;
        let key = load_private_key_from_file(key_file)?;
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| {
                LdapError::Connection(format!("building the TLS server config failed: {e}"))
            })?;
        Ok(Self::new(Arc::new(config)))
    }
}

#[async_trait]
impl SecurityLayer for TlsServer {
    async fn secure(&self, stream: BoxStream) -> Result<BoxStream, LdapError> {
        let tls = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| LdapError::Connection(format!("TLS handshake failed: {e}")))?;
        Ok(Box::new(tls))
    }
}

fn load_certs_from_file(path: &str) -> Result<Vec<CertificateDer<'static>>, LdapError> {
    let file = fs::File::open(path)
        .map_err(|e| LdapError::Connection(format!("open cert file {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| LdapError::Connection(format!("parse PEM certificates in {path}: {e}")))?;
    if certs.is_empty() {
        return Err(LdapError::Connection(format!(
            "no certificates found in {path}"
        )));
    }
    Ok(certs)
}

fn load_private_key_from_file(path: &str) -> Result<PrivateKeyDer<'static>, LdapError> {
    let file = fs::File::open(path)
        .map_err(|e| LdapError::Connection(format!("open key file {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    let pkcs8: Vec<_> = pkcs8_private_keys(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| LdapError::Connection(format!("parse PEM PKCS8 keys in {path}: {e}")))?;
    if let Some(key) = pkcs8.into_iter().next() {
        return Ok(key.into());
    }
    let file = fs::File::open(path)
        .map_err(|e| LdapError::Connection(format!("open key file {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    let rsa: Vec<_> = rsa_private_keys(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| LdapError::Connection(format!("parse PEM RSA keys in {path}: {e}")))?;
    rsa.into_iter()
        .next()
        .map(Into::into)
        .ok_or_else(|| LdapError::Connection(format!("no private key found in {path}")))
}
