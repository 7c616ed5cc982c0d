//! Mutual TLS credentials for container links.
//!
//! Every container certificate chains to the network CA and names the
//! container in its DNS subject alternative name.  Dialers verify the peer
//! against the remote container name, listeners require a client
//! certificate from the same CA.  A container may hold several credentials,
//! looked up by alias (seed connection requests name the alias to dial with).
//! Alias credentials must still name the container, since accepting peers
//! only accept messages from the container the client certificate names.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use webpki::EndEntityCert;

use crate::error::NetworkError;

/// File name of the network CA under the key base path.
pub const CA_FILE: &str = "ca.pem";

/// Client and server halves of one credential.
#[derive(Clone)]
pub struct TlsConfig {
    client_config: Arc<ClientConfig>,
    server_config: Arc<ServerConfig>,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish_non_exhaustive()
    }
}

impl TlsConfig {
    pub fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder::default()
    }

    /// Loads `ca.pem`, `<alias>.pem` and `<alias>.key` from `base`.
    pub fn from_key_directory(base: &Path, alias: &str) -> Result<Self, NetworkError> {
        let read = |file: String| {
            std::fs::read(base.join(&file))
                .map_err(|e| NetworkError::Certificate(format!("cannot read {file}: {e}")))
        };
        Self::builder()
            .ca_cert_pem(read(CA_FILE.to_owned())?)
            .node_cert_pem(read(format!("{alias}.pem"))?)
            .node_key_pem(read(format!("{alias}.key"))?)
            .build()
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.client_config.clone())
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.server_config.clone())
    }
}

#[derive(Default)]
pub struct TlsConfigBuilder {
    ca_cert_pem: Option<Vec<u8>>,
    node_cert_pem: Option<Vec<u8>>,
    node_key_pem: Option<Vec<u8>>,
}

impl TlsConfigBuilder {
    #[must_use]
    pub fn ca_cert_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.ca_cert_pem = Some(pem.into());
        self
    }

    #[must_use]
    pub fn node_cert_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.node_cert_pem = Some(pem.into());
        self
    }

    #[must_use]
    pub fn node_key_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.node_key_pem = Some(pem.into());
        self
    }

    pub fn build(self) -> Result<TlsConfig, NetworkError> {
        let ca_pem = self
            .ca_cert_pem
            .ok_or_else(|| NetworkError::TlsConfig("CA certificate required".into()))?;
        let node_cert_pem = self
            .node_cert_pem
            .ok_or_else(|| NetworkError::TlsConfig("container certificate required".into()))?;
        let node_key_pem = self
            .node_key_pem
            .ok_or_else(|| NetworkError::TlsConfig("container private key required".into()))?;

        let ca_certs = parse_certificates(&ca_pem)?;
        if ca_certs.is_empty() {
            return Err(NetworkError::Certificate("no CA certificates found".into()));
        }
        let mut root_store = RootCertStore::empty();
        for cert in ca_certs {
            root_store
                .add(cert)
                .map_err(|e| NetworkError::Certificate(format!("failed to add CA certificate: {e}")))?;
        }

        let node_certs = parse_certificates(&node_cert_pem)?;
        if node_certs.is_empty() {
            return Err(NetworkError::Certificate(
                "no container certificates found".into(),
            ));
        }
        let node_key = PrivateKeyDer::from_pem_slice(&node_key_pem)
            .map_err(|e| NetworkError::PrivateKey(format!("failed to parse private key: {e}")))?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let client_config = client_config(
            provider.clone(),
            root_store.clone(),
            node_certs.clone(),
            node_key.clone_key(),
        )?;

        // Inbound links must present a certificate from the same CA.
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(root_store), provider.clone())
            .build()
            .map_err(|e| NetworkError::TlsConfig(format!("client verifier error: {e}")))?;
        let server_config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| NetworkError::TlsConfig(format!("protocol versions: {e}")))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(node_certs, node_key)
            .map_err(|e| NetworkError::TlsConfig(format!("server config error: {e}")))?;

        Ok(TlsConfig {
            client_config: Arc::new(client_config),
            server_config: Arc::new(server_config),
        })
    }
}

fn client_config(
    provider: Arc<CryptoProvider>,
    roots: RootCertStore,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ClientConfig, NetworkError> {
    ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| NetworkError::TlsConfig(format!("protocol versions: {e}")))?
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| NetworkError::TlsConfig(format!("client config error: {e}")))
}

/// True when the end-entity certificate `der` is issued for `container`.
///
/// The chain itself was verified by the handshake; this only checks the
/// subject alternative names.
pub fn certificate_names(der: &CertificateDer<'_>, container: &str) -> bool {
    let Ok(certificate) = EndEntityCert::try_from(der) else {
        return false;
    };
    let Ok(name) = ServerName::try_from(container) else {
        return false;
    };
    certificate.verify_is_valid_for_subject_name(&name).is_ok()
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, NetworkError> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| NetworkError::Certificate(format!("failed to parse certificates: {e}")))
}

/// Local credentials, keyed by alias.
#[derive(Default)]
pub struct Credentials {
    default_alias: String,
    by_alias: RwLock<HashMap<String, TlsConfig>>,
}

impl Credentials {
    /// Creates the table with the container's own credential as default.
    pub fn new(default_alias: impl Into<String>, config: TlsConfig) -> Self {
        let default_alias = default_alias.into();
        let mut by_alias = HashMap::new();
        by_alias.insert(default_alias.clone(), config);
        Self {
            default_alias,
            by_alias: RwLock::new(by_alias),
        }
    }

    pub fn insert(&self, alias: impl Into<String>, config: TlsConfig) {
        self.by_alias.write().insert(alias.into(), config);
    }

    pub fn get(&self, alias: &str) -> Result<TlsConfig, NetworkError> {
        self.by_alias
            .read()
            .get(alias)
            .cloned()
            .ok_or_else(|| NetworkError::UnknownCredential(alias.to_owned()))
    }

    pub fn default_alias(&self) -> &str {
        &self.default_alias
    }

    /// The container's own credential, used by the listener.
    pub fn default_config(&self) -> Result<TlsConfig, NetworkError> {
        self.get(&self.default_alias)
    }
}
