use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use rustls::crypto::ring;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

/// Cipher suites accepted by the events API listener: ECDHE-only AES-GCM and
/// CHACHA20-POLY1305 for TLS 1.2, plus the TLS 1.3 defaults.
static API_CIPHER_SUITES: &[rustls::SupportedCipherSuite] = &[
    ring::cipher_suite::TLS13_AES_256_GCM_SHA384,
    ring::cipher_suite::TLS13_AES_128_GCM_SHA256,
    ring::cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
    ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    ring::cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
];

fn restricted_kx_groups() -> Vec<&'static dyn rustls::crypto::SupportedKxGroup> {
    vec![ring::kx_group::SECP256R1, ring::kx_group::X25519]
}

pub fn install_default_crypto_provider() {
    if ring::default_provider().install_default().is_err() {
        let installed_provider = rustls::crypto::CryptoProvider::get_default();
        debug!(?installed_provider, "default crypto provider is already installed");
    }
}

/// Server configuration for the events API listener: TLS 1.2 minimum,
/// restricted cipher suites and curves, HTTP/2 disabled.
pub fn build_api_server_config(
    certificates: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
) -> anyhow::Result<rustls::ServerConfig> {
    let mut provider = ring::default_provider();
    provider.cipher_suites = API_CIPHER_SUITES.to_vec();
    provider.kx_groups = restricted_kx_groups();

    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .context("unsupported protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certificates, private_key)
        .context("failed to set server config cert")?;

    // The API speaks HTTP/1.1 only.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(config)
}

/// Server configuration for the catch-all TLS listeners: curves restricted,
/// no minimum-version tightening so that legacy targets still interact.
pub fn build_receiver_server_config(
    certificates: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
) -> anyhow::Result<rustls::ServerConfig> {
    let mut provider = ring::default_provider();
    provider.kx_groups = restricted_kx_groups();

    rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()
        .context("unsupported protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certificates, private_key)
        .context("failed to set server config cert")
}

pub fn load_certificates(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("couldn't open {}", path.display()))?,
    );
    let certificates = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("malformed certificate file")?;
    anyhow::ensure!(
        !certificates.is_empty(),
        "no certificate found in {}",
        path.display()
    );
    Ok(certificates)
}

pub fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("couldn't open {}", path.display()))?,
    );
    rustls_pemfile::private_key(&mut reader)
        .context("malformed private key file")?
        .with_context(|| format!("no private key found in {}", path.display()))
}
