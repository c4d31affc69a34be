//! TLS material for the OAuth callback listener.
//!
//! Spotify requires an https redirect URI, so the listener serves a
//! self-signed certificate issued for the host's mDNS name. The PEM pair
//! is generated once and reused across restarts; users accept the browser
//! warning a single time.

use anyhow::Context;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use deckspot_proto::platform;

pub fn load_or_generate(cert_file: &Path, key_file: &Path) -> anyhow::Result<TlsAcceptor> {
    if !cert_file.is_file() || !key_file.is_file() {
        let host = platform::mdns_host();
        info!(
            "TLS certificate not found at {}, generating for {}",
            cert_file.display(),
            host
        );
        let issued = rcgen::generate_simple_self_signed(vec![host])
            .context("certificate generation failed")?;
        if let Some(parent) = cert_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(cert_file, issued.cert.pem())?;
        std::fs::write(key_file, issued.key_pair.serialize_pem())?;
    }

    let certs = load_certs(cert_file)
        .with_context(|| format!("failed to load certificate {}", cert_file.display()))?;
    let key = load_key(key_file)
        .with_context(|| format!("failed to load private key {}", key_file.display()))?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file)).collect::<Result<Vec<_>, _>>()?;
    anyhow::ensure!(!certs.is_empty(), "no certificates in file");
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)?;
    rustls_pemfile::private_key(&mut BufReader::new(file))?
        .ok_or_else(|| anyhow::anyhow!("no private key in file"))
}
