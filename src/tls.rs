//! TLS material production is formally out of scope for this crate (spec
//! §1: "the core consumes a pre-built TLS configuration") — `transport`
//! takes an already-constructed `Arc<rustls::ClientConfig>` /
//! `Arc<rustls::ServerConfig>`. This module exists only to build those
//! configurations for local testing and single-binary deployments where
//! nothing else in the process already produces one; it is a convenience,
//! not part of the fabric's invariants.
//!
//! Mutual TLS is mandatory (spec §6): both the server acceptor and the
//! client connector here require and verify a peer certificate, unlike a
//! plain HTTPS-style one-way handshake.

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rcgen::{CertificateParams, KeyPair};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{info, warn};

const SESSION_CACHE_SIZE: usize = 1024;

/// Generate a self-signed certificate under `cert_path`/`key_path` if
/// they do not already exist. In a real cluster every node is typically
/// signed by a shared CA instead; this is the dev/test fallback.
pub fn ensure_self_signed_cert(
    cert_path: &Path,
    key_path: &Path,
    common_name: &str,
) -> anyhow::Result<()> {
    if cert_path.exists() && key_path.exists() {
        info!(
            cert = %cert_path.display(),
            key = %key_path.display(),
            "using existing TLS certificate"
        );
        return Ok(());
    }

    info!(common_name, "generating self-signed TLS certificate");

    let mut params = CertificateParams::new(vec!["localhost".into(), common_name.to_string()])?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, common_name);

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    fs::write(cert_path, cert.pem())?;
    fs::write(key_path, key_pair.serialize_pem())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(key_path, fs::Permissions::from_mode(0o600))?;
    }

    info!(
        cert = %cert_path.display(),
        key = %key_path.display(),
        "self-signed TLS certificate generated"
    );

    Ok(())
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path)?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file)).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = fs::File::open(path)?;
    rustls_pemfile::private_key(&mut BufReader::new(file))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", path.display()))
}

/// Build a mutual-TLS `TlsAcceptor`: presents `cert_path`/`key_path` and
/// requires the connecting peer to present a certificate signed by
/// `ca_path`.
pub fn build_server_acceptor(
    cert_path: &Path,
    key_path: &Path,
    ca_path: &Path,
) -> anyhow::Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let mut roots = RootCertStore::empty();
    for ca_cert in load_certs(ca_path)? {
        roots.add(ca_cert)?;
    }
    let client_verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build()?;

    let mut config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(certs, key)?;

    config.session_storage = rustls::server::ServerSessionMemoryCache::new(SESSION_CACHE_SIZE);
    match rustls::crypto::ring::Ticketer::new() {
        Ok(ticketer) => config.ticketer = ticketer,
        Err(e) => warn!(error = %e, "failed to init TLS ticketer; tickets disabled"),
    }

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build a mutual-TLS `TlsConnector`: presents `cert_path`/`key_path` as
/// its own client certificate and trusts peers signed by `ca_path`.
pub fn build_client_connector(
    cert_path: &Path,
    key_path: &Path,
    ca_path: &Path,
) -> anyhow::Result<TlsConnector> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let mut roots = RootCertStore::empty();
    for ca_cert in load_certs(ca_path)? {
        roots.add(ca_cert)?;
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)?;

    Ok(TlsConnector::from(Arc::new(config)))
}

/// SHA-256 fingerprint of the first certificate in a PEM file, hex
/// encoded, used for out-of-band identity logging.
pub fn cert_sha256_fingerprint(cert_path: &Path) -> anyhow::Result<String> {
    let certs = load_certs(cert_path)?;
    let cert = certs.first().expect("load_certs guarantees non-empty");
    Ok(hex::encode(Sha256::digest(cert.as_ref())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile_like::TempDir;

    /// Tiny self-contained temp-dir helper so this module doesn't need a
    /// `tempfile` dev-dependency for a handful of filesystem tests.
    mod tempfile_like {
        use std::path::PathBuf;

        pub struct TempDir(pub PathBuf);

        impl TempDir {
            pub fn new() -> Self {
                let mut dir = std::env::temp_dir();
                let nanos = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap()
                    .as_nanos();
                dir.push(format!("rpcfabric-tls-test-{nanos}"));
                std::fs::create_dir_all(&dir).unwrap();
                Self(dir)
            }

            pub fn path(&self) -> &std::path::Path {
                &self.0
            }
        }

        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }

    #[test]
    fn self_signed_cert_is_created_once() {
        let dir = TempDir::new();
        let cert = dir.path().join("node.pem");
        let key = dir.path().join("node-key.pem");

        ensure_self_signed_cert(&cert, &key, "node-a").unwrap();
        assert!(cert.exists());
        assert!(key.exists());

        let cert_contents_before = fs::read(&cert).unwrap();
        ensure_self_signed_cert(&cert, &key, "node-a").unwrap();
        let cert_contents_after = fs::read(&cert).unwrap();
        assert_eq!(cert_contents_before, cert_contents_after, "must not regenerate");
    }

    #[test]
    fn fingerprint_is_stable_hex_sha256() {
        let dir = TempDir::new();
        let cert = dir.path().join("node.pem");
        let key = dir.path().join("node-key.pem");
        ensure_self_signed_cert(&cert, &key, "node-b").unwrap();

        let fp1 = cert_sha256_fingerprint(&cert).unwrap();
        let fp2 = cert_sha256_fingerprint(&cert).unwrap();
        assert_eq!(fp1, fp2);
        assert_eq!(fp1.len(), 64);
        assert!(fp1.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
