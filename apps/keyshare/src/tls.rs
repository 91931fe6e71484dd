//! TLS for the HTTP listener.
//!
//! Builds a rustls server configuration from PEM material read by
//! [`Settings::load_tls_material`](crate::config::Settings::load_tls_material).
//! Any problem with the certificate chain or key is fatal at startup.
//!
//! ```ignore
//! let config = tls::load_server_config(&material)?;
//! server.bind_rustls_0_23(addr, config)?.run().await
//! ```

use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::config::TlsMaterial;
use crate::error::{KeyshareError, KeyshareResult};

/// Parse a PEM certificate chain.
fn parse_certs(pem: &[u8]) -> KeyshareResult<Vec<CertificateDer<'static>>> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| KeyshareError::TlsConfig(format!("Failed to parse certificates: {e}")))?;

    if certs.is_empty() {
        return Err(KeyshareError::TlsConfig(
            "No certificates found in TLS certificate PEM".to_string(),
        ));
    }

    Ok(certs)
}

/// Parse a PEM private key.
///
/// Supports PKCS#8, RSA, and EC private keys.
fn parse_private_key(pem: &[u8]) -> KeyshareResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| KeyshareError::TlsConfig(format!("Failed to parse private key: {e}")))?
        .ok_or_else(|| {
            KeyshareError::TlsConfig("No private key found in TLS key PEM".to_string())
        })
}

/// Build the server TLS configuration.
///
/// The ring provider is selected explicitly so the result does not depend
/// on which rustls crypto features other crates enable.
pub fn load_server_config(material: &TlsMaterial) -> KeyshareResult<ServerConfig> {
    let cert_chain = parse_certs(&material.cert_chain)?;
    let private_key = parse_private_key(&material.private_key)?;
    let chain_len = cert_chain.len();

    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| KeyshareError::TlsConfig(format!("Unsupported protocol versions: {e}")))?
    .with_no_client_auth()
    .with_single_cert(cert_chain, private_key)
    .map_err(|e| KeyshareError::TlsConfig(format!("Failed to build server config: {e}")))?;

    tracing::info!(chain_len, "Loaded TLS server configuration");
    Ok(config)
}

/// Check if PEM file permissions are secure (not world-readable).
///
/// Logs a warning if the file is readable by group or others.
#[cfg(unix)]
pub fn check_key_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(metadata) = std::fs::metadata(path) {
        let mode = metadata.permissions().mode();
        if mode & 0o044 != 0 {
            tracing::warn!(
                path = %path.display(),
                mode = format!("{mode:o}"),
                "TLS private key file has overly permissive permissions. \
                 Consider running: chmod 600 {}",
                path.display()
            );
        }
    }
}

#[cfg(not(unix))]
pub fn check_key_permissions(_path: &Path) {}


#[cfg(test)]
mod tests {
    use super::*;
    use zeroize::Zeroizing;

    fn material(cert: &str, key: &str) -> TlsMaterial {
        TlsMaterial {
            cert_chain: Zeroizing::new(cert.as_bytes().to_vec()),
            private_key: Zeroizing::new(key.as_bytes().to_vec()),
        }
    }

    #[test]
    fn test_load_server_config() {
        let (cert, key) = test_support::self_signed_pems();
        let config = load_server_config(&material(&cert, &key));
        assert!(config.is_ok(), "Failed to load server config: {config:?}");
    }

    #[test]
    fn test_malformed_certificate_rejected() {
        let (_, key) = test_support::self_signed_pems();
        let result = load_server_config(&material("not a certificate", &key));
        assert!(matches!(result, Err(KeyshareError::TlsConfig(_))));
    }

    #[test]
    fn test_missing_private_key_rejected() {
        let (cert, _) = test_support::self_signed_pems();
        let result = load_server_config(&material(&cert, &cert));
        assert!(matches!(result, Err(KeyshareError::TlsConfig(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_check_key_permissions_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tls.key");
        std::fs::write(&path, "key").unwrap();
        check_key_permissions(&path);
        check_key_permissions(&dir.path().join("missing.key"));
    }
}
