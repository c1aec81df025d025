use std::sync::Arc;

use anyhow::Result;
use rustls::pki_types::PrivateKeyDer;

use shared::utils::ensure_crypto_provider;

/// Self signed server material for tests. The certificate doubles as its
/// own CA, so `ca_pem` can be written to a bundle file to make validation
/// succeed against it.
pub struct TestCert {
    pub server_config: Arc<rustls::ServerConfig>,
    pub ca_pem: String,
}

pub fn self_signed() -> Result<TestCert> {
    ensure_crypto_provider();
    let certified = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ])?;
    let ca_pem = certified.cert.pem();
    let cert_der = certified.cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(certified.signing_key.serialize_der().into());
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)?;
    Ok(TestCert {
        server_config: Arc::new(server_config),
        ca_pem,
    })
}

/// Writes the CA material to a unique temp file and returns its path.
/// Callers point CERTIFICATE_BUNDLE_PATH at it.
pub fn write_ca_bundle(cert: &TestCert, tag: &str) -> Result<std::path::PathBuf> {
    let path = std::env::temp_dir().join(format!(
        "uds-test-ca-{}-{}.pem",
        std::process::id(),
        tag
    ));
    std::fs::write(&path, &cert.ca_pem)?;
    Ok(path)
}
