// BSD 3-Clause License
// Copyright (c) 2026, Virtual Cable S.L.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice,
//    this list of conditions and the following disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice,
//    this list of conditions and the following disclaimer in the documentation
//    and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors
//    may be used to endorse or promote products derived from this software
//    without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS"
// AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
// IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE
// FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
// DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER
// CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY,
// OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

// Authors: Adolfo Gómez, dkmaster at dkmon dot com
use std::{net::IpAddr, sync::Arc};

use anyhow::{Result, anyhow};
use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::aws_lc_rs::cipher_suite,
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use x509_parser::prelude::{FromDer, X509Certificate};

use shared::{log, utils};

use crate::security::trust;

// The broker channel cipher selection (SECURE_CIPHERS), as rustls suites
const BROKER_SUITES: &[rustls::SupportedCipherSuite] = &[
    cipher_suite::TLS13_AES_256_GCM_SHA384,
    cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
    cipher_suite::TLS13_AES_128_GCM_SHA256,
    cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
];

fn root_store() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    if let Some(path) = trust::get_cacerts_file()
        && let Ok(data) = std::fs::read(&path)
    {
        let mut reader = std::io::Cursor::new(data);
        for cert in rustls_pemfile::certs(&mut reader).flatten() {
            roots.add(cert).ok();
        }
    }
    if roots.is_empty() {
        for cert in rustls_native_certs::load_native_certs().certs {
            roots.add(cert).ok();
        }
    }
    roots
}

/// Configuration for broker HTTPS requests: TLS 1.2 minimum and only the
/// suites in the fixed cipher list. With `verify` off, chain and hostname
/// checks are skipped for that client (one attempt after user approval).
pub fn broker_config(verify: bool) -> Result<ClientConfig> {
    utils::ensure_crypto_provider();
    let mut provider = rustls::crypto::aws_lc_rs::default_provider();
    provider.cipher_suites = BROKER_SUITES.to_vec();
    let builder = ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| anyhow!("TLS configuration error: {}", e))?;
    let config = if verify {
        builder
            .with_root_certificates(root_store())
            .with_no_client_auth()
    } else {
        log::warn!("Certificate checking is disabled!");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth()
    };
    Ok(config)
}

/// Configuration for the gateway tunnel upgrade: TLS 1.3 only. rustls never
/// compresses the TLS layer, which covers the no-compression requirement.
pub fn gateway_config(check_certificate: bool) -> Result<ClientConfig> {
    utils::ensure_crypto_provider();
    let builder = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13]);
    let config = if check_certificate {
        builder
            .with_root_certificates(root_store())
            .with_no_client_auth()
    } else {
        log::warn!("Certificate checking is disabled!");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth()
    };
    Ok(config)
}

pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    host.parse::<IpAddr>().map_or_else(
        |_| {
            ServerName::try_from(host.to_string()).map_err(|_| anyhow!("invalid server name: {}", host))
        },
        |ip| Ok(ServerName::from(ip)),
    )
}

/// Connects without verification just to obtain the peer certificate and
/// extract its serial number, lowercase hex without `0x`. Used to key the
/// certificate approval cache.
pub async fn peer_certificate_serial(host: &str, port: u16) -> Result<String> {
    utils::ensure_crypto_provider();
    let config = ClientConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS12,
        &rustls::version::TLS13,
    ])
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(NoVerifier))
    .with_no_client_auth();

    let stream = TcpStream::connect((host, port)).await?;
    let connector = TlsConnector::from(Arc::new(config));
    let tls = connector.connect(server_name(host)?, stream).await?;
    let (_, connection) = tls.get_ref();
    let cert = connection
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or_else(|| anyhow!("Certificate not found!"))?;
    let (_, parsed) = X509Certificate::from_der(cert.as_ref())
        .map_err(|e| anyhow!("failed to parse certificate: {}", e))?;
    Ok(parsed.tbs_certificate.serial.to_str_radix(16))
}

/// True when an io error from a TLS stream was caused by certificate
/// validation, as opposed to any other handshake or transport problem.
pub fn is_certificate_io_error(err: &std::io::Error) -> bool {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .map(|e| matches!(e, rustls::Error::InvalidCertificate(_)))
        .unwrap_or_else(|| format!("{:?}", err).contains("InvalidCertificate"))
}

#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::consts;

    #[test]
    fn test_broker_suite_count_matches_cipher_list() {
        assert_eq!(
            BROKER_SUITES.len(),
            consts::SECURE_CIPHERS.split(':').count()
        );
    }

    #[test]
    fn test_server_name_accepts_hosts_and_ips() {
        assert!(server_name("broker.example.com").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("::1").is_ok());
        assert!(server_name("bad host").is_err());
    }

    #[test]
    fn test_configs_build() {
        assert!(broker_config(true).is_ok());
        assert!(broker_config(false).is_ok());
        assert!(gateway_config(true).is_ok());
        assert!(gateway_config(false).is_ok());
    }
}
