// Copyright the Cluster Gateway Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Client TLS materialisation.
//!
//! All crypto goes through the single provider below. Two verification
//! modes exist: a CA bundle from the cluster record, or none at all for
//! tunnelled egress and records that opted out of verification.

use std::io::Cursor;
use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

/// Target apiservers commonly still negotiate TLS 1.2.
pub static TLS_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid root certificate bundle: {0}")]
    InvalidRootCert(String),
    #[error("invalid client certificate or key: {0}")]
    InvalidClientCert(String),
    #[error("invalid server name {0:?}")]
    InvalidServerName(String),
    #[error("tls error: {0}")]
    Ssl(#[from] rustls::Error),
}

/// How the remote's serving certificate is checked.
#[derive(Debug, Clone)]
pub enum ServerVerification {
    /// Verify against the given PEM bundle.
    CaBundle(Vec<u8>),
    /// Skip verification. Tunnelled egress always uses this; the server
    /// name is synthesised from the cluster name and cannot be verified.
    Insecure,
}

pub fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, Error> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut Cursor::new(pem))
        .collect::<Result<_, _>>()
        .map_err(|e| Error::InvalidRootCert(e.to_string()))?;
    if certs.is_empty() {
        return Err(Error::InvalidRootCert("no certificates in bundle".into()));
    }
    Ok(certs)
}

pub fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, Error> {
    rustls_pemfile::private_key(&mut Cursor::new(pem))
        .map_err(|e| Error::InvalidClientCert(e.to_string()))?
        .ok_or_else(|| Error::InvalidClientCert("no private key in input".into()))
}

pub fn server_name(host: &str) -> Result<ServerName<'static>, Error> {
    ServerName::try_from(host.to_string()).map_err(|_| Error::InvalidServerName(host.to_string()))
}

/// Build a client configuration for one upstream connection.
pub fn client_config(
    verification: &ServerVerification,
    client_pair: Option<(&[u8], &[u8])>,
) -> Result<ClientConfig, Error> {
    let provider = provider();
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(TLS_VERSIONS)?;
    let builder = match verification {
        ServerVerification::CaBundle(pem) => {
            let mut roots = RootCertStore::empty();
            for cert in parse_certificates(pem)? {
                roots
                    .add(cert)
                    .map_err(|e| Error::InvalidRootCert(e.to_string()))?;
            }
            builder.with_root_certificates(roots)
        }
        ServerVerification::Insecure => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier(provider))),
    };
    let mut config = match client_pair {
        Some((cert_pem, key_pem)) => {
            let certs = parse_certificates(cert_pem)
                .map_err(|e| Error::InvalidClientCert(e.to_string()))?;
            let key = parse_private_key(key_pem)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| Error::InvalidClientCert(e.to_string()))?
        }
        None => builder.with_no_client_auth(),
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Like [`client_config`], but negotiating HTTP/2. Used for the egress
/// tunnel's control connection.
pub fn client_config_h2(
    verification: &ServerVerification,
    client_pair: Option<(&[u8], &[u8])>,
) -> Result<ClientConfig, Error> {
    let mut config = client_config(verification, client_pair)?;
    config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(config)
}

/// Accepts any server certificate. Signature validity is still checked so
/// a garbled handshake fails rather than silently passing junk through.
#[derive(Debug)]
struct NoVerifier(Arc<CryptoProvider>);

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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cert_pem() -> (Vec<u8>, Vec<u8>) {
        let cert = rcgen::generate_simple_self_signed(vec!["test.example.com".to_string()])
            .expect("generate certificate");
        (
            cert.cert.pem().into_bytes(),
            cert.key_pair.serialize_pem().into_bytes(),
        )
    }

    #[test]
    fn builds_verified_config_from_ca_bundle() {
        let (ca, _) = test_cert_pem();
        let config = client_config(&ServerVerification::CaBundle(ca), None).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn builds_insecure_config() {
        client_config(&ServerVerification::Insecure, None).unwrap();
    }

    #[test]
    fn builds_client_auth_config() {
        let (cert, key) = test_cert_pem();
        client_config(&ServerVerification::Insecure, Some((&cert, &key))).unwrap();
    }

    #[test]
    fn rejects_garbage_ca() {
        assert!(matches!(
            client_config(&ServerVerification::CaBundle(b"not pem".to_vec()), None),
            Err(Error::InvalidRootCert(_))
        ));
    }

    #[test]
    fn server_name_accepts_dns_and_ip() {
        assert!(server_name("foo.bar").is_ok());
        assert!(server_name("10.0.0.1").is_ok());
        assert!(server_name("not a hostname").is_err());
    }

    #[test]
    fn h2_config_negotiates_h2() {
        let config = client_config_h2(&ServerVerification::Insecure, None).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
    }
}
