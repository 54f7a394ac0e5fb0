//! TLS certificate pinning for the cloud transport (`spec.md` §4.7 `pin_mismatch`).

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, Error as TlsError, SignatureScheme};
use sha2::{Digest, Sha256};

/// Verifies the leaf certificate's SHA-256 fingerprint matches a configured
/// value instead of walking a CA chain. Used when dialing the cloud relay
/// with a known-good pinned certificate (`spec.md` §4.7).
#[derive(Debug)]
pub struct PinnedCertVerifier {
    expected_sha256: [u8; 32],
    supported_algs: WebPkiSupportedAlgorithms,
}

impl PinnedCertVerifier {
    pub fn new(expected_sha256: [u8; 32]) -> Arc<Self> {
        Arc::new(Self {
            expected_sha256,
            supported_algs: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        })
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let mut hasher = Sha256::new();
        hasher.update(end_entity.as_ref());
        let digest: [u8; 32] = hasher.finalize().into();

        if digest == self.expected_sha256 {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(TlsError::General("certificate fingerprint mismatch".to_string()))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(message, cert, dss, &self.supported_algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(message, cert, dss, &self.supported_algs)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported_algs.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatched_fingerprint_rejected() {
        let verifier = PinnedCertVerifier::new([0u8; 32]);
        let fake_cert = CertificateDer::from(vec![1, 2, 3, 4]);
        let result = verifier.verify_server_cert(
            &fake_cert,
            &[],
            &ServerName::try_from("example.com").unwrap(),
            &[],
            UnixTime::now(),
        );
        assert!(result.is_err());
    }
}
