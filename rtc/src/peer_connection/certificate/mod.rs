//! X.509 certificates used to authenticate the DTLS handshake.
//!
//! Each peer connection owns at least one self-signed certificate. Its
//! SHA-256 fingerprint is advertised in the session description and the remote
//! peer checks the certificate presented during the handshake against it.

use std::time::{Duration, SystemTime};

use rcgen::{CertificateParams, KeyPair};
use sha2::{Digest, Sha256};

use crate::peer_connection::transport::dtls::fingerprint::RTCDtlsFingerprint;
use shared::error::{Error, Result};
use shared::util::math_rand_alpha;

pub(crate) const FINGERPRINT_ALGORITHM_SHA256: &str = "sha-256";

/// RTCCertificate represents a x509Cert used to authenticate WebRTC communications.
#[derive(Clone, Debug)]
pub struct RTCCertificate {
    /// DER encoded certificate chain, leaf first.
    pub(crate) certificate: Vec<Vec<u8>>,

    /// PKCS#8 DER encoded private key.
    pub(crate) private_key: Vec<u8>,

    pub(crate) expires: SystemTime,
}

impl PartialEq for RTCCertificate {
    fn eq(&self, other: &Self) -> bool {
        self.certificate == other.certificate
    }
}

impl RTCCertificate {
    /// generate creates a certificate backed by a fresh ECDSA P-256 key.
    pub fn generate() -> Result<Self> {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
        Self::from_key_pair(key_pair)
    }

    /// from_key_pair self-signs a certificate for the given key.
    /// ECDSA P-256 and Ed25519 keys are accepted.
    pub fn from_key_pair(key_pair: KeyPair) -> Result<Self> {
        if !(key_pair.is_compatible(&rcgen::PKCS_ED25519)
            || key_pair.is_compatible(&rcgen::PKCS_ECDSA_P256_SHA256))
        {
            return Err(Error::ErrPrivateKeyType);
        }

        let params = CertificateParams::new(vec![math_rand_alpha(16)])?;
        let not_after = params.not_after;
        let x509_cert = params.self_signed(&key_pair)?;

        let expires = if cfg!(target_arch = "arm") {
            // adding the rcgen default validity overflows SystemTime on armv7
            SystemTime::now() + Duration::from_secs(172800)
        } else {
            not_after.into()
        };

        Self::from_existing(
            vec![x509_cert.der().to_vec()],
            key_pair.serialize_der(),
            expires,
        )
    }

    /// from_existing wraps a certificate produced elsewhere, e.g. loaded from
    /// disk. Fails with ErrCertificateExpired when `expires` is in the past.
    pub fn from_existing(
        certificate: Vec<Vec<u8>>,
        private_key: Vec<u8>,
        expires: SystemTime,
    ) -> Result<Self> {
        if certificate.is_empty() {
            return Err(Error::ErrNonCertificate);
        }
        if expires < SystemTime::now() {
            return Err(Error::ErrCertificateExpired);
        }

        Ok(Self {
            certificate,
            private_key,
            expires,
        })
    }

    pub fn expires(&self) -> SystemTime {
        self.expires
    }

    /// DER of the leaf certificate.
    pub fn der(&self) -> &[u8] {
        self.certificate.first().map(Vec::as_slice).unwrap_or_default()
    }

    pub fn get_fingerprints(&self) -> Vec<RTCDtlsFingerprint> {
        self.certificate
            .iter()
            .map(|c| RTCDtlsFingerprint {
                algorithm: FINGERPRINT_ALGORITHM_SHA256.to_owned(),
                value: fingerprint_sha256(c),
            })
            .collect()
    }
}

/// fingerprint_sha256 hashes a DER certificate into the colon separated,
/// lower case hex form used by the `a=fingerprint` attribute.
pub(crate) fn fingerprint_sha256(der: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(der);
    let hashed = h.finalize();
    let values: Vec<String> = hashed.iter().map(|x| format!("{x:02x}")).collect();
    values.join(":")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_generate_certificate_rsa() -> Result<()> {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256);
        assert!(key_pair.is_err(), "RcgenError::KeyGenerationUnavailable");

        Ok(())
    }

    #[test]
    fn test_generate_certificate_ecdsa() -> Result<()> {
        let kp = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
        let cert = RTCCertificate::from_key_pair(kp)?;
        assert!(!cert.der().is_empty());

        Ok(())
    }

    #[test]
    fn test_generate_certificate_eddsa() -> Result<()> {
        let kp = KeyPair::generate_for(&rcgen::PKCS_ED25519)?;
        let _cert = RTCCertificate::from_key_pair(kp)?;

        Ok(())
    }

    #[test]
    fn test_certificate_equal() -> Result<()> {
        let cert1 = RTCCertificate::generate()?;
        let cert2 = RTCCertificate::generate()?;

        assert_ne!(cert1, cert2);
        assert_eq!(cert1, cert1.clone());

        Ok(())
    }

    #[test]
    fn test_generate_certificate_expires() -> Result<()> {
        let cert = RTCCertificate::generate()?;

        let now = SystemTime::now();
        assert!(cert.expires().duration_since(now).is_ok());

        Ok(())
    }

    #[test]
    fn test_certificate_from_existing_expired() -> Result<()> {
        let cert = RTCCertificate::generate()?;
        let result = RTCCertificate::from_existing(
            cert.certificate.clone(),
            cert.private_key.clone(),
            SystemTime::now() - Duration::from_secs(60),
        );
        assert_eq!(Err(Error::ErrCertificateExpired), result);

        Ok(())
    }

    #[test]
    fn test_certificate_fingerprints() -> Result<()> {
        let cert = RTCCertificate::generate()?;
        let fingerprints = cert.get_fingerprints();

        assert_eq!(1, fingerprints.len());
        assert_eq!("sha-256", fingerprints[0].algorithm);
        // 32 bytes, two hex digits each, 31 separators
        assert_eq!(95, fingerprints[0].value.len());
        assert_eq!(fingerprint_sha256(cert.der()), fingerprints[0].value);

        Ok(())
    }
}
