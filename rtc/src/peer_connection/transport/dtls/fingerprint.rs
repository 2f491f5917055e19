use serde::{Deserialize, Serialize};

use crate::peer_connection::certificate::{FINGERPRINT_ALGORITHM_SHA256, fingerprint_sha256};
use shared::error::{Error, Result};

/// DTLSFingerprint specifies the hash function algorithm and certificate
/// fingerprint as described in <https://tools.ietf.org/html/rfc4572>.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RTCDtlsFingerprint {
    /// Algorithm specifies one of the the hash function algorithms defined in
    /// the 'Hash function Textual Names' registry.
    pub algorithm: String,

    /// Value specifies the value of the certificate fingerprint in lowercase
    /// hex string as expressed utilizing the syntax of 'fingerprint' in
    /// <https://tools.ietf.org/html/rfc4572#section-5>.
    pub value: String,
}

impl RTCDtlsFingerprint {
    /// verify checks a DER certificate presented by the remote peer against
    /// this fingerprint. Hex digits compare case-insensitively.
    pub(crate) fn verify(&self, der: &[u8]) -> Result<()> {
        if !self.algorithm.eq_ignore_ascii_case(FINGERPRINT_ALGORITHM_SHA256) {
            return Err(Error::ErrUnsupportedFingerprintAlgorithm);
        }

        if fingerprint_sha256(der).eq_ignore_ascii_case(&self.value) {
            Ok(())
        } else {
            Err(Error::ErrNoMatchingCertificateFingerprint)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fingerprint_verify() {
        let der = b"not really a certificate";
        let good = RTCDtlsFingerprint {
            algorithm: "sha-256".to_owned(),
            value: fingerprint_sha256(der).to_uppercase(),
        };
        assert!(good.verify(der).is_ok());
        assert_eq!(
            Err(Error::ErrNoMatchingCertificateFingerprint),
            good.verify(b"another certificate")
        );

        let sha1 = RTCDtlsFingerprint {
            algorithm: "sha-1".to_owned(),
            value: good.value.clone(),
        };
        assert_eq!(Err(Error::ErrUnsupportedFingerprintAlgorithm), sha1.verify(der));
    }
}
