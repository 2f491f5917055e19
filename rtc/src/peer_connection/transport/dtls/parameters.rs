use serde::{Deserialize, Serialize};

use super::fingerprint::RTCDtlsFingerprint;
use super::role::RTCDtlsRole;

/// DTLSParameters holds information relating to DTLS configuration.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DTLSParameters {
    pub role: RTCDtlsRole,
    pub fingerprints: Vec<RTCDtlsFingerprint>,
}
