use std::fmt;

use serde::{Deserialize, Serialize};

use super::UNSPECIFIED_STR;

/// RTCBundlePolicy affects which media tracks are negotiated if the remote
/// endpoint is not bundle-aware, and what ICE candidates are gathered.
///
/// ## Specifications
///
/// * [W3C](https://w3c.github.io/webrtc-pc/#rtcbundlepolicy-enum)
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
pub enum RTCBundlePolicy {
    #[default]
    Unspecified = 0,

    /// Balanced indicates to gather ICE candidates for each media type in use
    /// (audio, video, and data).
    #[serde(rename = "balanced")]
    Balanced = 1,

    /// MaxCompat indicates to gather ICE candidates for each track.
    #[serde(rename = "max-compat")]
    MaxCompat = 2,

    /// MaxBundle indicates to gather ICE candidates for only one track.
    #[serde(rename = "max-bundle")]
    MaxBundle = 3,
}

const BUNDLE_POLICY_BALANCED_STR: &str = "balanced";
const BUNDLE_POLICY_MAX_COMPAT_STR: &str = "max-compat";
const BUNDLE_POLICY_MAX_BUNDLE_STR: &str = "max-bundle";

impl From<&str> for RTCBundlePolicy {
    fn from(raw: &str) -> Self {
        match raw {
            BUNDLE_POLICY_BALANCED_STR => RTCBundlePolicy::Balanced,
            BUNDLE_POLICY_MAX_COMPAT_STR => RTCBundlePolicy::MaxCompat,
            BUNDLE_POLICY_MAX_BUNDLE_STR => RTCBundlePolicy::MaxBundle,
            _ => RTCBundlePolicy::Unspecified,
        }
    }
}

impl fmt::Display for RTCBundlePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            RTCBundlePolicy::Balanced => BUNDLE_POLICY_BALANCED_STR,
            RTCBundlePolicy::MaxCompat => BUNDLE_POLICY_MAX_COMPAT_STR,
            RTCBundlePolicy::MaxBundle => BUNDLE_POLICY_MAX_BUNDLE_STR,
            RTCBundlePolicy::Unspecified => UNSPECIFIED_STR,
        };
        write!(f, "{s}")
    }
}
