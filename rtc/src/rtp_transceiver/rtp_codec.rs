use std::collections::HashMap;
use std::fmt;

use crate::peer_connection::configuration::UNSPECIFIED_STR;
use crate::peer_connection::configuration::media_engine::{MIME_TYPE_H264, MIME_TYPE_RTX};
use crate::rtp_transceiver::PayloadType;

/// Codec kind identifying the media type.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RtpCodecKind {
    #[default]
    Unspecified,
    Audio,
    Video,
}

impl From<&str> for RtpCodecKind {
    fn from(raw: &str) -> Self {
        match raw {
            "audio" => RtpCodecKind::Audio,
            "video" => RtpCodecKind::Video,
            _ => RtpCodecKind::Unspecified,
        }
    }
}

impl fmt::Display for RtpCodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            RtpCodecKind::Audio => "audio",
            RtpCodecKind::Video => "video",
            RtpCodecKind::Unspecified => UNSPECIFIED_STR,
        };
        write!(f, "{s}")
    }
}

/// RTCPFeedback signals the connection to use additional RTCP packet types.
/// <https://draft.ortc.org/#dom-rtcrtcpfeedback>
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct RTCPFeedback {
    /// Type is the type of feedback.
    /// see: <https://draft.ortc.org/#dom-rtcrtcpfeedback>
    /// valid: ack, ccm, nack, goog-remb, transport-cc
    pub typ: String,

    /// The parameter value depends on the type.
    /// For example, type="nack" parameter="pli" will send Picture Loss Indicator packets.
    pub parameter: String,
}

/// RTCRtpCodec provides information about codec capabilities.
/// <https://w3c.github.io/webrtc-pc/#dictionary-rtcrtpcodeccapability-members>
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct RTCRtpCodec {
    pub mime_type: String,
    pub clock_rate: u32,
    pub channels: u16,
    pub sdp_fmtp_line: String,
    pub rtcp_feedback: Vec<RTCPFeedback>,
}

/// RTCRtpCodecParameters is a sequence containing the media codecs that an RtpSender
/// will choose from, as well as entries for RTX, RED and FEC mechanisms. This also
/// includes the PayloadType that has been negotiated
/// <https://w3c.github.io/webrtc-pc/#rtcrtpcodecparameters>
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct RTCRtpCodecParameters {
    pub rtp_codec: RTCRtpCodec,
    pub payload_type: PayloadType,
}

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum CodecMatch {
    #[default]
    None,
    Partial,
    Exact,
}

/// Parsed `a=fmtp` parameters, keys lower-cased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Fmtp {
    mime_type: String,
    parameters: HashMap<String, String>,
}

impl Fmtp {
    pub(crate) fn parse(mime_type: &str, line: &str) -> Self {
        let mut parameters = HashMap::new();
        for p in line.split(';') {
            let p = p.trim();
            if p.is_empty() {
                continue;
            }
            let (key, value) = p.split_once('=').unwrap_or((p, ""));
            parameters.insert(key.trim().to_lowercase(), value.trim().to_owned());
        }
        Fmtp {
            mime_type: mime_type.to_lowercase(),
            parameters,
        }
    }

    pub(crate) fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// Two fmtp lines match when their mime types do and every parameter present
    /// on both sides agrees. H264 additionally requires the same packetization
    /// mode and profile.
    pub(crate) fn match_fmtp(&self, other: &Fmtp) -> bool {
        if self.mime_type != other.mime_type {
            return false;
        }

        if self.mime_type == MIME_TYPE_H264.to_lowercase() {
            let mode = |f: &Fmtp| f.parameter("packetization-mode").unwrap_or("0").to_owned();
            if mode(self) != mode(other) {
                return false;
            }
            // profile_idc and profile-iop, the level may differ
            let profile = |f: &Fmtp| {
                f.parameter("profile-level-id")
                    .map(|p| p.get(..4).unwrap_or(p).to_lowercase())
            };
            return profile(self).is_some() && profile(self) == profile(other);
        }

        for (k, v) in &self.parameters {
            if let Some(ov) = other.parameters.get(k)
                && !ov.eq_ignore_ascii_case(v)
            {
                return false;
            }
        }

        true
    }
}

/// Do a fuzzy find for a codec in the list of codecs
/// Used for lookup up a codec in an existing list to find a match
/// Returns the matched codec and the quality of the match
pub(crate) fn codec_parameters_fuzzy_search(
    needle: &RTCRtpCodec,
    haystack: &[RTCRtpCodecParameters],
) -> (RTCRtpCodecParameters, CodecMatch) {
    let needle_fmtp = Fmtp::parse(&needle.mime_type, &needle.sdp_fmtp_line);

    // First attempt to match on mime_type + sdp_fmtp_line
    for c in haystack {
        let cfmtp = Fmtp::parse(&c.rtp_codec.mime_type, &c.rtp_codec.sdp_fmtp_line);
        if needle_fmtp.match_fmtp(&cfmtp) {
            return (c.clone(), CodecMatch::Exact);
        }
    }

    // Fallback to just mime_type
    for c in haystack {
        if c.rtp_codec.mime_type.eq_ignore_ascii_case(&needle.mime_type) {
            return (c.clone(), CodecMatch::Partial);
        }
    }

    (RTCRtpCodecParameters::default(), CodecMatch::None)
}

/// find_rtx_payload_type returns the payload type of the RTX codec whose
/// `apt` points at `needle`.
pub(crate) fn find_rtx_payload_type(
    needle: PayloadType,
    haystack: &[RTCRtpCodecParameters],
) -> Option<PayloadType> {
    let apt_str = format!("apt={needle}");
    haystack
        .iter()
        .find(|c| {
            c.rtp_codec.mime_type.eq_ignore_ascii_case(MIME_TYPE_RTX)
                && c.rtp_codec.sdp_fmtp_line == apt_str
        })
        .map(|c| c.payload_type)
}

pub(crate) fn rtcp_feedback_intersection(
    a: &[RTCPFeedback],
    b: &[RTCPFeedback],
) -> Vec<RTCPFeedback> {
    a.iter()
        .filter(|fa| b.iter().any(|fb| fa.typ == fb.typ && fa.parameter == fb.parameter))
        .cloned()
        .collect()
}
