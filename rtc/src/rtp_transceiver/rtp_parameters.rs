use crate::rtp_transceiver::rtp_codec::RTCRtpCodecParameters;
use crate::rtp_transceiver::{RtpStreamId, SSRC};

/// A RFC 5285 RTP header extension supported by the media engine.
/// <https://w3c.github.io/webrtc-pc/#dom-rtcrtpcapabilities-headerextensions>
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct RTCRtpHeaderExtensionCapability {
    pub uri: String,
}

/// A negotiated RFC 5285 RTP header extension.
/// <https://w3c.github.io/webrtc-pc/#dictionary-rtcrtpheaderextensionparameters-members>
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct RTCRtpHeaderExtensionParameters {
    pub uri: String,
    pub id: u16,
}

/// RTCRtpParameters is a list of negotiated codecs and header extensions
/// <https://w3c.github.io/webrtc-pc/#dictionary-rtcrtpparameters-members>
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct RTCRtpParameters {
    pub header_extensions: Vec<RTCRtpHeaderExtensionParameters>,
    pub codecs: Vec<RTCRtpCodecParameters>,
}

impl RTCRtpParameters {
    /// header_extension_id looks up the negotiated id of `uri`.
    pub(crate) fn header_extension_id(&self, uri: &str) -> Option<u8> {
        self.header_extensions
            .iter()
            .find(|e| e.uri == uri)
            .and_then(|e| u8::try_from(e.id).ok())
    }
}

/// RTCRtpCodingParameters provides information relating to both encoding and decoding.
/// <http://draft.ortc.org/#dom-rtcrtpcodingparameters>
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct RTCRtpCodingParameters {
    pub rid: RtpStreamId,
    pub ssrc: SSRC,
    pub payload_type: u8,
    pub rtx_ssrc: Option<SSRC>,
}

/// RTCRtpDecodingParameters provides information relating to both encoding and decoding.
/// <http://draft.ortc.org/#dom-rtcrtpdecodingparameters>
pub type RTCRtpDecodingParameters = RTCRtpCodingParameters;

/// RTCRtpEncodingParameters provides information relating to both encoding and decoding.
/// <http://draft.ortc.org/#dom-rtcrtpencodingparameters>
pub type RTCRtpEncodingParameters = RTCRtpCodingParameters;

/// RTCRtpReceiveParameters contains the RTP stack settings used by receivers
#[derive(Default, Debug, Clone)]
pub struct RTCRtpReceiveParameters {
    pub encodings: Vec<RTCRtpDecodingParameters>,
}

/// RTCRtpSendParameters contains the RTP stack settings used by senders
#[derive(Default, Debug, Clone)]
pub struct RTCRtpSendParameters {
    pub rtp_parameters: RTCRtpParameters,
    pub encodings: Vec<RTCRtpEncodingParameters>,
}
