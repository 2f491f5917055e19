//! Codecs and RTP header extensions a peer connection is willing to negotiate.
//!
//! Each connection clones the user supplied [`MediaEngine`] so the negotiated
//! state of one connection never leaks into another.

use std::collections::HashMap;
use std::ops::Range;

use sdp::description::media::MediaDescription;
use sdp::description::session::SessionDescription;
use sdp::extmap::{SDES_MID_URI, SDES_REPAIR_RTP_STREAM_ID_URI, SDES_RTP_STREAM_ID_URI};
use shared::error::{Error, Result};

use crate::peer_connection::sdp::{
    codecs_from_media_description, rtp_extensions_from_media_description,
};
use crate::rtp_transceiver::PayloadType;
use crate::rtp_transceiver::direction::RTCRtpTransceiverDirection;
use crate::rtp_transceiver::rtp_codec::{
    CodecMatch, Fmtp, RTCPFeedback, RTCRtpCodec, RTCRtpCodecParameters, RtpCodecKind,
    codec_parameters_fuzzy_search, rtcp_feedback_intersection,
};
use crate::rtp_transceiver::rtp_parameters::{
    RTCRtpHeaderExtensionCapability, RTCRtpHeaderExtensionParameters, RTCRtpParameters,
};

pub const MIME_TYPE_H264: &str = "video/H264";
pub const MIME_TYPE_OPUS: &str = "audio/opus";
pub const MIME_TYPE_VP8: &str = "video/VP8";
pub const MIME_TYPE_VP9: &str = "video/VP9";
pub const MIME_TYPE_AV1: &str = "video/AV1";
pub const MIME_TYPE_G722: &str = "audio/G722";
pub const MIME_TYPE_PCMU: &str = "audio/PCMU";
pub const MIME_TYPE_PCMA: &str = "audio/PCMA";
pub const MIME_TYPE_RTX: &str = "video/rtx";
pub const MIME_TYPE_TELEPHONE_EVENT: &str = "audio/telephone-event";

const VALID_EXT_IDS: Range<u16> = 1..15;

#[derive(Default, Debug, Clone)]
pub(crate) struct MediaEngineHeaderExtension {
    pub(crate) uri: String,
    pub(crate) is_audio: bool,
    pub(crate) is_video: bool,
    pub(crate) allowed_direction: Option<RTCRtpTransceiverDirection>,
}

impl MediaEngineHeaderExtension {
    fn is_matching_direction(&self, dir: RTCRtpTransceiverDirection) -> bool {
        match self.allowed_direction {
            Some(allowed) => {
                allowed == RTCRtpTransceiverDirection::Inactive
                    && dir == RTCRtpTransceiverDirection::Inactive
                    || allowed.has_send() && dir.has_send()
                    || allowed.has_recv() && dir.has_recv()
            }
            None => true,
        }
    }

    fn is_kind(&self, typ: RtpCodecKind) -> bool {
        self.is_audio && typ == RtpCodecKind::Audio || self.is_video && typ == RtpCodecKind::Video
    }
}

/// A MediaEngine defines the codecs supported by a PeerConnection, and the
/// configuration of those codecs. A MediaEngine must not be shared between
/// PeerConnections.
#[derive(Default, Debug, Clone)]
pub struct MediaEngine {
    // If we have attempted to negotiate a codec type yet.
    pub(crate) negotiated_video: bool,
    pub(crate) negotiated_audio: bool,

    pub(crate) video_codecs: Vec<RTCRtpCodecParameters>,
    pub(crate) audio_codecs: Vec<RTCRtpCodecParameters>,
    pub(crate) negotiated_video_codecs: Vec<RTCRtpCodecParameters>,
    pub(crate) negotiated_audio_codecs: Vec<RTCRtpCodecParameters>,

    header_extensions: Vec<MediaEngineHeaderExtension>,
    negotiated_header_extensions: HashMap<u16, MediaEngineHeaderExtension>,
}

impl MediaEngine {
    /// register_default_codecs registers the default codecs supported by this
    /// engine, together with the mid and rid header extensions needed to
    /// demultiplex simulcast and undeclared streams.
    pub fn register_default_codecs(&mut self) -> Result<()> {
        for codec in [
            (MIME_TYPE_OPUS, 48000, 2, "minptime=10;useinbandfec=1", 111),
            (MIME_TYPE_G722, 8000, 0, "", 9),
            (MIME_TYPE_PCMU, 8000, 0, "", 0),
            (MIME_TYPE_PCMA, 8000, 0, "", 8),
        ] {
            self.register_codec(
                RTCRtpCodecParameters {
                    rtp_codec: RTCRtpCodec {
                        mime_type: codec.0.to_owned(),
                        clock_rate: codec.1,
                        channels: codec.2,
                        sdp_fmtp_line: codec.3.to_owned(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: codec.4,
                },
                RtpCodecKind::Audio,
            )?;
        }

        let video_rtcp_feedback: Vec<RTCPFeedback> = [
            ("goog-remb", ""),
            ("ccm", "fir"),
            ("nack", ""),
            ("nack", "pli"),
        ]
        .into_iter()
        .map(|(typ, parameter)| RTCPFeedback {
            typ: typ.to_owned(),
            parameter: parameter.to_owned(),
        })
        .collect();

        for codec in [
            (MIME_TYPE_VP8, "", 96, true),
            (MIME_TYPE_RTX, "apt=96", 97, false),
            (MIME_TYPE_VP9, "profile-id=0", 98, true),
            (MIME_TYPE_RTX, "apt=98", 99, false),
            (
                MIME_TYPE_H264,
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f",
                102,
                true,
            ),
            (MIME_TYPE_RTX, "apt=102", 103, false),
            (MIME_TYPE_AV1, "", 41, true),
            (MIME_TYPE_RTX, "apt=41", 42, false),
        ] {
            self.register_codec(
                RTCRtpCodecParameters {
                    rtp_codec: RTCRtpCodec {
                        mime_type: codec.0.to_owned(),
                        clock_rate: 90000,
                        channels: 0,
                        sdp_fmtp_line: codec.1.to_owned(),
                        rtcp_feedback: if codec.3 {
                            video_rtcp_feedback.clone()
                        } else {
                            vec![]
                        },
                    },
                    payload_type: codec.2,
                },
                RtpCodecKind::Video,
            )?;
        }

        for kind in [RtpCodecKind::Audio, RtpCodecKind::Video] {
            for uri in [SDES_MID_URI, SDES_RTP_STREAM_ID_URI] {
                self.register_header_extension(
                    RTCRtpHeaderExtensionCapability {
                        uri: uri.to_owned(),
                    },
                    kind,
                    None,
                )?;
            }
        }
        self.register_header_extension(
            RTCRtpHeaderExtensionCapability {
                uri: SDES_REPAIR_RTP_STREAM_ID_URI.to_owned(),
            },
            RtpCodecKind::Video,
            None,
        )?;

        Ok(())
    }

    /// add_codec will append codec if it not exists
    fn add_codec(codecs: &mut Vec<RTCRtpCodecParameters>, codec: RTCRtpCodecParameters) {
        if !codecs.iter().any(|c| {
            c.rtp_codec.mime_type == codec.rtp_codec.mime_type
                && c.payload_type == codec.payload_type
        }) {
            codecs.push(codec);
        }
    }

    /// register_codec adds codec to the MediaEngine
    /// These are the list of codecs supported by this PeerConnection.
    pub fn register_codec(&mut self, codec: RTCRtpCodecParameters, typ: RtpCodecKind) -> Result<()> {
        match typ {
            RtpCodecKind::Audio => MediaEngine::add_codec(&mut self.audio_codecs, codec),
            RtpCodecKind::Video => MediaEngine::add_codec(&mut self.video_codecs, codec),
            RtpCodecKind::Unspecified => return Err(Error::ErrUnknownType),
        }
        Ok(())
    }

    /// register_header_extension adds a header extension to the MediaEngine.
    /// The `allowed_direction` limits which transceiver directions the
    /// extension is offered for; `None` matches all of them.
    pub fn register_header_extension(
        &mut self,
        extension: RTCRtpHeaderExtensionCapability,
        typ: RtpCodecKind,
        allowed_direction: Option<RTCRtpTransceiverDirection>,
    ) -> Result<()> {
        if let Some(direction) = allowed_direction
            && (direction == RTCRtpTransceiverDirection::Unspecified
                || direction == RTCRtpTransceiverDirection::Inactive)
        {
            return Err(Error::ErrRegisterHeaderExtensionInvalidDirection);
        }

        let index = match self
            .header_extensions
            .iter()
            .position(|ext| ext.uri == extension.uri)
        {
            Some(index) => index,
            None => {
                if self.header_extensions.len() >= VALID_EXT_IDS.len() {
                    return Err(Error::ErrRegisterHeaderExtensionNoFreeID);
                }
                self.header_extensions.push(MediaEngineHeaderExtension {
                    uri: extension.uri,
                    ..Default::default()
                });
                self.header_extensions.len() - 1
            }
        };

        let ext = &mut self.header_extensions[index];
        match typ {
            RtpCodecKind::Audio => ext.is_audio = true,
            RtpCodecKind::Video => ext.is_video = true,
            RtpCodecKind::Unspecified => {}
        }
        ext.allowed_direction = allowed_direction;

        Ok(())
    }

    /// register_feedback adds feedback mechanism to already registered codecs.
    pub fn register_feedback(&mut self, feedback: RTCPFeedback, typ: RtpCodecKind) {
        let codecs = match typ {
            RtpCodecKind::Video => &mut self.video_codecs,
            RtpCodecKind::Audio => &mut self.audio_codecs,
            RtpCodecKind::Unspecified => return,
        };
        for c in codecs {
            c.rtp_codec.rtcp_feedback.push(feedback.clone());
        }
    }

    /// get_header_extension_id returns the negotiated ID for a header extension.
    /// If the Header Extension isn't enabled ok will be false
    pub fn get_header_extension_id(
        &self,
        extension: RTCRtpHeaderExtensionCapability,
    ) -> (u16, bool, bool) {
        for (id, h) in &self.negotiated_header_extensions {
            if extension.uri == h.uri {
                return (*id, h.is_audio, h.is_video);
            }
        }

        (0, false, false)
    }

    /// clone_to copies any user modifiable state of the MediaEngine
    /// all internal state is reset
    pub(crate) fn clone_to(&self) -> Self {
        MediaEngine {
            video_codecs: self.video_codecs.clone(),
            audio_codecs: self.audio_codecs.clone(),
            header_extensions: self.header_extensions.clone(),
            ..Default::default()
        }
    }

    pub(crate) fn get_codec_by_payload(
        &self,
        payload_type: PayloadType,
    ) -> Result<(RTCRtpCodecParameters, RtpCodecKind)> {
        let candidates = [
            (self.negotiated_video, &self.negotiated_video_codecs, RtpCodecKind::Video),
            (self.negotiated_audio, &self.negotiated_audio_codecs, RtpCodecKind::Audio),
            (!self.negotiated_video, &self.video_codecs, RtpCodecKind::Video),
            (!self.negotiated_audio, &self.audio_codecs, RtpCodecKind::Audio),
        ];

        for (enabled, codecs, kind) in candidates {
            if !enabled {
                continue;
            }
            if let Some(codec) = codecs.iter().find(|c| c.payload_type == payload_type) {
                return Ok((codec.clone(), kind));
            }
        }

        Err(Error::ErrCodecNotFound)
    }

    /// Look up a remote codec, following the `apt` of RTX codecs back to the
    /// primary codec they protect.
    fn match_remote_codec(
        &self,
        remote_codec: &RTCRtpCodecParameters,
        typ: RtpCodecKind,
        exact_matches: &[RTCRtpCodecParameters],
        partial_matches: &[RTCRtpCodecParameters],
    ) -> Result<CodecMatch> {
        let codecs = if typ == RtpCodecKind::Audio {
            &self.audio_codecs
        } else {
            &self.video_codecs
        };

        let remote_fmtp = Fmtp::parse(
            &remote_codec.rtp_codec.mime_type,
            &remote_codec.rtp_codec.sdp_fmtp_line,
        );
        let Some(apt) = remote_fmtp.parameter("apt") else {
            let (_, match_type) = codec_parameters_fuzzy_search(&remote_codec.rtp_codec, codecs);
            return Ok(match_type);
        };

        let payload_type = apt.parse::<u8>()?;
        let apt_match = if exact_matches.iter().any(|c| c.payload_type == payload_type) {
            CodecMatch::Exact
        } else if partial_matches.iter().any(|c| c.payload_type == payload_type) {
            CodecMatch::Partial
        } else {
            // not an error, we just ignore this codec we don't support
            return Ok(CodecMatch::None);
        };

        // an RTX codec is only as good as the codec it repairs
        let has_rtx = codecs
            .iter()
            .any(|c| c.rtp_codec.mime_type.eq_ignore_ascii_case(&remote_codec.rtp_codec.mime_type));
        Ok(if has_rtx { apt_match } else { CodecMatch::None })
    }

    /// Look up a header extension and enable if it exists
    fn update_header_extension(&mut self, id: u16, extension: &str, typ: RtpCodecKind) {
        for local_extension in &self.header_extensions {
            if local_extension.uri != extension {
                continue;
            }
            let entry = self
                .negotiated_header_extensions
                .entry(id)
                .or_insert_with(|| MediaEngineHeaderExtension {
                    uri: extension.to_owned(),
                    allowed_direction: local_extension.allowed_direction,
                    ..Default::default()
                });
            if local_extension.is_audio && typ == RtpCodecKind::Audio {
                entry.is_audio = true;
            }
            if local_extension.is_video && typ == RtpCodecKind::Video {
                entry.is_video = true;
            }
        }
    }

    fn update_header_extension_from_media_section(
        &mut self,
        media: &MediaDescription,
        typ: RtpCodecKind,
    ) -> Result<()> {
        for (uri, id) in rtp_extensions_from_media_description(media)? {
            self.update_header_extension(id, &uri, typ);
        }
        Ok(())
    }

    fn push_codecs(&mut self, codecs: Vec<RTCRtpCodecParameters>, typ: RtpCodecKind) {
        for codec in codecs {
            match typ {
                RtpCodecKind::Audio => MediaEngine::add_codec(&mut self.negotiated_audio_codecs, codec),
                RtpCodecKind::Video => MediaEngine::add_codec(&mut self.negotiated_video_codecs, codec),
                RtpCodecKind::Unspecified => {}
            }
        }
    }

    /// update_from_remote_description narrows the registered codecs and header
    /// extensions to what the remote description supports. The first media
    /// section of each kind decides the negotiated codecs.
    pub(crate) fn update_from_remote_description(
        &mut self,
        desc: &SessionDescription,
    ) -> Result<()> {
        for media in &desc.media_descriptions {
            let typ = RtpCodecKind::from(media.media_name.media.to_lowercase().as_str());
            match typ {
                RtpCodecKind::Audio if !self.negotiated_audio => self.negotiated_audio = true,
                RtpCodecKind::Video if !self.negotiated_video => self.negotiated_video = true,
                RtpCodecKind::Unspecified => continue,
                _ => {
                    self.update_header_extension_from_media_section(media, typ)?;
                    continue;
                }
            }

            let mut codecs = codecs_from_media_description(media)?;
            let mut exact_matches: Vec<RTCRtpCodecParameters> = vec![];
            let mut partial_matches: Vec<RTCRtpCodecParameters> = vec![];

            // the second pass picks up RTX codecs listed before their primary
            for _ in 0..2 {
                for remote_codec in &mut codecs {
                    let match_type = self.match_remote_codec(
                        remote_codec,
                        typ,
                        &exact_matches,
                        &partial_matches,
                    )?;

                    let local_codecs = if typ == RtpCodecKind::Audio {
                        &self.audio_codecs
                    } else {
                        &self.video_codecs
                    };
                    let (local_codec, _) =
                        codec_parameters_fuzzy_search(&remote_codec.rtp_codec, local_codecs);
                    remote_codec.rtp_codec.rtcp_feedback = rtcp_feedback_intersection(
                        &local_codec.rtp_codec.rtcp_feedback,
                        &remote_codec.rtp_codec.rtcp_feedback,
                    );

                    let bucket = match match_type {
                        CodecMatch::Exact => &mut exact_matches,
                        CodecMatch::Partial => &mut partial_matches,
                        CodecMatch::None => continue,
                    };
                    if !bucket.iter().any(|c| c.payload_type == remote_codec.payload_type) {
                        bucket.push(remote_codec.clone());
                    }
                }
            }

            // use exact matches when they exist, otherwise fall back to partial
            if !exact_matches.is_empty() {
                self.push_codecs(exact_matches, typ);
            } else if !partial_matches.is_empty() {
                self.push_codecs(partial_matches, typ);
            } else {
                // no match, not negotiated
                continue;
            }

            self.update_header_extension_from_media_section(media, typ)?;
        }

        Ok(())
    }

    pub(crate) fn get_codecs_by_kind(&self, typ: RtpCodecKind) -> Vec<RTCRtpCodecParameters> {
        match typ {
            RtpCodecKind::Video if self.negotiated_video => self.negotiated_video_codecs.clone(),
            RtpCodecKind::Video => self.video_codecs.clone(),
            RtpCodecKind::Audio if self.negotiated_audio => self.negotiated_audio_codecs.clone(),
            RtpCodecKind::Audio => self.audio_codecs.clone(),
            RtpCodecKind::Unspecified => vec![],
        }
    }

    pub(crate) fn get_rtp_parameters_by_kind(
        &self,
        typ: RtpCodecKind,
        direction: RTCRtpTransceiverDirection,
    ) -> RTCRtpParameters {
        let mut header_extensions = vec![];

        if self.negotiated_video && typ == RtpCodecKind::Video
            || self.negotiated_audio && typ == RtpCodecKind::Audio
        {
            for (id, e) in &self.negotiated_header_extensions {
                if e.is_matching_direction(direction) && e.is_kind(typ) {
                    header_extensions.push(RTCRtpHeaderExtensionParameters {
                        id: *id,
                        uri: e.uri.clone(),
                    });
                }
            }
        } else {
            // reuse ids negotiated by the other kind, hand out free ids otherwise
            let mut media_header_extensions: HashMap<u16, &MediaEngineHeaderExtension> =
                HashMap::new();
            for ext in &self.header_extensions {
                let negotiated_id = self
                    .negotiated_header_extensions
                    .iter()
                    .find(|(_, n)| n.uri == ext.uri)
                    .map(|(id, _)| *id);
                let id = negotiated_id.or_else(|| {
                    VALID_EXT_IDS.clone().find(|id| {
                        !media_header_extensions.contains_key(id)
                            && !self.negotiated_header_extensions.contains_key(id)
                    })
                });
                if let Some(id) = id {
                    media_header_extensions.insert(id, ext);
                }
            }

            for (id, e) in media_header_extensions {
                if e.is_matching_direction(direction) && e.is_kind(typ) {
                    header_extensions.push(RTCRtpHeaderExtensionParameters {
                        id,
                        uri: e.uri.clone(),
                    });
                }
            }
        }
        header_extensions.sort_by_key(|e| e.id);

        RTCRtpParameters {
            header_extensions,
            codecs: self.get_codecs_by_kind(typ),
        }
    }

    pub(crate) fn get_rtp_parameters_by_payload_type(
        &self,
        payload_type: PayloadType,
    ) -> Result<RTCRtpParameters> {
        let (codec, typ) = self.get_codec_by_payload(payload_type)?;

        let mut header_extensions: Vec<RTCRtpHeaderExtensionParameters> = self
            .negotiated_header_extensions
            .iter()
            .filter(|(_, e)| e.is_kind(typ))
            .map(|(id, e)| RTCRtpHeaderExtensionParameters {
                uri: e.uri.clone(),
                id: *id,
            })
            .collect();
        header_extensions.sort_by_key(|e| e.id);

        Ok(RTCRtpParameters {
            header_extensions,
            codecs: vec![codec],
        })
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use super::*;

    fn parse(raw: &str) -> Result<SessionDescription> {
        Ok(SessionDescription::unmarshal(&mut Cursor::new(raw.as_bytes()))?)
    }

    #[test]
    fn test_register_default_codecs() -> Result<()> {
        let mut m = MediaEngine::default();
        m.register_default_codecs()?;

        let audio = m.get_codecs_by_kind(RtpCodecKind::Audio);
        assert_eq!(111, audio[0].payload_type);
        assert_eq!(MIME_TYPE_OPUS, audio[0].rtp_codec.mime_type);

        let (codec, kind) = m.get_codec_by_payload(96)?;
        assert_eq!(RtpCodecKind::Video, kind);
        assert_eq!(MIME_TYPE_VP8, codec.rtp_codec.mime_type);
        assert_eq!(Err(Error::ErrCodecNotFound), m.get_codec_by_payload(127).map(|_| ()));

        let params =
            m.get_rtp_parameters_by_kind(RtpCodecKind::Video, RTCRtpTransceiverDirection::Sendrecv);
        assert!(params.header_extensions.iter().any(|e| e.uri == SDES_MID_URI));

        Ok(())
    }

    #[test]
    fn test_register_codec_unknown_kind() {
        let mut m = MediaEngine::default();
        assert_eq!(
            Err(Error::ErrUnknownType),
            m.register_codec(RTCRtpCodecParameters::default(), RtpCodecKind::Unspecified)
        );
    }

    #[test]
    fn test_register_header_extension_invalid_direction() {
        let mut m = MediaEngine::default();
        assert_eq!(
            Err(Error::ErrRegisterHeaderExtensionInvalidDirection),
            m.register_header_extension(
                RTCRtpHeaderExtensionCapability {
                    uri: SDES_MID_URI.to_owned(),
                },
                RtpCodecKind::Audio,
                Some(RTCRtpTransceiverDirection::Inactive),
            )
        );
    }

    #[test]
    fn test_update_from_remote_description() -> Result<()> {
        let offer = "v=0
o=- 4596489990601351948 2 IN IP4 127.0.0.1
s=-
t=0 0
m=audio 9 UDP/TLS/RTP/SAVPF 111 0
c=IN IP4 0.0.0.0
a=mid:0
a=extmap:5 urn:ietf:params:rtp-hdrext:sdes:mid
a=rtpmap:111 opus/48000/2
a=fmtp:111 minptime=10;useinbandfec=1
a=rtpmap:0 PCMU/8000
";

        let mut m = MediaEngine::default();
        m.register_default_codecs()?;
        m.update_from_remote_description(&parse(offer)?)?;

        assert!(m.negotiated_audio);
        assert!(!m.negotiated_video);

        let audio = m.get_codecs_by_kind(RtpCodecKind::Audio);
        assert_eq!(2, audio.len());
        assert_eq!(111, audio[0].payload_type);

        let (id, is_audio, is_video) = m.get_header_extension_id(RTCRtpHeaderExtensionCapability {
            uri: SDES_MID_URI.to_owned(),
        });
        assert_eq!((5, true, false), (id, is_audio, is_video));

        Ok(())
    }

    #[test]
    fn test_update_from_remote_description_partial_match() -> Result<()> {
        let offer = "v=0
o=- 4596489990601351948 2 IN IP4 127.0.0.1
s=-
t=0 0
m=video 9 UDP/TLS/RTP/SAVPF 120 121
c=IN IP4 0.0.0.0
a=mid:0
a=rtpmap:120 VP9/90000
a=fmtp:120 profile-id=2
a=rtpmap:121 rtx/90000
a=fmtp:121 apt=120
";

        let mut m = MediaEngine::default();
        m.register_default_codecs()?;
        m.update_from_remote_description(&parse(offer)?)?;

        let video = m.get_codecs_by_kind(RtpCodecKind::Video);
        let payload_types: Vec<u8> = video.iter().map(|c| c.payload_type).collect();
        assert_eq!(vec![120, 121], payload_types);

        Ok(())
    }
}
