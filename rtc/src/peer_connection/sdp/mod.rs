//! Building and inspecting the structured session descriptions exchanged
//! during offer/answer.
//!
//! The builder functions turn the state of a connection (media sections,
//! ICE parameters, fingerprints) into a [`SessionDescription`]; the
//! extraction functions read the same facts back out of a remote one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use log::warn;
use sdp::description::common::{Address, Attribute, ConnectionInformation};
use sdp::description::media::{MediaDescription, MediaName, RangedPort};
use sdp::description::session::{
    ATTR_KEY_CONNECTION_SETUP, ATTR_KEY_END_OF_CANDIDATES, ATTR_KEY_EXT_MAP, ATTR_KEY_GROUP,
    ATTR_KEY_ICELITE, ATTR_KEY_INACTIVE, ATTR_KEY_MID, ATTR_KEY_MSID, ATTR_KEY_RECV_ONLY,
    ATTR_KEY_RTCPMUX, ATTR_KEY_RTCPRSIZE, ATTR_KEY_SSRC, ATTR_KEY_SSRCGROUP, Origin,
    SEMANTIC_TOKEN_FLOW_IDENTIFICATION, SessionDescription,
};
use sdp::extmap::ExtMap;
use sdp::util::ConnectionRole;
use shared::error::{Error, Result};
use url::Url;

use crate::peer_connection::configuration::media_engine::MediaEngine;
use crate::peer_connection::state::RTCIceGatheringState;
use crate::peer_connection::transport::{RTCDtlsFingerprint, RTCIceCandidate, RTCIceParameters};
use crate::rtp_transceiver::direction::RTCRtpTransceiverDirection;
use crate::rtp_transceiver::rtp_codec::{RTCPFeedback, RTCRtpCodec, RTCRtpCodecParameters, RtpCodecKind};
use crate::rtp_transceiver::{RTCRtpTransceiver, SSRC};

pub mod sdp_type;
pub mod session_description;

pub use sdp_type::RTCSdpType;
pub use session_description::RTCSessionDescription;

pub(crate) const MEDIA_SECTION_APPLICATION: &str = "application";
pub(crate) const ATTR_KEY_EXTMAP_ALLOW_MIXED: &str = "extmap-allow-mixed";

const ATTR_KEY_RID: &str = "rid";
const ATTR_KEY_SIMULCAST: &str = "simulcast";
const ATTR_KEY_FINGERPRINT: &str = "fingerprint";
const ATTR_KEY_ICE_UFRAG: &str = "ice-ufrag";
const ATTR_KEY_ICE_PWD: &str = "ice-pwd";
const SCTP_PORT: &str = "sctp-port:5000";

/// TrackDetails represents any media source that can be represented in a SDP.
/// It isn't keyed by SSRC because it also needs to support rid based sources.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub(crate) struct TrackDetails {
    pub(crate) mid: String,
    pub(crate) kind: RtpCodecKind,
    pub(crate) stream_id: String,
    pub(crate) id: String,
    pub(crate) ssrcs: Vec<SSRC>,
    pub(crate) repair_ssrc: Option<SSRC>,
    pub(crate) rids: Vec<String>,
}

pub(crate) fn track_details_for_ssrc(
    track_details: &[TrackDetails],
    ssrc: SSRC,
) -> Option<&TrackDetails> {
    track_details.iter().find(|t| t.ssrcs.contains(&ssrc))
}

pub(crate) fn track_details_for_rid<'a>(
    track_details: &'a [TrackDetails],
    rid: &str,
) -> Option<&'a TrackDetails> {
    track_details.iter().find(|t| t.rids.iter().any(|r| r == rid))
}

pub(crate) fn filter_track_with_ssrc(incoming_tracks: &mut Vec<TrackDetails>, ssrc: SSRC) {
    incoming_tracks.retain_mut(|t| {
        t.ssrcs.retain(|s| *s != ssrc);
        !t.ssrcs.is_empty() || !t.rids.is_empty()
    });
}

/// track_details_from_sdp extracts every remote media source of `s`. Plan-B
/// descriptions may carry several sources in one media section, each
/// announced by its own `a=ssrc:<ssrc> msid:` line.
pub(crate) fn track_details_from_sdp(
    s: &SessionDescription,
    exclude_inactive: bool,
) -> Vec<TrackDetails> {
    let mut incoming_tracks: Vec<TrackDetails> = vec![];

    for media in &s.media_descriptions {
        // repair flow ssrc -> the ssrc it repairs
        let mut rtx_repair_flows: HashMap<SSRC, SSRC> = HashMap::new();

        // Plan B can have multiple tracks in a single media section
        let mut stream_id = String::new();
        let mut track_id = String::new();

        // If media section is recvonly or inactive skip
        if has_attribute(&media.attributes, ATTR_KEY_RECV_ONLY)
            || (exclude_inactive && has_attribute(&media.attributes, ATTR_KEY_INACTIVE))
        {
            continue;
        }

        let Some(mid_value) = get_mid_value(media) else {
            continue;
        };

        let codec_type = RtpCodecKind::from(media.media_name.media.as_str());
        if codec_type == RtpCodecKind::Unspecified {
            continue;
        }

        for attr in &media.attributes {
            let Some(value) = attr.value.as_deref() else {
                continue;
            };
            match attr.key.as_str() {
                ATTR_KEY_SSRCGROUP => {
                    let split: Vec<&str> = value.split(' ').collect();
                    // a=ssrc-group:FID 2231627014 632943048 declares the
                    // second ssrc as the RTX repair flow (RFC 4588) of the
                    // first one (RFC 5576)
                    if split.len() == 3 && split[0] == SEMANTIC_TOKEN_FLOW_IDENTIFICATION {
                        let (Ok(base), Ok(repair)) =
                            (split[1].parse::<SSRC>(), split[2].parse::<SSRC>())
                        else {
                            warn!("Failed to parse SSRC group: {value}");
                            continue;
                        };
                        rtx_repair_flows.insert(repair, base);
                        // remove if rtx was added as track before
                        filter_track_with_ssrc(&mut incoming_tracks, repair);
                        if let Some(t) = incoming_tracks
                            .iter_mut()
                            .find(|t| t.ssrcs.contains(&base))
                        {
                            t.repair_ssrc = Some(repair);
                        }
                    }
                }

                // Handle `a=msid:<stream_id> <track_label>` for Unified plan. The
                // first value is the same as MediaStream.id in the browser and
                // can be used to figure out which tracks belong to the same
                // stream.
                ATTR_KEY_MSID => {
                    if let Some((sid, tid)) = value.split_once(' ') {
                        stream_id = sid.to_owned();
                        track_id = tid.to_owned();
                    }
                }

                ATTR_KEY_SSRC => {
                    let split: Vec<&str> = value.split(' ').collect();
                    let ssrc = match split[0].parse::<SSRC>() {
                        Ok(ssrc) => ssrc,
                        Err(err) => {
                            warn!("Failed to parse SSRC: {err}");
                            continue;
                        }
                    };

                    if let Some(base) = rtx_repair_flows.get(&ssrc) {
                        if let Some(t) = incoming_tracks
                            .iter_mut()
                            .find(|t| t.ssrcs.contains(base))
                        {
                            t.repair_ssrc = Some(ssrc);
                        }
                        continue;
                    }

                    if split.len() == 3 {
                        if let Some(sid) = split[1].strip_prefix("msid:") {
                            stream_id = sid.to_owned();
                            track_id = split[2].to_owned();
                        }
                    }

                    let idx = match incoming_tracks.iter().position(|t| t.ssrcs.contains(&ssrc)) {
                        Some(idx) => idx,
                        None => {
                            incoming_tracks.push(TrackDetails {
                                ssrcs: vec![ssrc],
                                ..Default::default()
                            });
                            incoming_tracks.len() - 1
                        }
                    };
                    let details = &mut incoming_tracks[idx];

                    details.mid = mid_value.to_owned();
                    details.kind = codec_type;
                    details.stream_id = stream_id.clone();
                    details.id = track_id.clone();
                }
                _ => {}
            }
        }

        let rids = get_rids(media);
        if !rids.is_empty() && !track_id.is_empty() && !stream_id.is_empty() {
            incoming_tracks.push(TrackDetails {
                mid: mid_value.to_owned(),
                kind: codec_type,
                stream_id,
                id: track_id,
                rids,
                ..Default::default()
            });
        }
    }

    incoming_tracks
}

/// get_rids returns the rid of every `a=rid:` line in declaration order.
pub(crate) fn get_rids(media: &MediaDescription) -> Vec<String> {
    media
        .attributes
        .iter()
        .filter(|a| a.key == ATTR_KEY_RID)
        .filter_map(|a| a.value.as_deref())
        .filter_map(|v| v.split(' ').next())
        .map(str::to_owned)
        .collect()
}

pub(crate) fn add_candidates_to_media_descriptions(
    candidates: &[RTCIceCandidate],
    mut m: MediaDescription,
    ice_gathering_state: RTCIceGatheringState,
) -> MediaDescription {
    for c in candidates {
        let mut candidate = c.clone();
        candidate.component = 1;
        let marshaled = candidate.marshal();
        let known = m
            .attributes
            .iter()
            .any(|a| a.is_ice_candidate() && a.value.as_deref() == Some(marshaled.as_str()));
        if !known {
            m = m.with_candidate(marshaled);
        }
    }

    if ice_gathering_state != RTCIceGatheringState::Complete
        || has_attribute(&m.attributes, ATTR_KEY_END_OF_CANDIDATES)
    {
        return m;
    }

    m.with_property_attribute(ATTR_KEY_END_OF_CANDIDATES.to_owned())
}

pub(crate) struct AddDataMediaSectionParams<'a> {
    pub(crate) should_add_candidates: bool,
    pub(crate) mid_value: &'a str,
    pub(crate) ice_params: &'a RTCIceParameters,
    pub(crate) dtls_role: ConnectionRole,
    pub(crate) ice_gathering_state: RTCIceGatheringState,
}

fn add_fingerprints(mut media: MediaDescription, fingerprints: &[RTCDtlsFingerprint]) -> MediaDescription {
    for f in fingerprints {
        media = media.with_fingerprint(f.algorithm.clone(), f.value.to_uppercase());
    }
    media
}

pub(crate) fn add_data_media_section(
    d: SessionDescription,
    dtls_fingerprints: &[RTCDtlsFingerprint],
    candidates: &[RTCIceCandidate],
    params: AddDataMediaSectionParams<'_>,
) -> SessionDescription {
    let mut media = MediaDescription {
        media_name: MediaName {
            media: MEDIA_SECTION_APPLICATION.to_owned(),
            port: RangedPort {
                value: 9,
                range: None,
            },
            protos: vec!["UDP".to_owned(), "DTLS".to_owned(), "SCTP".to_owned()],
            formats: vec!["webrtc-datachannel".to_owned()],
        },
        connection_information: Some(ConnectionInformation {
            network_type: "IN".to_owned(),
            address_type: "IP4".to_owned(),
            address: Some(Address {
                address: "0.0.0.0".to_owned(),
                ttl: None,
                range: None,
            }),
        }),
        ..Default::default()
    }
    .with_value_attribute(
        ATTR_KEY_CONNECTION_SETUP.to_owned(),
        params.dtls_role.to_string(),
    )
    .with_value_attribute(ATTR_KEY_MID.to_owned(), params.mid_value.to_owned())
    .with_property_attribute(RTCRtpTransceiverDirection::Sendrecv.to_string())
    .with_property_attribute(SCTP_PORT.to_owned())
    .with_ice_credentials(
        params.ice_params.username_fragment.clone(),
        params.ice_params.password.clone(),
    );

    media = add_fingerprints(media, dtls_fingerprints);

    if params.should_add_candidates {
        media = add_candidates_to_media_descriptions(candidates, media, params.ice_gathering_state);
    }

    d.with_media(media)
}

/// MediaSection is one m= line to generate: either the data section or the
/// transceivers sharing it. Only Plan-B puts more than one transceiver in a
/// section.
#[derive(Default, Debug, Clone)]
pub(crate) struct MediaSection {
    pub(crate) id: String,
    pub(crate) transceivers: Vec<Arc<RTCRtpTransceiver>>,
    pub(crate) data: bool,
    pub(crate) rids: Vec<String>,
    pub(crate) offered_direction: Option<RTCRtpTransceiverDirection>,
}

pub(crate) struct AddTransceiverSdpParams<'a> {
    pub(crate) is_plan_b: bool,
    pub(crate) should_add_candidates: bool,
    pub(crate) mid_value: &'a str,
    pub(crate) ice_params: &'a RTCIceParameters,
    pub(crate) dtls_role: ConnectionRole,
    pub(crate) ice_gathering_state: RTCIceGatheringState,
}

/// add_transceiver_sdp appends the media section of `media_section` to `d`.
/// The returned flag is false when the section was rejected for lack of a
/// codec, in which case its mid must not be bundled.
pub(crate) fn add_transceiver_sdp(
    d: SessionDescription,
    dtls_fingerprints: &[RTCDtlsFingerprint],
    media_engine: &Arc<Mutex<MediaEngine>>,
    candidates: &[RTCIceCandidate],
    media_section: &MediaSection,
    params: AddTransceiverSdpParams<'_>,
) -> Result<(SessionDescription, bool)> {
    // use the first transceiver to generate the section attributes
    let Some(t) = media_section.transceivers.first() else {
        return Err(Error::ErrSDPZeroTransceivers);
    };

    let mut media =
        MediaDescription::new_jsep_media_description(t.kind().to_string(), vec![])
            .with_value_attribute(
                ATTR_KEY_CONNECTION_SETUP.to_owned(),
                params.dtls_role.to_string(),
            )
            .with_value_attribute(ATTR_KEY_MID.to_owned(), params.mid_value.to_owned())
            .with_ice_credentials(
                params.ice_params.username_fragment.clone(),
                params.ice_params.password.clone(),
            )
            .with_property_attribute(ATTR_KEY_RTCPMUX.to_owned())
            .with_property_attribute(ATTR_KEY_RTCPRSIZE.to_owned());

    let codecs = t.get_codecs();
    for codec in &codecs {
        let name = codec
            .rtp_codec
            .mime_type
            .split_once('/')
            .map_or(codec.rtp_codec.mime_type.as_str(), |(_, name)| name)
            .to_owned();
        media = media.with_codec(
            codec.payload_type,
            name,
            codec.rtp_codec.clock_rate,
            codec.rtp_codec.channels,
            codec.rtp_codec.sdp_fmtp_line.clone(),
        );

        for feedback in &codec.rtp_codec.rtcp_feedback {
            media = media.with_value_attribute(
                "rtcp-fb".to_owned(),
                format!("{} {} {}", codec.payload_type, feedback.typ, feedback.parameter)
                    .trim_end()
                    .to_owned(),
            );
        }
    }

    if codecs.is_empty() {
        // explicitly reject the section if we don't have the codec, keeping
        // its mid so the transceiver can still be matched to it
        let rejected = MediaDescription {
            media_name: MediaName {
                media: t.kind().to_string(),
                port: RangedPort {
                    value: 0,
                    range: None,
                },
                protos: vec![
                    "UDP".to_owned(),
                    "TLS".to_owned(),
                    "RTP".to_owned(),
                    "SAVPF".to_owned(),
                ],
                formats: vec!["0".to_owned()],
            },
            ..Default::default()
        }
        .with_value_attribute(ATTR_KEY_MID.to_owned(), params.mid_value.to_owned());
        return Ok((d.with_media(rejected), false));
    }

    let direction =
        RTCRtpTransceiverDirection::from_send_recv(t.sender().is_some(), t.receiver().is_some());
    let parameters = media_engine
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get_rtp_parameters_by_kind(t.kind(), direction);
    for rtp_extension in &parameters.header_extensions {
        let uri = Url::parse(&rtp_extension.uri)?;
        media = media.with_extmap(ExtMap {
            value: rtp_extension.id as isize,
            uri: Some(uri),
            ..Default::default()
        });
    }

    if !media_section.rids.is_empty() {
        for rid in &media_section.rids {
            media = media.with_value_attribute(ATTR_KEY_RID.to_owned(), format!("{rid} recv"));
        }
        media = media.with_value_attribute(
            ATTR_KEY_SIMULCAST.to_owned(),
            format!("recv {}", media_section.rids.join(";")),
        );
    }

    for mt in &media_section.transceivers {
        let Some(sender) = mt.sender() else {
            continue;
        };
        let Some(track) = sender.track() else {
            continue;
        };
        media = media.with_media_source(
            sender.ssrc(),
            track.stream_id().clone(), // cname
            track.stream_id().clone(), // stream label
            track.id().clone(),
        );
        if !params.is_plan_b {
            media = media.with_property_attribute(format!(
                "{ATTR_KEY_MSID}:{} {}",
                track.stream_id(),
                track.id()
            ));
            break;
        }
    }

    let direction = match media_section.offered_direction {
        // an answer never claims more than the offer allowed
        Some(offered) => t.direction().intersect(offered.reverse()),
        None => t.direction(),
    };
    media = media.with_property_attribute(direction.to_string());

    media = add_fingerprints(media, dtls_fingerprints);

    if params.should_add_candidates {
        media = add_candidates_to_media_descriptions(candidates, media, params.ice_gathering_state);
    }

    Ok((d.with_media(media), true))
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PopulateSdpParams {
    pub(crate) is_plan_b: bool,
    pub(crate) media_description_fingerprint: bool,
    pub(crate) is_icelite: bool,
    pub(crate) extmap_allow_mixed: bool,
    pub(crate) connection_role: ConnectionRole,
    pub(crate) ice_gathering_state: RTCIceGatheringState,
}

/// populate_sdp serializes the negotiable state of a connection into `d`.
pub(crate) fn populate_sdp(
    mut d: SessionDescription,
    dtls_fingerprints: &[RTCDtlsFingerprint],
    media_engine: &Arc<Mutex<MediaEngine>>,
    candidates: &[RTCIceCandidate],
    ice_params: &RTCIceParameters,
    media_sections: &[MediaSection],
    params: PopulateSdpParams,
) -> Result<SessionDescription> {
    let media_dtls_fingerprints: &[RTCDtlsFingerprint] = if params.media_description_fingerprint {
        dtls_fingerprints
    } else {
        &[]
    };

    let mut bundle_value = "BUNDLE".to_owned();
    let mut bundle_count = 0;

    for (i, m) in media_sections.iter().enumerate() {
        if m.data && !m.transceivers.is_empty() {
            return Err(Error::ErrSDPMediaSectionMediaDataChanInvalid);
        } else if !params.is_plan_b && m.transceivers.len() > 1 {
            return Err(Error::ErrSDPMediaSectionMultipleTrackInvalid);
        }

        let should_add_candidates = i == 0;
        let should_add_id = if m.data {
            d = add_data_media_section(
                d,
                media_dtls_fingerprints,
                candidates,
                AddDataMediaSectionParams {
                    should_add_candidates,
                    mid_value: &m.id,
                    ice_params,
                    dtls_role: params.connection_role,
                    ice_gathering_state: params.ice_gathering_state,
                },
            );
            true
        } else {
            let (next, should_add_id) = add_transceiver_sdp(
                d,
                media_dtls_fingerprints,
                media_engine,
                candidates,
                m,
                AddTransceiverSdpParams {
                    is_plan_b: params.is_plan_b,
                    should_add_candidates,
                    mid_value: &m.id,
                    ice_params,
                    dtls_role: params.connection_role,
                    ice_gathering_state: params.ice_gathering_state,
                },
            )?;
            d = next;
            should_add_id
        };

        if should_add_id {
            bundle_value.push(' ');
            bundle_value.push_str(&m.id);
            bundle_count += 1;
        }
    }

    if !params.media_description_fingerprint {
        for fingerprint in dtls_fingerprints {
            d = d.with_fingerprint(
                fingerprint.algorithm.clone(),
                fingerprint.value.to_uppercase(),
            );
        }
    }

    if params.is_icelite {
        // RFC 5245 S15.3
        d = d.with_value_attribute(ATTR_KEY_ICELITE.to_owned(), ATTR_KEY_ICELITE.to_owned());
    }

    if params.extmap_allow_mixed {
        d = d.with_property_attribute(ATTR_KEY_EXTMAP_ALLOW_MIXED.to_owned());
    }

    if bundle_count > 0 {
        d = d.with_value_attribute(ATTR_KEY_GROUP.to_owned(), bundle_value);
    }

    Ok(d)
}

/// attribute_value returns the value of the first `key` attribute.
pub(crate) fn attribute_value<'a>(attributes: &'a [Attribute], key: &str) -> Option<&'a str> {
    attributes
        .iter()
        .find(|a| a.key == key)
        .and_then(|a| a.value.as_deref())
}

pub(crate) fn has_attribute(attributes: &[Attribute], key: &str) -> bool {
    attributes.iter().any(|a| a.key == key)
}

pub(crate) fn get_mid_value(media: &MediaDescription) -> Option<&str> {
    attribute_value(&media.attributes, ATTR_KEY_MID)
}

/// description_is_plan_b reports whether the remote description names its
/// media sections after a media kind, which only Plan-B peers do.
pub(crate) fn description_is_plan_b(desc: Option<&RTCSessionDescription>) -> bool {
    let Some(parsed) = desc.and_then(|d| d.parsed.as_ref()) else {
        return false;
    };

    parsed.media_descriptions.iter().any(|media| {
        get_mid_value(media).is_some_and(|mid| {
            ["audio", "video", "data"]
                .iter()
                .any(|kind| mid.eq_ignore_ascii_case(kind))
        })
    })
}

pub(crate) fn get_peer_direction(media: &MediaDescription) -> RTCRtpTransceiverDirection {
    media
        .attributes
        .iter()
        .map(|a| RTCRtpTransceiverDirection::from(a.key.as_str()))
        .find(|d| *d != RTCRtpTransceiverDirection::Unspecified)
        .unwrap_or_default()
}

/// extract_fingerprint returns the (value, algorithm) of the single
/// fingerprint the description carries at session or media level.
pub(crate) fn extract_fingerprint(desc: &SessionDescription) -> Result<(String, String)> {
    let mut fingerprints = vec![];

    if let Some(fingerprint) = attribute_value(&desc.attributes, ATTR_KEY_FINGERPRINT) {
        fingerprints.push(fingerprint);
    }

    for m in &desc.media_descriptions {
        if let Some(fingerprint) = attribute_value(&m.attributes, ATTR_KEY_FINGERPRINT) {
            fingerprints.push(fingerprint);
        }
    }

    let Some(first) = fingerprints.first() else {
        return Err(Error::ErrSessionDescriptionNoFingerprint);
    };

    if fingerprints.iter().any(|f| f != first) {
        return Err(Error::ErrSessionDescriptionConflictingFingerprints);
    }

    let parts: Vec<&str> = first.split(' ').collect();
    if parts.len() != 2 {
        return Err(Error::ErrSessionDescriptionInvalidFingerprint);
    }
    Ok((parts[1].to_owned(), parts[0].to_owned()))
}

/// extract_ice_details returns the remote ICE ufrag, pwd and the candidates
/// found on any media section.
pub(crate) fn extract_ice_details(
    desc: &SessionDescription,
) -> Result<(String, String, Vec<RTCIceCandidate>)> {
    let mut candidates = vec![];
    let mut remote_pwds = vec![];
    let mut remote_ufrags = vec![];

    if let Some(ufrag) = attribute_value(&desc.attributes, ATTR_KEY_ICE_UFRAG) {
        remote_ufrags.push(ufrag);
    }
    if let Some(pwd) = attribute_value(&desc.attributes, ATTR_KEY_ICE_PWD) {
        remote_pwds.push(pwd);
    }

    for m in &desc.media_descriptions {
        if let Some(ufrag) = attribute_value(&m.attributes, ATTR_KEY_ICE_UFRAG) {
            remote_ufrags.push(ufrag);
        }
        if let Some(pwd) = attribute_value(&m.attributes, ATTR_KEY_ICE_PWD) {
            remote_pwds.push(pwd);
        }

        for a in &m.attributes {
            if a.is_ice_candidate() {
                if let Some(value) = &a.value {
                    candidates.push(RTCIceCandidate::unmarshal(value)?);
                }
            }
        }
    }

    let Some(ufrag) = remote_ufrags.first() else {
        return Err(Error::ErrSessionDescriptionMissingIceUfrag);
    };
    let Some(pwd) = remote_pwds.first() else {
        return Err(Error::ErrSessionDescriptionMissingIcePwd);
    };

    if remote_ufrags.iter().any(|u| u != ufrag) {
        return Err(Error::ErrSessionDescriptionConflictingIceUfrag);
    }
    if remote_pwds.iter().any(|p| p != pwd) {
        return Err(Error::ErrSessionDescriptionConflictingIcePwd);
    }

    Ok((ufrag.to_string(), pwd.to_string(), candidates))
}

pub(crate) fn have_application_media_section(desc: &SessionDescription) -> bool {
    desc.media_descriptions
        .iter()
        .any(|m| m.media_name.media == MEDIA_SECTION_APPLICATION)
}

pub(crate) fn get_by_mid<'a>(
    search_mid: &str,
    desc: &'a RTCSessionDescription,
) -> Option<&'a MediaDescription> {
    desc.parsed
        .as_ref()?
        .media_descriptions
        .iter()
        .find(|m| get_mid_value(m) == Some(search_mid))
}

/// have_data_channel returns the media section carrying data channels.
pub(crate) fn have_data_channel(desc: &RTCSessionDescription) -> Option<&MediaDescription> {
    desc.parsed
        .as_ref()?
        .media_descriptions
        .iter()
        .find(|d| d.media_name.media == MEDIA_SECTION_APPLICATION)
}

/// is_lite_set reports whether the description declares an ICE lite agent.
pub(crate) fn is_lite_set(desc: &SessionDescription) -> bool {
    desc.attributes
        .iter()
        .any(|a| a.key.trim() == ATTR_KEY_ICELITE)
}

/// update_sdp_origin keeps one session id for the lifetime of the
/// connection and bumps the version on every new local description.
pub(crate) fn update_sdp_origin(origin: &mut Origin, d: &mut SessionDescription) {
    if origin.session_version == 0 {
        origin.session_id = d.origin.session_id;
        origin.session_version = d.origin.session_version.max(1);
    } else {
        origin.session_version += 1;
        d.origin.session_id = origin.session_id;
    }
    d.origin.session_version = origin.session_version;
}

/// codecs_from_media_description lists the codecs of the section's formats
/// in offer order, with the rtpmap, fmtp and rtcp-fb lines folded in.
pub(crate) fn codecs_from_media_description(
    m: &MediaDescription,
) -> Result<Vec<RTCRtpCodecParameters>> {
    let s = SessionDescription {
        media_descriptions: vec![m.clone()],
        ..Default::default()
    };

    let mut out = vec![];
    for format in &m.media_name.formats {
        let payload_type = format.parse::<u8>()?;
        let codec = match s.get_codec_for_payload_type(payload_type) {
            Ok(codec) => codec,
            // static payload type 0 is allowed to have no rtpmap
            Err(_) if payload_type == 0 => continue,
            Err(_) => return Err(Error::ErrCodecNotFound),
        };

        let channels = codec.encoding_parameters.parse::<u16>().unwrap_or(0);

        let rtcp_feedback = codec
            .rtcp_feedback
            .iter()
            .map(|raw| match raw.split_once(' ') {
                Some((typ, parameter)) => RTCPFeedback {
                    typ: typ.to_owned(),
                    parameter: parameter.to_owned(),
                },
                None => RTCPFeedback {
                    typ: raw.to_owned(),
                    parameter: String::new(),
                },
            })
            .collect();

        out.push(RTCRtpCodecParameters {
            rtp_codec: RTCRtpCodec {
                mime_type: format!("{}/{}", m.media_name.media, codec.name),
                clock_rate: codec.clock_rate,
                channels,
                sdp_fmtp_line: codec.fmtp.clone(),
                rtcp_feedback,
            },
            payload_type: codec.payload_type,
        });
    }

    Ok(out)
}

pub(crate) fn rtp_extensions_from_media_description(
    m: &MediaDescription,
) -> Result<HashMap<String, u16>> {
    let mut out = HashMap::new();

    for a in &m.attributes {
        if a.key != ATTR_KEY_EXT_MAP {
            continue;
        }
        let Some(value) = &a.value else {
            continue;
        };
        let line = format!("{}:{value}", a.key);
        let e = ExtMap::unmarshal(&mut line.as_bytes())?;
        let Ok(id) = u16::try_from(e.value) else {
            warn!("ignoring extmap with id {}", e.value);
            continue;
        };
        if let Some(uri) = e.uri {
            out.insert(uri.to_string(), id);
        }
    }

    Ok(out)
}
