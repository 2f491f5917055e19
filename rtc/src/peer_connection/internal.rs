use std::sync::atomic::Ordering;

use ::sdp::description::session::{ATTR_KEY_MSID, ATTR_KEY_SSRC, SessionDescription};
use ::sdp::extmap::{SDES_MID_URI, SDES_REPAIR_RTP_STREAM_ID_URI, SDES_RTP_STREAM_ID_URI};
use ::sdp::util::ConnectionRole;
use log::{debug, error, info, trace, warn};
use util::Unmarshal;

use super::*;
use crate::peer_connection::configuration::sdp_semantics::RTCSdpSemantics;
use crate::peer_connection::sdp::{
    ATTR_KEY_EXTMAP_ALLOW_MIXED, MEDIA_SECTION_APPLICATION, MediaSection, PopulateSdpParams,
    TrackDetails, attribute_value, description_is_plan_b, extract_fingerprint,
    extract_ice_details, filter_track_with_ssrc, get_by_mid, get_mid_value, get_peer_direction,
    get_rids, has_attribute, have_application_media_section, have_data_channel, populate_sdp,
    track_details_for_rid, track_details_for_ssrc, track_details_from_sdp,
};
use crate::peer_connection::transport::dtls::engine::RtpReadStream;
use crate::peer_connection::transport::sctp::capabilities::SCTPTransportCapabilities;
use crate::peer_connection::transport::{DTLSParameters, RTCDtlsFingerprint, RTCIceParameters, RTCIceRole};
use crate::rtp_transceiver::rtp_parameters::{
    RTCRtpDecodingParameters, RTCRtpHeaderExtensionCapability, RTCRtpReceiveParameters,
};
use crate::rtp_transceiver::{TriggerNegotiationNeededFn, find_by_mid, satisfy_type_and_direction};

const ATTR_KEY_MAX_MESSAGE_SIZE: &str = "max-message-size";
const ATTR_KEY_RID: &str = "rid";

impl RTCPeerConnection {
    /// trigger_negotiation_needed runs the negotiation-needed check at most
    /// once at a time. A request arriving while a check runs queues exactly
    /// one more check.
    /// <https://w3c.github.io/webrtc-pc/#updating-the-negotiation-needed-flag>
    pub(super) fn trigger_negotiation_needed(&self) {
        {
            let mut internal = self.lock();
            match internal.negotiation_needed_state {
                NegotiationNeededState::Run => {
                    internal.negotiation_needed_state = NegotiationNeededState::Queue;
                    return;
                }
                NegotiationNeededState::Queue => return,
                NegotiationNeededState::Empty => {
                    internal.negotiation_needed_state = NegotiationNeededState::Run;
                }
            }
        }

        if let Some(pc) = self.weak_self.upgrade() {
            self.ops.enqueue(pc.negotiation_needed_op(false));
        }
    }

    /// The callback handed to transceivers; it must not keep the connection
    /// alive.
    pub(super) fn negotiation_needed_trigger(&self) -> TriggerNegotiationNeededFn {
        let weak = self.weak_self.clone();
        Arc::new(move || {
            if let Some(pc) = weak.upgrade() {
                pc.trigger_negotiation_needed();
            }
        })
    }

    fn negotiation_needed_op(self: Arc<Self>, deferred: bool) -> operation::Operation {
        Box::pin(async move {
            // Step 2.1
            if self.is_closed() {
                self.lock().negotiation_needed_state = NegotiationNeededState::Empty;
                return;
            }

            // non-canon step 2.2, the operations queued meanwhile go first.
            // Deferring once keeps a steady stream of operations from
            // starving the check.
            if !deferred && self.ops.len() != 0 {
                self.ops.enqueue(Arc::clone(&self).negotiation_needed_op(true));
                return;
            }

            self.update_negotiation_needed_flag();

            // non-canon, run again if there was a request
            let run_again = {
                let mut internal = self.lock();
                let queued = internal.negotiation_needed_state == NegotiationNeededState::Queue;
                internal.negotiation_needed_state = NegotiationNeededState::Empty;
                queued
            };
            if run_again {
                self.trigger_negotiation_needed();
            }
        })
    }

    fn update_negotiation_needed_flag(&self) {
        // Step 2.3
        if self.signaling_state() != RTCSignalingState::Stable {
            return;
        }

        // Step 2.4
        if !self.check_negotiation_needed() {
            self.lock().is_negotiation_needed = false;
            return;
        }

        // Step 2.5, 2.6
        {
            let mut internal = self.lock();
            if internal.is_negotiation_needed {
                return;
            }
            internal.is_negotiation_needed = true;
        }

        // Step 2.7
        debug!("negotiation needed");
        self.events.post(RTCPeerConnectionEvent::NegotiationNeeded);
    }

    /// check_negotiation_needed compares the negotiated descriptions against
    /// the local transceivers and data channels.
    /// <https://www.w3.org/TR/webrtc/#dfn-check-if-negotiation-is-needed>
    pub(super) fn check_negotiation_needed(&self) -> bool {
        let (local_desc, remote_desc, transceivers) = {
            let internal = self.lock();
            (
                internal.current_local_description.clone(),
                internal.current_remote_description.clone(),
                internal.rtp_transceivers.clone(),
            )
        };

        // Step 1
        let Some(local_desc) = local_desc else {
            return true;
        };

        // Step 4
        if !self.sctp_transport.data_channels().is_empty()
            && have_data_channel(&local_desc).is_none()
        {
            return true;
        }

        for t in &transceivers {
            let mid = t.mid();

            // Step 5.1
            if t.stopped() {
                // Step 5.2
                let Some(mid) = mid.as_deref() else {
                    continue;
                };
                let still_offered = |desc: Option<&RTCSessionDescription>| {
                    desc.and_then(|d| get_by_mid(mid, d))
                        .is_some_and(|m| m.media_name.port.value != 0)
                };
                if still_offered(Some(&local_desc)) || still_offered(remote_desc.as_ref()) {
                    return true;
                }
                continue;
            }

            // Step 5.3.1
            let Some(m) = mid.as_deref().and_then(|mid| get_by_mid(mid, &local_desc)) else {
                return true;
            };

            let direction = t.direction();

            // Step 5.3.2
            if direction.has_send() {
                let Some(sender) = t.sender() else {
                    return true;
                };
                // the track was replaced by none
                let Some(track) = sender.track() else {
                    continue;
                };

                let expected = format!("{} {}", track.stream_id(), track.id());
                if attribute_value(&m.attributes, ATTR_KEY_MSID) != Some(expected.as_str()) {
                    return true;
                }
            }

            match local_desc.sdp_type {
                // Step 5.3.3
                RTCSdpType::Offer => {
                    let Some(rm) = remote_desc
                        .as_ref()
                        .and_then(|remote| mid.as_deref().and_then(|mid| get_by_mid(mid, remote)))
                    else {
                        return true;
                    };

                    if get_peer_direction(m) != direction
                        && get_peer_direction(rm) != direction.reverse()
                    {
                        return true;
                    }
                }
                // Step 5.3.4
                RTCSdpType::Answer => {
                    if !has_attribute(&m.attributes, &direction.to_string()) {
                        return true;
                    }
                }
                _ => {}
            }
        }

        // Step 6
        false
    }

    pub(super) fn do_ice_connection_state_change(&self, state: RTCIceConnectionState) {
        {
            let mut internal = self.lock();
            if internal.ice_connection_state == state {
                return;
            }
            internal.ice_connection_state = state;
        }
        info!("ICE connection state changed: {state}");
        self.events
            .post(RTCPeerConnectionEvent::IceConnectionStateChange(state));

        self.update_connection_state();
    }

    /// update_connection_state recomputes the aggregate connection state.
    /// <https://www.w3.org/TR/webrtc/#dom-rtcpeerconnectionstate>
    pub(super) fn update_connection_state(&self) {
        let dtls_state = self.dtls_transport.state();
        let next = {
            let mut internal = self.lock();
            let next = RTCPeerConnectionState::aggregate(
                self.is_closed(),
                internal.ice_connection_state,
                dtls_state,
            );
            if internal.peer_connection_state == next {
                return;
            }
            internal.peer_connection_state = next;
            next
        };

        info!("peer connection state changed: {next}");
        self.events
            .post(RTCPeerConnectionEvent::PeerConnectionStateChange(next));
    }

    /// Assigns a mid to every transceiver that lacks one and returns the
    /// transceivers an offer is generated from, whether a remote description
    /// was negotiated before, and whether the offer is Plan-B.
    pub(super) fn prepare_offer_transceivers(&self) -> (Vec<Arc<RTCRtpTransceiver>>, bool, bool) {
        let mut internal = self.lock();

        let has_remote = internal.current_remote_description.is_some();
        let mut is_plan_b = internal.configuration.sdp_semantics == RTCSdpSemantics::PlanB;
        if has_remote && is_plan_b {
            is_plan_b = description_is_plan_b(internal.current_remote_description.as_ref());
        }

        if !is_plan_b {
            let remote_mids: Vec<isize> = internal
                .current_remote_description
                .as_ref()
                .and_then(|d| d.parsed.as_ref())
                .map(|parsed| {
                    parsed
                        .media_descriptions
                        .iter()
                        .filter_map(|media| get_mid_value(media)?.parse::<isize>().ok())
                        .collect()
                })
                .unwrap_or_default();
            for mid in remote_mids {
                internal.greater_mid = internal.greater_mid.max(mid);
            }

            let transceivers = internal.rtp_transceivers.clone();
            for t in &transceivers {
                if let Some(mid) = t.mid() {
                    if let Ok(numeric_mid) = mid.parse::<isize>() {
                        internal.greater_mid = internal.greater_mid.max(numeric_mid);
                    }
                    continue;
                }

                internal.greater_mid += 1;
                if let Err(err) = t.set_mid(internal.greater_mid.to_string()) {
                    warn!("failed to assign mid: {err}");
                }
            }
        }

        (internal.rtp_transceivers.clone(), has_remote, is_plan_b)
    }

    /// has_local_description_changed reports whether the transceivers moved
    /// on since `desc` was generated from them.
    pub(super) fn has_local_description_changed(&self, desc: &SessionDescription) -> bool {
        for t in self.get_transceivers() {
            if t.stopped() {
                continue;
            }

            let Some(mid) = t.mid() else {
                return true;
            };
            let Some(m) = desc
                .media_descriptions
                .iter()
                .find(|m| get_mid_value(m) == Some(mid.as_str()))
            else {
                return true;
            };

            // a rejected section carries no direction
            if m.media_name.port.value == 0 {
                continue;
            }
            if get_peer_direction(m) != t.direction() {
                return true;
            }
        }

        false
    }

    fn dtls_fingerprints(&self) -> Vec<RTCDtlsFingerprint> {
        self.lock()
            .configuration
            .certificates
            .first()
            .map(|c| c.get_fingerprints())
            .unwrap_or_default()
    }

    /// generate_unmatched_sdp generates the first offer of a connection, one
    /// media section per transceiver.
    pub(super) fn generate_unmatched_sdp(
        &self,
        transceivers: &[Arc<RTCRtpTransceiver>],
        ice_params: &RTCIceParameters,
        candidates: &[RTCIceCandidate],
    ) -> Result<SessionDescription> {
        let d = SessionDescription::new_jsep_session_description(false);
        let is_plan_b = self.lock().configuration.sdp_semantics == RTCSdpSemantics::PlanB;

        let mut media_sections = vec![];
        if is_plan_b {
            let mut video = vec![];
            let mut audio = vec![];
            for t in transceivers.iter().filter(|t| !t.stopped()) {
                match t.kind() {
                    RtpCodecKind::Video => video.push(Arc::clone(t)),
                    RtpCodecKind::Audio => audio.push(Arc::clone(t)),
                    RtpCodecKind::Unspecified => continue,
                }
                if let Some(sender) = t.sender() {
                    sender.set_negotiated();
                }
            }

            if !video.is_empty() {
                media_sections.push(MediaSection {
                    id: "video".to_owned(),
                    transceivers: video,
                    ..Default::default()
                });
            }
            if !audio.is_empty() {
                media_sections.push(MediaSection {
                    id: "audio".to_owned(),
                    transceivers: audio,
                    ..Default::default()
                });
            }
        } else {
            for t in transceivers.iter().filter(|t| !t.stopped()) {
                let Some(mid) = t.mid() else {
                    continue;
                };
                if let Some(sender) = t.sender() {
                    sender.set_negotiated();
                }
                media_sections.push(MediaSection {
                    id: mid,
                    transceivers: vec![Arc::clone(t)],
                    ..Default::default()
                });
            }
        }

        if self.sctp_transport.data_channels_requested() != 0 {
            let id = data_section_id(&media_sections, is_plan_b);
            media_sections.push(MediaSection {
                id,
                data: true,
                ..Default::default()
            });
        }

        populate_sdp(
            d,
            &self.dtls_fingerprints(),
            &self.media_engine,
            candidates,
            ice_params,
            &media_sections,
            PopulateSdpParams {
                is_plan_b,
                media_description_fingerprint: self.setting_engine.sdp_media_level_fingerprints,
                is_icelite: self.setting_engine.candidates.ice_lite,
                extmap_allow_mixed: true,
                connection_role: RTCDtlsRole::Auto.to_connection_role(),
                ice_gathering_state: self.ice_gathering_state(),
            },
        )
    }

    /// generate_matched_sdp generates a description whose media sections
    /// follow the order of the remote description. Offers also carry the
    /// local transceivers the remote does not know yet.
    pub(super) fn generate_matched_sdp(
        &self,
        transceivers: &[Arc<RTCRtpTransceiver>],
        include_unmatched: bool,
        connection_role: ConnectionRole,
        ice_params: &RTCIceParameters,
        candidates: &[RTCIceCandidate],
    ) -> Result<SessionDescription> {
        let d = SessionDescription::new_jsep_session_description(false);

        let (remote_description, sdp_semantics) = {
            let internal = self.lock();
            (
                internal.remote_description().cloned(),
                internal.configuration.sdp_semantics,
            )
        };
        let Some(remote_description) = remote_description else {
            return Err(Error::ErrPeerConnRemoteDescriptionNil);
        };
        let Some(parsed) = remote_description.parsed.as_ref() else {
            return Err(Error::ErrPeerConnRemoteDescriptionNil);
        };

        let extmap_allow_mixed = has_attribute(&parsed.attributes, ATTR_KEY_EXTMAP_ALLOW_MIXED);
        let detected_plan_b = description_is_plan_b(Some(&remote_description));

        let mut local_transceivers = transceivers.to_vec();
        let mut media_sections = vec![];
        let mut already_have_application_media_section = false;

        for media in &parsed.media_descriptions {
            let Some(mid_value) = get_mid_value(media) else {
                return Err(Error::ErrPeerConnRemoteDescriptionWithoutMidValue);
            };

            if media.media_name.media == MEDIA_SECTION_APPLICATION {
                media_sections.push(MediaSection {
                    id: mid_value.to_owned(),
                    data: true,
                    ..Default::default()
                });
                already_have_application_media_section = true;
                continue;
            }

            let kind = RtpCodecKind::from(media.media_name.media.as_str());
            let direction = get_peer_direction(media);
            if kind == RtpCodecKind::Unspecified
                || direction == RTCRtpTransceiverDirection::Unspecified
            {
                continue;
            }

            let plan_b_answer = sdp_semantics == RTCSdpSemantics::PlanB
                || (sdp_semantics == RTCSdpSemantics::UnifiedPlanWithFallback && detected_plan_b);

            if plan_b_answer {
                if !detected_plan_b {
                    return Err(Error::ErrIncorrectSDPSemantics);
                }

                // fill the section with every local transceiver that fits
                let mut media_transceivers = vec![];
                while let Some(t) = satisfy_type_and_direction(kind, direction, &local_transceivers)
                {
                    local_transceivers.retain(|l| !Arc::ptr_eq(l, &t));
                    if let Some(sender) = t.sender() {
                        sender.set_negotiated();
                    }
                    media_transceivers.push(t);
                }
                if media_transceivers.is_empty() {
                    let codecs = self
                        .media_engine
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .get_codecs_by_kind(kind);
                    media_transceivers.push(RTCRtpTransceiver::new(
                        None,
                        None,
                        RTCRtpTransceiverDirection::Inactive,
                        kind,
                        codecs,
                        Arc::clone(&self.media_engine),
                        None,
                    ));
                }

                media_sections.push(MediaSection {
                    id: mid_value.to_owned(),
                    transceivers: media_transceivers,
                    ..Default::default()
                });
            } else {
                if detected_plan_b {
                    return Err(Error::ErrIncorrectSDPSemantics);
                }

                let Some(t) = find_by_mid(mid_value, &local_transceivers) else {
                    return Err(Error::ErrPeerConnTransceiverMidNil);
                };
                local_transceivers.retain(|l| !Arc::ptr_eq(l, &t));
                if let Some(sender) = t.sender() {
                    sender.set_negotiated();
                }

                media_sections.push(MediaSection {
                    id: mid_value.to_owned(),
                    transceivers: vec![t],
                    rids: get_rids(media),
                    offered_direction: (!include_unmatched).then_some(direction),
                    ..Default::default()
                });
            }
        }

        // If we are offering also include unmatched local transceivers
        if include_unmatched {
            if !detected_plan_b {
                for t in local_transceivers.iter().filter(|t| !t.stopped()) {
                    let Some(mid) = t.mid() else {
                        continue;
                    };
                    if let Some(sender) = t.sender() {
                        sender.set_negotiated();
                    }
                    media_sections.push(MediaSection {
                        id: mid,
                        transceivers: vec![Arc::clone(t)],
                        ..Default::default()
                    });
                }
            }

            if self.sctp_transport.data_channels_requested() != 0
                && !already_have_application_media_section
            {
                let id = data_section_id(&media_sections, detected_plan_b);
                media_sections.push(MediaSection {
                    id,
                    data: true,
                    ..Default::default()
                });
            }
        }

        if sdp_semantics == RTCSdpSemantics::UnifiedPlanWithFallback && detected_plan_b {
            info!("Plan-B offer detected; responding with Plan-B answer");
        }

        populate_sdp(
            d,
            &self.dtls_fingerprints(),
            &self.media_engine,
            candidates,
            ice_params,
            &media_sections,
            PopulateSdpParams {
                is_plan_b: detected_plan_b,
                media_description_fingerprint: self.setting_engine.sdp_media_level_fingerprints,
                is_icelite: self.setting_engine.candidates.ice_lite,
                extmap_allow_mixed,
                connection_role,
                ice_gathering_state: self.ice_gathering_state(),
            },
        )
    }

    /// apply_remote_description binds the remote media sections to local
    /// transceivers and schedules the transports. `desc` has already passed
    /// the signaling transition.
    pub(super) async fn apply_remote_description(
        &self,
        desc: RTCSessionDescription,
        is_renegotiation: bool,
    ) -> Result<()> {
        let Some(parsed) = desc.parsed.as_ref() else {
            return Err(Error::ErrPeerConnRemoteDescriptionNil);
        };

        self.media_engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .update_from_remote_description(parsed)?;

        let we_offer = desc.sdp_type == RTCSdpType::Answer;

        if !we_offer && !description_is_plan_b(Some(&desc)) {
            for media in &parsed.media_descriptions {
                let Some(mid_value) = get_mid_value(media) else {
                    return Err(Error::ErrPeerConnRemoteDescriptionWithoutMidValue);
                };
                if media.media_name.media == MEDIA_SECTION_APPLICATION {
                    continue;
                }

                let kind = RtpCodecKind::from(media.media_name.media.as_str());
                let direction = get_peer_direction(media);
                if kind == RtpCodecKind::Unspecified
                    || direction == RTCRtpTransceiverDirection::Unspecified
                {
                    continue;
                }

                let t = self.bind_remote_media_section(mid_value, kind, direction).await?;
                if let Err(err) = t.set_codec_preferences_from_remote_description(media) {
                    warn!("failed to set codec preferences for mid {mid_value}: {err}");
                }
            }
        }

        let current_transceivers = self.get_transceivers();
        if we_offer {
            set_rtp_transceiver_current_direction(&desc, &current_transceivers, true);
        }

        let (remote_ufrag, remote_pwd, candidates) = extract_ice_details(parsed)?;

        if is_renegotiation
            && self
                .ice_transport
                .have_remote_credentials_change(&remote_ufrag, &remote_pwd)
                .await
        {
            // An ICE restart only happens implicitly for a remote offer
            if !we_offer {
                self.ice_transport.restart().await?;
            }

            self.ice_transport
                .set_remote_credentials(remote_ufrag.clone(), remote_pwd.clone())
                .await?;
        }

        for candidate in candidates {
            self.ice_transport.add_remote_candidate(Some(candidate)).await?;
        }

        let Some(pc) = self.weak_self.upgrade() else {
            return Err(Error::ErrConnectionClosed);
        };

        if is_renegotiation {
            if we_offer {
                self.start_rtp_senders(&current_transceivers).await;
                self.ops.enqueue(async move {
                    pc.start_rtp(true, desc, current_transceivers).await;
                });
            }
            return Ok(());
        }

        let remote_is_lite = is_lite_set(parsed);
        let (fingerprint, fingerprint_hash) = extract_fingerprint(parsed)?;

        // If one of the agents is lite and the other one is not, the lite agent must be the controlling agent.
        // If both or neither agents are lite the offering agent is controlling.
        // RFC 8445 S6.1.1
        let local_is_lite = self.setting_engine.candidates.ice_lite;
        let ice_role = if (we_offer && remote_is_lite == local_is_lite)
            || (remote_is_lite && !local_is_lite)
        {
            RTCIceRole::Controlling
        } else {
            RTCIceRole::Controlled
        };

        // Start the networking in a new routine since it will block until
        // the connection is actually established.
        if we_offer {
            self.start_rtp_senders(&current_transceivers).await;
        }

        let dtls_role = RTCDtlsRole::from(parsed);
        self.ops.enqueue(async move {
            pc.start_transports(
                ice_role,
                dtls_role,
                remote_ufrag,
                remote_pwd,
                fingerprint,
                fingerprint_hash,
            )
            .await;

            if we_offer {
                pc.start_rtp(false, desc, current_transceivers).await;
            }
        });

        Ok(())
    }

    /// Finds or creates the transceiver of a media section of a remote
    /// offer.
    async fn bind_remote_media_section(
        &self,
        mid_value: &str,
        kind: RtpCodecKind,
        direction: RTCRtpTransceiverDirection,
    ) -> Result<Arc<RTCRtpTransceiver>> {
        let local_transceivers = self.get_transceivers();
        let existing = find_by_mid(mid_value, &local_transceivers)
            .or_else(|| satisfy_type_and_direction(kind, direction, &local_transceivers));

        if let Some(t) = existing {
            if direction == RTCRtpTransceiverDirection::Inactive {
                t.stop().await?;
            } else if direction == RTCRtpTransceiverDirection::Recvonly
                && t.direction() == RTCRtpTransceiverDirection::Sendrecv
            {
                t.set_direction(RTCRtpTransceiverDirection::Sendonly);
            }

            if t.mid().is_none() {
                t.set_mid(mid_value.to_owned())?;
            }
            return Ok(t);
        }

        let receiver = Arc::new(RTCRtpReceiver::new(
            self.setting_engine.get_receive_mtu(),
            kind,
            Arc::clone(&self.dtls_transport),
            Arc::clone(&self.media_engine),
        ));

        let local_direction = match direction {
            RTCRtpTransceiverDirection::Recvonly => RTCRtpTransceiverDirection::Sendonly,
            RTCRtpTransceiverDirection::Inactive => RTCRtpTransceiverDirection::Inactive,
            _ => RTCRtpTransceiverDirection::Recvonly,
        };

        let t = RTCRtpTransceiver::new(
            Some(receiver),
            None,
            local_direction,
            kind,
            vec![],
            Arc::clone(&self.media_engine),
            Some(self.negotiation_needed_trigger()),
        );
        t.set_mid(mid_value.to_owned())?;
        trace!("created transceiver {t:?} for remote mid {mid_value}");
        self.add_rtp_transceiver(Arc::clone(&t));

        Ok(t)
    }

    /// start_transports starts ICE and then DTLS. Failures are logged, the
    /// connection state reports them.
    async fn start_transports(
        &self,
        ice_role: RTCIceRole,
        dtls_role: RTCDtlsRole,
        remote_ufrag: String,
        remote_pwd: String,
        fingerprint: String,
        fingerprint_hash: String,
    ) {
        // Start the ice transport
        if let Err(err) = self
            .ice_transport
            .start(
                RTCIceParameters {
                    username_fragment: remote_ufrag,
                    password: remote_pwd,
                    ice_lite: false,
                },
                Some(ice_role),
            )
            .await
        {
            warn!("failed to start ICE transport: {err}");
            return;
        }

        // Start the dtls_transport transport
        if let Err(err) = self
            .dtls_transport
            .start(DTLSParameters {
                role: dtls_role,
                fingerprints: vec![RTCDtlsFingerprint {
                    algorithm: fingerprint_hash,
                    value: fingerprint,
                }],
            })
            .await
        {
            warn!("failed to start DTLS transport: {err}");
        }

        self.update_connection_state();
    }

    /// start_rtp binds the remote tracks to receivers and starts SCTP when
    /// the remote description carries an application section.
    pub(super) async fn start_rtp(
        &self,
        is_renegotiation: bool,
        remote_desc: RTCSessionDescription,
        current_transceivers: Vec<Arc<RTCRtpTransceiver>>,
    ) {
        let Some(parsed) = remote_desc.parsed.as_ref() else {
            return;
        };

        let track_details = track_details_from_sdp(parsed, false);

        if is_renegotiation {
            self.update_receiver_tracks(&track_details, &current_transceivers)
                .await;
        } else if let Some(pc) = self.weak_self.upgrade() {
            tokio::spawn(async move {
                pc.undeclared_media_processor().await;
            });
        }

        self.start_rtp_receivers(track_details, &current_transceivers)
            .await;

        if have_application_media_section(parsed) {
            let caps = SCTPTransportCapabilities {
                max_message_size: max_message_size(parsed),
            };
            if let Err(err) = self.sctp_transport.start(caps).await {
                warn!("failed to start SCTP: {err}");
                if let Err(err) = self.sctp_transport.stop().await {
                    warn!("failed to stop SCTP transport: {err}");
                }
            }
        }
    }

    /// On renegotiation the remote may rename a track or drop it. Renamed
    /// tracks keep their receiver, a receiver with a dropped track is
    /// replaced by a fresh one.
    async fn update_receiver_tracks(
        &self,
        track_details: &[TrackDetails],
        current_transceivers: &[Arc<RTCRtpTransceiver>],
    ) {
        for t in current_transceivers {
            let Some(receiver) = t.receiver() else {
                continue;
            };
            let tracks = receiver.tracks();
            if tracks.is_empty() {
                continue;
            }

            let mut receiver_needs_stopped = false;
            for track in &tracks {
                let details = if !track.rid().is_empty() {
                    track_details_for_rid(track_details, track.rid())
                } else if track.ssrc() != 0 {
                    track_details_for_ssrc(track_details, track.ssrc())
                } else {
                    None
                };

                match details {
                    Some(details) => {
                        track.set_id(details.id.clone());
                        track.set_stream_id(details.stream_id.clone());
                    }
                    None => receiver_needs_stopped = true,
                }
            }

            if !receiver_needs_stopped {
                continue;
            }

            if let Err(err) = receiver.stop().await {
                warn!("failed to stop RtpReceiver: {err}");
                continue;
            }

            let receiver = Arc::new(RTCRtpReceiver::new(
                self.setting_engine.get_receive_mtu(),
                receiver.kind(),
                Arc::clone(&self.dtls_transport),
                Arc::clone(&self.media_engine),
            ));
            t.set_receiver(Some(receiver));
        }
    }

    async fn start_rtp_receivers(
        &self,
        mut incoming_tracks: Vec<TrackDetails>,
        current_transceivers: &[Arc<RTCRtpTransceiver>],
    ) {
        if incoming_tracks.is_empty() {
            return;
        }

        // If we already have a TrackRemote for a given SSRC don't handle it again
        for t in current_transceivers {
            let Some(receiver) = t.receiver() else {
                continue;
            };
            for track in receiver.tracks() {
                let ssrc = track.ssrc();
                if ssrc != 0 {
                    filter_track_with_ssrc(&mut incoming_tracks, ssrc);
                }
            }
        }

        let mut unhandled_tracks = vec![];
        for incoming in incoming_tracks {
            let target = current_transceivers.iter().find(|t| {
                t.mid().as_deref() == Some(incoming.mid.as_str())
                    && t.kind() == incoming.kind
                    && matches!(
                        t.direction(),
                        RTCRtpTransceiverDirection::Recvonly | RTCRtpTransceiverDirection::Sendrecv
                    )
                    && t.receiver().is_some_and(|r| !r.have_received())
            });

            match target {
                Some(t) => self.spawn_receiver(incoming, Arc::clone(t)),
                None => unhandled_tracks.push(incoming),
            }
        }

        let sdp_semantics = self.lock().configuration.sdp_semantics;
        let remote_is_plan_b = match sdp_semantics {
            RTCSdpSemantics::PlanB => true,
            RTCSdpSemantics::UnifiedPlanWithFallback => {
                description_is_plan_b(self.remote_description().as_ref())
            }
            _ => false,
        };

        if remote_is_plan_b {
            for incoming in unhandled_tracks {
                match self
                    .add_transceiver_from_kind(
                        incoming.kind,
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Sendrecv,
                        }),
                    )
                    .await
                {
                    Ok(t) => self.spawn_receiver(incoming, t),
                    Err(err) => {
                        warn!("could not add transceiver for remote SSRC {:?}: {err}", incoming.ssrcs)
                    }
                }
            }
        } else if !unhandled_tracks.is_empty() {
            debug!("{} remote tracks left without receiver", unhandled_tracks.len());
        }
    }

    /// Receiving waits for SRTP, which only exists once DTLS connected, so
    /// every receiver starts on its own task.
    fn spawn_receiver(&self, incoming: TrackDetails, transceiver: Arc<RTCRtpTransceiver>) {
        let Some(pc) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            pc.start_receiver(incoming, transceiver).await;
        });
    }

    async fn start_receiver(&self, incoming: TrackDetails, transceiver: Arc<RTCRtpTransceiver>) {
        let Some(receiver) = transceiver.receiver() else {
            return;
        };

        let mut encodings = vec![];
        if let Some(&ssrc) = incoming.ssrcs.first() {
            encodings.push(RTCRtpDecodingParameters {
                ssrc,
                rtx_ssrc: incoming.repair_ssrc,
                ..Default::default()
            });
        }
        for rid in &incoming.rids {
            encodings.push(RTCRtpDecodingParameters {
                rid: rid.clone(),
                ..Default::default()
            });
        }

        if let Err(err) = receiver.receive(&RTCRtpReceiveParameters { encodings }).await {
            warn!("RTPReceiver Receive failed: {err}");
            return;
        }

        let params = self
            .media_engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_rtp_parameters_by_kind(receiver.kind(), RTCRtpTransceiverDirection::Recvonly);
        receiver.set_rtp_parameters(params);

        // set track id and label early so they can be set as new track information
        // is received from the SDP.
        for track in receiver.tracks() {
            track.set_id(incoming.id.clone());
            track.set_stream_id(incoming.stream_id.clone());
        }

        for track in receiver.tracks() {
            if track.ssrc() == 0 || !track.rid().is_empty() {
                continue;
            }

            let Some(pc) = self.weak_self.upgrade() else {
                return;
            };
            let receiver = Arc::clone(&receiver);
            let transceiver = Arc::clone(&transceiver);
            tokio::spawn(async move {
                let mut b = vec![0u8; pc.setting_engine.get_receive_mtu()];
                if let Err(err) = track.peek(&mut b).await {
                    warn!("could not determine PayloadType for SSRC {}: {err}", track.ssrc());
                    return;
                }

                pc.events.post(RTCPeerConnectionEvent::Track(RTCTrackEvent {
                    track,
                    receiver,
                    transceiver,
                }));
            });
        }
    }

    /// start_rtp_senders starts every negotiated sender that has a track. A
    /// sender whose section the remote rejected, or whose codec it lacks,
    /// stays idle; the description itself has already been applied.
    pub(super) async fn start_rtp_senders(&self, current_transceivers: &[Arc<RTCRtpTransceiver>]) {
        for transceiver in current_transceivers {
            let Some(sender) = transceiver.sender() else {
                continue;
            };
            if !sender.is_negotiated() || sender.has_sent() || sender.track().is_none() {
                continue;
            }
            if let Err(err) = sender.send(&sender.get_parameters()).await {
                warn!(
                    "skipping RTP sender of transceiver {:?}: {err}",
                    transceiver.mid()
                );
            }
        }
    }

    /// undeclared_media_processor accepts the RTP streams the remote never
    /// announced by SSRC and tries to bind each to a receiver.
    async fn undeclared_media_processor(self: Arc<Self>) {
        let Some(srtp_session) = self.dtls_transport.srtp_ready().await else {
            return;
        };

        loop {
            let stream = match srtp_session.accept().await {
                Ok(stream) => stream,
                Err(err) => {
                    debug!("undeclared media processor exits: {err}");
                    return;
                }
            };

            if self.is_closed() {
                if let Err(err) = stream.close().await {
                    warn!("failed to close RTP stream: {err}");
                }
                continue;
            }

            self.dtls_transport.store_simulcast_stream(Arc::clone(&stream));

            let routines = Arc::clone(&self.simulcast_probe_routines);
            if routines.fetch_add(1, Ordering::SeqCst)
                >= self.setting_engine.simulcast_max_probe_routines
            {
                routines.fetch_sub(1, Ordering::SeqCst);
                warn!("{}", Error::ErrSimulcastProbeOverflow);
                continue;
            }

            let pc = Arc::clone(&self);
            tokio::spawn(async move {
                let ssrc = stream.ssrc();
                if let Err(err) = pc.handle_undeclared_ssrc(stream).await {
                    error!("incoming unhandled RTP ssrc({ssrc}), on_track will not be fired. {err}");
                }
                routines.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }

    /// handle_undeclared_ssrc binds a stream whose SSRC the remote
    /// description does not announce. A single media section owns every
    /// stream; otherwise the mid and rid header extensions of the first
    /// packets name the receiver.
    async fn handle_undeclared_ssrc(&self, stream: Arc<dyn RtpReadStream>) -> Result<()> {
        let ssrc = stream.ssrc();
        let Some(remote_description) = self.remote_description() else {
            return Err(Error::ErrPeerConnRemoteDescriptionNil);
        };
        let Some(parsed) = remote_description.parsed.as_ref() else {
            return Err(Error::ErrPeerConnRemoteDescriptionNil);
        };

        // If the SSRC exists in the SDP it was handled already
        let track_details = track_details_from_sdp(parsed, false);
        if track_details_for_ssrc(&track_details, ssrc).is_some() {
            trace!("SSRC {ssrc} is declared, nothing to do");
            return Ok(());
        }

        if let Some(incoming) = single_media_section_track(parsed, ssrc)? {
            let t = self
                .add_transceiver_from_kind(
                    incoming.kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Sendrecv,
                    }),
                )
                .await
                .map_err(|err| {
                    warn!("could not add transceiver for SSRC {ssrc}: {err}");
                    Error::ErrPeerConnRemoteSSRCAddTransceiver
                })?;

            self.start_receiver(incoming, t).await;
            return Ok(());
        }

        let extension_ids = {
            let media_engine = self
                .media_engine
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            StreamExtensionIds::negotiated(&media_engine)?
        };

        let mut buf = vec![0u8; self.setting_engine.get_receive_mtu()];
        for _ in 0..self.setting_engine.simulcast_probe_count {
            let n = stream.read(&mut buf).await?;
            let mut raw = &buf[..n];
            let packet = match rtp::packet::Packet::unmarshal(&mut raw) {
                Ok(packet) => packet,
                Err(err) => {
                    trace!("drop unparsable packet on SSRC {ssrc}: {err}");
                    continue;
                }
            };

            let Some(identified) = identify_stream(&packet.header, &extension_ids) else {
                continue;
            };

            let transceiver = self.get_transceivers().into_iter().find(|t| {
                t.mid().as_deref() == Some(identified.mid()) && t.receiver().is_some()
            });
            let Some(transceiver) = transceiver else {
                continue;
            };
            let Some(receiver) = transceiver.receiver() else {
                continue;
            };

            match identified {
                IdentifiedStream::Media { mid, rid } => {
                    let params = self
                        .media_engine
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .get_rtp_parameters_by_payload_type(packet.header.payload_type)?;
                    let track = receiver.receive_for_rid(&rid, params, Arc::clone(&stream))?;
                    debug!("bound SSRC {ssrc} to mid {mid} rid {rid}");
                    self.events.post(RTCPeerConnectionEvent::Track(RTCTrackEvent {
                        track,
                        receiver,
                        transceiver,
                    }));
                }
                IdentifiedStream::Repair { mid, rid } => {
                    receiver.receive_rtx_for_rid(&rid, Arc::clone(&stream))?;
                    debug!("bound repair SSRC {ssrc} to mid {mid} rid {rid}");
                }
            }
            return Ok(());
        }

        Err(Error::ErrPeerConnSimulcastIncomingSSRCFailed)
    }
}

/// Header extension ids that name an undeclared stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StreamExtensionIds {
    mid: u8,
    rid: u8,
    repair_rid: Option<u8>,
}

impl StreamExtensionIds {
    /// negotiated reads the ids from the media engine. The mid and rid
    /// extensions are required, the repaired-rid one is optional.
    fn negotiated(media_engine: &MediaEngine) -> Result<Self> {
        let lookup = |uri: &str| {
            let (id, audio, video) =
                media_engine.get_header_extension_id(RTCRtpHeaderExtensionCapability {
                    uri: uri.to_owned(),
                });
            (audio || video).then_some(id)
        };

        let mid = lookup(SDES_MID_URI).ok_or(Error::ErrPeerConnSimulcastMidRTPExtensionRequired)?;
        let rid = lookup(SDES_RTP_STREAM_ID_URI)
            .ok_or(Error::ErrPeerConnSimulcastStreamIDRTPExtensionRequired)?;
        let repair_rid = lookup(SDES_REPAIR_RTP_STREAM_ID_URI);

        Ok(StreamExtensionIds {
            mid: header_extension_id(mid)?,
            rid: header_extension_id(rid)?,
            repair_rid: repair_rid.map(header_extension_id).transpose()?,
        })
    }
}

fn header_extension_id(id: u16) -> Result<u8> {
    u8::try_from(id).map_err(|_| Error::ErrHeaderExtensionIdOutOfRange(id))
}

/// What the header extensions of a packet say about its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
enum IdentifiedStream {
    Media { mid: String, rid: String },
    Repair { mid: String, rid: String },
}

impl IdentifiedStream {
    fn mid(&self) -> &str {
        match self {
            IdentifiedStream::Media { mid, .. } | IdentifiedStream::Repair { mid, .. } => mid,
        }
    }
}

/// identify_stream reads the mid and the rid, or the repaired rid, from a
/// packet header. A packet carrying no mid names nothing.
fn identify_stream(header: &rtp::header::Header, ids: &StreamExtensionIds) -> Option<IdentifiedStream> {
    let extension_str = |id: u8| {
        header
            .get_extension(id)
            .map(|payload| String::from_utf8_lossy(&payload).into_owned())
    };

    let mid = extension_str(ids.mid)?;
    if let Some(rid) = ids.repair_rid.and_then(extension_str) {
        return Some(IdentifiedStream::Repair { mid, rid });
    }
    extension_str(ids.rid).map(|rid| IdentifiedStream::Media { mid, rid })
}

/// With a single media section, the remote need not announce its SSRC:
/// the stream belongs to that section. Returns `None` when the
/// description has several media sections or announces rids.
fn single_media_section_track(
    parsed: &SessionDescription,
    ssrc: u32,
) -> Result<Option<TrackDetails>> {
    let mut media_sections = parsed
        .media_descriptions
        .iter()
        .filter(|m| m.media_name.media != MEDIA_SECTION_APPLICATION);
    let (Some(only_media_section), None) = (media_sections.next(), media_sections.next()) else {
        return Ok(None);
    };

    let mut stream_id = String::new();
    let mut id = String::new();
    let mut has_rid_attribute = false;
    let mut has_ssrc_attribute = false;

    for a in &only_media_section.attributes {
        match a.key.as_str() {
            ATTR_KEY_MSID => {
                if let Some((s, t)) = a.value.as_deref().and_then(|v| v.split_once(' ')) {
                    stream_id = s.to_owned();
                    id = t.to_owned();
                }
            }
            ATTR_KEY_SSRC => has_ssrc_attribute = true,
            ATTR_KEY_RID => has_rid_attribute = true,
            _ => {}
        }
    }

    if has_rid_attribute {
        return Ok(None);
    } else if has_ssrc_attribute {
        return Err(Error::ErrPeerConnSingleMediaSectionHasExplicitSSRC);
    }

    let kind = match RtpCodecKind::from(only_media_section.media_name.media.as_str()) {
        RtpCodecKind::Audio => RtpCodecKind::Audio,
        _ => RtpCodecKind::Video,
    };

    Ok(Some(TrackDetails {
        mid: get_mid_value(only_media_section)
            .unwrap_or_default()
            .to_owned(),
        kind,
        stream_id,
        id,
        ssrcs: vec![ssrc],
        ..Default::default()
    }))
}

/// Mid of a new data section. Plan-B names sections by kind, unified plan
/// uses the next number no other section took.
fn data_section_id(media_sections: &[MediaSection], is_plan_b: bool) -> String {
    if is_plan_b {
        return "data".to_owned();
    }

    let mut n = media_sections.len();
    while media_sections.iter().any(|m| m.id == n.to_string()) {
        n += 1;
    }
    n.to_string()
}

/// max_message_size reads the remote `a=max-message-size`, 0 if absent.
fn max_message_size(desc: &SessionDescription) -> u32 {
    desc.media_descriptions
        .iter()
        .filter_map(|m| attribute_value(&m.attributes, ATTR_KEY_MAX_MESSAGE_SIZE))
        .find_map(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::*;

    fn parse(sdp: &str) -> SessionDescription {
        let desc = RTCSessionDescription::offer(sdp.replace('\n', "\r\n")).unwrap();
        desc.unmarshal().unwrap()
    }

    const SINGLE_VIDEO: &str = "v=0
o=- 4596489990601351948 2 IN IP4 127.0.0.1
s=-
t=0 0
m=video 9 UDP/TLS/RTP/SAVPF 96
c=IN IP4 0.0.0.0
a=mid:0
a=msid:stream-a track-a
a=sendonly
a=rtpmap:96 VP8/90000
m=application 9 UDP/DTLS/SCTP webrtc-datachannel
c=IN IP4 0.0.0.0
a=mid:1
a=sctp-port:5000
a=max-message-size:65536
";

    const SIMULCAST_VIDEO: &str = "v=0
o=- 4596489990601351948 2 IN IP4 127.0.0.1
s=-
t=0 0
m=video 9 UDP/TLS/RTP/SAVPF 96
c=IN IP4 0.0.0.0
a=mid:0
a=extmap:4 urn:ietf:params:rtp-hdrext:sdes:mid
a=extmap:10 urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id
a=extmap:11 urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id
a=recvonly
a=rtpmap:96 VP8/90000
";

    fn negotiated_engine(remote: &str) -> Result<MediaEngine> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        media_engine.update_from_remote_description(&parse(remote))?;
        Ok(media_engine)
    }

    fn header_with(extensions: &[(u8, &str)]) -> rtp::header::Header {
        let mut header = rtp::header::Header {
            version: 2,
            payload_type: 96,
            ssrc: 4321,
            ..Default::default()
        };
        for (id, value) in extensions {
            header
                .set_extension(*id, Bytes::copy_from_slice(value.as_bytes()))
                .unwrap();
        }
        header
    }

    #[test]
    fn test_stream_extension_ids_negotiated() -> Result<()> {
        let ids = StreamExtensionIds::negotiated(&negotiated_engine(SIMULCAST_VIDEO)?)?;
        assert_eq!(
            ids,
            StreamExtensionIds {
                mid: 4,
                rid: 10,
                repair_rid: Some(11),
            }
        );

        // the repaired-rid extension is optional
        let without_repair = SIMULCAST_VIDEO.replace(
            "a=extmap:11 urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id\n",
            "",
        );
        let ids = StreamExtensionIds::negotiated(&negotiated_engine(&without_repair)?)?;
        assert_eq!(ids.repair_rid, None);

        let without_mid =
            SIMULCAST_VIDEO.replace("a=extmap:4 urn:ietf:params:rtp-hdrext:sdes:mid\n", "");
        assert_eq!(
            StreamExtensionIds::negotiated(&negotiated_engine(&without_mid)?),
            Err(Error::ErrPeerConnSimulcastMidRTPExtensionRequired)
        );

        Ok(())
    }

    #[test]
    fn test_header_extension_id_out_of_range() {
        assert_eq!(header_extension_id(14), Ok(14));
        assert_eq!(header_extension_id(255), Ok(255));
        assert_eq!(
            header_extension_id(256),
            Err(Error::ErrHeaderExtensionIdOutOfRange(256))
        );
    }

    #[test]
    fn test_identify_stream() {
        let ids = StreamExtensionIds {
            mid: 4,
            rid: 10,
            repair_rid: Some(11),
        };

        assert_eq!(
            identify_stream(&header_with(&[(4, "0"), (10, "hi")]), &ids),
            Some(IdentifiedStream::Media {
                mid: "0".to_owned(),
                rid: "hi".to_owned(),
            })
        );
        assert_eq!(
            identify_stream(&header_with(&[(4, "0"), (11, "lo")]), &ids),
            Some(IdentifiedStream::Repair {
                mid: "0".to_owned(),
                rid: "lo".to_owned(),
            })
        );

        // a rid without a mid cannot be placed
        assert_eq!(identify_stream(&header_with(&[(10, "hi")]), &ids), None);
        assert_eq!(identify_stream(&header_with(&[(4, "0")]), &ids), None);

        // without a negotiated repaired-rid id the extension is not read
        let ids = StreamExtensionIds {
            repair_rid: None,
            ..ids
        };
        assert_eq!(identify_stream(&header_with(&[(4, "0"), (11, "lo")]), &ids), None);
    }

    #[test]
    fn test_single_media_section_track() -> Result<()> {
        let parsed = parse(SINGLE_VIDEO);
        let details = single_media_section_track(&parsed, 1234)?;
        assert_eq!(
            details,
            Some(TrackDetails {
                mid: "0".to_owned(),
                kind: RtpCodecKind::Video,
                stream_id: "stream-a".to_owned(),
                id: "track-a".to_owned(),
                ssrcs: vec![1234],
                ..Default::default()
            })
        );

        let with_ssrc = parse(&SINGLE_VIDEO.replace(
            "a=sendonly\n",
            "a=sendonly\na=ssrc:5000 cname:foo\n",
        ));
        assert_eq!(
            single_media_section_track(&with_ssrc, 1234),
            Err(Error::ErrPeerConnSingleMediaSectionHasExplicitSSRC)
        );

        let with_rid = parse(&SINGLE_VIDEO.replace("a=sendonly\n", "a=sendonly\na=rid:f recv\n"));
        assert_eq!(single_media_section_track(&with_rid, 1234)?, None);

        Ok(())
    }

    #[test]
    fn test_max_message_size() {
        assert_eq!(max_message_size(&parse(SINGLE_VIDEO)), 65536);
        assert_eq!(
            max_message_size(&parse(
                &SINGLE_VIDEO.replace("a=max-message-size:65536\n", "")
            )),
            0
        );
    }

    #[test]
    fn test_data_section_id() {
        let section = |id: &str| MediaSection {
            id: id.to_owned(),
            ..Default::default()
        };

        assert_eq!(data_section_id(&[], false), "0");
        assert_eq!(data_section_id(&[section("0"), section("1")], false), "2");
        // a stopped transceiver left a gap in the numbering
        assert_eq!(data_section_id(&[section("0"), section("2")], false), "3");
        assert_eq!(data_section_id(&[section("audio")], true), "data");
    }
}
