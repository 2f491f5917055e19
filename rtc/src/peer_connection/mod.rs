pub mod certificate;
pub mod configuration;
pub mod event;
mod internal;
pub(crate) mod operation;
pub mod sdp;
pub mod state;
pub mod transport;

use std::future::Future;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::SystemTime;

use ::sdp::description::session::Origin;
use ::sdp::util::ConnectionRole;
use log::{info, trace, warn};
use shared::error::{Error, Result, flatten_errs};
use shared::util::math_rand_alpha;
use tokio::sync::watch;

use crate::api::API;
use crate::data_channel::RTCDataChannel;
use crate::data_channel::init::RTCDataChannelInit;
use crate::data_channel::parameters::DataChannelParameters;
use crate::media_stream::track_local::TrackLocal;
use crate::media_stream::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use crate::rtp_transceiver::direction::RTCRtpTransceiverDirection;
use crate::rtp_transceiver::rtp_codec::RtpCodecKind;
use crate::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use crate::rtp_transceiver::rtp_sender::RTCRtpSender;
use crate::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use certificate::RTCCertificate;
use configuration::RTCConfiguration;
use configuration::bundle_policy::RTCBundlePolicy;
use configuration::ice_transport_policy::RTCIceTransportPolicy;
use configuration::media_engine::MediaEngine;
use configuration::offer_answer_options::{RTCAnswerOptions, RTCOfferOptions};
use configuration::rtcp_mux_policy::RTCRtcpMuxPolicy;
use configuration::sdp_semantics::RTCSdpSemantics;
use configuration::setting_engine::SettingEngine;
use event::*;
use operation::Operations;
use self::sdp::{RTCSdpType, RTCSessionDescription, add_candidates_to_media_descriptions, is_lite_set};
use state::peer_connection_state::NegotiationNeededState;
use state::signaling_state::{StateChangeOp, next_signaling_state};
use state::{
    RTCIceConnectionState, RTCIceGatheringState, RTCPeerConnectionState, RTCSignalingState,
};
use transport::dtls::RTCDtlsTransport;
use transport::dtls::role::DEFAULT_DTLS_ROLE_ANSWER;
use transport::ice::RTCIceTransport;
use transport::ice::gatherer::RTCIceGatherer;
use transport::sctp::RTCSctpTransport;
use transport::{RTCDtlsRole, RTCIceCandidate, RTCIceCandidateInit, RTCIceTransportState};

/// State of a connection that is read and written under one lock. The
/// lock is never held across an `.await` nor while a handler runs.
struct PeerConnectionInternal {
    configuration: RTCConfiguration,

    current_local_description: Option<RTCSessionDescription>,
    pending_local_description: Option<RTCSessionDescription>,
    current_remote_description: Option<RTCSessionDescription>,
    pending_remote_description: Option<RTCSessionDescription>,

    signaling_state: RTCSignalingState,
    ice_connection_state: RTCIceConnectionState,
    peer_connection_state: RTCPeerConnectionState,

    rtp_transceivers: Vec<Arc<RTCRtpTransceiver>>,
    greater_mid: isize,
    sdp_origin: Origin,
    last_offer: String,
    last_answer: String,

    negotiation_needed_state: NegotiationNeededState,
    is_negotiation_needed: bool,
}

impl PeerConnectionInternal {
    fn local_description(&self) -> Option<&RTCSessionDescription> {
        self.pending_local_description
            .as_ref()
            .or(self.current_local_description.as_ref())
    }

    fn remote_description(&self) -> Option<&RTCSessionDescription> {
        self.pending_remote_description
            .as_ref()
            .or(self.current_remote_description.as_ref())
    }
}

/// PeerConnection represents a WebRTC connection that establishes a
/// peer-to-peer communications with another PeerConnection instance in a
/// browser, or to another endpoint implementing the required protocols.
///
/// Public methods may be called from any task. Work that waits on the
/// network is deferred onto the connection's operation queue, so the
/// description setters return as soon as the new state is applied.
pub struct RTCPeerConnection {
    weak_self: Weak<RTCPeerConnection>,

    setting_engine: Arc<SettingEngine>,
    media_engine: Arc<Mutex<MediaEngine>>,

    ops: Operations,
    events: EventDispatcher,

    ice_gatherer: Arc<RTCIceGatherer>,
    ice_transport: Arc<RTCIceTransport>,
    dtls_transport: Arc<RTCDtlsTransport>,
    sctp_transport: Arc<RTCSctpTransport>,

    is_closed: watch::Sender<bool>,
    gathering_complete_tx: watch::Sender<bool>,
    simulcast_probe_routines: Arc<AtomicUsize>,

    internal: Mutex<PeerConnectionInternal>,
}

impl RTCPeerConnection {
    /// creates a PeerConnection with RTCConfiguration
    pub(crate) fn new(api: &API, mut configuration: RTCConfiguration) -> Result<Arc<Self>> {
        RTCPeerConnection::init_configuration(&mut configuration)?;
        api.setting_engine.validate_engines()?;

        let events = EventDispatcher::new()?;
        let setting_engine = Arc::clone(&api.setting_engine);
        let media_engine = api.media_engine_for_connection();

        let ice_gatherer = Arc::new(RTCIceGatherer::new(
            configuration.get_ice_servers(),
            configuration.ice_transport_policy,
            Arc::clone(&setting_engine),
        ));
        let ice_transport = Arc::new(RTCIceTransport::new(Arc::clone(&ice_gatherer)));
        let dtls_transport = Arc::new(RTCDtlsTransport::new(
            Arc::clone(&ice_transport),
            configuration.certificates.clone(),
            Arc::clone(&setting_engine),
        ));
        let sctp_transport = Arc::new(RTCSctpTransport::new(
            Arc::clone(&dtls_transport),
            Arc::clone(&setting_engine),
        ));

        let pc = Arc::new_cyclic(|weak_self| RTCPeerConnection {
            weak_self: weak_self.clone(),
            setting_engine,
            media_engine,
            ops: Operations::new(),
            events,
            ice_gatherer,
            ice_transport,
            dtls_transport,
            sctp_transport,
            is_closed: watch::Sender::new(false),
            gathering_complete_tx: watch::Sender::new(false),
            simulcast_probe_routines: Arc::new(AtomicUsize::new(0)),
            internal: Mutex::new(PeerConnectionInternal {
                configuration,
                current_local_description: None,
                pending_local_description: None,
                current_remote_description: None,
                pending_remote_description: None,
                signaling_state: RTCSignalingState::Stable,
                ice_connection_state: RTCIceConnectionState::New,
                peer_connection_state: RTCPeerConnectionState::New,
                rtp_transceivers: vec![],
                greater_mid: -1,
                sdp_origin: Origin::default(),
                last_offer: String::new(),
                last_answer: String::new(),
                negotiation_needed_state: NegotiationNeededState::Empty,
                is_negotiation_needed: false,
            }),
        });
        pc.register_transport_handlers();

        Ok(pc)
    }

    /// init_configuration fills in the defaults of the fields left
    /// unspecified and checks the ones that were given.
    /// <https://www.w3.org/TR/webrtc/#constructor> (Step #2..#4)
    fn init_configuration(configuration: &mut RTCConfiguration) -> Result<()> {
        if configuration.certificates.is_empty() {
            configuration.certificates = vec![RTCCertificate::generate()?];
        } else {
            let now = SystemTime::now();
            for cert in &configuration.certificates {
                if cert.expires() < now {
                    return Err(Error::ErrCertificateExpired);
                }
            }
        }

        if configuration.bundle_policy == RTCBundlePolicy::Unspecified {
            configuration.bundle_policy = RTCBundlePolicy::Balanced;
        }
        if configuration.rtcp_mux_policy == RTCRtcpMuxPolicy::Unspecified {
            configuration.rtcp_mux_policy = RTCRtcpMuxPolicy::Require;
        }
        if configuration.ice_transport_policy == RTCIceTransportPolicy::Unspecified {
            configuration.ice_transport_policy = RTCIceTransportPolicy::All;
        }
        if configuration.sdp_semantics == RTCSdpSemantics::Unspecified {
            configuration.sdp_semantics = RTCSdpSemantics::UnifiedPlan;
        }

        for server in &configuration.ice_servers {
            server.validate()?;
        }

        Ok(())
    }

    /// Transport handlers hold a weak reference so that the transports
    /// never keep their connection alive.
    fn register_transport_handlers(&self) {
        let weak = self.weak_self.clone();
        self.ice_gatherer
            .on_local_candidate(Arc::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(pc) = weak.upgrade() {
                    pc.events.post(RTCPeerConnectionEvent::IceCandidate(candidate));
                }
            }));

        let weak = self.weak_self.clone();
        self.ice_gatherer
            .on_state_change(Arc::new(move |state: RTCIceGatheringState| {
                if let Some(pc) = weak.upgrade() {
                    pc.gathering_complete_tx
                        .send_replace(state == RTCIceGatheringState::Complete);
                    pc.events
                        .post(RTCPeerConnectionEvent::IceGatheringStateChange(state));
                }
            }));

        let weak = self.weak_self.clone();
        self.ice_transport
            .on_connection_state_change(Arc::new(move |state: RTCIceTransportState| {
                if let Some(pc) = weak.upgrade() {
                    pc.do_ice_connection_state_change(RTCIceConnectionState::from(state));
                }
            }));

        let weak = self.weak_self.clone();
        self.dtls_transport.on_state_change(Arc::new(move |_| {
            if let Some(pc) = weak.upgrade() {
                pc.update_connection_state();
            }
        }));

        let weak = self.weak_self.clone();
        self.sctp_transport
            .on_data_channel(Arc::new(move |dc: Arc<RTCDataChannel>| {
                if let Some(pc) = weak.upgrade() {
                    pc.events.post(RTCPeerConnectionEvent::DataChannel(dc));
                }
            }));
    }

    fn lock(&self) -> MutexGuard<'_, PeerConnectionInternal> {
        self.internal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.is_closed.borrow()
    }

    /// on_signaling_state_change sets an event handler which is invoked when the
    /// peer connection's signaling state changes
    pub fn on_signaling_state_change(&self, f: OnSignalingStateChangeHdlrFn) {
        self.events.on_signaling_state_change(f);
    }

    /// on_data_channel sets an event handler which is invoked when a data
    /// channel message arrives from a remote peer.
    pub fn on_data_channel(&self, f: OnDataChannelHdlrFn) {
        self.events.on_data_channel(f);
    }

    /// on_negotiation_needed sets an event handler which is invoked when
    /// a change has occurred which requires session negotiation
    pub fn on_negotiation_needed(&self, f: OnNegotiationNeededHdlrFn) {
        self.events.on_negotiation_needed(f);
    }

    /// on_ice_candidate sets an event handler which is invoked when a new ICE
    /// candidate is found. `None` signals the end of gathering.
    pub fn on_ice_candidate(&self, f: OnLocalCandidateHdlrFn) {
        self.events.on_ice_candidate(f);
    }

    /// on_ice_gathering_state_change sets an event handler which is invoked when the
    /// ICE candidate gathering state has changed.
    pub fn on_ice_gathering_state_change(&self, f: OnICEGatheringStateChangeHdlrFn) {
        self.events.on_ice_gathering_state_change(f);
    }

    /// on_track sets an event handler which is called when remote track
    /// arrives from a remote peer.
    pub fn on_track(&self, f: OnTrackHdlrFn) {
        self.events.on_track(f);
    }

    /// on_ice_connection_state_change sets an event handler which is called
    /// when an ICE connection state is changed.
    pub fn on_ice_connection_state_change(&self, f: OnICEConnectionStateChangeHdlrFn) {
        self.events.on_ice_connection_state_change(f);
    }

    /// on_peer_connection_state_change sets an event handler which is called
    /// when the PeerConnectionState has changed
    pub fn on_peer_connection_state_change(&self, f: OnPeerConnectionStateChangeHdlrFn) {
        self.events.on_peer_connection_state_change(f);
    }

    /// create_offer starts the PeerConnection and generates the localDescription
    /// <https://w3c.github.io/webrtc-pc/#dom-rtcpeerconnection-createoffer>
    pub async fn create_offer(
        &self,
        options: Option<RTCOfferOptions>,
    ) -> Result<RTCSessionDescription> {
        if self.is_closed() {
            return Err(Error::ErrConnectionClosed);
        }

        if options.is_some_and(|o| o.ice_restart) {
            self.ice_transport.restart().await?;
        }

        let ice_params = self.ice_gatherer.get_local_parameters().await?;
        let candidates = self.ice_gatherer.get_local_candidates().await?;

        // This may be necessary to recompute if, for example, createOffer was called when only an
        // audio RTCRtpTransceiver was added to connection, but while performing the in-parallel
        // steps to create an offer, a video RTCRtpTransceiver was added, requiring additional
        // inspection of video system resources.
        let (mut d, _) = regenerate_until_current(
            self.setting_engine.offer_retry_limit,
            || {
                let (transceivers, has_remote, is_plan_b) = self.prepare_offer_transceivers();
                let d = if has_remote {
                    self.generate_matched_sdp(
                        &transceivers,
                        true, /*include_unmatched*/
                        RTCDtlsRole::Auto.to_connection_role(),
                        &ice_params,
                        &candidates,
                    )?
                } else {
                    self.generate_unmatched_sdp(&transceivers, &ice_params, &candidates)?
                };
                Ok((d, is_plan_b))
            },
            // Verify local media hasn't changed during offer
            // generation. Recompute if necessary
            |(d, is_plan_b)| !is_plan_b && self.has_local_description_changed(d),
        )?;

        let offer = {
            let mut internal = self.lock();
            update_sdp_origin_locked(&mut internal, &mut d);
            let offer = RTCSessionDescription::from_parsed(RTCSdpType::Offer, d);
            internal.last_offer.clone_from(&offer.sdp);
            offer
        };

        Ok(offer)
    }

    /// create_answer starts the PeerConnection and generates the localDescription
    pub async fn create_answer(
        &self,
        _options: Option<RTCAnswerOptions>,
    ) -> Result<RTCSessionDescription> {
        let remote_is_lite = {
            let internal = self.lock();
            let Some(remote_description) = internal.remote_description() else {
                return Err(Error::ErrNoRemoteDescription);
            };
            if self.is_closed() {
                return Err(Error::ErrConnectionClosed);
            }
            if internal.signaling_state != RTCSignalingState::HaveRemoteOffer
                && internal.signaling_state != RTCSignalingState::HaveLocalPranswer
            {
                return Err(Error::ErrIncorrectSignalingState);
            }
            remote_description.parsed.as_ref().is_some_and(is_lite_set)
        };

        let mut connection_role = self.setting_engine.answering_dtls_role.to_connection_role();
        if connection_role == ConnectionRole::Unspecified {
            connection_role = DEFAULT_DTLS_ROLE_ANSWER.to_connection_role();

            // If one of the agents is lite and the other one is not, the lite agent must be the controlling agent.
            // If both or neither agents are lite the offering agent is controlling.
            // RFC 8445 S6.1.1
            if remote_is_lite && !self.setting_engine.candidates.ice_lite {
                connection_role = RTCDtlsRole::Server.to_connection_role();
            }
        }

        let ice_params = self.ice_gatherer.get_local_parameters().await?;
        let candidates = self.ice_gatherer.get_local_candidates().await?;

        let transceivers = self.get_transceivers();
        let mut d = self.generate_matched_sdp(
            &transceivers,
            false, /*include_unmatched*/
            connection_role,
            &ice_params,
            &candidates,
        )?;

        let answer = {
            let mut internal = self.lock();
            update_sdp_origin_locked(&mut internal, &mut d);
            let answer = RTCSessionDescription::from_parsed(RTCSdpType::Answer, d);
            internal.last_answer.clone_from(&answer.sdp);
            answer
        };

        Ok(answer)
    }

    /// set_description applies the signaling transition of `sd`. The next
    /// state is decided before any description slot changes, so a rejected
    /// description leaves the connection as it was.
    fn set_description(&self, sd: &RTCSessionDescription, op: StateChangeOp) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ErrConnectionClosed);
        }
        if sd.sdp_type == RTCSdpType::Unspecified {
            return Err(Error::ErrPeerConnSDPTypeInvalidValue);
        }

        let next_state = {
            let mut internal = self.lock();

            if op == StateChangeOp::SetLocal {
                match sd.sdp_type {
                    // stable->SetLocal(offer)->have-local-offer
                    RTCSdpType::Offer if sd.sdp != internal.last_offer => {
                        return Err(Error::ErrSDPDoesNotMatchOffer);
                    }
                    // have-remote-offer->SetLocal(answer)->stable
                    // have-remote-offer->SetLocal(pranswer)->have-local-pranswer
                    RTCSdpType::Answer | RTCSdpType::Pranswer if sd.sdp != internal.last_answer => {
                        return Err(Error::ErrSDPDoesNotMatchAnswer);
                    }
                    _ => {}
                }
            }

            let next_state = next_signaling_state(internal.signaling_state, op, sd.sdp_type)?;

            match (op, sd.sdp_type) {
                (_, RTCSdpType::Rollback) => {
                    internal.pending_local_description = None;
                    internal.pending_remote_description = None;
                }
                (StateChangeOp::SetLocal, RTCSdpType::Answer) => {
                    internal.current_local_description = Some(sd.clone());
                    internal.current_remote_description =
                        internal.pending_remote_description.take();
                    internal.pending_local_description = None;
                }
                (StateChangeOp::SetLocal, _) => {
                    internal.pending_local_description = Some(sd.clone());
                }
                (StateChangeOp::SetRemote, RTCSdpType::Answer) => {
                    internal.current_remote_description = Some(sd.clone());
                    internal.current_local_description =
                        internal.pending_local_description.take();
                    internal.pending_remote_description = None;
                }
                (StateChangeOp::SetRemote, _) => {
                    internal.pending_remote_description = Some(sd.clone());
                }
            }

            internal.signaling_state = next_state;
            if next_state == RTCSignalingState::Stable {
                internal.is_negotiation_needed = false;
            }
            next_state
        };

        info!("signaling state changed to {next_state}");
        self.events
            .post(RTCPeerConnectionEvent::SignalingStateChange(next_state));

        if next_state == RTCSignalingState::Stable {
            self.trigger_negotiation_needed();
        }

        Ok(())
    }

    /// set_local_description sets the SessionDescription of the local peer
    pub async fn set_local_description(&self, mut desc: RTCSessionDescription) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ErrConnectionClosed);
        }

        if desc.sdp_type == RTCSdpType::Rollback {
            return self.set_description(&desc, StateChangeOp::SetLocal);
        }

        let have_local_description = self.lock().current_local_description.is_some();

        // JSEP 5.4
        if desc.sdp.is_empty() {
            let internal = self.lock();
            match desc.sdp_type {
                RTCSdpType::Answer | RTCSdpType::Pranswer => {
                    desc.sdp.clone_from(&internal.last_answer)
                }
                RTCSdpType::Offer => desc.sdp.clone_from(&internal.last_offer),
                _ => return Err(Error::ErrPeerConnSDPTypeInvalidValueSetLocalDescription),
            }
        }

        desc.parsed = Some(desc.unmarshal()?);
        self.set_description(&desc, StateChangeOp::SetLocal)?;

        let current_transceivers = self.get_transceivers();
        let remote_description = self.remote_description();
        if desc.sdp_type == RTCSdpType::Answer {
            if let Some(remote_description) = remote_description {
                set_rtp_transceiver_current_direction(&desc, &current_transceivers, false);
                self.start_rtp_senders(&current_transceivers).await;

                if let Some(pc) = self.weak_self.upgrade() {
                    self.ops.enqueue(async move {
                        pc.start_rtp(
                            have_local_description,
                            remote_description,
                            current_transceivers,
                        )
                        .await;
                    });
                }
            }
        }

        if self.ice_gatherer.state() == RTCIceGatheringState::New {
            self.ice_gatherer.gather().await?;
        }

        Ok(())
    }

    /// local_description returns PendingLocalDescription if it is not null and
    /// otherwise it returns CurrentLocalDescription. This property is used to
    /// determine if set_local_description has already been called.
    /// <https://www.w3.org/TR/webrtc/#dom-rtcpeerconnection-localdescription>
    pub async fn local_description(&self) -> Option<RTCSessionDescription> {
        let desc = self.lock().local_description().cloned();
        self.populate_local_candidates(desc).await
    }

    /// current_local_description represents the local description that was
    /// successfully negotiated the last time the PeerConnection transitioned
    /// into the stable state plus any local candidates that have been generated
    /// since the offer or answer was created.
    pub async fn current_local_description(&self) -> Option<RTCSessionDescription> {
        let desc = self.lock().current_local_description.clone();
        self.populate_local_candidates(desc).await
    }

    /// pending_local_description represents a local description that is in the
    /// process of being negotiated plus any local candidates that have been
    /// generated since the offer or answer was created. If the PeerConnection
    /// is in the stable state, the value is None.
    pub async fn pending_local_description(&self) -> Option<RTCSessionDescription> {
        let desc = self.lock().pending_local_description.clone();
        self.populate_local_candidates(desc).await
    }

    /// Local descriptions are reported with the candidates gathered so far,
    /// and end-of-candidates once gathering completed.
    async fn populate_local_candidates(
        &self,
        desc: Option<RTCSessionDescription>,
    ) -> Option<RTCSessionDescription> {
        let desc = desc?;
        let Some(mut parsed) = desc.parsed.clone() else {
            return Some(desc);
        };

        let candidates = match self.ice_gatherer.get_local_candidates().await {
            Ok(candidates) => candidates,
            Err(_) => return Some(desc),
        };
        let gathering_state = self.ice_gathering_state();

        parsed.media_descriptions = parsed
            .media_descriptions
            .into_iter()
            .map(|m| add_candidates_to_media_descriptions(&candidates, m, gathering_state))
            .collect();

        Some(RTCSessionDescription::from_parsed(desc.sdp_type, parsed))
    }

    /// set_remote_description sets the SessionDescription of the remote peer
    pub async fn set_remote_description(&self, mut desc: RTCSessionDescription) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ErrConnectionClosed);
        }

        if desc.sdp_type == RTCSdpType::Rollback {
            return self.set_description(&desc, StateChangeOp::SetRemote);
        }

        let is_renegotiation = self.lock().current_remote_description.is_some();

        desc.parsed = Some(desc.unmarshal()?);
        self.set_description(&desc, StateChangeOp::SetRemote)?;

        self.apply_remote_description(desc, is_renegotiation).await
    }

    /// remote_description returns pending_remote_description if it is not null and
    /// otherwise it returns current_remote_description. This property is used to
    /// determine if setRemoteDescription has already been called.
    /// <https://www.w3.org/TR/webrtc/#dom-rtcpeerconnection-remotedescription>
    pub fn remote_description(&self) -> Option<RTCSessionDescription> {
        self.lock().remote_description().cloned()
    }

    /// current_remote_description represents the last remote description that was
    /// successfully negotiated the last time the PeerConnection transitioned
    /// into the stable state plus any remote candidates that have been supplied
    /// via add_ice_candidate() since the offer or answer was created.
    pub fn current_remote_description(&self) -> Option<RTCSessionDescription> {
        self.lock().current_remote_description.clone()
    }

    /// pending_remote_description represents a remote description that is in the
    /// process of being negotiated, complete with any remote candidates that
    /// have been supplied via add_ice_candidate() since the offer or answer was
    /// created. If the PeerConnection is in the stable state, the value is
    /// None.
    pub fn pending_remote_description(&self) -> Option<RTCSessionDescription> {
        self.lock().pending_remote_description.clone()
    }

    /// add_ice_candidate accepts an ICE candidate string and adds it
    /// to the existing set of candidates. An empty candidate signals the
    /// end of the remote candidates.
    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        if self.lock().remote_description().is_none() {
            return Err(Error::ErrNoRemoteDescription);
        }

        let candidate_value = candidate
            .candidate
            .strip_prefix("candidate:")
            .unwrap_or(candidate.candidate.as_str());

        let ice_candidate = if candidate_value.is_empty() {
            None
        } else {
            Some(RTCIceCandidate::unmarshal(candidate_value)?)
        };

        self.ice_transport.add_remote_candidate(ice_candidate).await
    }

    /// ice_connection_state returns the ICE connection state of the
    /// PeerConnection instance.
    pub fn ice_connection_state(&self) -> RTCIceConnectionState {
        self.lock().ice_connection_state
    }

    /// get_senders returns the RTPSender that are currently attached to this PeerConnection
    pub fn get_senders(&self) -> Vec<Arc<RTCRtpSender>> {
        self.get_transceivers()
            .iter()
            .filter_map(|t| t.sender())
            .collect()
    }

    /// get_receivers returns the RTPReceivers that are currently attached to this PeerConnection
    pub fn get_receivers(&self) -> Vec<Arc<RTCRtpReceiver>> {
        self.get_transceivers()
            .iter()
            .filter_map(|t| t.receiver())
            .collect()
    }

    /// get_transceivers returns the RtpTransceiver that are currently attached to this PeerConnection
    pub fn get_transceivers(&self) -> Vec<Arc<RTCRtpTransceiver>> {
        self.lock().rtp_transceivers.clone()
    }

    /// add_track adds a Track to the PeerConnection
    pub async fn add_track(&self, track: Arc<dyn TrackLocal>) -> Result<Arc<RTCRtpSender>> {
        if self.is_closed() {
            return Err(Error::ErrConnectionClosed);
        }

        // A transceiver that never sent, or stopped sending, takes the track
        // instead of a new m-line.
        let reusable = self.get_transceivers().into_iter().find(|t| {
            !t.stopped()
                && t.kind() == track.kind()
                && t.sender().is_none()
                && matches!(
                    t.current_direction(),
                    RTCRtpTransceiverDirection::Unspecified
                        | RTCRtpTransceiverDirection::Inactive
                        | RTCRtpTransceiverDirection::Recvonly
                )
        });

        if let Some(t) = reusable {
            let sender = Arc::new(RTCRtpSender::new(
                Some(Arc::clone(&track)),
                track.kind(),
                Arc::clone(&self.dtls_transport),
                Arc::clone(&self.media_engine),
            ));
            t.set_sender(Some(Arc::clone(&sender)));
            if let Err(err) = t.set_sending_track(Some(track)).await {
                t.set_sender(None);
                return Err(err);
            }
            self.trigger_negotiation_needed();
            return Ok(sender);
        }

        let transceiver = self
            .add_transceiver_from_track(
                track,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendrecv,
                }),
            )
            .await?;

        transceiver.sender().ok_or(Error::ErrRTPSenderNotExisted)
    }

    /// remove_track removes a Track from the PeerConnection
    pub async fn remove_track(&self, sender: &Arc<RTCRtpSender>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ErrConnectionClosed);
        }

        let transceiver = self
            .get_transceivers()
            .into_iter()
            .find(|t| t.sender().is_some_and(|s| Arc::ptr_eq(&s, sender)))
            .ok_or(Error::ErrSenderNotCreatedByConnection)?;

        sender.stop().await?;
        transceiver.set_sending_track(None).await?;
        self.trigger_negotiation_needed();

        Ok(())
    }

    /// add_transceiver_from_kind Create a new RtpTransceiver and adds it to the set of transceivers.
    pub async fn add_transceiver_from_kind(
        &self,
        kind: RtpCodecKind,
        init: Option<RTCRtpTransceiverInit>,
    ) -> Result<Arc<RTCRtpTransceiver>> {
        if self.is_closed() {
            return Err(Error::ErrConnectionClosed);
        }

        let direction = init
            .map(|init| init.direction)
            .unwrap_or(RTCRtpTransceiverDirection::Sendrecv);

        let t = match direction {
            RTCRtpTransceiverDirection::Sendonly | RTCRtpTransceiverDirection::Sendrecv => {
                let codecs = self
                    .media_engine
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get_codecs_by_kind(kind);
                let Some(codec) = codecs.first() else {
                    return Err(Error::ErrNoCodecsAvailable);
                };

                let track: Arc<dyn TrackLocal> = Arc::new(TrackLocalStaticRTP::new(
                    codec.rtp_codec.clone(),
                    math_rand_alpha(16),
                    math_rand_alpha(16),
                ));

                return self.add_transceiver_from_track(track, init).await;
            }
            RTCRtpTransceiverDirection::Recvonly => {
                let receiver = Arc::new(RTCRtpReceiver::new(
                    self.setting_engine.get_receive_mtu(),
                    kind,
                    Arc::clone(&self.dtls_transport),
                    Arc::clone(&self.media_engine),
                ));

                RTCRtpTransceiver::new(
                    Some(receiver),
                    None,
                    RTCRtpTransceiverDirection::Recvonly,
                    kind,
                    vec![],
                    Arc::clone(&self.media_engine),
                    Some(self.negotiation_needed_trigger()),
                )
            }
            _ => return Err(Error::ErrPeerConnAddTransceiverFromKindSupport),
        };

        self.add_rtp_transceiver(Arc::clone(&t));

        Ok(t)
    }

    /// add_transceiver_from_track Create a new RtpTransceiver(SendRecv or SendOnly) and add it to the set of transceivers.
    pub async fn add_transceiver_from_track(
        &self,
        track: Arc<dyn TrackLocal>,
        init: Option<RTCRtpTransceiverInit>,
    ) -> Result<Arc<RTCRtpTransceiver>> {
        if self.is_closed() {
            return Err(Error::ErrConnectionClosed);
        }

        let direction = init
            .map(|init| init.direction)
            .unwrap_or(RTCRtpTransceiverDirection::Sendrecv);

        let kind = track.kind();
        let receiver = match direction {
            RTCRtpTransceiverDirection::Sendrecv => Some(Arc::new(RTCRtpReceiver::new(
                self.setting_engine.get_receive_mtu(),
                kind,
                Arc::clone(&self.dtls_transport),
                Arc::clone(&self.media_engine),
            ))),
            RTCRtpTransceiverDirection::Sendonly => None,
            _ => return Err(Error::ErrPeerConnAddTransceiverFromTrackSupport),
        };

        let sender = Arc::new(RTCRtpSender::new(
            Some(track),
            kind,
            Arc::clone(&self.dtls_transport),
            Arc::clone(&self.media_engine),
        ));

        let t = RTCRtpTransceiver::new(
            receiver,
            Some(sender),
            direction,
            kind,
            vec![],
            Arc::clone(&self.media_engine),
            Some(self.negotiation_needed_trigger()),
        );

        self.add_rtp_transceiver(Arc::clone(&t));

        Ok(t)
    }

    fn add_rtp_transceiver(&self, t: Arc<RTCRtpTransceiver>) {
        self.lock().rtp_transceivers.push(t);
        self.trigger_negotiation_needed();
    }

    /// create_data_channel creates a new DataChannel object with the given label
    /// and optional DataChannelInit used to configure properties of the
    /// underlying channel such as data reliability.
    pub async fn create_data_channel(
        &self,
        label: &str,
        options: Option<RTCDataChannelInit>,
    ) -> Result<Arc<RTCDataChannel>> {
        // https://w3c.github.io/webrtc-pc/#peer-to-peer-data-api (Step #2)
        if self.is_closed() {
            return Err(Error::ErrConnectionClosed);
        }

        let params = DataChannelParameters::new(label, options)?;
        let d = Arc::new(RTCDataChannel::new(params));

        self.sctp_transport.add_data_channel(Arc::clone(&d)).await?;

        self.trigger_negotiation_needed();

        Ok(d)
    }

    /// set_identity_provider is used to configure an identity provider to generate identity assertions
    pub fn set_identity_provider(&self, _provider: &str) -> Result<()> {
        Err(Error::ErrIdentityProviderNotImplemented)
    }

    /// get_configuration returns a Configuration object representing the current
    /// configuration of this PeerConnection object. The returned object is a
    /// copy and direct mutation on it will not take effect until set_configuration
    /// has been called with Configuration passed as its only argument.
    /// <https://www.w3.org/TR/webrtc/#dom-rtcpeerconnection-getconfiguration>
    pub fn get_configuration(&self) -> RTCConfiguration {
        self.lock().configuration.clone()
    }

    /// set_configuration updates the configuration of this PeerConnection object.
    /// <https://www.w3.org/TR/webrtc/#set-the-configuration>
    pub fn set_configuration(&self, configuration: RTCConfiguration) -> Result<()> {
        // https://www.w3.org/TR/webrtc/#set-the-configuration (step #2)
        if self.is_closed() {
            return Err(Error::ErrConnectionClosed);
        }

        let mut internal = self.lock();
        let has_local_description = internal.local_description().is_some();
        internal
            .configuration
            .validate_update(&configuration, has_local_description)?;
        internal.configuration.merge_update(configuration);

        Ok(())
    }

    /// signaling_state attribute returns the signaling state of the
    /// PeerConnection instance.
    pub fn signaling_state(&self) -> RTCSignalingState {
        self.lock().signaling_state
    }

    /// ice_gathering_state attribute returns the ICE gathering state of the
    /// PeerConnection instance.
    pub fn ice_gathering_state(&self) -> RTCIceGatheringState {
        self.ice_gatherer.state()
    }

    /// connection_state attribute returns the connection state of the
    /// PeerConnection instance.
    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.lock().peer_connection_state
    }

    /// gathering_complete_promise resolves once ICE gathering reached the
    /// complete state. Useful to exchange a description with every
    /// candidate instead of trickling them.
    pub fn gathering_complete_promise(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.gathering_complete_tx.subscribe();
        async move {
            let _ = rx.wait_for(|complete| *complete).await;
        }
    }

    /// close ends the PeerConnection. Calling it again is a no-op.
    pub async fn close(&self) -> Result<()> {
        // https://www.w3.org/TR/webrtc/#dom-rtcpeerconnection-close (step #1)
        // https://www.w3.org/TR/webrtc/#dom-rtcpeerconnection-close (step #2)
        if self.is_closed.send_replace(true) {
            return Ok(());
        }

        // https://www.w3.org/TR/webrtc/#dom-rtcpeerconnection-close (step #3)
        self.lock().signaling_state = RTCSignalingState::Closed;
        info!("signaling state changed to {}", RTCSignalingState::Closed);
        self.events.post(RTCPeerConnectionEvent::SignalingStateChange(
            RTCSignalingState::Closed,
        ));

        // Try closing all the things and collect the errors
        let mut close_errs = vec![];

        // https://www.w3.org/TR/webrtc/#dom-rtcpeerconnection-close (step #4)
        for t in self.get_transceivers() {
            if let Err(err) = t.stop().await {
                close_errs.push(err);
            }
        }

        // https://www.w3.org/TR/webrtc/#dom-rtcpeerconnection-close (step #5)
        for dc in self.sctp_transport.data_channels() {
            if let Err(err) = dc.close().await {
                close_errs.push(err);
            }
        }

        // https://www.w3.org/TR/webrtc/#dom-rtcpeerconnection-close (step #6)
        if let Err(err) = self.sctp_transport.stop().await {
            close_errs.push(err);
        }

        // https://www.w3.org/TR/webrtc/#dom-rtcpeerconnection-close (step #7)
        if let Err(err) = self.dtls_transport.stop().await {
            close_errs.push(err);
        }

        // https://www.w3.org/TR/webrtc/#dom-rtcpeerconnection-close (step #8, #9, #10)
        if let Err(err) = self.ice_transport.stop().await {
            close_errs.push(err);
        }

        // https://www.w3.org/TR/webrtc/#dom-rtcpeerconnection-close (step #11)
        self.update_connection_state();

        self.events.post(RTCPeerConnectionEvent::Shutdown);

        if !close_errs.is_empty() {
            warn!("errors while closing peer connection: {close_errs:?}");
        }
        flatten_errs(close_errs)
    }
}

/// regenerate_until_current calls `generate` until `is_stale` accepts its
/// result, giving up with ErrExcessiveRetries after `limit` attempts.
fn regenerate_until_current<T>(
    limit: usize,
    mut generate: impl FnMut() -> Result<T>,
    mut is_stale: impl FnMut(&T) -> bool,
) -> Result<T> {
    for attempt in 1..=limit.max(1) {
        let generated = generate()?;
        if !is_stale(&generated) {
            return Ok(generated);
        }
        trace!("generated description is stale, attempt {attempt} of {limit}");
    }
    Err(Error::ErrExcessiveRetries)
}

fn update_sdp_origin_locked(
    internal: &mut PeerConnectionInternal,
    d: &mut ::sdp::description::session::SessionDescription,
) {
    sdp::update_sdp_origin(&mut internal.sdp_origin, d);
}

/// Sets the current direction of each transceiver from an applied answer.
/// A remote answer is read from the other side, so its directions are
/// reversed.
fn set_rtp_transceiver_current_direction(
    desc: &RTCSessionDescription,
    transceivers: &[Arc<RTCRtpTransceiver>],
    we_offer: bool,
) {
    let Some(parsed) = &desc.parsed else {
        return;
    };

    for media in &parsed.media_descriptions {
        if media.media_name.media == sdp::MEDIA_SECTION_APPLICATION {
            continue;
        }
        let Some(mid) = sdp::get_mid_value(media) else {
            continue;
        };
        let Some(t) = transceivers
            .iter()
            .find(|t| t.mid().as_deref() == Some(mid))
        else {
            continue;
        };

        let mut direction = sdp::get_peer_direction(media);
        if direction == RTCRtpTransceiverDirection::Unspecified {
            continue;
        }

        if we_offer {
            direction = direction.reverse();
        }

        // A transceiver created for a remote recvonly section has no sender
        // and stays reusable by the next add_track.
        if direction == RTCRtpTransceiverDirection::Sendonly && t.sender().is_none() {
            direction = RTCRtpTransceiverDirection::Inactive;
        }

        t.set_current_direction(direction);
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;

    use super::*;
    use crate::api::APIBuilder;
    use crate::peer_connection::transport::vnet::VNet;

    async fn new_pc(vnet: &Arc<VNet>) -> Result<Arc<RTCPeerConnection>> {
        let mut s = SettingEngine::default();
        s.set_vnet(Arc::clone(vnet));

        let mut m = MediaEngine::default();
        m.register_default_codecs()?;

        let api = APIBuilder::new()
            .with_setting_engine(Arc::new(s))
            .with_media_engine(m)
            .build();
        api.new_peer_connection(RTCConfiguration::default()).await
    }

    #[tokio::test]
    async fn test_init_configuration_defaults() -> Result<()> {
        let vnet = Arc::new(VNet::new());
        let pc = new_pc(&vnet).await?;

        let configuration = pc.get_configuration();
        assert_eq!(configuration.bundle_policy, RTCBundlePolicy::Balanced);
        assert_eq!(configuration.rtcp_mux_policy, RTCRtcpMuxPolicy::Require);
        assert_eq!(configuration.ice_transport_policy, RTCIceTransportPolicy::All);
        assert_eq!(configuration.sdp_semantics, RTCSdpSemantics::UnifiedPlan);
        assert_eq!(configuration.certificates.len(), 1);

        assert_eq!(pc.signaling_state(), RTCSignalingState::Stable);
        assert_eq!(pc.connection_state(), RTCPeerConnectionState::New);
        assert_eq!(pc.ice_connection_state(), RTCIceConnectionState::New);

        pc.close().await
    }

    #[tokio::test]
    async fn test_set_local_description_must_match_offer() -> Result<()> {
        let vnet = Arc::new(VNet::new());
        let pc = new_pc(&vnet).await?;
        pc.add_transceiver_from_kind(RtpCodecKind::Audio, None).await?;

        let offer = pc.create_offer(None).await?;
        let tampered = RTCSessionDescription::offer(offer.sdp.replace("sendrecv", "recvonly"))?;
        assert_eq!(
            pc.set_local_description(tampered).await,
            Err(Error::ErrSDPDoesNotMatchOffer)
        );
        assert_eq!(pc.signaling_state(), RTCSignalingState::Stable);
        assert!(pc.pending_local_description().await.is_none());

        // an empty description takes the last offer
        let mut implicit = RTCSessionDescription::default();
        implicit.sdp_type = RTCSdpType::Offer;
        pc.set_local_description(implicit).await?;
        assert_eq!(pc.signaling_state(), RTCSignalingState::HaveLocalOffer);
        assert_eq!(
            pc.pending_local_description().await.map(|d| d.sdp_type),
            Some(RTCSdpType::Offer)
        );

        pc.close().await
    }

    #[tokio::test]
    async fn test_rollback_local_offer() -> Result<()> {
        let vnet = Arc::new(VNet::new());
        let pc = new_pc(&vnet).await?;
        pc.create_data_channel("data", None).await?;

        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer).await?;
        assert_eq!(pc.signaling_state(), RTCSignalingState::HaveLocalOffer);

        pc.set_local_description(RTCSessionDescription::rollback())
            .await?;
        assert_eq!(pc.signaling_state(), RTCSignalingState::Stable);
        assert!(pc.pending_local_description().await.is_none());
        assert!(pc.current_local_description().await.is_none());

        pc.close().await
    }

    #[tokio::test]
    async fn test_rejected_transition_keeps_descriptions() -> Result<()> {
        let vnet = Arc::new(VNet::new());
        let offerer = new_pc(&vnet).await?;
        let answerer = new_pc(&vnet).await?;
        offerer.create_data_channel("data", None).await?;

        let offer = offerer.create_offer(None).await?;

        // stable does not accept an answer
        let as_answer = RTCSessionDescription::answer(offer.sdp.clone())?;
        assert!(answerer.set_remote_description(as_answer).await.is_err());
        assert_eq!(answerer.signaling_state(), RTCSignalingState::Stable);
        assert!(answerer.remote_description().is_none());

        // nor a rollback that has nothing to roll back
        assert!(
            answerer
                .set_remote_description(RTCSessionDescription::rollback())
                .await
                .is_err()
        );

        answerer.set_remote_description(offer).await?;
        assert_eq!(answerer.signaling_state(), RTCSignalingState::HaveRemoteOffer);
        assert!(answerer.pending_remote_description().is_some());
        assert!(answerer.current_remote_description().is_none());

        offerer.close().await?;
        answerer.close().await
    }

    #[tokio::test]
    async fn test_create_answer_requires_remote_offer() -> Result<()> {
        let vnet = Arc::new(VNet::new());
        let pc = new_pc(&vnet).await?;

        assert_eq!(
            pc.create_answer(None).await,
            Err(Error::ErrNoRemoteDescription)
        );

        pc.close().await
    }

    #[tokio::test]
    async fn test_negotiation_needed_latch() -> Result<()> {
        let vnet = Arc::new(VNet::new());
        let pc = new_pc(&vnet).await?;

        pc.trigger_negotiation_needed();
        pc.trigger_negotiation_needed();
        pc.trigger_negotiation_needed();
        assert_ne!(
            pc.lock().negotiation_needed_state,
            NegotiationNeededState::Empty
        );

        pc.ops.done().await;
        assert_eq!(
            pc.lock().negotiation_needed_state,
            NegotiationNeededState::Empty
        );
        // nothing was negotiated yet
        assert!(pc.lock().is_negotiation_needed);

        pc.close().await
    }

    #[tokio::test]
    async fn test_operations_after_close() -> Result<()> {
        let vnet = Arc::new(VNet::new());
        let pc = new_pc(&vnet).await?;

        pc.close().await?;
        pc.close().await?;

        assert_eq!(pc.signaling_state(), RTCSignalingState::Closed);
        assert_eq!(pc.connection_state(), RTCPeerConnectionState::Closed);
        assert_eq!(
            pc.create_offer(None).await,
            Err(Error::ErrConnectionClosed)
        );
        assert_eq!(
            pc.create_data_channel("late", None).await.err(),
            Some(Error::ErrConnectionClosed)
        );
        assert_eq!(
            pc.set_configuration(RTCConfiguration::default()),
            Err(Error::ErrConnectionClosed)
        );

        Ok(())
    }

    #[test]
    fn test_regenerate_until_current_is_bounded() {
        let mut attempts = 0;
        let result = regenerate_until_current(
            3,
            || {
                attempts += 1;
                Ok(attempts)
            },
            |_| true,
        );
        assert_eq!(result, Err(Error::ErrExcessiveRetries));
        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_regenerate_until_current_reflects_last_change() -> Result<()> {
        // the transceiver set changes twice while descriptions are generated
        let transceivers = RefCell::new(vec!["audio"]);
        let mut pending = vec![vec!["audio", "video", "data"], vec!["audio", "video"]];

        let generated = regenerate_until_current(
            5,
            || {
                let snapshot = transceivers.borrow().join(" ");
                if let Some(next) = pending.pop() {
                    *transceivers.borrow_mut() = next;
                }
                Ok(snapshot)
            },
            |generated| *generated != transceivers.borrow().join(" "),
        )?;
        assert_eq!(generated, "audio video data");
        Ok(())
    }

    #[test]
    fn test_regenerate_until_current_propagates_errors() {
        let result: Result<()> =
            regenerate_until_current(3, || Err(Error::ErrSDPZeroTransceivers), |_| false);
        assert_eq!(result, Err(Error::ErrSDPZeroTransceivers));
    }
}
