//! Non-standard knobs of a peer connection.
//!
//! `RTCConfiguration` carries what the W3C API exposes. The `SettingEngine`
//! carries the rest: DTLS role overrides, fixed ICE credentials, simulcast
//! probing bounds, offer generation retries, and the transport engines that
//! implement ICE, DTLS, SRTP and SCTP.

use std::fmt;
use std::sync::Arc;

use shared::error::{Error, Result};

use crate::peer_connection::transport::dtls::engine::{DtlsEngine, SrtpEngine};
use crate::peer_connection::transport::dtls::role::RTCDtlsRole;
use crate::peer_connection::transport::ice::agent::IceAgentFactory;
use crate::peer_connection::transport::sctp::engine::SctpEngine;
use crate::peer_connection::transport::vnet::VNet;

pub(crate) const RECEIVE_MTU: usize = 1460;

/// Ceiling on offer regeneration when transceivers change underneath it.
pub(crate) const DEFAULT_OFFER_RETRY_LIMIT: usize = 128;

/// Number of packets read from an undeclared stream before giving up on
/// finding its mid and rid.
pub(crate) const DEFAULT_SIMULCAST_PROBE_COUNT: usize = 10;

/// Maximum number of undeclared streams probed at the same time.
pub(crate) const DEFAULT_SIMULCAST_MAX_PROBE_ROUTINES: usize = 25;

/// ICE candidate gathering configuration.
#[derive(Default, Debug, Clone)]
pub struct Candidates {
    pub ice_lite: bool,
    pub username_fragment: String,
    pub password: String,
}

/// Maximum message size for SCTP data channels.
/// <https://datatracker.ietf.org/doc/html/rfc8841#section-6.1>
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SctpMaxMessageSize {
    Bounded(u32),
    Unbounded,
}

impl SctpMaxMessageSize {
    pub const DEFAULT_MESSAGE_SIZE: u32 = 65536;
    pub const MAX_MESSAGE_SIZE: u32 = 262144;

    pub fn as_u32(&self) -> u32 {
        match self {
            Self::Bounded(result) => *result,
            Self::Unbounded => Self::MAX_MESSAGE_SIZE,
        }
    }
}

impl Default for SctpMaxMessageSize {
    fn default() -> Self {
        // > If the SDP "max-message-size" attribute is not present, the default value is 64K.
        Self::Bounded(Self::DEFAULT_MESSAGE_SIZE)
    }
}

/// Transport engines the connection drives. All four must be present before
/// the connection is created.
#[derive(Default, Clone)]
pub(crate) struct Engines {
    pub(crate) ice_agent_factory: Option<Arc<dyn IceAgentFactory>>,
    pub(crate) dtls: Option<Arc<dyn DtlsEngine>>,
    pub(crate) srtp: Option<Arc<dyn SrtpEngine>>,
    pub(crate) sctp: Option<Arc<dyn SctpEngine>>,
}

/// SettingEngine allows influencing behavior in ways that are not
/// supported by the WebRTC API. This allows us to support additional
/// use-cases without deviating from the WebRTC API elsewhere.
#[derive(Clone)]
pub struct SettingEngine {
    pub(crate) candidates: Candidates,
    pub(crate) sdp_media_level_fingerprints: bool,
    pub(crate) answering_dtls_role: RTCDtlsRole,
    pub(crate) disable_certificate_fingerprint_verification: bool,
    pub(crate) disable_media_engine_copy: bool,
    pub(crate) receive_mtu: usize,
    pub(crate) sctp_max_message_size: SctpMaxMessageSize,
    pub(crate) offer_retry_limit: usize,
    pub(crate) simulcast_probe_count: usize,
    pub(crate) simulcast_max_probe_routines: usize,
    pub(crate) engines: Engines,
}

impl Default for SettingEngine {
    fn default() -> Self {
        SettingEngine {
            candidates: Candidates::default(),
            sdp_media_level_fingerprints: false,
            answering_dtls_role: RTCDtlsRole::Unspecified,
            disable_certificate_fingerprint_verification: false,
            disable_media_engine_copy: false,
            receive_mtu: 0,
            sctp_max_message_size: SctpMaxMessageSize::default(),
            offer_retry_limit: DEFAULT_OFFER_RETRY_LIMIT,
            simulcast_probe_count: DEFAULT_SIMULCAST_PROBE_COUNT,
            simulcast_max_probe_routines: DEFAULT_SIMULCAST_MAX_PROBE_ROUTINES,
            engines: Engines::default(),
        }
    }
}

impl fmt::Debug for SettingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingEngine")
            .field("candidates", &self.candidates)
            .field("answering_dtls_role", &self.answering_dtls_role)
            .field("offer_retry_limit", &self.offer_retry_limit)
            .field("simulcast_probe_count", &self.simulcast_probe_count)
            .field("simulcast_max_probe_routines", &self.simulcast_max_probe_routines)
            .finish_non_exhaustive()
    }
}

impl SettingEngine {
    pub(crate) fn get_receive_mtu(&self) -> usize {
        if self.receive_mtu != 0 {
            self.receive_mtu
        } else {
            RECEIVE_MTU
        }
    }

    /// set_lite configures whether or not the ice agent should be a lite agent
    pub fn set_lite(&mut self, lite: bool) {
        self.candidates.ice_lite = lite;
    }

    /// set_answering_dtls_role sets the DTLS role that is selected when offering
    /// The DTLS role controls if the WebRTC Client as a client or server. This
    /// may be useful when interacting with non-compliant clients or debugging issues.
    ///
    /// DTLSRoleActive:
    ///   Act as DTLS Client, send the ClientHello and starts the handshake
    /// DTLSRolePassive:
    ///   Act as DTLS Server, wait for ClientHello
    pub fn set_answering_dtls_role(&mut self, role: RTCDtlsRole) -> Result<()> {
        if role != RTCDtlsRole::Client && role != RTCDtlsRole::Server {
            return Err(Error::ErrSettingEngineSetAnsweringDTLSRole);
        }

        self.answering_dtls_role = role;
        Ok(())
    }

    /// set_ice_credentials sets a staic uFrag/uPwd to be used by ice
    /// This is useful if you want to do signalless WebRTC session, or having a reproducible environment with static credentials
    pub fn set_ice_credentials(&mut self, username_fragment: String, password: String) {
        self.candidates.username_fragment = username_fragment;
        self.candidates.password = password;
    }

    /// disable_certificate_fingerprint_verification disables fingerprint verification after DTLS Handshake has finished
    pub fn disable_certificate_fingerprint_verification(&mut self, is_disabled: bool) {
        self.disable_certificate_fingerprint_verification = is_disabled;
    }

    /// set_sdp_media_level_fingerprints configures the logic for dtls_transport Fingerprint insertion
    /// If true, fingerprints will be inserted in the sdp at the fingerprint
    /// level, instead of the session level. This helps with compatibility with
    /// some webrtc implementations.
    pub fn set_sdp_media_level_fingerprints(&mut self, sdp_media_level_fingerprints: bool) {
        self.sdp_media_level_fingerprints = sdp_media_level_fingerprints;
    }

    /// disable_media_engine_copy stops the MediaEngine from being copied. This allows a user to modify
    /// the MediaEngine after the PeerConnection has been constructed. This is useful if you wish to
    /// modify codecs after signaling. Make sure not to share MediaEngines between PeerConnections.
    pub fn disable_media_engine_copy(&mut self, is_disabled: bool) {
        self.disable_media_engine_copy = is_disabled;
    }

    /// set_receive_mtu sets the size of read buffer that copy incoming packets. This is optional.
    /// Leave this 0 for the default receive_mtu
    pub fn set_receive_mtu(&mut self, receive_mtu: usize) {
        self.receive_mtu = receive_mtu;
    }

    pub fn set_sctp_max_message_size(&mut self, max_message_size: SctpMaxMessageSize) {
        self.sctp_max_message_size = max_message_size;
    }

    /// set_offer_retry_limit bounds how often create_offer regenerates a
    /// description whose transceivers changed while it was being built.
    pub fn set_offer_retry_limit(&mut self, limit: usize) {
        self.offer_retry_limit = limit;
    }

    /// set_simulcast_probe_count sets how many packets of an undeclared
    /// stream are inspected for mid and rid header extensions.
    pub fn set_simulcast_probe_count(&mut self, count: usize) {
        self.simulcast_probe_count = count;
    }

    /// set_simulcast_max_probe_routines bounds how many undeclared streams are
    /// probed concurrently. Streams beyond it are discarded.
    pub fn set_simulcast_max_probe_routines(&mut self, max: usize) {
        self.simulcast_max_probe_routines = max;
    }

    pub fn set_ice_agent_factory(&mut self, factory: Arc<dyn IceAgentFactory>) {
        self.engines.ice_agent_factory = Some(factory);
    }

    pub fn set_dtls_engine(&mut self, engine: Arc<dyn DtlsEngine>) {
        self.engines.dtls = Some(engine);
    }

    pub fn set_srtp_engine(&mut self, engine: Arc<dyn SrtpEngine>) {
        self.engines.srtp = Some(engine);
    }

    pub fn set_sctp_engine(&mut self, engine: Arc<dyn SctpEngine>) {
        self.engines.sctp = Some(engine);
    }

    /// set_vnet installs the in-process transport engines of `vnet` for all
    /// four layers. Connections sharing one `VNet` can reach each other.
    pub fn set_vnet(&mut self, vnet: Arc<VNet>) {
        self.engines = Engines {
            ice_agent_factory: Some(vnet.clone()),
            dtls: Some(vnet.clone()),
            srtp: Some(vnet.clone()),
            sctp: Some(vnet),
        };
    }

    /// validate_engines fails with ErrTransportEngineNotSet naming the first missing engine.
    pub(crate) fn validate_engines(&self) -> Result<()> {
        let missing = [
            ("ICE", self.engines.ice_agent_factory.is_none()),
            ("DTLS", self.engines.dtls.is_none()),
            ("SRTP", self.engines.srtp.is_none()),
            ("SCTP", self.engines.sctp.is_none()),
        ]
        .into_iter()
        .find(|(_, missing)| *missing);

        match missing {
            Some((name, _)) => Err(Error::ErrTransportEngineNotSet(name.to_owned())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_set_answering_dtls_role() -> Result<()> {
        let mut s = SettingEngine::default();
        assert_eq!(
            Err(Error::ErrSettingEngineSetAnsweringDTLSRole),
            s.set_answering_dtls_role(RTCDtlsRole::Auto)
        );
        assert_eq!(
            Err(Error::ErrSettingEngineSetAnsweringDTLSRole),
            s.set_answering_dtls_role(RTCDtlsRole::Unspecified)
        );

        s.set_answering_dtls_role(RTCDtlsRole::Server)?;
        assert_eq!(RTCDtlsRole::Server, s.answering_dtls_role);

        Ok(())
    }

    #[test]
    fn test_setting_engine_defaults() {
        let s = SettingEngine::default();
        assert_eq!(128, s.offer_retry_limit);
        assert_eq!(10, s.simulcast_probe_count);
        assert_eq!(25, s.simulcast_max_probe_routines);
        assert_eq!(RECEIVE_MTU, s.get_receive_mtu());
        assert_eq!(65536, s.sctp_max_message_size.as_u32());
    }

    #[test]
    fn test_validate_engines() {
        let mut s = SettingEngine::default();
        assert_eq!(
            Err(Error::ErrTransportEngineNotSet("ICE".to_owned())),
            s.validate_engines()
        );

        s.set_vnet(Arc::new(VNet::new()));
        assert!(s.validate_engines().is_ok());
    }
}
