pub mod bundle_policy;
pub mod ice_transport_policy;
pub mod media_engine;
pub mod offer_answer_options;
pub mod rtcp_mux_policy;
pub mod sdp_semantics;
pub mod setting_engine;

use shared::error::{Error, Result};

use crate::peer_connection::certificate::RTCCertificate;
use crate::peer_connection::transport::ice::server::RTCIceServer;
use bundle_policy::RTCBundlePolicy;
use ice_transport_policy::RTCIceTransportPolicy;
use rtcp_mux_policy::RTCRtcpMuxPolicy;
use sdp_semantics::RTCSdpSemantics;

pub(crate) const UNSPECIFIED_STR: &str = "Unspecified";

/// A Configuration defines how peer-to-peer communication via PeerConnection
/// is established or re-established.
/// Configurations may be set up once and reused across multiple connections.
/// Configurations are treated as readonly. As long as they are unmodified,
/// they are safe for concurrent use.
///
/// ## Specifications
///
/// * [W3C]
///
/// [W3C]: https://w3c.github.io/webrtc-pc/#rtcconfiguration-dictionary
#[derive(Default, Debug, Clone)]
pub struct RTCConfiguration {
    /// ice_servers defines a slice describing servers available to be used by
    /// ICE, such as STUN and TURN servers.
    pub ice_servers: Vec<RTCIceServer>,

    /// ice_transport_policy indicates which candidates the ICEAgent is allowed
    /// to use.
    pub ice_transport_policy: RTCIceTransportPolicy,

    /// bundle_policy indicates which media-bundling policy to use when gathering
    /// ICE candidates.
    pub bundle_policy: RTCBundlePolicy,

    /// rtcp_mux_policy indicates which rtcp-mux policy to use when gathering ICE
    /// candidates.
    pub rtcp_mux_policy: RTCRtcpMuxPolicy,

    /// peer_identity sets the target peer identity for the PeerConnection.
    /// The PeerConnection will not establish a connection to a remote peer
    /// unless it can be successfully authenticated with the provided name.
    pub peer_identity: String,

    /// certificates describes a set of certificates that the PeerConnection
    /// uses to authenticate. If this value is absent, then a default
    /// certificate is generated for each PeerConnection instance.
    pub certificates: Vec<RTCCertificate>,

    /// ice_candidate_pool_size describes the size of the prefetched ICE pool.
    pub ice_candidate_pool_size: u8,

    /// sdp_semantics controls the type of SDP offers accepted by and
    /// SDP answers generated by the PeerConnection.
    pub sdp_semantics: RTCSdpSemantics,
}

impl RTCConfiguration {
    /// get_ice_servers side-steps the strict parsing mode of the ice package
    /// (as defined in https://tools.ietf.org/html/rfc7064) by copying and then
    /// stripping any erroneous queries from "stun(s):" URLs before parsing.
    pub(crate) fn get_ice_servers(&self) -> Vec<RTCIceServer> {
        let mut ice_servers = self.ice_servers.clone();

        for ice_server in &mut ice_servers {
            for raw_url in &mut ice_server.urls {
                if raw_url.starts_with("stun") {
                    if let Some((head, _)) = raw_url.split_once('?') {
                        *raw_url = head.to_owned();
                    }
                }
            }
        }

        ice_servers
    }

    /// validate_update checks that `next` only changes the fields that may
    /// change on a live connection.
    pub(crate) fn validate_update(&self, next: &RTCConfiguration, has_local_description: bool) -> Result<()> {
        // https://www.w3.org/TR/webrtc/#set-the-configuration (step #3)
        if !next.peer_identity.is_empty() && next.peer_identity != self.peer_identity {
            return Err(Error::ErrModifyingPeerIdentity);
        }

        // https://www.w3.org/TR/webrtc/#set-the-configuration (step #4)
        if !next.certificates.is_empty() {
            if next.certificates.len() != self.certificates.len() {
                return Err(Error::ErrModifyingCertificates);
            }
            for (a, b) in next.certificates.iter().zip(self.certificates.iter()) {
                if a != b {
                    return Err(Error::ErrModifyingCertificates);
                }
            }
        }

        // https://www.w3.org/TR/webrtc/#set-the-configuration (step #5)
        if next.bundle_policy != RTCBundlePolicy::Unspecified
            && next.bundle_policy != self.bundle_policy
        {
            return Err(Error::ErrModifyingBundlePolicy);
        }

        // https://www.w3.org/TR/webrtc/#set-the-configuration (step #6)
        if next.rtcp_mux_policy != RTCRtcpMuxPolicy::Unspecified
            && next.rtcp_mux_policy != self.rtcp_mux_policy
        {
            return Err(Error::ErrModifyingRTCPMuxPolicy);
        }

        // https://www.w3.org/TR/webrtc/#set-the-configuration (step #7)
        if next.ice_candidate_pool_size != 0
            && self.ice_candidate_pool_size != next.ice_candidate_pool_size
            && has_local_description
        {
            return Err(Error::ErrModifyingICECandidatePoolSize);
        }

        // https://www.w3.org/TR/webrtc/#set-the-configuration (step #11)
        for server in &next.ice_servers {
            server.validate()?;
        }

        Ok(())
    }

    /// merge_update applies the mutable fields of `next` on top of self.
    /// Call validate_update first.
    pub(crate) fn merge_update(&mut self, next: RTCConfiguration) {
        if next.ice_transport_policy != RTCIceTransportPolicy::Unspecified {
            self.ice_transport_policy = next.ice_transport_policy;
        }
        if next.ice_candidate_pool_size != 0 {
            self.ice_candidate_pool_size = next.ice_candidate_pool_size;
        }
        if !next.ice_servers.is_empty() {
            self.ice_servers = next.ice_servers;
        }
    }
}

#[derive(Default)]
pub struct RTCConfigurationBuilder {
    configuration: RTCConfiguration,
}

impl RTCConfigurationBuilder {
    pub fn new() -> Self {
        RTCConfigurationBuilder::default()
    }

    pub fn with_ice_servers(mut self, ice_servers: Vec<RTCIceServer>) -> Self {
        self.configuration.ice_servers = ice_servers;
        self
    }

    pub fn with_ice_transport_policy(
        mut self,
        ice_transport_policy: RTCIceTransportPolicy,
    ) -> Self {
        self.configuration.ice_transport_policy = ice_transport_policy;
        self
    }

    pub fn with_bundle_policy(mut self, bundle_policy: RTCBundlePolicy) -> Self {
        self.configuration.bundle_policy = bundle_policy;
        self
    }

    pub fn with_rtcp_mux_policy(mut self, rtcp_mux_policy: RTCRtcpMuxPolicy) -> Self {
        self.configuration.rtcp_mux_policy = rtcp_mux_policy;
        self
    }

    pub fn with_peer_identity(mut self, peer_identity: String) -> Self {
        self.configuration.peer_identity = peer_identity;
        self
    }

    pub fn with_certificates(mut self, certificates: Vec<RTCCertificate>) -> Self {
        self.configuration.certificates = certificates;
        self
    }

    pub fn with_ice_candidate_pool_size(mut self, ice_candidate_pool_size: u8) -> Self {
        self.configuration.ice_candidate_pool_size = ice_candidate_pool_size;
        self
    }

    pub fn with_sdp_semantics(mut self, sdp_semantics: RTCSdpSemantics) -> Self {
        self.configuration.sdp_semantics = sdp_semantics;
        self
    }

    pub fn build(self) -> RTCConfiguration {
        self.configuration
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_configuration_get_ice_servers() {
        {
            let expected_server_str = "stun:stun.l.google.com:19302";
            let cfg = RTCConfigurationBuilder::new()
                .with_ice_servers(vec![RTCIceServer {
                    urls: vec![expected_server_str.to_owned()],
                    ..Default::default()
                }])
                .build();

            let parsed_urls = cfg.get_ice_servers();
            assert_eq!(expected_server_str, parsed_urls[0].urls[0]);
        }

        {
            // ignore the fact that stun URLs shouldn't have a query
            let server_str = "stun:global.stun.twilio.com:3478?transport=udp";
            let expected_server_str = "stun:global.stun.twilio.com:3478";
            let cfg = RTCConfigurationBuilder::new()
                .with_ice_servers(vec![RTCIceServer {
                    urls: vec![server_str.to_owned()],
                    ..Default::default()
                }])
                .build();

            let parsed_urls = cfg.get_ice_servers();
            assert_eq!(expected_server_str, parsed_urls[0].urls[0]);
        }
    }

    #[test]
    fn test_configuration_validate_update() -> Result<()> {
        let current = RTCConfigurationBuilder::new()
            .with_bundle_policy(RTCBundlePolicy::MaxBundle)
            .with_rtcp_mux_policy(RTCRtcpMuxPolicy::Require)
            .with_ice_candidate_pool_size(1)
            .build();

        let tests = vec![
            (
                "peer identity",
                RTCConfigurationBuilder::new()
                    .with_peer_identity("unittest".to_owned())
                    .build(),
                false,
                Some(Error::ErrModifyingPeerIdentity),
            ),
            (
                "certificates",
                RTCConfigurationBuilder::new()
                    .with_certificates(vec![RTCCertificate::generate()?])
                    .build(),
                false,
                Some(Error::ErrModifyingCertificates),
            ),
            (
                "bundle policy",
                RTCConfigurationBuilder::new()
                    .with_bundle_policy(RTCBundlePolicy::Balanced)
                    .build(),
                false,
                Some(Error::ErrModifyingBundlePolicy),
            ),
            (
                "rtcp mux policy",
                RTCConfigurationBuilder::new()
                    .with_rtcp_mux_policy(RTCRtcpMuxPolicy::Negotiate)
                    .build(),
                false,
                Some(Error::ErrModifyingRTCPMuxPolicy),
            ),
            (
                "pool size after local description",
                RTCConfigurationBuilder::new()
                    .with_ice_candidate_pool_size(2)
                    .build(),
                true,
                Some(Error::ErrModifyingICECandidatePoolSize),
            ),
            (
                "pool size before local description",
                RTCConfigurationBuilder::new()
                    .with_ice_candidate_pool_size(2)
                    .build(),
                false,
                None,
            ),
            (
                "turn without credentials",
                RTCConfigurationBuilder::new()
                    .with_ice_servers(vec![RTCIceServer {
                        urls: vec!["turn:turn.example.org".to_owned()],
                        ..Default::default()
                    }])
                    .build(),
                false,
                Some(Error::ErrNoTurnCredentials),
            ),
        ];

        for (name, next, has_local, expected) in tests {
            let result = current.validate_update(&next, has_local);
            match expected {
                Some(err) => assert_eq!(Err(err), result, "{name}"),
                None => assert!(result.is_ok(), "{name}"),
            }
        }

        Ok(())
    }
}
