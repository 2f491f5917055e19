use std::fmt;

use super::ice_connection_state::RTCIceConnectionState;
use crate::peer_connection::configuration::UNSPECIFIED_STR;
use crate::peer_connection::transport::dtls::state::RTCDtlsTransportState;

/// PeerConnectionState indicates the state of the PeerConnection.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum RTCPeerConnectionState {
    #[default]
    Unspecified,

    /// PeerConnectionStateNew indicates that any of the ICETransports or
    /// DTLSTransports are in the "new" state and none of the transports are
    /// in the "connecting", "checking", "failed" or "disconnected" state, or
    /// all transports are in the "closed" state, or there are no transports.
    New,

    /// PeerConnectionStateConnecting indicates that any of the
    /// ICETransports or DTLSTransports are in the "connecting" or
    /// "checking" state and none of them is in the "failed" state.
    Connecting,

    /// PeerConnectionStateConnected indicates that all ICETransports and
    /// DTLSTransports are in the "connected", "completed" or "closed" state
    /// and at least one of them is in the "connected" or "completed" state.
    Connected,

    /// PeerConnectionStateDisconnected indicates that any of the
    /// ICETransports or DTLSTransports are in the "disconnected" state
    /// and none of them are in the "failed" or "connecting" or "checking" state.
    Disconnected,

    /// PeerConnectionStateFailed indicates that any of the ICETransports
    /// or DTLSTransports are in a "failed" state.
    Failed,

    /// PeerConnectionStateClosed indicates the peer connection is closed
    /// and the isClosed member variable of PeerConnection is true.
    Closed,
}

const PEER_CONNECTION_STATE_NEW_STR: &str = "new";
const PEER_CONNECTION_STATE_CONNECTING_STR: &str = "connecting";
const PEER_CONNECTION_STATE_CONNECTED_STR: &str = "connected";
const PEER_CONNECTION_STATE_DISCONNECTED_STR: &str = "disconnected";
const PEER_CONNECTION_STATE_FAILED_STR: &str = "failed";
const PEER_CONNECTION_STATE_CLOSED_STR: &str = "closed";

impl From<&str> for RTCPeerConnectionState {
    fn from(raw: &str) -> Self {
        match raw {
            PEER_CONNECTION_STATE_NEW_STR => RTCPeerConnectionState::New,
            PEER_CONNECTION_STATE_CONNECTING_STR => RTCPeerConnectionState::Connecting,
            PEER_CONNECTION_STATE_CONNECTED_STR => RTCPeerConnectionState::Connected,
            PEER_CONNECTION_STATE_DISCONNECTED_STR => RTCPeerConnectionState::Disconnected,
            PEER_CONNECTION_STATE_FAILED_STR => RTCPeerConnectionState::Failed,
            PEER_CONNECTION_STATE_CLOSED_STR => RTCPeerConnectionState::Closed,
            _ => RTCPeerConnectionState::Unspecified,
        }
    }
}

impl fmt::Display for RTCPeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            RTCPeerConnectionState::New => PEER_CONNECTION_STATE_NEW_STR,
            RTCPeerConnectionState::Connecting => PEER_CONNECTION_STATE_CONNECTING_STR,
            RTCPeerConnectionState::Connected => PEER_CONNECTION_STATE_CONNECTED_STR,
            RTCPeerConnectionState::Disconnected => PEER_CONNECTION_STATE_DISCONNECTED_STR,
            RTCPeerConnectionState::Failed => PEER_CONNECTION_STATE_FAILED_STR,
            RTCPeerConnectionState::Closed => PEER_CONNECTION_STATE_CLOSED_STR,
            RTCPeerConnectionState::Unspecified => UNSPECIFIED_STR,
        };
        write!(f, "{s}")
    }
}

impl RTCPeerConnectionState {
    /// aggregate derives the connection state from the ICE and DTLS transports
    /// <https://www.w3.org/TR/webrtc/#rtcpeerconnectionstate-enum>
    pub(crate) fn aggregate(
        is_closed: bool,
        ice_connection_state: RTCIceConnectionState,
        dtls_transport_state: RTCDtlsTransportState,
    ) -> Self {
        if is_closed {
            RTCPeerConnectionState::Closed
        } else if ice_connection_state == RTCIceConnectionState::Failed
            || dtls_transport_state == RTCDtlsTransportState::Failed
        {
            RTCPeerConnectionState::Failed
        } else if ice_connection_state == RTCIceConnectionState::Disconnected {
            RTCPeerConnectionState::Disconnected
        } else if (ice_connection_state == RTCIceConnectionState::Connected
            || ice_connection_state == RTCIceConnectionState::Completed)
            && dtls_transport_state == RTCDtlsTransportState::Connected
        {
            RTCPeerConnectionState::Connected
        } else if ice_connection_state == RTCIceConnectionState::Checking
            && dtls_transport_state == RTCDtlsTransportState::Connecting
        {
            RTCPeerConnectionState::Connecting
        } else {
            RTCPeerConnectionState::New
        }
    }
}

/// Latch guarding the negotiation-needed check so at most one runs at a time.
/// A request arriving while a check runs is remembered as a single rerun.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum NegotiationNeededState {
    /// NegotiationNeededStateEmpty not running and queue is empty
    #[default]
    Empty,
    /// NegotiationNeededStateRun running and queue is empty
    Run,
    /// NegotiationNeededStateQueue running and queue is not empty
    Queue,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_peer_connection_state_string() {
        let tests = vec![
            (RTCPeerConnectionState::Unspecified, UNSPECIFIED_STR),
            (RTCPeerConnectionState::New, "new"),
            (RTCPeerConnectionState::Connecting, "connecting"),
            (RTCPeerConnectionState::Connected, "connected"),
            (RTCPeerConnectionState::Disconnected, "disconnected"),
            (RTCPeerConnectionState::Failed, "failed"),
            (RTCPeerConnectionState::Closed, "closed"),
        ];

        for (state, expected_string) in tests {
            assert_eq!(expected_string, state.to_string());
            assert_eq!(state, RTCPeerConnectionState::from(expected_string));
        }
    }

    #[test]
    fn test_peer_connection_state_aggregate() {
        use RTCDtlsTransportState as Dtls;
        use RTCIceConnectionState as Ice;

        let tests = vec![
            (true, Ice::Connected, Dtls::Connected, RTCPeerConnectionState::Closed),
            (false, Ice::Failed, Dtls::Connected, RTCPeerConnectionState::Failed),
            (false, Ice::Connected, Dtls::Failed, RTCPeerConnectionState::Failed),
            (false, Ice::Disconnected, Dtls::Connected, RTCPeerConnectionState::Disconnected),
            (false, Ice::Connected, Dtls::Connected, RTCPeerConnectionState::Connected),
            (false, Ice::Completed, Dtls::Connected, RTCPeerConnectionState::Connected),
            (false, Ice::Checking, Dtls::Connecting, RTCPeerConnectionState::Connecting),
            (false, Ice::Connected, Dtls::Connecting, RTCPeerConnectionState::New),
            (false, Ice::New, Dtls::New, RTCPeerConnectionState::New),
        ];

        for (closed, ice, dtls, expected) in tests {
            assert_eq!(
                expected,
                RTCPeerConnectionState::aggregate(closed, ice, dtls),
                "closed={closed} ice={ice} dtls={dtls}"
            );
        }
    }
}
