use std::fmt;

use crate::peer_connection::configuration::UNSPECIFIED_STR;
use crate::peer_connection::sdp::sdp_type::RTCSdpType;
use shared::error::{Error, Result};

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum StateChangeOp {
    #[default]
    SetLocal,
    SetRemote,
}

impl fmt::Display for StateChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            StateChangeOp::SetLocal => write!(f, "SetLocal"),
            StateChangeOp::SetRemote => write!(f, "SetRemote"),
        }
    }
}

/// SignalingState indicates the signaling state of the offer/answer process.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum RTCSignalingState {
    Unspecified = 0,

    /// SignalingStateStable indicates there is no offer/answer exchange in
    /// progress. This is also the initial state, in which case the local and
    /// remote descriptions are nil.
    #[default]
    Stable,

    /// SignalingStateHaveLocalOffer indicates that a local description, of
    /// type "offer", has been successfully applied.
    HaveLocalOffer,

    /// SignalingStateHaveRemoteOffer indicates that a remote description, of
    /// type "offer", has been successfully applied.
    HaveRemoteOffer,

    /// SignalingStateHaveLocalPranswer indicates that a remote description
    /// of type "offer" has been successfully applied and a local description
    /// of type "pranswer" has been successfully applied.
    HaveLocalPranswer,

    /// SignalingStateHaveRemotePranswer indicates that a local description
    /// of type "offer" has been successfully applied and a remote description
    /// of type "pranswer" has been successfully applied.
    HaveRemotePranswer,

    /// SignalingStateClosed indicates The PeerConnection has been closed.
    Closed,
}

const SIGNALING_STATE_STABLE_STR: &str = "stable";
const SIGNALING_STATE_HAVE_LOCAL_OFFER_STR: &str = "have-local-offer";
const SIGNALING_STATE_HAVE_REMOTE_OFFER_STR: &str = "have-remote-offer";
const SIGNALING_STATE_HAVE_LOCAL_PRANSWER_STR: &str = "have-local-pranswer";
const SIGNALING_STATE_HAVE_REMOTE_PRANSWER_STR: &str = "have-remote-pranswer";
const SIGNALING_STATE_CLOSED_STR: &str = "closed";

impl From<&str> for RTCSignalingState {
    fn from(raw: &str) -> Self {
        match raw {
            SIGNALING_STATE_STABLE_STR => RTCSignalingState::Stable,
            SIGNALING_STATE_HAVE_LOCAL_OFFER_STR => RTCSignalingState::HaveLocalOffer,
            SIGNALING_STATE_HAVE_REMOTE_OFFER_STR => RTCSignalingState::HaveRemoteOffer,
            SIGNALING_STATE_HAVE_LOCAL_PRANSWER_STR => RTCSignalingState::HaveLocalPranswer,
            SIGNALING_STATE_HAVE_REMOTE_PRANSWER_STR => RTCSignalingState::HaveRemotePranswer,
            SIGNALING_STATE_CLOSED_STR => RTCSignalingState::Closed,
            _ => RTCSignalingState::Unspecified,
        }
    }
}

impl fmt::Display for RTCSignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            RTCSignalingState::Stable => SIGNALING_STATE_STABLE_STR,
            RTCSignalingState::HaveLocalOffer => SIGNALING_STATE_HAVE_LOCAL_OFFER_STR,
            RTCSignalingState::HaveRemoteOffer => SIGNALING_STATE_HAVE_REMOTE_OFFER_STR,
            RTCSignalingState::HaveLocalPranswer => SIGNALING_STATE_HAVE_LOCAL_PRANSWER_STR,
            RTCSignalingState::HaveRemotePranswer => SIGNALING_STATE_HAVE_REMOTE_PRANSWER_STR,
            RTCSignalingState::Closed => SIGNALING_STATE_CLOSED_STR,
            RTCSignalingState::Unspecified => UNSPECIFIED_STR,
        };
        write!(f, "{s}")
    }
}

/// next_signaling_state resolves the state reached by applying a description
/// of `sdp_type` through `op` while in `cur`, following the valid transitions
/// of <https://www.w3.org/TR/webrtc/#rtcsignalingstate-enum>. Any other tuple
/// is rejected and the caller keeps its current state.
pub(crate) fn next_signaling_state(
    cur: RTCSignalingState,
    op: StateChangeOp,
    sdp_type: RTCSdpType,
) -> Result<RTCSignalingState> {
    use RTCSdpType::*;
    use RTCSignalingState::*;
    use StateChangeOp::*;

    if sdp_type == Rollback {
        return match cur {
            Stable => Err(Error::ErrSignalingStateCannotRollback),
            HaveLocalOffer | HaveRemoteOffer | HaveLocalPranswer | HaveRemotePranswer => Ok(Stable),
            _ => Err(Error::ErrSignalingStateProposedTransitionInvalid(format!(
                "from {cur} applying rollback"
            ))),
        };
    }

    let next = match (cur, op, sdp_type) {
        // stable->SetLocal(offer)->have-local-offer
        (Stable, SetLocal, Offer) => HaveLocalOffer,
        // stable->SetRemote(offer)->have-remote-offer
        (Stable, SetRemote, Offer) => HaveRemoteOffer,
        // have-local-offer->SetRemote(answer)->stable
        (HaveLocalOffer, SetRemote, Answer) => Stable,
        // have-local-offer->SetRemote(pranswer)->have-remote-pranswer
        (HaveLocalOffer, SetRemote, Pranswer) => HaveRemotePranswer,
        // have-remote-pranswer->SetRemote(answer)->stable
        (HaveRemotePranswer, SetRemote, Answer) => Stable,
        // have-remote-offer->SetLocal(answer)->stable
        (HaveRemoteOffer, SetLocal, Answer) => Stable,
        // have-remote-offer->SetLocal(pranswer)->have-local-pranswer
        (HaveRemoteOffer, SetLocal, Pranswer) => HaveLocalPranswer,
        // have-local-pranswer->SetLocal(answer)->stable
        (HaveLocalPranswer, SetLocal, Answer) => Stable,
        _ => {
            return Err(Error::ErrSignalingStateProposedTransitionInvalid(format!(
                "from {cur} applying {op} {sdp_type}"
            )));
        }
    };

    Ok(next)
}
