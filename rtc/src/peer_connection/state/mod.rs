//! Connection state types.
//!
//! A peer connection runs several independent state machines: ICE
//! connectivity, ICE candidate gathering, the aggregate connection state and
//! the offer/answer signaling state. Changes of each are reported through the
//! matching `on_*_state_change` handler.

pub(crate) mod ice_connection_state;
pub(crate) mod ice_gathering_state;
pub(crate) mod peer_connection_state;
pub(crate) mod signaling_state;

pub use ice_connection_state::RTCIceConnectionState;
pub use ice_gathering_state::RTCIceGatheringState;
pub use peer_connection_state::RTCPeerConnectionState;
pub use signaling_state::RTCSignalingState;
