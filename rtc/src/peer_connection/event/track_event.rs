use std::sync::Arc;

use crate::media_stream::track_remote::TrackRemote;
use crate::rtp_transceiver::RTCRtpTransceiver;
use crate::rtp_transceiver::rtp_receiver::RTCRtpReceiver;

/// RTCTrackEvent is raised once a remote track has been bound to a
/// receiver and its first packet has arrived.
#[derive(Debug, Clone)]
pub struct RTCTrackEvent {
    pub track: Arc<TrackRemote>,
    pub receiver: Arc<RTCRtpReceiver>,
    pub transceiver: Arc<RTCRtpTransceiver>,
}
