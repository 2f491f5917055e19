use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use shared::error::Result;

use crate::media_stream::{MediaStreamId, MediaStreamTrackId};
use crate::rtp_transceiver::SSRC;
use crate::rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RtpCodecKind};
use crate::rtp_transceiver::rtp_parameters::{
    RTCRtpHeaderExtensionParameters, RTCRtpParameters,
};

pub mod track_local_static_rtp;

/// TrackLocalWriter is the sink a bound track writes its packets into.
#[async_trait]
pub trait TrackLocalWriter: fmt::Debug + Send + Sync {
    /// write_rtp encrypts an RTP packet and writes it to the connection.
    async fn write_rtp(&self, p: &rtp::packet::Packet) -> Result<usize>;
}

/// TrackLocalContext is the context passed when a TrackLocal has been
/// bound to or unbound from a sender. It carries the negotiated codecs,
/// header extensions and the SSRC the track must use.
#[derive(Debug, Clone)]
pub struct TrackLocalContext {
    pub(crate) id: String,
    pub(crate) mid: Option<String>,
    pub(crate) params: RTCRtpParameters,
    pub(crate) ssrc: SSRC,
    pub(crate) write_stream: Arc<dyn TrackLocalWriter>,
}

impl TrackLocalContext {
    /// codec_parameters returns the negotiated codecs the track may send.
    pub fn codec_parameters(&self) -> &[RTCRtpCodecParameters] {
        &self.params.codecs
    }

    /// header_extensions returns the negotiated header extensions.
    pub fn header_extensions(&self) -> &[RTCRtpHeaderExtensionParameters] {
        &self.params.header_extensions
    }

    /// ssrc requires the negotiated SSRC of this track.
    pub fn ssrc(&self) -> SSRC {
        self.ssrc
    }

    /// mid of the media section the track is sent in, if negotiated.
    pub fn mid(&self) -> Option<&str> {
        self.mid.as_deref()
    }

    /// write_stream returns the sink packets are written to.
    pub fn write_stream(&self) -> Arc<dyn TrackLocalWriter> {
        Arc::clone(&self.write_stream)
    }

    /// id is a unique identifier used for both bind and unbind.
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// TrackLocal is an interface that controls how the user can send media.
/// The user can provide their own TrackLocal implementations, or use the
/// implementations in this module.
pub trait TrackLocal: Send + Sync {
    /// bind should implement the way how the media data flows from the
    /// track to the sender. It returns the codec the track will send with.
    fn bind(&self, ctx: &TrackLocalContext) -> Result<RTCRtpCodecParameters>;

    /// unbind should implement the teardown logic when the track is no
    /// longer needed.
    fn unbind(&self, ctx: &TrackLocalContext) -> Result<()>;

    /// id is the unique identifier for this track. This should be unique
    /// for the stream, but doesn't have to be globally unique.
    fn id(&self) -> &MediaStreamTrackId;

    /// rid is the RTP stream identifier of a simulcast layer.
    fn rid(&self) -> Option<&str>;

    /// stream_id is the group this track belongs too. This must be unique.
    fn stream_id(&self) -> &MediaStreamId;

    /// kind controls if this TrackLocal is audio or video.
    fn kind(&self) -> RtpCodecKind;

    fn as_any(&self) -> &dyn Any;
}
