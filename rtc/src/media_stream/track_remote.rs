use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::Mutex as AsyncMutex;
use util::Unmarshal;

use shared::error::{Error, Result};

use crate::media_stream::{MediaStreamId, MediaStreamTrackId};
use crate::peer_connection::configuration::media_engine::MediaEngine;
use crate::peer_connection::transport::dtls::engine::RtpReadStream;
use crate::rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RtpCodecKind};
use crate::rtp_transceiver::rtp_parameters::RTCRtpParameters;
use crate::rtp_transceiver::{PayloadType, RtpStreamId, SSRC};

const PT_MASK: u8 = 0x7F;

#[derive(Default, Debug)]
struct TrackRemoteInternal {
    id: MediaStreamTrackId,
    stream_id: MediaStreamId,
    ssrc: SSRC,
    payload_type: PayloadType,
    codec: RTCRtpCodecParameters,
    params: RTCRtpParameters,
}

/// TrackRemote represents a single inbound source of media
pub struct TrackRemote {
    kind: RtpCodecKind,
    rid: RtpStreamId,
    receive_mtu: usize,
    media_engine: Arc<Mutex<MediaEngine>>,

    internal: Mutex<TrackRemoteInternal>,
    stream: Mutex<Option<Arc<dyn RtpReadStream>>>,
    repair_stream: Mutex<Option<Arc<dyn RtpReadStream>>>,
    peeked: AsyncMutex<Option<Bytes>>,
}

impl std::fmt::Debug for TrackRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackRemote")
            .field("kind", &self.kind)
            .field("rid", &self.rid)
            .field("internal", &*self.lock())
            .finish()
    }
}

impl TrackRemote {
    pub(crate) fn new(
        kind: RtpCodecKind,
        ssrc: SSRC,
        rid: RtpStreamId,
        receive_mtu: usize,
        media_engine: Arc<Mutex<MediaEngine>>,
    ) -> Self {
        TrackRemote {
            kind,
            rid,
            receive_mtu,
            media_engine,
            internal: Mutex::new(TrackRemoteInternal {
                ssrc,
                ..Default::default()
            }),
            stream: Mutex::new(None),
            repair_stream: Mutex::new(None),
            peeked: AsyncMutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackRemoteInternal> {
        self.internal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// id is the unique identifier for this Track. This should be unique for the
    /// stream, but doesn't have to globally unique. A common example would be 'audio' or 'video'
    /// and StreamID would be 'desktop' or 'webcam'
    pub fn id(&self) -> MediaStreamTrackId {
        self.lock().id.clone()
    }

    pub(crate) fn set_id(&self, id: MediaStreamTrackId) {
        self.lock().id = id;
    }

    /// stream_id is the group this track belongs too. This must be unique
    pub fn stream_id(&self) -> MediaStreamId {
        self.lock().stream_id.clone()
    }

    pub(crate) fn set_stream_id(&self, stream_id: MediaStreamId) {
        self.lock().stream_id = stream_id;
    }

    /// rid gets the RTP Stream ID of this Track
    /// With Simulcast you will have multiple tracks with the same ID, but different RID values.
    /// In many cases a TrackRemote will not have an RID, so it is important to assert it is non-zero
    pub fn rid(&self) -> &str {
        &self.rid
    }

    /// payload_type gets the PayloadType of the track
    pub fn payload_type(&self) -> PayloadType {
        self.lock().payload_type
    }

    /// kind gets the Kind of the track
    pub fn kind(&self) -> RtpCodecKind {
        self.kind
    }

    /// ssrc gets the SSRC of the track
    pub fn ssrc(&self) -> SSRC {
        self.lock().ssrc
    }

    pub(crate) fn set_ssrc(&self, ssrc: SSRC) {
        self.lock().ssrc = ssrc;
    }

    /// codec gets the Codec of the track
    pub fn codec(&self) -> RTCRtpCodecParameters {
        self.lock().codec.clone()
    }

    pub(crate) fn set_codec(&self, codec: RTCRtpCodecParameters) {
        self.lock().codec = codec;
    }

    pub fn params(&self) -> RTCRtpParameters {
        self.lock().params.clone()
    }

    pub(crate) fn set_params(&self, params: RTCRtpParameters) {
        self.lock().params = params;
    }

    pub(crate) fn set_stream(&self, stream: Arc<dyn RtpReadStream>) {
        self.set_ssrc(stream.ssrc());
        *self.stream.lock().unwrap_or_else(PoisonError::into_inner) = Some(stream);
    }

    pub(crate) fn take_stream(&self) -> Option<Arc<dyn RtpReadStream>> {
        self.stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// set_repair_stream binds the retransmission stream that repairs this
    /// track, as named by the repaired-rid header extension.
    pub(crate) fn set_repair_stream(&self, stream: Arc<dyn RtpReadStream>) {
        *self
            .repair_stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(stream);
    }

    pub(crate) fn take_repair_stream(&self) -> Option<Arc<dyn RtpReadStream>> {
        self.repair_stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// repair_ssrc is the SSRC of the bound retransmission stream, if any.
    pub fn repair_ssrc(&self) -> Option<SSRC> {
        self.repair_stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|stream| stream.ssrc())
    }

    /// read_repair reads a packet of the retransmission stream.
    pub async fn read_repair(&self, b: &mut [u8]) -> Result<usize> {
        let stream = self
            .repair_stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::ErrClosedPipe)?;
        stream.read(b).await
    }

    /// read reads data from the track. A packet kept by `peek` is returned
    /// first.
    pub async fn read(&self, b: &mut [u8]) -> Result<usize> {
        {
            let mut peeked = self.peeked.lock().await;
            if let Some(data) = peeked.take() {
                if data.len() > b.len() {
                    return Err(Error::ErrBufferTooSmall);
                }
                b[..data.len()].copy_from_slice(&data);
                return Ok(data.len());
            }
        }

        let stream = self
            .stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::ErrClosedPipe)?;
        let n = stream.read(b).await?;
        self.check_and_update_track(&b[..n])?;
        Ok(n)
    }

    /// read_rtp is a convenience method that wraps read and unmarshals for you.
    pub async fn read_rtp(&self) -> Result<rtp::packet::Packet> {
        let mut b = vec![0u8; self.receive_mtu];
        let n = self.read(&mut b).await?;
        let mut buf = &b[..n];
        Ok(rtp::packet::Packet::unmarshal(&mut buf)?)
    }

    /// peek is like read, but the packet is kept and returned again by the
    /// next read.
    pub(crate) async fn peek(&self, b: &mut [u8]) -> Result<usize> {
        let n = self.read(b).await?;
        *self.peeked.lock().await = Some(Bytes::copy_from_slice(&b[..n]));
        Ok(n)
    }

    /// check_and_update_track checks payload type of `b` and, when it
    /// changed, updates the codec and parameters of the track.
    pub(crate) fn check_and_update_track(&self, b: &[u8]) -> Result<()> {
        if b.len() < 2 {
            return Err(Error::ErrRTPTooShort);
        }

        let payload_type = b[1] & PT_MASK;
        {
            let internal = self.lock();
            if internal.payload_type == payload_type && !internal.codec.rtp_codec.mime_type.is_empty() {
                return Ok(());
            }
        }

        let params = self
            .media_engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_rtp_parameters_by_payload_type(payload_type)?;

        let mut internal = self.lock();
        internal.payload_type = payload_type;
        if let Some(codec) = params.codecs.first() {
            internal.codec = codec.clone();
        }
        internal.params = params;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::peer_connection::configuration::media_engine::MIME_TYPE_VP8;

    #[test]
    fn test_track_remote_payload_type_detection() -> Result<()> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let track = TrackRemote::new(
            RtpCodecKind::Video,
            5000,
            String::new(),
            1460,
            Arc::new(Mutex::new(media_engine)),
        );

        assert_eq!(track.check_and_update_track(&[0x80]), Err(Error::ErrRTPTooShort));

        // VP8 is registered with payload type 96
        track.check_and_update_track(&[0x80, 96])?;
        assert_eq!(track.payload_type(), 96);
        assert_eq!(track.codec().rtp_codec.mime_type, MIME_TYPE_VP8);
        assert_eq!(track.ssrc(), 5000);

        assert_eq!(
            track.check_and_update_track(&[0x80, 0x7F]),
            Err(Error::ErrCodecNotFound)
        );
        assert_eq!(track.payload_type(), 96);

        Ok(())
    }
}
