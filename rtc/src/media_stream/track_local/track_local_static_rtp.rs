use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use log::trace;

use sdp::extmap::{SDES_MID_URI, SDES_RTP_STREAM_ID_URI};
use shared::error::{Error, Result, flatten_errs};
use util::Unmarshal;

use super::{TrackLocal, TrackLocalContext, TrackLocalWriter};
use crate::media_stream::{MediaStreamId, MediaStreamTrackId};
use crate::rtp_transceiver::rtp_codec::{
    CodecMatch, RTCRtpCodec, RTCRtpCodecParameters, RtpCodecKind, codec_parameters_fuzzy_search,
};
use crate::rtp_transceiver::{PayloadType, SSRC};

/// Header extension written on every packet of one binding.
#[derive(Debug, Clone)]
struct HeaderExtensionValue {
    id: u8,
    payload: Bytes,
}

#[derive(Debug, Clone)]
struct TrackBinding {
    id: String,
    ssrc: SSRC,
    payload_type: PayloadType,
    hdr_ext_ids: Vec<HeaderExtensionValue>,
    write_stream: Arc<dyn TrackLocalWriter>,
}

/// TrackLocalStaticRTP is a TrackLocal that has a pre-set codec and accepts
/// RTP Packets.
#[derive(Debug)]
pub struct TrackLocalStaticRTP {
    bindings: Mutex<Vec<TrackBinding>>,
    codec: RTCRtpCodec,
    id: MediaStreamTrackId,
    rid: Option<String>,
    stream_id: MediaStreamId,
}

impl TrackLocalStaticRTP {
    /// returns a TrackLocalStaticRTP without rid.
    pub fn new(codec: RTCRtpCodec, id: MediaStreamTrackId, stream_id: MediaStreamId) -> Self {
        TrackLocalStaticRTP {
            bindings: Mutex::new(vec![]),
            codec,
            id,
            rid: None,
            stream_id,
        }
    }

    /// returns a TrackLocalStaticRTP with rid.
    pub fn new_with_rid(
        codec: RTCRtpCodec,
        id: MediaStreamTrackId,
        rid: String,
        stream_id: MediaStreamId,
    ) -> Self {
        TrackLocalStaticRTP {
            rid: Some(rid),
            ..TrackLocalStaticRTP::new(codec, id, stream_id)
        }
    }

    fn bindings(&self) -> MutexGuard<'_, Vec<TrackBinding>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// codec gets the Codec of the track
    pub fn codec(&self) -> RTCRtpCodec {
        self.codec.clone()
    }

    /// binding_count returns how many senders the track is bound to.
    pub fn binding_count(&self) -> usize {
        self.bindings().len()
    }

    /// write_rtp writes a RTP Packet to the TrackLocalStaticRTP.
    /// If one binding fails the packet is still written to the others;
    /// the returned error then carries every failure.
    pub async fn write_rtp(&self, p: &rtp::packet::Packet) -> Result<usize> {
        let bindings = self.bindings().clone();

        let mut n = 0;
        let mut write_errs = vec![];
        let mut pkt = p.clone();
        for b in bindings {
            pkt.header.ssrc = b.ssrc;
            pkt.header.payload_type = b.payload_type;

            for ext in &b.hdr_ext_ids {
                if let Err(err) = pkt.header.set_extension(ext.id, ext.payload.clone()) {
                    write_errs.push(err.into());
                }
            }

            match b.write_stream.write_rtp(&pkt).await {
                Ok(m) => n += m,
                Err(err) => {
                    trace!("write to binding {} failed: {err}", b.id);
                    write_errs.push(err);
                }
            }
        }

        flatten_errs(write_errs)?;
        Ok(n)
    }

    /// write writes a marshalled RTP Packet to the TrackLocalStaticRTP.
    pub async fn write(&self, mut b: &[u8]) -> Result<usize> {
        let pkt = rtp::packet::Packet::unmarshal(&mut b)?;
        self.write_rtp(&pkt).await
    }
}

impl TrackLocal for TrackLocalStaticRTP {
    /// bind is called by the sender after negotiation is complete. It picks
    /// the first negotiated codec matching the track's codec.
    fn bind(&self, ctx: &TrackLocalContext) -> Result<RTCRtpCodecParameters> {
        let (codec, match_type) = codec_parameters_fuzzy_search(&self.codec, &ctx.params.codecs);
        if match_type == CodecMatch::None {
            return Err(Error::ErrUnsupportedCodec);
        }

        let mut hdr_ext_ids = vec![];
        if let (Some(id), Some(mid)) = (ctx.params.header_extension_id(SDES_MID_URI), &ctx.mid) {
            hdr_ext_ids.push(HeaderExtensionValue {
                id,
                payload: Bytes::from(mid.clone()),
            });
        }
        if let (Some(id), Some(rid)) =
            (ctx.params.header_extension_id(SDES_RTP_STREAM_ID_URI), &self.rid)
        {
            hdr_ext_ids.push(HeaderExtensionValue {
                id,
                payload: Bytes::from(rid.clone()),
            });
        }

        self.bindings().push(TrackBinding {
            id: ctx.id.clone(),
            ssrc: ctx.ssrc,
            payload_type: codec.payload_type,
            hdr_ext_ids,
            write_stream: ctx.write_stream(),
        });

        Ok(codec)
    }

    /// unbind implements the teardown logic when the track is no longer
    /// needed. This happens because a track has been stopped.
    fn unbind(&self, ctx: &TrackLocalContext) -> Result<()> {
        let mut bindings = self.bindings();
        let idx = bindings
            .iter()
            .position(|b| b.id == ctx.id)
            .ok_or(Error::ErrUnbindFailed)?;
        bindings.remove(idx);
        Ok(())
    }

    /// id is the unique identifier for this Track. This should be unique
    /// for the stream, but doesn't have to globally unique. A common example
    /// would be 'audio' or 'video' and stream_id would be 'desktop' or
    /// 'webcam'.
    fn id(&self) -> &MediaStreamTrackId {
        &self.id
    }

    fn rid(&self) -> Option<&str> {
        self.rid.as_deref()
    }

    fn stream_id(&self) -> &MediaStreamId {
        &self.stream_id
    }

    /// kind controls if this TrackLocal is audio or video
    fn kind(&self) -> RtpCodecKind {
        if self.codec.mime_type.starts_with("audio/") {
            RtpCodecKind::Audio
        } else if self.codec.mime_type.starts_with("video/") {
            RtpCodecKind::Video
        } else {
            RtpCodecKind::Unspecified
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod test {
    use async_trait::async_trait;
    use tokio::sync::Mutex as AsyncMutex;

    use super::*;
    use crate::peer_connection::configuration::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
    use crate::rtp_transceiver::rtp_parameters::{
        RTCRtpHeaderExtensionParameters, RTCRtpParameters,
    };

    #[derive(Debug, Default)]
    struct Capture {
        packets: AsyncMutex<Vec<rtp::packet::Packet>>,
    }

    #[async_trait]
    impl TrackLocalWriter for Capture {
        async fn write_rtp(&self, p: &rtp::packet::Packet) -> Result<usize> {
            self.packets.lock().await.push(p.clone());
            Ok(p.payload.len())
        }
    }

    fn vp8() -> RTCRtpCodec {
        RTCRtpCodec {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        }
    }

    fn context(capture: &Arc<Capture>, ssrc: SSRC) -> TrackLocalContext {
        TrackLocalContext {
            id: format!("binding-{ssrc}"),
            mid: Some("0".to_owned()),
            params: RTCRtpParameters {
                header_extensions: vec![RTCRtpHeaderExtensionParameters {
                    uri: SDES_MID_URI.to_owned(),
                    id: 1,
                }],
                codecs: vec![RTCRtpCodecParameters {
                    rtp_codec: vp8(),
                    payload_type: 96,
                }],
            },
            ssrc,
            write_stream: Arc::clone(capture) as Arc<dyn TrackLocalWriter>,
        }
    }

    #[tokio::test]
    async fn test_track_local_static_rtp_rewrites_packets() -> Result<()> {
        let track = TrackLocalStaticRTP::new(vp8(), "video".to_owned(), "webcam".to_owned());
        assert_eq!(track.kind(), RtpCodecKind::Video);

        let capture = Arc::new(Capture::default());
        let ctx = context(&capture, 1234);
        let codec = track.bind(&ctx)?;
        assert_eq!(codec.payload_type, 96);

        let pkt = rtp::packet::Packet {
            header: rtp::header::Header {
                version: 2,
                payload_type: 1,
                ssrc: 1,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0xAA, 0xBB]),
        };
        assert_eq!(track.write_rtp(&pkt).await?, 2);

        let packets = capture.packets.lock().await;
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].header.ssrc, 1234);
        assert_eq!(packets[0].header.payload_type, 96);
        assert_eq!(packets[0].header.get_extension(1), Some(Bytes::from_static(b"0")));
        drop(packets);

        track.unbind(&ctx)?;
        assert_eq!(track.binding_count(), 0);
        assert_eq!(track.unbind(&ctx), Err(Error::ErrUnbindFailed));

        Ok(())
    }

    #[test]
    fn test_track_local_static_rtp_bind_unsupported_codec() {
        let opus = RTCRtpCodec {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        };
        let track = TrackLocalStaticRTP::new(opus, "audio".to_owned(), "mic".to_owned());
        let capture = Arc::new(Capture::default());

        assert_eq!(track.bind(&context(&capture, 1)), Err(Error::ErrUnsupportedCodec));
        assert_eq!(track.binding_count(), 0);
    }
}
