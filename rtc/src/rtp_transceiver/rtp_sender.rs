use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use log::trace;
use tokio::sync::watch;

use shared::error::{Error, Result};
use shared::util::math_rand_alpha;

use crate::media_stream::track_local::{TrackLocal, TrackLocalContext, TrackLocalWriter};
use crate::peer_connection::configuration::media_engine::MediaEngine;
use crate::peer_connection::transport::dtls::RTCDtlsTransport;
use crate::rtp_transceiver::direction::RTCRtpTransceiverDirection;
use crate::rtp_transceiver::rtp_codec::RtpCodecKind;
use crate::rtp_transceiver::rtp_parameters::{RTCRtpEncodingParameters, RTCRtpSendParameters};
use crate::rtp_transceiver::{PayloadType, SSRC};

/// Writes packets of the bound track once the SRTP session is up.
struct SrtpWriterFuture {
    transport: Arc<RTCDtlsTransport>,
    stop_rx: watch::Receiver<bool>,
}

impl fmt::Debug for SrtpWriterFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SrtpWriterFuture")
            .field("stopped", &*self.stop_rx.borrow())
            .finish()
    }
}

#[async_trait]
impl TrackLocalWriter for SrtpWriterFuture {
    async fn write_rtp(&self, p: &rtp::packet::Packet) -> Result<usize> {
        if *self.stop_rx.borrow() {
            return Err(Error::ErrClosedPipe);
        }
        let session = self
            .transport
            .srtp_ready()
            .await
            .ok_or(Error::ErrClosedPipe)?;
        session.write_rtp(p).await
    }
}

#[derive(Default)]
struct RTCRtpSenderInternal {
    track: Option<Arc<dyn TrackLocal>>,
    context: Option<TrackLocalContext>,
    mid: Option<String>,
    payload_type: PayloadType,
    negotiated: bool,
    send_called: bool,
}

/// RTPSender allows an application to control how a given Track is encoded
/// and transmitted to a remote peer
pub struct RTCRtpSender {
    id: String,
    kind: RtpCodecKind,
    ssrc: SSRC,

    transport: Arc<RTCDtlsTransport>,
    media_engine: Arc<Mutex<MediaEngine>>,

    internal: Mutex<RTCRtpSenderInternal>,
    stop_tx: watch::Sender<bool>,
}

impl fmt::Debug for RTCRtpSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RTCRtpSender")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("ssrc", &self.ssrc)
            .finish()
    }
}

impl RTCRtpSender {
    pub(crate) fn new(
        track: Option<Arc<dyn TrackLocal>>,
        kind: RtpCodecKind,
        transport: Arc<RTCDtlsTransport>,
        media_engine: Arc<Mutex<MediaEngine>>,
    ) -> Self {
        RTCRtpSender {
            id: math_rand_alpha(32),
            kind,
            ssrc: rand::random::<u32>(),
            transport,
            media_engine,
            internal: Mutex::new(RTCRtpSenderInternal {
                track,
                ..Default::default()
            }),
            stop_tx: watch::Sender::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RTCRtpSenderInternal> {
        self.internal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn kind(&self) -> RtpCodecKind {
        self.kind
    }

    /// ssrc is the synchronization source the sender writes with.
    pub fn ssrc(&self) -> SSRC {
        self.ssrc
    }

    /// payload_type of the codec the track was bound with, zero before send.
    pub fn payload_type(&self) -> PayloadType {
        self.lock().payload_type
    }

    /// track returns the RTCRtpTransceiver track, or None
    pub fn track(&self) -> Option<Arc<dyn TrackLocal>> {
        self.lock().track.clone()
    }

    pub(crate) fn transport(&self) -> Arc<RTCDtlsTransport> {
        Arc::clone(&self.transport)
    }

    pub(crate) fn set_mid(&self, mid: String) {
        self.lock().mid = Some(mid);
    }

    /// get_parameters describes the current configuration for the encoding
    /// and transmission of media on the sender's track.
    pub fn get_parameters(&self) -> RTCRtpSendParameters {
        let rtp_parameters = self
            .media_engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_rtp_parameters_by_kind(self.kind, RTCRtpTransceiverDirection::Sendonly);

        let rid = self
            .track()
            .and_then(|t| t.rid().map(str::to_owned))
            .unwrap_or_default();

        RTCRtpSendParameters {
            rtp_parameters,
            encodings: vec![RTCRtpEncodingParameters {
                rid,
                ssrc: self.ssrc,
                payload_type: self.payload_type(),
                rtx_ssrc: None,
            }],
        }
    }

    pub(crate) fn is_negotiated(&self) -> bool {
        self.lock().negotiated
    }

    pub(crate) fn set_negotiated(&self) {
        self.lock().negotiated = true;
    }

    /// has_sent tells if data has been ever sent for this instance
    pub fn has_sent(&self) -> bool {
        self.lock().send_called
    }

    /// has_stopped tells if stop has been called
    pub fn has_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    fn new_context(&self, parameters: &RTCRtpSendParameters) -> TrackLocalContext {
        TrackLocalContext {
            id: self.id.clone(),
            mid: self.lock().mid.clone(),
            params: parameters.rtp_parameters.clone(),
            ssrc: self.ssrc,
            write_stream: Arc::new(SrtpWriterFuture {
                transport: Arc::clone(&self.transport),
                stop_rx: self.stop_tx.subscribe(),
            }),
        }
    }

    /// send attempts to send media on the track using the given parameters.
    pub async fn send(&self, parameters: &RTCRtpSendParameters) -> Result<()> {
        if self.has_stopped() {
            return Err(Error::ErrClosedPipe);
        }
        let track = {
            let internal = self.lock();
            if internal.send_called {
                return Err(Error::ErrRTPSenderSendAlreadyCalled);
            }
            internal.track.clone().ok_or(Error::ErrRTPSenderTrackNil)?
        };

        let mut context = self.new_context(parameters);
        let codec = track.bind(&context)?;
        context.params.codecs = vec![codec.clone()];
        trace!(
            "sender {} bound track {} with payload type {}",
            self.id,
            track.id(),
            codec.payload_type
        );

        let mut internal = self.lock();
        internal.payload_type = codec.payload_type;
        internal.context = Some(context);
        internal.send_called = true;

        Ok(())
    }

    /// replace_track replaces the track currently being used as the
    /// sender's source with a new TrackLocal. The new track must be of the
    /// same media kind (audio, video, etc) and switching the track should
    /// not require negotiation.
    pub async fn replace_track(&self, track: Option<Arc<dyn TrackLocal>>) -> Result<()> {
        if let Some(t) = &track {
            if self.kind != t.kind() {
                return Err(Error::ErrRTPSenderNewTrackHasIncorrectKind);
            }
        }

        let (old_track, context) = {
            let internal = self.lock();
            (internal.track.clone(), internal.context.clone())
        };

        if let (Some(old_track), Some(context)) = (&old_track, &context) {
            old_track.unbind(context)?;
        }

        let (Some(mut context), Some(new_track)) = (context, track.clone()) else {
            self.lock().track = track;
            return Ok(());
        };

        let codec = match new_track.bind(&context) {
            Ok(codec) => codec,
            Err(err) => {
                // re-bind the original track
                if let Some(old_track) = &old_track {
                    old_track.bind(&context)?;
                }
                return Err(err);
            }
        };

        let mut internal = self.lock();
        if internal.payload_type != codec.payload_type {
            internal.payload_type = codec.payload_type;
            context.params.codecs = vec![codec];
        }
        internal.track = Some(new_track);
        internal.context = Some(context);

        Ok(())
    }

    /// stop irreversibly stops the RTPSender
    pub async fn stop(&self) -> Result<()> {
        if self.stop_tx.send_replace(true) {
            return Ok(());
        }

        let (track, context) = {
            let mut internal = self.lock();
            (internal.track.clone(), internal.context.take())
        };
        if let (Some(track), Some(context)) = (track, context) {
            track.unbind(&context)?;
        }

        Ok(())
    }
}
