use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use shared::error::{Error, Result, flatten_errs};

use crate::media_stream::track_remote::TrackRemote;
use crate::peer_connection::configuration::media_engine::MediaEngine;
use crate::peer_connection::transport::dtls::RTCDtlsTransport;
use crate::peer_connection::transport::dtls::engine::RtpReadStream;
use crate::rtp_transceiver::rtp_codec::RtpCodecKind;
use crate::rtp_transceiver::rtp_parameters::{RTCRtpParameters, RTCRtpReceiveParameters};

/// RTPReceiver allows an application to inspect the receipt of a TrackRemote
pub struct RTCRtpReceiver {
    kind: RtpCodecKind,
    receive_mtu: usize,
    transport: Arc<RTCDtlsTransport>,
    media_engine: Arc<Mutex<MediaEngine>>,

    tracks: Mutex<Vec<Arc<TrackRemote>>>,
    received_tx: watch::Sender<bool>,
    closed_tx: watch::Sender<bool>,
}

impl fmt::Debug for RTCRtpReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RTCRtpReceiver")
            .field("kind", &self.kind)
            .field("tracks", &*self.lock())
            .finish()
    }
}

impl RTCRtpReceiver {
    pub(crate) fn new(
        receive_mtu: usize,
        kind: RtpCodecKind,
        transport: Arc<RTCDtlsTransport>,
        media_engine: Arc<Mutex<MediaEngine>>,
    ) -> Self {
        RTCRtpReceiver {
            kind,
            receive_mtu,
            transport,
            media_engine,
            tracks: Mutex::new(vec![]),
            received_tx: watch::Sender::new(false),
            closed_tx: watch::Sender::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<TrackRemote>>> {
        self.tracks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn kind(&self) -> RtpCodecKind {
        self.kind
    }

    pub(crate) fn transport(&self) -> Arc<RTCDtlsTransport> {
        Arc::clone(&self.transport)
    }

    /// track returns the first track of the receiver, if any.
    pub fn track(&self) -> Option<Arc<TrackRemote>> {
        self.lock().first().cloned()
    }

    /// tracks returns the RtpTransceiver tracks
    /// A RTPReceiver to support Simulcast may now have multiple tracks
    pub fn tracks(&self) -> Vec<Arc<TrackRemote>> {
        self.lock().clone()
    }

    /// have_received tells if receive has been called.
    pub fn have_received(&self) -> bool {
        *self.received_tx.borrow()
    }

    /// set_rtp_parameters applies the negotiated parameters to every track.
    pub(crate) fn set_rtp_parameters(&self, params: RTCRtpParameters) {
        for t in self.tracks() {
            if let Some(codec) = params.codecs.first() {
                t.set_codec(codec.clone());
            }
            t.set_params(params.clone());
        }
    }

    /// receive initialize the track and starts all the transports. Tracks
    /// with a known SSRC get their read stream right away; simulcast tracks
    /// announced by rid only are completed by `receive_for_rid`.
    pub async fn receive(&self, parameters: &RTCRtpReceiveParameters) -> Result<()> {
        if self.has_stopped() {
            return Err(Error::ErrClosedPipe);
        }
        if self.received_tx.send_replace(true) {
            return Err(Error::ErrRTPReceiverReceiveAlreadyCalled);
        }

        let mut tracks = vec![];
        for encoding in &parameters.encodings {
            let track = Arc::new(TrackRemote::new(
                self.kind,
                encoding.ssrc,
                encoding.rid.clone(),
                self.receive_mtu,
                Arc::clone(&self.media_engine),
            ));

            if encoding.ssrc != 0 {
                let session = self
                    .transport
                    .srtp_ready()
                    .await
                    .ok_or(Error::ErrClosedPipe)?;
                let stream = session.open_read_stream(encoding.ssrc).await?;
                track.set_stream(stream);
            }

            tracks.push(track);
        }

        *self.lock() = tracks;

        Ok(())
    }

    /// receive_for_rid is the sibling of receive except for an RTP stream
    /// that only becomes known by its rid, once simulcast probing found it.
    pub(crate) fn receive_for_rid(
        &self,
        rid: &str,
        params: RTCRtpParameters,
        stream: Arc<dyn RtpReadStream>,
    ) -> Result<Arc<TrackRemote>> {
        let track = self
            .lock()
            .iter()
            .find(|t| t.rid() == rid)
            .cloned()
            .ok_or(Error::ErrRTPReceiverForRIDTrackStreamNotFound)?;

        if let Some(codec) = params.codecs.first() {
            track.set_codec(codec.clone());
        }
        track.set_params(params);
        track.set_stream(stream);

        Ok(track)
    }

    /// receive_rtx_for_rid binds a retransmission stream to the track it
    /// repairs, found by the rid the repaired-rid header extension names.
    pub(crate) fn receive_rtx_for_rid(
        &self,
        rid: &str,
        stream: Arc<dyn RtpReadStream>,
    ) -> Result<Arc<TrackRemote>> {
        let track = self
            .lock()
            .iter()
            .find(|t| t.rid() == rid)
            .cloned()
            .ok_or(Error::ErrRTPReceiverForRIDTrackStreamNotFound)?;
        track.set_repair_stream(stream);

        Ok(track)
    }

    /// track_for_ssrc finds the track announced with `ssrc`.
    pub(crate) fn track_for_ssrc(&self, ssrc: u32) -> Option<Arc<TrackRemote>> {
        self.lock().iter().find(|t| t.ssrc() == ssrc).cloned()
    }

    pub(crate) fn has_stopped(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// stop irreversibly stops the RTPReceiver
    pub async fn stop(&self) -> Result<()> {
        if self.closed_tx.send_replace(true) {
            return Ok(());
        }

        let mut errs = vec![];
        for track in self.tracks() {
            for stream in [track.take_stream(), track.take_repair_stream()]
                .into_iter()
                .flatten()
            {
                if let Err(err) = stream.close().await {
                    errs.push(err);
                }
            }
        }

        flatten_errs(errs)
    }
}
