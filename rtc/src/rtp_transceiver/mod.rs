use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::trace;
use sdp::description::media::MediaDescription;

use shared::error::{Error, Result, flatten_errs};

use crate::media_stream::track_local::TrackLocal;
use crate::peer_connection::configuration::media_engine::{MIME_TYPE_RTX, MediaEngine};
use crate::peer_connection::sdp::codecs_from_media_description;
use crate::rtp_transceiver::direction::RTCRtpTransceiverDirection;
use crate::rtp_transceiver::rtp_codec::{
    CodecMatch, Fmtp, RTCRtpCodecParameters, RtpCodecKind, codec_parameters_fuzzy_search,
    find_rtx_payload_type,
};
use crate::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use crate::rtp_transceiver::rtp_sender::RTCRtpSender;

pub mod direction;
pub mod rtp_codec;
pub mod rtp_parameters;
pub mod rtp_receiver;
pub mod rtp_sender;

/// SSRC represents a synchronization source
/// A synchronization source is a randomly chosen
/// value meant to be globally unique within a particular
/// RTP session. Used to identify a single stream of media.
/// <https://tools.ietf.org/html/rfc3550#section-3>
#[allow(clippy::upper_case_acronyms)]
pub type SSRC = u32;

/// PayloadType identifies the format of the RTP payload and determines
/// its interpretation by the application. Each codec in a RTP Session
/// will have a different payload_type
/// <https://tools.ietf.org/html/rfc3550#section-3>
pub type PayloadType = u8;

/// RtpStreamId is the `rid` naming one encoding of a simulcast track.
/// <https://tools.ietf.org/html/rfc8852>
pub type RtpStreamId = String;

pub(crate) type TriggerNegotiationNeededFn = Arc<dyn Fn() + Send + Sync>;

/// RTPTransceiverInit dictionary is used when calling the WebRTC function addTransceiver() to provide configuration options for the new transceiver.
#[derive(Default, Debug, Clone, Copy)]
pub struct RTCRtpTransceiverInit {
    pub direction: RTCRtpTransceiverDirection,
}

#[derive(Default)]
struct TransceiverInternal {
    mid: Option<String>,
    sender: Option<Arc<RTCRtpSender>>,
    receiver: Option<Arc<RTCRtpReceiver>>,
    direction: RTCRtpTransceiverDirection,
    current_direction: RTCRtpTransceiverDirection,
    codecs: Vec<RTCRtpCodecParameters>,
    stopped: bool,
}

/// RTPTransceiver represents a combination of an RTPSender and an RTPReceiver that share a common mid.
pub struct RTCRtpTransceiver {
    kind: RtpCodecKind,
    media_engine: Arc<Mutex<MediaEngine>>,
    internal: Mutex<TransceiverInternal>,
    trigger_negotiation_needed: Mutex<Option<TriggerNegotiationNeededFn>>,
}

impl fmt::Debug for RTCRtpTransceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let internal = self.lock();
        f.debug_struct("RTCRtpTransceiver")
            .field("mid", &internal.mid)
            .field("kind", &self.kind)
            .field("direction", &internal.direction)
            .field("current_direction", &internal.current_direction)
            .field("stopped", &internal.stopped)
            .finish()
    }
}

impl RTCRtpTransceiver {
    pub(crate) fn new(
        receiver: Option<Arc<RTCRtpReceiver>>,
        sender: Option<Arc<RTCRtpSender>>,
        direction: RTCRtpTransceiverDirection,
        kind: RtpCodecKind,
        codecs: Vec<RTCRtpCodecParameters>,
        media_engine: Arc<Mutex<MediaEngine>>,
        trigger_negotiation_needed: Option<TriggerNegotiationNeededFn>,
    ) -> Arc<Self> {
        Arc::new(RTCRtpTransceiver {
            kind,
            media_engine,
            internal: Mutex::new(TransceiverInternal {
                sender,
                receiver,
                direction,
                codecs,
                ..Default::default()
            }),
            trigger_negotiation_needed: Mutex::new(trigger_negotiation_needed),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TransceiverInternal> {
        self.internal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn trigger_negotiation_needed(&self) {
        let trigger = self
            .trigger_negotiation_needed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(f) = trigger {
            f();
        }
    }

    /// set_codec_preferences sets preferred list of supported codecs
    /// if codecs is empty or nil we reset to default from MediaEngine
    pub fn set_codec_preferences(&self, codecs: Vec<RTCRtpCodecParameters>) -> Result<()> {
        let media_engine_codecs = self
            .media_engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_codecs_by_kind(self.kind);
        for codec in &codecs {
            let (_, match_type) = codec_parameters_fuzzy_search(&codec.rtp_codec, &media_engine_codecs);
            if match_type == CodecMatch::None {
                return Err(Error::ErrRTPTransceiverCodecUnsupported);
            }
        }

        self.lock().codecs = codecs;
        Ok(())
    }

    /// get_codecs returns list of supported codecs: the preferred ones
    /// still supported by the media engine, or every codec of the kind.
    pub(crate) fn get_codecs(&self) -> Vec<RTCRtpCodecParameters> {
        let media_engine_codecs = self
            .media_engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_codecs_by_kind(self.kind);
        let preferred = self.lock().codecs.clone();
        if preferred.is_empty() {
            return media_engine_codecs;
        }

        preferred
            .into_iter()
            .filter_map(|mut codec| {
                let (c, match_type) =
                    codec_parameters_fuzzy_search(&codec.rtp_codec, &media_engine_codecs);
                if match_type == CodecMatch::None {
                    return None;
                }
                if codec.payload_type == 0 {
                    codec.payload_type = c.payload_type;
                }
                Some(codec)
            })
            .collect()
    }

    /// sender returns the RTPTransceiver's RTPSender if it has one
    pub fn sender(&self) -> Option<Arc<RTCRtpSender>> {
        self.lock().sender.clone()
    }

    /// set_sender sets the RTPSender and Track to current transceiver
    pub(crate) fn set_sender(&self, sender: Option<Arc<RTCRtpSender>>) {
        let mut internal = self.lock();
        if let (Some(s), Some(mid)) = (&sender, &internal.mid) {
            s.set_mid(mid.clone());
        }
        internal.sender = sender;
    }

    /// receiver returns the RTPTransceiver's RTPReceiver if it has one
    pub fn receiver(&self) -> Option<Arc<RTCRtpReceiver>> {
        self.lock().receiver.clone()
    }

    pub(crate) fn set_receiver(&self, receiver: Option<Arc<RTCRtpReceiver>>) {
        self.lock().receiver = receiver;
    }

    /// set_mid sets the RTPTransceiver's mid. If it was already set, will return an error.
    pub(crate) fn set_mid(&self, mid: String) -> Result<()> {
        let mut internal = self.lock();
        if internal.mid.is_some() {
            return Err(Error::ErrRTPTransceiverCannotChangeMid);
        }
        if let Some(sender) = &internal.sender {
            sender.set_mid(mid.clone());
        }
        internal.mid = Some(mid);
        Ok(())
    }

    /// mid gets the Transceiver's mid value. When not already set, this value will be set in CreateOffer or create_answer.
    pub fn mid(&self) -> Option<String> {
        self.lock().mid.clone()
    }

    /// kind returns RTPTransceiver's kind.
    pub fn kind(&self) -> RtpCodecKind {
        self.kind
    }

    /// direction returns the RTPTransceiver's desired direction.
    pub fn direction(&self) -> RTCRtpTransceiverDirection {
        self.lock().direction
    }

    /// set_direction sets the desired direction. A change triggers
    /// negotiation-needed on the owning connection.
    pub fn set_direction(&self, d: RTCRtpTransceiverDirection) {
        let changed = self.set_direction_internal(d);
        if changed {
            self.trigger_negotiation_needed();
        }
    }

    pub(crate) fn set_direction_internal(&self, d: RTCRtpTransceiverDirection) -> bool {
        let previous = {
            let mut internal = self.lock();
            std::mem::replace(&mut internal.direction, d)
        };
        if d != previous {
            trace!("Changing direction of transceiver from {previous} to {d}");
        }
        d != previous
    }

    /// current_direction returns the RTPTransceiver's current direction as negotiated.
    ///
    /// If this transceiver has never been negotiated or if it's stopped this returns [`RTCRtpTransceiverDirection::Unspecified`].
    pub fn current_direction(&self) -> RTCRtpTransceiverDirection {
        let internal = self.lock();
        if internal.stopped {
            return RTCRtpTransceiverDirection::Unspecified;
        }
        internal.current_direction
    }

    pub(crate) fn set_current_direction(&self, d: RTCRtpTransceiverDirection) {
        let previous = std::mem::replace(&mut self.lock().current_direction, d);
        if d != previous {
            trace!("Changing current direction of transceiver from {previous} to {d}");
        }
    }

    /// stop irreversibly stops the RTPTransceiver
    pub async fn stop(&self) -> Result<()> {
        let (sender, receiver) = {
            let mut internal = self.lock();
            if internal.stopped {
                return Ok(());
            }
            internal.stopped = true;
            (internal.sender.clone(), internal.receiver.clone())
        };

        let mut errs = vec![];
        if let Some(sender) = sender {
            if let Err(err) = sender.stop().await {
                errs.push(err);
            }
        }
        if let Some(receiver) = receiver {
            if let Err(err) = receiver.stop().await {
                errs.push(err);
            }
        }

        self.set_direction_internal(RTCRtpTransceiverDirection::Inactive);
        self.trigger_negotiation_needed();

        flatten_errs(errs)
    }

    pub(crate) fn stopped(&self) -> bool {
        self.lock().stopped
    }

    /// set_sending_track swaps the track of the sender and adjusts the
    /// direction so that the transceiver sends exactly when a track is set.
    pub(crate) async fn set_sending_track(&self, track: Option<Arc<dyn TrackLocal>>) -> Result<()> {
        if let Some(sender) = self.sender() {
            sender.replace_track(track.clone()).await?;
        }
        if track.is_none() {
            self.set_sender(None);
        }

        use RTCRtpTransceiverDirection::*;
        let direction = self.direction();
        let new_direction = match (track.is_some(), direction) {
            (true, Recvonly) => Sendrecv,
            (true, Inactive) => Sendonly,
            (false, Sendrecv) => Recvonly,
            (true, Sendonly) | (true, Sendrecv) => direction,
            (false, Sendonly) => Inactive,
            _ => return Err(Error::ErrRTPTransceiverSetSendingInvalidState),
        };

        if self.set_direction_internal(new_direction) {
            self.trigger_negotiation_needed();
        }
        Ok(())
    }

    /// set_codec_preferences_from_remote_description matches the codecs of a
    /// remote media section against the media engine, keeping the remote
    /// order and the payload types registered locally.
    pub(crate) fn set_codec_preferences_from_remote_description(
        &self,
        media: &MediaDescription,
    ) -> Result<()> {
        let mut remote_codecs = codecs_from_media_description(media)?;

        // make a copy as this slice is modified
        let mut left_codecs = self
            .media_engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_codecs_by_kind(self.kind);

        // find codec matches between what is in remote description and
        // the transceivers codecs and use payload type registered to
        // media engine.
        let mut payload_mapping = HashMap::new(); // for RTX re-mapping later
        let mut filter_by_match = |match_filter: CodecMatch| -> Vec<RTCRtpCodecParameters> {
            let mut filtered_codecs = vec![];
            for remote_codec_idx in (0..remote_codecs.len()).rev() {
                let remote_codec = &mut remote_codecs[remote_codec_idx];
                if remote_codec.rtp_codec.mime_type.eq_ignore_ascii_case(MIME_TYPE_RTX) {
                    continue;
                }

                let (match_codec, match_type) =
                    codec_parameters_fuzzy_search(&remote_codec.rtp_codec, &left_codecs);
                if match_type != match_filter {
                    continue;
                }

                payload_mapping.insert(remote_codec.payload_type, match_codec.payload_type);
                remote_codec.payload_type = match_codec.payload_type;
                filtered_codecs.push(remote_codec.clone());

                // removed matched codec for next round
                remote_codecs.remove(remote_codec_idx);

                let needle_fmtp = Fmtp::parse(
                    &match_codec.rtp_codec.mime_type,
                    &match_codec.rtp_codec.sdp_fmtp_line,
                );
                if let Some(left_codec_idx) = left_codecs.iter().rposition(|left_codec| {
                    needle_fmtp.match_fmtp(&Fmtp::parse(
                        &left_codec.rtp_codec.mime_type,
                        &left_codec.rtp_codec.sdp_fmtp_line,
                    ))
                }) {
                    left_codecs.remove(left_codec_idx);
                }
            }

            filtered_codecs
        };

        let mut filtered_codecs = filter_by_match(CodecMatch::Exact);
        filtered_codecs.append(&mut filter_by_match(CodecMatch::Partial));

        // find RTX associations and add those
        for (remote_payload_type, media_engine_payload_type) in payload_mapping {
            if find_rtx_payload_type(remote_payload_type, &remote_codecs).is_none() {
                continue;
            }

            if let Some(media_engine_rtx) =
                find_rtx_payload_type(media_engine_payload_type, &left_codecs)
            {
                if let Some(rtx_codec) = left_codecs
                    .iter()
                    .find(|c| c.payload_type == media_engine_rtx)
                {
                    filtered_codecs.push(rtx_codec.clone());
                }
            }
        }

        self.set_codec_preferences(filtered_codecs)
    }
}

pub(crate) fn find_by_mid(
    mid: &str,
    local_transceivers: &[Arc<RTCRtpTransceiver>],
) -> Option<Arc<RTCRtpTransceiver>> {
    local_transceivers
        .iter()
        .find(|t| t.mid().as_deref() == Some(mid))
        .cloned()
}

/// Given a direction+type pluck a transceiver from the passed list
/// if no entry satisfies the requested type+direction return a inactive Transceiver
pub(crate) fn satisfy_type_and_direction(
    remote_kind: RtpCodecKind,
    remote_direction: RTCRtpTransceiverDirection,
    local_transceivers: &[Arc<RTCRtpTransceiver>],
) -> Option<Arc<RTCRtpTransceiver>> {
    // Get direction order from most preferred to least
    let preferred_directions = match remote_direction {
        RTCRtpTransceiverDirection::Sendrecv => vec![
            RTCRtpTransceiverDirection::Recvonly,
            RTCRtpTransceiverDirection::Sendrecv,
        ],
        RTCRtpTransceiverDirection::Sendonly => vec![RTCRtpTransceiverDirection::Recvonly],
        RTCRtpTransceiverDirection::Recvonly => vec![
            RTCRtpTransceiverDirection::Sendonly,
            RTCRtpTransceiverDirection::Sendrecv,
        ],
        _ => vec![],
    };

    for possible_direction in preferred_directions {
        if let Some(t) = local_transceivers.iter().find(|t| {
            t.mid().is_none()
                && t.kind() == remote_kind
                && !t.stopped()
                && possible_direction == t.direction()
        }) {
            return Some(Arc::clone(t));
        }
    }

    None
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::peer_connection::configuration::media_engine::MIME_TYPE_VP8;
    use crate::rtp_transceiver::rtp_codec::RTCRtpCodec;

    fn media_engine() -> Result<Arc<Mutex<MediaEngine>>> {
        let mut m = MediaEngine::default();
        m.register_default_codecs()?;
        Ok(Arc::new(Mutex::new(m)))
    }

    fn transceiver(
        kind: RtpCodecKind,
        direction: RTCRtpTransceiverDirection,
        counter: Option<Arc<AtomicUsize>>,
    ) -> Result<Arc<RTCRtpTransceiver>> {
        let trigger = counter.map(|c| {
            Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }) as TriggerNegotiationNeededFn
        });
        Ok(RTCRtpTransceiver::new(
            None,
            None,
            direction,
            kind,
            vec![],
            media_engine()?,
            trigger,
        ))
    }

    #[test]
    fn test_rtp_transceiver_set_mid_once() -> Result<()> {
        let t = transceiver(RtpCodecKind::Audio, RTCRtpTransceiverDirection::Recvonly, None)?;
        assert_eq!(t.mid(), None);
        t.set_mid("0".to_owned())?;
        assert_eq!(t.mid(), Some("0".to_owned()));
        assert_eq!(t.set_mid("1".to_owned()), Err(Error::ErrRTPTransceiverCannotChangeMid));
        Ok(())
    }

    #[tokio::test]
    async fn test_rtp_transceiver_direction_triggers_negotiation() -> Result<()> {
        let counter = Arc::new(AtomicUsize::new(0));
        let t = transceiver(
            RtpCodecKind::Video,
            RTCRtpTransceiverDirection::Sendrecv,
            Some(Arc::clone(&counter)),
        )?;

        t.set_direction(RTCRtpTransceiverDirection::Sendrecv);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        t.set_direction(RTCRtpTransceiverDirection::Recvonly);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        t.set_current_direction(RTCRtpTransceiverDirection::Recvonly);
        assert_eq!(t.current_direction(), RTCRtpTransceiverDirection::Recvonly);

        t.stop().await?;
        assert!(t.stopped());
        assert_eq!(t.direction(), RTCRtpTransceiverDirection::Inactive);
        assert_eq!(t.current_direction(), RTCRtpTransceiverDirection::Unspecified);
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        // stop is terminal and idempotent
        t.stop().await?;
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        Ok(())
    }

    #[test]
    fn test_rtp_transceiver_codec_preferences() -> Result<()> {
        let t = transceiver(RtpCodecKind::Video, RTCRtpTransceiverDirection::Sendrecv, None)?;
        let all = t.get_codecs();
        assert!(all.len() > 1);

        let vp8 = RTCRtpCodecParameters {
            rtp_codec: RTCRtpCodec {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            payload_type: 96,
        };
        t.set_codec_preferences(vec![vp8.clone()])?;
        assert_eq!(t.get_codecs(), vec![vp8]);

        let unknown = RTCRtpCodecParameters {
            rtp_codec: RTCRtpCodec {
                mime_type: "video/unknown".to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            payload_type: 120,
        };
        assert_eq!(
            t.set_codec_preferences(vec![unknown]),
            Err(Error::ErrRTPTransceiverCodecUnsupported)
        );

        t.set_codec_preferences(vec![])?;
        assert_eq!(t.get_codecs(), all);

        Ok(())
    }

    #[test]
    fn test_satisfy_type_and_direction() -> Result<()> {
        let audio_sendrecv =
            transceiver(RtpCodecKind::Audio, RTCRtpTransceiverDirection::Sendrecv, None)?;
        let video_recvonly =
            transceiver(RtpCodecKind::Video, RTCRtpTransceiverDirection::Recvonly, None)?;
        let video_sendrecv =
            transceiver(RtpCodecKind::Video, RTCRtpTransceiverDirection::Sendrecv, None)?;
        let local = vec![
            Arc::clone(&audio_sendrecv),
            Arc::clone(&video_sendrecv),
            Arc::clone(&video_recvonly),
        ];

        // a sending remote prefers a local receiver
        let t = satisfy_type_and_direction(
            RtpCodecKind::Video,
            RTCRtpTransceiverDirection::Sendrecv,
            &local,
        );
        assert!(t.is_some_and(|t| Arc::ptr_eq(&t, &video_recvonly)));

        let t = satisfy_type_and_direction(
            RtpCodecKind::Video,
            RTCRtpTransceiverDirection::Recvonly,
            &local,
        );
        assert!(t.is_some_and(|t| Arc::ptr_eq(&t, &video_sendrecv)));

        assert!(
            satisfy_type_and_direction(
                RtpCodecKind::Audio,
                RTCRtpTransceiverDirection::Sendonly,
                &local
            )
            .is_none()
        );

        // assigned mids are never matched again
        audio_sendrecv.set_mid("0".to_owned())?;
        assert!(
            satisfy_type_and_direction(
                RtpCodecKind::Audio,
                RTCRtpTransceiverDirection::Recvonly,
                &local
            )
            .is_none()
        );
        assert!(find_by_mid("0", &local).is_some_and(|t| Arc::ptr_eq(&t, &audio_sendrecv)));

        Ok(())
    }
}
