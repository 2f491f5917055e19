//! End to end offer/answer between two connections over the in-process
//! virtual network.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use rtc_signaling::data_channel::message::RTCDataChannelMessage;
use rtc_signaling::media_stream::track_local::TrackLocal;
use rtc_signaling::media_stream::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use rtc_signaling::peer_connection::RTCPeerConnection;
use rtc_signaling::peer_connection::configuration::media_engine::{
    MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine,
};
use rtc_signaling::peer_connection::configuration::setting_engine::SettingEngine;
use rtc_signaling::peer_connection::state::{RTCPeerConnectionState, RTCSignalingState};
use rtc_signaling::peer_connection::transport::vnet::VNet;
use rtc_signaling::rtp;
use rtc_signaling::rtp_transceiver::direction::RTCRtpTransceiverDirection;
use rtc_signaling::rtp_transceiver::rtp_codec::{RTCRtpCodec, RTCRtpCodecParameters, RtpCodecKind};
use tokio::sync::mpsc;
use tokio::time::timeout;

use common::*;

const TIMEOUT: Duration = Duration::from_secs(10);

fn watch_connected(pc: &Arc<RTCPeerConnection>) -> mpsc::UnboundedReceiver<RTCPeerConnectionState> {
    let (tx, rx) = mpsc::unbounded_channel();
    pc.on_peer_connection_state_change(Arc::new(move |state| {
        let _ = tx.send(state);
    }));
    rx
}

async fn wait_connected(rx: &mut mpsc::UnboundedReceiver<RTCPeerConnectionState>) -> Result<()> {
    timeout(TIMEOUT, async {
        while let Some(state) = rx.recv().await {
            log::debug!("peer connection state: {state}");
            if state == RTCPeerConnectionState::Connected {
                return Ok(());
            }
            if state == RTCPeerConnectionState::Failed {
                anyhow::bail!("peer connection failed");
            }
        }
        anyhow::bail!("state channel closed")
    })
    .await?
}

#[tokio::test]
async fn test_data_channel_ordered_delivery() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init()
        .ok();

    let (offerer, answerer) = new_pair().await?;
    let mut offerer_states = watch_connected(&offerer);
    let mut answerer_states = watch_connected(&answerer);

    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<RTCDataChannelMessage>();
    let (label_tx, mut label_rx) = mpsc::unbounded_channel::<String>();
    answerer.on_data_channel(Arc::new(move |dc| {
        let _ = label_tx.send(dc.label().to_owned());
        let msg_tx = msg_tx.clone();
        dc.on_message(Arc::new(move |msg| {
            let _ = msg_tx.send(msg);
        }));
    }));

    let dc = offerer.create_data_channel("chat", None).await?;
    let (open_tx, mut open_rx) = mpsc::unbounded_channel::<()>();
    dc.on_open(Arc::new(move || {
        let _ = open_tx.send(());
    }));

    signal_pair(&offerer, &answerer).await?;
    let offer = offerer
        .current_local_description()
        .await
        .context("no local description")?;
    assert!(offer.sdp.contains("m=application"));

    wait_connected(&mut offerer_states).await?;
    wait_connected(&mut answerer_states).await?;
    timeout(TIMEOUT, open_rx.recv())
        .await?
        .context("data channel never opened")?;

    for i in 0..20 {
        dc.send_text(format!("message {i}")).await?;
    }
    dc.send(&Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef])).await?;

    let label = timeout(TIMEOUT, label_rx.recv())
        .await?
        .context("no remote data channel")?;
    assert_eq!(label, "chat");

    for i in 0..20 {
        let msg = timeout(TIMEOUT, msg_rx.recv())
            .await?
            .context("message channel closed")?;
        assert!(msg.is_string);
        assert_eq!(msg.data, Bytes::from(format!("message {i}")));
    }
    let msg = timeout(TIMEOUT, msg_rx.recv())
        .await?
        .context("message channel closed")?;
    assert!(!msg.is_string);
    assert_eq!(&msg.data[..], &[0xde, 0xad, 0xbe, 0xef]);

    close_pair(&offerer, &answerer).await
}

#[tokio::test]
async fn test_remote_track_binding() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init()
        .ok();

    let (offerer, answerer) = new_pair().await?;
    let mut offerer_states = watch_connected(&offerer);

    let track = Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodec {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
        "video".to_owned(),
        "webrtc-rs".to_owned(),
    ));
    let sender = offerer
        .add_track(Arc::clone(&track) as Arc<dyn TrackLocal>)
        .await?;

    let (track_tx, mut track_rx) = mpsc::unbounded_channel();
    answerer.on_track(Arc::new(move |event| {
        let _ = track_tx.send(event);
    }));

    signal_pair(&offerer, &answerer).await?;
    wait_connected(&mut offerer_states).await?;

    let transceivers = offerer.get_transceivers();
    assert_eq!(transceivers.len(), 1);
    // the answerer has nothing to send, so it answers recvonly
    assert_eq!(
        transceivers[0].current_direction(),
        RTCRtpTransceiverDirection::Sendonly
    );
    assert_eq!(track.binding_count(), 1);

    // keep writing until the remote side surfaces the track
    let writer = {
        let track = Arc::clone(&track);
        tokio::spawn(async move {
            for sequence_number in 0u16.. {
                let packet = rtp::packet::Packet {
                    header: rtp::header::Header {
                        version: 2,
                        sequence_number,
                        timestamp: u32::from(sequence_number) * 3000,
                        ..Default::default()
                    },
                    payload: Bytes::from_static(&[0x10, 0x02, 0x03]),
                };
                if track.write_rtp(&packet).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
    };

    let event = timeout(TIMEOUT, track_rx.recv())
        .await?
        .context("no track event")?;
    assert_eq!(event.track.kind(), RtpCodecKind::Video);
    assert_eq!(event.track.id(), "video");
    assert_eq!(event.track.stream_id(), "webrtc-rs");
    assert_eq!(event.track.ssrc(), sender.ssrc());
    assert_eq!(event.transceiver.mid(), transceivers[0].mid());

    let packet = timeout(TIMEOUT, event.track.read_rtp()).await??;
    assert_eq!(&packet.payload[..], &[0x10, 0x02, 0x03]);

    writer.abort();
    close_pair(&offerer, &answerer).await
}

fn opus() -> RTCRtpCodec {
    RTCRtpCodec {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
        rtcp_feedback: vec![],
    }
}

/// media_section returns the lines of the first `m=<kind>` section.
fn media_section<'a>(sdp: &'a str, kind: &str) -> Option<&'a str> {
    let start = sdp.find(&format!("m={kind} "))?;
    let rest = &sdp[start..];
    let end = rest[2..].find("\r\nm=").map_or(rest.len(), |i| i + 2);
    Some(&rest[..end])
}

#[tokio::test]
async fn test_answer_rejecting_section_for_missing_codec() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init()
        .ok();

    let vnet = Arc::new(VNet::new());
    let offerer = new_peer_connection(&vnet).await?;

    let mut audio_only = MediaEngine::default();
    audio_only.register_codec(
        RTCRtpCodecParameters {
            rtp_codec: opus(),
            payload_type: 111,
        },
        RtpCodecKind::Audio,
    )?;
    let answerer = new_peer_connection_with(&vnet, SettingEngine::default(), audio_only).await?;
    let mut offerer_states = watch_connected(&offerer);

    for (codec, id) in [
        (opus(), "audio"),
        (
            RTCRtpCodec {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            "video",
        ),
    ] {
        let track = Arc::new(TrackLocalStaticRTP::new(
            codec,
            id.to_owned(),
            "webrtc-rs".to_owned(),
        ));
        offerer.add_track(track as Arc<dyn TrackLocal>).await?;
    }

    // the answer rejects video, yet it applies and the transports start
    signal_pair(&offerer, &answerer).await?;
    assert_eq!(offerer.signaling_state(), RTCSignalingState::Stable);
    wait_connected(&mut offerer_states).await?;

    let answer = answerer
        .current_local_description()
        .await
        .context("answerer has no local description")?;
    let rejected = media_section(&answer.sdp, "video").context("no video section")?;
    assert!(rejected.starts_with("m=video 0 "));
    assert!(rejected.contains("a=mid:"));

    // the rejected section keeps its mid, so renegotiation is not stale forever
    let offer = answerer.create_offer(None).await?;
    let rejected = media_section(&offer.sdp, "video").context("no video section")?;
    assert!(rejected.starts_with("m=video 0 "));
    answerer.set_local_description(offer).await?;
    assert_eq!(answerer.signaling_state(), RTCSignalingState::HaveLocalOffer);

    close_pair(&offerer, &answerer).await
}
