//! Signaling state machine tests between two connections sharing a virtual
//! network.

mod common;

use std::sync::Arc;

use anyhow::Result;
use rtc_signaling::peer_connection::sdp::RTCSessionDescription;
use rtc_signaling::peer_connection::state::{RTCPeerConnectionState, RTCSignalingState};
use rtc_signaling::peer_connection::transport::vnet::VNet;
use rtc_signaling::rtp_transceiver::RTCRtpTransceiverInit;
use rtc_signaling::rtp_transceiver::direction::RTCRtpTransceiverDirection;
use rtc_signaling::rtp_transceiver::rtp_codec::RtpCodecKind;
use rtc_signaling::shared::error::Error;

use common::*;

#[tokio::test]
async fn test_close_is_idempotent() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init()
        .ok();

    let (offerer, answerer) = new_pair().await?;
    offerer
        .add_transceiver_from_kind(RtpCodecKind::Video, None)
        .await?;
    offerer.create_data_channel("data", None).await?;

    offerer.close().await?;
    assert_eq!(offerer.connection_state(), RTCPeerConnectionState::Closed);
    assert_eq!(offerer.signaling_state(), RTCSignalingState::Closed);

    // a second close neither fails nor changes anything
    offerer.close().await?;
    assert_eq!(offerer.connection_state(), RTCPeerConnectionState::Closed);

    assert_eq!(
        offerer.create_offer(None).await.err(),
        Some(Error::ErrConnectionClosed)
    );
    assert_eq!(
        offerer
            .add_transceiver_from_kind(RtpCodecKind::Audio, None)
            .await
            .err(),
        Some(Error::ErrConnectionClosed)
    );
    assert_eq!(
        offerer.create_data_channel("late", None).await.err(),
        Some(Error::ErrConnectionClosed)
    );

    answerer.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_create_answer_without_remote_offer() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init()
        .ok();

    let (offerer, answerer) = new_pair().await?;

    assert_eq!(
        answerer.create_answer(None).await.err(),
        Some(Error::ErrNoRemoteDescription)
    );

    // the offerer holds only its own offer, which is not a remote offer
    offerer
        .add_transceiver_from_kind(RtpCodecKind::Audio, None)
        .await?;
    let offer = offerer.create_offer(None).await?;
    offerer.set_local_description(offer).await?;
    assert_eq!(
        offerer.create_answer(None).await.err(),
        Some(Error::ErrNoRemoteDescription)
    );

    close_pair(&offerer, &answerer).await
}

fn media_section_count(sdp: &str) -> usize {
    sdp.matches("\r\nm=").count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_offer_reflects_concurrent_transceiver_changes() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init()
        .ok();

    let vnet = Arc::new(VNet::new());
    let pc = new_peer_connection(&vnet).await?;
    let recvonly = || {
        Some(RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
        })
    };
    pc.add_transceiver_from_kind(RtpCodecKind::Audio, recvonly())
        .await?;

    let adder = {
        let pc = Arc::clone(&pc);
        tokio::spawn(async move {
            for _ in 0..8 {
                pc.add_transceiver_from_kind(RtpCodecKind::Video, recvonly())
                    .await?;
                tokio::task::yield_now().await;
            }
            Ok::<_, Error>(())
        })
    };

    // every offer made while transceivers are being added succeeds and
    // describes no transceiver that does not exist
    for _ in 0..8 {
        let offer = pc.create_offer(None).await?;
        assert!(media_section_count(&offer.sdp) <= pc.get_transceivers().len());
    }
    adder.await??;

    let offer = pc.create_offer(None).await?;
    assert_eq!(media_section_count(&offer.sdp), 9);
    assert_eq!(pc.signaling_state(), RTCSignalingState::Stable);

    pc.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_remote_offer_rollback() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init()
        .ok();

    let (offerer, answerer) = new_pair().await?;
    offerer
        .add_transceiver_from_kind(RtpCodecKind::Audio, None)
        .await?;

    let offer = offerer.create_offer(None).await?;
    offerer.set_local_description(offer.clone()).await?;
    assert_eq!(offerer.signaling_state(), RTCSignalingState::HaveLocalOffer);

    answerer.set_remote_description(offer).await?;
    assert_eq!(answerer.signaling_state(), RTCSignalingState::HaveRemoteOffer);
    assert!(answerer.pending_remote_description().is_some());

    answerer
        .set_remote_description(RTCSessionDescription::rollback())
        .await?;
    assert_eq!(answerer.signaling_state(), RTCSignalingState::Stable);
    assert!(answerer.pending_remote_description().is_none());
    assert!(answerer.current_remote_description().is_none());
    assert_eq!(
        answerer.create_answer(None).await.err(),
        Some(Error::ErrNoRemoteDescription)
    );

    offerer
        .set_local_description(RTCSessionDescription::rollback())
        .await?;
    assert_eq!(offerer.signaling_state(), RTCSignalingState::Stable);
    assert!(offerer.pending_local_description().await.is_none());

    close_pair(&offerer, &answerer).await
}

#[tokio::test]
async fn test_answer_reverses_offered_direction() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init()
        .ok();

    let (offerer, answerer) = new_pair().await?;
    let sending = offerer
        .add_transceiver_from_kind(
            RtpCodecKind::Audio,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Sendonly,
            }),
        )
        .await?;
    assert_eq!(
        sending.current_direction(),
        RTCRtpTransceiverDirection::Unspecified
    );

    signal_pair(&offerer, &answerer).await?;
    assert_eq!(offerer.signaling_state(), RTCSignalingState::Stable);
    assert_eq!(answerer.signaling_state(), RTCSignalingState::Stable);

    // the answerer bound the offered section to a receive-only transceiver
    let receiving = answerer.get_transceivers();
    assert_eq!(receiving.len(), 1);
    assert_eq!(receiving[0].kind(), RtpCodecKind::Audio);
    assert_eq!(receiving[0].mid(), sending.mid());
    assert!(receiving[0].sender().is_none());
    assert_eq!(
        receiving[0].current_direction(),
        RTCRtpTransceiverDirection::Recvonly
    );

    let answer = answerer
        .current_local_description()
        .await
        .map(|d| d.sdp)
        .unwrap_or_default();
    assert!(answer.contains("a=recvonly"));

    // the offerer reads the answer from its own side
    assert_eq!(
        sending.current_direction(),
        RTCRtpTransceiverDirection::Sendonly
    );

    close_pair(&offerer, &answerer).await
}
